use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::SpcPort;
use crate::spc::regs::SpcReg;
use crate::types::Byte;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
    Delay,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TraceEntry {
    pub reg: Option<SpcReg>,
    pub access: Access,
    pub val: Byte,
}

impl TraceEntry {
    pub const fn write(reg: SpcReg, val: Byte) -> Self {
        Self {
            reg: Some(reg),
            access: Access::Write,
            val,
        }
    }
}

#[derive(Default)]
struct TestbusInner {
    regs: HashMap<u8, Byte>,
    trace: Vec<TraceEntry>,
    trace_enabled: bool,
    delayed: Duration,
}

/// A plain register file without chip behaviour, for checking register
/// programming sequences.
#[derive(Default)]
pub struct Testbus {
    inner: Mutex<TestbusInner>,
}

impl Testbus {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, TestbusInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sets a register without tracing the access
    pub fn poke(&self, reg: SpcReg, val: Byte) {
        self.inner().regs.insert(reg as u8, val);
    }

    /// Reads a register without tracing the access
    pub fn peek(&self, reg: SpcReg) -> Byte {
        self.inner().regs.get(&(reg as u8)).copied().unwrap_or(0)
    }

    pub fn reset_trace(&self) {
        let mut inner = self.inner();
        inner.trace.clear();
        inner.trace_enabled = true;
    }

    pub fn get_trace(&self) -> Vec<TraceEntry> {
        self.inner().trace.clone()
    }

    /// Writes only, in order
    pub fn get_writes(&self) -> Vec<(SpcReg, Byte)> {
        self.inner()
            .trace
            .iter()
            .filter(|e| e.access == Access::Write)
            .filter_map(|e| Some((e.reg?, e.val)))
            .collect()
    }

    /// Total time passed to [SpcPort::delay]
    pub fn delayed(&self) -> Duration {
        self.inner().delayed
    }
}

impl SpcPort for Testbus {
    fn read(&self, reg: SpcReg) -> Byte {
        let mut inner = self.inner();
        let val = inner.regs.get(&(reg as u8)).copied().unwrap_or(0);
        if inner.trace_enabled {
            inner.trace.push(TraceEntry {
                reg: Some(reg),
                access: Access::Read,
                val,
            });
        }
        val
    }

    fn write(&self, reg: SpcReg, val: Byte) {
        let mut inner = self.inner();
        if inner.trace_enabled {
            inner.trace.push(TraceEntry::write(reg, val));
        }
        inner.regs.insert(reg as u8, val);
    }

    fn delay(&self, duration: Duration) {
        let mut inner = self.inner();
        inner.delayed += duration;
        if inner.trace_enabled {
            inner.trace.push(TraceEntry {
                reg: None,
                access: Access::Delay,
                val: 0,
            });
        }
    }
}
