//! Interrupt top half and the deferred bottom half

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};

use crate::bus::SpcPort;
use crate::spc::SpcHost;
use crate::spc::regs::{SpcInts, SpcReg, SpcSctl};
use crate::spc::state::SpcState;

/// Item on the work queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Work {
    /// Run the bottom half
    Service,
    /// Stop the worker thread
    Shutdown,
}

impl<P: SpcPort> SpcHost<P> {
    /// Interrupt handler (top half). Masks the chip interrupt, captures and
    /// acknowledges the interrupt status and schedules the bottom half.
    ///
    /// Always reports the interrupt as handled.
    pub fn interrupt(&self) -> bool {
        let mut data = self.data();
        self.port
            .clear_bits(SpcReg::SCTL, SpcSctl::default().with_int_enable(true).into());

        if !data.service.peek() {
            data.service.set();
            let ints = self.port.read(SpcReg::INTS);
            data.ints = SpcInts(ints);
            self.port.write(SpcReg::INTS, ints);

            if self.work_tx.send(Work::Service).is_err() {
                log::error!("Work queue closed, interrupt lost");
            }
        }
        true
    }

    /// Bottom half: runs the phase state machine until the bus is free or
    /// a selection timed out, then unmasks the chip interrupt.
    pub fn bottom_half(&self) {
        {
            let mut data = self.data();
            if !data.service.get_clear() {
                return;
            }
            if data.in_bh {
                drop(data);
                self.spc_error(None, "bottom-half already running!?");
            }
            data.in_bh = true;
        }

        let finished = {
            let mut engine = self.engine();
            engine.ints = self.data().ints;

            loop {
                self.update_state(&mut engine);
                let (prev, state) = (engine.prevstate, engine.state);

                if prev != state {
                    self.state_end(&mut engine, prev);
                    self.state_init(&mut engine, state);
                }

                if !self.state_run(&mut engine, state) {
                    match &engine.current {
                        Some(cur) => log::error!("Command {}: unexpected state ({})", cur.id(), state),
                        None => log::error!("Unexpected state ({})", state),
                    }
                    break;
                }

                if matches!(state, SpcState::BusFree | SpcState::SelTo) {
                    break;
                }

                let ints = self.port.read(SpcReg::INTS);
                engine.ints = SpcInts(ints);
                self.port.write(SpcReg::INTS, ints);
            }
            std::mem::take(&mut engine.completions)
        };

        let sctl = {
            let mut data = self.data();
            data.in_bh = false;
            data.sctl
        };
        self.port.write(SpcReg::SCTL, sctl.with_int_enable(true).into());

        // Callbacks may call back into the host
        Self::dispatch(finished);

        // Commands queued while the state machine was busy
        if !self.data().issue.is_empty() {
            self.kick();
        }
    }

    /// Runs queued bottom halves on the calling thread, returns how many ran.
    pub fn run_pending_work(&self) -> usize {
        let mut ran = 0;
        while let Ok(work) = self.work_rx.try_recv() {
            match work {
                Work::Service => {
                    self.bottom_half();
                    ran += 1;
                }
                Work::Shutdown => {
                    // Meant for a worker thread, leave it
                    let _ = self.work_tx.send(Work::Shutdown);
                    break;
                }
            }
        }
        ran
    }

    /// Stops a worker started by [SpcHost::spawn_worker]
    pub fn shutdown_worker(&self) {
        if self.work_tx.send(Work::Shutdown).is_err() {
            log::warn!("Work queue already closed");
        }
    }
}

impl<P: SpcPort + 'static> SpcHost<P> {
    /// Runs bottom halves on a dedicated thread as they get scheduled.
    pub fn spawn_worker(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let host = Arc::clone(self);
        std::thread::Builder::new()
            .name("spc-bh".to_string())
            .spawn(move || {
                while let Ok(work) = host.work_rx.recv() {
                    match work {
                        Work::Service => host.bottom_half(),
                        Work::Shutdown => break,
                    }
                }
                log::debug!("SPC worker stopped");
            })
            .context("Spawning SPC worker")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testbus::{Access, TraceEntry, Testbus};
    use crate::spc::SpcPlatformData;

    fn host() -> SpcHost<Testbus> {
        SpcHost::probe(Testbus::new(), SpcPlatformData::default()).unwrap()
    }

    #[test]
    fn top_half_captures_once() {
        let host = host();
        host.port().poke(SpcReg::SCTL, 0x05);
        host.port().poke(SpcReg::INTS, 0x10);
        host.port().reset_trace();

        assert!(host.interrupt());
        assert_eq!(
            host.port().get_trace(),
            vec![
                TraceEntry {
                    reg: Some(SpcReg::SCTL),
                    access: Access::Read,
                    val: 0x05
                },
                TraceEntry::write(SpcReg::SCTL, 0x04),
                TraceEntry {
                    reg: Some(SpcReg::INTS),
                    access: Access::Read,
                    val: 0x10
                },
                TraceEntry::write(SpcReg::INTS, 0x10),
            ]
        );
        assert_eq!(host.data().ints, SpcInts(0x10));

        // Service still pending, status not captured again
        host.port().reset_trace();
        assert!(host.interrupt());
        assert_eq!(host.port().get_writes(), vec![(SpcReg::SCTL, 0x04)]);
    }

    #[test]
    fn bottom_half_without_service() {
        let host = host();
        host.port().reset_trace();
        assert_eq!(host.run_pending_work(), 0);
        host.bottom_half();
        assert!(host.port().get_trace().is_empty());
    }

    #[test]
    fn bottom_half_bus_free() {
        let host = host();
        host.port().poke(SpcReg::INTS, 0x20);
        host.interrupt();
        host.port().poke(SpcReg::INTS, 0);
        host.port().reset_trace();

        assert_eq!(host.run_pending_work(), 1);
        assert_eq!(host.state(), SpcState::BusFree);
        assert!(!host.data().in_bh);
        // Interrupts unmasked on the way out
        assert_eq!(host.port().get_writes().last(), Some(&(SpcReg::SCTL, 0x01)));
    }

    #[test]
    fn unknown_state_ends_bottom_half() {
        let host = host();
        // Phase lines active, but not connected as initiator
        host.port().poke(SpcReg::PSNS, 0x8F);
        host.port().poke(SpcReg::INTS, 0x08);
        host.interrupt();
        assert_eq!(host.run_pending_work(), 1);
        assert_eq!(host.state(), SpcState::Unknown);
    }

    #[test]
    #[should_panic(expected = "bottom-half already running")]
    fn bottom_half_reentry() {
        let host = host();
        {
            let mut data = host.data();
            data.service.set();
            data.in_bh = true;
        }
        host.bottom_half();
    }

    #[test]
    fn worker_thread() {
        let host = Arc::new(host());
        let worker = host.spawn_worker().unwrap();
        host.port().poke(SpcReg::INTS, 0x20);
        host.interrupt();
        host.shutdown_worker();
        worker.join().unwrap();
        assert_eq!(host.state(), SpcState::BusFree);
    }
}
