//! MB89352 (SPC) SCSI host adapter

pub mod intr;
pub mod regs;
pub mod state;

#[cfg(all(test, feature = "sim"))]
mod tests;

use std::collections::TryReserveError;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::SpcPort;
use crate::debuggable::{Debuggable, DebuggableProperties, render};
use crate::scsi::command::{CmdPhase, Command, CommandId};
use crate::scsi::queue::CommandQueue;
use crate::scsi::{HostByte, ScsiResult};
use crate::types::{LatchingEvent, ScsiId};

use intr::Work;
use regs::{SpcInts, SpcReg, SpcScmd, SpcSctl};
use state::{PhaseEngine, SpcState};

/// Highest SCSI ID on a narrow bus
pub const MAX_SCSI_ID: ScsiId = 7;

#[derive(Debug, Error)]
pub enum SpcError {
    #[error("Out of memory queueing command")]
    Alloc(#[from] TryReserveError),
    #[error("CDB of {0} bytes is too long")]
    CdbTooLong(usize),
    #[error("Invalid SCSI ID {0}")]
    InvalidId(ScsiId),
    #[error("Reset of target {0} timed out")]
    ResetTimeout(ScsiId),
}

/// A command refused by [SpcHost::queue_command], handed back to the caller
#[derive(Debug, Error)]
#[error("Command {} not queued: {reason}", .command.id())]
pub struct QueueRejected {
    pub command: Command,
    #[source]
    pub reason: SpcError,
}

/// Outcome of the error handling entry points
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, Serialize, Deserialize)]
pub enum EhResult {
    Success,
    Failed,
}

/// Board configuration handed over at probe time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpcPlatformData {
    /// Initiator SCSI ID
    pub scsi_id: ScsiId,
    /// Enable bus parity checking
    pub parity: bool,
    /// Length of reset pulses, in milliseconds
    pub delay_ms: u64,
    /// Allow targets to disconnect
    pub reconnect: bool,
    /// How long a device reset may take, in milliseconds
    pub reset_timeout_ms: u64,
}

impl Default for SpcPlatformData {
    fn default() -> Self {
        Self {
            scsi_id: 7,
            parity: false,
            delay_ms: 256,
            reconnect: true,
            reset_timeout_ms: 100_000,
        }
    }
}

impl SpcPlatformData {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// State shared between the interrupt top half, the bottom half and the
/// mid-layer entry points. Protected by the host lock.
#[derive(Debug, Default)]
pub(crate) struct HostData {
    pub issue: CommandQueue,
    pub disconnected: CommandQueue,
    /// Commands owned by the adapter
    pub commands: usize,
    /// Bottom half requested
    pub service: LatchingEvent,
    /// Bottom half running
    pub in_bh: bool,
    /// Bus free handling running from the enqueue path
    pub starting: bool,
    /// Interrupt status captured by the top half
    pub ints: SpcInts,
    /// SCTL value restored when leaving the bottom half
    pub sctl: SpcSctl,
}

/// Where a command was taken from, to put it back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueOrigin {
    Issue,
    Disconnected,
}

/// Host adapter for one MB89352 and the SCSI bus behind it
pub struct SpcHost<P: SpcPort> {
    port: P,
    this_id: ScsiId,
    platform: SpcPlatformData,

    /// Host lock
    data: Mutex<HostData>,
    /// Owned by whoever runs the phase state machine
    engine: Mutex<PhaseEngine>,

    work_tx: Sender<Work>,
    work_rx: Receiver<Work>,
}

impl<P: SpcPort> SpcHost<P> {
    /// Binds to a controller: programs the initiator ID and resets the chip.
    pub fn probe(port: P, platform: SpcPlatformData) -> Result<Self> {
        if platform.scsi_id > MAX_SCSI_ID {
            return Err(SpcError::InvalidId(platform.scsi_id)).context("Probing SPC");
        }

        port.write(SpcReg::BDID, platform.scsi_id);

        // Reset out
        port.write(SpcReg::SCTL, SpcSctl::default().with_reset_disable(true).into());
        port.delay(platform.delay());
        port.write(SpcReg::SCTL, 0);
        port.delay(platform.delay());

        log::info!(
            "SPC: scsiid={}, parity={}, reconnect={}",
            platform.scsi_id,
            platform.parity,
            platform.reconnect
        );

        let (work_tx, work_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            port,
            this_id: platform.scsi_id,
            platform,
            data: Mutex::new(HostData::default()),
            engine: Mutex::new(PhaseEngine::default()),
            work_tx,
            work_rx,
        })
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn this_id(&self) -> ScsiId {
        self.this_id
    }

    pub fn platform(&self) -> &SpcPlatformData {
        &self.platform
    }

    pub(crate) fn data(&self) -> MutexGuard<'_, HostData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn engine(&self) -> MutexGuard<'_, PhaseEngine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of commands owned by the adapter
    pub fn outstanding(&self) -> usize {
        self.data().commands
    }

    pub fn issue_len(&self) -> usize {
        self.data().issue.len()
    }

    pub fn disconnected_len(&self) -> usize {
        self.data().disconnected.len()
    }

    /// Identity of the command connected to the bus, if any
    pub fn current_id(&self) -> Option<CommandId> {
        self.engine().current.as_ref().map(Command::id)
    }

    /// Last decoded state of the phase state machine
    pub fn state(&self) -> SpcState {
        self.engine().state
    }

    /// Queues a command. On success the adapter owns the command until it is
    /// handed back through its completion callback.
    pub fn queue_command(&self, mut cmd: Command) -> Result<(), QueueRejected> {
        if cmd.target() > MAX_SCSI_ID || cmd.target() == self.this_id {
            log::error!("Command {}: bad target {}", cmd.id(), cmd.target());
            cmd.set_result(ScsiResult::from_host(HostByte::DidBadTarget));
            cmd.complete();
            return Ok(());
        }
        if !cmd.has_done() {
            log::warn!("Command {} queued without completion callback", cmd.id());
        }
        self.internal_queue(cmd, CmdPhase::default())
    }

    /// Queues a command and starts it if the bus is idle
    fn internal_queue(&self, mut cmd: Command, phase: CmdPhase) -> Result<(), QueueRejected> {
        cmd.setup_scratch(phase);

        {
            let mut data = self.data();
            if let Err((command, reason)) = data.issue.enqueue(cmd) {
                log::error!("Command {}: allocation failed", command.id());
                return Err(QueueRejected { command, reason });
            }
            data.commands += 1;
        }

        self.port.set_bits(SpcReg::SCTL, SpcSctl::default().with_int_enable(true).into());
        self.kick();
        Ok(())
    }

    /// Starts selection right away when nothing else drives the state machine
    fn kick(&self) {
        {
            let mut data = self.data();
            if data.in_bh || data.starting {
                return;
            }
            data.starting = true;
        }

        let finished = {
            let mut engine = self.engine();
            if engine.current.is_none() && engine.done.is_none() {
                self.busfree_run(&mut engine);
            }
            std::mem::take(&mut engine.completions)
        };

        self.data().starting = false;
        Self::dispatch(finished);
    }

    /// Hands finished commands back, with neither lock held
    fn dispatch(finished: Vec<Command>) {
        for cmd in finished {
            cmd.complete();
        }
    }

    /// Aborts a command that was not started yet. A command that is already
    /// on the bus or disconnected is left alone.
    pub fn abort(&self, id: CommandId) -> EhResult {
        let removed = {
            let mut data = self.data();
            let cmd = data.issue.remove(id);
            if cmd.is_some() {
                data.commands -= 1;
            }
            cmd
        };

        let sctl = self.data().sctl;
        self.port.write(
            SpcReg::SCTL,
            SpcSctl::default().with_control_reset(true).into(),
        );
        self.port.write(SpcReg::SCTL, sctl.with_int_enable(true).into());

        match removed {
            Some(mut cmd) => {
                log::info!("Command {} aborted before selection", id);
                cmd.set_result(ScsiResult::from_host(HostByte::DidAbort));
                cmd.complete();
            }
            None => log::info!("Command {} not in issue queue, abort has no effect", id),
        }

        EhResult::Success
    }

    /// Sends BUS DEVICE RESET to the device of a queued or disconnected
    /// command and waits for it to go out.
    pub fn device_reset(&self, id: CommandId) -> EhResult {
        if self.current_id() == Some(id) {
            log::error!("Command {}: cannot reset current device", id);
            return EhResult::Failed;
        }

        let (mut cmd, origin) = {
            let mut data = self.data();
            if let Some(cmd) = data.issue.remove(id) {
                (cmd, QueueOrigin::Issue)
            } else if let Some(cmd) = data.disconnected.remove(id) {
                (cmd, QueueOrigin::Disconnected)
            } else {
                log::warn!("Command {} unknown to the adapter, not resetting", id);
                return EhResult::Failed;
            }
        };

        let target = cmd.target();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let request = Command::reset_request(id, cmd.device()).with_done(move |c| {
            let _ = tx.send(c);
        });

        let resetted = match self.internal_queue(request, CmdPhase::default().with_resetting(true))
        {
            Err(e) => {
                log::error!("{}", e);
                false
            }
            Ok(()) => match rx.recv_timeout(self.platform.reset_timeout()) {
                Ok(request) => request.phase().resetted(),
                Err(_) => {
                    log::error!("{}", SpcError::ResetTimeout(target));
                    let mut data = self.data();
                    if data.issue.remove(id).is_some() {
                        data.commands -= 1;
                    }
                    false
                }
            },
        };

        if resetted {
            self.data().commands -= 1;
            cmd.set_result(ScsiResult::from_host(HostByte::DidReset));
            cmd.complete();
            EhResult::Success
        } else {
            let mut data = self.data();
            match origin {
                QueueOrigin::Issue => data.issue.push_back(cmd),
                QueueOrigin::Disconnected => data.disconnected.push_back(cmd),
            }
            EhResult::Failed
        }
    }

    /// Flushes commands of devices without soft reset and pulses RST.
    pub fn bus_reset(&self) -> EhResult {
        let flushed = {
            let mut data = self.data();
            let mut flushed = data.issue.drain_hard_reset();
            flushed.extend(data.disconnected.drain_hard_reset());
            data.commands -= flushed.len();
            flushed
        };

        self.port.write(SpcReg::SCTL, 0);
        self.port
            .write(SpcReg::SCMD, SpcScmd::default().with_rst_out(true).into());
        self.port.delay(self.platform.delay());
        self.port.write(SpcReg::SCMD, 0);
        self.port.delay(self.platform.delay());
        self.port
            .write(SpcReg::SCTL, SpcSctl::default().with_int_enable(true).into());

        log::info!("Bus reset, {} commands flushed", flushed.len());
        for mut cmd in flushed {
            cmd.set_result(ScsiResult::from_host(HostByte::DidReset));
            cmd.complete();
        }

        EhResult::Success
    }

    /// Resets the controller, then the bus
    pub fn host_reset(&self) -> EhResult {
        self.port.write(
            SpcReg::SCTL,
            SpcSctl::default().with_control_reset(true).into(),
        );
        self.port
            .write(SpcReg::SCTL, SpcSctl::default().with_int_enable(true).into());
        self.bus_reset()
    }

    /// Logical geometry (heads, sectors, cylinders) for a capacity in sectors
    pub fn bios_param(&self, capacity: u64) -> [u64; 3] {
        [64, 32, capacity / (64 * 32)]
    }

    /// Renders the queues for diagnostics
    pub fn dump(&self) -> String {
        let engine = self.engine.try_lock().ok();
        render(&self.queue_properties(engine.as_deref()))
    }

    fn queue_properties(&self, engine: Option<&PhaseEngine>) -> DebuggableProperties {
        use crate::debuggable::*;
        use crate::{dbgprop_group, dbgprop_header, dbgprop_nest, dbgprop_str, dbgprop_udec};

        let mut props = vec![dbgprop_header!("Queue status")];
        match self.data.try_lock() {
            Ok(data) => {
                props.push(dbgprop_nest!("Issue", data.issue));
                props.push(dbgprop_nest!("Disconnected", data.disconnected));
                props.push(dbgprop_udec!("Commands", data.commands));
            }
            Err(_) => props.push(dbgprop_str!("Queues", "(locked)")),
        }
        match engine {
            Some(e) => props.push(dbgprop_group!("Engine", e.get_debug_properties())),
            None => props.push(dbgprop_str!("Engine", "(busy)")),
        }
        props
    }

    /// Dumps the queues and halts, for violations of the bus protocol the
    /// adapter cannot recover from.
    pub(crate) fn spc_error(&self, engine: Option<&PhaseEngine>, msg: &str) -> ! {
        log::error!("{}", msg);
        log::error!("{}", render(&self.queue_properties(engine)));
        panic!("SPC panic: {}", msg);
    }
}
