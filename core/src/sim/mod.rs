//! Behavioural simulation of the MB89352 and the SCSI targets behind it.
//!
//! Targets respond synchronously to every register access, so the bus
//! never has to be waited for and scenarios run without timing.

pub mod disk;
pub mod target;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, bail};
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::bus::SpcPort;
use crate::scsi::{
    ABORT, BUS_DEVICE_RESET, COMMAND_COMPLETE, DISCONNECT, EXTENDED_MESSAGE, EXTENDED_SDTR,
    IDENTIFY_BASE, MESSAGE_REJECT, NOP, SAVE_POINTERS, STATUS_CHECK_CONDITION, STATUS_GOOD,
    scsi_cmd_len,
};
use crate::spc::regs::{BusPhase, ScmdCommand, SpcInts, SpcPsns, SpcReg, SpcScmd, SpcSctl, SpcSsts};
use crate::spc::{MAX_SCSI_ID, SpcHost};
use crate::types::{Byte, Lun, ScsiId};
use target::{ScsiCmdResult, ScsiTarget};

/// Upper bound of interrupt deliveries in one [pump] call
const PUMP_LIMIT: usize = 10_000;

/// SDTR proposal sent by targets configured to negotiate
const SDTR_PROPOSAL: [u8; 5] = [EXTENDED_MESSAGE, 3, EXTENDED_SDTR, 25, 8];

/// Per-target behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Disconnect after the command phase if the initiator allows it
    pub disconnect: bool,
    /// Keep commands across a bus reset
    pub soft_reset: bool,
    /// Propose synchronous transfers (SDTR) after selection
    pub send_sdtr: bool,
    /// Report a parity error on the next data-in phase
    pub parity_error: bool,
}

/// Bus phase as driven by the target
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
pub enum SimPhase {
    #[default]
    Free,
    DataOut,
    DataIn,
    Command,
    Status,
    MessageOut,
    MessageIn,
}

impl SimPhase {
    fn bus_phase(self) -> Option<BusPhase> {
        match self {
            Self::Free => None,
            Self::DataOut => Some(BusPhase::DataOut),
            Self::DataIn => Some(BusPhase::DataIn),
            Self::Command => Some(BusPhase::Command),
            Self::Status => Some(BusPhase::Status),
            Self::MessageOut => Some(BusPhase::MessageOut),
            Self::MessageIn => Some(BusPhase::MessageIn),
        }
    }

    fn is_input(self) -> bool {
        matches!(self, Self::DataIn | Self::Status | Self::MessageIn)
    }
}

/// What a target still has to do for a command
#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    DataIn(Vec<u8>),
    DataOut(usize),
    Status(u8),
    MsgIn(Vec<u8>),
    Disconnect,
    Release,
}

/// I_T_L nexus between the initiator and a target
#[derive(Debug)]
struct Nexus {
    target: ScsiId,
    lun: Lun,
    /// Initiator allows disconnection
    disc_priv: bool,
    cdb: Vec<u8>,
    cdb_done: bool,
    sdtr_pending: bool,
    steps: VecDeque<Step>,
}

impl Nexus {
    fn new(target: ScsiId, lun: Lun) -> Self {
        Self {
            target,
            lun,
            disc_priv: false,
            cdb: vec![],
            cdb_done: false,
            sdtr_pending: false,
            steps: VecDeque::new(),
        }
    }

    fn cdb_complete(&self) -> bool {
        self.cdb
            .first()
            .is_some_and(|&op| self.cdb.len() >= scsi_cmd_len(op))
    }
}

struct SimTarget {
    dev: Box<dyn ScsiTarget>,
    config: TargetConfig,
}

#[derive(Default)]
struct SimState {
    bdid: ScsiId,
    sctl: SpcSctl,
    scmd: Byte,
    ints: SpcInts,
    pctl: Byte,
    temp: Byte,
    tc: [Byte; 3],

    atn: bool,
    req: bool,
    ack: bool,
    rst_out: bool,
    phase: SimPhase,

    /// Bytes the target still sends in the current input phase
    inbuf: VecDeque<u8>,
    /// Bytes received in the current data-out phase
    outbuf: Vec<u8>,
    outlen: usize,
    /// Bytes received in the current message-out phase
    msgout: Vec<u8>,

    nexus: Option<Nexus>,
    disconnected: Vec<Nexus>,
    reselecting: Option<ScsiId>,
    hold_reselection: bool,

    targets: [Option<SimTarget>; 8],

    executed: Vec<Vec<u8>>,
    msgout_log: Vec<u8>,
    rejected: usize,
}

impl SimState {
    fn psns(&self) -> SpcPsns {
        let Some(phase) = self.phase.bus_phase() else {
            return SpcPsns(0);
        };
        SpcPsns(0)
            .with_phase_bits(phase as u8)
            .with_bsy(true)
            .with_atn(self.atn)
            .with_ack(self.ack)
            .with_req(self.req)
    }

    fn ssts(&self) -> SpcSsts {
        let connection = if self.phase == SimPhase::Free {
            0
        } else {
            SpcSsts::CONN_INITIATOR
        };
        SpcSsts(0)
            .with_connection(connection)
            .with_dreg_empty(self.phase != SimPhase::DataIn || self.inbuf.is_empty())
            .with_tc_zero(self.tc == [0; 3])
    }

    fn target_config(&self, id: ScsiId) -> Option<TargetConfig> {
        self.targets[usize::from(id)].as_ref().map(|t| t.config)
    }

    fn enter_input(&mut self, phase: SimPhase, bytes: Vec<u8>) {
        self.phase = phase;
        self.inbuf = bytes.into();
        self.req = true;
    }

    fn enter_output(&mut self, phase: SimPhase) {
        self.phase = phase;
        self.outbuf.clear();
        self.req = true;
    }

    fn bus_free(&mut self) {
        self.phase = SimPhase::Free;
        self.req = false;
        self.ack = false;
        self.atn = false;
        self.inbuf.clear();
        self.outbuf.clear();
        self.msgout.clear();
        self.ints.set_disconnected(true);
    }

    /// RST on the bus, from either side
    fn bus_reset(&mut self) {
        log::info!("SCSI bus reset");
        self.nexus = None;
        let targets = &self.targets;
        self.disconnected.retain(|n| {
            targets[usize::from(n.target)]
                .as_ref()
                .is_some_and(|t| t.config.soft_reset)
        });
        self.reselecting = None;
        self.bus_free();
        self.ints.set_disconnected(false);
        self.ints.set_reset(true);
    }

    fn command(&mut self, scmd: SpcScmd) {
        self.scmd = scmd.0;
        if scmd.rst_out() != self.rst_out {
            self.rst_out = scmd.rst_out();
            if self.rst_out {
                self.bus_reset();
            }
        }

        match ScmdCommand::from_u8(scmd.command()) {
            Some(ScmdCommand::BusRelease) | Some(ScmdCommand::ResetAtn) => self.atn = false,
            Some(ScmdCommand::SetAtn) => self.atn = true,
            Some(ScmdCommand::Select) => self.select(),
            Some(ScmdCommand::Transfer) | Some(ScmdCommand::TransferPause) => (),
            Some(ScmdCommand::SetAckReq) => self.ack_asserted(),
            Some(ScmdCommand::ResetAckReq) => self.ack_released(),
            None => log::warn!("Invalid SCMD {:02X}", scmd.0),
        }
    }

    fn select(&mut self) {
        if self.phase != SimPhase::Free {
            log::warn!("SELECT while the bus is busy");
            return;
        }
        let ids = self.temp & !(1 << self.bdid);
        if ids == 0 {
            log::warn!("SELECT without target ID");
            self.ints.set_timeout(true);
            return;
        }
        let target = ids.trailing_zeros() as ScsiId;
        let Some(config) = self.target_config(target) else {
            log::debug!("Selection of target {} timed out", target);
            self.ints.set_timeout(true);
            return;
        };

        let mut nexus = Nexus::new(target, 0);
        nexus.sdtr_pending = config.send_sdtr;
        self.nexus = Some(nexus);
        self.msgout.clear();
        self.ints.set_command_complete(true);
        self.advance();
    }

    fn ack_asserted(&mut self) {
        if !self.req {
            log::warn!("ACK without REQ in {:?}", self.phase);
        }
        match self.phase {
            SimPhase::Free => return,
            SimPhase::DataIn | SimPhase::Status | SimPhase::MessageIn => {
                self.inbuf.pop_front();
            }
            SimPhase::MessageOut => {
                self.msgout.push(self.temp);
                self.msgout_log.push(self.temp);
            }
            SimPhase::Command => {
                if let Some(n) = self.nexus.as_mut() {
                    n.cdb.push(self.temp);
                }
            }
            SimPhase::DataOut => self.outbuf.push(self.temp),
        }
        self.req = false;
        self.ack = true;
    }

    fn ack_released(&mut self) {
        if !self.ack {
            return;
        }
        self.ack = false;

        match self.phase {
            SimPhase::Free => (),
            SimPhase::MessageOut if self.atn => self.req = true,
            SimPhase::MessageOut => self.message_out_done(),
            SimPhase::Command => {
                if self.nexus.as_ref().is_some_and(Nexus::cdb_complete) {
                    self.execute();
                } else {
                    self.req = true;
                }
            }
            SimPhase::DataOut => self.data_out_progress(),
            SimPhase::DataIn | SimPhase::Status | SimPhase::MessageIn => self.input_progress(),
        }
    }

    /// Next byte of an input phase, or the next phase
    fn input_progress(&mut self) {
        if self.atn {
            self.enter_output(SimPhase::MessageOut);
        } else if !self.inbuf.is_empty() {
            self.req = true;
        } else {
            self.advance();
        }
    }

    fn data_out_progress(&mut self) {
        if self.outbuf.len() < self.outlen {
            self.req = true;
            return;
        }

        let data = std::mem::take(&mut self.outbuf);
        let Some(n) = self.nexus.as_ref() else {
            self.bus_free();
            return;
        };
        let (target, cdb) = (n.target, n.cdb.clone());
        let steps = match self.targets[usize::from(target)].as_mut() {
            Some(t) => Self::steps_for(t.dev.cmd(&cdb, Some(&data))),
            None => VecDeque::from([Step::Release]),
        };
        if let Some(n) = self.nexus.as_mut() {
            n.steps = steps;
        }
        self.advance();
    }

    fn message_out_done(&mut self) {
        for msg in std::mem::take(&mut self.msgout) {
            match msg {
                m if m & IDENTIFY_BASE != 0 => {
                    if let Some(n) = self.nexus.as_mut() {
                        n.lun = m & 0x07;
                        n.disc_priv = m & 0x40 != 0;
                    }
                }
                ABORT => {
                    log::info!("Target aborting nexus on ABORT");
                    self.nexus = None;
                    self.bus_free();
                    return;
                }
                BUS_DEVICE_RESET => {
                    if let Some(n) = self.nexus.take() {
                        log::info!("Target {} reset by BUS DEVICE RESET", n.target);
                        self.disconnected.retain(|d| d.target != n.target);
                    }
                    self.bus_free();
                    return;
                }
                MESSAGE_REJECT => self.rejected += 1,
                NOP => (),
                m => log::warn!("Target ignoring message {:02X}", m),
            }
        }
        self.advance();
    }

    fn steps_for(result: Result<ScsiCmdResult>) -> VecDeque<Step> {
        let completion = |status| [Step::Status(status), Step::MsgIn(vec![COMMAND_COMPLETE]), Step::Release];
        match result {
            Ok(ScsiCmdResult::Status(status)) => completion(status).into(),
            Ok(ScsiCmdResult::DataIn(data)) => {
                let mut steps = VecDeque::from([Step::DataIn(data)]);
                steps.extend(completion(STATUS_GOOD));
                steps
            }
            Ok(ScsiCmdResult::DataOut(len)) => VecDeque::from([Step::DataOut(len)]),
            Err(e) => {
                log::error!("Target command failed: {:#}", e);
                completion(STATUS_CHECK_CONDITION).into()
            }
        }
    }

    /// CDB received, let the target act on it
    fn execute(&mut self) {
        let Some(n) = self.nexus.as_mut() else {
            return;
        };
        n.cdb_done = true;
        let (target, cdb, disc_priv) = (n.target, n.cdb.clone(), n.disc_priv);
        self.executed.push(cdb.clone());

        let Some(t) = self.targets[usize::from(target)].as_mut() else {
            self.bus_free();
            return;
        };
        let mut steps = Self::steps_for(t.dev.cmd(&cdb, None));
        if disc_priv && t.config.disconnect {
            steps.push_front(Step::Disconnect);
            steps.push_front(Step::MsgIn(vec![SAVE_POINTERS, DISCONNECT]));
        }
        if let Some(n) = self.nexus.as_mut() {
            n.steps = steps;
        }
        self.advance();
    }

    /// Moves on to whatever the target does next
    fn advance(&mut self) {
        if self.atn {
            self.enter_output(SimPhase::MessageOut);
            return;
        }
        let Some(n) = self.nexus.as_mut() else {
            self.bus_free();
            return;
        };
        if n.sdtr_pending {
            n.sdtr_pending = false;
            self.enter_input(SimPhase::MessageIn, SDTR_PROPOSAL.to_vec());
            return;
        }
        if !n.cdb_done {
            self.enter_output(SimPhase::Command);
            return;
        }

        let target = n.target;
        match n.steps.pop_front() {
            Some(Step::DataIn(data)) if data.is_empty() => self.advance(),
            Some(Step::DataIn(data)) => {
                self.enter_input(SimPhase::DataIn, data);
                let parity = self.targets[usize::from(target)]
                    .as_mut()
                    .is_some_and(|t| std::mem::take(&mut t.config.parity_error));
                if parity {
                    self.ints.set_hard_error(true);
                }
            }
            Some(Step::DataOut(len)) => {
                self.outlen = len;
                self.enter_output(SimPhase::DataOut);
                if len == 0 {
                    self.data_out_progress();
                }
            }
            Some(Step::Status(status)) => self.enter_input(SimPhase::Status, vec![status]),
            Some(Step::MsgIn(msg)) => self.enter_input(SimPhase::MessageIn, msg),
            Some(Step::Disconnect) => {
                if let Some(n) = self.nexus.take() {
                    self.disconnected.push(n);
                }
                self.bus_free();
            }
            Some(Step::Release) | None => {
                self.nexus = None;
                self.bus_free();
            }
        }
    }

    fn reselect(&mut self, target: ScsiId) -> bool {
        if self.phase != SimPhase::Free || self.reselecting.is_some() {
            return false;
        }
        if !self.sctl.select_enable() {
            log::debug!("Reselection by {} not enabled", target);
            return false;
        }
        if !self.disconnected.iter().any(|n| n.target == target) {
            return false;
        }
        self.reselecting = Some(target);
        self.ints.set_selected(true);
        true
    }

    /// Initiator answered the reselection, target goes to MESSAGE IN
    fn reconnect(&mut self, target: ScsiId, temp: Byte) {
        if temp & (1 << target) == 0 {
            log::warn!("Reselection answered for the wrong target ({:02X})", temp);
        }
        let Some(idx) = self.disconnected.iter().position(|n| n.target == target) else {
            log::error!("Target {} has nothing to reconnect", target);
            return;
        };
        let nexus = self.disconnected.remove(idx);
        let identify = IDENTIFY_BASE | nexus.lun;
        self.nexus = Some(nexus);
        self.enter_input(SimPhase::MessageIn, vec![identify]);
    }

    fn read_temp(&self) -> Byte {
        if let Some(target) = self.reselecting {
            return (1 << self.bdid) | (1 << target);
        }
        if self.phase.is_input() {
            self.inbuf.front().copied().unwrap_or(0)
        } else {
            self.temp
        }
    }

    fn write_temp(&mut self, val: Byte) {
        self.temp = val;
        if let Some(target) = self.reselecting.take() {
            self.reconnect(target, val);
        }
    }

    fn read_dreg(&mut self) -> Byte {
        if self.phase != SimPhase::DataIn {
            log::warn!("DREG read in {:?}", self.phase);
            return 0;
        }
        let val = self.inbuf.pop_front().unwrap_or(0);
        if self.inbuf.is_empty() {
            self.input_progress();
        }
        val
    }

    fn write_dreg(&mut self, val: Byte) {
        if self.phase != SimPhase::DataOut {
            log::warn!("DREG write in {:?}", self.phase);
            return;
        }
        self.outbuf.push(val);
        self.data_out_progress();
    }
}

/// Simulated MB89352 with SCSI targets attached. Clones share the chip.
#[derive(Clone, Default)]
pub struct SimSpc {
    state: Arc<Mutex<SimState>>,
}

impl SimSpc {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches a target to the bus
    pub fn attach(&self, id: ScsiId, dev: impl ScsiTarget + 'static, config: TargetConfig) -> Result<()> {
        if id > MAX_SCSI_ID {
            bail!("Invalid target ID {}", id);
        }
        let mut s = self.state();
        if s.targets[usize::from(id)].is_some() {
            bail!("Target {} already attached", id);
        }
        s.targets[usize::from(id)] = Some(SimTarget {
            dev: Box::new(dev),
            config,
        });
        Ok(())
    }

    /// Runs `f` on an attached target
    pub fn with_target<R>(&self, id: ScsiId, f: impl FnOnce(&mut dyn ScsiTarget) -> R) -> Option<R> {
        let mut s = self.state();
        let t = s.targets.get_mut(usize::from(id))?.as_mut()?;
        Some(f(t.dev.as_mut()))
    }

    /// Interrupt request line
    pub fn irq_asserted(&self) -> bool {
        let s = self.state();
        s.sctl.int_enable() && s.ints.0 != 0
    }

    /// Lets a target with a disconnected command reselect the initiator.
    /// False if the bus or the initiator is not ready for it.
    pub fn reselect(&self, target: ScsiId) -> bool {
        self.state().reselect(target)
    }

    /// Reselects on behalf of the first target with a disconnected command
    pub fn try_reselect(&self) -> bool {
        let mut s = self.state();
        if s.hold_reselection {
            return false;
        }
        match s.disconnected.first().map(|n| n.target) {
            Some(target) => s.reselect(target),
            None => false,
        }
    }

    /// Keeps disconnected targets from reselecting on their own
    pub fn hold_reselection(&self, hold: bool) {
        self.state().hold_reselection = hold;
    }

    /// RST asserted by another device on the bus
    pub fn assert_reset(&self) {
        self.state().bus_reset();
    }

    /// Adds a disconnected command the initiator knows nothing about
    pub fn inject_disconnected(&self, target: ScsiId, lun: Lun) {
        let mut nexus = Nexus::new(target, lun);
        nexus.cdb_done = true;
        nexus.steps = SimState::steps_for(Ok(ScsiCmdResult::Status(STATUS_GOOD)));
        self.state().disconnected.push(nexus);
    }

    /// CDBs executed by the targets, in order
    pub fn executed(&self) -> Vec<Vec<u8>> {
        self.state().executed.clone()
    }

    /// Every message byte received from the initiator
    pub fn msgout_log(&self) -> Vec<u8> {
        self.state().msgout_log.clone()
    }

    /// MESSAGE REJECTs received from the initiator
    pub fn rejected(&self) -> usize {
        self.state().rejected
    }

    /// Commands disconnected at the target side
    pub fn disconnected_nexuses(&self) -> usize {
        self.state().disconnected.len()
    }

    pub fn phase(&self) -> SimPhase {
        self.state().phase
    }
}

impl SpcPort for SimSpc {
    fn read(&self, reg: SpcReg) -> Byte {
        let mut s = self.state();
        match reg {
            SpcReg::BDID => 1 << s.bdid,
            SpcReg::SCTL => s.sctl.0,
            SpcReg::SCMD => s.scmd,
            SpcReg::INTS => s.ints.0,
            SpcReg::PSNS => s.psns().0,
            SpcReg::SSTS => s.ssts().0,
            SpcReg::SERR | SpcReg::MBC => 0,
            SpcReg::PCTL => s.pctl,
            SpcReg::DREG => s.read_dreg(),
            SpcReg::TEMP => s.read_temp(),
            SpcReg::TCH => s.tc[0],
            SpcReg::TCM => s.tc[1],
            SpcReg::TCL => s.tc[2],
        }
    }

    fn write(&self, reg: SpcReg, val: Byte) {
        let mut s = self.state();
        match reg {
            SpcReg::BDID => s.bdid = val & 0x07,
            SpcReg::SCTL => {
                s.sctl = SpcSctl(val);
                if s.sctl.control_reset() {
                    log::debug!("SPC control reset");
                }
            }
            SpcReg::SCMD => s.command(SpcScmd(val)),
            SpcReg::INTS => s.ints.0 &= !val,
            // Diagnostics control, not simulated
            SpcReg::PSNS => (),
            SpcReg::PCTL => s.pctl = val,
            SpcReg::DREG => s.write_dreg(val),
            SpcReg::TEMP => s.write_temp(val),
            SpcReg::TCH => s.tc[0] = val,
            SpcReg::TCM => s.tc[1] = val,
            SpcReg::TCL => s.tc[2] = val,
            SpcReg::SSTS | SpcReg::SERR | SpcReg::MBC => {
                log::warn!("Write to read-only register {:?}: {:02X}", reg, val);
            }
        }
    }

    fn delay(&self, _duration: Duration) {}
}

/// Delivers interrupts and runs the bottom halves until the interrupt line
/// stays quiet and no target wants to reselect.
/// Returns the number of interrupts delivered.
pub fn pump(host: &SpcHost<SimSpc>) -> usize {
    let sim = host.port();
    let mut delivered = 0;
    for _ in 0..PUMP_LIMIT {
        if sim.irq_asserted() {
            host.interrupt();
            delivered += 1;
        } else if !sim.try_reselect() && host.run_pending_work() == 0 {
            return delivered;
        }
        host.run_pending_work();
    }
    log::error!("Interrupt line still active after {} deliveries", PUMP_LIMIT);
    delivered
}
