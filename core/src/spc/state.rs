//! Phase state machine, driven by the bottom half

use arrayvec::ArrayVec;

use crate::bus::SpcPort;
use crate::debuggable::{Debuggable, render};
use crate::scsi::command::{CmdPhase, Command};
use crate::scsi::{
    ABORT, BUS_DEVICE_RESET, COMMAND_COMPLETE, DISCONNECT, EXTENDED_EXTENDED_IDENTIFY,
    EXTENDED_MESSAGE, EXTENDED_MODIFY_DATA_POINTER, EXTENDED_SDTR, EXTENDED_WDTR, HostByte,
    IDENTIFY_BASE, IDENTIFY_LUN_MASK, MESSAGE_REJECT, RESTORE_POINTERS, SAVE_POINTERS,
    STATUS_CHECK_CONDITION, ScsiResult, identify,
};
use crate::spc::SpcHost;
use crate::spc::regs::{
    BusPhase, SELSTART, SELTIME, ScmdCommand, SpcInts, SpcPsns, SpcReg, SpcSctl, SpcSsts,
};
use crate::types::{Byte, ScsiId};

/// Per-byte tracing of the information phases
const SPC_TRACE: bool = false;

/// Size of the message buffers
pub const MSGBUF_LEN: usize = 256;

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum SpcState {
    #[default]
    Idle,
    Unknown,
    /// Selection done
    SelDo,
    /// Reselected by a target
    SelDi,
    /// Selection time out
    SelTo,
    BusFree,
    MsgO,
    Cmd,
    MsgI,
    Status,
    DataI,
    DataO,
    ParErr,
    /// Reset in
    RstI,
}

/// Everything the state handlers work on. Only the context running the
/// state machine holds it.
#[derive(Debug, Default)]
pub(crate) struct PhaseEngine {
    pub state: SpcState,
    pub prevstate: SpcState,
    /// Last state that differed from the current one
    pub laststate: SpcState,

    /// Command connected to the bus
    pub current: Option<Command>,
    /// Command waiting for its completion to be dispatched
    pub done: Option<Command>,
    /// Finished commands, handed back once the engine is released
    pub completions: Vec<Command>,

    pub msgi: ArrayVec<Byte, MSGBUF_LEN>,
    pub msgo: ArrayVec<Byte, MSGBUF_LEN>,
    pub msgo_i: usize,
    pub cmd_i: usize,
    /// Bytes moved in the current data phase
    pub data_len: usize,
    pub reconn_target: Option<ScsiId>,

    pub ints: SpcInts,
}

impl Debuggable for PhaseEngine {
    fn get_debug_properties(&self) -> crate::debuggable::DebuggableProperties {
        use crate::debuggable::*;
        use crate::{dbgprop_byte_bin, dbgprop_enum, dbgprop_nest, dbgprop_str, dbgprop_string};

        vec![
            dbgprop_enum!("State", self.state),
            dbgprop_enum!("Previous state", self.prevstate),
            dbgprop_enum!("Last state", self.laststate),
            match &self.current {
                Some(c) => dbgprop_nest!(format!("Current: command {}", c.id()), c),
                None => dbgprop_str!("Current", "none"),
            },
            match &self.done {
                Some(c) => dbgprop_nest!(format!("Done: command {}", c.id()), c),
                None => dbgprop_str!("Done", "none"),
            },
            dbgprop_string!("MESSAGE IN", format!("{:02X?}", self.msgi.as_slice())),
            dbgprop_string!(
                "MESSAGE OUT",
                format!("{:02X?} (at {})", self.msgo.as_slice(), self.msgo_i)
            ),
            dbgprop_string!("Reconnecting target", format!("{:?}", self.reconn_target)),
            dbgprop_byte_bin!("INTS", self.ints.0),
        ]
    }
}

impl<P: SpcPort> SpcHost<P> {
    fn psns(&self) -> SpcPsns {
        SpcPsns(self.port.read(SpcReg::PSNS))
    }

    /// Target requests a transfer in the given phase
    fn req_in_phase(&self, phase: BusPhase) -> bool {
        let psns = self.psns();
        psns.req() && psns.phase() == Some(phase)
    }

    /// Manual REQ/ACK handshake for the byte in TEMP
    fn handshake(&self) {
        self.port.write(SpcReg::SCMD, ScmdCommand::SetAckReq.scmd());
        while self.psns().req() {
            self.port.relax();
        }
        self.port.write(SpcReg::SCMD, ScmdCommand::ResetAckReq.scmd());
        while self.psns().ack() {
            self.port.relax();
        }
    }

    /// Programs the transfer counter and starts a program transfer
    fn program_transfer(&self, len: usize) {
        self.port.write(SpcReg::TCH, ((len >> 16) & 0xFF) as Byte);
        self.port.write(SpcReg::TCM, ((len >> 8) & 0xFF) as Byte);
        self.port.write(SpcReg::TCL, (len & 0xFF) as Byte);
        self.port.write(SpcReg::SCMD, ScmdCommand::Transfer.scmd());
    }

    /// Waits for a byte in the data register, false if data-in ended
    fn wait_dreg_in(&self) -> bool {
        loop {
            if !SpcSsts(self.port.read(SpcReg::SSTS)).dreg_empty() {
                return true;
            }
            if !self.req_in_phase(BusPhase::DataIn) {
                return false;
            }
            self.port.relax();
        }
    }

    /// Waits for room in the data register, false if data-out ended
    fn wait_dreg_out(&self) -> bool {
        loop {
            if !self.req_in_phase(BusPhase::DataOut) {
                return false;
            }
            if !SpcSsts(self.port.read(SpcReg::SSTS)).dreg_full() {
                return true;
            }
            self.port.relax();
        }
    }

    pub(crate) fn add_msgo(&self, e: &mut PhaseEngine, msg: Byte) {
        if e.msgo.try_push(msg).is_err() {
            self.spc_error(Some(&*e), "MESSAGE OUT buffer overflow");
        }
    }

    fn add_msgi(&self, e: &mut PhaseEngine, msg: Byte) {
        if e.msgi.try_push(msg).is_err() {
            self.spc_error(Some(&*e), "MESSAGE IN buffer overflow");
        }
    }

    /// Moves the current command into the done slot
    pub(crate) fn done(&self, e: &mut PhaseEngine, result: ScsiResult) {
        if e.current.is_none() {
            log::error!("done() called outside of command");
            return;
        }
        if let Some(prev) = &e.done {
            let msg = format!("there's already a completed command {}", prev.id());
            self.spc_error(Some(&*e), &msg);
        }
        if let Some(mut cmd) = e.current.take() {
            cmd.set_result(result);
            e.done = Some(cmd);
        }
    }

    /// Queues ABORT for a target in a phase nobody expects and raises ATN,
    /// clocking one byte so the target notices.
    fn abort_stray_phase(&self, e: &mut PhaseEngine, phase: BusPhase) {
        if !self.req_in_phase(phase) {
            return;
        }
        log::warn!(
            "{} phase without command, aborting target",
            <&'static str>::from(phase)
        );
        if !e.msgo.contains(&ABORT) {
            self.add_msgo(e, ABORT);
        }
        self.port.write(SpcReg::SCMD, ScmdCommand::SetAtn.scmd());
        self.port.write(SpcReg::PCTL, phase.pctl());
        match phase {
            BusPhase::DataIn | BusPhase::Status | BusPhase::MessageIn => {
                let _ = self.port.read(SpcReg::TEMP);
            }
            BusPhase::DataOut | BusPhase::Command | BusPhase::MessageOut => {
                self.port.write(SpcReg::TEMP, 0);
            }
        }
        self.handshake();
    }

    /// Decodes the next state from the captured interrupt status and the bus
    pub(crate) fn update_state(&self, e: &mut PhaseEngine) {
        e.prevstate = e.state;
        let ints = e.ints;
        let selecting = e.current.as_ref().is_some_and(|c| c.phase.selecting());

        e.state = if ints.reset() {
            SpcState::RstI
        } else if ints.selected()
            // SelTo finishes with a bus free run of its own
            && matches!(e.prevstate, SpcState::BusFree | SpcState::SelTo)
        {
            e.ints.set_selected(false);
            SpcState::SelDi
        } else if ints.command_complete() && selecting {
            e.ints.set_command_complete(false);
            SpcState::SelDo
        } else if ints.timeout() {
            e.ints.set_timeout(false);
            SpcState::SelTo
        } else if ints.disconnected() || self.port.read(SpcReg::PSNS) == 0 {
            e.ints.set_disconnected(false);
            SpcState::BusFree
        } else if ints.hard_error() {
            e.ints.set_hard_error(false);
            SpcState::ParErr
        } else if SpcSsts(self.port.read(SpcReg::SSTS)).initiator_connected() {
            match self.psns().phase() {
                Some(BusPhase::MessageIn) => SpcState::MsgI,
                Some(BusPhase::MessageOut) => SpcState::MsgO,
                Some(BusPhase::DataOut) => SpcState::DataO,
                Some(BusPhase::DataIn) => SpcState::DataI,
                Some(BusPhase::Status) => SpcState::Status,
                Some(BusPhase::Command) => SpcState::Cmd,
                None => SpcState::Unknown,
            }
        } else {
            SpcState::Unknown
        };

        if e.ints.selected() && e.state != SpcState::SelDi {
            log::info!("Reselection missed in state {}", e.state);
        }

        if e.state != e.prevstate {
            e.laststate = e.prevstate;
        }
    }

    pub(crate) fn state_init(&self, e: &mut PhaseEngine, state: SpcState) {
        match state {
            SpcState::MsgO => self.msgo_init(e),
            SpcState::Cmd => self.cmd_init(e),
            SpcState::DataI => self.datai_init(e),
            SpcState::DataO => self.datao_init(e),
            _ => (),
        }
    }

    /// Runs the handler of a state, false if the state has none
    pub(crate) fn state_run(&self, e: &mut PhaseEngine, state: SpcState) -> bool {
        match state {
            SpcState::Idle | SpcState::Unknown => return false,
            SpcState::SelDo => self.seldo_run(e),
            SpcState::SelDi => self.seldi_run(e),
            SpcState::SelTo => self.selto_run(e),
            SpcState::BusFree => self.busfree_run(e),
            SpcState::MsgO => self.msgo_run(e),
            SpcState::Cmd => self.cmd_run(e),
            SpcState::MsgI => self.msgi_run(e),
            SpcState::Status => self.status_run(e),
            SpcState::DataI => self.datai_run(e),
            SpcState::DataO => self.datao_run(e),
            SpcState::ParErr => self.parerr_run(e),
            SpcState::RstI => self.rsti_run(e),
        }
        true
    }

    pub(crate) fn state_end(&self, e: &mut PhaseEngine, state: SpcState) {
        match state {
            SpcState::MsgO => self.msgo_end(e),
            SpcState::Cmd => self.cmd_end(e),
            SpcState::MsgI => self.msgi_end(e),
            SpcState::DataI => self.datai_end(e),
            SpcState::DataO => self.datao_end(e),
            _ => (),
        }
    }

    /// Bus free: settles the command that was on the bus, dispatches the
    /// done slot and starts the next command.
    pub(crate) fn busfree_run(&self, e: &mut PhaseEngine) {
        if let Some(cur) = &e.current {
            let phase = cur.phase;
            let host = if phase.completed() {
                Some(HostByte::DidOk)
            } else if phase.aborted() {
                Some(HostByte::DidAbort)
            } else if phase.resetted() {
                Some(HostByte::DidReset)
            } else {
                None
            };

            if let Some(host) = host {
                let result = ScsiResult::new(host, cur.status, cur.message);
                self.done(e, result);
            } else if phase.disconnected() {
                if let Some(cmd) = e.current.take() {
                    log::debug!("Command {} disconnected", cmd.id());
                    self.data().disconnected.push_back(cmd);
                }
            } else {
                log::error!("Command {} lost the bus unexpectedly", cur.id());
                self.done(e, ScsiResult::from_host(HostByte::DidError));
            }
        }

        let finished = match e.done.take() {
            Some(mut cmd) if cmd.phase.check_condition() => {
                cmd.restore_sense();
                Some(cmd)
            }
            Some(mut cmd)
                if cmd.status == STATUS_CHECK_CONDITION && !cmd.phase.not_issued() =>
            {
                log::debug!("Command {}: CHECK CONDITION, requesting sense", cmd.id());
                cmd.prep_sense();
                cmd.setup_scratch(CmdPhase::default().with_check_condition(true));
                self.data().issue.push_front(cmd);
                None
            }
            other => other,
        };

        if let Some(cmd) = finished {
            self.data().commands -= 1;
            log::debug!("Command {} done: {}", cmd.id(), cmd.result());
            e.completions.push(cmd);
        }

        let next = self.data().issue.dequeue_first();
        match next {
            Some(cmd) => self.start_selection(e, cmd),
            None => self.bus_idle(),
        }
    }

    fn start_selection(&self, e: &mut PhaseEngine, mut cmd: Command) {
        let target = cmd.target();
        if SPC_TRACE {
            log::debug!("Selecting target {} for command {}", target, cmd.id());
        }
        cmd.phase.set_selecting(true);
        e.current = Some(cmd);
        e.msgi.clear();
        e.msgo.clear();
        e.msgo_i = 0;

        // Clear stale selection results
        self.port.write(
            SpcReg::INTS,
            SpcInts::default()
                .with_timeout(true)
                .with_command_complete(true)
                .into(),
        );

        self.port.write(SpcReg::SCMD, ScmdCommand::SetAtn.scmd());
        self.port
            .write(SpcReg::TEMP, self.port.read(SpcReg::BDID) | (1 << target));
        self.port.write(SpcReg::PCTL, 0);
        self.port.write(SpcReg::TCH, (SELTIME >> 8) as Byte);
        self.port.write(SpcReg::TCM, (SELTIME & 0xFF) as Byte);
        self.port.write(SpcReg::TCL, SELSTART);

        let mut sctl = SpcSctl(self.port.read(SpcReg::SCTL)).with_int_enable(true);
        if self.platform.parity {
            sctl.set_parity_enable(true);
        }
        self.data().sctl = sctl;
        self.port.write(SpcReg::SCTL, sctl.into());
        self.port.write(SpcReg::SCMD, ScmdCommand::Select.scmd());
    }

    /// Nothing to issue: answer reselection only if a target owes us one
    fn bus_idle(&self) {
        {
            let mut data = self.data();
            let expect_reselection = !data.disconnected.is_empty();
            data.sctl = SpcSctl(self.port.read(SpcReg::SCTL))
                .with_int_enable(false)
                .with_select_enable(expect_reselection);
        }
        self.port.write(SpcReg::PCTL, 0);
    }

    /// Selection done, queue IDENTIFY for the message out phase
    fn seldo_run(&self, e: &mut PhaseEngine) {
        let Some(cur) = e.current.as_mut() else {
            log::error!("Selection done without command");
            return;
        };
        cur.phase.set_selecting(false);
        cur.phase.set_not_issued(false);

        if e.ints.disconnected() {
            log::error!("Command {}: passing bus free condition", cur.id());
            self.done(e, ScsiResult::from_host(HostByte::DidNoConnect));
            return;
        }

        let lun = cur.lun();
        let phase = cur.phase;
        self.add_msgo(e, identify(self.platform.reconnect, lun));
        if phase.aborting() {
            self.add_msgo(e, ABORT);
        } else if phase.resetting() {
            self.add_msgo(e, BUS_DEVICE_RESET);
        }
    }

    fn selto_run(&self, e: &mut PhaseEngine) {
        self.port.write(SpcReg::TEMP, 0);
        self.port.write(SpcReg::SCMD, ScmdCommand::BusRelease.scmd());

        let Some(cur) = e.current.as_mut() else {
            return;
        };
        cur.phase.set_selecting(false);
        let host = if cur.phase.aborted() {
            HostByte::DidAbort
        } else {
            HostByte::DidNoConnect
        };
        log::debug!("Command {}: selection timeout", cur.id());
        self.done(e, ScsiResult::from_host(host));
        self.busfree_run(e);
    }

    /// Reselected: the command that was being selected loses the race and
    /// goes back to the head of the issue queue.
    pub(crate) fn seldi_run(&self, e: &mut PhaseEngine) {
        if let Some(mut cur) = e.current.take() {
            if !cur.phase.not_issued() && !cur.phase.check_condition() {
                log::error!("Command {} should not have been issued yet", cur.id());
            }
            cur.phase.set_selecting(false);
            self.data().issue.push_front(cur);
        }

        if self.data().disconnected.is_empty() {
            return;
        }

        e.reconn_target = None;

        let own = 1u8 << self.this_id;
        let selid = self.port.read(SpcReg::TEMP) & !own;
        if selid == 0 {
            log::info!("Reselecting target id unknown ({:02X})", selid);
            return;
        }

        let target = selid.trailing_zeros() as ScsiId;
        if selid & !(1 << target) != 0 {
            log::error!("Multiple targets reconnected ({:02X})", selid);
        }

        self.port.write(SpcReg::TEMP, own | (1 << target));
        e.reconn_target = Some(target);
    }

    fn msgi_run(&self, e: &mut PhaseEngine) {
        self.port.write(SpcReg::PCTL, BusPhase::MessageIn.pctl());
        loop {
            if e.ints.disconnected() || e.ints.service_required() {
                return;
            }
            if !self.req_in_phase(BusPhase::MessageIn) {
                return;
            }

            let msg = self.port.read(SpcReg::TEMP);
            if SPC_TRACE {
                log::debug!("MESSAGE IN: {:02X}", msg);
            }
            self.add_msgi(e, msg);
            if self.msgi_process(e) {
                // Target switches to MESSAGE OUT after this byte
                self.port.write(SpcReg::SCMD, ScmdCommand::SetAtn.scmd());
            }
            self.handshake();
        }
    }

    /// Acts on the inbound message buffered so far.
    /// Returns true if an answer was queued for MESSAGE OUT.
    fn msgi_process(&self, e: &mut PhaseEngine) -> bool {
        if e.current.is_none() {
            return self.msgi_reselection(e);
        }

        let msg = e.msgi[0];
        if msg == EXTENDED_MESSAGE {
            if e.msgi.len() < 2 || e.msgi.len() < usize::from(e.msgi[1]) + 2 {
                // Not complete yet
                return false;
            }

            let kind = match e.msgi.get(2).copied() {
                Some(EXTENDED_MODIFY_DATA_POINTER) => "MODIFY DATA POINTER",
                Some(EXTENDED_SDTR) => "SDTR",
                Some(EXTENDED_EXTENDED_IDENTIFY) => "EXTENDED IDENTIFY",
                Some(EXTENDED_WDTR) => "WDTR",
                _ => "unknown",
            };
            log::info!("Rejecting extended message ({})", kind);
            e.msgi.clear();
            if let Some(cur) = e.current.as_mut() {
                cur.message = msg;
            }
            self.add_msgo(e, MESSAGE_REJECT);
            return true;
        }

        e.msgi.clear();
        let Some(cur) = e.current.as_mut() else {
            return false;
        };
        cur.message = msg;
        match msg {
            DISCONNECT => {
                if !self.platform.reconnect {
                    log::warn!("Command {}: target was not allowed to disconnect", cur.id());
                }
                cur.phase.set_disconnected(true);
            }
            COMMAND_COMPLETE => cur.phase.set_completed(true),
            MESSAGE_REJECT => {
                log::info!("Command {}: inbound message (MESSAGE REJECT)", cur.id());
            }
            // Pointers follow the scatter-gather cursor
            SAVE_POINTERS | RESTORE_POINTERS => (),
            _ => log::warn!("Command {}: ignoring message {:02X}", cur.id(), msg),
        }
        false
    }

    /// First message after reselection, must IDENTIFY a disconnected command
    fn msgi_reselection(&self, e: &mut PhaseEngine) -> bool {
        if e.laststate != SpcState::SelDi {
            log::error!("Message in w/o current command not after reselection");
        }

        let msg = e.msgi[0];
        e.msgi.clear();

        if msg & IDENTIFY_BASE == 0 {
            log::error!("Target didn't identify after reselection ({:02X})", msg);
            return self.abort_nexus(e);
        }
        let lun = msg & IDENTIFY_LUN_MASK;
        let Some(target) = e.reconn_target else {
            log::error!("IDENTIFY without reselecting target");
            return self.abort_nexus(e);
        };

        let found = self.data().disconnected.remove_by_target_lun(target, lun);
        match found {
            Some(mut cmd) => {
                log::debug!("Command {} reconnected", cmd.id());
                cmd.message = msg;
                cmd.phase.set_disconnected(false);
                e.current = Some(cmd);
                false
            }
            None => {
                log::error!(
                    "No disconnected command for target {}/{}\n{}",
                    target,
                    lun,
                    render(&self.queue_properties(Some(&*e)))
                );
                self.abort_nexus(e)
            }
        }
    }

    fn abort_nexus(&self, e: &mut PhaseEngine) -> bool {
        if !e.msgo.contains(&ABORT) {
            self.add_msgo(e, ABORT);
        }
        true
    }

    fn msgi_end(&self, e: &mut PhaseEngine) {
        if !e.msgi.is_empty() {
            log::warn!("Target left before message completed ({})", e.msgi.len());
            e.msgi.clear();
        }

        if !e.msgo.is_empty() && e.state != SpcState::BusFree {
            self.port.write(SpcReg::SCMD, ScmdCommand::SetAtn.scmd());
        }
    }

    fn msgo_init(&self, e: &mut PhaseEngine) {
        if e.msgo.is_empty() {
            log::info!("Unexpected MESSAGE OUT phase; rejecting");
            self.add_msgo(e, MESSAGE_REJECT);
        }
        self.port.write(SpcReg::PCTL, BusPhase::MessageOut.pctl());
    }

    fn msgo_run(&self, e: &mut PhaseEngine) {
        while e.msgo_i < e.msgo.len() {
            if !self.req_in_phase(BusPhase::MessageOut) {
                return;
            }

            let msg = e.msgo[e.msgo_i];
            if e.msgo_i == e.msgo.len() - 1 {
                // Leave MESSAGE OUT after this byte
                self.port.write(SpcReg::SCMD, ScmdCommand::ResetAtn.scmd());
            }

            if let Some(cur) = e.current.as_mut() {
                if msg & IDENTIFY_BASE != 0 {
                    cur.phase.set_identified(true);
                }
                if msg == ABORT {
                    cur.phase.set_aborted(true);
                }
                if msg == BUS_DEVICE_RESET {
                    cur.phase.set_resetted(true);
                }
            }

            if SPC_TRACE {
                log::debug!("MESSAGE OUT: {:02X}", msg);
            }
            self.port.write(SpcReg::TEMP, msg);
            e.msgo_i += 1;
            self.handshake();
        }
    }

    fn msgo_end(&self, e: &mut PhaseEngine) {
        if e.msgo_i < e.msgo.len() {
            log::error!(
                "Message sent incompletely ({}/{})",
                e.msgo_i,
                e.msgo.len()
            );
        }
        e.msgo_i = 0;
        e.msgo.clear();
    }

    fn cmd_init(&self, e: &mut PhaseEngine) {
        let Some(cur) = &e.current else {
            return;
        };
        if cur.sent_command {
            log::error!("Command {}: command already sent", cur.id());
            self.done(e, ScsiResult::from_host(HostByte::DidError));
            return;
        }
        self.port.write(SpcReg::PCTL, BusPhase::Command.pctl());
        e.cmd_i = 0;
    }

    fn cmd_run(&self, e: &mut PhaseEngine) {
        if e.current.is_none() {
            self.abort_stray_phase(e, BusPhase::Command);
            return;
        }
        let Some(cur) = &e.current else {
            return;
        };
        let cdb = cur.cdb();
        while e.cmd_i < cdb.len() {
            if !self.req_in_phase(BusPhase::Command) {
                return;
            }
            if SPC_TRACE {
                log::debug!("COMMAND: {:02X}", cdb[e.cmd_i]);
            }
            self.port.write(SpcReg::TEMP, cdb[e.cmd_i]);
            e.cmd_i += 1;
            self.handshake();
        }

        if self.req_in_phase(BusPhase::Command) {
            log::warn!("Command {}: target wants more than {} CDB bytes", cur.id(), cdb.len());
            self.abort_stray_phase(e, BusPhase::Command);
        }
    }

    fn cmd_end(&self, e: &mut PhaseEngine) {
        let Some(cur) = e.current.as_mut() else {
            return;
        };
        if e.cmd_i < cur.cdb().len() {
            log::error!(
                "Command {}: command sent incompletely ({}/{})",
                cur.id(),
                e.cmd_i,
                cur.cdb().len()
            );
        } else {
            cur.sent_command = true;
        }
    }

    fn status_run(&self, e: &mut PhaseEngine) {
        self.port.write(SpcReg::PCTL, BusPhase::Status.pctl());
        if e.current.is_none() {
            self.abort_stray_phase(e, BusPhase::Status);
            return;
        }
        if !self.req_in_phase(BusPhase::Status) {
            return;
        }

        let status = self.port.read(SpcReg::TEMP);
        if let Some(cur) = e.current.as_mut() {
            cur.status = status;
        }
        self.handshake();
    }

    fn datai_init(&self, e: &mut PhaseEngine) {
        self.port.write(SpcReg::PCTL, BusPhase::DataIn.pctl());
        e.data_len = 0;
    }

    fn datai_run(&self, e: &mut PhaseEngine) {
        if e.current.is_none() {
            self.abort_stray_phase(e, BusPhase::DataIn);
            return;
        }
        let Some(cur) = e.current.as_mut() else {
            return;
        };

        loop {
            let len = cur.cursor.this_residual;
            if len > 0 {
                self.program_transfer(len);
                while cur.cursor.this_residual > 0 {
                    if !self.wait_dreg_in() {
                        return;
                    }
                    cur.put_byte(self.port.read(SpcReg::DREG));
                    e.data_len += 1;
                }
            }
            if !cur.next_segment() {
                break;
            }
        }

        // Buffer exhausted, drain whatever the target still sends
        let mut dropped = 0;
        while self.wait_dreg_in() {
            let _ = self.port.read(SpcReg::DREG);
            dropped += 1;
        }
        if dropped > 0 {
            log::warn!("Command {}: data overrun, {} bytes dropped", cur.id(), dropped);
        }
    }

    fn datai_end(&self, e: &mut PhaseEngine) {
        if let Some(cur) = &e.current {
            log::debug!(
                "Command {}: {} bytes in, residual {}",
                cur.id(),
                e.data_len,
                cur.resid
            );
        }
    }

    fn datao_init(&self, e: &mut PhaseEngine) {
        self.port.write(SpcReg::PCTL, BusPhase::DataOut.pctl());
        e.data_len = 0;
    }

    fn datao_run(&self, e: &mut PhaseEngine) {
        if e.current.is_none() {
            self.abort_stray_phase(e, BusPhase::DataOut);
            return;
        }
        let Some(cur) = e.current.as_mut() else {
            return;
        };

        loop {
            let len = cur.cursor.this_residual;
            if len > 0 {
                self.program_transfer(len);
                while cur.cursor.this_residual > 0 {
                    if !self.wait_dreg_out() {
                        return;
                    }
                    let Some(b) = cur.take_byte() else {
                        break;
                    };
                    self.port.write(SpcReg::DREG, b);
                    e.data_len += 1;
                }
            }
            if !cur.next_segment() {
                break;
            }
        }

        // Buffer exhausted, pad until the target is satisfied
        let mut padded = 0;
        while self.wait_dreg_out() {
            self.port.write(SpcReg::DREG, 0);
            padded += 1;
        }
        if padded > 0 {
            log::warn!("Command {}: data underrun, {} bytes padded", cur.id(), padded);
        }
    }

    fn datao_end(&self, e: &mut PhaseEngine) {
        if let Some(cur) = &e.current {
            log::debug!(
                "Command {}: {} bytes out, residual {}",
                cur.id(),
                e.data_len,
                cur.resid
            );
        }
    }

    fn parerr_run(&self, e: &mut PhaseEngine) {
        match &e.current {
            Some(cur) => log::error!("Command {}: parity error", cur.id()),
            None => log::error!("Parity error"),
        }
        self.done(e, ScsiResult::from_host(HostByte::DidParity));
    }

    /// Reset in: every command of a device without soft reset is gone
    fn rsti_run(&self, e: &mut PhaseEngine) {
        log::info!("SCSI reset in");

        let flushed = {
            let mut data = self.data();
            let flushed = data.disconnected.drain_hard_reset();
            data.commands -= flushed.len();
            flushed
        };
        for mut cmd in flushed {
            cmd.set_result(ScsiResult::from_host(HostByte::DidReset));
            e.completions.push(cmd);
        }

        if e.current.as_ref().is_some_and(|c| !c.device().soft_reset) {
            self.done(e, ScsiResult::from_host(HostByte::DidReset));
        }
    }
}
