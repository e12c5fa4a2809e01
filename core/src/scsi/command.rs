//! SCSI command as handed to the host adapter by the mid-layer

use std::fmt;

use arrayvec::ArrayVec;
use itertools::Itertools;
use proc_bitfield::bitfield;

use crate::debuggable::Debuggable;
use crate::scsi::{
    DataDirection, MAX_CDB_LEN, REQUEST_SENSE, SCSI_SENSE_BUFFERSIZE, STATUS_CHECK_CONDITION,
    STATUS_NONE, ScsiDevice, ScsiResult,
};
use crate::spc::SpcError;

/// Identifies a command towards the error handling entry points
pub type CommandId = u64;

/// Completion callback, hands the command back to the mid-layer
pub type DoneFn = Box<dyn FnOnce(Command) + Send>;

bitfield! {
    /// Progress of a command through the adapter
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct CmdPhase(pub u32): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Command not yet issued
        pub not_issued: bool @ 0,
        /// Target is being selected
        pub selecting: bool @ 1,
        /// IDENTIFY was sent
        pub identified: bool @ 2,
        /// Target disconnected
        pub disconnected: bool @ 3,
        /// Target sent COMMAND COMPLETE
        pub completed: bool @ 4,
        /// ABORT was sent
        pub aborted: bool @ 5,
        /// BUS DEVICE RESET was sent
        pub resetted: bool @ 6,
        /// ABORT is pending
        pub aborting: bool @ 9,
        /// BUS DEVICE RESET is pending
        pub resetting: bool @ 10,
        /// Requesting sense after CHECK CONDITION
        pub check_condition: bool @ 11,
    }
}

impl CmdPhase {
    /// Human readable list of the flags set
    pub fn describe(&self) -> String {
        [
            (self.not_issued(), "not issued"),
            (self.selecting(), "selecting"),
            (self.identified(), "identified"),
            (self.disconnected(), "disconnected"),
            (self.completed(), "completed"),
            (self.aborted(), "aborted"),
            (self.resetted(), "resetted"),
            (self.aborting(), "aborting"),
            (self.resetting(), "resetting"),
            (self.check_condition(), "check condition"),
        ]
        .into_iter()
        .filter(|(set, _)| *set)
        .map(|(_, name)| name)
        .join("|")
    }
}

/// Scatter-gather cursor
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SgCursor {
    /// Current segment
    pub seg: usize,
    /// Offset in the current segment
    pub pos: usize,
    /// Bytes left in the current segment
    pub this_residual: usize,
    /// Segments left after the current one
    pub buffers_residual: usize,
}

/// State stashed while a command is borrowed for REQUEST SENSE
struct EhSave {
    cdb: ArrayVec<u8, MAX_CDB_LEN>,
    direction: DataDirection,
    data: Vec<Vec<u8>>,
    resid: usize,
}

pub struct Command {
    id: CommandId,
    device: ScsiDevice,
    cdb: ArrayVec<u8, MAX_CDB_LEN>,
    direction: DataDirection,
    data: Vec<Vec<u8>>,
    sense: Vec<u8>,
    result: ScsiResult,

    pub(crate) phase: CmdPhase,
    /// Status byte received from the target
    pub(crate) status: u8,
    /// Last message byte received from the target
    pub(crate) message: u8,
    /// CDB was transferred completely
    pub(crate) sent_command: bool,
    pub(crate) cursor: SgCursor,
    /// Bytes not transferred yet
    pub(crate) resid: usize,

    done: Option<DoneFn>,
    eh_save: Option<Box<EhSave>>,
}

impl Command {
    pub fn new(id: CommandId, device: ScsiDevice, cdb: &[u8]) -> Result<Self, SpcError> {
        let cdb = ArrayVec::try_from(cdb).map_err(|_| SpcError::CdbTooLong(cdb.len()))?;
        Ok(Self {
            cdb,
            ..Self::reset_request(id, device)
        })
    }

    /// Request carrying no CDB, used to get a BUS DEVICE RESET message out
    pub(crate) fn reset_request(id: CommandId, device: ScsiDevice) -> Self {
        Self {
            id,
            device,
            cdb: ArrayVec::new(),
            direction: DataDirection::None,
            data: vec![],
            sense: vec![],
            result: ScsiResult::default(),
            phase: CmdPhase::default(),
            status: STATUS_NONE,
            message: 0,
            sent_command: false,
            cursor: SgCursor::default(),
            resid: 0,
            done: None,
            eh_save: None,
        }
    }

    /// Expects data from the target into the given segments
    pub fn with_data_in(self, segments: Vec<Vec<u8>>) -> Self {
        Self {
            direction: DataDirection::In,
            data: segments,
            ..self
        }
    }

    /// Sends the given segments to the target
    pub fn with_data_out(self, segments: Vec<Vec<u8>>) -> Self {
        Self {
            direction: DataDirection::Out,
            data: segments,
            ..self
        }
    }

    /// Sets the completion callback
    pub fn with_done(self, done: impl FnOnce(Self) + Send + 'static) -> Self {
        Self {
            done: Some(Box::new(done)),
            ..self
        }
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn device(&self) -> ScsiDevice {
        self.device
    }

    pub fn target(&self) -> u8 {
        self.device.id
    }

    pub fn lun(&self) -> u8 {
        self.device.lun
    }

    pub fn cdb(&self) -> &[u8] {
        &self.cdb
    }

    pub fn direction(&self) -> DataDirection {
        self.direction
    }

    pub fn phase(&self) -> CmdPhase {
        self.phase
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn message(&self) -> u8 {
        self.message
    }

    pub fn result(&self) -> ScsiResult {
        self.result
    }

    pub(crate) fn set_result(&mut self, result: ScsiResult) {
        self.result = result;
    }

    /// Data segments
    pub fn data(&self) -> &[Vec<u8>] {
        &self.data
    }

    /// Data segments, concatenated
    pub fn data_flat(&self) -> Vec<u8> {
        self.data.concat()
    }

    /// Sense data fetched after a CHECK CONDITION
    pub fn sense(&self) -> &[u8] {
        &self.sense
    }

    /// Total size of the data buffer
    pub fn bufflen(&self) -> usize {
        self.data.iter().map(Vec::len).sum()
    }

    /// Residual byte count
    pub fn resid(&self) -> usize {
        self.resid
    }

    /// Bytes actually transferred
    pub fn transferred(&self) -> usize {
        self.bufflen().saturating_sub(self.resid)
    }

    pub(crate) fn has_done(&self) -> bool {
        self.done.is_some()
    }

    /// Prepares the scratch area for (re)issuing. A command going out again
    /// for its REQUEST SENSE was issued already and stays that way.
    pub(crate) fn setup_scratch(&mut self, phase: CmdPhase) {
        let issued = phase.check_condition() && !self.phase.not_issued();
        self.phase = phase.with_not_issued(!issued);
        self.status = STATUS_NONE;
        self.message = 0;
        self.sent_command = false;

        if phase.resetting() || self.data.is_empty() {
            self.cursor = SgCursor::default();
            self.resid = 0;
        } else {
            self.resid = self.bufflen();
            self.cursor = SgCursor {
                seg: 0,
                pos: 0,
                this_residual: self.data[0].len(),
                buffers_residual: self.data.len() - 1,
            };
        }
    }

    /// Stores a received byte at the cursor, false if the segment is exhausted
    pub(crate) fn put_byte(&mut self, b: u8) -> bool {
        if self.cursor.this_residual == 0 {
            return false;
        }
        self.data[self.cursor.seg][self.cursor.pos] = b;
        self.cursor.pos += 1;
        self.cursor.this_residual -= 1;
        self.resid = self.resid.saturating_sub(1);
        true
    }

    /// Takes the byte to send at the cursor, None if the segment is exhausted
    pub(crate) fn take_byte(&mut self) -> Option<u8> {
        if self.cursor.this_residual == 0 {
            return None;
        }
        let b = self.data[self.cursor.seg][self.cursor.pos];
        self.cursor.pos += 1;
        self.cursor.this_residual -= 1;
        self.resid = self.resid.saturating_sub(1);
        Some(b)
    }

    /// Advances to the next segment, false at the end of the list
    pub(crate) fn next_segment(&mut self) -> bool {
        if self.cursor.buffers_residual == 0 {
            return false;
        }
        self.cursor.buffers_residual -= 1;
        self.cursor.seg += 1;
        self.cursor.pos = 0;
        self.cursor.this_residual = self.data[self.cursor.seg].len();
        true
    }

    /// Turns the command into a REQUEST SENSE, keeping the original aside
    pub(crate) fn prep_sense(&mut self) {
        let mut sense_cdb = ArrayVec::new();
        sense_cdb.extend([
            REQUEST_SENSE,
            (self.device.lun << 5) & 0xE0,
            0,
            0,
            SCSI_SENSE_BUFFERSIZE as u8,
            0,
        ]);

        let save = EhSave {
            cdb: std::mem::replace(&mut self.cdb, sense_cdb),
            direction: std::mem::replace(&mut self.direction, DataDirection::In),
            data: std::mem::replace(&mut self.data, vec![vec![0; SCSI_SENSE_BUFFERSIZE]]),
            resid: self.resid,
        };
        self.eh_save = Some(Box::new(save));
    }

    /// Restores the original command after REQUEST SENSE, keeping the sense data
    pub(crate) fn restore_sense(&mut self) {
        let Some(save) = self.eh_save.take() else {
            log::error!("Command {}: no saved state to restore", self.id);
            return;
        };
        let sense_len = self.transferred();
        let mut sense = std::mem::replace(&mut self.data, save.data).concat();
        sense.truncate(sense_len);
        self.sense = sense;
        self.cdb = save.cdb;
        self.direction = save.direction;
        self.resid = save.resid;
        self.status = STATUS_CHECK_CONDITION;
        self.result.set_status(STATUS_CHECK_CONDITION);
    }

    /// Drops adapter-private state and invokes the completion callback
    pub(crate) fn complete(mut self) {
        self.eh_save = None;
        if let Some(done) = self.done.take() {
            done(self);
        } else {
            log::warn!("Command {} completed without callback", self.id);
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("cdb", &format_args!("{:02X?}", self.cdb.as_slice()))
            .field("bufflen", &self.bufflen())
            .field("resid", &self.resid)
            .field("phase", &self.phase.describe())
            .field("status", &self.status)
            .field("message", &self.message)
            .finish()
    }
}

impl Debuggable for Command {
    fn get_debug_properties(&self) -> crate::debuggable::DebuggableProperties {
        use crate::debuggable::*;
        use crate::{dbgprop_bool, dbgprop_byte, dbgprop_string, dbgprop_udec};

        vec![
            dbgprop_udec!("Target", self.device.id),
            dbgprop_udec!("LUN", self.device.lun),
            dbgprop_string!("CDB", format!("{:02X?}", self.cdb.as_slice())),
            dbgprop_udec!("Buffer length", self.bufflen()),
            dbgprop_udec!("Residual", self.resid),
            dbgprop_string!("Phase", self.phase.describe()),
            dbgprop_byte!("Status", self.status),
            dbgprop_byte!("Message", self.message),
            dbgprop_bool!("Command sent", self.sent_command),
        ]
    }
}
