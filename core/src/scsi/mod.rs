//! SCSI commands, messages and completion results

pub mod command;
pub mod queue;

use num_derive::{FromPrimitive, ToPrimitive};
use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

use crate::types::Lun;

pub const STATUS_GOOD: u8 = 0x00;
pub const STATUS_CHECK_CONDITION: u8 = 0x02;
pub const STATUS_BUSY: u8 = 0x08;
/// Not a valid SCSI status, marks "no status received yet"
pub const STATUS_NONE: u8 = 0x01;

// Messages
pub const COMMAND_COMPLETE: u8 = 0x00;
pub const EXTENDED_MESSAGE: u8 = 0x01;
pub const SAVE_POINTERS: u8 = 0x02;
pub const RESTORE_POINTERS: u8 = 0x03;
pub const DISCONNECT: u8 = 0x04;
pub const INITIATOR_ERROR: u8 = 0x05;
pub const ABORT: u8 = 0x06;
pub const MESSAGE_REJECT: u8 = 0x07;
pub const NOP: u8 = 0x08;
pub const MSG_PARITY_ERROR: u8 = 0x09;
pub const BUS_DEVICE_RESET: u8 = 0x0C;
pub const IDENTIFY_BASE: u8 = 0x80;

// Extended message types
pub const EXTENDED_MODIFY_DATA_POINTER: u8 = 0x00;
pub const EXTENDED_SDTR: u8 = 0x01;
pub const EXTENDED_EXTENDED_IDENTIFY: u8 = 0x02;
pub const EXTENDED_WDTR: u8 = 0x03;

// Commands
pub const TEST_UNIT_READY: u8 = 0x00;
pub const REQUEST_SENSE: u8 = 0x03;
pub const READ_6: u8 = 0x08;
pub const WRITE_6: u8 = 0x0A;
pub const INQUIRY: u8 = 0x12;
pub const MODE_SENSE: u8 = 0x1A;
pub const READ_CAPACITY: u8 = 0x25;
pub const READ_10: u8 = 0x28;
pub const WRITE_10: u8 = 0x2A;

/// Size of the sense buffer attached to every command
pub const SCSI_SENSE_BUFFERSIZE: usize = 96;

/// Longest CDB accepted
pub const MAX_CDB_LEN: usize = 16;

/// LUN field of IDENTIFY (LUNTRN), SCSI-2 addresses eight units
pub const IDENTIFY_LUN_MASK: u8 = 0x07;

/// Builds an IDENTIFY message
pub const fn identify(can_disconnect: bool, lun: Lun) -> u8 {
    IDENTIFY_BASE | if can_disconnect { 0x40 } else { 0 } | (lun & IDENTIFY_LUN_MASK)
}

/// Length of a CDB by its operation code (group code)
pub const fn scsi_cmd_len(opcode: u8) -> usize {
    match opcode >> 5 {
        0 => 6,
        1 | 2 => 10,
        4 => 16,
        5 => 12,
        // Reserved/vendor specific groups, assume the shortest
        _ => 6,
    }
}

#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    FromPrimitive,
    ToPrimitive,
    strum::IntoStaticStr,
    Serialize,
    Deserialize,
)]
/// Host byte of a completion result
pub enum HostByte {
    #[default]
    DidOk = 0x00,
    DidNoConnect = 0x01,
    DidBusBusy = 0x02,
    DidTimeOut = 0x03,
    DidBadTarget = 0x04,
    DidAbort = 0x05,
    DidParity = 0x06,
    DidError = 0x07,
    DidReset = 0x08,
}

bitfield! {
    /// Completion result handed back to the mid-layer
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct ScsiResult(pub u32): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Status byte as sent by the target
        pub status: u8 @ 0..=7,
        /// Last message byte from the target
        pub message: u8 @ 8..=15,
        /// Raw host byte, see [HostByte]
        pub host: u8 @ 16..=23,
    }
}

impl ScsiResult {
    pub fn new(host: HostByte, status: u8, message: u8) -> Self {
        Self(0)
            .with_host(host as u8)
            .with_status(status)
            .with_message(message)
    }

    /// Result carrying only a host byte
    pub fn from_host(host: HostByte) -> Self {
        Self::new(host, 0, 0)
    }

    pub fn host_byte(&self) -> Option<HostByte> {
        num_traits::FromPrimitive::from_u8(self.host())
    }
}

impl std::fmt::Display for ScsiResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let host: &'static str = self.host_byte().map_or("DID_?", |h| h.into());
        write!(
            f,
            "{} status {:02X} message {:02X}",
            host,
            self.status(),
            self.message()
        )
    }
}

/// Data transfer direction of a command
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataDirection {
    #[default]
    None,
    /// Target -> Initiator
    In,
    /// Initiator -> Target
    Out,
}

/// SCSI device a command is addressed to
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScsiDevice {
    pub id: u8,
    pub lun: Lun,
    /// Device keeps its commands across a bus reset
    #[serde(default)]
    pub soft_reset: bool,
}

impl ScsiDevice {
    pub const fn new(id: u8, lun: Lun) -> Self {
        Self {
            id,
            lun,
            soft_reset: false,
        }
    }

    pub const fn with_soft_reset(self, soft_reset: bool) -> Self {
        Self { soft_reset, ..self }
    }
}
