//! MB89352 register map

use num_derive::{FromPrimitive, ToPrimitive};
use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, ToPrimitive, strum::IntoStaticStr)]
/// SPC registers, by offset from the register window base.
///
/// The chip sits on the odd byte lane of a 16-bit bus, hence the odd offsets.
pub enum SpcReg {
    /// Bus Device ID (w: ID number, r: ID bit)
    BDID = 0x01,
    /// SPC Control
    SCTL = 0x03,
    /// SPC Command
    SCMD = 0x05,
    /// Interrupt Sense (write 1 to clear)
    INTS = 0x09,
    /// Phase Sense (r) / SPC Diag Control (w)
    PSNS = 0x0b,
    /// SPC Status
    SSTS = 0x0d,
    /// SPC Error Status
    SERR = 0x0f,
    /// Phase Control
    PCTL = 0x11,
    /// Modified Byte Counter
    MBC = 0x13,
    /// Data Register
    DREG = 0x15,
    /// Temporary Register
    TEMP = 0x17,
    /// Transfer Counter High
    TCH = 0x19,
    /// Transfer Counter Mid
    TCM = 0x1b,
    /// Transfer Counter Low
    TCL = 0x1d,
}

impl SpcReg {
    /// Size of the register window
    pub const WINDOW: usize = 0x20;
}

bitfield! {
    /// SPC Control register
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SpcSctl(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Interrupt enable
        pub int_enable: bool @ 0,
        /// Reselect enable
        pub reselect_enable: bool @ 1,
        /// Select enable (respond to being selected/reselected)
        pub select_enable: bool @ 2,
        /// Parity enable
        pub parity_enable: bool @ 3,
        /// Arbitration enable
        pub arbitration_enable: bool @ 4,
        /// Diagnostics mode
        pub diag_mode: bool @ 5,
        /// Control reset
        pub control_reset: bool @ 6,
        /// Reset & disable
        pub reset_disable: bool @ 7,
    }
}

bitfield! {
    /// SPC Command register
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SpcScmd(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Termination mode select
        pub term_mode: bool @ 0,
        /// Program transfer (as opposed to DMA)
        pub program_transfer: bool @ 2,
        /// Intercept transfer
        pub intercept: bool @ 3,
        /// Drive RST on the bus
        pub rst_out: bool @ 4,
        /// Command code, see [ScmdCommand]
        pub command: u8 @ 5..=7,
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, ToPrimitive)]
/// Command codes of the SCMD register (bits 7-5)
pub enum ScmdCommand {
    BusRelease = 0,
    Select = 1,
    ResetAtn = 2,
    SetAtn = 3,
    Transfer = 4,
    TransferPause = 5,
    ResetAckReq = 6,
    SetAckReq = 7,
}

impl ScmdCommand {
    /// SCMD register value issuing this command
    pub const fn scmd(self) -> u8 {
        (self as u8) << 5
    }
}

bitfield! {
    /// Interrupt Sense register
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SpcInts(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Reset condition on the bus
        pub reset: bool @ 0,
        /// SPC hard error (parity)
        pub hard_error: bool @ 1,
        /// Selection time out
        pub timeout: bool @ 2,
        /// Service required (phase mismatch during transfer)
        pub service_required: bool @ 3,
        /// Command complete (selection done)
        pub command_complete: bool @ 4,
        /// Disconnected, bus free
        pub disconnected: bool @ 5,
        /// Reselected
        pub reselected: bool @ 6,
        /// Selected by a target (reselection as an initiator)
        pub selected: bool @ 7,
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, ToPrimitive, strum::IntoStaticStr)]
/// Information transfer phases, as decoded from MSG/CD/IO
pub enum BusPhase {
    DataOut = 0b000,
    DataIn = 0b001,
    Command = 0b010,
    Status = 0b011,
    MessageOut = 0b110,
    MessageIn = 0b111,
}

impl BusPhase {
    /// PCTL value expecting this phase
    pub const fn pctl(self) -> u8 {
        self as u8
    }
}

bitfield! {
    /// Phase Sense register (SCSI bus signals)
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SpcPsns(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// MSG/CD/IO phase bits
        pub phase_bits: u8 @ 0..=2,

        pub io: bool @ 0,
        pub cd: bool @ 1,
        pub msg: bool @ 2,
        pub bsy: bool @ 3,
        pub sel: bool @ 4,
        pub atn: bool @ 5,
        pub ack: bool @ 6,
        pub req: bool @ 7,
    }
}

impl SpcPsns {
    /// Decodes the information transfer phase, if the signals form one.
    pub fn phase(&self) -> Option<BusPhase> {
        num_traits::FromPrimitive::from_u8(self.phase_bits())
    }
}

bitfield! {
    /// SPC Status register
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SpcSsts(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Data register empty
        pub dreg_empty: bool @ 0,
        /// Data register full
        pub dreg_full: bool @ 1,
        /// Transfer counter is zero
        pub tc_zero: bool @ 2,
        /// RST signal on the bus
        pub scsi_rst: bool @ 3,
        /// Transfer in progress
        pub xfer_in_progress: bool @ 4,
        /// SPC busy
        pub spc_busy: bool @ 5,
        /// Connection state: 0b10 initiator, 0b01 target, 0b00 not connected
        pub connection: u8 @ 6..=7,
    }
}

impl SpcSsts {
    pub const CONN_INITIATOR: u8 = 0b10;
    pub const CONN_TARGET: u8 = 0b01;

    /// Connected to a target as the initiator
    pub fn initiator_connected(&self) -> bool {
        self.connection() == Self::CONN_INITIATOR
    }
}

bitfield! {
    /// SPC Error Status register
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SpcSerr(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Short transfer period
        pub short_period: bool @ 1,
        /// Transfer counter error
        pub tc_parity_error: bool @ 3,
        /// SCSI parity error
        pub scsi_parity_error: u8 @ 6..=7,
    }
}

/// Selection time-out, programmed into TCH/TCM
pub const SELTIME: u16 = 128;
/// Selection start delay, programmed into TCL
pub const SELSTART: u8 = 3;
