pub mod bus;
pub mod debuggable;
pub mod scsi;
#[cfg(feature = "sim")]
pub mod sim;
pub mod spc;
pub mod types;
