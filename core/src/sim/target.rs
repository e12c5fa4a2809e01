//! SCSI target generic/shared code

use anyhow::Result;

use crate::scsi::{
    INQUIRY, MODE_SENSE, READ_6, READ_10, READ_CAPACITY, REQUEST_SENSE, STATUS_CHECK_CONDITION,
    STATUS_GOOD, TEST_UNIT_READY, WRITE_6, WRITE_10,
};

/// Sense key: illegal request
pub const SENSE_ILLEGAL_REQUEST: u8 = 0x05;
/// ASC/ASCQ: logical block address out of range
pub const ASC_LBA_OUT_OF_RANGE: u16 = 0x2100;
/// ASC/ASCQ: invalid command operation code
pub const ASC_INVALID_COMMAND: u16 = 0x2000;

/// Result of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScsiCmdResult {
    /// Immediately turn to the Status phase
    Status(u8),
    /// Returns data to the initiator
    DataIn(Vec<u8>),
    /// Expects data written to target
    DataOut(usize),
}

/// An abstraction of a generic SCSI target
pub trait ScsiTarget: Send {
    fn unit_ready(&mut self) -> Result<ScsiCmdResult>;
    fn inquiry(&mut self, cmd: &[u8]) -> Result<ScsiCmdResult>;
    fn mode_sense(&mut self, page: u8) -> Option<Vec<u8>>;

    /// Request sense result (key, asc/ascq), clears the condition
    fn req_sense(&mut self) -> (u8, u16);
    /// Sets the check condition reported by the next REQUEST SENSE
    fn set_cc(&mut self, key: u8, asc: u16);

    // For block devices
    fn blocksize(&self) -> Option<usize>;
    fn blocks(&self) -> Option<usize>;
    fn read(&self, block_offset: usize, block_count: usize) -> Vec<u8>;
    fn write(&mut self, block_offset: usize, data: &[u8]);

    /// Device-specific commands
    fn specific_cmd(&mut self, cmd: &[u8], _outdata: Option<&[u8]>) -> Result<ScsiCmdResult> {
        log::error!("Unknown command {:02X}", cmd[0]);
        self.set_cc(SENSE_ILLEGAL_REQUEST, ASC_INVALID_COMMAND);
        Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION))
    }

    /// Returns the drives total capacity in bytes
    fn capacity(&self) -> Option<usize> {
        Some(self.blocksize()? * self.blocks()?)
    }

    /// Block transfer, checked against the size of the medium
    fn block_xfer(
        &mut self,
        blocknum: usize,
        blockcnt: usize,
        outdata: Option<&[u8]>,
        write: bool,
    ) -> Result<ScsiCmdResult> {
        let (Some(blocksize), Some(blocks)) = (self.blocksize(), self.blocks()) else {
            log::warn!("Block command to non-block device");
            self.set_cc(SENSE_ILLEGAL_REQUEST, ASC_INVALID_COMMAND);
            return Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION));
        };

        if blocknum + blockcnt > blocks {
            log::error!("Accessing beyond disk ({} + {})", blocknum, blockcnt);
            self.set_cc(SENSE_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE);
            return Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION));
        }

        if !write {
            return Ok(ScsiCmdResult::DataIn(self.read(blocknum, blockcnt)));
        }
        match outdata {
            Some(data) => {
                self.write(blocknum, data);
                Ok(ScsiCmdResult::Status(STATUS_GOOD))
            }
            None => Ok(ScsiCmdResult::DataOut(blockcnt * blocksize)),
        }
    }

    fn cmd(&mut self, cmd: &[u8], outdata: Option<&[u8]>) -> Result<ScsiCmdResult> {
        match cmd[0] {
            TEST_UNIT_READY => self.unit_ready(),
            REQUEST_SENSE => {
                let (key, asc) = self.req_sense();
                let mut result = vec![0; 14];
                // Current error, fixed format
                result[0] = 0x70;
                result[2] = key & 0x0F;
                result[7] = 6;
                result[12..14].copy_from_slice(&asc.to_be_bytes());
                result.truncate(usize::from(cmd[4]));
                Ok(ScsiCmdResult::DataIn(result))
            }
            READ_6 | WRITE_6 => {
                let blocknum = (u32::from_be_bytes(cmd[0..4].try_into()?) & 0x1F_FFFF) as usize;
                let blockcnt = if cmd[4] == 0 { 256 } else { cmd[4] as usize };
                self.block_xfer(blocknum, blockcnt, outdata, cmd[0] == WRITE_6)
            }
            INQUIRY => self.inquiry(cmd),
            MODE_SENSE => {
                let page = cmd[2] & 0x3F;
                match self.mode_sense(page) {
                    Some(data) => {
                        // Mode parameter header, no block descriptors
                        let mut result = vec![(data.len() + 3) as u8, 0, 0, 0];
                        result.extend(data);
                        result.truncate(usize::from(cmd[4]));
                        Ok(ScsiCmdResult::DataIn(result))
                    }
                    None => {
                        log::warn!("Unsupported mode page {:02X}", page);
                        self.set_cc(SENSE_ILLEGAL_REQUEST, ASC_INVALID_COMMAND);
                        Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION))
                    }
                }
            }
            READ_CAPACITY => {
                let (Some(blocksize), Some(blocks)) = (self.blocksize(), self.blocks()) else {
                    log::warn!("READ CAPACITY(10) command to non-block device");
                    self.set_cc(SENSE_ILLEGAL_REQUEST, ASC_INVALID_COMMAND);
                    return Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION));
                };
                let mut result = vec![0; 8];
                result[0..4].copy_from_slice(&((blocks as u32) - 1).to_be_bytes());
                result[4..8].copy_from_slice(&(blocksize as u32).to_be_bytes());
                Ok(ScsiCmdResult::DataIn(result))
            }
            READ_10 | WRITE_10 => {
                let blocknum = (u32::from_be_bytes(cmd[2..6].try_into()?)) as usize;
                let blockcnt = (u16::from_be_bytes(cmd[7..9].try_into()?)) as usize;
                self.block_xfer(blocknum, blockcnt, outdata, cmd[0] == WRITE_10)
            }
            0x2F => {
                // VERIFY(10)
                Ok(ScsiCmdResult::Status(STATUS_GOOD))
            }
            _ => self.specific_cmd(cmd, outdata),
        }
    }
}
