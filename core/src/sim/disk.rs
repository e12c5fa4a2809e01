//! SCSI hard disk drive (RAM backed block device)

use anyhow::{Result, bail};

use crate::sim::target::{ScsiCmdResult, ScsiTarget};
use crate::scsi::STATUS_GOOD;

pub const DISK_BLOCKSIZE: usize = 512;

pub struct SimDisk {
    /// Disk contents
    disk: Vec<u8>,

    /// Check condition sense key
    cc_code: u8,

    /// Check condition ASC
    cc_asc: u16,
}

impl SimDisk {
    /// Creates a disk of `blocks` blocks, filled with [SimDisk::pattern]
    pub fn new(blocks: usize) -> Self {
        Self {
            disk: (0..blocks * DISK_BLOCKSIZE).map(Self::pattern).collect(),
            cc_code: 0,
            cc_asc: 0,
        }
    }

    /// Creates a disk from an image
    pub fn from_image(disk: Vec<u8>) -> Result<Self> {
        if disk.is_empty() || disk.len() % DISK_BLOCKSIZE != 0 {
            bail!(
                "Cannot load disk image of {} bytes: not multiple of {}",
                disk.len(),
                DISK_BLOCKSIZE
            );
        }
        Ok(Self {
            disk,
            cc_code: 0,
            cc_asc: 0,
        })
    }

    /// Initial content of the byte at `offset`
    pub fn pattern(offset: usize) -> u8 {
        (offset % 251) as u8
    }

    pub fn contents(&self) -> &[u8] {
        &self.disk
    }
}

impl ScsiTarget for SimDisk {
    fn unit_ready(&mut self) -> Result<ScsiCmdResult> {
        Ok(ScsiCmdResult::Status(STATUS_GOOD))
    }

    fn inquiry(&mut self, cmd: &[u8]) -> Result<ScsiCmdResult> {
        let mut result = vec![0; 36];

        // 0 Peripheral qualifier (5-7), peripheral device type (4-0)
        result[0] = 0; // Magnetic disk

        // SCSI version compliance
        result[2] = 0x02; // ANSI-2
        result[3] = 0x02; // ANSI-2

        // 4 Additional length (N-4), min. 32
        result[4] = result.len() as u8 - 4;

        // 8..16 Vendor identification
        result[8..(8 + 7)].copy_from_slice(b"FUJITSU");

        // 16..32 Product identification
        result[16..(16 + 11)].copy_from_slice(b"SPC SIM HDD");

        // 32..36 Revision
        result[32..35].copy_from_slice(b"1.0");

        result.truncate(usize::from(cmd[4]));
        Ok(ScsiCmdResult::DataIn(result))
    }

    fn mode_sense(&mut self, page: u8) -> Option<Vec<u8>> {
        match page {
            0x02 => {
                // Disconnect-reconnect page
                let mut page = vec![0; 16];
                page[0] = 0x02; // Page code
                page[1] = 0x0E; // Page length
                Some(page)
            }
            0x03 => {
                // Format device page
                let mut page = vec![0; 24];
                page[0] = 0x03; // Page code
                page[1] = 0x16; // Page length
                // Bytes per physical sector
                page[12..14].copy_from_slice(&(DISK_BLOCKSIZE as u16).to_be_bytes());
                Some(page)
            }
            _ => None,
        }
    }

    fn req_sense(&mut self) -> (u8, u16) {
        let cc = (self.cc_code, self.cc_asc);
        self.cc_code = 0;
        self.cc_asc = 0;
        cc
    }

    fn set_cc(&mut self, code: u8, asc: u16) {
        self.cc_code = code;
        self.cc_asc = asc;
    }

    fn blocksize(&self) -> Option<usize> {
        Some(DISK_BLOCKSIZE)
    }

    fn blocks(&self) -> Option<usize> {
        Some(self.disk.len() / DISK_BLOCKSIZE)
    }

    fn read(&self, block_offset: usize, block_count: usize) -> Vec<u8> {
        self.disk[(block_offset * DISK_BLOCKSIZE)..((block_offset + block_count) * DISK_BLOCKSIZE)]
            .to_vec()
    }

    fn write(&mut self, block_offset: usize, data: &[u8]) {
        let offset = block_offset * DISK_BLOCKSIZE;
        self.disk[offset..(offset + data.len())].copy_from_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::{READ_6, READ_CAPACITY, REQUEST_SENSE, STATUS_CHECK_CONDITION, WRITE_10};
    use crate::sim::target::{ASC_LBA_OUT_OF_RANGE, SENSE_ILLEGAL_REQUEST};

    #[test]
    fn image_size() {
        assert!(SimDisk::from_image(vec![0; 1000]).is_err());
        assert!(SimDisk::from_image(vec![]).is_err());
        assert_eq!(SimDisk::from_image(vec![0; 1024]).unwrap().blocks(), Some(2));
    }

    #[test]
    fn read_capacity() {
        let mut disk = SimDisk::new(16);
        let ScsiCmdResult::DataIn(data) = disk.cmd(&[READ_CAPACITY, 0, 0, 0, 0, 0, 0, 0, 0, 0], None).unwrap() else {
            panic!("no data");
        };
        assert_eq!(data, vec![0, 0, 0, 15, 0, 0, 2, 0]);
        assert_eq!(disk.capacity(), Some(16 * 512));
    }

    #[test]
    fn read_beyond_sets_sense() {
        let mut disk = SimDisk::new(4);
        assert_eq!(
            disk.cmd(&[READ_6, 0, 0, 3, 2, 0], None).unwrap(),
            ScsiCmdResult::Status(STATUS_CHECK_CONDITION)
        );

        let ScsiCmdResult::DataIn(sense) = disk.cmd(&[REQUEST_SENSE, 0, 0, 0, 96, 0], None).unwrap() else {
            panic!("no sense");
        };
        assert_eq!(sense.len(), 14);
        assert_eq!(sense[2], SENSE_ILLEGAL_REQUEST);
        assert_eq!(u16::from_be_bytes([sense[12], sense[13]]), ASC_LBA_OUT_OF_RANGE);

        // Condition is cleared by reading it
        assert_eq!(disk.req_sense(), (0, 0));
    }

    #[test]
    fn write_two_step() {
        let mut disk = SimDisk::new(4);
        let cdb = [WRITE_10, 0, 0, 0, 0, 1, 0, 0, 1, 0];
        assert_eq!(disk.cmd(&cdb, None).unwrap(), ScsiCmdResult::DataOut(512));
        assert_eq!(
            disk.cmd(&cdb, Some(&[0xAA; 512])).unwrap(),
            ScsiCmdResult::Status(STATUS_GOOD)
        );
        assert_eq!(disk.read(1, 1), vec![0xAA; 512]);
        assert_eq!(disk.read(0, 1)[7], SimDisk::pattern(7));
    }
}
