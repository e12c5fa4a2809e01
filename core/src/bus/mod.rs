pub mod testbus;

use std::time::Duration;

use anyhow::{Result, bail};

use crate::spc::regs::SpcReg;
use crate::types::Byte;

/// Base address of a register window
pub type Address = usize;

/// Byte-wide access to the SPC register window.
///
/// Register access happens from both the interrupt top half and the bottom
/// half, so access goes through a shared reference like plain MMIO.
pub trait SpcPort: Send + Sync {
    fn read(&self, reg: SpcReg) -> Byte;
    fn write(&self, reg: SpcReg, val: Byte);

    /// Sets bits in a register (read-modify-write)
    fn set_bits(&self, reg: SpcReg, bits: Byte) {
        self.write(reg, self.read(reg) | bits);
    }

    /// Clears bits in a register (read-modify-write)
    fn clear_bits(&self, reg: SpcReg, bits: Byte) {
        self.write(reg, self.read(reg) & !bits);
    }

    /// Called on every iteration of a bus handshake busy-wait
    fn relax(&self) {
        std::hint::spin_loop();
    }

    /// Waits a fixed amount of time (reset pulses etc.)
    fn delay(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Memory mapped register window
#[derive(Debug)]
pub struct MmioPort {
    base: Address,
}

impl MmioPort {
    /// Creates a port for the register window at `base`.
    ///
    /// # Safety
    /// `base` must point to a mapped register window of at least
    /// [SpcReg::WINDOW] bytes that stays valid for the lifetime of the port,
    /// and nothing else may assume exclusive access to it.
    pub unsafe fn new(base: Address) -> Result<Self> {
        if base == 0 {
            bail!("Register window at null address");
        }
        Ok(Self { base })
    }

    pub fn base(&self) -> Address {
        self.base
    }

    fn reg_ptr(&self, reg: SpcReg) -> *mut Byte {
        (self.base + reg as usize) as *mut Byte
    }
}

// SAFETY: the window is device memory accessed with single volatile byte
// operations, concurrent access is what the hardware expects.
unsafe impl Send for MmioPort {}
unsafe impl Sync for MmioPort {}

impl SpcPort for MmioPort {
    fn read(&self, reg: SpcReg) -> Byte {
        // SAFETY: guaranteed valid by the contract of MmioPort::new
        unsafe { self.reg_ptr(reg).read_volatile() }
    }

    fn write(&self, reg: SpcReg, val: Byte) {
        // SAFETY: guaranteed valid by the contract of MmioPort::new
        unsafe { self.reg_ptr(reg).write_volatile(val) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmio_offsets() {
        let mut window = vec![0u8; SpcReg::WINDOW];
        let port = unsafe { MmioPort::new(window.as_mut_ptr() as Address) }.unwrap();

        port.write(SpcReg::BDID, 0x07);
        port.write(SpcReg::TEMP, 0xA5);
        port.set_bits(SpcReg::SCTL, 0x01);
        port.set_bits(SpcReg::SCTL, 0x08);
        port.clear_bits(SpcReg::SCTL, 0x01);

        assert_eq!(port.read(SpcReg::TEMP), 0xA5);
        drop(port);
        assert_eq!(window[0x01], 0x07);
        assert_eq!(window[0x17], 0xA5);
        assert_eq!(window[0x03], 0x08);
    }

    #[test]
    fn mmio_null() {
        assert!(unsafe { MmioPort::new(0) }.is_err());
    }
}
