pub type Byte = u8;

/// SCSI ID on the bus (0 - 7)
pub type ScsiId = u8;

/// Logical unit number
pub type Lun = u8;

/// A self-clearing latch for events etc.
#[derive(Debug, Default)]
pub struct LatchingEvent {
    val: bool,
}

impl LatchingEvent {
    /// Returns the current value and clears the event.
    pub fn get_clear(&mut self) -> bool {
        let v = self.val;
        self.val = false;
        v
    }

    /// Sets the event.
    pub fn set(&mut self) {
        self.val = true;
    }

    /// Peeks at the event without clearing it
    pub fn peek(&self) -> bool {
        self.val
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_clears_on_get() {
        let mut ev = LatchingEvent::default();
        assert!(!ev.peek());
        ev.set();
        assert!(ev.peek());
        assert!(ev.get_clear());
        assert!(!ev.get_clear());
    }
}
