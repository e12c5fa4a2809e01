//! FIFO of commands, used for the issue and disconnected queues

use std::collections::VecDeque;

use crate::debuggable::Debuggable;
use crate::scsi::command::{Command, CommandId};
use crate::spc::SpcError;
use crate::types::{Lun, ScsiId};

#[derive(Debug, Default)]
pub struct CommandQueue {
    cmds: VecDeque<Command>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    /// Appends a command at the tail.
    /// The command is handed back if no memory could be reserved for it.
    pub fn enqueue(&mut self, cmd: Command) -> Result<(), (Command, SpcError)> {
        if let Err(e) = self.cmds.try_reserve(1) {
            return Err((cmd, SpcError::Alloc(e)));
        }
        self.cmds.push_back(cmd);
        Ok(())
    }

    /// Appends a command that is already accounted for (moved between queues)
    pub(crate) fn push_back(&mut self, cmd: Command) {
        self.cmds.push_back(cmd);
    }

    /// Puts a command back at the head, ahead of everything queued.
    pub fn push_front(&mut self, cmd: Command) {
        self.cmds.push_front(cmd);
    }

    /// Removes and returns the oldest command
    pub fn dequeue_first(&mut self) -> Option<Command> {
        self.cmds.pop_front()
    }

    /// Removes the command with the given identity
    pub fn remove(&mut self, id: CommandId) -> Option<Command> {
        let idx = self.cmds.iter().position(|c| c.id() == id)?;
        self.cmds.remove(idx)
    }

    /// Removes the first command addressed to target/LUN
    pub fn remove_by_target_lun(&mut self, target: ScsiId, lun: Lun) -> Option<Command> {
        let idx = self
            .cmds
            .iter()
            .position(|c| c.target() == target && c.lun() == lun)?;
        self.cmds.remove(idx)
    }

    pub fn contains(&self, id: CommandId) -> bool {
        self.cmds.iter().any(|c| c.id() == id)
    }

    /// Takes out every command of a device that does not keep its
    /// commands across a bus reset, in queue order.
    pub fn drain_hard_reset(&mut self) -> Vec<Command> {
        let (reset, keep): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.cmds)
            .into_iter()
            .partition(|c| !c.device().soft_reset);
        self.cmds = keep;
        reset.into()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.cmds.iter()
    }
}

impl Debuggable for CommandQueue {
    fn get_debug_properties(&self) -> crate::debuggable::DebuggableProperties {
        use crate::debuggable::*;
        use crate::{dbgprop_nest, dbgprop_str};

        if self.cmds.is_empty() {
            return vec![dbgprop_str!("Commands", "none")];
        }
        self.cmds
            .iter()
            .map(|c| dbgprop_nest!(format!("Command {}", c.id()), c))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::{ScsiDevice, TEST_UNIT_READY};

    fn cmd(id: CommandId, target: u8, lun: u8) -> Command {
        Command::new(id, ScsiDevice::new(target, lun), &[TEST_UNIT_READY, 0, 0, 0, 0, 0]).unwrap()
    }

    fn ids(q: &CommandQueue) -> Vec<CommandId> {
        q.iter().map(Command::id).collect()
    }

    #[test]
    fn fifo_order() {
        let mut q = CommandQueue::new();
        assert!(q.is_empty());
        assert!(q.dequeue_first().is_none());

        for id in 1..=3 {
            q.enqueue(cmd(id, 0, 0)).unwrap();
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.dequeue_first().unwrap().id(), 1);

        q.push_front(cmd(9, 0, 0));
        assert_eq!(ids(&q), vec![9, 2, 3]);
    }

    #[test]
    fn remove_by_identity() {
        let mut q = CommandQueue::new();
        for id in 1..=3 {
            q.enqueue(cmd(id, id as u8, 0)).unwrap();
        }
        assert!(q.contains(2));
        assert_eq!(q.remove(2).unwrap().id(), 2);
        assert!(q.remove(2).is_none());
        assert_eq!(ids(&q), vec![1, 3]);
    }

    #[test]
    fn remove_by_target_lun() {
        let mut q = CommandQueue::new();
        q.enqueue(cmd(1, 2, 0)).unwrap();
        q.enqueue(cmd(2, 2, 1)).unwrap();
        q.enqueue(cmd(3, 2, 1)).unwrap();

        assert_eq!(q.remove_by_target_lun(2, 1).unwrap().id(), 2);
        assert!(q.remove_by_target_lun(5, 0).is_none());
        assert_eq!(ids(&q), vec![1, 3]);
    }

    #[test]
    fn drain_keeps_soft_reset_devices() {
        let mut q = CommandQueue::new();
        q.enqueue(cmd(1, 0, 0)).unwrap();
        let soft = Command::new(
            2,
            ScsiDevice::new(1, 0).with_soft_reset(true),
            &[TEST_UNIT_READY, 0, 0, 0, 0, 0],
        )
        .unwrap();
        q.enqueue(soft).unwrap();
        q.enqueue(cmd(3, 2, 0)).unwrap();

        let drained: Vec<_> = q.drain_hard_reset().iter().map(Command::id).collect();
        assert_eq!(drained, vec![1, 3]);
        assert_eq!(ids(&q), vec![2]);
    }
}
