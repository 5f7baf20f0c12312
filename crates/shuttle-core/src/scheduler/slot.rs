//! Worker slots: the fixed set of execution lanes.

use crate::domain::TaskId;

/// One lane of concurrent execution. Holds at most one running task.
#[derive(Debug, Clone, Default)]
pub(crate) struct WorkerSlot {
    occupant: Option<TaskId>,
}

/// The pool of lanes. Occupancy never exceeds the number of slots.
#[derive(Debug)]
pub(crate) struct SlotPool {
    slots: Vec<WorkerSlot>,
    occupied: usize,
    peak: usize,
}

impl SlotPool {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            slots: vec![WorkerSlot::default(); size],
            occupied: 0,
            peak: 0,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn occupied(&self) -> usize {
        self.occupied
    }

    /// Highest occupancy seen so far.
    pub(crate) fn peak(&self) -> usize {
        self.peak
    }

    pub(crate) fn has_free(&self) -> bool {
        self.occupied < self.slots.len()
    }

    /// Put `task` in the first free slot, returning the slot index.
    pub(crate) fn acquire(&mut self, task: TaskId) -> Option<usize> {
        let index = self.slots.iter().position(|s| s.occupant.is_none())?;
        self.slots[index].occupant = Some(task);
        self.occupied += 1;
        self.peak = self.peak.max(self.occupied);
        Some(index)
    }

    /// Free slot `index`. Returns the task that was in it.
    pub(crate) fn release(&mut self, index: usize) -> Option<TaskId> {
        let task = self.slots.get_mut(index)?.occupant.take()?;
        self.occupied -= 1;
        Some(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_fills_first_free_slot() {
        let mut pool = SlotPool::new(2);
        let (a, b, c) = (TaskId::generate(), TaskId::generate(), TaskId::generate());

        assert_eq!(pool.acquire(a), Some(0));
        assert_eq!(pool.acquire(b), Some(1));
        assert_eq!(pool.acquire(c), None);
        assert!(!pool.has_free());

        assert_eq!(pool.release(0), Some(a));
        assert_eq!(pool.acquire(c), Some(0));
        assert_eq!(pool.peak(), 2);
    }

    #[test]
    fn releasing_an_empty_slot_is_a_no_op() {
        let mut pool = SlotPool::new(1);
        assert_eq!(pool.release(0), None);
        assert_eq!(pool.release(7), None);
        assert_eq!(pool.occupied(), 0);
    }
}
