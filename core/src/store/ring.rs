//! Pooled operation slots of the persistence pipeline.
//!
//! A slot is addressed by `sequence & mask` and tagged with the sequence it
//! currently holds. Stages hand a slot to each other through its state:
//!
//! ```text
//! AVAILABLE --matcher--> PROCESSED --persister--> PERSIST --completion--> AVAILABLE
//!                          |   ^
//!              acquire_to_process / complete_processing (matcher cancelling)
//! ```

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use super::{StorageError, StoreOp};

const AVAILABLE: u8 = 0;
const PROCESSING: u8 = 1;
const PROCESSED: u8 = 2;
const PERSIST: u8 = 3;

/// Sequence value before anything was published
pub const INITIAL_SEQUENCE: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    NoOp,
    Insert,
    Detach,
    Delete,
}

pub struct Slot {
    sequence: AtomicI64,
    state: AtomicU8,
    op: Mutex<Option<StoreOp>>,
    failure: Mutex<Option<String>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            sequence: AtomicI64::new(INITIAL_SEQUENCE),
            state: AtomicU8::new(AVAILABLE),
            op: Mutex::new(None),
            failure: Mutex::new(None),
        }
    }

    /// Sequence this slot was last written for
    pub fn sequence(&self) -> i64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub(crate) fn write(&self, sequence: i64, op: StoreOp) {
        *self.op.lock() = Some(op);
        *self.failure.lock() = None;
        self.state.store(AVAILABLE, Ordering::Release);
        self.sequence.store(sequence, Ordering::Release);
    }

    pub fn acquire_to_process(&self) -> bool {
        self.state
            .compare_exchange(PROCESSED, PROCESSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn complete_processing(&self) {
        self.state.store(PROCESSED, Ordering::Release);
    }

    /// Once acquired for persisting the operation is frozen
    pub fn acquire_for_persisting(&self) -> bool {
        self.state
            .compare_exchange(PROCESSED, PERSIST, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn op_type(&self) -> OpType {
        self.op
            .lock()
            .as_ref()
            .map(StoreOp::op_type)
            .unwrap_or(OpType::NoOp)
    }

    pub fn with_op<R>(&self, f: impl FnOnce(&mut Option<StoreOp>) -> R) -> R {
        f(&mut self.op.lock())
    }

    pub fn cloned_op(&self) -> Option<StoreOp> {
        self.op.lock().clone()
    }

    /// Turn the operation into a no-op
    pub fn cancel(&self) {
        *self.op.lock() = None;
    }

    pub(crate) fn take_op(&self) -> Option<StoreOp> {
        self.op.lock().take()
    }

    pub(crate) fn set_failure(&self, reason: String) {
        *self.failure.lock() = Some(reason);
    }

    pub(crate) fn take_failure(&self) -> Option<String> {
        self.failure.lock().take()
    }

    pub(crate) fn clear(&self) {
        *self.op.lock() = None;
        *self.failure.lock() = None;
        self.state.store(AVAILABLE, Ordering::Release);
    }
}

pub struct RingBuffer {
    slots: Box<[Slot]>,
    mask: usize,
}

impl RingBuffer {
    pub fn new(size: usize) -> Result<Self, StorageError> {
        if size == 0 || !size.is_power_of_two() {
            return Err(StorageError::Backend(format!(
                "Ring buffer size must be a power of two, got {}",
                size
            )));
        }
        let slots = (0..size).map(|_| Slot::new()).collect::<Vec<_>>();
        Ok(Self {
            slots: slots.into_boxed_slice(),
            mask: size - 1,
        })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, sequence: i64) -> &Slot {
        &self.slots[(sequence as usize) & self.mask]
    }

    /// Slot holding `sequence`, if it has not been reused since
    pub fn get_live(&self, sequence: i64) -> Option<&Slot> {
        let slot = self.get(sequence);
        (slot.sequence() == sequence).then_some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_must_be_power_of_two() {
        assert!(RingBuffer::new(6).is_err());
        assert!(RingBuffer::new(0).is_err());
        assert_eq!(RingBuffer::new(8).unwrap().size(), 8);
    }

    #[test]
    fn test_slot_state_handoff() {
        let ring = RingBuffer::new(4).unwrap();
        let slot = ring.get(5);
        slot.write(5, StoreOp::Delete { id: 1 });

        assert!(!slot.acquire_for_persisting());
        slot.complete_processing();
        assert!(slot.acquire_to_process());
        assert!(!slot.acquire_for_persisting());
        slot.complete_processing();
        assert!(slot.acquire_for_persisting());
        assert!(!slot.acquire_to_process());

        assert!(ring.get_live(5).is_some());
        assert!(ring.get_live(1).is_none());
        assert_eq!(slot.op_type(), OpType::Delete);
        slot.clear();
        assert_eq!(slot.op_type(), OpType::NoOp);
    }
}
