//! Committer slots: the bounded pool of per-writer staging state.
//!
//! Admission is two-level. A counted semaphore bounds the number of threads
//! inside the pool to the slot count; a lock-free bitset then assigns each
//! admitted thread the lowest clear slot index. The semaphore guarantees the
//! CAS loop terminates: once admitted, some bit must be clear.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::chunk::PrbChunk;
use crate::pmem::Aligned256;
use crate::sync::Semaphore;

/// The bitset is one u64 wide; one bit stays reserved so the all-set mask
/// never overflows the shift.
pub const MAX_COMMITTER_SLOTS: usize = 63;

/// Per-slot staging state. The chunk is the slot's current append target,
/// acquired lazily; the two blocks stage the header and the body tail in
/// DRAM so each becomes a single 256 byte non-temporal copy to PMEM.
pub(crate) struct CommitterSlot {
    pub chunk: Option<Arc<PrbChunk>>,
    pub staging_header: Box<Aligned256>,
    pub staging_tail: Box<Aligned256>,
}

pub(crate) struct CommitterPool {
    slots: Vec<Mutex<CommitterSlot>>,
    bitset: AtomicU64,
    sem: Semaphore,
}

impl CommitterPool {
    pub fn new(ncommitters: usize) -> Self {
        assert!(
            ncommitters >= 1 && ncommitters <= MAX_COMMITTER_SLOTS,
            "ncommitters must be in 1..={}",
            MAX_COMMITTER_SLOTS
        );
        let slots = (0..ncommitters)
            .map(|_| {
                Mutex::new(CommitterSlot {
                    chunk: None,
                    staging_header: Aligned256::zeroed(),
                    staging_tail: Aligned256::zeroed(),
                })
            })
            .collect();
        Self {
            slots,
            bitset: AtomicU64::new(0),
            sem: Semaphore::new(ncommitters as u64),
        }
    }

    pub fn ncommitters(&self) -> usize {
        self.slots.len()
    }

    /// Wait for admission, then claim the lowest clear slot bit.
    pub fn acquire(&self) -> CommitterGuard<'_> {
        self.sem.wait();

        let mask = (1u64 << self.slots.len()) - 1;
        let mut slots = self.bitset.load(Ordering::SeqCst);
        loop {
            debug_assert_eq!(slots & !mask, 0);
            // the semaphore admitted us, so a bit is clear
            let idx = (!slots).trailing_zeros() as usize;
            debug_assert!(idx < self.slots.len());
            let slot_mask = 1u64 << idx;
            match self.bitset.compare_exchange(
                slots,
                slots | slot_mask,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return CommitterGuard { pool: self, idx },
                Err(current) => slots = current,
            }
        }
    }
}

/// Exclusive ownership of one committer slot; released on drop.
pub(crate) struct CommitterGuard<'a> {
    pool: &'a CommitterPool,
    idx: usize,
}

impl CommitterGuard<'_> {
    pub fn index(&self) -> usize {
        self.idx
    }

    pub fn slot(&self) -> MutexGuard<'_, CommitterSlot> {
        // the bitset already made us the only owner; the mutex only encodes
        // that exclusivity for the type system and is never contended
        self.pool.slots[self.idx]
            .try_lock()
            .expect("committer slot bitset guarantees exclusive access")
    }
}

impl Drop for CommitterGuard<'_> {
    fn drop(&mut self) {
        let slot_mask = 1u64 << self.idx;
        let prev = self.pool.bitset.fetch_and(!slot_mask, Ordering::SeqCst);
        debug_assert_ne!(prev & slot_mask, 0);
        self.pool.sem.post();
    }
}
