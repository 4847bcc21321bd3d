//! Chunk lifecycle management.
//!
//! All lifecycle lists live under one mutex with one condvar for free-chunk
//! availability: `free` feeds the append path, `full[txg % 4]` parks
//! exhausted chunks until their txg syncs, `waitclaim` holds chunks
//! registered after import until they have been surveyed, and `claimed`
//! holds chunks retained by replaying logs. `all` tracks every registered
//! chunk for iteration and ownership handback.
//!
//! The four-way `full` bucketization works because the enclosing filesystem
//! keeps at most [`TXG_CONCURRENT_STATES`](crate::file_formats::TXG_CONCURRENT_STATES)
//! txgs unsynced: chunks with the same txg residue are reclaimable together,
//! so `gc(txg)` is one bucket drain instead of a sort.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::chunk::PrbChunk;
use crate::file_formats::{TXG_MASK, TXG_SIZE};
use crate::pmem::Pmem;

struct StoreInner {
    all: Vec<Arc<PrbChunk>>,
    free: VecDeque<Arc<PrbChunk>>,
    waitclaim: Vec<Arc<PrbChunk>>,
    claimed: Vec<Arc<PrbChunk>>,
    full: [Vec<Arc<PrbChunk>>; TXG_SIZE],
    min_chunk_size: u64,
    no_more_gc: bool,
}

pub(crate) struct ChunkStore {
    inner: Mutex<StoreInner>,
    chunk_avail: Condvar,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                all: Vec::new(),
                free: VecDeque::new(),
                waitclaim: Vec::new(),
                claimed: Vec::new(),
                full: Default::default(),
                min_chunk_size: u64::MAX,
                no_more_gc: false,
            }),
            chunk_avail: Condvar::new(),
        }
    }

    /// Register a chunk for appending. Its first header slot is zeroed so the
    /// first append overwrites zeroes.
    pub fn add_for_write(&self, pmem: &dyn Pmem, chunk: Arc<PrbChunk>) {
        chunk.reset_for_reuse(pmem);

        let mut inner = self.inner.lock().unwrap();
        inner.min_chunk_size = inner.min_chunk_size.min(chunk.len() as u64);
        inner.free.push_back(Arc::clone(&chunk));
        inner.all.push(chunk);
        self.chunk_avail.notify_all();
    }

    /// Register a chunk that may contain pre-crash entries. Must happen
    /// before any log starts writing, so the survey sees a stable image.
    pub fn add_for_claim(&self, chunk: Arc<PrbChunk>) {
        let mut inner = self.inner.lock().unwrap();
        inner.min_chunk_size = inner.min_chunk_size.min(chunk.len() as u64);
        inner.waitclaim.push(Arc::clone(&chunk));
        inner.all.push(chunk);
    }

    /// Pop a free chunk, optionally blocking until one becomes available.
    /// Counts the number of waits into `sleeps`.
    pub fn get_chunk(&self, sleep: bool, sleeps: &mut u64) -> Option<Arc<PrbChunk>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(chunk) = inner.free.pop_front() {
                debug_assert_eq!(chunk.max_txg(), 0);
                debug_assert!(chunk.is_empty());
                return Some(chunk);
            }
            if !sleep {
                return None;
            }
            *sleeps += 1;
            inner = self.chunk_avail.wait(inner).unwrap();
        }
    }

    /// Park an exhausted chunk in the full bucket of its highest txg.
    pub fn move_to_full(&self, chunk: Arc<PrbChunk>) {
        let mut inner = self.inner.lock().unwrap();
        let bucket = (chunk.max_txg() & TXG_MASK) as usize;
        inner.full[bucket].push(chunk);
    }

    /// Reclaim every full chunk whose contents synced out with `txg`, plus
    /// any surveyed or claimed chunk no replaying log holds anymore.
    pub fn gc(&self, pmem: &dyn Pmem, txg: u64) {
        let mut inner = self.inner.lock().unwrap();
        assert!(!inner.no_more_gc, "gc after promise_no_more_gc");

        let mut freed = false;

        let bucket = std::mem::take(&mut inner.full[(txg & TXG_MASK) as usize]);
        for chunk in bucket {
            assert_eq!(chunk.max_txg() & TXG_MASK, txg & TXG_MASK);
            assert!(chunk.max_txg() <= txg);
            chunk.reset_for_reuse(pmem);
            inner.free.push_front(chunk);
            freed = true;
        }

        let waitclaim = std::mem::take(&mut inner.waitclaim);
        for chunk in waitclaim {
            if chunk.is_held() {
                inner.waitclaim.push(chunk);
            } else {
                chunk.reset_for_reuse(pmem);
                inner.free.push_back(chunk);
                freed = true;
            }
        }
        let claimed = std::mem::take(&mut inner.claimed);
        for chunk in claimed {
            if chunk.is_held() {
                inner.claimed.push(chunk);
            } else {
                chunk.reset_for_reuse(pmem);
                inner.free.push_back(chunk);
                freed = true;
            }
        }

        if freed {
            self.chunk_avail.notify_all();
        }
    }

    pub fn promise_no_more_gc(&self) {
        self.inner.lock().unwrap().no_more_gc = true;
    }

    pub fn no_more_gc_promised(&self) -> bool {
        self.inner.lock().unwrap().no_more_gc
    }

    /// The smallest registered chunk bounds the largest admissible entry.
    pub fn min_chunk_size(&self) -> u64 {
        self.inner.lock().unwrap().min_chunk_size
    }

    /// Snapshot of the chunks awaiting claim survey.
    pub fn waitclaim_chunks(&self) -> Vec<Arc<PrbChunk>> {
        self.inner.lock().unwrap().waitclaim.clone()
    }

    /// Move chunks a log retained during claim from `waitclaim` to `claimed`.
    pub fn move_waitclaim_to_claimed(&self, retained: &[Arc<PrbChunk>]) {
        let mut inner = self.inner.lock().unwrap();
        for chunk in retained {
            if let Some(pos) = inner
                .waitclaim
                .iter()
                .position(|c| Arc::ptr_eq(c, chunk))
            {
                let chunk = inner.waitclaim.remove(pos);
                inner.claimed.push(chunk);
            }
        }
    }

    /// Every registered chunk, for iteration by debug tooling.
    pub fn all_chunks(&self) -> Vec<Arc<PrbChunk>> {
        self.inner.lock().unwrap().all.clone()
    }

    /// Hand every registered chunk back to the caller, emptying all lists.
    pub fn take_chunks(&self) -> Vec<Arc<PrbChunk>> {
        let mut inner = self.inner.lock().unwrap();
        inner.free.clear();
        inner.waitclaim.clear();
        inner.claimed.clear();
        for bucket in inner.full.iter_mut() {
            bucket.clear();
        }
        inner.min_chunk_size = u64::MAX;
        std::mem::take(&mut inner.all)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::file_formats::{EntryDep, EntryHeaderData};
    use crate::pmem::{Aligned256, DramPmem, HeapRegion};

    fn chunk_in(region: &HeapRegion) -> Arc<PrbChunk> {
        Arc::new(unsafe { PrbChunk::new(region.as_mut_ptr(), region.len()) })
    }

    fn append_at_txg(chunk: &PrbChunk, txg: u64) {
        let hdr = EntryHeaderData {
            objset_id: 1,
            zil_guid_1: 1,
            zil_guid_2: 1,
            txg,
            gen: 1,
            gen_scoped_id: 1,
            body_len: 0,
            dep: EntryDep::default(),
            body_csum: [0; 4],
            header_csum: [0; 4],
        };
        let mut staging_header = Aligned256::zeroed();
        let mut staging_tail = Aligned256::zeroed();
        if chunk
            .write_entry(&DramPmem, hdr, &[1u8], &mut staging_header, &mut staging_tail)
            .is_err()
        {
            panic!("chunk full");
        }
    }

    #[test]
    fn add_for_write_feeds_get_chunk() {
        let region = HeapRegion::alloc(4096).unwrap();
        let store = ChunkStore::new();
        assert_eq!(store.min_chunk_size(), u64::MAX);

        let mut sleeps = 0;
        assert!(store.get_chunk(false, &mut sleeps).is_none());

        store.add_for_write(&DramPmem, chunk_in(&region));
        assert_eq!(store.min_chunk_size(), 4096);
        let chunk = store.get_chunk(false, &mut sleeps).unwrap();
        assert!(chunk.is_empty());
        assert!(store.get_chunk(false, &mut sleeps).is_none());
        assert_eq!(sleeps, 0);
    }

    #[test]
    fn gc_reclaims_full_bucket() {
        let region = HeapRegion::alloc(4096).unwrap();
        let store = ChunkStore::new();
        store.add_for_write(&DramPmem, chunk_in(&region));

        let mut sleeps = 0;
        let chunk = store.get_chunk(false, &mut sleeps).unwrap();
        append_at_txg(&chunk, 5);
        store.move_to_full(chunk);

        store.gc(&DramPmem, 4); // wrong bucket, nothing freed
        assert!(store.get_chunk(false, &mut sleeps).is_none());
        store.gc(&DramPmem, 5);
        let chunk = store.get_chunk(false, &mut sleeps).unwrap();
        assert_eq!(chunk.max_txg(), 0);
    }

    #[test]
    fn gc_skips_held_waitclaim_chunks() {
        let region = HeapRegion::alloc(4096).unwrap();
        let store = ChunkStore::new();
        let chunk = chunk_in(&region);
        store.add_for_claim(Arc::clone(&chunk));

        chunk.hold();
        store.gc(&DramPmem, 1);
        let mut sleeps = 0;
        assert!(store.get_chunk(false, &mut sleeps).is_none());

        chunk.release_hold();
        store.gc(&DramPmem, 1);
        assert!(store.get_chunk(false, &mut sleeps).is_some());
    }

    #[test]
    #[should_panic(expected = "gc after promise_no_more_gc")]
    fn gc_after_promise_panics() {
        let store = ChunkStore::new();
        store.promise_no_more_gc();
        store.gc(&DramPmem, 1);
    }
}
