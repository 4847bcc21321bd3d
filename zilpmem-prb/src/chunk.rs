//! Chunks and the entry-level traversal over them.
//!
//! A chunk is a power-of-two sized, 256 byte aligned span of PMEM. Entries
//! are appended back to back at 256 byte granularity; the append protocol
//! keeps the header slot at the cursor zeroed so that traversal after a
//! crash stops at the first unpublished entry.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::file_formats::{
    compute_header_csum, patch_header_csum, EntryHeaderData, ENTRY_HEADER_SIZE,
};
use crate::fletcher::fletcher4;
use crate::pmem::{Aligned256, MceError, Pmem};

fn check_span_params(base: *const u8, len: usize) {
    assert!(!base.is_null());
    assert_eq!(
        base as usize % ENTRY_HEADER_SIZE,
        0,
        "chunk base must be {} byte aligned",
        ENTRY_HEADER_SIZE
    );
    assert!(len.is_power_of_two(), "chunk size must be a power of two");
    assert!(
        len > ENTRY_HEADER_SIZE,
        "chunk must have room for a non-empty body"
    );
}

/// Returned by the raw append when the entry does not fit the chunk.
pub(crate) struct NoSpace;

/// A contiguous PMEM region entries are appended to.
///
/// A chunk is mutated by at most one committer at a time: the append path
/// owns it exclusively between taking it from the free list and parking it
/// in a full list. `holds` counts replaying logs that reference entries in
/// the chunk; garbage collection skips held chunks.
#[derive(Debug)]
pub struct PrbChunk {
    base: *mut u8,
    len: usize,
    /// Append cursor as an offset from `base`, always a multiple of 256.
    cur: AtomicUsize,
    /// Largest txg of any entry appended since the last reset.
    max_txg: AtomicU64,
    holds: AtomicU64,
}

// The chunk points into caller-provided PMEM. Cross-thread handover goes
// through the chunk store mutex; the append path is single-writer.
unsafe impl Send for PrbChunk {}
unsafe impl Sync for PrbChunk {}

impl PrbChunk {
    /// # Safety
    ///
    /// `[base, base+len)` must be a valid PMEM (or stand-in) span, exclusively
    /// owned by the ring buffer this chunk is registered with, and must
    /// outlive the chunk.
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        check_span_params(base, len);
        Self {
            base,
            len,
            cur: AtomicUsize::new(0),
            max_txg: AtomicU64::new(0),
            holds: AtomicU64::new(0),
        }
    }

    pub fn base(&self) -> *const u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.cur.load(Ordering::Relaxed) == 0
    }

    /// Current append offset from the chunk base.
    pub fn cur_offset(&self) -> usize {
        self.cur.load(Ordering::Relaxed)
    }

    pub fn max_txg(&self) -> u64 {
        self.max_txg.load(Ordering::Relaxed)
    }

    pub fn contains_ptr(&self, ptr: *const u8) -> bool {
        let base = self.base as usize;
        let p = ptr as usize;
        p >= base && p < base + self.len
    }

    fn has_space(&self, nbytes: usize) -> bool {
        self.cur.load(Ordering::Relaxed) + nbytes <= self.len
    }

    pub(crate) fn hold(&self) {
        self.holds.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release_hold(&self) {
        let prev = self.holds.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "chunk hold count underflow");
    }

    pub(crate) fn is_held(&self) -> bool {
        self.holds.load(Ordering::SeqCst) > 0
    }

    /// Zero the first header slot and reset accounting. Afterwards the chunk
    /// is indistinguishable from a freshly registered one: traversal stops
    /// immediately and appends start at the base.
    pub(crate) fn reset_for_reuse(&self, pmem: &dyn Pmem) {
        unsafe { pmem.memzero256_nt_nodrain(self.base, ENTRY_HEADER_SIZE) };
        pmem.drain();
        self.cur.store(0, Ordering::Relaxed);
        self.max_txg.store(0, Ordering::Relaxed);
    }

    /// Whether the header slot at the cursor reads back as all zero. The
    /// append protocol maintains this between entries.
    pub(crate) fn is_zeroed_at_cur(&self) -> bool {
        let cur = self.cur.load(Ordering::Relaxed);
        let rlen = (self.len - cur).min(ENTRY_HEADER_SIZE);
        debug_assert!(rlen == 0 || rlen == ENTRY_HEADER_SIZE);
        let mut buf = [0u8; ENTRY_HEADER_SIZE];
        unsafe { std::ptr::copy_nonoverlapping(self.base.add(cur) as *const u8, buf.as_mut_ptr(), rlen) };
        buf[..rlen].iter().all(|b| *b == 0)
    }

    /// Append one entry with the two-phase crash-consistent protocol.
    ///
    /// Phase 1 writes the body and zeroes the follow header slot, then
    /// drains. Phase 2 publishes the 256 byte header, then drains. A crash
    /// before phase 2 completes leaves a header that is zero or torn; either
    /// way at least one identity field is zero (8 byte stores are powerfail
    /// atomic) and traversal skips the entry and the rest of the chunk.
    ///
    /// `hdr` carries the identity fields; body length and both checksums are
    /// filled in here. Returns the PMEM address of the published header.
    pub(crate) fn write_entry(
        &self,
        pmem: &dyn Pmem,
        mut hdr: EntryHeaderData,
        body: &[u8],
        staging_header: &mut Aligned256,
        staging_tail: &mut Aligned256,
    ) -> Result<*const u8, NoSpace> {
        // nonzeroness is part of the on-PMEM format
        assert!(!body.is_empty());
        assert!(hdr.txg != 0);
        assert!(hdr.gen != 0);
        assert!(hdr.gen_scoped_id != 0);
        assert!(hdr.zil_guid_1 != 0);
        assert!(hdr.zil_guid_2 != 0);
        assert!(hdr.objset_id != 0);

        let body_len = body.len();
        let resid = body_len % ENTRY_HEADER_SIZE;
        let bulk = body_len - resid;
        let entry_space =
            (ENTRY_HEADER_SIZE + body_len + (ENTRY_HEADER_SIZE - 1)) & !(ENTRY_HEADER_SIZE - 1);
        debug_assert_eq!(entry_space % ENTRY_HEADER_SIZE, 0);
        debug_assert!(entry_space >= 2 * ENTRY_HEADER_SIZE);

        if !self.has_space(entry_space) {
            return Err(NoSpace);
        }

        let cur = self.cur.load(Ordering::Relaxed);
        let header_pmem = unsafe { self.base.add(cur) };
        debug_assert_eq!(header_pmem as usize % ENTRY_HEADER_SIZE, 0);
        debug_assert!(
            self.is_zeroed_at_cur(),
            "header slot must be zero before publication"
        );

        // build the header in DRAM and checksum it
        hdr.body_len = body_len as u64;
        hdr.body_csum = fletcher4(body);
        hdr.header_csum = [0; 4];
        hdr.write_to_block(&mut staging_header.0);
        let header_csum = compute_header_csum(&staging_header.0);
        patch_header_csum(&mut staging_header.0, &header_csum);

        // stage the body tail plus padding as one 256 byte block
        staging_tail.0.fill(0);
        staging_tail.0[..resid].copy_from_slice(&body[bulk..]);

        // phase 1: zero the follow header slot, write the body
        let next_cur = cur + entry_space;
        let rlen = (self.len - next_cur).min(ENTRY_HEADER_SIZE);
        debug_assert_eq!(rlen % ENTRY_HEADER_SIZE, 0);
        if rlen > 0 {
            unsafe { pmem.memzero256_nt_nodrain(self.base.add(next_cur), rlen) };
        }
        unsafe {
            pmem.memcpy256_nt_nodrain(header_pmem.add(ENTRY_HEADER_SIZE), body.as_ptr(), bulk)
        };
        if resid > 0 {
            unsafe {
                pmem.memcpy256_nt_nodrain(
                    header_pmem.add(ENTRY_HEADER_SIZE + bulk),
                    staging_tail.0.as_ptr(),
                    ENTRY_HEADER_SIZE,
                )
            };
        }
        pmem.drain();

        // phase 2: publish the header
        unsafe {
            pmem.memcpy256_nt_nodrain(header_pmem, staging_header.0.as_ptr(), ENTRY_HEADER_SIZE)
        };
        pmem.drain();

        self.cur.store(next_cur, Ordering::Relaxed);
        self.max_txg.fetch_max(hdr.txg, Ordering::Relaxed);

        Ok(header_pmem as *const u8)
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkIterError {
    #[error(transparent)]
    Mce(#[from] MceError),
    #[error("entry header checksum mismatch")]
    HeaderChecksum,
    #[error("entry header has a zero log guid")]
    InvalidLogGuid,
    #[error("entry header has a zero body length")]
    InvalidLen,
    #[error("entry body exceeds the chunk bounds")]
    BodyOutOfBounds,
}

/// Walks the entries of one chunk-sized PMEM span.
///
/// Any error ends the walk for the whole chunk: the position of the next
/// header is only defined if every prior entry's length was read intact. In
/// particular an all-zero (unpublished or torn) header surfaces as
/// [`ChunkIterError::InvalidLogGuid`], which is how traversal stops at the
/// crash point.
pub struct ChunkIter<'a> {
    cur: *const u8,
    end: *const u8,
    pmem: &'a dyn Pmem,
}

impl<'a> ChunkIter<'a> {
    /// # Safety
    ///
    /// `[base, base+len)` must be a valid chunk span, not concurrently
    /// written, outliving the iterator.
    pub unsafe fn new(base: *const u8, len: usize, pmem: &'a dyn Pmem) -> Self {
        check_span_params(base, len);
        Self {
            cur: base,
            end: unsafe { base.add(len) },
            pmem,
        }
    }

    /// The next structurally valid entry: its PMEM address and parsed
    /// header. `Ok(None)` is the clean end of the chunk.
    pub fn next_entry(&mut self) -> Result<Option<(*const u8, EntryHeaderData)>, ChunkIterError> {
        if self.cur >= self.end {
            return Ok(None);
        }
        debug_assert_eq!(self.cur as usize % ENTRY_HEADER_SIZE, 0);

        let mut block = [0u8; ENTRY_HEADER_SIZE];
        unsafe {
            self.pmem
                .memcpy_mcsafe(block.as_mut_ptr(), self.cur, ENTRY_HEADER_SIZE)?
        };
        let hdr = EntryHeaderData::read_from_block(&block);

        if compute_header_csum(&block) != hdr.header_csum {
            return Err(ChunkIterError::HeaderChecksum);
        }
        if hdr.zil_guid_1 == 0 || hdr.zil_guid_2 == 0 {
            return Err(ChunkIterError::InvalidLogGuid);
        }
        if hdr.body_len == 0 {
            return Err(ChunkIterError::InvalidLen);
        }

        let avail = (self.end as usize - self.cur as usize - ENTRY_HEADER_SIZE) as u64;
        if hdr.body_len > avail {
            return Err(ChunkIterError::BodyOutOfBounds);
        }

        let entry = self.cur;
        let advance = (ENTRY_HEADER_SIZE + hdr.body_len as usize + (ENTRY_HEADER_SIZE - 1))
            & !(ENTRY_HEADER_SIZE - 1);
        debug_assert!(advance <= self.end as usize - self.cur as usize);
        self.cur = unsafe { self.cur.add(advance) };

        Ok(Some((entry, hdr)))
    }
}
