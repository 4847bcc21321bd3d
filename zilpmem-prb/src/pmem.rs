//! Minimal persistent-memory operation surface.
//!
//! The ring buffer only ever touches PMEM through four operations: 256 byte
//! granular non-temporal copies and zeroing without an ordering point, an
//! explicit `drain` (store fence), and machine-check safe loads. Everything
//! else is ordinary DRAM.
//!
//! [`DramPmem`] is the cache-coherent fallback used in userspace and tests.
//! A real PMEM backend would issue non-temporal stores and `sfence` here.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{fence, Ordering};

use anyhow::{bail, Error};

/// Store granularity of the PMEM abstraction. All copies and zeroing happen
/// in multiples of this, at destinations aligned to it.
pub const PMEM_GRANULARITY: usize = 256;

/// A load from PMEM hit a machine check (poisoned line).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("machine check exception while reading persistent memory")]
pub struct MceError;

pub trait Pmem: Send + Sync {
    /// Copy `len` bytes from DRAM at `src` to PMEM at `dst` without draining.
    ///
    /// # Safety
    ///
    /// `dst` must be [`PMEM_GRANULARITY`] aligned and `len` a multiple of it;
    /// `[dst, dst+len)` must lie in a region owned by the caller and
    /// `[src, src+len)` must be readable. The ranges must not overlap.
    unsafe fn memcpy256_nt_nodrain(&self, dst: *mut u8, src: *const u8, len: usize);

    /// Zero `len` bytes of PMEM at `dst` without draining.
    ///
    /// # Safety
    ///
    /// Same alignment and ownership requirements as
    /// [`Pmem::memcpy256_nt_nodrain`].
    unsafe fn memzero256_nt_nodrain(&self, dst: *mut u8, len: usize);

    /// Wait until all prior non-temporal stores of this thread are durable.
    fn drain(&self);

    /// Copy `len` bytes from PMEM at `src` to DRAM at `dst`, converting a
    /// machine check on a poisoned line into an error.
    ///
    /// # Safety
    ///
    /// `[src, src+len)` must lie in a registered region, `[dst, dst+len)`
    /// must be writable, and the ranges must not overlap.
    unsafe fn memcpy_mcsafe(&self, dst: *mut u8, src: *const u8, len: usize)
        -> Result<(), MceError>;
}

/// Cache-coherent stand-in backend. Plain stores, a full fence for `drain`,
/// loads that cannot machine-check.
pub struct DramPmem;

impl Pmem for DramPmem {
    unsafe fn memcpy256_nt_nodrain(&self, dst: *mut u8, src: *const u8, len: usize) {
        debug_assert_eq!(dst as usize % PMEM_GRANULARITY, 0);
        debug_assert_eq!(len % PMEM_GRANULARITY, 0);
        unsafe { std::ptr::copy_nonoverlapping(src, dst, len) }
    }

    unsafe fn memzero256_nt_nodrain(&self, dst: *mut u8, len: usize) {
        debug_assert_eq!(dst as usize % PMEM_GRANULARITY, 0);
        debug_assert_eq!(len % PMEM_GRANULARITY, 0);
        unsafe { std::ptr::write_bytes(dst, 0, len) }
    }

    fn drain(&self) {
        fence(Ordering::SeqCst);
    }

    unsafe fn memcpy_mcsafe(
        &self,
        dst: *mut u8,
        src: *const u8,
        len: usize,
    ) -> Result<(), MceError> {
        unsafe { std::ptr::copy_nonoverlapping(src, dst, len) };
        Ok(())
    }
}

/// A 256 byte aligned DRAM staging block.
#[derive(Clone)]
#[repr(C, align(256))]
pub struct Aligned256(pub [u8; PMEM_GRANULARITY]);

impl Aligned256 {
    pub fn zeroed() -> Box<Self> {
        Box::new(Self([0u8; PMEM_GRANULARITY]))
    }
}

/// A zero-initialized, 256 byte aligned heap allocation usable as a PMEM
/// stand-in region for userspace consumers and tests.
pub struct HeapRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The region is plain memory; all mutation goes through raw pointers handed
// to the chunk layer, which enforces single-writer access per chunk.
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    pub fn alloc(len: usize) -> Result<Self, Error> {
        if len == 0 {
            bail!("zero-sized pmem region");
        }
        let layout = match Layout::from_size_align(len, PMEM_GRANULARITY) {
            Ok(layout) => layout,
            Err(err) => bail!("invalid pmem region size {len} - {err}"),
        };
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => handle_alloc_error(layout),
        };
        Ok(Self { ptr, layout })
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn heap_region_is_aligned_and_zeroed() {
        let region = HeapRegion::alloc(4096).unwrap();
        assert_eq!(region.as_mut_ptr() as usize % PMEM_GRANULARITY, 0);
        assert_eq!(region.len(), 4096);
        let slice = unsafe { std::slice::from_raw_parts(region.as_mut_ptr(), region.len()) };
        assert!(slice.iter().all(|b| *b == 0));
    }

    #[test]
    fn dram_pmem_copies() {
        let region = HeapRegion::alloc(512).unwrap();
        let pmem = DramPmem;
        let src = [0xabu8; 256];
        unsafe { pmem.memcpy256_nt_nodrain(region.as_mut_ptr(), src.as_ptr(), 256) };
        pmem.drain();
        let mut back = [0u8; 256];
        unsafe {
            pmem.memcpy_mcsafe(back.as_mut_ptr(), region.as_mut_ptr(), 256)
                .unwrap()
        };
        assert_eq!(back, src);
        unsafe { pmem.memzero256_nt_nodrain(region.as_mut_ptr(), 256) };
        pmem.drain();
        unsafe {
            pmem.memcpy_mcsafe(back.as_mut_ptr(), region.as_mut_ptr(), 256)
                .unwrap()
        };
        assert_eq!(back, [0u8; 256]);
    }
}
