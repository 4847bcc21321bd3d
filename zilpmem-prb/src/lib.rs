//! Persistent-memory backed ZIL ring buffer (PRB).
//!
//! This crate implements the intent-log core for byte-addressable
//! persistent memory: a multi-writer, multi-log append engine that records
//! synchronous write intents durably, survives power failure without
//! block-device atomicity, and on pool import reconstructs exactly the set
//! of entries that must be replayed.
//!
//! # Entry format
//!
//! An entry is a 256 byte header followed by the body, zero padded to the
//! next 256 byte boundary. The header stores the log identity (objset id
//! and a 128 bit log GUID), the ordering key `(gen, gen_scoped_id)`, the
//! txg, a dependency record describing the previous generation's per-txg
//! entry counts, and two Fletcher-4 checksums (body, and whole header with
//! the checksum field zeroed). Every identity field of a published header
//! is nonzero; see [`file_formats`].
//!
//! # Crash consistency
//!
//! Appends are two-phase: phase one writes the body and zeroes the header
//! slot of the *next* entry, then drains; phase two publishes the 256 byte
//! header, then drains. Because 8 byte aligned stores are powerfail atomic,
//! a crash leaves the header either zero, complete, or torn with at least
//! one zero identity field; traversal treats all but the complete case as
//! the end of the chunk. No checksum is needed for crash consistency, the
//! checksums only guard against bit rot.
//!
//! # Ordering without a global sequence number
//!
//! Each log hands out a strictly increasing `(gen, gen_scoped_id)` pair
//! under a short per-log lock, and every entry carries a record of how many
//! entries of the previous generation were written per open txg. Replay
//! sorts by the pair and verifies the counts, which proves completeness of
//! the recovered chain without any cross-log coordination on the hot path;
//! see [`deptrack`] and [`replay`].
//!
//! # Garbage collection
//!
//! Chunks park in one of four full lists indexed by `max_txg % 4`. The
//! enclosing filesystem keeps at most three txgs unsynced, so `gc(txg)`
//! reclaims one whole bucket without sorting. Chunks retained by a
//! replaying log are refcounted and skipped; see [`Prb::gc`].

#![deny(unsafe_op_in_unsafe_fn)]

pub mod chunk;
pub mod deptrack;
pub mod file_formats;
pub mod fletcher;
pub mod pmem;
pub mod replay;

mod chunk_store;
mod committer;
mod prb;
mod sync;

pub use chunk::{ChunkIter, ChunkIterError, PrbChunk};
pub use committer::MAX_COMMITTER_SLOTS;
pub use deptrack::{DeptrackCount, ReplayState, TXG_CONCURRENT_STATES};
pub use file_formats::{
    EntryDep, EntryHeaderData, ReplayStatePhys, TxgCount, ZilHeaderError, ZilHeaderPmem,
    ZilHeaderState, ENTRY_HEADER_SIZE, TXG_SIZE,
};
pub use fletcher::fletcher4;
pub use pmem::{Aligned256, DramPmem, HeapRegion, MceError, Pmem};
pub use prb::{
    ClaimError, ClaimStore, Prb, PrbHandle, ReplayError, WriteError, WriteStats,
};
pub use replay::{ReadNodeError, ReplayNode, ReplayStructuralError};
