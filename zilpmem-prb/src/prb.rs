//! The ring buffer container, per-log handles, and the public operations:
//! append, garbage collection, claim, replay, and log lifecycle.

use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::chunk::{NoSpace, PrbChunk};
use crate::chunk_store::ChunkStore;
use crate::committer::CommitterPool;
use crate::deptrack::{do_deptrack, DeptrackOutcome, ReplayState};
use crate::file_formats::{EntryHeaderData, ZilHeaderError, ZilHeaderPmem, ZilHeaderState};
use crate::pmem::Pmem;
use crate::replay::{
    find_replay_nodes_in_chunk, replay_resume, ReplayNode, ReplayNodeTree, ReplayStructuralError,
    ResumeOutcome,
};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// The txg is already outside the concurrent-txg window; the caller must
    /// drop this commit, not retry it.
    #[error("txg is already outside the concurrent txg window")]
    Obsolete,
    /// Non-blocking append found no free chunk.
    #[error("no free chunk available without sleeping")]
    WouldBlock,
}

#[derive(thiserror::Error, Debug)]
pub enum ClaimError {
    #[error("querying the claim store failed: {0}")]
    NeedsStoreClaim(#[source] anyhow::Error),
    #[error("recording a claim failed: {0}")]
    StoreClaim(#[source] anyhow::Error),
    /// An entry still needs a space-accounting claim although the header
    /// says claiming already completed.
    #[error("entry needs claiming although the header is in replaying state")]
    NeedsClaimingDuringReplay,
    #[error("log is not structurally replayable: {0}")]
    Structural(#[from] ReplayStructuralError),
    #[error(transparent)]
    InvalidHeader(#[from] ZilHeaderError),
}

#[derive(thiserror::Error, Debug)]
pub enum ReplayError {
    #[error("replay function failed: {0}")]
    ReplayFunc(#[source] anyhow::Error),
    #[error("log is not structurally replayable: {0}")]
    Structural(#[from] ReplayStructuralError),
}

/// Space accounting hooks consulted during claim. `needs_store_claim` says
/// whether an entry's blocks still have to be recorded with the pool;
/// `claim` records them so garbage collection keeps them until replay.
pub trait ClaimStore {
    fn needs_store_claim(&mut self, node: &ReplayNode) -> anyhow::Result<bool>;
    fn claim(&mut self, node: &ReplayNode) -> anyhow::Result<()>;
}

/// Per-append statistics.
#[derive(Serialize, Clone, Copy, Debug, Default)]
pub struct WriteStats {
    pub committer_slot: u64,
    pub get_chunk_calls: u64,
    pub get_chunk_sleeps: u64,
    pub beginning_new_gen: u64,
    pub obsolete: u64,
    /// PMEM address of the published entry header.
    pub entry_pmem_base: Option<usize>,
}

/// The process-wide ring buffer: owns the chunks, the committer slots and
/// the per-objset handle registry. Explicitly allocated and passed around;
/// there are no globals.
pub struct Prb {
    pmem: Arc<dyn Pmem>,
    committers: CommitterPool,
    chunks: ChunkStore,
    objsets: Mutex<BTreeSet<u64>>,
}

impl Prb {
    pub fn new(ncommitters: usize, pmem: Arc<dyn Pmem>) -> Arc<Self> {
        Arc::new(Self {
            pmem,
            committers: CommitterPool::new(ncommitters),
            chunks: ChunkStore::new(),
            objsets: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn ncommitters(&self) -> usize {
        self.committers.ncommitters()
    }

    /// Register a chunk for appending. The chunk's first header slot is
    /// zeroed before it becomes visible to writers.
    pub fn add_chunk_for_write(&self, chunk: Arc<PrbChunk>) {
        self.chunks.add_for_write(&*self.pmem, chunk);
    }

    /// Register a chunk that may hold pre-crash entries for claiming. Must
    /// only be called before any log starts writing.
    pub fn add_chunk_for_claim(&self, chunk: Arc<PrbChunk>) {
        self.chunks.add_for_claim(chunk);
    }

    /// Reclaim chunks whose entries all belong to txgs synced up to and
    /// including `txg`, plus surveyed chunks no log holds anymore.
    pub fn gc(&self, txg: u64) {
        self.chunks.gc(&*self.pmem, txg);
    }

    /// After this, [`Prb::gc`] must never be called again. Required before
    /// tearing down handles that keep claimed chunks.
    pub fn promise_no_more_gc(&self) {
        self.chunks.promise_no_more_gc();
    }

    /// The smallest registered chunk size; bodies may be at most this minus
    /// the 256 byte header.
    pub fn min_chunk_size(&self) -> u64 {
        self.chunks.min_chunk_size()
    }

    /// Every registered chunk, for debug tooling.
    pub fn all_chunks(&self) -> Vec<Arc<PrbChunk>> {
        self.chunks.all_chunks()
    }

    /// Hand all registered chunks back to the caller, e.g. to reuse the
    /// underlying PMEM ranges after dropping the ring buffer.
    pub fn take_chunks(&self) -> Vec<Arc<PrbChunk>> {
        self.chunks.take_chunks()
    }

    /// Create the handle through which one objset's log is operated.
    ///
    /// Panics if the objset is already set up; exactly one handle per objset
    /// may exist at a time.
    pub fn setup_objset(self: &Arc<Self>, objset_id: u64) -> PrbHandle {
        assert!(objset_id != 0, "objset id must be nonzero");
        let inserted = self.objsets.lock().unwrap().insert(objset_id);
        if !inserted {
            panic!("objset {objset_id} already set up, missing teardown?");
        }
        PrbHandle {
            prb: Arc::clone(self),
            objset_id,
            inner: Mutex::new(HandleState::Alloced),
        }
    }

    fn get_chunk_counted(&self, sleep: bool, stats: &mut WriteStats) -> Option<Arc<PrbChunk>> {
        stats.get_chunk_calls += 1;
        self.chunks.get_chunk(sleep, &mut stats.get_chunk_sleeps)
    }
}

impl Drop for Prb {
    fn drop(&mut self) {
        debug_assert!(
            self.objsets.lock().unwrap().is_empty(),
            "ring buffer dropped with live handles"
        );
    }
}

struct LoggingState {
    guid_1: u64,
    guid_2: u64,
    dt: ReplayState,
}

struct ReplayingState {
    guid_1: u64,
    guid_2: u64,
    state: ReplayState,
    held: Vec<Arc<PrbChunk>>,
}

enum HandleState {
    Alloced,
    Logging(LoggingState),
    Replaying(ReplayingState),
    Destroyed,
}

impl HandleState {
    fn name(&self) -> &'static str {
        match self {
            HandleState::Alloced => "alloced",
            HandleState::Logging(_) => "logging",
            HandleState::Replaying(_) => "replaying",
            HandleState::Destroyed => "destroyed",
        }
    }
}

/// Binds one objset's log identity to its dependency tracker and, during
/// replay, the set of retained chunks.
///
/// Lifecycle: `Alloced` after setup; `claim` moves to `Replaying` (or
/// `Destroyed` for a header without a log); `replay_done`, `destroy_log`
/// and an abandoning teardown move to `Destroyed`;
/// `create_log_if_not_exists` moves from `Destroyed` to `Logging`.
pub struct PrbHandle {
    prb: Arc<Prb>,
    objset_id: u64,
    inner: Mutex<HandleState>,
}

impl PrbHandle {
    pub fn objset_id(&self) -> u64 {
        self.objset_id
    }

    /// Durably append one entry, blocking for a free chunk if needed.
    pub fn write_entry(&self, txg: u64, needs_new_gen: bool, body: &[u8]) -> Result<(), WriteError> {
        self.write_entry_with_stats(txg, needs_new_gen, body, true, None)
    }

    /// Durably append one entry.
    ///
    /// The handle must be in the logging state. `needs_new_gen` starts a new
    /// ordering epoch; the first entry of a fresh log always does. With
    /// `may_sleep` unset, [`WriteError::WouldBlock`] is returned when no
    /// free chunk is available; note that the dependency counters have been
    /// advanced by then and are not rolled back, the caller must not reuse
    /// the txg slot assumption for a retry with different content.
    ///
    /// `body` must be nonempty and at most the smallest registered chunk
    /// size minus 256 bytes.
    pub fn write_entry_with_stats(
        &self,
        txg: u64,
        needs_new_gen: bool,
        body: &[u8],
        may_sleep: bool,
        stats_out: Option<&mut WriteStats>,
    ) -> Result<(), WriteError> {
        let mut stats = WriteStats::default();
        let res = self.write_impl(txg, needs_new_gen, body, may_sleep, &mut stats);
        if let Err(err) = &res {
            log::debug!("write_entry objset {}: {err}", self.objset_id);
        }
        if let Some(out) = stats_out {
            *out = stats;
        }
        res
    }

    fn write_impl(
        &self,
        txg: u64,
        needs_new_gen: bool,
        body: &[u8],
        may_sleep: bool,
        stats: &mut WriteStats,
    ) -> Result<(), WriteError> {
        assert!(!body.is_empty(), "entry body must be nonempty");

        // committer admission comes first; no other lock is held yet
        let cslot = self.prb.committers.acquire();
        stats.committer_slot = cslot.index() as u64;

        // identity assignment under the handle lock
        let (guid_1, guid_2, gen, id, dep) = {
            let mut inner = self.inner.lock().unwrap();
            let ls = match &mut *inner {
                HandleState::Logging(ls) => ls,
                other => panic!("write_entry in handle state {}", other.name()),
            };
            let active = &mut ls.dt.active;
            let last = &mut ls.dt.last;

            // a fresh log has no generation yet; its first entry starts one
            let new_gen = needs_new_gen || active.gen == 0;
            let gen = active.gen + u64::from(new_gen);
            if new_gen {
                // replay sorts by gen, wrapping would corrupt the order
                assert!(gen > active.gen, "generation counter wrapped");
            }
            let id = if active.gen == gen { active.last_id + 1 } else { 1 };

            match do_deptrack(active, last, txg, gen, id) {
                DeptrackOutcome::SameGen => {}
                DeptrackOutcome::BeganNewGen => stats.beginning_new_gen += 1,
                DeptrackOutcome::TxgShouldHaveSyncedAlready => {
                    stats.obsolete += 1;
                    return Err(WriteError::Obsolete);
                }
                DeptrackOutcome::ActiveHasNewerGen => {
                    panic!("caller must keep generation numbers monotonic")
                }
                DeptrackOutcome::ActiveHasNewerId => {
                    panic!("dependency tracker id bookkeeping violated")
                }
            }
            (ls.guid_1, ls.guid_2, gen, id, *last)
        };

        // PMEM write with only the committer slot held
        let mut slot_guard = cslot.slot();
        let slot = &mut *slot_guard;

        let mut fresh = false;
        if slot.chunk.is_none() {
            slot.chunk = self.prb.get_chunk_counted(may_sleep, stats);
            if slot.chunk.is_none() {
                return Err(WriteError::WouldBlock);
            }
            fresh = true;
        }

        loop {
            let hdr = EntryHeaderData {
                objset_id: self.objset_id,
                zil_guid_1: guid_1,
                zil_guid_2: guid_2,
                txg,
                gen,
                gen_scoped_id: id,
                body_len: 0,
                dep,
                body_csum: [0; 4],
                header_csum: [0; 4],
            };
            let res = slot.chunk.as_ref().unwrap().write_entry(
                &*self.prb.pmem,
                hdr,
                body,
                &mut slot.staging_header,
                &mut slot.staging_tail,
            );
            match res {
                Ok(entry_pmem) => {
                    stats.entry_pmem_base = Some(entry_pmem as usize);
                    return Ok(());
                }
                Err(NoSpace) => {
                    if fresh {
                        panic!(
                            "body of {} bytes can never fit, smallest chunk is {} bytes",
                            body.len(),
                            self.prb.chunks.min_chunk_size()
                        );
                    }
                    // park the exhausted chunk where gc will find it, its
                    // follow header slot is already zero
                    let full = slot.chunk.take().unwrap();
                    debug_assert!(full.is_zeroed_at_cur());
                    self.prb.chunks.move_to_full(full);

                    slot.chunk = self.prb.get_chunk_counted(may_sleep, stats);
                    if slot.chunk.is_none() {
                        return Err(WriteError::WouldBlock);
                    }
                    fresh = true;
                }
            }
        }
    }

    /// Largest txg any entry of this log was written with, 0 unless logging.
    pub fn max_written_txg(&self) -> u64 {
        match &*self.inner.lock().unwrap() {
            HandleState::Logging(ls) => ls.dt.active.max_txg(),
            _ => 0,
        }
    }

    /// Survey the waitclaim chunks for this log's entries, verify the chain
    /// is complete, and record block claims with the pool where needed.
    ///
    /// On success the handle retains every chunk holding one of the log's
    /// entries (garbage collection will skip them) and moves to the
    /// replaying state. On error the handle stays as allocated so the caller
    /// can decide between abandoning the claim and failing the import.
    pub fn claim(
        &self,
        header: &ZilHeaderPmem,
        pool_first_txg: u64,
        claimstore: &mut dyn ClaimStore,
    ) -> Result<(), ClaimError> {
        let mut inner = self.inner.lock().unwrap();
        match &*inner {
            HandleState::Alloced => (),
            other => panic!("claim in handle state {}", other.name()),
        }

        let header_state = header.state()?;
        let rst_initial = match header_state {
            ZilHeaderState::NoZil => {
                *inner = HandleState::Destroyed;
                return Ok(());
            }
            ZilHeaderState::Logging => ReplayState::init(pool_first_txg),
            ZilHeaderState::Replaying => ReplayState::from_phys(header.replay_state()),
        };
        let (guid_1, guid_2) = header.guids();

        let chunks = self.prb.chunks.waitclaim_chunks();
        let mut tree = ReplayNodeTree::new();
        for chunk in &chunks {
            find_replay_nodes_in_chunk(
                chunk,
                &*self.prb.pmem,
                guid_1,
                guid_2,
                self.objset_id,
                rst_initial.claim_txg,
                &mut tree,
            );
        }

        // dry-run the replay walk; for a log that crashed while logging this
        // is also where block claims are recorded
        let mut walk_state = rst_initial;
        let mut cb_err: Option<ClaimError> = None;
        let outcome = replay_resume(&tree, &mut walk_state, |node, _| {
            let needs = match claimstore.needs_store_claim(node) {
                Ok(needs) => needs,
                Err(err) => {
                    cb_err = Some(ClaimError::NeedsStoreClaim(err));
                    return ControlFlow::Break(());
                }
            };
            match header_state {
                ZilHeaderState::Logging => {
                    if needs {
                        if let Err(err) = claimstore.claim(node) {
                            cb_err = Some(ClaimError::StoreClaim(err));
                            return ControlFlow::Break(());
                        }
                    }
                    ControlFlow::Continue(())
                }
                ZilHeaderState::Replaying => {
                    if needs {
                        cb_err = Some(ClaimError::NeedsClaimingDuringReplay);
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                }
                ZilHeaderState::NoZil => unreachable!(),
            }
        });
        match outcome {
            ResumeOutcome::Done => (),
            ResumeOutcome::Stopped => {
                return Err(cb_err.expect("stopped walk recorded its error"))
            }
            ResumeOutcome::Structural(err) => return Err(err.into()),
        }

        // retain every chunk that holds one of our entries; released in
        // replay_done (or teardown)
        let mut held: Vec<Arc<PrbChunk>> = Vec::new();
        for node in tree.values() {
            if !held.iter().any(|c| Arc::ptr_eq(c, &node.chunk)) {
                node.chunk.hold();
                held.push(Arc::clone(&node.chunk));
            }
        }
        self.prb.chunks.move_waitclaim_to_claimed(&held);

        // the handle resumes from the claim-time position, the dry-run
        // advanced only its own copy
        *inner = HandleState::Replaying(ReplayingState {
            guid_1,
            guid_2,
            state: rst_initial,
            held,
        });
        Ok(())
    }

    /// Apply the claimed entries in `(gen, id)` order.
    ///
    /// The callback receives each entry and the header value that makes the
    /// replay restartable from just after this entry; the caller must
    /// persist that header before acting on the next one. An error from the
    /// callback stops the walk with the handle still replaying, so a later
    /// call continues behind the last persisted position.
    pub fn replay(
        &self,
        cb: &mut dyn FnMut(&ReplayNode, &ZilHeaderPmem) -> anyhow::Result<()>,
    ) -> Result<(), ReplayError> {
        let mut inner = self.inner.lock().unwrap();
        let rs = match &mut *inner {
            HandleState::Destroyed => return Ok(()),
            HandleState::Replaying(rs) => rs,
            other => panic!("replay in handle state {}", other.name()),
        };

        // all entries are still findable, the held chunks were exempt from gc
        let (guid_1, guid_2) = (rs.guid_1, rs.guid_2);
        let mut tree = ReplayNodeTree::new();
        for chunk in &rs.held {
            find_replay_nodes_in_chunk(
                chunk,
                &*self.prb.pmem,
                guid_1,
                guid_2,
                self.objset_id,
                rs.state.claim_txg,
                &mut tree,
            );
        }

        let mut cb_err: Option<anyhow::Error> = None;
        let outcome = replay_resume(&tree, &mut rs.state, |node, state| {
            let header = ZilHeaderPmem::replaying(guid_1, guid_2, state.to_phys());
            match cb(node, &header) {
                Ok(()) => ControlFlow::Continue(()),
                Err(err) => {
                    cb_err = Some(err);
                    ControlFlow::Break(())
                }
            }
        });
        match outcome {
            ResumeOutcome::Done => Ok(()),
            ResumeOutcome::Stopped => Err(ReplayError::ReplayFunc(
                cb_err.expect("stopped walk recorded its error"),
            )),
            ResumeOutcome::Structural(err) => Err(err.into()),
        }
    }

    /// Finish (or skip) replay: drop the chunk retentions, destroy the log.
    /// The returned header must be persisted; it reads as no log.
    pub fn replay_done(&self) -> ZilHeaderPmem {
        let mut inner = self.inner.lock().unwrap();
        match &*inner {
            HandleState::Replaying(_) | HandleState::Destroyed => (),
            other => panic!("replay_done in handle state {}", other.name()),
        }
        release_holds(&mut inner);
        *inner = HandleState::Destroyed;
        ZilHeaderPmem::init()
    }

    /// Start logging with fresh random GUIDs. Returns the header to persist,
    /// or `None` if the log already exists.
    ///
    /// Valid on a fresh handle and after the previous log was destroyed; a
    /// handle with an unresolved claim must finish or abandon it first.
    pub fn create_log_if_not_exists(&self) -> Option<ZilHeaderPmem> {
        let mut inner = self.inner.lock().unwrap();
        match &*inner {
            HandleState::Logging(_) => return None,
            HandleState::Alloced | HandleState::Destroyed => (),
            other => panic!("create_log_if_not_exists in handle state {}", other.name()),
        }

        // zero is the sequence terminator on PMEM, so guid halves are drawn
        // until nonzero
        let guid_1 = nonzero_u64_random();
        let guid_2 = nonzero_u64_random();
        *inner = HandleState::Logging(LoggingState {
            guid_1,
            guid_2,
            dt: ReplayState::init(0),
        });
        Some(ZilHeaderPmem::logging(guid_1, guid_2))
    }

    /// Destroy the log from any state, releasing chunk retentions. The
    /// returned header must be persisted; it reads as no log.
    pub fn destroy_log(&self) -> ZilHeaderPmem {
        let mut inner = self.inner.lock().unwrap();
        release_holds(&mut inner);
        *inner = HandleState::Destroyed;
        ZilHeaderPmem::init()
    }

    /// Release the handle. With `abandon_claim` the claim state is thrown
    /// away and the header to persist is returned; without it the caller
    /// must have promised that gc will not run anymore, and no header
    /// update is produced.
    pub fn teardown(self, abandon_claim: bool) -> Option<ZilHeaderPmem> {
        if abandon_claim {
            let mut inner = self.inner.lock().unwrap();
            release_holds(&mut inner);
            *inner = HandleState::Destroyed;
            Some(ZilHeaderPmem::init())
        } else {
            assert!(
                self.prb.chunks.no_more_gc_promised(),
                "teardown without abandoning the claim requires promise_no_more_gc"
            );
            None
        }
        // Drop releases any remaining retentions and the objset registration
    }
}

fn release_holds(state: &mut HandleState) {
    if let HandleState::Replaying(rs) = state {
        for chunk in rs.held.drain(..) {
            chunk.release_hold();
        }
    }
}

impl Drop for PrbHandle {
    fn drop(&mut self) {
        // must not double panic when dropped during unwinding
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        release_holds(&mut inner);
        drop(inner);
        match self.prb.objsets.lock() {
            Ok(mut objsets) => {
                objsets.remove(&self.objset_id);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&self.objset_id);
            }
        }
    }
}

fn nonzero_u64_random() -> u64 {
    let mut buf = [0u8; 8];
    loop {
        openssl::rand::rand_bytes(&mut buf).expect("random source failure");
        let value = u64::from_le_bytes(buf);
        if value != 0 {
            return value;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pmem::{DramPmem, HeapRegion};

    fn prb_with_chunks(regions: &[HeapRegion]) -> Arc<Prb> {
        let prb = Prb::new(2, Arc::new(DramPmem));
        for region in regions {
            let chunk = Arc::new(unsafe { PrbChunk::new(region.as_mut_ptr(), region.len()) });
            prb.add_chunk_for_write(chunk);
        }
        prb
    }

    #[test]
    fn gen_and_id_assignment() {
        let regions = [HeapRegion::alloc(4096).unwrap()];
        let prb = prb_with_chunks(&regions);
        let handle = prb.setup_objset(7);
        handle.create_log_if_not_exists().unwrap();

        handle.write_entry(3, false, &[1]).unwrap();
        let mut stats = WriteStats::default();
        handle
            .write_entry_with_stats(3, false, &[2], true, Some(&mut stats))
            .unwrap();
        assert_eq!(stats.beginning_new_gen, 0);
        handle
            .write_entry_with_stats(3, true, &[3], true, Some(&mut stats))
            .unwrap();
        assert_eq!(stats.beginning_new_gen, 1);
        assert_eq!(handle.max_written_txg(), 3);
    }

    #[test]
    fn obsolete_txg_rejected() {
        let regions = [HeapRegion::alloc(4096).unwrap()];
        let prb = prb_with_chunks(&regions);
        let handle = prb.setup_objset(7);
        handle.create_log_if_not_exists().unwrap();

        handle.write_entry(10, false, &[1]).unwrap();
        assert_eq!(handle.write_entry(6, false, &[2]), Err(WriteError::Obsolete));
        // a txg still inside the window is fine
        handle.write_entry(8, false, &[3]).unwrap();
    }

    #[test]
    fn nonblocking_write_without_chunks() {
        let prb = Prb::new(1, Arc::new(DramPmem));
        let handle = prb.setup_objset(7);
        handle.create_log_if_not_exists().unwrap();
        let mut stats = WriteStats::default();
        assert_eq!(
            handle.write_entry_with_stats(3, false, &[1], false, Some(&mut stats)),
            Err(WriteError::WouldBlock)
        );
        assert_eq!(stats.get_chunk_calls, 1);
        assert!(stats.entry_pmem_base.is_none());
    }

    #[test]
    #[should_panic(expected = "already set up")]
    fn duplicate_objset_setup_panics() {
        let prb = Prb::new(1, Arc::new(DramPmem));
        let _a = prb.setup_objset(7);
        let _b = prb.setup_objset(7);
    }

    #[test]
    fn handle_drop_releases_objset() {
        let prb = Prb::new(1, Arc::new(DramPmem));
        let handle = prb.setup_objset(7);
        drop(handle);
        let handle = prb.setup_objset(7);
        drop(handle);
    }

    #[test]
    fn random_guids_are_nonzero() {
        for _ in 0..64 {
            assert_ne!(nonzero_u64_random(), 0);
        }
    }
}
