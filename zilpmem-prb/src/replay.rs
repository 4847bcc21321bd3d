//! Replay planning: collecting a log's entries from PMEM and walking them
//! in write order while proving the chain is complete.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use crate::chunk::{ChunkIter, PrbChunk};
use crate::deptrack::{do_deptrack, DeptrackOutcome, ReplayState};
use crate::file_formats::{EntryDep, EntryHeaderData, ENTRY_HEADER_SIZE};
use crate::fletcher::fletcher4;
use crate::pmem::{MceError, Pmem};

/// One planned replay entry: the ordering key, the dependency record, and
/// where the entry lives in PMEM.
#[derive(Clone, Debug)]
pub struct ReplayNode {
    pub gen: u64,
    pub id: u64,
    pub txg: u64,
    pub dep: EntryDep,
    pub(crate) pmem_ptr: *const u8,
    pub(crate) chunk: Arc<PrbChunk>,
}

// The node's pointer refers into a chunk the owning handle keeps held; reads
// go through machine-check safe copies.
unsafe impl Send for ReplayNode {}
unsafe impl Sync for ReplayNode {}

#[derive(thiserror::Error, Debug)]
pub enum ReadNodeError {
    #[error(transparent)]
    Mce(#[from] MceError),
    #[error("entry body checksum mismatch")]
    BodyChecksum,
}

impl ReplayNode {
    /// The entry's PMEM address, for debug output.
    pub fn pmem_base(&self) -> *const u8 {
        self.pmem_ptr
    }

    /// Debugger-facing rendering.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "gen": self.gen,
            "id": self.id,
            "txg": self.txg,
            "dep": self.dep,
            "pmem_ptr": format!("{:p}", self.pmem_ptr),
            "chunk_base": format!("{:p}", self.chunk.base()),
        })
    }

    /// Re-read the entry header from PMEM.
    pub fn read_header(&self, pmem: &dyn Pmem) -> Result<EntryHeaderData, ReadNodeError> {
        let mut block = [0u8; ENTRY_HEADER_SIZE];
        unsafe { pmem.memcpy_mcsafe(block.as_mut_ptr(), self.pmem_ptr, ENTRY_HEADER_SIZE)? };
        Ok(EntryHeaderData::read_from_block(&block))
    }

    /// Re-read and verify the entry body from PMEM.
    pub fn read_body(&self, pmem: &dyn Pmem) -> Result<Vec<u8>, ReadNodeError> {
        let hdr = self.read_header(pmem)?;
        let mut body = vec![0u8; hdr.body_len as usize];
        unsafe {
            pmem.memcpy_mcsafe(
                body.as_mut_ptr(),
                self.pmem_ptr.add(ENTRY_HEADER_SIZE),
                body.len(),
            )?
        };
        if fletcher4(&body) != hdr.body_csum {
            return Err(ReadNodeError::BodyChecksum);
        }
        Ok(body)
    }
}

/// Replay candidates ordered by `(gen, gen_scoped_id)`.
pub(crate) type ReplayNodeTree = BTreeMap<(u64, u64), ReplayNode>;

/// Scan one chunk for entries of the log identified by the guid pair and
/// objset, skipping entries older than the claim txg.
///
/// Corruption ends the scan of this chunk only; whether the resulting set is
/// complete is decided by the dependency walk, not here.
pub(crate) fn find_replay_nodes_in_chunk(
    chunk: &Arc<PrbChunk>,
    pmem: &dyn Pmem,
    zil_guid_1: u64,
    zil_guid_2: u64,
    objset_id: u64,
    claim_txg: u64,
    out: &mut ReplayNodeTree,
) {
    let mut iter = unsafe { ChunkIter::new(chunk.base(), chunk.len(), pmem) };
    loop {
        match iter.next_entry() {
            Ok(None) => return,
            Ok(Some((entry_pmem, hdr))) => {
                if hdr.zil_guid_1 != zil_guid_1
                    || hdr.zil_guid_2 != zil_guid_2
                    || hdr.objset_id != objset_id
                {
                    continue;
                }
                if hdr.txg < claim_txg {
                    continue;
                }
                let key = (hdr.gen, hdr.gen_scoped_id);
                if let Some(existing) = out.get(&key) {
                    // distinct PMEM locations claiming the same position in
                    // the log cannot be ordered; replaying either would be a
                    // guess
                    panic!(
                        "duplicate log entry gen={} id={} at {:p} and {:p}",
                        hdr.gen, hdr.gen_scoped_id, existing.pmem_ptr, entry_pmem
                    );
                }
                out.insert(
                    key,
                    ReplayNode {
                        gen: hdr.gen,
                        id: hdr.gen_scoped_id,
                        txg: hdr.txg,
                        dep: hdr.dep,
                        pmem_ptr: entry_pmem,
                        chunk: Arc::clone(chunk),
                    },
                );
            }
            Err(err) => {
                log::debug!(
                    "chunk scan stopped at corrupt entry (chunk base {:p}): {err}",
                    chunk.base()
                );
                return;
            }
        }
    }
}

/// A gap or impossible state detected while walking the replay set.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayStructuralError {
    #[error("entry gen={gen} id={id}: dependency slot has zero txg but count {count}")]
    InvalidCountExpectedZero { gen: u64, id: u64, count: u64 },
    #[error("entry gen={gen} id={id}: entries of txg {dep_txg} are missing from the log")]
    MissingEntries { gen: u64, id: u64, dep_txg: u64 },
    #[error("entry gen={gen} id={id}: obsolete txg that should never have been written")]
    ObsoleteEntry { gen: u64, id: u64 },
}

pub(crate) enum ResumeOutcome {
    Done,
    Stopped,
    Structural(ReplayStructuralError),
}

/// Walk the replay set in `(gen, id)` order, advancing `state` exactly as
/// the writer's dependency tracker did, and verifying before each entry
/// that everything it depends on has been visited.
///
/// Entries at or below the state's resume position are skipped, which makes
/// the walk restartable from a persisted [`ReplayState`]. The callback runs
/// after an entry verifies; returning `Break` ends the walk with
/// [`ResumeOutcome::Stopped`] and `state` positioned at that entry.
pub(crate) fn replay_resume(
    tree: &ReplayNodeTree,
    state: &mut ReplayState,
    mut cb: impl FnMut(&ReplayNode, &ReplayState) -> ControlFlow<()>,
) -> ResumeOutcome {
    for node in tree.values() {
        if node.txg < state.claim_txg
            || node.gen < state.active.gen
            || (node.gen == state.active.gen && node.id <= state.active.last_id)
        {
            // already replayed (or pre-claim)
            continue;
        }

        let outcome = do_deptrack(&mut state.active, &mut state.last, node.txg, node.gen, node.id);
        debug_assert!(!state.is_init());

        match outcome {
            DeptrackOutcome::SameGen | DeptrackOutcome::BeganNewGen => {
                for rc in &node.dep.last_gen_counts {
                    // a zero txg marks an unused dependency slot
                    if rc.txg == 0 {
                        if rc.count != 0 {
                            return ResumeOutcome::Structural(
                                ReplayStructuralError::InvalidCountExpectedZero {
                                    gen: node.gen,
                                    id: node.id,
                                    count: rc.count,
                                },
                            );
                        }
                        continue;
                    }
                    // dependencies older than the claim txg synced out
                    // before the crash and may already be reclaimed
                    if rc.txg < state.claim_txg {
                        continue;
                    }
                    let found = state
                        .last
                        .last_gen_counts
                        .iter()
                        .find(|lc| lc.txg == rc.txg);
                    match found {
                        Some(lc) if lc.count == rc.count => {}
                        _ => {
                            return ResumeOutcome::Structural(
                                ReplayStructuralError::MissingEntries {
                                    gen: node.gen,
                                    id: node.id,
                                    dep_txg: rc.txg,
                                },
                            )
                        }
                    }
                }
            }
            DeptrackOutcome::TxgShouldHaveSyncedAlready => {
                // the write path refuses obsolete txgs, so a written entry
                // can never show one
                return ResumeOutcome::Structural(ReplayStructuralError::ObsoleteEntry {
                    gen: node.gen,
                    id: node.id,
                });
            }
            DeptrackOutcome::ActiveHasNewerGen => {
                panic!("replay set not sorted by gen")
            }
            DeptrackOutcome::ActiveHasNewerId => {
                panic!("replay set not sorted by id")
            }
        }

        if let ControlFlow::Break(()) = cb(node, state) {
            return ResumeOutcome::Stopped;
        }
    }
    ResumeOutcome::Done
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::file_formats::{TxgCount, TXG_CONCURRENT_STATES};

    fn node(gen: u64, id: u64, txg: u64, dep: EntryDep) -> ReplayNode {
        ReplayNode {
            gen,
            id,
            txg,
            dep,
            pmem_ptr: std::ptr::null(),
            chunk: test_chunk(),
        }
    }

    fn test_chunk() -> Arc<PrbChunk> {
        use crate::pmem::HeapRegion;
        use std::sync::OnceLock;
        // one shared backing region keeps the nodes' chunk references alive
        static REGION: OnceLock<HeapRegion> = OnceLock::new();
        let region = REGION.get_or_init(|| HeapRegion::alloc(512).unwrap());
        Arc::new(unsafe { PrbChunk::new(region.as_mut_ptr(), region.len()) })
    }

    fn tree(nodes: Vec<ReplayNode>) -> ReplayNodeTree {
        let mut tree = ReplayNodeTree::new();
        for n in nodes {
            tree.insert((n.gen, n.id), n);
        }
        tree
    }

    fn zero_dep() -> EntryDep {
        EntryDep {
            last_gen: 0,
            last_gen_counts: [TxgCount::default(); TXG_CONCURRENT_STATES],
        }
    }

    fn walk(tree: &ReplayNodeTree) -> (Vec<(u64, u64)>, ResumeOutcome) {
        let mut state = ReplayState::init(1);
        let mut visited = Vec::new();
        let outcome = replay_resume(tree, &mut state, |node, _| {
            visited.push((node.gen, node.id));
            ControlFlow::Continue(())
        });
        (visited, outcome)
    }

    #[test]
    fn complete_single_gen_chain_is_replayable() {
        let t = tree(vec![
            node(1, 1, 3, zero_dep()),
            node(1, 2, 3, zero_dep()),
            node(1, 3, 4, zero_dep()),
        ]);
        let (visited, outcome) = walk(&t);
        assert!(matches!(outcome, ResumeOutcome::Done));
        assert_eq!(visited, vec![(1, 1), (1, 2), (1, 3)]);
    }

    #[test]
    fn gen_boundary_checks_previous_counts() {
        let dep_b = EntryDep {
            last_gen: 1,
            last_gen_counts: [
                TxgCount { txg: 3, count: 1 },
                TxgCount::default(),
                TxgCount::default(),
            ],
        };
        // complete: gen 1 wrote one entry at txg 3
        let t = tree(vec![node(1, 1, 3, zero_dep()), node(2, 1, 3, dep_b)]);
        let (visited, outcome) = walk(&t);
        assert!(matches!(outcome, ResumeOutcome::Done));
        assert_eq!(visited, vec![(1, 1), (2, 1)]);

        // the gen 1 entry is gone: the dependency cannot be satisfied
        let t = tree(vec![node(2, 1, 3, dep_b)]);
        let (visited, outcome) = walk(&t);
        assert!(visited.is_empty());
        match outcome {
            ResumeOutcome::Structural(ReplayStructuralError::MissingEntries {
                gen: 2,
                id: 1,
                dep_txg: 3,
            }) => {}
            _ => panic!("expected missing entries"),
        }
    }

    #[test]
    fn count_mismatch_is_missing_entries() {
        let dep_b = EntryDep {
            last_gen: 1,
            last_gen_counts: [
                TxgCount { txg: 3, count: 2 },
                TxgCount::default(),
                TxgCount::default(),
            ],
        };
        // gen 1 claims two entries at txg 3 but only one survived
        let t = tree(vec![node(1, 1, 3, zero_dep()), node(2, 1, 3, dep_b)]);
        let (_, outcome) = walk(&t);
        assert!(matches!(
            outcome,
            ResumeOutcome::Structural(ReplayStructuralError::MissingEntries { .. })
        ));
    }

    #[test]
    fn zero_txg_with_count_is_invalid() {
        let mut dep = zero_dep();
        dep.last_gen_counts[0] = TxgCount { txg: 0, count: 7 };
        let t = tree(vec![node(1, 1, 3, dep)]);
        let (_, outcome) = walk(&t);
        assert!(matches!(
            outcome,
            ResumeOutcome::Structural(ReplayStructuralError::InvalidCountExpectedZero {
                count: 7,
                ..
            })
        ));
    }

    #[test]
    fn dependencies_older_than_claim_txg_are_ignored() {
        let dep = EntryDep {
            last_gen: 1,
            last_gen_counts: [
                TxgCount { txg: 2, count: 5 },
                TxgCount::default(),
                TxgCount::default(),
            ],
        };
        // claim_txg below starts at 3; the txg 2 dependency predates it
        let t = tree(vec![node(1, 1, 3, zero_dep()), node(2, 1, 3, dep)]);
        let mut state = ReplayState::init(3);
        let outcome = replay_resume(&t, &mut state, |_, _| ControlFlow::Continue(()));
        assert!(matches!(outcome, ResumeOutcome::Done));
    }

    #[test]
    fn resume_skips_already_replayed_entries() {
        let t = tree(vec![
            node(1, 1, 3, zero_dep()),
            node(1, 2, 3, zero_dep()),
            node(1, 3, 3, zero_dep()),
        ]);

        // stop after the second entry, as if the caller crashed there
        let mut state = ReplayState::init(1);
        let mut seen = 0;
        let outcome = replay_resume(&t, &mut state, |_, _| {
            seen += 1;
            if seen == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert!(matches!(outcome, ResumeOutcome::Stopped));

        // resuming from the persisted position replays only the third
        let mut resumed = ReplayState::from_phys(&state.to_phys());
        let mut visited = Vec::new();
        let outcome = replay_resume(&t, &mut resumed, |node, _| {
            visited.push((node.gen, node.id));
            ControlFlow::Continue(())
        });
        assert!(matches!(outcome, ResumeOutcome::Done));
        assert_eq!(visited, vec![(1, 3)]);
    }

    #[test]
    fn callback_stop_reports_stopped() {
        let t = tree(vec![node(1, 1, 3, zero_dep())]);
        let mut state = ReplayState::init(1);
        let outcome = replay_resume(&t, &mut state, |_, _| ControlFlow::Break(()));
        assert!(matches!(outcome, ResumeOutcome::Stopped));
    }
}
