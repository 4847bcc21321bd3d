//! Per-log dependency tracking.
//!
//! Every append gets a `(gen, gen_scoped_id)` pair and a dependency record
//! describing the previous generation's per-txg entry counts. The pair is
//! strictly increasing per log and is the sort key replay uses; the record
//! lets replay prove that no entry of the previous generation is missing,
//! without a central sequence number on the hot path.

use serde::Serialize;

use crate::file_formats::{EntryDep, ReplayStatePhys, TxgCount, TXG_MASK, TXG_SIZE};
pub use crate::file_formats::TXG_CONCURRENT_STATES;

/// The active side of a log's tracker state: current generation, the last
/// id handed out in it, and entry counts per open txg, slotted by
/// `txg % TXG_SIZE`.
#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeptrackCount {
    pub gen: u64,
    pub last_id: u64,
    pub count: [TxgCount; TXG_SIZE],
}

impl DeptrackCount {
    pub(crate) fn minmax_txg(&self) -> (u64, u64) {
        let mut min = u64::MAX;
        let mut max = 0;
        for pair in &self.count {
            min = min.min(pair.txg);
            max = max.max(pair.txg);
        }
        (min, max)
    }

    pub(crate) fn max_txg(&self) -> u64 {
        self.minmax_txg().1
    }

    /// Derive the dependency record the next generation's entries carry: the
    /// current generation and its [`TXG_CONCURRENT_STATES`] most recent txg
    /// counters. Older counters have synced out and replay ignores them.
    pub(crate) fn compute_dep(&self) -> EntryDep {
        let mut dep = EntryDep {
            last_gen: self.gen,
            last_gen_counts: [TxgCount::default(); TXG_CONCURRENT_STATES],
        };
        let (_, max) = self.minmax_txg();
        for (i, out) in dep.last_gen_counts.iter_mut().enumerate() {
            let i = i as u64;
            if i >= max {
                continue;
            }
            let txg = max - i;
            let pair = self.count[(txg & TXG_MASK) as usize];
            if pair.txg == txg {
                *out = pair;
            }
        }
        dep
    }
}

/// A log's complete tracker state. Doubles as the replay cursor: during
/// replay the same updates run in the same order, so the state after entry
/// `k` equals the state at the time entry `k` was written.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplayState {
    pub claim_txg: u64,
    pub active: DeptrackCount,
    pub last: EntryDep,
}

impl ReplayState {
    pub fn init(claim_txg: u64) -> Self {
        let state = Self {
            claim_txg,
            active: DeptrackCount::default(),
            last: EntryDep {
                last_gen: u64::MAX,
                last_gen_counts: [TxgCount::default(); TXG_CONCURRENT_STATES],
            },
        };
        debug_assert!(state.is_init());
        state
    }

    pub(crate) fn is_init(&self) -> bool {
        self.active.gen == 0 && self.last.last_gen == u64::MAX
    }

    /// Render for persistence in the header slot.
    pub fn to_phys(&self) -> ReplayStatePhys {
        ReplayStatePhys {
            claim_txg: self.claim_txg,
            active: self.active.compute_dep(),
            active_last_id: self.active.last_id,
            last: self.last,
        }
    }

    /// Rebuild from a persisted header slot, re-slotting the active counters
    /// by `txg % TXG_SIZE`.
    pub fn from_phys(phys: &ReplayStatePhys) -> Self {
        let mut state = Self {
            claim_txg: phys.claim_txg,
            active: DeptrackCount {
                gen: phys.active.last_gen,
                last_id: phys.active_last_id,
                ..DeptrackCount::default()
            },
            last: phys.last,
        };
        for pair in &phys.active.last_gen_counts {
            if pair.txg == 0 {
                continue;
            }
            state.active.count[(pair.txg & TXG_MASK) as usize] = *pair;
        }
        state
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeptrackOutcome {
    SameGen,
    TxgShouldHaveSyncedAlready,
    BeganNewGen,
    ActiveHasNewerGen,
    ActiveHasNewerId,
}

/// Record `(txg, gen, id)` into the tracker. On a generation change, `last`
/// is first re-derived from the outgoing generation's counters.
///
/// The first two outcomes are the successful ones. The obsolete outcome
/// means `txg` fell out of the concurrent-txg window; the caller must drop
/// the write. The last two indicate the caller violated the monotonicity
/// contract.
pub(crate) fn do_deptrack(
    active: &mut DeptrackCount,
    last: &mut EntryDep,
    txg: u64,
    gen: u64,
    id: u64,
) -> DeptrackOutcome {
    assert!(txg > 0);
    assert!(gen > 0);
    assert!(id > 0);

    let max_txg = active.max_txg();
    if max_txg >= TXG_CONCURRENT_STATES as u64 && txg <= max_txg - TXG_CONCURRENT_STATES as u64 {
        return DeptrackOutcome::TxgShouldHaveSyncedAlready;
    }

    if gen < active.gen {
        return DeptrackOutcome::ActiveHasNewerGen;
    }
    let beginning_new_gen = gen > active.gen;
    if !beginning_new_gen && id <= active.last_id {
        return DeptrackOutcome::ActiveHasNewerId;
    }

    // only `active` and `last` are modified from here on
    let ret = if beginning_new_gen {
        *last = active.compute_dep();
        active.gen = gen;
        active.last_id = 0;
        DeptrackOutcome::BeganNewGen
    } else {
        DeptrackOutcome::SameGen
    };
    debug_assert!(active.gen > last.last_gen);
    debug_assert!(id > active.last_id);
    active.last_id = id;

    let slot = &mut active.count[(txg & TXG_MASK) as usize];
    if slot.txg != txg {
        // the obsolete case is handled above, so the slot only moves forward
        debug_assert!(slot.txg < txg);
        *slot = TxgCount { txg, count: 0 };
    }
    slot.count += 1;
    ret
}
