use endian_trait::Endian;
use proxmox_io::{ReadExt, WriteExt};
use serde::Serialize;

use crate::fletcher::{fletcher4, Fletcher4};

// WARNING: these layouts are persisted in PMEM and in the objset header
// slot. Do not reorder or resize fields.

/// Number of txg slots the enclosing filesystem cycles through.
pub const TXG_SIZE: usize = 4;
pub const TXG_MASK: u64 = TXG_SIZE as u64 - 1;
/// At most this many txgs are unsynced at any time.
pub const TXG_CONCURRENT_STATES: usize = 3;

/// Size and alignment of an entry header. Entries start at multiples of
/// this within a chunk, and every PMEM store is a multiple of it.
pub const ENTRY_HEADER_SIZE: usize = 256;

/// One dependency counter: how many entries of the previous generation were
/// written in `txg`.
///
/// `txg == 0` marks an unused slot. A zero txg with a nonzero count is
/// invalid by construction and rejected during replay.
#[derive(Endian, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TxgCount {
    pub txg: u64,
    pub count: u64,
}

/// The causal-history record stored in every entry header: the previous
/// generation and its [`TXG_CONCURRENT_STATES`] most recent txg counters.
///
/// Replay uses this to prove that every entry the current one depends on is
/// present before handing it to the replay function.
#[derive(Endian, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct EntryDep {
    pub last_gen: u64,
    pub last_gen_counts: [TxgCount; TXG_CONCURRENT_STATES],
}

/// The meat of the 256 byte entry header. Stored little-endian at the start
/// of every entry; the remaining 80 bytes of the header block are zero.
///
/// Every identity field is nonzero in a fully published header. An 8 byte
/// store is powerfail atomic, so a torn header has at least one zero field
/// and traversal treats it as absent.
#[derive(Endian, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct EntryHeaderData {
    pub objset_id: u64,
    pub zil_guid_1: u64,
    pub zil_guid_2: u64,
    pub txg: u64,
    pub gen: u64,
    pub gen_scoped_id: u64,
    pub body_len: u64,
    pub dep: EntryDep,
    pub body_csum: Fletcher4,
    pub header_csum: Fletcher4,
}
proxmox_lang::static_assert_size!(EntryHeaderData, 176);

impl EntryHeaderData {
    /// Render the header into a 256 byte block, little-endian, zero padded.
    pub fn write_to_block(&self, block: &mut [u8; ENTRY_HEADER_SIZE]) {
        block.fill(0);
        // the block is larger than the struct, this cannot fail
        unsafe { (&mut block[..]).write_le_value(*self) }.unwrap();
    }

    pub fn read_from_block(block: &[u8; ENTRY_HEADER_SIZE]) -> Self {
        // the block is larger than the struct, this cannot fail
        unsafe { (&block[..]).read_le_value::<EntryHeaderData>() }.unwrap()
    }

    /// Debugger-facing rendering.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "objset_id": self.objset_id,
            "zil_guid_1": format!("{:#x}", self.zil_guid_1),
            "zil_guid_2": format!("{:#x}", self.zil_guid_2),
            "txg": self.txg,
            "gen": self.gen,
            "gen_scoped_id": self.gen_scoped_id,
            "body_len": self.body_len,
            "dep": self.dep,
            "body_csum": hex::encode(csum_bytes(&self.body_csum)),
            "header_csum": hex::encode(csum_bytes(&self.header_csum)),
        })
    }
}

fn csum_bytes(csum: &Fletcher4) -> Vec<u8> {
    csum.iter().flat_map(|word| word.to_le_bytes()).collect()
}

/// Fletcher-4 over a header block with the checksum field treated as zero.
pub fn compute_header_csum(block: &[u8; ENTRY_HEADER_SIZE]) -> Fletcher4 {
    let off = proxmox_lang::offsetof!(EntryHeaderData, header_csum);
    let mut tmp = *block;
    tmp[off..off + 32].fill(0);
    fletcher4(&tmp)
}

/// Write the header checksum into an already rendered header block.
pub fn patch_header_csum(block: &mut [u8; ENTRY_HEADER_SIZE], csum: &Fletcher4) {
    let off = proxmox_lang::offsetof!(EntryHeaderData, header_csum);
    for (i, word) in csum.iter().enumerate() {
        block[off + i * 8..off + (i + 1) * 8].copy_from_slice(&word.to_le_bytes());
    }
}

/// Resumable replay position as persisted in the header slot while a log is
/// in the replaying state: the claim txg, the active tracker state rendered
/// as a dependency record plus the last gen-scoped id it handed out, and the
/// last derived dependency record.
///
/// The id must be persisted separately: the dependency-record rendering of
/// the active state only keeps per-txg counts, and resuming replay in the
/// middle of a generation needs the exact `(gen, id)` position to know which
/// entries were already applied.
#[derive(Endian, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ReplayStatePhys {
    pub claim_txg: u64,
    pub active: EntryDep,
    pub active_last_id: u64,
    pub last: EntryDep,
}
proxmox_lang::static_assert_size!(ReplayStatePhys, 128);

pub const ZIL_HEADER_PMEM_SIZE: usize = 152;

const ZH_ST_NOZIL: u64 = 1;
const ZH_ST_REPLAYING: u64 = 2;
const ZH_ST_LOGGING: u64 = 4;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZilHeaderState {
    /// No log exists for this objset.
    NoZil,
    /// A claim completed; `replay_state` tracks replay progress.
    Replaying,
    /// The log is (or was, at crash time) accepting writes.
    Logging,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid ZIL header state 0x{0:x}")]
pub struct ZilHeaderError(pub u64);

/// The per-objset header slot. Updated only through handle operations; the
/// caller persists each returned value through its transactional path.
#[derive(Endian, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct ZilHeaderPmem {
    state: u64,
    guid_1: u64,
    guid_2: u64,
    replay_state: ReplayStatePhys,
}
proxmox_lang::static_assert_size!(ZilHeaderPmem, ZIL_HEADER_PMEM_SIZE);

impl ZilHeaderPmem {
    /// A fresh header: no log.
    pub fn init() -> Self {
        Self {
            state: ZH_ST_NOZIL,
            guid_1: 0,
            guid_2: 0,
            replay_state: ReplayStatePhys::default(),
        }
    }

    pub(crate) fn logging(guid_1: u64, guid_2: u64) -> Self {
        debug_assert!(guid_1 != 0 && guid_2 != 0);
        Self {
            state: ZH_ST_LOGGING,
            guid_1,
            guid_2,
            replay_state: ReplayStatePhys::default(),
        }
    }

    pub(crate) fn replaying(guid_1: u64, guid_2: u64, replay_state: ReplayStatePhys) -> Self {
        Self {
            state: ZH_ST_REPLAYING,
            guid_1,
            guid_2,
            replay_state,
        }
    }

    pub fn state(&self) -> Result<ZilHeaderState, ZilHeaderError> {
        match self.state {
            ZH_ST_NOZIL => Ok(ZilHeaderState::NoZil),
            ZH_ST_REPLAYING => Ok(ZilHeaderState::Replaying),
            ZH_ST_LOGGING => Ok(ZilHeaderState::Logging),
            other => Err(ZilHeaderError(other)),
        }
    }

    pub fn validate_format(&self) -> bool {
        self.state().is_ok()
    }

    pub fn guids(&self) -> (u64, u64) {
        (self.guid_1, self.guid_2)
    }

    /// The claim txg, available only while replaying.
    pub fn claim_txg(&self) -> Option<u64> {
        match self.state() {
            Ok(ZilHeaderState::Replaying) => Some(self.replay_state.claim_txg),
            _ => None,
        }
    }

    pub fn replay_state(&self) -> &ReplayStatePhys {
        &self.replay_state
    }

    /// Whether a claim pass over this header may still need to record block
    /// claims: only a log that crashed while logging has unclaimed entries.
    pub fn might_claim_during_recovery(&self) -> Result<bool, ZilHeaderError> {
        Ok(match self.state()? {
            ZilHeaderState::NoZil => false,
            ZilHeaderState::Logging => true,
            ZilHeaderState::Replaying => false,
        })
    }

    /// Render the header little-endian, as the enclosing filesystem stores it.
    pub fn to_bytes(&self) -> [u8; ZIL_HEADER_PMEM_SIZE] {
        let mut buf = [0u8; ZIL_HEADER_PMEM_SIZE];
        // the buffer matches the struct size, this cannot fail
        unsafe { (&mut buf[..]).write_le_value(*self) }.unwrap();
        buf
    }

    pub fn from_bytes(buf: &[u8; ZIL_HEADER_PMEM_SIZE]) -> Self {
        // the buffer matches the struct size, this cannot fail
        unsafe { (&buf[..]).read_le_value::<ZilHeaderPmem>() }.unwrap()
    }
}

impl std::fmt::Display for ZilHeaderPmem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state() {
            Ok(ZilHeaderState::NoZil) => "nozil",
            Ok(ZilHeaderState::Replaying) => "replaying",
            Ok(ZilHeaderState::Logging) => "logging",
            Err(_) => "invalid",
        };
        write!(
            f,
            "{{\"{}\", 1=0x{:x}, 2=0x{:x}, claim_txg={}}}",
            state, self.guid_1, self.guid_2, self.replay_state.claim_txg
        )
    }
}
