#![forbid(unsafe_code)]
//! Directory data-block engine.
//!
//! A data block is a header (magic, best-free table, and on v3 the
//! self-describing fields) followed by a stream of 8-byte aligned records
//! that exactly tile the payload: active entries and unused regions, each
//! ending in a tag word that holds its own offset. Block-format blocks end
//! in a leaf-hash trailer instead of running to the end of the block.
//!
//! - [`bestfree`] keeps the three-slot table of the largest unused regions.
//! - [`space`] carves entries out of unused regions and gives them back,
//!   coalescing with neighbours.
//! - [`verify`] proves the block invariants on every read and write.
//! - [`init`] writes a fresh data block; [`log`] maps changes to the byte
//!   ranges the transaction must log.
//!
//! Every accessor goes through the [`DirOps`] table; nothing here knows a
//! header size.

pub mod bestfree;
pub mod entry;
pub mod init;
pub mod leaf;
pub mod log;
pub mod space;
pub mod verify;

pub use bestfree::{freefind, freefind_verify, freeinsert, freeremove, freescan, scan_bestfree};
pub use entry::{Record, RecordWalk};
pub use init::data_init;
pub use log::{log_entry, log_header, log_unused};
pub use leaf::BlockTrailer;
pub use space::{check_free, check_new_free, make_free, use_free};
pub use verify::{
    BlockBufOps, DataBufOps, ReadaheadBufOps, check_block, data_check, data_read, data_readahead,
    read_verified,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use xd_alloc::{DirInode, ExtentAllocator};
use xd_block::{BlockDevice, BufferCache};
use xd_error::{DirError, Result};
use xd_journal::{Journal, Transaction};
use xd_ondisk::{DirFeatures, DirGeometry, DirOps, NameOps};
use xd_types::{FsUuid, ParseError};

/// Buffer cache over a type-erased device.
pub type DirBufferCache = BufferCache<Arc<dyn BlockDevice>>;

/// Largest inode number a directory entry may carry (56 bits).
pub const MAX_INO: u64 = (1 << 56) - 1;

/// Mount-wide, read-only directory state shared by every operation and
/// every buffer verifier.
#[derive(Debug)]
pub struct DirContext {
    pub geo: DirGeometry,
    pub features: DirFeatures,
    /// Mount-default dispatch table.
    pub ops: DirOps,
    pub name_ops: NameOps,
    /// UUID stamped into and checked against v3 headers.
    pub meta_uuid: FsUuid,
    /// Inclusive upper bound for valid inode numbers.
    pub max_ino: u64,
    pub journal: Arc<Journal>,
}

impl DirContext {
    pub fn new(
        fs_block_log: u8,
        dir_block_log: u8,
        features: DirFeatures,
        ascii_ci: bool,
        meta_uuid: FsUuid,
        max_ino: u64,
        journal: Arc<Journal>,
    ) -> Result<Self> {
        let ops = DirOps::for_features(features);
        let geo = DirGeometry::new(fs_block_log, dir_block_log, ops.node_hdr_size())
            .map_err(|err| DirError::InvalidGeometry(err.to_string()))?;
        Ok(Self {
            geo,
            features,
            ops,
            name_ops: NameOps::for_mount(ascii_ci),
            meta_uuid,
            max_ino: max_ino.min(MAX_INO),
            journal,
        })
    }

    /// Dispatch table for a directory: its override if it has one.
    #[must_use]
    pub fn ops_for(&self, override_ops: Option<DirOps>) -> DirOps {
        override_ops.unwrap_or(self.ops)
    }

    #[must_use]
    pub fn hashname(&self, name: &[u8]) -> u32 {
        self.name_ops.hashname(name)
    }

    #[must_use]
    pub fn ino_is_valid(&self, ino: u64) -> bool {
        ino != 0 && ino <= self.max_ino
    }

    /// Reject an inode number a directory entry must never carry.
    pub fn ino_validate(&self, ino: u64) -> Result<()> {
        if self.ino_is_valid(ino) {
            return Ok(());
        }
        warn!(ino, max_ino = self.max_ino, "invalid inode number in directory");
        Err(DirError::corrupted(0, 0, format!("invalid inode number {ino:#x}")))
    }
}

/// Everything a directory operation touches.
pub struct DaArgs<'a, 'j> {
    pub ctx: &'a Arc<DirContext>,
    pub cache: &'a DirBufferCache,
    pub alloc: &'a dyn ExtentAllocator,
    pub tp: &'a mut Transaction<'j>,
    pub dp: &'a mut DirInode,
    /// Effective dispatch table for `dp`.
    pub ops: DirOps,
    /// Per-inode override, if `dp` has one; verifiers compare it against the
    /// mount table.
    pub ops_override: Option<DirOps>,
}

impl std::fmt::Debug for DaArgs<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaArgs")
            .field("ino", &self.dp.ino)
            .field("txn", &self.tp.id())
            .field("ops", &self.ops)
            .finish_non_exhaustive()
    }
}

/// What a space-engine call left for the caller to do.
///
/// `needlog`: the header (best-free table) changed and must be logged.
/// `needscan`: the best-free table may no longer hold the three largest
/// regions; the caller must run [`freescan`] before anything else touches
/// the block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceOutcome {
    pub needlog: bool,
    pub needscan: bool,
}

/// Attach a block address and in-block offset to a byte-access failure.
pub(crate) trait CorruptAt<T> {
    fn at(self, block: u64, offset: usize) -> Result<T>;
}

impl<T> CorruptAt<T> for std::result::Result<T, ParseError> {
    fn at(self, block: u64, offset: usize) -> Result<T> {
        self.map_err(|err| DirError::corrupted(block, offset, err.to_string()))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn context_selects_ops_and_validates_inodes() {
        let ctx = context(crc_features());
        assert_eq!(ctx.ops, DirOps::V3);
        assert_eq!(ctx.ops_for(None), DirOps::V3);
        assert_eq!(ctx.ops_for(Some(DirOps::V2)), DirOps::V2);
        assert!(ctx.ino_validate(0x100).is_ok());
        assert!(ctx.ino_validate(0).unwrap_err().is_corruption());
        assert!(ctx.ino_validate(1 << 60).is_err());
        assert_eq!(ctx.geo.blksize, 4096);
    }
}
