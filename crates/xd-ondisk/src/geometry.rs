//! Per-mount directory geometry.
//!
//! Computed once at mount from the filesystem block log and the directory
//! block multiplier. Three logical address spaces are carved out of the
//! directory's file offsets (data, leaf, free), each [`crate::layout::SPACE_SIZE`] bytes
//! wide; directory block numbers (`db`) count directory blocks, da block
//! numbers count filesystem blocks.

use crate::layout::{
    BLOCK_TAIL_SIZE, DATA_ALIGN_LOG, DATA_OFFSET, FREE_OFFSET, LEAF_ENTRY_SIZE, LEAF_OFFSET,
};
use serde::{Deserialize, Serialize};
use xd_types::{DaBlock, DirBlock, ParseError};

pub const MIN_FS_BLOCK_LOG: u8 = 9;
pub const MAX_DIR_BLOCK_LOG: u8 = 16;

/// Size of a node-tree entry (hashval + before pointer).
const NODE_ENTRY_SIZE: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirGeometry {
    /// log2 of the directory block size.
    pub blklog: u8,
    /// log2 of the filesystem block size.
    pub fsblog: u8,
    pub blksize: u32,
    /// Filesystem blocks per directory block.
    pub fsbcount: u32,
    pub datablk: DaBlock,
    pub leafblk: DaBlock,
    pub freeblk: DaBlock,
    /// Entries per da-btree node block.
    pub node_ents: u32,
    /// 37% of the block size; the node-split threshold.
    pub magicpct: u32,
}

impl DirGeometry {
    /// Build the geometry for `2^fs_block_log`-byte filesystem blocks and
    /// `2^dir_block_log` filesystem blocks per directory block.
    pub fn new(fs_block_log: u8, dir_block_log: u8, node_hdr_size: usize) -> Result<Self, ParseError> {
        if !(MIN_FS_BLOCK_LOG..=MAX_DIR_BLOCK_LOG).contains(&fs_block_log) {
            return Err(ParseError::InvalidField {
                field: "fs_block_log",
                reason: "must be in 9..=16",
            });
        }
        let blklog = fs_block_log
            .checked_add(dir_block_log)
            .filter(|log| *log <= MAX_DIR_BLOCK_LOG)
            .ok_or(ParseError::InvalidField {
                field: "dir_block_log",
                reason: "directory block larger than 64 KiB",
            })?;
        let blksize = 1_u32 << blklog;
        let node_hdr = u32::try_from(node_hdr_size)
            .ok()
            .filter(|size| *size < blksize)
            .ok_or(ParseError::InvalidField {
                field: "node_hdr_size",
                reason: "header does not fit in a directory block",
            })?;

        let mut geo = Self {
            blklog,
            fsblog: fs_block_log,
            blksize,
            fsbcount: 1_u32 << dir_block_log,
            datablk: DaBlock(0),
            leafblk: DaBlock(0),
            freeblk: DaBlock(0),
            node_ents: (blksize - node_hdr) / NODE_ENTRY_SIZE,
            magicpct: blksize * 37 / 100,
        };
        geo.datablk = geo.byte_to_da(DATA_OFFSET);
        geo.leafblk = geo.byte_to_da(LEAF_OFFSET);
        geo.freeblk = geo.byte_to_da(FREE_OFFSET);
        Ok(geo)
    }

    #[must_use]
    pub fn blksize_usize(&self) -> usize {
        // blklog <= 16
        self.blksize as usize
    }

    fn db_shift(&self) -> u8 {
        self.blklog - self.fsblog
    }

    #[must_use]
    pub fn db_to_da(&self, db: DirBlock) -> DaBlock {
        DaBlock(db.0 << self.db_shift())
    }

    #[must_use]
    pub fn da_to_db(&self, da: DaBlock) -> DirBlock {
        DirBlock(da.0 >> self.db_shift())
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // directory offsets stay below 2^35 + blklog headroom
    pub fn byte_to_db(&self, by: u64) -> DirBlock {
        DirBlock((by >> self.blklog) as u32)
    }

    #[must_use]
    pub fn byte_to_da(&self, by: u64) -> DaBlock {
        self.db_to_da(self.byte_to_db(by))
    }

    /// In-block offset of a directory byte address.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // masked to < blksize
    pub fn byte_to_off(&self, by: u64) -> usize {
        (by & u64::from(self.blksize - 1)) as usize
    }

    #[must_use]
    pub fn db_off_to_byte(&self, db: DirBlock, off: usize) -> u64 {
        (u64::from(db.0) << self.blklog) + off as u64
    }

    #[must_use]
    pub fn da_to_byte(&self, da: DaBlock) -> u64 {
        self.db_off_to_byte(self.da_to_db(da), 0)
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // dataptrs are 32-bit by definition
    pub fn byte_to_dataptr(&self, by: u64) -> u32 {
        (by >> DATA_ALIGN_LOG) as u32
    }

    /// Leaf-array address of the record at `off` in directory block `db`.
    #[must_use]
    pub fn db_off_to_dataptr(&self, db: DirBlock, off: usize) -> u32 {
        self.byte_to_dataptr(self.db_off_to_byte(db, off))
    }

    #[must_use]
    pub fn dataptr_to_byte(&self, dp: u32) -> u64 {
        u64::from(dp) << DATA_ALIGN_LOG
    }

    #[must_use]
    pub fn dataptr_to_db(&self, dp: u32) -> DirBlock {
        self.byte_to_db(self.dataptr_to_byte(dp))
    }

    #[must_use]
    pub fn dataptr_to_off(&self, dp: u32) -> usize {
        self.byte_to_off(self.dataptr_to_byte(dp))
    }

    /// Filesystem blocks to bytes.
    #[must_use]
    pub fn fsb_to_bytes(&self, fsb: u64) -> u64 {
        fsb << self.fsblog
    }

    /// Bytes to filesystem blocks (truncating).
    #[must_use]
    pub fn bytes_to_fsb(&self, bytes: u64) -> u64 {
        bytes >> self.fsblog
    }

    /// True when `db` lies in the data space (below the leaf space).
    #[must_use]
    pub fn is_data_db(&self, db: DirBlock) -> bool {
        db < self.byte_to_db(LEAF_OFFSET)
    }

    #[must_use]
    pub fn block_tail_offset(&self) -> usize {
        self.blksize_usize() - BLOCK_TAIL_SIZE
    }

    /// Start of a block-format leaf array holding `count` entries, or `None`
    /// when it would run into the header area.
    #[must_use]
    pub fn block_leaf_offset(&self, count: u32) -> Option<usize> {
        let bytes = usize::try_from(count).ok()?.checked_mul(LEAF_ENTRY_SIZE)?;
        self.block_tail_offset().checked_sub(bytes)
    }
}
