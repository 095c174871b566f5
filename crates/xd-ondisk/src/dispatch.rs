//! Format dispatch.
//!
//! A directory block is only ever interpreted through a [`DirOps`] table
//! chosen once per mount from the feature flags (or overridden per inode
//! for cross-format images). Blocks that are not directories (attribute
//! trees) only need the node accessors, which [`NodeOps`] carries.

use crate::geometry::DirGeometry;
use crate::layout::{
    DA_NODE_MAGIC, DA3_NODE_MAGIC, DATA_ALIGN, DIR2_BESTFREE_OFFSET, DIR2_DATA_HDR_SIZE,
    DIR2_FREE_MAGIC, DIR2_LEAF1_MAGIC, DIR2_LEAFN_MAGIC, DIR3_BESTFREE_OFFSET, DIR3_DATA_HDR_SIZE,
    DIR3_FREE_MAGIC, DIR3_LEAF1_MAGIC, DIR3_LEAFN_MAGIC, ENTRY_NAME_OFF, ENTRY_NAMELEN_OFF,
    FREE_OFFSET, FileType, TAG_SIZE,
};
use serde::{Deserialize, Serialize};
use xd_types::{
    DirBlock, ParseError, read_be_u16, read_be_u32, read_be_u64, read_u8, write_be_u16,
    write_be_u32, write_be_u64, write_u8,
};

/// Feature bits that drive dispatch selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirFeatures {
    /// Self-describing metadata with CRCs (v3 headers).
    pub crc: bool,
    /// File type byte stored in directory entries.
    pub ftype: bool,
}

/// Per-variant accessors for directory blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirOps {
    /// Legacy headers, no file type in entries.
    V2,
    /// Legacy headers, file type byte after the name.
    V2Ftype,
    /// CRC-protected self-describing headers, file type byte after the name.
    V3,
}

/// Node-block accessors for non-directory da trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeOps {
    V2,
    V3,
}

const fn round_up_align(len: usize) -> usize {
    (len + DATA_ALIGN - 1) & !(DATA_ALIGN - 1)
}

/// inumber + namelen + name + tag, before padding.
const fn entsize_v2(namelen: usize) -> usize {
    round_up_align(ENTRY_NAME_OFF + namelen + TAG_SIZE)
}

/// Same plus the file type byte.
const fn entsize_ftype(namelen: usize) -> usize {
    round_up_align(ENTRY_NAME_OFF + namelen + 1 + TAG_SIZE)
}

impl DirOps {
    /// Mount-default table: CRC ⇒ v3, else file type ⇒ legacy+ftype, else legacy.
    #[must_use]
    pub fn for_features(features: DirFeatures) -> Self {
        if features.crc {
            Self::V3
        } else if features.ftype {
            Self::V2Ftype
        } else {
            Self::V2
        }
    }

    /// An explicit override (per-inode or per-mount) supersedes the
    /// feature-derived default.
    #[must_use]
    pub fn select(features: DirFeatures, override_ops: Option<Self>) -> Self {
        override_ops.unwrap_or_else(|| Self::for_features(features))
    }

    #[must_use]
    pub fn has_ftype(self) -> bool {
        !matches!(self, Self::V2)
    }

    #[must_use]
    pub fn is_v3(self) -> bool {
        matches!(self, Self::V3)
    }

    #[must_use]
    pub fn node_ops(self) -> NodeOps {
        match self {
            Self::V2 | Self::V2Ftype => NodeOps::V2,
            Self::V3 => NodeOps::V3,
        }
    }

    // ── Data blocks ─────────────────────────────────────────────────────────

    /// Aligned on-disk size of an active entry with a `namelen`-byte name.
    #[must_use]
    pub fn data_entsize(self, namelen: usize) -> usize {
        match self {
            Self::V2 => entsize_v2(namelen),
            Self::V2Ftype | Self::V3 => entsize_ftype(namelen),
        }
    }

    /// Header size: where the first record of a data block starts.
    #[must_use]
    pub fn data_entry_offset(self) -> usize {
        match self {
            Self::V2 | Self::V2Ftype => DIR2_DATA_HDR_SIZE,
            Self::V3 => DIR3_DATA_HDR_SIZE,
        }
    }

    #[must_use]
    pub fn data_bestfree_offset(self) -> usize {
        match self {
            Self::V2 | Self::V2Ftype => DIR2_BESTFREE_OFFSET,
            Self::V3 => DIR3_BESTFREE_OFFSET,
        }
    }

    /// Offset of the tag word of the entry at `entry_off`.
    #[must_use]
    pub fn data_entry_tag_offset(self, entry_off: usize, namelen: usize) -> usize {
        entry_off + self.data_entsize(namelen) - TAG_SIZE
    }

    /// `.` always sits first in data block 0.
    #[must_use]
    pub fn data_dot_offset(self) -> usize {
        self.data_entry_offset()
    }

    #[must_use]
    pub fn data_dotdot_offset(self) -> usize {
        self.data_dot_offset() + self.data_entsize(1)
    }

    #[must_use]
    pub fn data_first_offset(self) -> usize {
        self.data_dotdot_offset() + self.data_entsize(2)
    }

    /// File type of the entry at `entry_off`; `Unknown` on variants without
    /// a file type byte.
    pub fn data_get_ftype(self, block: &[u8], entry_off: usize) -> Result<FileType, ParseError> {
        Ok(FileType::from_raw(self.data_raw_ftype(block, entry_off)?))
    }

    /// The stored file type byte, unclamped. Always 0 on legacy entries.
    pub fn data_raw_ftype(self, block: &[u8], entry_off: usize) -> Result<u8, ParseError> {
        if !self.has_ftype() {
            return Ok(FileType::Unknown.raw());
        }
        let namelen = usize::from(read_u8(block, entry_off + ENTRY_NAMELEN_OFF)?);
        read_u8(block, entry_off + ENTRY_NAME_OFF + namelen)
    }

    pub fn data_put_ftype(
        self,
        block: &mut [u8],
        entry_off: usize,
        ftype: FileType,
    ) -> Result<(), ParseError> {
        if !self.has_ftype() {
            return Ok(());
        }
        let namelen = usize::from(read_u8(block, entry_off + ENTRY_NAMELEN_OFF)?);
        if namelen == 0 {
            return Err(ParseError::InvalidField {
                field: "namelen",
                reason: "file type written to an entry without a name",
            });
        }
        write_u8(block, entry_off + ENTRY_NAME_OFF + namelen, ftype.raw())
    }

    // ── Shortform (inline) directories ──────────────────────────────────────

    /// namelen + offset + name + [ftype] + inode number.
    #[must_use]
    pub fn sf_entsize(self, i8count: bool, namelen: usize) -> usize {
        let base = 3 + namelen + sf_ino_size(i8count);
        if self.has_ftype() { base + 1 } else { base }
    }

    /// Offset of the entry following the one at `entry_off`.
    pub fn sf_nextentry(self, sf: &[u8], i8count: bool, entry_off: usize) -> Result<usize, ParseError> {
        let namelen = usize::from(read_u8(sf, entry_off)?);
        Ok(entry_off + self.sf_entsize(i8count, namelen))
    }

    pub fn sf_get_ftype(self, sf: &[u8], entry_off: usize) -> Result<FileType, ParseError> {
        if !self.has_ftype() {
            return Ok(FileType::Unknown);
        }
        let namelen = usize::from(read_u8(sf, entry_off)?);
        Ok(FileType::from_raw(read_u8(sf, entry_off + 3 + namelen)?))
    }

    pub fn sf_put_ftype(self, sf: &mut [u8], entry_off: usize, ftype: FileType) -> Result<(), ParseError> {
        if !self.has_ftype() {
            return Ok(());
        }
        let namelen = usize::from(read_u8(sf, entry_off)?);
        write_u8(sf, entry_off + 3 + namelen, ftype.raw())
    }

    fn sf_ino_offset(self, sf: &[u8], entry_off: usize) -> Result<usize, ParseError> {
        let namelen = usize::from(read_u8(sf, entry_off)?);
        let ftype = usize::from(self.has_ftype());
        Ok(entry_off + 3 + namelen + ftype)
    }

    pub fn sf_get_ino(self, sf: &[u8], i8count: bool, entry_off: usize) -> Result<u64, ParseError> {
        sf_read_ino(sf, i8count, self.sf_ino_offset(sf, entry_off)?)
    }

    pub fn sf_put_ino(
        self,
        sf: &mut [u8],
        i8count: bool,
        entry_off: usize,
        ino: u64,
    ) -> Result<(), ParseError> {
        let at = self.sf_ino_offset(sf, entry_off)?;
        sf_write_ino(sf, i8count, at, ino)
    }

    pub fn sf_get_parent_ino(self, sf: &[u8]) -> Result<u64, ParseError> {
        Ok(ShortformHdr::parse(sf)?.parent)
    }

    pub fn sf_put_parent_ino(self, sf: &mut [u8], ino: u64) -> Result<(), ParseError> {
        let i8count = read_u8(sf, 1)? != 0;
        sf_write_ino(sf, i8count, 2, ino)
    }

    // ── Leaf blocks ─────────────────────────────────────────────────────────

    #[must_use]
    pub fn leaf_hdr_size(self) -> usize {
        match self {
            Self::V2 | Self::V2Ftype => 16,
            Self::V3 => 64,
        }
    }

    /// Leaf entries start right after the header.
    #[must_use]
    pub fn leaf_ents_offset(self) -> usize {
        self.leaf_hdr_size()
    }

    #[must_use]
    pub fn leaf_max_ents(self, geo: &DirGeometry) -> usize {
        (geo.blksize_usize() - self.leaf_hdr_size()) / 8
    }

    pub fn leaf_hdr_from_disk(self, leaf: &[u8]) -> Result<LeafHdr, ParseError> {
        let (count_off, valid) = match self {
            Self::V2 | Self::V2Ftype => (12, [DIR2_LEAF1_MAGIC, DIR2_LEAFN_MAGIC]),
            Self::V3 => (56, [DIR3_LEAF1_MAGIC, DIR3_LEAFN_MAGIC]),
        };
        let magic = read_be_u16(leaf, 8)?;
        if !valid.contains(&magic) {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(valid[0]),
                actual: u64::from(magic),
            });
        }
        Ok(LeafHdr {
            forw: read_be_u32(leaf, 0)?,
            back: read_be_u32(leaf, 4)?,
            magic,
            count: read_be_u16(leaf, count_off)?,
            stale: read_be_u16(leaf, count_off + 2)?,
        })
    }

    pub fn leaf_hdr_to_disk(self, leaf: &mut [u8], hdr: &LeafHdr) -> Result<(), ParseError> {
        let count_off = match self {
            Self::V2 | Self::V2Ftype => 12,
            Self::V3 => 56,
        };
        write_be_u32(leaf, 0, hdr.forw)?;
        write_be_u32(leaf, 4, hdr.back)?;
        write_be_u16(leaf, 8, hdr.magic)?;
        write_be_u16(leaf, count_off, hdr.count)?;
        write_be_u16(leaf, count_off + 2, hdr.stale)
    }

    // ── Node blocks ─────────────────────────────────────────────────────────

    #[must_use]
    pub fn node_hdr_size(self) -> usize {
        self.node_ops().node_hdr_size()
    }

    pub fn node_hdr_from_disk(self, node: &[u8]) -> Result<NodeHdr, ParseError> {
        self.node_ops().node_hdr_from_disk(node)
    }

    pub fn node_hdr_to_disk(self, node: &mut [u8], hdr: &NodeHdr) -> Result<(), ParseError> {
        self.node_ops().node_hdr_to_disk(node, hdr)
    }

    #[must_use]
    pub fn node_tree_offset(self) -> usize {
        self.node_ops().node_tree_offset()
    }

    // ── Free-index blocks ───────────────────────────────────────────────────

    #[must_use]
    pub fn free_hdr_size(self) -> usize {
        match self {
            Self::V2 | Self::V2Ftype => 16,
            Self::V3 => 64,
        }
    }

    #[must_use]
    pub fn free_bests_offset(self) -> usize {
        self.free_hdr_size()
    }

    /// Best-free entries (2 bytes each) per free-index block.
    #[must_use]
    pub fn free_max_bests(self, geo: &DirGeometry) -> usize {
        (geo.blksize_usize() - self.free_hdr_size()) / 2
    }

    /// Free-index block that covers data block `db`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // max_bests < 2^15
    pub fn db_to_fdb(self, geo: &DirGeometry, db: DirBlock) -> DirBlock {
        let per_block = self.free_max_bests(geo) as u32;
        DirBlock(geo.byte_to_db(FREE_OFFSET).0 + db.0 / per_block)
    }

    /// Slot of data block `db` within its free-index block.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // max_bests < 2^15
    pub fn db_to_fdindex(self, geo: &DirGeometry, db: DirBlock) -> usize {
        let per_block = self.free_max_bests(geo) as u32;
        (db.0 % per_block) as usize
    }

    pub fn free_hdr_from_disk(self, free: &[u8]) -> Result<FreeHdr, ParseError> {
        let (expected, first_off) = match self {
            Self::V2 | Self::V2Ftype => (DIR2_FREE_MAGIC, 4),
            Self::V3 => (DIR3_FREE_MAGIC, 48),
        };
        let magic = read_be_u32(free, 0)?;
        if magic != expected {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(expected),
                actual: u64::from(magic),
            });
        }
        Ok(FreeHdr {
            magic,
            firstdb: read_be_u32(free, first_off)?,
            nvalid: read_be_u32(free, first_off + 4)?,
            nused: read_be_u32(free, first_off + 8)?,
        })
    }

    pub fn free_hdr_to_disk(self, free: &mut [u8], hdr: &FreeHdr) -> Result<(), ParseError> {
        let first_off = match self {
            Self::V2 | Self::V2Ftype => 4,
            Self::V3 => 48,
        };
        write_be_u32(free, 0, hdr.magic)?;
        write_be_u32(free, first_off, hdr.firstdb)?;
        write_be_u32(free, first_off + 4, hdr.nvalid)?;
        write_be_u32(free, first_off + 8, hdr.nused)
    }
}

impl NodeOps {
    #[must_use]
    pub fn for_features(features: DirFeatures) -> Self {
        if features.crc { Self::V3 } else { Self::V2 }
    }

    #[must_use]
    pub fn select(features: DirFeatures, override_ops: Option<Self>) -> Self {
        override_ops.unwrap_or_else(|| Self::for_features(features))
    }

    #[must_use]
    pub fn node_hdr_size(self) -> usize {
        match self {
            Self::V2 => 16,
            Self::V3 => 64,
        }
    }

    #[must_use]
    pub fn node_tree_offset(self) -> usize {
        self.node_hdr_size()
    }

    fn layout(self) -> (u16, usize) {
        match self {
            Self::V2 => (DA_NODE_MAGIC, 12),
            Self::V3 => (DA3_NODE_MAGIC, 56),
        }
    }

    pub fn node_hdr_from_disk(self, node: &[u8]) -> Result<NodeHdr, ParseError> {
        let (expected, count_off) = self.layout();
        let magic = read_be_u16(node, 8)?;
        if magic != expected {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(expected),
                actual: u64::from(magic),
            });
        }
        Ok(NodeHdr {
            forw: read_be_u32(node, 0)?,
            back: read_be_u32(node, 4)?,
            magic,
            count: read_be_u16(node, count_off)?,
            level: read_be_u16(node, count_off + 2)?,
        })
    }

    pub fn node_hdr_to_disk(self, node: &mut [u8], hdr: &NodeHdr) -> Result<(), ParseError> {
        let (_, count_off) = self.layout();
        write_be_u32(node, 0, hdr.forw)?;
        write_be_u32(node, 4, hdr.back)?;
        write_be_u16(node, 8, hdr.magic)?;
        write_be_u16(node, count_off, hdr.count)?;
        write_be_u16(node, count_off + 2, hdr.level)
    }
}

// ── Decoded headers ─────────────────────────────────────────────────────────

/// Shortform directory header: entry count, count of entries that need
/// 8-byte inode numbers, and the parent inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortformHdr {
    pub count: u8,
    pub i8count: u8,
    pub parent: u64,
}

impl ShortformHdr {
    pub fn parse(sf: &[u8]) -> Result<Self, ParseError> {
        let count = read_u8(sf, 0)?;
        let i8count = read_u8(sf, 1)?;
        Ok(Self {
            count,
            i8count,
            parent: sf_read_ino(sf, i8count != 0, 2)?,
        })
    }

    pub fn write(&self, sf: &mut [u8]) -> Result<(), ParseError> {
        write_u8(sf, 0, self.count)?;
        write_u8(sf, 1, self.i8count)?;
        sf_write_ino(sf, self.i8count != 0, 2, self.parent)
    }

    /// Header size; the first entry starts here.
    #[must_use]
    pub fn size(&self) -> usize {
        2 + sf_ino_size(self.i8count != 0)
    }
}

/// In-core leaf header, independent of variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafHdr {
    pub forw: u32,
    pub back: u32,
    pub magic: u16,
    pub count: u16,
    pub stale: u16,
}

/// In-core da-node header, independent of variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHdr {
    pub forw: u32,
    pub back: u32,
    pub magic: u16,
    pub count: u16,
    pub level: u16,
}

/// In-core free-index header, independent of variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeHdr {
    pub magic: u32,
    pub firstdb: u32,
    pub nvalid: u32,
    pub nused: u32,
}

const SF_INO64_MASK: u64 = 0x00ff_ffff_ffff_ffff;

fn sf_ino_size(i8count: bool) -> usize {
    if i8count { 8 } else { 4 }
}

fn sf_read_ino(sf: &[u8], i8count: bool, at: usize) -> Result<u64, ParseError> {
    if i8count {
        Ok(read_be_u64(sf, at)? & SF_INO64_MASK)
    } else {
        Ok(u64::from(read_be_u32(sf, at)?))
    }
}

fn sf_write_ino(sf: &mut [u8], i8count: bool, at: usize, ino: u64) -> Result<(), ParseError> {
    if ino & !SF_INO64_MASK != 0 {
        return Err(ParseError::InvalidField {
            field: "sf_ino",
            reason: "most significant byte must be zero",
        });
    }
    if i8count {
        write_be_u64(sf, at, ino)
    } else {
        let narrow = u32::try_from(ino).map_err(|_| ParseError::IntegerConversion {
            field: "sf_ino",
        })?;
        write_be_u32(sf, at, narrow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [DirOps; 3] = [DirOps::V2, DirOps::V2Ftype, DirOps::V3];

    #[test]
    fn selection_rule() {
        let none = DirFeatures::default();
        let ftype = DirFeatures {
            crc: false,
            ftype: true,
        };
        let crc = DirFeatures {
            crc: true,
            ftype: true,
        };
        assert_eq!(DirOps::for_features(none), DirOps::V2);
        assert_eq!(DirOps::for_features(ftype), DirOps::V2Ftype);
        assert_eq!(DirOps::for_features(crc), DirOps::V3);
        // crc wins even without ftype
        assert_eq!(
            DirOps::for_features(DirFeatures {
                crc: true,
                ftype: false
            }),
            DirOps::V3
        );
        assert_eq!(DirOps::select(crc, Some(DirOps::V2)), DirOps::V2);
        assert_eq!(NodeOps::for_features(crc), NodeOps::V3);
        assert_eq!(NodeOps::for_features(ftype), NodeOps::V2);
        assert_eq!(NodeOps::select(none, Some(NodeOps::V3)), NodeOps::V3);
    }

    #[test]
    fn entry_sizes() {
        assert_eq!(DirOps::V2.data_entsize(1), 16);
        assert_eq!(DirOps::V2.data_entsize(5), 16);
        assert_eq!(DirOps::V2.data_entsize(6), 24);
        assert_eq!(DirOps::V2Ftype.data_entsize(1), 16);
        assert_eq!(DirOps::V2Ftype.data_entsize(4), 16);
        assert_eq!(DirOps::V2Ftype.data_entsize(5), 24);
        assert_eq!(DirOps::V3.data_entsize(255), 272);
        for ops in ALL {
            for namelen in 1..256 {
                let size = ops.data_entsize(namelen);
                assert_eq!(size % DATA_ALIGN, 0);
                assert!(size >= ENTRY_NAME_OFF + namelen + TAG_SIZE);
            }
        }
    }

    #[test]
    fn header_offsets() {
        assert_eq!(DirOps::V2.data_entry_offset(), 16);
        assert_eq!(DirOps::V2Ftype.data_entry_offset(), 16);
        assert_eq!(DirOps::V3.data_entry_offset(), 64);
        assert_eq!(DirOps::V2.data_bestfree_offset(), 4);
        assert_eq!(DirOps::V3.data_bestfree_offset(), 48);
        assert_eq!(DirOps::V2Ftype.data_dot_offset(), 16);
        assert_eq!(DirOps::V2Ftype.data_dotdot_offset(), 32);
        assert_eq!(DirOps::V2Ftype.data_first_offset(), 48);
        assert_eq!(DirOps::V3.data_first_offset(), 96);
        assert_eq!(DirOps::V2Ftype.data_entry_tag_offset(16, 1), 30);
    }

    #[test]
    fn ftype_accessors() {
        let mut block = vec![0_u8; 64];
        block[16 + ENTRY_NAMELEN_OFF] = 2;
        block[16 + ENTRY_NAME_OFF..16 + ENTRY_NAME_OFF + 2].copy_from_slice(b"bb");

        DirOps::V2Ftype
            .data_put_ftype(&mut block, 16, FileType::Dir)
            .unwrap();
        assert_eq!(block[16 + ENTRY_NAME_OFF + 2], 2);
        assert_eq!(
            DirOps::V2Ftype.data_get_ftype(&block, 16).unwrap(),
            FileType::Dir
        );
        assert_eq!(DirOps::V2.data_get_ftype(&block, 16).unwrap(), FileType::Unknown);

        // legacy put is a no-op
        let before = block.clone();
        DirOps::V2.data_put_ftype(&mut block, 16, FileType::Fifo).unwrap();
        assert_eq!(block, before);

        // out-of-range values read back as unknown, raw keeps them
        block[16 + ENTRY_NAME_OFF + 2] = 9;
        assert_eq!(DirOps::V3.data_get_ftype(&block, 16).unwrap(), FileType::Unknown);
        assert_eq!(DirOps::V3.data_raw_ftype(&block, 16).unwrap(), 9);
    }

    #[test]
    fn shortform_accessors() {
        let mut sf = vec![0_u8; 64];
        let hdr = ShortformHdr {
            count: 1,
            i8count: 0,
            parent: 128,
        };
        hdr.write(&mut sf).unwrap();
        assert_eq!(hdr.size(), 6);
        let entry = hdr.size();
        sf[entry] = 3;
        write_be_u16(&mut sf, entry + 1, 0x60).unwrap();
        sf[entry + 3..entry + 6].copy_from_slice(b"foo");

        let ops = DirOps::V2Ftype;
        assert_eq!(ops.sf_entsize(false, 3), 3 + 3 + 1 + 4);
        assert_eq!(DirOps::V2.sf_entsize(true, 3), 3 + 3 + 8);
        ops.sf_put_ftype(&mut sf, entry, FileType::Symlink).unwrap();
        ops.sf_put_ino(&mut sf, false, entry, 0x1234).unwrap();
        assert_eq!(ops.sf_get_ftype(&sf, entry).unwrap(), FileType::Symlink);
        assert_eq!(ops.sf_get_ino(&sf, false, entry).unwrap(), 0x1234);
        assert_eq!(ops.sf_nextentry(&sf, false, entry).unwrap(), entry + 11);
        assert_eq!(ops.sf_get_parent_ino(&sf).unwrap(), 128);
        ops.sf_put_parent_ino(&mut sf, 256).unwrap();
        assert_eq!(ShortformHdr::parse(&sf).unwrap().parent, 256);

        // 4-byte slots cannot hold wide inode numbers
        assert!(ops.sf_put_ino(&mut sf, false, entry, 1 << 40).is_err());
        assert!(ops.sf_put_ino(&mut sf, true, entry, 0xff << 56).is_err());
    }

    #[test]
    fn leaf_and_node_headers() {
        let geo = DirGeometry::new(12, 0, 16).unwrap();
        let mut blk = vec![0_u8; 4096];
        let leaf = LeafHdr {
            forw: 1,
            back: 2,
            magic: DIR3_LEAFN_MAGIC,
            count: 10,
            stale: 3,
        };
        DirOps::V3.leaf_hdr_to_disk(&mut blk, &leaf).unwrap();
        assert_eq!(DirOps::V3.leaf_hdr_from_disk(&blk).unwrap(), leaf);
        assert!(DirOps::V2.leaf_hdr_from_disk(&blk).is_err());
        assert_eq!(DirOps::V3.leaf_max_ents(&geo), (4096 - 64) / 8);
        assert_eq!(DirOps::V2.leaf_max_ents(&geo), (4096 - 16) / 8);

        let node = NodeHdr {
            forw: 0,
            back: 0,
            magic: DA_NODE_MAGIC,
            count: 5,
            level: 1,
        };
        NodeOps::V2.node_hdr_to_disk(&mut blk, &node).unwrap();
        assert_eq!(DirOps::V2Ftype.node_hdr_from_disk(&blk).unwrap(), node);
        assert!(NodeOps::V3.node_hdr_from_disk(&blk).is_err());
        assert_eq!(DirOps::V3.node_hdr_size(), 64);
        assert_eq!(DirOps::V2.node_tree_offset(), 16);
    }

    #[test]
    fn free_index_mapping() {
        let geo = DirGeometry::new(12, 0, 16).unwrap();
        let ops = DirOps::V2Ftype;
        assert_eq!(ops.free_max_bests(&geo), (4096 - 16) / 2);
        let first = geo.byte_to_db(FREE_OFFSET);
        assert_eq!(ops.db_to_fdb(&geo, DirBlock(0)), first);
        assert_eq!(ops.db_to_fdb(&geo, DirBlock(2040)), DirBlock(first.0 + 1));
        assert_eq!(ops.db_to_fdindex(&geo, DirBlock(2041)), 1);

        let mut blk = vec![0_u8; 4096];
        let hdr = FreeHdr {
            magic: DIR3_FREE_MAGIC,
            firstdb: 0,
            nvalid: 4,
            nused: 3,
        };
        DirOps::V3.free_hdr_to_disk(&mut blk, &hdr).unwrap();
        assert_eq!(DirOps::V3.free_hdr_from_disk(&blk).unwrap(), hdr);
        assert!(DirOps::V2.free_hdr_from_disk(&blk).is_err());
        assert_eq!(DirOps::V3.free_bests_offset(), 64);
    }
}
