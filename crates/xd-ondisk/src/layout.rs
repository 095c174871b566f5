//! Byte layout of directory data blocks.
//!
//! ```text
//!  legacy header (16)        v3 header (64)
//!  +-------+----------+      +-------+-----+-------+-----+------+-------+----------+-----+
//!  | magic | bestfree |      | magic | crc | blkno | lsn | uuid | owner | bestfree | pad |
//!  +-------+----------+      +-------+-----+-------+-----+------+-------+----------+-----+
//!  0       4          16     0       4     8       16    24     40      48         60    64
//!
//!  active entry:  inumber(8) namelen(1) name(n) [ftype(1)] .. pad .. tag(2)
//!  unused region: freetag(2)=0xFFFF length(2) ........ payload ....... tag(2)
//!
//!  block-format trailer:  leaf[count] = (hashval:be32, address:be32)  tail = (count, stale)
//! ```
//!
//! All fields are big-endian except the v3 CRC, which is stored
//! little-endian.

use serde::{Deserialize, Serialize};
use xd_types::{
    FsUuid, ParseError, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK,
    read_be_u16, read_be_u32, read_be_u64, read_fixed, read_le_u32, write_be_u16, write_be_u32,
    write_be_u64, write_bytes, write_le_u32,
};

// ── Magic numbers ───────────────────────────────────────────────────────────

/// "XD2D": legacy multi-block data block.
pub const DIR2_DATA_MAGIC: u32 = 0x5844_3244;
/// "XD2B": legacy single-block directory.
pub const DIR2_BLOCK_MAGIC: u32 = 0x5844_3242;
/// "XDD3": v3 multi-block data block.
pub const DIR3_DATA_MAGIC: u32 = 0x5844_4433;
/// "XDB3": v3 single-block directory.
pub const DIR3_BLOCK_MAGIC: u32 = 0x5844_4233;
/// "XD2F": legacy free-index block.
pub const DIR2_FREE_MAGIC: u32 = 0x5844_3246;
/// "XDF3": v3 free-index block.
pub const DIR3_FREE_MAGIC: u32 = 0x5844_4633;

pub const DA_NODE_MAGIC: u16 = 0xfebe;
pub const DA3_NODE_MAGIC: u16 = 0x3ebe;
pub const DIR2_LEAF1_MAGIC: u16 = 0xd2f1;
pub const DIR2_LEAFN_MAGIC: u16 = 0xd2ff;
pub const DIR3_LEAF1_MAGIC: u16 = 0x3df1;
pub const DIR3_LEAFN_MAGIC: u16 = 0x3dff;

// ── Data block constants ────────────────────────────────────────────────────

/// Sentinel in the first two bytes of an unused region.
pub const DATA_FREE_TAG: u16 = 0xFFFF;
pub const DATA_ALIGN_LOG: u32 = 3;
/// Every record starts on a multiple of this.
pub const DATA_ALIGN: usize = 1 << DATA_ALIGN_LOG;
/// Number of best-free slots in a data header.
pub const DATA_FD_COUNT: usize = 3;
/// Leaf address of a stale (tombstoned) entry.
pub const NULL_DATAPTR: u32 = 0xFFFF_FFFF;
/// Includes the trailing NUL, so names are at most `MAXNAMELEN - 1` bytes.
pub const MAXNAMELEN: usize = 256;

pub const DIR2_DATA_HDR_SIZE: usize = 16;
pub const DIR3_DATA_HDR_SIZE: usize = 64;
pub const DIR3_BLK_HDR_SIZE: usize = 48;
pub const DIR2_BESTFREE_OFFSET: usize = 4;
pub const DIR3_BESTFREE_OFFSET: usize = 48;
pub const DIR3_DATA_CRC_OFF: usize = 4;
pub const BESTFREE_SLOT_SIZE: usize = 4;

// Active entry field offsets, relative to the entry start.
pub const ENTRY_INUMBER_OFF: usize = 0;
pub const ENTRY_NAMELEN_OFF: usize = 8;
pub const ENTRY_NAME_OFF: usize = 9;

// Unused region field offsets, relative to the region start.
pub const UNUSED_FREETAG_OFF: usize = 0;
pub const UNUSED_LENGTH_OFF: usize = 2;
/// freetag + length: the part of an unused region that is logged up front.
pub const UNUSED_HDR_SIZE: usize = 4;
/// Size of an entry or unused-region tag word.
pub const TAG_SIZE: usize = 2;

pub const BLOCK_TAIL_SIZE: usize = 8;
pub const LEAF_ENTRY_SIZE: usize = 8;

// ── Directory address spaces ────────────────────────────────────────────────

pub const SPACE_SIZE: u64 = 1 << 35;
pub const DATA_SPACE: u32 = 0;
pub const LEAF_SPACE: u32 = 1;
pub const FREE_SPACE: u32 = 2;
pub const DATA_OFFSET: u64 = 0;
pub const LEAF_OFFSET: u64 = SPACE_SIZE;
pub const FREE_OFFSET: u64 = 2 * SPACE_SIZE;

// ── Magic ───────────────────────────────────────────────────────────────────

/// The four magics a data-bearing directory block may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataMagic {
    Dir2Data,
    Dir2Block,
    Dir3Data,
    Dir3Block,
}

impl DataMagic {
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            DIR2_DATA_MAGIC => Some(Self::Dir2Data),
            DIR2_BLOCK_MAGIC => Some(Self::Dir2Block),
            DIR3_DATA_MAGIC => Some(Self::Dir3Data),
            DIR3_BLOCK_MAGIC => Some(Self::Dir3Block),
            _ => None,
        }
    }

    #[must_use]
    pub fn raw(self) -> u32 {
        match self {
            Self::Dir2Data => DIR2_DATA_MAGIC,
            Self::Dir2Block => DIR2_BLOCK_MAGIC,
            Self::Dir3Data => DIR3_DATA_MAGIC,
            Self::Dir3Block => DIR3_BLOCK_MAGIC,
        }
    }

    /// Single-block directory: the block ends in a leaf-hash trailer.
    #[must_use]
    pub fn is_block(self) -> bool {
        matches!(self, Self::Dir2Block | Self::Dir3Block)
    }

    #[must_use]
    pub fn is_v3(self) -> bool {
        matches!(self, Self::Dir3Data | Self::Dir3Block)
    }

    /// Read and classify the magic at the start of `block`.
    pub fn read(block: &[u8]) -> Result<Self, ParseError> {
        let raw = read_be_u32(block, 0)?;
        Self::from_raw(raw).ok_or(ParseError::InvalidMagic {
            expected: u64::from(DIR2_DATA_MAGIC),
            actual: u64::from(raw),
        })
    }
}

// ── File type ───────────────────────────────────────────────────────────────

/// File type byte stored after the name in filetype-capable variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileType {
    Unknown = 0,
    RegFile = 1,
    Dir = 2,
    Chrdev = 3,
    Blkdev = 4,
    Fifo = 5,
    Sock = 6,
    Symlink = 7,
}

impl FileType {
    /// One past the largest valid on-disk value.
    pub const MAX: u8 = 8;

    /// Values at or above [`FileType::MAX`] read back as `Unknown`.
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            1 => Self::RegFile,
            2 => Self::Dir,
            3 => Self::Chrdev,
            4 => Self::Blkdev,
            5 => Self::Fifo,
            6 => Self::Sock,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn raw(self) -> u8 {
        self as u8
    }

    /// Map the `S_IFMT` bits of an inode mode to a directory file type.
    #[must_use]
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::RegFile,
            S_IFDIR => Self::Dir,
            S_IFCHR => Self::Chrdev,
            S_IFBLK => Self::Blkdev,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Sock,
            S_IFLNK => Self::Symlink,
            _ => Self::Unknown,
        }
    }
}

// ── Best-free table ─────────────────────────────────────────────────────────

/// One `(offset, length)` slot of the best-free table. `(0, 0)` is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BestFree {
    pub offset: u16,
    pub length: u16,
}

impl BestFree {
    pub const EMPTY: Self = Self {
        offset: 0,
        length: 0,
    };

    #[must_use]
    pub fn new(offset: u16, length: u16) -> Self {
        Self { offset, length }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offset == 0 && self.length == 0
    }
}

pub type BestFreeTable = [BestFree; DATA_FD_COUNT];

pub fn read_bestfree(block: &[u8], bf_off: usize) -> Result<BestFreeTable, ParseError> {
    let mut table = [BestFree::EMPTY; DATA_FD_COUNT];
    for (i, slot) in table.iter_mut().enumerate() {
        let at = bf_off + i * BESTFREE_SLOT_SIZE;
        slot.offset = read_be_u16(block, at)?;
        slot.length = read_be_u16(block, at + 2)?;
    }
    Ok(table)
}

pub fn write_bestfree(
    block: &mut [u8],
    bf_off: usize,
    table: &BestFreeTable,
) -> Result<(), ParseError> {
    for (i, slot) in table.iter().enumerate() {
        let at = bf_off + i * BESTFREE_SLOT_SIZE;
        write_be_u16(block, at, slot.offset)?;
        write_be_u16(block, at + 2, slot.length)?;
    }
    Ok(())
}

// ── v3 self-describing header ───────────────────────────────────────────────

/// The 48-byte self-describing prefix shared by every v3 directory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dir3BlkHdr {
    pub magic: u32,
    pub crc: u32,
    pub blkno: u64,
    pub lsn: u64,
    pub uuid: FsUuid,
    pub owner: u64,
}

impl Dir3BlkHdr {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            magic: read_be_u32(block, 0)?,
            crc: read_le_u32(block, DIR3_DATA_CRC_OFF)?,
            blkno: read_be_u64(block, 8)?,
            lsn: read_be_u64(block, 16)?,
            uuid: FsUuid(read_fixed::<16>(block, 24)?),
            owner: read_be_u64(block, 40)?,
        })
    }

    pub fn write(&self, block: &mut [u8]) -> Result<(), ParseError> {
        write_be_u32(block, 0, self.magic)?;
        write_le_u32(block, DIR3_DATA_CRC_OFF, self.crc)?;
        write_be_u64(block, 8, self.blkno)?;
        write_be_u64(block, 16, self.lsn)?;
        write_bytes(block, 24, self.uuid.as_bytes())?;
        write_be_u64(block, 40, self.owner)
    }
}

/// Stamp the LSN field of a v3 header.
pub fn write_dir3_lsn(block: &mut [u8], lsn: u64) -> Result<(), ParseError> {
    write_be_u64(block, 16, lsn)
}

// ── Block-format trailer ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTail {
    pub count: u32,
    pub stale: u32,
}

impl BlockTail {
    /// Offset of the tail record in a block of `blksize` bytes.
    #[must_use]
    pub fn offset(blksize: usize) -> usize {
        blksize.saturating_sub(BLOCK_TAIL_SIZE)
    }

    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let at = Self::offset(block.len());
        Ok(Self {
            count: read_be_u32(block, at)?,
            stale: read_be_u32(block, at + 4)?,
        })
    }

    pub fn write(&self, block: &mut [u8]) -> Result<(), ParseError> {
        let at = Self::offset(block.len());
        write_be_u32(block, at, self.count)?;
        write_be_u32(block, at + 4, self.stale)
    }

    /// Start of the leaf array, or `None` if `count` cannot fit in front of
    /// the tail.
    #[must_use]
    pub fn leaf_offset(&self, blksize: usize) -> Option<usize> {
        let count = usize::try_from(self.count).ok()?;
        let bytes = count.checked_mul(LEAF_ENTRY_SIZE)?;
        Self::offset(blksize).checked_sub(bytes)
    }
}

/// One `(hashval, address)` pair of a leaf array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafEntry {
    pub hashval: u32,
    pub address: u32,
}

impl LeafEntry {
    pub fn parse_at(block: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            hashval: read_be_u32(block, offset)?,
            address: read_be_u32(block, offset + 4)?,
        })
    }

    pub fn write_at(&self, block: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_be_u32(block, offset, self.hashval)?;
        write_be_u32(block, offset + 4, self.address)
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.address == NULL_DATAPTR
    }
}

/// First byte past the usable payload: the block end for data magic, the
/// leaf array for block magic.
pub fn data_endpoint(block: &[u8]) -> Result<usize, ParseError> {
    let magic = DataMagic::read(block)?;
    if !magic.is_block() {
        return Ok(block.len());
    }
    BlockTail::parse(block)?
        .leaf_offset(block.len())
        .ok_or(ParseError::InvalidField {
            field: "block_tail.count",
            reason: "leaf array does not fit in block",
        })
}
