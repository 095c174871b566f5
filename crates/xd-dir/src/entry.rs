//! Records of a data block: active entries and unused regions.
//!
//! Offsets are block-relative. Nothing here checks block-level invariants;
//! the verifier does that. Accessors fail only when a field would fall
//! outside the block.

use crate::CorruptAt;
use xd_error::{DirError, Result};
use xd_ondisk::layout::{
    DATA_ALIGN, DATA_FREE_TAG, ENTRY_INUMBER_OFF, ENTRY_NAME_OFF, ENTRY_NAMELEN_OFF, MAXNAMELEN,
    TAG_SIZE, UNUSED_FREETAG_OFF, UNUSED_LENGTH_OFF, data_endpoint,
};
use xd_ondisk::{DirOps, FileType};
use xd_types::{
    ParseError, ensure_slice, ensure_slice_mut, read_be_u16, read_be_u64, read_u8, usize_to_u16,
    write_be_u16, write_be_u64, write_bytes, write_u8,
};

// ── Unused regions ──────────────────────────────────────────────────────────

/// True when the record at `off` starts with the free tag.
pub fn is_unused(block: &[u8], off: usize) -> Result<bool, ParseError> {
    Ok(read_be_u16(block, off + UNUSED_FREETAG_OFF)? == DATA_FREE_TAG)
}

pub fn unused_length(block: &[u8], off: usize) -> Result<usize, ParseError> {
    Ok(usize::from(read_be_u16(block, off + UNUSED_LENGTH_OFF)?))
}

/// Offset of the tag word of an unused region of `len` bytes.
#[must_use]
pub fn unused_tag_offset(off: usize, len: usize) -> usize {
    (off + len).saturating_sub(TAG_SIZE)
}

/// The stored tag of the unused region at `off`.
pub fn unused_tag(block: &[u8], off: usize) -> Result<usize, ParseError> {
    let len = unused_length(block, off)?;
    if len < TAG_SIZE {
        return Err(ParseError::InvalidField {
            field: "unused.length",
            reason: "shorter than its tag",
        });
    }
    Ok(usize::from(read_be_u16(block, unused_tag_offset(off, len))?))
}

/// Write a whole unused region header: free tag, length, and tag.
pub fn write_unused(block: &mut [u8], off: usize, len: usize) -> Result<(), ParseError> {
    write_be_u16(block, off + UNUSED_FREETAG_OFF, DATA_FREE_TAG)?;
    set_unused_length(block, off, len)
}

/// Resize the unused region at `off` and move its tag.
pub fn set_unused_length(block: &mut [u8], off: usize, len: usize) -> Result<(), ParseError> {
    write_be_u16(block, off + UNUSED_LENGTH_OFF, usize_to_u16(len, "unused.length")?)?;
    write_be_u16(
        block,
        unused_tag_offset(off, len),
        usize_to_u16(off, "unused.tag")?,
    )
}

// ── Active entries ──────────────────────────────────────────────────────────

pub fn entry_ino(block: &[u8], off: usize) -> Result<u64, ParseError> {
    read_be_u64(block, off + ENTRY_INUMBER_OFF)
}

pub fn entry_namelen(block: &[u8], off: usize) -> Result<usize, ParseError> {
    Ok(usize::from(read_u8(block, off + ENTRY_NAMELEN_OFF)?))
}

pub fn entry_name(block: &[u8], off: usize) -> Result<&[u8], ParseError> {
    let namelen = entry_namelen(block, off)?;
    ensure_slice(block, off + ENTRY_NAME_OFF, namelen)
}

/// The stored tag of the entry at `off`.
pub fn entry_tag(ops: DirOps, block: &[u8], off: usize) -> Result<usize, ParseError> {
    let namelen = entry_namelen(block, off)?;
    Ok(usize::from(read_be_u16(
        block,
        ops.data_entry_tag_offset(off, namelen),
    )?))
}

/// Write an active entry at `off` and return its aligned size.
///
/// Padding between the name (or file type byte) and the tag is zeroed.
pub fn write_entry(
    ops: DirOps,
    block: &mut [u8],
    off: usize,
    ino: u64,
    name: &[u8],
    ftype: FileType,
) -> Result<usize, ParseError> {
    if name.is_empty() || name.len() >= MAXNAMELEN {
        return Err(ParseError::InvalidField {
            field: "namelen",
            reason: "must be in 1..=255",
        });
    }
    let size = ops.data_entsize(name.len());
    ensure_slice_mut(block, off, size)?.fill(0);
    write_be_u64(block, off + ENTRY_INUMBER_OFF, ino)?;
    #[allow(clippy::cast_possible_truncation)] // checked against MAXNAMELEN above
    write_u8(block, off + ENTRY_NAMELEN_OFF, name.len() as u8)?;
    write_bytes(block, off + ENTRY_NAME_OFF, name)?;
    ops.data_put_ftype(block, off, ftype)?;
    write_be_u16(
        block,
        ops.data_entry_tag_offset(off, name.len()),
        usize_to_u16(off, "entry.tag")?,
    )?;
    Ok(size)
}

/// Rewrite the inode number (and file type, where stored) of the entry at
/// `off` in place.
pub fn set_entry_target(
    ops: DirOps,
    block: &mut [u8],
    off: usize,
    ino: u64,
    ftype: FileType,
) -> Result<(), ParseError> {
    write_be_u64(block, off + ENTRY_INUMBER_OFF, ino)?;
    ops.data_put_ftype(block, off, ftype)
}

// ── Walking ─────────────────────────────────────────────────────────────────

/// One record of a data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record<'b> {
    Entry {
        offset: usize,
        ino: u64,
        name: &'b [u8],
        ftype: FileType,
        size: usize,
    },
    Unused {
        offset: usize,
        length: usize,
    },
}

impl Record<'_> {
    #[must_use]
    pub fn offset(&self) -> usize {
        match self {
            Self::Entry { offset, .. } | Self::Unused { offset, .. } => *offset,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Entry { size, .. } => *size,
            Self::Unused { length, .. } => *length,
        }
    }
}

/// Iterator over the records between the header and the end of the data
/// region.
///
/// Stops after the first error: a record that cannot be sized leaves no
/// way to find the next one.
#[derive(Debug)]
pub struct RecordWalk<'b> {
    ops: DirOps,
    block: &'b [u8],
    daddr: u64,
    pos: usize,
    end: usize,
    done: bool,
}

impl<'b> RecordWalk<'b> {
    pub fn new(ops: DirOps, daddr: u64, block: &'b [u8]) -> Result<Self> {
        let end = data_endpoint(block).at(daddr, 0)?;
        Ok(Self {
            ops,
            block,
            daddr,
            pos: ops.data_entry_offset(),
            end,
            done: false,
        })
    }

    /// First byte past the data region.
    #[must_use]
    pub fn end(&self) -> usize {
        self.end
    }

    fn corrupt(&mut self, detail: impl Into<String>) -> DirError {
        self.done = true;
        DirError::corrupted(self.daddr, self.pos, detail)
    }

    fn step(&mut self) -> Result<Record<'b>> {
        let off = self.pos;
        let (block, end) = (self.block, self.end);
        let size_ok = |size: usize| size > 0 && size % DATA_ALIGN == 0 && off + size <= end;

        if is_unused(block, off).at(self.daddr, off)? {
            let length = unused_length(block, off).at(self.daddr, off)?;
            if !size_ok(length) {
                return Err(self.corrupt(format!("unused region length {length}")));
            }
            return Ok(Record::Unused {
                offset: off,
                length,
            });
        }
        let name = entry_name(block, off).at(self.daddr, off)?;
        let size = self.ops.data_entsize(name.len());
        if name.is_empty() || !size_ok(size) {
            return Err(self.corrupt(format!("entry name length {}", name.len())));
        }
        Ok(Record::Entry {
            offset: off,
            ino: entry_ino(block, off).at(self.daddr, off)?,
            name,
            ftype: self.ops.data_get_ftype(block, off).at(self.daddr, off)?,
            size,
        })
    }
}

impl<'b> Iterator for RecordWalk<'b> {
    type Item = Result<Record<'b>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.end {
            return None;
        }
        match self.step() {
            Ok(record) => {
                self.pos += record.size();
                Some(Ok(record))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xd_ondisk::layout::DIR2_DATA_MAGIC;
    use xd_types::write_be_u32;

    fn data_block() -> Vec<u8> {
        let mut block = vec![0_u8; 4096];
        write_be_u32(&mut block, 0, DIR2_DATA_MAGIC).unwrap();
        block
    }

    #[test]
    fn unused_region_fields() {
        let mut block = data_block();
        write_unused(&mut block, 16, 4080).unwrap();
        assert!(is_unused(&block, 16).unwrap());
        assert_eq!(unused_length(&block, 16).unwrap(), 4080);
        assert_eq!(unused_tag_offset(16, 4080), 4094);
        assert_eq!(unused_tag(&block, 16).unwrap(), 16);

        set_unused_length(&mut block, 16, 32).unwrap();
        assert_eq!(unused_length(&block, 16).unwrap(), 32);
        assert_eq!(unused_tag(&block, 16).unwrap(), 16);
        assert_eq!(read_be_u16(&block, 46).unwrap(), 16);
    }

    #[test]
    fn entry_fields_with_ftype() {
        let mut block = data_block();
        let size = write_entry(DirOps::V2Ftype, &mut block, 16, 0x80, b"hello", FileType::RegFile)
            .unwrap();
        // 8 + 1 + 5 + 1 + 2 = 17 -> 24
        assert_eq!(size, 24);
        assert!(!is_unused(&block, 16).unwrap());
        assert_eq!(entry_ino(&block, 16).unwrap(), 0x80);
        assert_eq!(entry_name(&block, 16).unwrap(), b"hello");
        assert_eq!(entry_tag(DirOps::V2Ftype, &block, 16).unwrap(), 16);
        assert_eq!(
            DirOps::V2Ftype.data_get_ftype(&block, 16).unwrap(),
            FileType::RegFile
        );

        set_entry_target(DirOps::V2Ftype, &mut block, 16, 0x99, FileType::Dir).unwrap();
        assert_eq!(entry_ino(&block, 16).unwrap(), 0x99);
        assert_eq!(DirOps::V2Ftype.data_get_ftype(&block, 16).unwrap(), FileType::Dir);
    }

    #[test]
    fn entry_rejects_bad_names() {
        let mut block = data_block();
        assert!(write_entry(DirOps::V2, &mut block, 16, 1, b"", FileType::Unknown).is_err());
        let long = vec![b'a'; 256];
        assert!(write_entry(DirOps::V2, &mut block, 16, 1, &long, FileType::Unknown).is_err());
    }

    #[test]
    fn walk_yields_records_in_order() {
        let mut block = data_block();
        let ops = DirOps::V2Ftype;
        let a = write_entry(ops, &mut block, 16, 0x80, b".", FileType::Dir).unwrap();
        let b = write_entry(ops, &mut block, 16 + a, 0x40, b"..", FileType::Dir).unwrap();
        write_unused(&mut block, 16 + a + b, 4096 - 16 - a - b).unwrap();

        let records: Vec<_> = RecordWalk::new(ops, 7, &block)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(records[0], Record::Entry { offset: 16, name: b".", .. }));
        assert!(matches!(records[1], Record::Entry { offset: 32, name: b"..", .. }));
        assert_eq!(
            records[2],
            Record::Unused {
                offset: 48,
                length: 4048
            }
        );
    }

    #[test]
    fn walk_stops_on_zero_length_region() {
        let mut block = data_block();
        write_be_u16(&mut block, 16, DATA_FREE_TAG).unwrap();
        let mut walk = RecordWalk::new(DirOps::V2, 3, &block).unwrap();
        let err = walk.next().unwrap().unwrap_err();
        assert!(matches!(
            err,
            DirError::Corrupted {
                block: 3,
                offset: 16,
                ..
            }
        ));
        assert!(walk.next().is_none());
    }

    #[test]
    fn walk_rejects_unknown_magic() {
        let block = vec![0_u8; 4096];
        assert!(RecordWalk::new(DirOps::V2, 0, &block).is_err());
    }
}
