//! Directory data fork: file offset (filesystem blocks) → disk blocks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use xd_error::{DirError, Result};
use xd_types::{BlockNumber, InodeNumber};

/// One mapped run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// First file block.
    pub file_off: u32,
    pub start: BlockNumber,
    pub len: u32,
}

impl Extent {
    #[must_use]
    pub fn end(&self) -> u32 {
        self.file_off + self.len
    }

    #[must_use]
    pub fn contains(&self, off: u32) -> bool {
        self.file_off <= off && off < self.end()
    }
}

/// Sorted, non-overlapping extent map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFork {
    extents: BTreeMap<u32, Extent>,
}

impl DataFork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extents(&self) -> impl DoubleEndedIterator<Item = &Extent> {
        self.extents.values()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    fn containing(&self, off: u32) -> Option<&Extent> {
        self.extents
            .range(..=off)
            .next_back()
            .map(|(_, ext)| ext)
            .filter(|ext| ext.contains(off))
    }

    /// Disk block backing file block `off`.
    #[must_use]
    pub fn lookup(&self, off: u32) -> Option<BlockNumber> {
        self.containing(off)
            .map(|ext| BlockNumber(ext.start.0 + u64::from(off - ext.file_off)))
    }

    /// Disk start of `[off, off + len)` when one extent maps all of it.
    #[must_use]
    pub fn map_range(&self, off: u32, len: u32) -> Option<BlockNumber> {
        let ext = self.containing(off)?;
        let last = off.checked_add(len.checked_sub(1)?)?;
        ext.contains(last)
            .then(|| BlockNumber(ext.start.0 + u64::from(off - ext.file_off)))
    }

    /// Add a mapping. Overlap with an existing mapping is corruption.
    pub fn insert(&mut self, ext: Extent) -> Result<()> {
        if ext.len == 0 || ext.file_off.checked_add(ext.len).is_none() {
            return Err(DirError::Format(format!("bad extent {ext:?}")));
        }
        let overlaps = self
            .extents
            .values()
            .any(|cur| cur.file_off < ext.end() && ext.file_off < cur.end());
        if overlaps {
            return Err(DirError::corrupted(
                ext.start.0,
                0,
                format!("extent at file block {} overlaps the data fork", ext.file_off),
            ));
        }

        let mut merged = ext;
        if let Some(prev) = self.extents.range(..ext.file_off).next_back().map(|(_, e)| *e) {
            if prev.end() == ext.file_off && prev.start.0 + u64::from(prev.len) == ext.start.0 {
                let _ = self.extents.remove(&prev.file_off);
                merged = Extent {
                    file_off: prev.file_off,
                    start: prev.start,
                    len: prev.len + ext.len,
                };
            }
        }
        if let Some(next) = self.extents.get(&merged.end()).copied() {
            if merged.start.0 + u64::from(merged.len) == next.start.0 {
                let _ = self.extents.remove(&next.file_off);
                merged.len += next.len;
            }
        }
        self.extents.insert(merged.file_off, merged);
        Ok(())
    }

    /// Remove the mapping of `[off, off + len)`, splitting extents at the
    /// edges. Returns the disk runs that were unmapped.
    pub fn unmap(&mut self, off: u32, len: u32) -> Vec<Extent> {
        let end = off.saturating_add(len);
        let hit: Vec<Extent> = self
            .extents
            .values()
            .filter(|ext| ext.file_off < end && off < ext.end())
            .copied()
            .collect();
        let mut freed = Vec::with_capacity(hit.len());
        for ext in hit {
            let _ = self.extents.remove(&ext.file_off);
            let lo = ext.file_off.max(off);
            let hi = ext.end().min(end);
            if ext.file_off < lo {
                self.extents.insert(
                    ext.file_off,
                    Extent {
                        file_off: ext.file_off,
                        start: ext.start,
                        len: lo - ext.file_off,
                    },
                );
            }
            if hi < ext.end() {
                self.extents.insert(
                    hi,
                    Extent {
                        file_off: hi,
                        start: BlockNumber(ext.start.0 + u64::from(hi - ext.file_off)),
                        len: ext.end() - hi,
                    },
                );
            }
            freed.push(Extent {
                file_off: lo,
                start: BlockNumber(ext.start.0 + u64::from(lo - ext.file_off)),
                len: hi - lo,
            });
        }
        freed
    }

    /// First hole of at least `len` blocks at or after `start`.
    #[must_use]
    pub fn first_unused(&self, len: u32, start: u32) -> u32 {
        let mut cursor = start;
        for ext in self.extents.values() {
            if ext.end() <= cursor {
                continue;
            }
            if ext.file_off >= cursor.saturating_add(len) {
                break;
            }
            cursor = ext.end();
        }
        cursor
    }

    /// File block just past the last mapping; 0 when nothing is mapped.
    #[must_use]
    pub fn last_offset(&self) -> u32 {
        self.extents.values().next_back().map_or(0, Extent::end)
    }

    /// File block just past the last mapped block below `off`; 0 when
    /// nothing below `off` is mapped.
    #[must_use]
    pub fn last_before(&self, off: u32) -> u32 {
        self.extents
            .range(..off)
            .next_back()
            .map_or(0, |(_, ext)| ext.end().min(off))
    }
}

/// The parts of a directory inode the directory code needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirInode {
    pub ino: InodeNumber,
    /// Directory size in bytes (end of the data space in use).
    pub size: u64,
    pub fork: DataFork,
}

impl DirInode {
    #[must_use]
    pub fn new(ino: InodeNumber) -> Self {
        Self {
            ino,
            size: 0,
            fork: DataFork::new(),
        }
    }
}
