#![forbid(unsafe_code)]
//! Block allocation and directory space management.
//!
//! ## Design
//!
//! Three layers:
//!
//! 1. **Bitmap**: raw bit manipulation over a free-space bitmap.
//! 2. **ExtentAllocator**: goal-directed contiguous allocation
//!    ([`BitmapAllocator`] is the in-memory implementation).
//! 3. **Directory space**: the directory inode's data fork (a file-offset
//!    to disk-block extent map) and the operations that grow a directory by
//!    one directory block, retire a block, and classify the directory from
//!    its last mapped offset ([`dir`]).

pub mod dir;
pub mod fork;

pub use dir::{grow_inode, isblock, isleaf, shrink_inode};
pub use fork::{DataFork, DirInode, Extent};

use parking_lot::Mutex;
use tracing::{debug, trace};
use xd_error::{DirError, Result};
use xd_types::BlockNumber;

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    bitmap
        .get(byte_idx)
        .is_some_and(|byte| (byte >> (idx % 8)) & 1 == 1)
}

/// Set bit `idx`. Out-of-range indices are ignored.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    if let Some(byte) = bitmap.get_mut((idx / 8) as usize) {
        *byte |= 1 << (idx % 8);
    }
}

/// Clear bit `idx`. Out-of-range indices are ignored.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    if let Some(byte) = bitmap.get_mut((idx / 8) as usize) {
        *byte &= !(1 << (idx % 8));
    }
}

/// Count free (zero) bits in the first `count` bits.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let mut free = 0_u32;
    for idx in 0..count {
        if !bitmap_get(bitmap, idx) {
            free += 1;
        }
    }
    free
}

/// First run of `n` free bits in `[start, count)`, else in `[0, start)`.
#[must_use]
pub fn bitmap_find_contiguous(bitmap: &[u8], count: u32, n: u32, start: u32) -> Option<u32> {
    if n == 0 {
        return Some(start.min(count));
    }
    let scan = |from: u32, to: u32| -> Option<u32> {
        let mut run_start = from;
        let mut run_len = 0_u32;
        for idx in from..to {
            if bitmap_get(bitmap, idx) {
                run_start = idx + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len >= n {
                    return Some(run_start);
                }
            }
        }
        None
    };
    let start = start.min(count);
    scan(start, count).or_else(|| scan(0, start.saturating_add(n - 1).min(count)))
}

// ── Extent allocator ────────────────────────────────────────────────────────

/// Contiguous block allocation.
pub trait ExtentAllocator: Send + Sync {
    /// Allocate `len` contiguous blocks, preferring the run starting at
    /// `goal`. Fails with `NoSpace` when no run is long enough.
    fn alloc_extent(&self, goal: BlockNumber, len: u32) -> Result<BlockNumber>;

    /// Return `len` blocks starting at `start`.
    fn free_extent(&self, start: BlockNumber, len: u32) -> Result<()>;

    /// Blocks currently free.
    fn free_blocks(&self) -> u64;
}

/// In-memory bitmap allocator over `[first, first + count)`.
#[derive(Debug)]
pub struct BitmapAllocator {
    first: BlockNumber,
    count: u32,
    bitmap: Mutex<Vec<u8>>,
}

impl BitmapAllocator {
    #[must_use]
    pub fn new(first: BlockNumber, count: u32) -> Self {
        Self {
            first,
            count,
            bitmap: Mutex::new(vec![0_u8; count.div_ceil(8) as usize]),
        }
    }

    /// Mark `[start, start + len)` in use without going through allocation
    /// (blocks already owned at mount).
    pub fn reserve(&self, start: BlockNumber, len: u32) -> Result<()> {
        let rel = self.relative(start, len)?;
        let mut bitmap = self.bitmap.lock();
        for idx in rel..rel + len {
            bitmap_set(&mut bitmap, idx);
        }
        drop(bitmap);
        Ok(())
    }

    fn relative(&self, start: BlockNumber, len: u32) -> Result<u32> {
        let rel = start
            .0
            .checked_sub(self.first.0)
            .and_then(|rel| u32::try_from(rel).ok())
            .filter(|rel| rel.checked_add(len).is_some_and(|end| end <= self.count))
            .ok_or_else(|| {
                DirError::Format(format!(
                    "extent out of range: start={} len={len} first={} count={}",
                    start.0, self.first.0, self.count
                ))
            })?;
        Ok(rel)
    }
}

impl ExtentAllocator for BitmapAllocator {
    fn alloc_extent(&self, goal: BlockNumber, len: u32) -> Result<BlockNumber> {
        if len == 0 {
            return Err(DirError::Format("zero-length allocation".to_owned()));
        }
        let goal_rel = goal
            .0
            .checked_sub(self.first.0)
            .and_then(|rel| u32::try_from(rel).ok())
            .unwrap_or(0);
        let mut bitmap = self.bitmap.lock();
        let Some(rel) = bitmap_find_contiguous(&bitmap, self.count, len, goal_rel) else {
            drop(bitmap);
            debug!(goal = goal.0, len, "allocation failed: no contiguous run");
            return Err(DirError::NoSpace);
        };
        for idx in rel..rel + len {
            bitmap_set(&mut bitmap, idx);
        }
        drop(bitmap);
        let start = BlockNumber(self.first.0 + u64::from(rel));
        trace!(start = start.0, len, "extent allocated");
        Ok(start)
    }

    fn free_extent(&self, start: BlockNumber, len: u32) -> Result<()> {
        let rel = self.relative(start, len)?;
        let mut bitmap = self.bitmap.lock();
        if let Some(idx) = (rel..rel + len).find(|&idx| !bitmap_get(&bitmap, idx)) {
            drop(bitmap);
            return Err(DirError::corrupted(
                self.first.0 + u64::from(idx),
                0,
                "freeing a block that is not allocated",
            ));
        }
        for idx in rel..rel + len {
            bitmap_clear(&mut bitmap, idx);
        }
        drop(bitmap);
        trace!(start = start.0, len, "extent freed");
        Ok(())
    }

    fn free_blocks(&self) -> u64 {
        u64::from(bitmap_count_free(&self.bitmap.lock(), self.count))
    }
}
