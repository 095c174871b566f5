//! Metadata buffers.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use xd_error::Result;
use xd_types::{BlockNumber, Lsn};

/// Shared handle to a cached buffer. Holding the lock is holding the buffer.
pub type BufRef = Arc<Mutex<Buf>>;

/// Verifier attached to a buffer.
///
/// `verify_read` runs after the buffer is filled from disk; `verify_write`
/// runs before it goes back. Both may update the buffer (checksum stamping,
/// switching to a more specific verifier). `verify_struct` is the pure
/// structural check with no side effects.
pub trait BufOps: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn verify_read(&self, buf: &mut Buf) -> Result<()>;

    fn verify_write(&self, buf: &mut Buf) -> Result<()>;

    fn verify_struct(&self, buf: &Buf) -> Result<()>;
}

/// Recovery type tag recorded with logged buffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufType {
    #[default]
    Unknown,
    DirBlockBuf,
    DirDataBuf,
    DirFreeBuf,
    DirLeaf1Buf,
    DirLeafNBuf,
    DaNodeBuf,
}

/// Per-buffer transaction state: the type tag, the dirty byte ranges
/// (inclusive, sorted, non-overlapping) and the LSN of the last commit that
/// carried this buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufLogItem {
    pub buf_type: BufType,
    pub lsn: Lsn,
    ranges: Vec<(usize, usize)>,
}

impl BufLogItem {
    /// Add `[first, last]`, merging with any range it overlaps or touches.
    pub fn log_range(&mut self, first: usize, last: usize) {
        let (mut lo, mut hi) = (first.min(last), first.max(last));
        self.ranges.retain(|&(a, b)| {
            let joins = a <= hi.saturating_add(1) && lo <= b.saturating_add(1);
            if joins {
                lo = lo.min(a);
                hi = hi.max(b);
            }
            !joins
        });
        let at = self.ranges.partition_point(|&(a, _)| a < lo);
        self.ranges.insert(at, (lo, hi));
    }

    #[must_use]
    pub fn ranges(&self) -> &[(usize, usize)] {
        &self.ranges
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// True when every byte of `[first, last]` is covered.
    #[must_use]
    pub fn covers(&self, first: usize, last: usize) -> bool {
        self.ranges.iter().any(|&(a, b)| a <= first && last <= b)
    }

    pub fn clear_ranges(&mut self) {
        self.ranges.clear();
    }
}

/// A metadata buffer spanning one or more device blocks.
pub struct Buf {
    daddr: BlockNumber,
    data: Vec<u8>,
    ops: Option<Arc<dyn BufOps>>,
    item: BufLogItem,
    stale: bool,
}

impl fmt::Debug for Buf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buf")
            .field("daddr", &self.daddr)
            .field("len", &self.data.len())
            .field("ops", &self.ops.as_ref().map(|ops| ops.name()))
            .field("item", &self.item)
            .field("stale", &self.stale)
            .finish()
    }
}

impl Buf {
    #[must_use]
    pub fn new(daddr: BlockNumber, data: Vec<u8>) -> Self {
        Self {
            daddr,
            data,
            ops: None,
            item: BufLogItem::default(),
            stale: false,
        }
    }

    /// First device block backing this buffer.
    #[must_use]
    pub fn daddr(&self) -> BlockNumber {
        self.daddr
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn ops(&self) -> Option<&Arc<dyn BufOps>> {
        self.ops.as_ref()
    }

    pub fn set_ops(&mut self, ops: Option<Arc<dyn BufOps>>) {
        self.ops = ops;
    }

    #[must_use]
    pub fn log_item(&self) -> &BufLogItem {
        &self.item
    }

    pub fn log_item_mut(&mut self) -> &mut BufLogItem {
        &mut self.item
    }

    /// Invalidated buffers are never written back.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
        self.item.clear_ranges();
    }

    /// Run the attached structural verifier, if any.
    pub fn verify_struct(&self) -> Result<()> {
        match &self.ops {
            Some(ops) => ops.verify_struct(self),
            None => Ok(()),
        }
    }
}
