#![forbid(unsafe_code)]
//! Transaction journal for metadata buffers.
//!
//! A [`Transaction`] pins the buffers it joins, collects the byte ranges its
//! callers log against them, and on commit appends one [`LogRecord`] per
//! transaction before writing the buffers through the cache. The journal
//! head LSN is the last committed record; v3 blocks are stamped with the LSN
//! of the commit that last carried them, and [`Journal::check_lsn`] rejects
//! a block stamped beyond the head.

mod transaction;

pub use transaction::Transaction;
pub use xd_block::BufType;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;
use xd_types::{BlockNumber, Lsn, TxnId};

/// Records kept in memory before the oldest are dropped.
pub const DEFAULT_RETAINED_RECORDS: usize = 1024;

/// One logged byte range of one buffer, copied at commit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRegion {
    pub daddr: BlockNumber,
    pub buf_type: BufType,
    /// First byte, inclusive.
    pub first: usize,
    /// Last byte, inclusive.
    pub last: usize,
    pub bytes: Vec<u8>,
    /// CRC32C of `bytes`.
    pub crc32c: u32,
}

impl LoggedRegion {
    #[must_use]
    pub fn new(daddr: BlockNumber, buf_type: BufType, first: usize, bytes: Vec<u8>) -> Self {
        let crc32c = crc32c::crc32c(&bytes);
        Self {
            daddr,
            buf_type,
            first,
            last: first + bytes.len().saturating_sub(1),
            bytes,
            crc32c,
        }
    }

    /// True when the payload still matches its checksum.
    #[must_use]
    pub fn is_intact(&self) -> bool {
        crc32c::crc32c(&self.bytes) == self.crc32c
    }
}

/// Everything one committed transaction logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub regions: Vec<LoggedRegion>,
    pub invalidated: Vec<BlockNumber>,
}

/// In-memory log: LSN head, transaction ids, and the retained records.
#[derive(Debug)]
pub struct Journal {
    head: AtomicU64,
    next_txn: AtomicU64,
    records: Mutex<VecDeque<LogRecord>>,
    retained: usize,
}

impl Journal {
    /// Open a log whose head is block 0 of `cycle`. Anything stamped in an
    /// earlier cycle is in the past.
    #[must_use]
    pub fn new(cycle: u32) -> Self {
        Self::with_retention(cycle, DEFAULT_RETAINED_RECORDS)
    }

    #[must_use]
    pub fn with_retention(cycle: u32, retained: usize) -> Self {
        Self {
            head: AtomicU64::new(Lsn::new(cycle, 0).0),
            next_txn: AtomicU64::new(1),
            records: Mutex::new(VecDeque::new()),
            retained: retained.max(1),
        }
    }

    /// LSN of the last committed record.
    #[must_use]
    pub fn head(&self) -> Lsn {
        Lsn(self.head.load(Ordering::Acquire))
    }

    /// A block LSN is plausible when it is not ahead of the log head.
    #[must_use]
    pub fn check_lsn(&self, lsn: Lsn) -> bool {
        let head = self.head();
        if lsn > head {
            warn!(%lsn, %head, "block LSN is ahead of the log head");
            return false;
        }
        true
    }

    /// Start a transaction.
    pub fn begin(&self) -> Transaction<'_> {
        let id = TxnId(self.next_txn.fetch_add(1, Ordering::AcqRel));
        Transaction::new(self, id)
    }

    fn advance(&self) -> Lsn {
        Lsn(self.head.fetch_add(1, Ordering::AcqRel) + 1)
    }

    fn append(&self, record: LogRecord) {
        let mut records = self.records.lock();
        records.push_back(record);
        while records.len() > self.retained {
            let _ = records.pop_front();
        }
    }

    /// Retained records, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn last_record(&self) -> Option<LogRecord> {
        self.records.lock().back().cloned()
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new(1)
    }
}
