//! Transactions.

use crate::{Journal, LogRecord, LoggedRegion};
use std::sync::Arc;
use tracing::{debug, trace};
use xd_block::{BlockDevice, Buf, BufRef, BufType, BufferCache};
use xd_error::Result;
use xd_types::{BlockNumber, Lsn, TxnId};

/// A unit of atomic change over a set of pinned buffers.
///
/// Callers lock a joined buffer, mutate it, and report the bytes they
/// touched with [`Transaction::log_buf`]. Dropping a transaction without
/// committing aborts it.
#[derive(Debug)]
pub struct Transaction<'j> {
    journal: &'j Journal,
    id: TxnId,
    bufs: Vec<BufRef>,
    invalidated: Vec<BlockNumber>,
    dirty: bool,
    finished: bool,
}

impl<'j> Transaction<'j> {
    pub(crate) fn new(journal: &'j Journal, id: TxnId) -> Self {
        Self {
            journal,
            id,
            bufs: Vec::new(),
            invalidated: Vec::new(),
            dirty: false,
            finished: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    #[must_use]
    pub fn journal(&self) -> &'j Journal {
        self.journal
    }

    /// Pin `buf` to this transaction. Joining twice is a no-op.
    pub fn join(&mut self, buf: &BufRef) {
        if !self.bufs.iter().any(|b| Arc::ptr_eq(b, buf)) {
            self.bufs.push(Arc::clone(buf));
        }
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Record that bytes `first..=last` of `buf` changed.
    pub fn log_buf(&mut self, buf: &mut Buf, first: usize, last: usize) {
        trace!(txn = self.id.0, block = buf.daddr().0, first, last, "log_buf");
        buf.log_item_mut().log_range(first, last);
        self.dirty = true;
    }

    /// Tag `buf` for recovery.
    pub fn set_buf_type(&mut self, buf: &mut Buf, buf_type: BufType) {
        buf.log_item_mut().buf_type = buf_type;
    }

    /// Invalidate `buf`: its pending changes are dropped, it is never
    /// written back, and the cache forgets it at commit.
    pub fn binval(&mut self, buf: &mut Buf) {
        buf.mark_stale();
        if !self.invalidated.contains(&buf.daddr()) {
            self.invalidated.push(buf.daddr());
        }
        self.dirty = true;
    }

    /// Append the log record, then write every dirty buffer through `cache`.
    ///
    /// Joined buffers must not be locked by the caller.
    pub fn commit<D: BlockDevice>(mut self, cache: &BufferCache<D>) -> Result<Lsn> {
        self.finished = true;
        if !self.dirty {
            debug!(txn = self.id.0, "clean transaction");
            return Ok(self.journal.head());
        }

        let lsn = self.journal.advance();
        let mut regions = Vec::new();
        let mut guards = Vec::with_capacity(self.bufs.len());
        for buf in &self.bufs {
            let mut guard = buf.lock();
            if guard.is_stale() || !guard.log_item().is_dirty() {
                continue;
            }
            guard.log_item_mut().lsn = lsn;
            let buf_type = guard.log_item().buf_type;
            for &(first, last) in guard.log_item().ranges() {
                let end = (last + 1).min(guard.len());
                let bytes = guard.data().get(first..end).unwrap_or_default().to_vec();
                regions.push(LoggedRegion::new(guard.daddr(), buf_type, first, bytes));
            }
            guards.push(guard);
        }

        let region_count = regions.len();
        self.journal.append(LogRecord {
            lsn,
            txn_id: self.id,
            regions,
            invalidated: self.invalidated.clone(),
        });

        for guard in &mut guards {
            cache.write(guard)?;
            guard.log_item_mut().clear_ranges();
        }
        drop(guards);
        for daddr in &self.invalidated {
            cache.invalidate(*daddr);
        }
        debug!(
            txn = self.id.0,
            %lsn,
            regions = region_count,
            invalidated = self.invalidated.len(),
            "transaction committed"
        );
        Ok(lsn)
    }

    /// Discard everything logged. Dirty buffers are marked stale so the
    /// next read goes back to disk.
    pub fn abort(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let mut dropped = 0_usize;
        for buf in &self.bufs {
            let mut guard = buf.lock();
            if guard.log_item().is_dirty() {
                guard.mark_stale();
                dropped += 1;
            }
        }
        debug!(txn = self.id.0, dropped, "transaction aborted");
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.cancel();
    }
}
