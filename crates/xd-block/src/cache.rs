//! Verifying buffer cache.
//!
//! Buffers are identified by their first device block and span a fixed
//! number of device blocks. Reads run the attached read verifier before a
//! buffer becomes visible; writes run the write verifier and never reach the
//! device when it fails. A write-verify failure means the in-memory copy is
//! corrupt, so the cache shuts the filesystem down and refuses every later
//! write.

use crate::buf::{Buf, BufOps, BufRef};
use crate::BlockDevice;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, trace, warn};
use xd_error::{DirError, Result};
use xd_types::BlockNumber;

#[derive(Debug)]
struct CacheState {
    capacity: usize,
    resident: HashMap<BlockNumber, BufRef>,
    /// Least recently used first.
    lru: VecDeque<BlockNumber>,
}

impl CacheState {
    fn touch(&mut self, key: BlockNumber) {
        if let Some(pos) = self.lru.iter().position(|k| *k == key) {
            let _ = self.lru.remove(pos);
        }
        self.lru.push_back(key);
    }

    fn forget(&mut self, key: BlockNumber) -> Option<BufRef> {
        if let Some(pos) = self.lru.iter().position(|k| *k == key) {
            let _ = self.lru.remove(pos);
        }
        self.resident.remove(&key)
    }

    fn insert(&mut self, key: BlockNumber, buf: BufRef) {
        self.resident.insert(key, buf);
        self.touch(key);
        self.evict();
    }

    /// Drop the oldest buffers nobody else holds until back under capacity.
    fn evict(&mut self) {
        let mut scanned = 0;
        while self.resident.len() > self.capacity && scanned < self.lru.len() {
            let Some(key) = self.lru.pop_front() else {
                break;
            };
            let pinned = self
                .resident
                .get(&key)
                .is_some_and(|buf| Arc::strong_count(buf) > 1);
            if pinned {
                self.lru.push_back(key);
                scanned += 1;
            } else {
                let _ = self.resident.remove(&key);
                trace!(block = key.0, "evict buffer");
            }
        }
    }
}

/// Write-through metadata cache over a [`BlockDevice`].
#[derive(Debug)]
pub struct BufferCache<D: BlockDevice> {
    dev: D,
    state: Mutex<CacheState>,
    shutdown: AtomicBool,
    shutdown_reason: Mutex<Option<String>>,
}

impl<D: BlockDevice> BufferCache<D> {
    pub fn new(dev: D, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(DirError::Format(
                "BufferCache capacity must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            dev,
            state: Mutex::new(CacheState {
                capacity,
                resident: HashMap::new(),
                lru: VecDeque::new(),
            }),
            shutdown: AtomicBool::new(false),
            shutdown_reason: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.dev.block_size()
    }

    fn buf_len(&self, nblocks: u32) -> Result<usize> {
        usize::try_from(u64::from(self.dev.block_size()) * u64::from(nblocks))
            .map_err(|_| DirError::Format("buffer length does not fit usize".to_owned()))
    }

    fn check_span(&self, daddr: BlockNumber, nblocks: u32) -> Result<()> {
        let end = daddr.0.checked_add(u64::from(nblocks));
        match end {
            Some(end) if nblocks > 0 && end <= self.dev.block_count() => Ok(()),
            _ => Err(DirError::Format(format!(
                "buffer out of range: daddr={} nblocks={nblocks} block_count={}",
                daddr.0,
                self.dev.block_count()
            ))),
        }
    }

    /// Get a buffer without reading the device. A buffer that is not
    /// resident comes back zero-filled; the caller initialises it.
    pub fn get(&self, daddr: BlockNumber, nblocks: u32) -> Result<BufRef> {
        self.check_span(daddr, nblocks)?;
        let len = self.buf_len(nblocks)?;
        let mut state = self.state.lock();
        if let Some(buf) = state.resident.get(&daddr).cloned() {
            state.touch(daddr);
            drop(state);
            let mut guard = buf.lock();
            if guard.is_stale() || guard.len() != len {
                *guard = Buf::new(daddr, vec![0_u8; len]);
            }
            drop(guard);
            return Ok(buf);
        }
        let buf = Arc::new(Mutex::new(Buf::new(daddr, vec![0_u8; len])));
        state.insert(daddr, Arc::clone(&buf));
        drop(state);
        Ok(buf)
    }

    /// Read a buffer, verifying it with `ops` if it is not already resident.
    ///
    /// A resident buffer has already passed verification (or was built in
    /// memory); it only gets `ops` attached if it had none.
    pub fn read(
        &self,
        daddr: BlockNumber,
        nblocks: u32,
        ops: Option<Arc<dyn BufOps>>,
    ) -> Result<BufRef> {
        self.check_span(daddr, nblocks)?;
        let resident = {
            let mut state = self.state.lock();
            let found = state.resident.get(&daddr).cloned();
            if found.is_some() {
                state.touch(daddr);
            }
            found
        };
        if let Some(buf) = resident {
            let mut guard = buf.lock();
            if !guard.is_stale() {
                if guard.ops().is_none() {
                    guard.set_ops(ops);
                }
                drop(guard);
                return Ok(buf);
            }
            drop(guard);
            let _ = self.state.lock().forget(daddr);
        }

        let mut data = Vec::with_capacity(self.buf_len(nblocks)?);
        for i in 0..u64::from(nblocks) {
            data.extend_from_slice(self.dev.read_block(BlockNumber(daddr.0 + i))?.as_slice());
        }
        let mut buf = Buf::new(daddr, data);
        buf.set_ops(ops.clone());
        if let Some(ops) = ops {
            if let Err(err) = ops.verify_read(&mut buf) {
                warn!(
                    block = daddr.0,
                    verifier = ops.name(),
                    error = %err,
                    "read verifier failed"
                );
                return Err(err);
            }
        }
        trace!(block = daddr.0, nblocks, "buffer read");

        let buf = Arc::new(Mutex::new(buf));
        self.state.lock().insert(daddr, Arc::clone(&buf));
        Ok(buf)
    }

    /// Verify and write a buffer through to the device.
    ///
    /// Stale buffers are skipped. A write-verify failure forces a shutdown.
    pub fn write(&self, buf: &mut Buf) -> Result<()> {
        if let Some(reason) = self.shutdown_reason() {
            return Err(DirError::Shutdown(reason));
        }
        if buf.is_stale() {
            return Ok(());
        }
        if let Some(ops) = buf.ops().cloned() {
            if let Err(err) = ops.verify_write(buf) {
                self.force_shutdown(&format!(
                    "corruption of in-memory data: {} at block {}: {err}",
                    ops.name(),
                    buf.daddr().0
                ));
                return Err(err);
            }
        }
        let block_size = self.buf_len(1)?;
        for (i, chunk) in buf.data().chunks(block_size).enumerate() {
            self.dev
                .write_block(BlockNumber(buf.daddr().0 + i as u64), chunk)?;
        }
        debug!(block = buf.daddr().0, len = buf.len(), "buffer written");
        Ok(())
    }

    /// Drop a buffer from the cache. Later reads go to the device.
    ///
    /// Does not lock the buffer; whoever holds it marks it stale.
    pub fn invalidate(&self, daddr: BlockNumber) {
        let removed = self.state.lock().forget(daddr);
        if removed.is_some() {
            trace!(block = daddr.0, "buffer invalidated");
        }
    }

    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.state.lock().resident.len()
    }

    pub fn sync(&self) -> Result<()> {
        self.dev.sync()
    }

    /// Stop accepting writes. Only the first reason is kept and logged.
    pub fn force_shutdown(&self, reason: &str) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        error!(reason, "forced shutdown");
        *self.shutdown_reason.lock() = Some(reason.to_owned());
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn shutdown_reason(&self) -> Option<String> {
        if !self.is_shutdown() {
            return None;
        }
        Some(
            self.shutdown_reason
                .lock()
                .clone()
                .unwrap_or_else(|| "shutdown".to_owned()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ByteBlockDevice, MemByteDevice};

    /// Accepts buffers whose first byte is 0xAA.
    #[derive(Debug)]
    struct FirstByteOps;

    impl BufOps for FirstByteOps {
        fn name(&self) -> &'static str {
            "first_byte"
        }

        fn verify_read(&self, buf: &mut Buf) -> Result<()> {
            self.verify_struct(buf)
        }

        fn verify_write(&self, buf: &mut Buf) -> Result<()> {
            self.verify_struct(buf)?;
            buf.data_mut()[1] = 0x55;
            Ok(())
        }

        fn verify_struct(&self, buf: &Buf) -> Result<()> {
            if buf.data()[0] == 0xAA {
                Ok(())
            } else {
                Err(DirError::corrupted(buf.daddr().0, 0, "first byte"))
            }
        }
    }

    fn cache(blocks: usize, capacity: usize) -> BufferCache<ByteBlockDevice<MemByteDevice>> {
        let dev = ByteBlockDevice::new(MemByteDevice::new(1024 * blocks), 1024).expect("device");
        BufferCache::new(dev, capacity).expect("cache")
    }

    #[test]
    fn write_runs_verifier_then_read_back() {
        let cache = cache(8, 4);
        let ops: Arc<dyn BufOps> = Arc::new(FirstByteOps);
        let buf = cache.get(BlockNumber(2), 2).expect("get");
        {
            let mut guard = buf.lock();
            assert_eq!(guard.len(), 2048);
            guard.set_ops(Some(Arc::clone(&ops)));
            guard.data_mut()[0] = 0xAA;
            cache.write(&mut guard).expect("write");
            // the write verifier stamped byte 1
            assert_eq!(guard.data()[1], 0x55);
        }
        cache.invalidate(BlockNumber(2));
        assert_eq!(cache.resident_count(), 0);

        let again = cache.read(BlockNumber(2), 2, Some(ops)).expect("read");
        let guard = again.lock();
        assert_eq!(&guard.data()[..2], &[0xAA, 0x55]);
        assert!(!guard.is_stale());
    }

    #[test]
    fn read_verifier_failure_is_reported_and_not_cached() {
        let cache = cache(4, 4);
        let ops: Arc<dyn BufOps> = Arc::new(FirstByteOps);
        let err = cache.read(BlockNumber(1), 1, Some(ops)).unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(cache.resident_count(), 0);
    }

    #[test]
    fn write_verifier_failure_shuts_down() {
        let cache = cache(4, 4);
        let buf = cache.get(BlockNumber(0), 1).expect("get");
        let mut guard = buf.lock();
        guard.set_ops(Some(Arc::new(FirstByteOps)));
        assert!(cache.write(&mut guard).unwrap_err().is_corruption());
        assert!(cache.is_shutdown());
        assert!(
            cache
                .shutdown_reason()
                .is_some_and(|r| r.contains("corruption of in-memory data"))
        );

        guard.data_mut()[0] = 0xAA;
        assert!(matches!(
            cache.write(&mut guard),
            Err(DirError::Shutdown(_))
        ));
        // nothing reached the device
        assert_eq!(cache.device().inner().snapshot()[0], 0);
    }

    #[test]
    fn eviction_skips_pinned_buffers() {
        let cache = cache(8, 2);
        let pinned = cache.get(BlockNumber(0), 1).expect("get");
        for block in 1..5 {
            let _ = cache.get(BlockNumber(block), 1).expect("get");
        }
        assert_eq!(cache.resident_count(), 2);
        let same = cache.get(BlockNumber(0), 1).expect("get");
        assert!(Arc::ptr_eq(&pinned, &same));
    }

    #[test]
    fn out_of_range_spans_are_rejected() {
        let cache = cache(4, 4);
        assert!(cache.get(BlockNumber(3), 2).is_err());
        assert!(cache.read(BlockNumber(0), 0, None).is_err());
    }

    #[test]
    fn stale_buffers_are_not_written() {
        let cache = cache(2, 2);
        let buf = cache.get(BlockNumber(1), 1).expect("get");
        let mut guard = buf.lock();
        guard.data_mut().fill(9);
        guard.mark_stale();
        cache.write(&mut guard).expect("write");
        assert!(cache.device().inner().snapshot().iter().all(|b| *b == 0));
    }
}
