//! A mounted directory subsystem.

use crate::config::MountConfig;
use crate::dir::{DirHandle, init_dir};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use xd_alloc::{BitmapAllocator, DirInode, ExtentAllocator};
use xd_block::{BlockDevice, BufferCache, ByteBlockDevice, FileByteDevice, MemByteDevice};
use xd_dir::{DirBufferCache, DirContext};
use xd_error::{DirError, Result};
use xd_journal::Journal;
use xd_ondisk::DirOps;
use xd_types::{BlockNumber, InodeNumber};

/// Geometry, dispatch, cache, journal and allocator for one filesystem.
pub struct DirMount {
    config: MountConfig,
    ctx: Arc<DirContext>,
    cache: DirBufferCache,
    alloc: BitmapAllocator,
}

impl std::fmt::Debug for DirMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirMount")
            .field("config", &self.config)
            .field("ops", &self.ctx.ops)
            .field("blocks", &self.cache.device().block_count())
            .field("shutdown", &self.cache.is_shutdown())
            .finish_non_exhaustive()
    }
}

impl DirMount {
    /// Mount over `dev`, whose block size must be the filesystem block size.
    /// Every device block is handed to the allocator.
    pub fn open(config: MountConfig, dev: Arc<dyn BlockDevice>) -> Result<Self> {
        config.validate()?;
        if dev.block_size() != config.fs_block_size() {
            return Err(DirError::InvalidGeometry(format!(
                "device block size {} != filesystem block size {}",
                dev.block_size(),
                config.fs_block_size()
            )));
        }
        let blocks = u32::try_from(dev.block_count()).map_err(|_| {
            DirError::InvalidGeometry(format!("device has too many blocks: {}", dev.block_count()))
        })?;

        let journal = Arc::new(Journal::new(config.log_cycle));
        let ctx = Arc::new(DirContext::new(
            config.fs_block_log,
            config.dir_block_log,
            config.features(),
            config.ascii_ci,
            config.meta_uuid,
            config.max_inode,
            journal,
        )?);
        let alloc = BitmapAllocator::new(BlockNumber(0), blocks);
        let cache = BufferCache::new(dev, config.cache_capacity)?;
        info!(
            blksize = ctx.geo.blksize,
            ops = ?ctx.ops,
            names = ?ctx.name_ops,
            blocks,
            "directory subsystem mounted"
        );
        Ok(Self {
            config,
            ctx,
            cache,
            alloc,
        })
    }

    pub fn open_file(config: MountConfig, path: impl AsRef<Path>) -> Result<Self> {
        let dev = ByteBlockDevice::new(FileByteDevice::open(path)?, config.fs_block_size())?;
        Self::open(config, Arc::new(dev))
    }

    /// Mount over a zeroed in-memory device of `blocks` filesystem blocks.
    pub fn in_memory(config: MountConfig, blocks: u32) -> Result<Self> {
        let len = usize::try_from(u64::from(config.fs_block_size()) * u64::from(blocks))
            .map_err(|_| DirError::NoMem)?;
        let dev = ByteBlockDevice::new(MemByteDevice::new(len), config.fs_block_size())?;
        Self::open(config, Arc::new(dev))
    }

    #[must_use]
    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    #[must_use]
    pub fn ctx(&self) -> &Arc<DirContext> {
        &self.ctx
    }

    #[must_use]
    pub fn cache(&self) -> &DirBufferCache {
        &self.cache
    }

    #[must_use]
    pub fn alloc(&self) -> &dyn ExtentAllocator {
        &self.alloc
    }

    /// Mark blocks that belong to something else before any directory grows.
    pub fn reserve(&self, start: BlockNumber, len: u32) -> Result<()> {
        self.alloc.reserve(start, len)
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.alloc.free_blocks()
    }

    pub fn ino_validate(&self, ino: u64) -> Result<()> {
        self.ctx.ino_validate(ino)
    }

    /// Create directory `ino` with `.` and `..` in its first data block.
    pub fn mkdir(self: &Arc<Self>, ino: InodeNumber, parent: InodeNumber) -> Result<DirHandle> {
        self.ctx.ino_validate(ino.0)?;
        self.ctx.ino_validate(parent.0)?;
        let handle = DirHandle::new(Arc::clone(self), DirInode::new(ino), None);
        handle.mutate("init", |args| init_dir(args, parent.0))?;
        Ok(handle)
    }

    /// Attach to an existing directory. `ops_override` pins the directory to
    /// a dispatch table other than the mount default.
    #[must_use]
    pub fn open_dir(self: &Arc<Self>, dp: DirInode, ops_override: Option<DirOps>) -> DirHandle {
        DirHandle::new(Arc::clone(self), dp, ops_override)
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.cache.is_shutdown()
    }

    #[must_use]
    pub fn shutdown_reason(&self) -> Option<String> {
        self.cache.shutdown_reason()
    }

    pub(crate) fn check_live(&self) -> Result<()> {
        match self.cache.shutdown_reason() {
            Some(reason) => Err(DirError::Shutdown(reason)),
            None => Ok(()),
        }
    }

    /// Structural corruption found by a directory operation takes the
    /// mount down; everything else is handed back unchanged.
    pub(crate) fn fail(&self, op: &'static str, err: DirError) -> DirError {
        if matches!(err, DirError::Corrupted { .. }) {
            self.cache.force_shutdown(&format!("{op}: {err}"));
        }
        err
    }

    pub fn sync(&self) -> Result<()> {
        self.cache.sync()
    }
}
