//! Directory growth, retirement and shape classification.

use crate::ExtentAllocator;
use crate::fork::{DirInode, Extent};
use tracing::debug;
use xd_block::Buf;
use xd_error::{DirError, Result};
use xd_journal::Transaction;
use xd_ondisk::DirGeometry;
use xd_ondisk::layout::{DATA_SPACE, LEAF_OFFSET, SPACE_SIZE};
use xd_types::{BlockNumber, DaBlock, DirBlock};

/// Add one directory block to `space` (data, leaf or free) and return its
/// directory block number.
///
/// The block lands in the first hole at or after the start of the space.
/// Growing the data space extends the directory size.
pub fn grow_inode(
    geo: &DirGeometry,
    alloc: &dyn ExtentAllocator,
    dp: &mut DirInode,
    space: u32,
) -> Result<DirBlock> {
    let space_start = u32::try_from(geo.bytes_to_fsb(u64::from(space) * SPACE_SIZE))
        .map_err(|_| DirError::InvalidGeometry(format!("space {space} out of range")))?;
    let count = geo.fsbcount;
    let bno = dp.fork.first_unused(count, space_start);

    let goal = dp
        .fork
        .extents()
        .next_back()
        .map_or(BlockNumber(0), |ext| BlockNumber(ext.start.0 + u64::from(ext.len)));
    let start = alloc.alloc_extent(goal, count)?;
    dp.fork.insert(Extent {
        file_off: bno,
        start,
        len: count,
    })?;

    let db = geo.da_to_db(DaBlock(bno));
    if space == DATA_SPACE {
        let size = geo.fsb_to_bytes(u64::from(bno) + u64::from(count));
        if size > dp.size {
            dp.size = size;
        }
    }
    debug!(ino = dp.ino.0, space, db = db.0, disk = start.0, "grow directory");
    Ok(db)
}

/// Remove directory block `db`: unmap it, invalidate its buffer, and pull
/// the directory size back when it was the last data block.
///
/// An unmap failure is returned before the buffer is touched.
pub fn shrink_inode(
    geo: &DirGeometry,
    alloc: &dyn ExtentAllocator,
    tp: &mut Transaction<'_>,
    dp: &mut DirInode,
    db: DirBlock,
    buf: &mut Buf,
) -> Result<()> {
    let da = geo.db_to_da(db);
    for ext in dp.fork.unmap(da.0, geo.fsbcount) {
        alloc.free_extent(ext.start, ext.len)?;
    }
    tp.binval(buf);
    debug!(ino = dp.ino.0, db = db.0, "shrink directory");

    // leaf and free blocks never move the size
    if db >= geo.byte_to_db(LEAF_OFFSET) {
        return Ok(());
    }
    // not the last data block
    if dp.size > geo.db_off_to_byte(DirBlock(db.0 + 1), 0) {
        return Ok(());
    }
    let bno = dp.fork.last_before(da.0);
    dp.size = geo.fsb_to_bytes(u64::from(bno));
    Ok(())
}

/// True for a single-block directory (one data block with a leaf trailer).
pub fn isblock(geo: &DirGeometry, dp: &DirInode) -> Result<bool> {
    let last = dp.fork.last_offset();
    let block = geo.fsb_to_bytes(u64::from(last)) == u64::from(geo.blksize);
    if block && dp.size != u64::from(geo.blksize) {
        return Err(DirError::corrupted(
            dp.ino.0,
            0,
            format!("block directory size {} != block size {}", dp.size, geo.blksize),
        ));
    }
    Ok(block)
}

/// True for a leaf directory: the last mapping is the single leaf block.
#[must_use]
pub fn isleaf(geo: &DirGeometry, dp: &DirInode) -> bool {
    dp.fork.last_offset() == geo.leafblk.0 + geo.fsbcount
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BitmapAllocator;
    use std::sync::Arc;
    use xd_block::{BlockDevice, ByteBlockDevice, BufferCache, MemByteDevice};
    use xd_journal::Journal;
    use xd_ondisk::layout::{FREE_SPACE, LEAF_SPACE};
    use xd_types::InodeNumber;

    fn geo() -> DirGeometry {
        DirGeometry::new(12, 0, 16).unwrap()
    }

    #[test]
    fn grow_data_space_extends_size() {
        let geo = geo();
        let alloc = BitmapAllocator::new(BlockNumber(16), 64);
        let mut dp = DirInode::new(InodeNumber(128));

        let db0 = grow_inode(&geo, &alloc, &mut dp, DATA_SPACE).unwrap();
        assert_eq!(db0, DirBlock(0));
        assert_eq!(dp.size, 4096);
        assert!(isblock(&geo, &dp).unwrap());

        let db1 = grow_inode(&geo, &alloc, &mut dp, DATA_SPACE).unwrap();
        assert_eq!(db1, DirBlock(1));
        assert_eq!(dp.size, 8192);
        assert!(!isblock(&geo, &dp).unwrap());
        // contiguous goal
        assert_eq!(dp.fork.lookup(1), Some(BlockNumber(17)));
    }

    #[test]
    fn grow_leaf_and_free_spaces_leave_size() {
        let geo = geo();
        let alloc = BitmapAllocator::new(BlockNumber(0), 8);
        let mut dp = DirInode::new(InodeNumber(128));
        grow_inode(&geo, &alloc, &mut dp, DATA_SPACE).unwrap();
        let leaf = grow_inode(&geo, &alloc, &mut dp, LEAF_SPACE).unwrap();
        assert_eq!(leaf, geo.byte_to_db(LEAF_OFFSET));
        assert_eq!(dp.size, 4096);
        assert!(isleaf(&geo, &dp));
        let free = grow_inode(&geo, &alloc, &mut dp, FREE_SPACE).unwrap();
        assert_eq!(geo.db_to_da(free), geo.freeblk);
        assert!(!isleaf(&geo, &dp));
    }

    #[test]
    fn grow_reports_enospc() {
        let geo = DirGeometry::new(12, 1, 16).unwrap();
        let alloc = BitmapAllocator::new(BlockNumber(0), 3);
        let mut dp = DirInode::new(InodeNumber(128));
        grow_inode(&geo, &alloc, &mut dp, DATA_SPACE).unwrap();
        assert!(matches!(
            grow_inode(&geo, &alloc, &mut dp, DATA_SPACE),
            Err(DirError::NoSpace)
        ));
        assert_eq!(dp.size, 8192);
    }

    #[test]
    fn isblock_size_mismatch_is_corruption() {
        let geo = geo();
        let alloc = BitmapAllocator::new(BlockNumber(0), 8);
        let mut dp = DirInode::new(InodeNumber(128));
        grow_inode(&geo, &alloc, &mut dp, DATA_SPACE).unwrap();
        dp.size = 100;
        assert!(isblock(&geo, &dp).unwrap_err().is_corruption());
    }

    #[test]
    fn shrink_last_block_pulls_size_back() {
        let geo = geo();
        let alloc = BitmapAllocator::new(BlockNumber(0), 8);
        let dev = ByteBlockDevice::new(MemByteDevice::new(4096 * 8), 4096).unwrap();
        let cache = BufferCache::new(Arc::new(dev), 8).unwrap();
        let journal = Journal::new(1);
        let mut dp = DirInode::new(InodeNumber(128));
        for _ in 0..3 {
            grow_inode(&geo, &alloc, &mut dp, DATA_SPACE).unwrap();
        }
        assert_eq!(dp.size, 3 * 4096);
        assert_eq!(alloc.free_blocks(), 5);

        // middle block: size unchanged
        let mut tp = journal.begin();
        let buf = cache.get(dp.fork.lookup(1).unwrap(), 1).unwrap();
        tp.join(&buf);
        shrink_inode(&geo, &alloc, &mut tp, &mut dp, DirBlock(1), &mut buf.lock()).unwrap();
        assert!(buf.lock().is_stale());
        tp.commit(&cache).unwrap();
        assert_eq!(dp.size, 3 * 4096);

        // last block: size drops to the end of block 0
        let mut tp = journal.begin();
        let buf = cache.get(dp.fork.lookup(2).unwrap(), 1).unwrap();
        tp.join(&buf);
        shrink_inode(&geo, &alloc, &mut tp, &mut dp, DirBlock(2), &mut buf.lock()).unwrap();
        tp.commit(&cache).unwrap();
        assert_eq!(dp.size, 4096);
        assert_eq!(alloc.free_blocks(), 7);
        assert_eq!(cache.device().block_count(), 8);
    }
}
