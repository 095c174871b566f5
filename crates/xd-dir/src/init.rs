//! Fresh data blocks.

use crate::bestfree::{region, store};
use crate::entry::write_unused;
use crate::log::{log_header, log_unused};
use crate::verify::DataBufOps;
use crate::{CorruptAt, DaArgs};
use std::sync::Arc;
use tracing::debug;
use xd_block::{Buf, BufRef, BufType};
use xd_error::{DirError, Result};
use xd_ondisk::layout::{DIR2_DATA_MAGIC, DIR3_DATA_MAGIC, data_endpoint};
use xd_ondisk::{BestFree, Dir3BlkHdr, DirOps};
use xd_types::{DirBlock, FsUuid, ensure_slice_mut, write_be_u32};

/// Lay out an empty data block in `buf`: header, one unused region over
/// the whole payload, and slot 0 pointing at it. Nothing is logged.
///
/// `blkno`, `owner` and `uuid` are only stored on v3 blocks.
pub fn init_block(ops: DirOps, buf: &mut Buf, blkno: u64, owner: u64, uuid: FsUuid) -> Result<()> {
    let daddr = buf.daddr().0;
    let deo = ops.data_entry_offset();
    let block = buf.data_mut();
    ensure_slice_mut(block, 0, deo).at(daddr, 0)?.fill(0);
    if ops.is_v3() {
        Dir3BlkHdr {
            magic: DIR3_DATA_MAGIC,
            crc: 0,
            blkno,
            lsn: 0,
            uuid,
            owner,
        }
        .write(block)
        .at(daddr, 0)?;
    } else {
        write_be_u32(block, 0, DIR2_DATA_MAGIC).at(daddr, 0)?;
    }

    let end = data_endpoint(block).at(daddr, 0)?;
    let body = region(deo, end - deo).at(daddr, deo)?;
    write_unused(block, deo, end - deo).at(daddr, deo)?;
    store(ops, buf, &[body, BestFree::EMPTY, BestFree::EMPTY])
}

/// Create data block `db` of the directory in `args`: get its buffer,
/// attach the data verifier, lay out an empty block, and log it.
pub fn data_init(args: &mut DaArgs<'_, '_>, db: DirBlock) -> Result<BufRef> {
    let geo = args.ctx.geo;
    let da = geo.db_to_da(db);
    let daddr = args
        .dp
        .fork
        .map_range(da.0, geo.fsbcount)
        .ok_or_else(|| DirError::corrupted(args.dp.ino.0, 0, format!("data block {db} is not mapped")))?;

    let bufref = args.cache.get(daddr, geo.fsbcount)?;
    args.tp.join(&bufref);
    let mut buf = bufref.lock();
    buf.set_ops(Some(Arc::new(DataBufOps::new(Arc::clone(args.ctx)))));
    args.tp.set_buf_type(&mut buf, BufType::DirDataBuf);
    init_block(args.ops, &mut buf, daddr.0, args.dp.ino.0, args.ctx.meta_uuid)?;

    let deo = args.ops.data_entry_offset();
    log_header(args.tp, args.ops, &mut buf);
    log_unused(args.tp, &mut buf, deo);
    debug!(ino = args.dp.ino.0, db = db.0, block = daddr.0, "data block initialised");
    drop(buf);
    Ok(bufref)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bestfree::load;
    use crate::entry::{unused_length, unused_tag};
    use crate::test_support::blank;
    use xd_types::{read_be_u32, read_be_u64};

    #[test]
    fn legacy_block_layout() {
        let mut buf = blank(5);
        buf.data_mut()[..16].fill(0xAA);
        init_block(DirOps::V2Ftype, &mut buf, 5, 0x80, FsUuid::default()).unwrap();
        let block = buf.data();
        assert_eq!(&block[..4], b"XD2D");
        assert_eq!(
            load(DirOps::V2Ftype, &buf).unwrap(),
            [BestFree::new(16, 4080), BestFree::EMPTY, BestFree::EMPTY]
        );
        assert_eq!(unused_length(block, 16), Ok(4080));
        assert_eq!(unused_tag(block, 16), Ok(16));
        assert_eq!(&block[4094..], &[0, 16]);
    }

    #[test]
    fn v3_block_layout() {
        let mut buf = blank(77);
        let uuid = FsUuid::from_u128(0x1234);
        init_block(DirOps::V3, &mut buf, 77, 0x99, uuid).unwrap();
        let block = buf.data();
        assert_eq!(&block[..4], b"XDD3");
        assert_eq!(read_be_u64(block, 8), Ok(77));
        assert_eq!(read_be_u64(block, 16), Ok(0));
        assert_eq!(&block[24..40], uuid.as_bytes());
        assert_eq!(read_be_u64(block, 40), Ok(0x99));
        assert_eq!(read_be_u32(block, 60), Ok(0));
        assert_eq!(
            load(DirOps::V3, &buf).unwrap(),
            [BestFree::new(64, 4032), BestFree::EMPTY, BestFree::EMPTY]
        );
        assert_eq!(unused_tag(block, 64), Ok(64));
    }
}
