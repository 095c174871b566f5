//! Data-block verification and the buffer verifiers built on it.
//!
//! [`check_block`] is pure: it reads the block and the mount context and
//! reports the first broken invariant as `Corrupted` with the in-block
//! offset where the check was made. The buffer verifiers add the v3
//! self-describing checks and the CRC, and stamp LSN and CRC on write.

use crate::bestfree::{LAST_SLOT, freefind_verify, region};
use crate::entry::{entry_ino, entry_name, entry_namelen, is_unused, unused_length, unused_tag_offset};
use crate::leaf::BlockTrailer;
use crate::{CorruptAt, DaArgs, DirBufferCache, DirContext};
use std::sync::Arc;
use tracing::trace;
use xd_alloc::DirInode;
use xd_block::{Buf, BufOps, BufRef, BufType};
use xd_error::{DirError, Result};
use xd_ondisk::layout::{
    BESTFREE_SLOT_SIZE, DATA_ALIGN, DIR2_BLOCK_MAGIC, DIR2_DATA_MAGIC, DIR3_BLOCK_MAGIC,
    DIR3_DATA_CRC_OFF, DIR3_DATA_MAGIC, ENTRY_NAME_OFF, ENTRY_NAMELEN_OFF, LEAF_ENTRY_SIZE, read_bestfree,
    write_dir3_lsn,
};
use xd_ondisk::{DataMagic, Dir3BlkHdr, DirOps, FileType, update_cksum, verify_cksum};
use xd_types::{DaBlock, Lsn, read_be_u16, read_be_u32, read_be_u64};

/// Byte offset of the owner field of a v3 header.
const DIR3_OWNER_OFF: usize = 40;

/// Structural check of a data or block-format block.
///
/// `ops_override` is the owning directory's dispatch override, if known;
/// a directory whose table differs from the mount's is rejected outright.
pub fn check_block(
    ctx: &DirContext,
    ops_override: Option<DirOps>,
    daddr: u64,
    block: &[u8],
) -> Result<()> {
    let fail = |offset: usize, detail: &str| Err(DirError::corrupted(daddr, offset, detail));
    let geo = &ctx.geo;
    let ops = ctx.ops_for(ops_override);
    if ops != ctx.ops {
        return fail(0, "directory dispatch differs from the mount");
    }
    if block.len() != geo.blksize_usize() {
        return fail(0, "buffer is not one directory block");
    }
    let magic = DataMagic::read(block).at(daddr, 0)?;
    let deo = ops.data_entry_offset();

    let trailer = if magic.is_block() {
        let trailer = BlockTrailer::parse(geo, block).at(daddr, geo.block_tail_offset())?;
        let max_leaves = (geo.block_tail_offset() - deo) / LEAF_ENTRY_SIZE;
        if trailer.tail.count as usize >= max_leaves {
            return fail(geo.block_tail_offset(), "block leaf count too large");
        }
        Some(trailer)
    } else {
        None
    };
    let end = trailer
        .as_ref()
        .map_or(block.len(), |trailer| trailer.leaf_offset);

    let bf_off = ops.data_bestfree_offset();
    let bf = read_bestfree(block, bf_off).at(daddr, bf_off)?;
    let mut freeseen = 0_u8;
    for (i, slot) in bf.iter().enumerate() {
        if slot.length == 0 {
            if slot.offset != 0 {
                return fail(bf_off + i * BESTFREE_SLOT_SIZE, "empty bestfree slot has an offset");
            }
            freeseen |= 1 << i;
        }
    }
    if bf[0].length < bf[1].length {
        return fail(bf_off + BESTFREE_SLOT_SIZE, "bestfree slots out of order");
    }
    if bf[1].length < bf[2].length {
        return fail(bf_off + 2 * BESTFREE_SLOT_SIZE, "bestfree slots out of order");
    }

    let mut count = 0_u32;
    let mut lastfree = false;
    let mut p = deo;
    while p < end {
        if is_unused(block, p).at(daddr, p)? {
            if lastfree {
                return fail(p, "adjacent unused regions");
            }
            let len = unused_length(block, p).at(daddr, p)?;
            if len == 0 || len % DATA_ALIGN != 0 {
                return fail(p, "unused region length misaligned");
            }
            if p + len > end {
                return fail(p, "unused region runs past the data area");
            }
            let tag_off = unused_tag_offset(p, len);
            if usize::from(read_be_u16(block, tag_off).at(daddr, tag_off)?) != p {
                return fail(tag_off, "unused region tag mismatch");
            }
            let dup = region(p, len).at(daddr, p)?;
            match freefind_verify(&bf, dup) {
                Err(detail) => return fail(p, detail),
                Ok(Some(slot)) => {
                    if freeseen & (1 << slot) != 0 {
                        return fail(p, "bestfree slot matched twice");
                    }
                    freeseen |= 1 << slot;
                }
                Ok(None) => {
                    if dup.length > bf[LAST_SLOT].length {
                        return fail(p, "untracked unused region longer than the smallest slot");
                    }
                }
            }
            trace!(block = daddr, offset = p, len, "verify: unused");
            p += len;
            lastfree = true;
            continue;
        }

        let namelen = entry_namelen(block, p).at(daddr, p)?;
        if namelen == 0 {
            return fail(p + ENTRY_NAMELEN_OFF, "entry with an empty name");
        }
        if ctx.ino_validate(entry_ino(block, p).at(daddr, p)?).is_err() {
            return fail(p, "invalid inode number");
        }
        let size = ops.data_entsize(namelen);
        if p + size > end {
            return fail(p, "entry runs past the data area");
        }
        let tag_off = ops.data_entry_tag_offset(p, namelen);
        if usize::from(read_be_u16(block, tag_off).at(daddr, tag_off)?) != p {
            return fail(tag_off, "entry tag mismatch");
        }
        if ops.data_raw_ftype(block, p).at(daddr, p)? >= FileType::MAX {
            return fail(p + ENTRY_NAME_OFF + namelen, "file type out of range");
        }
        count += 1;
        lastfree = false;
        if let Some(trailer) = &trailer {
            let addr = geo.db_off_to_dataptr(geo.da_to_db(geo.datablk), p);
            let hash = ctx.hashname(entry_name(block, p).at(daddr, p)?);
            if !trailer.with_hash(hash).any(|leaf| leaf.address == addr) {
                return fail(p, "entry missing from the leaf array");
            }
        }
        trace!(block = daddr, offset = p, size, "verify: entry");
        p += size;
    }

    if freeseen != 0b111 {
        return fail(bf_off, "bestfree slot names no unused region");
    }
    if let Some(trailer) = &trailer {
        let mut stale = 0_u32;
        for (i, leaf) in trailer.leaves.iter().enumerate() {
            if leaf.is_stale() {
                stale += 1;
            }
            if i > 0 && leaf.hashval < trailer.leaves[i - 1].hashval {
                return fail(trailer.leaf_entry_offset(i), "leaf hashes out of order");
            }
        }
        let tail_off = geo.block_tail_offset();
        if trailer.tail.stale > trailer.tail.count || count != trailer.tail.count - trailer.tail.stale {
            return fail(tail_off, "leaf count does not match the entries");
        }
        if stale != trailer.tail.stale {
            return fail(tail_off + 4, "stale count does not match the leaf array");
        }
    }
    Ok(())
}

/// [`check_block`] over a buffer.
pub fn data_check(ctx: &DirContext, ops_override: Option<DirOps>, buf: &Buf) -> Result<()> {
    check_block(ctx, ops_override, buf.daddr().0, buf.data())
}

/// Expected magic for this mount: the data or block variant of its
/// header generation.
fn mount_magic(ctx: &DirContext, block_format: bool) -> u32 {
    match (ctx.features.crc, block_format) {
        (true, true) => DIR3_BLOCK_MAGIC,
        (true, false) => DIR3_DATA_MAGIC,
        (false, true) => DIR2_BLOCK_MAGIC,
        (false, false) => DIR2_DATA_MAGIC,
    }
}

/// Magic, the v3 self-describing fields, then the structure.
fn verify_header_and_body(ctx: &DirContext, buf: &Buf, block_format: bool) -> Result<()> {
    let (daddr, block) = (buf.daddr().0, buf.data());
    if read_be_u32(block, 0).at(daddr, 0)? != mount_magic(ctx, block_format) {
        return Err(DirError::corrupted(daddr, 0, "bad magic"));
    }
    if ctx.features.crc {
        let hdr = Dir3BlkHdr::parse(block).at(daddr, 0)?;
        if hdr.uuid != ctx.meta_uuid {
            return Err(DirError::corrupted(daddr, 24, "uuid mismatch"));
        }
        if hdr.blkno != daddr {
            return Err(DirError::corrupted(daddr, 8, "self block number mismatch"));
        }
        if !ctx.journal.check_lsn(Lsn(hdr.lsn)) {
            return Err(DirError::corrupted(daddr, 16, "LSN ahead of the log"));
        }
    }
    check_block(ctx, None, daddr, block)
}

fn verify_read_common(ctx: &DirContext, buf: &Buf, block_format: bool) -> Result<()> {
    if ctx.features.crc
        && !verify_cksum(buf.data(), DIR3_DATA_CRC_OFF).at(buf.daddr().0, DIR3_DATA_CRC_OFF)?
    {
        return Err(DirError::BadCrc {
            block: buf.daddr().0,
        });
    }
    verify_header_and_body(ctx, buf, block_format)
}

fn verify_write_common(ctx: &DirContext, buf: &mut Buf, block_format: bool) -> Result<()> {
    verify_header_and_body(ctx, buf, block_format)?;
    if !ctx.features.crc {
        return Ok(());
    }
    let (daddr, lsn) = (buf.daddr().0, buf.log_item().lsn);
    // never committed: keep whatever LSN the block carries
    if lsn != Lsn::ZERO {
        write_dir3_lsn(buf.data_mut(), lsn.0).at(daddr, 16)?;
    }
    update_cksum(buf.data_mut(), DIR3_DATA_CRC_OFF).at(daddr, DIR3_DATA_CRC_OFF)
}

/// Verifier for multi-block directory data blocks.
#[derive(Debug, Clone)]
pub struct DataBufOps {
    ctx: Arc<DirContext>,
}

impl DataBufOps {
    #[must_use]
    pub fn new(ctx: Arc<DirContext>) -> Self {
        Self { ctx }
    }
}

impl BufOps for DataBufOps {
    fn name(&self) -> &'static str {
        "dir3_data"
    }

    fn verify_read(&self, buf: &mut Buf) -> Result<()> {
        verify_read_common(&self.ctx, buf, false)
    }

    fn verify_write(&self, buf: &mut Buf) -> Result<()> {
        verify_write_common(&self.ctx, buf, false)
    }

    fn verify_struct(&self, buf: &Buf) -> Result<()> {
        verify_header_and_body(&self.ctx, buf, false)
    }
}

/// Verifier for single-block directories.
#[derive(Debug, Clone)]
pub struct BlockBufOps {
    ctx: Arc<DirContext>,
}

impl BlockBufOps {
    #[must_use]
    pub fn new(ctx: Arc<DirContext>) -> Self {
        Self { ctx }
    }
}

impl BufOps for BlockBufOps {
    fn name(&self) -> &'static str {
        "dir3_block"
    }

    fn verify_read(&self, buf: &mut Buf) -> Result<()> {
        verify_read_common(&self.ctx, buf, true)
    }

    fn verify_write(&self, buf: &mut Buf) -> Result<()> {
        verify_write_common(&self.ctx, buf, true)
    }

    fn verify_struct(&self, buf: &Buf) -> Result<()> {
        verify_header_and_body(&self.ctx, buf, true)
    }
}

/// Verifier for the first block of a directory read ahead before its
/// format is known: picks the block or data verifier from the magic and
/// installs it on the buffer.
#[derive(Debug, Clone)]
pub struct ReadaheadBufOps {
    ctx: Arc<DirContext>,
}

impl ReadaheadBufOps {
    #[must_use]
    pub fn new(ctx: Arc<DirContext>) -> Self {
        Self { ctx }
    }

    fn resolve(&self, buf: &Buf) -> Result<Arc<dyn BufOps>> {
        match DataMagic::read(buf.data()) {
            Ok(magic) if magic.is_block() => Ok(Arc::new(BlockBufOps::new(Arc::clone(&self.ctx)))),
            Ok(_) => Ok(Arc::new(DataBufOps::new(Arc::clone(&self.ctx)))),
            Err(_) => Err(DirError::corrupted(buf.daddr().0, 0, "unknown directory block magic")),
        }
    }
}

impl BufOps for ReadaheadBufOps {
    fn name(&self) -> &'static str {
        "dir3_data_reada"
    }

    fn verify_read(&self, buf: &mut Buf) -> Result<()> {
        let ops = self.resolve(buf)?;
        buf.set_ops(Some(Arc::clone(&ops)));
        ops.verify_read(buf)
    }

    fn verify_write(&self, buf: &mut Buf) -> Result<()> {
        verify_write_common(&self.ctx, buf, false)
    }

    fn verify_struct(&self, buf: &Buf) -> Result<()> {
        self.resolve(buf)?.verify_struct(buf)
    }
}

/// Read data block `da` of directory `dp` through the cache and run the
/// checks that need the owning inode. Nothing is joined to a transaction.
pub fn read_verified(
    ctx: &Arc<DirContext>,
    cache: &DirBufferCache,
    dp: &DirInode,
    ops_override: Option<DirOps>,
    da: DaBlock,
) -> Result<BufRef> {
    let geo = ctx.geo;
    let daddr = dp
        .fork
        .map_range(da.0, geo.fsbcount)
        .ok_or_else(|| DirError::corrupted(dp.ino.0, 0, format!("data block {da} is not mapped")))?;
    let ops: Arc<dyn BufOps> = Arc::new(DataBufOps::new(Arc::clone(ctx)));
    let bufref = cache.read(daddr, geo.fsbcount, Some(ops))?;
    {
        let buf = bufref.lock();
        if ctx.features.crc {
            let owner = read_be_u64(buf.data(), DIR3_OWNER_OFF).at(daddr.0, DIR3_OWNER_OFF)?;
            if owner != dp.ino.0 {
                return Err(DirError::corrupted(daddr.0, DIR3_OWNER_OFF, "owner mismatch"));
            }
        }
        if ops_override.is_some() {
            data_check(ctx, ops_override, &buf)?;
        }
    }
    Ok(bufref)
}

/// Read data block `da` of the directory in `args` through the cache,
/// join it to the transaction and tag it for recovery.
pub fn data_read(args: &mut DaArgs<'_, '_>, da: DaBlock) -> Result<BufRef> {
    let bufref = read_verified(args.ctx, args.cache, args.dp, args.ops_override, da)?;
    args.tp.join(&bufref);
    args.tp.set_buf_type(&mut bufref.lock(), BufType::DirDataBuf);
    Ok(bufref)
}

/// Pull block `da` of `dp` into the cache before it is needed. The format
/// is taken from the block's magic and the buffer keeps the verifier that
/// magic selected. An unmapped `da` is not an error.
pub fn data_readahead(
    ctx: &Arc<DirContext>,
    cache: &DirBufferCache,
    dp: &DirInode,
    da: DaBlock,
) -> Result<()> {
    let geo = ctx.geo;
    let Some(daddr) = dp.fork.map_range(da.0, geo.fsbcount) else {
        return Ok(());
    };
    let ops: Arc<dyn BufOps> = Arc::new(ReadaheadBufOps::new(Arc::clone(ctx)));
    let _ = cache.read(daddr, geo.fsbcount, Some(ops))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::write_unused;
    use crate::leaf::BlockTrailer;
    use crate::test_support::{blank, build, context, crc_features, ftype_features};
    use xd_ondisk::layout::write_bestfree;
    use xd_ondisk::{BestFree, LeafEntry};
    use xd_types::{write_be_u16, write_be_u32, write_be_u64, write_u8};

    const OPS: DirOps = DirOps::V2Ftype;

    fn offset_of(err: DirError) -> usize {
        match err {
            DirError::Corrupted { offset, .. } => offset,
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn fresh_and_populated_blocks_pass() {
        let ctx = context(ftype_features());
        assert!(data_check(&ctx, None, &build(OPS, 3, &[])).is_ok());
        let buf = build(OPS, 3, &[b"a", b"bb", b"ccc"]);
        assert!(data_check(&ctx, None, &buf).is_ok());
    }

    #[test]
    fn every_tag_byte_is_checked() {
        let ctx = context(ftype_features());
        let buf = build(OPS, 3, &[b"a", b"bb"]);
        // entry tags at 30 and 46, region tag at 4094
        for tag_off in [30_usize, 46, 4094] {
            for byte in [tag_off, tag_off + 1] {
                let mut bad = buf.data().to_vec();
                bad[byte] ^= 0xFF;
                let err = check_block(&ctx, None, 3, &bad).unwrap_err();
                assert_eq!(offset_of(err), tag_off, "byte {byte}");
            }
        }
    }

    #[test]
    fn empty_slot_with_offset_rejected() {
        let ctx = context(ftype_features());
        let mut block = build(OPS, 3, &[]).data().to_vec();
        write_be_u16(&mut block, 8, 40).unwrap();
        assert_eq!(offset_of(check_block(&ctx, None, 3, &block).unwrap_err()), 8);
    }

    #[test]
    fn adjacent_unused_regions_rejected() {
        let ctx = context(ftype_features());
        let mut block = build(OPS, 3, &[]).data().to_vec();
        write_unused(&mut block, 16, 16).unwrap();
        write_unused(&mut block, 32, 4064).unwrap();
        let bf = [BestFree::new(32, 4064), BestFree::new(16, 16), BestFree::EMPTY];
        write_bestfree(&mut block, 4, &bf).unwrap();
        assert_eq!(offset_of(check_block(&ctx, None, 3, &block).unwrap_err()), 32);
    }

    #[test]
    fn untracked_large_region_rejected() {
        let ctx = context(ftype_features());
        let buf = build(OPS, 3, &[b"a"]);
        let mut block = buf.data().to_vec();
        // forget the only region
        write_bestfree(&mut block, 4, &[BestFree::EMPTY; 3]).unwrap();
        assert_eq!(offset_of(check_block(&ctx, None, 3, &block).unwrap_err()), 32);
    }

    #[test]
    fn slot_without_region_rejected() {
        let ctx = context(ftype_features());
        let mut block = build(OPS, 3, &[b"a"]).data().to_vec();
        let bf = [BestFree::new(32, 4064), BestFree::new(8, 8), BestFree::EMPTY];
        write_bestfree(&mut block, 4, &bf).unwrap();
        assert!(check_block(&ctx, None, 3, &block).is_err());
    }

    #[test]
    fn bad_inode_and_file_type_rejected() {
        let ctx = context(ftype_features());
        let buf = build(OPS, 3, &[b"a"]);

        let mut block = buf.data().to_vec();
        write_be_u64(&mut block, 16, 0).unwrap();
        assert_eq!(offset_of(check_block(&ctx, None, 3, &block).unwrap_err()), 16);

        let mut block = buf.data().to_vec();
        write_u8(&mut block, 16 + 9 + 1, 9).unwrap();
        assert_eq!(offset_of(check_block(&ctx, None, 3, &block).unwrap_err()), 26);

        let mut block = buf.data().to_vec();
        write_u8(&mut block, 16 + 8, 0).unwrap();
        assert_eq!(offset_of(check_block(&ctx, None, 3, &block).unwrap_err()), 24);
    }

    #[test]
    fn override_differing_from_mount_rejected() {
        let ctx = context(ftype_features());
        let buf = build(OPS, 3, &[]);
        assert!(data_check(&ctx, Some(DirOps::V2Ftype), &buf).is_ok());
        assert!(data_check(&ctx, Some(DirOps::V2), &buf).is_err());
    }

    fn block_format(ctx: &DirContext) -> Vec<u8> {
        let mut block = vec![0_u8; 4096];
        write_be_u32(&mut block, 0, DIR2_BLOCK_MAGIC).unwrap();
        let leaves = vec![
            LeafEntry {
                hashval: ctx.hashname(b"."),
                address: ctx.geo.db_off_to_dataptr(xd_types::DirBlock(0), 16),
            },
            LeafEntry {
                hashval: ctx.hashname(b".."),
                address: ctx.geo.db_off_to_dataptr(xd_types::DirBlock(0), 32),
            },
        ];
        let trailer = BlockTrailer::new(&ctx.geo, leaves).unwrap();
        trailer.write(&mut block).unwrap();
        crate::entry::write_entry(OPS, &mut block, 16, 0x80, b".", FileType::Dir).unwrap();
        crate::entry::write_entry(OPS, &mut block, 32, 0x40, b"..", FileType::Dir).unwrap();
        write_unused(&mut block, 48, trailer.leaf_offset - 48).unwrap();
        let bf = [
            BestFree::new(48, u16::try_from(trailer.leaf_offset - 48).unwrap()),
            BestFree::EMPTY,
            BestFree::EMPTY,
        ];
        write_bestfree(&mut block, 4, &bf).unwrap();
        block
    }

    #[test]
    fn block_format_checks_leaf_array() {
        let ctx = context(ftype_features());
        let block = block_format(&ctx);
        assert!(check_block(&ctx, None, 0, &block).is_ok());

        // entry whose hash is not in the leaf array
        let mut bad = block.clone();
        write_u8(&mut bad, 16 + 9, b'x').unwrap();
        assert_eq!(offset_of(check_block(&ctx, None, 0, &bad).unwrap_err()), 16);

        // hash present but pointing at another offset
        let mut bad = block.clone();
        let dataptr = |off| ctx.geo.db_off_to_dataptr(xd_types::DirBlock(0), off);
        let moved = vec![
            LeafEntry {
                hashval: ctx.hashname(b"."),
                address: dataptr(48),
            },
            LeafEntry {
                hashval: ctx.hashname(b".."),
                address: dataptr(32),
            },
        ];
        BlockTrailer::new(&ctx.geo, moved).unwrap().write(&mut bad).unwrap();
        assert_eq!(offset_of(check_block(&ctx, None, 0, &bad).unwrap_err()), 16);

        // stale count that does not match
        let mut bad = block.clone();
        write_be_u32(&mut bad, 4092, 1).unwrap();
        assert!(check_block(&ctx, None, 0, &bad).is_err());

        // leaf count too large for the block
        let mut bad = block;
        write_be_u32(&mut bad, 4088, 600).unwrap();
        assert!(check_block(&ctx, None, 0, &bad).is_err());
    }

    #[test]
    fn block_buf_ops_accept_block_magic_only() {
        let ctx = context(ftype_features());
        let buf = Buf::new(xd_types::BlockNumber(0), block_format(&ctx));
        assert!(BlockBufOps::new(Arc::clone(&ctx)).verify_struct(&buf).is_ok());
        assert!(DataBufOps::new(Arc::clone(&ctx)).verify_struct(&buf).is_err());
    }

    #[test]
    fn v3_write_stamps_and_read_accepts() {
        let ctx = context(crc_features());
        let mut buf = build(DirOps::V3, 21, &[b"x"]);
        let ops = DataBufOps::new(Arc::clone(&ctx));
        buf.log_item_mut().lsn = ctx.journal.head();
        ops.verify_write(&mut buf).unwrap();
        assert_eq!(read_be_u64(buf.data(), 16), Ok(ctx.journal.head().0));
        assert!(verify_cksum(buf.data(), DIR3_DATA_CRC_OFF).unwrap());
        ops.verify_read(&mut buf).unwrap();
    }

    #[test]
    fn v3_read_reports_crc_before_structure() {
        let ctx = context(crc_features());
        let mut buf = build(DirOps::V3, 21, &[]);
        let ops = DataBufOps::new(Arc::clone(&ctx));
        ops.verify_write(&mut buf).unwrap();
        buf.data_mut()[100] ^= 1;
        assert!(matches!(
            ops.verify_read(&mut buf),
            Err(DirError::BadCrc { block: 21 })
        ));
    }

    #[test]
    fn v3_self_describing_fields_checked() {
        let ctx = context(crc_features());
        let ops = DataBufOps::new(Arc::clone(&ctx));

        // block number
        let buf = build(DirOps::V3, 21, &[]);
        let moved = Buf::new(xd_types::BlockNumber(22), buf.data().to_vec());
        assert_eq!(offset_of(ops.verify_struct(&moved).unwrap_err()), 8);

        // uuid
        let mut bad = build(DirOps::V3, 21, &[]);
        bad.data_mut()[30] ^= 1;
        assert_eq!(offset_of(ops.verify_struct(&bad).unwrap_err()), 24);

        // LSN from the future
        let mut bad = build(DirOps::V3, 21, &[]);
        write_be_u64(bad.data_mut(), 16, Lsn::new(9, 0).0).unwrap();
        assert_eq!(offset_of(ops.verify_struct(&bad).unwrap_err()), 16);
    }

    #[test]
    fn legacy_magic_on_crc_mount_rejected() {
        let ctx = context(crc_features());
        let buf = build(OPS, 3, &[]);
        assert_eq!(
            offset_of(DataBufOps::new(ctx).verify_struct(&buf).unwrap_err()),
            0
        );
    }

    #[test]
    fn readahead_installs_verifier_from_magic() {
        let ctx = context(ftype_features());
        let ra = ReadaheadBufOps::new(Arc::clone(&ctx));

        let mut data = build(OPS, 3, &[]);
        ra.verify_read(&mut data).unwrap();
        assert_eq!(data.ops().unwrap().name(), "dir3_data");

        let mut block = Buf::new(xd_types::BlockNumber(0), block_format(&ctx));
        ra.verify_read(&mut block).unwrap();
        assert_eq!(block.ops().unwrap().name(), "dir3_block");

        let mut junk = blank(4);
        assert!(ra.verify_read(&mut junk).unwrap_err().is_corruption());
    }
}
