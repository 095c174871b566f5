//! Byte ranges a data-block change must log.
//!
//! All ranges are inclusive. Fields that cannot be read (a bug in the
//! caller, not on-disk corruption: the record was just written) shrink the
//! range to what is known.

use crate::entry::{entry_namelen, unused_length, unused_tag_offset};
use xd_block::Buf;
use xd_journal::Transaction;
use xd_ondisk::DirOps;
use xd_ondisk::layout::{TAG_SIZE, UNUSED_HDR_SIZE};

/// Log the whole data header, best-free table included.
pub fn log_header(tp: &mut Transaction<'_>, ops: DirOps, buf: &mut Buf) {
    tp.log_buf(buf, 0, ops.data_entry_offset() - 1);
}

/// Log the active entry at `off`, from its first byte through its tag.
pub fn log_entry(tp: &mut Transaction<'_>, ops: DirOps, buf: &mut Buf, off: usize) {
    let namelen = entry_namelen(buf.data(), off).unwrap_or(0);
    let tag = ops.data_entry_tag_offset(off, namelen);
    tp.log_buf(buf, off, tag + TAG_SIZE - 1);
}

/// Log the unused region at `off`: its free tag and length, and its tag.
/// The payload in between is dead space.
pub fn log_unused(tp: &mut Transaction<'_>, buf: &mut Buf, off: usize) {
    tp.log_buf(buf, off, off + UNUSED_HDR_SIZE - 1);
    if let Ok(len) = unused_length(buf.data(), off) {
        let tag = unused_tag_offset(off, len);
        tp.log_buf(buf, tag, tag + TAG_SIZE - 1);
    }
}
