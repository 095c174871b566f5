//! Space engine: turning records into unused space and back.
//!
//! Both operations keep the tiling, the tags and the no-adjacent-free rule
//! intact on return. The best-free table is kept exact where that can be
//! done from the slots alone; otherwise the result says `needscan` and the
//! caller rescans before the block is touched again.

use crate::bestfree::{LAST_SLOT, freefind, freeinsert, freeremove, load, region, store};
use crate::entry::{is_unused, set_unused_length, unused_length, unused_tag, write_unused};
use crate::log::log_unused;
use crate::{CorruptAt, SpaceOutcome};
use tracing::{debug, warn};
use xd_block::Buf;
use xd_error::{DirError, Result};
use xd_journal::Transaction;
use xd_ondisk::layout::{DATA_ALIGN, TAG_SIZE, data_endpoint};
use xd_ondisk::{BestFree, BestFreeTable, DataMagic, DirOps};
use xd_types::read_be_u16;

/// An unused region: block offset and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Dup {
    off: usize,
    len: usize,
}

fn corrupt(buf: &Buf, offset: usize, detail: &str) -> DirError {
    warn!(block = buf.daddr().0, offset, detail, "directory free space corrupt");
    DirError::corrupted(buf.daddr().0, offset, detail)
}

fn read_dup(buf: &Buf, off: usize) -> Result<Option<Dup>> {
    let daddr = buf.daddr().0;
    if !is_unused(buf.data(), off).at(daddr, off)? {
        return Ok(None);
    }
    let len = unused_length(buf.data(), off).at(daddr, off)?;
    Ok(Some(Dup { off, len }))
}

/// Sanity of carving `[offset, offset + len)` out of the unused region at
/// `dup_off`. Returns the broken rule.
pub fn check_free(block: &[u8], dup_off: usize, offset: usize, len: usize) -> Result<(), &'static str> {
    if DataMagic::read(block).is_err() {
        return Err("bad magic");
    }
    if !is_unused(block, dup_off).unwrap_or(false) {
        return Err("region is not free");
    }
    let dup_len = unused_length(block, dup_off).map_err(|_| "region length unreadable")?;
    if offset < dup_off {
        return Err("range starts before the region");
    }
    if offset + len > dup_off + dup_len {
        return Err("range runs past the region");
    }
    if unused_tag(block, dup_off) != Ok(dup_off) {
        return Err("region tag does not match its offset");
    }
    Ok(())
}

/// After re-tracking a shortened region: it must have landed in a slot
/// with exactly its offset and length.
pub fn check_new_free(bf: &BestFreeTable, slot: Option<usize>, newdup: BestFree) -> Result<(), &'static str> {
    let Some(slot) = slot else {
        return Err("shortened region was not reinserted");
    };
    if bf[slot].length != newdup.length {
        return Err("reinserted slot length differs");
    }
    if bf[slot].offset != newdup.offset {
        return Err("reinserted slot offset differs");
    }
    Ok(())
}

/// Give `[offset, offset + len)` back as unused space, merging with free
/// neighbours.
pub fn make_free(
    tp: &mut Transaction<'_>,
    ops: DirOps,
    buf: &mut Buf,
    offset: usize,
    len: usize,
) -> Result<SpaceOutcome> {
    let daddr = buf.daddr().0;
    let deo = ops.data_entry_offset();
    let end = data_endpoint(buf.data()).at(daddr, 0)?;
    if offset < deo || len == 0 || len % DATA_ALIGN != 0 || offset + len > end {
        return Err(corrupt(buf, offset, "freed range outside the data area"));
    }

    let prevdup = if offset > deo {
        let tag = usize::from(read_be_u16(buf.data(), offset - TAG_SIZE).at(daddr, offset - TAG_SIZE)?);
        if tag < deo || tag >= offset {
            return Err(corrupt(buf, offset - TAG_SIZE, "previous record tag out of range"));
        }
        match read_dup(buf, tag)? {
            Some(dup) if dup.off + dup.len != offset => {
                return Err(corrupt(buf, tag, "previous free region does not end at freed range"));
            }
            found => found,
        }
    } else {
        None
    };
    let postdup = if offset + len < end {
        match read_dup(buf, offset + len)? {
            Some(dup) if dup.off + dup.len > end => {
                return Err(corrupt(buf, dup.off, "following free region runs past the end"));
            }
            found => found,
        }
    } else {
        None
    };

    let mut bf = load(ops, buf)?;
    let mut out = SpaceOutcome::default();
    match (prevdup, postdup) {
        (Some(prev), Some(post)) => {
            let dfp = freefind(&bf, region(prev.off, prev.len).at(daddr, prev.off)?);
            let dfp2 = freefind(&bf, region(post.off, post.len).at(daddr, post.off)?);
            // with slot 2 empty the two neighbours must be slots 0 and 1
            out.needscan = bf[LAST_SLOT].length != 0;
            if !out.needscan && (dfp.is_none() || dfp2.is_none()) {
                return Err(corrupt(buf, prev.off, "free neighbours missing from bestfree"));
            }
            let merged = prev.len + len + post.len;
            let newdup = region(prev.off, merged).at(daddr, prev.off)?;
            set_unused_length(buf.data_mut(), prev.off, merged).at(daddr, prev.off)?;
            log_unused(tp, buf, prev.off);
            if !out.needscan {
                freeremove(&mut bf, 1);
                freeremove(&mut bf, 0);
                let _ = freeinsert(&mut bf, newdup);
                out.needlog = true;
            }
            debug!(block = daddr, offset, len, merged, needscan = out.needscan, "make_free: merge both");
        }
        (Some(prev), None) => {
            let dfp = freefind(&bf, region(prev.off, prev.len).at(daddr, prev.off)?);
            let merged = prev.len + len;
            let newdup = region(prev.off, merged).at(daddr, prev.off)?;
            set_unused_length(buf.data_mut(), prev.off, merged).at(daddr, prev.off)?;
            log_unused(tp, buf, prev.off);
            if let Some(slot) = dfp {
                freeremove(&mut bf, slot);
                let _ = freeinsert(&mut bf, newdup);
                out.needlog = true;
            } else {
                out.needscan = newdup.length > bf[LAST_SLOT].length;
            }
            debug!(block = daddr, offset, len, merged, needscan = out.needscan, "make_free: merge previous");
        }
        (None, Some(post)) => {
            let dfp = freefind(&bf, region(post.off, post.len).at(daddr, post.off)?);
            let merged = len + post.len;
            let newdup = region(offset, merged).at(daddr, offset)?;
            write_unused(buf.data_mut(), offset, merged).at(daddr, offset)?;
            log_unused(tp, buf, offset);
            if let Some(slot) = dfp {
                freeremove(&mut bf, slot);
                let _ = freeinsert(&mut bf, newdup);
                out.needlog = true;
            } else {
                out.needscan = newdup.length > bf[LAST_SLOT].length;
            }
            debug!(block = daddr, offset, len, merged, needscan = out.needscan, "make_free: merge following");
        }
        (None, None) => {
            let newdup = region(offset, len).at(daddr, offset)?;
            write_unused(buf.data_mut(), offset, len).at(daddr, offset)?;
            log_unused(tp, buf, offset);
            out.needlog = freeinsert(&mut bf, newdup).is_some();
            debug!(block = daddr, offset, len, "make_free: new region");
        }
    }
    if out.needlog {
        store(ops, buf, &bf)?;
    }
    Ok(out)
}

/// Carve `[offset, offset + len)` out of the unused region at `dup_off`.
///
/// Fails with `Corrupted`, leaving the block untouched, when the range is
/// not inside the region, the region's header or tag is damaged, or the
/// best-free table cannot take the shortened region. The table is settled
/// before the block is written.
pub fn use_free(
    tp: &mut Transaction<'_>,
    ops: DirOps,
    buf: &mut Buf,
    dup_off: usize,
    offset: usize,
    len: usize,
) -> Result<SpaceOutcome> {
    let daddr = buf.daddr().0;
    if let Err(detail) = check_free(buf.data(), dup_off, offset, len) {
        return Err(corrupt(buf, dup_off, detail));
    }
    let oldlen = unused_length(buf.data(), dup_off).at(daddr, dup_off)?;
    let mut bf = load(ops, buf)?;
    let dfp = freefind(&bf, region(dup_off, oldlen).at(daddr, dup_off)?);
    let matchfront = dup_off == offset;
    let matchback = dup_off + oldlen == offset + len;
    let mut out = SpaceOutcome::default();

    if matchfront && matchback {
        if let Some(slot) = dfp {
            out.needscan = bf[LAST_SLOT].offset != 0;
            if !out.needscan {
                freeremove(&mut bf, slot);
                out.needlog = true;
            }
        }
        debug!(block = daddr, offset, len, needscan = out.needscan, "use_free: exact");
    } else if matchfront || matchback {
        let newdup = if matchfront {
            Dup {
                off: offset + len,
                len: oldlen - len,
            }
        } else {
            Dup {
                off: dup_off,
                len: offset - dup_off,
            }
        };
        // settle the table before any byte of the block changes
        if let Some(slot) = dfp {
            let entry = region(newdup.off, newdup.len).at(daddr, newdup.off)?;
            freeremove(&mut bf, slot);
            let landed = freeinsert(&mut bf, entry);
            if let Err(detail) = check_new_free(&bf, landed, entry) {
                return Err(corrupt(buf, newdup.off, detail));
            }
            out.needlog = true;
            // landing last says nothing about what else belongs in slot 2
            out.needscan = landed == Some(LAST_SLOT);
        }
        if matchfront {
            write_unused(buf.data_mut(), newdup.off, newdup.len).at(daddr, newdup.off)?;
        } else {
            set_unused_length(buf.data_mut(), dup_off, newdup.len).at(daddr, dup_off)?;
        }
        log_unused(tp, buf, newdup.off);
        debug!(
            block = daddr,
            offset,
            len,
            front = matchfront,
            needscan = out.needscan,
            "use_free: trim"
        );
    } else {
        let first_len = offset - dup_off;
        let (second_off, second_len) = (offset + len, oldlen - len - first_len);
        let first = region(dup_off, first_len).at(daddr, dup_off)?;
        let second = region(second_off, second_len).at(daddr, second_off)?;
        if let Some(slot) = dfp {
            out.needscan = bf[LAST_SLOT].length != 0;
            if !out.needscan {
                freeremove(&mut bf, slot);
                let _ = freeinsert(&mut bf, first);
                let _ = freeinsert(&mut bf, second);
                out.needlog = true;
            }
        }
        set_unused_length(buf.data_mut(), dup_off, first_len).at(daddr, dup_off)?;
        log_unused(tp, buf, dup_off);
        write_unused(buf.data_mut(), second_off, second_len).at(daddr, second_off)?;
        log_unused(tp, buf, second_off);
        debug!(block = daddr, offset, len, needscan = out.needscan, "use_free: split");
    }
    if out.needlog {
        store(ops, buf, &bf)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::write_entry;
    use crate::init::init_block;
    use crate::test_support::blank;
    use xd_journal::Journal;
    use xd_ondisk::FileType;

    const OPS: DirOps = DirOps::V2Ftype;

    fn fresh() -> Buf {
        let mut buf = blank(9);
        init_block(OPS, &mut buf, 9, 0x80, xd_types::FsUuid::default()).unwrap();
        buf
    }

    fn table(buf: &Buf) -> Vec<(u16, u16)> {
        load(OPS, buf)
            .unwrap()
            .iter()
            .map(|s| (s.offset, s.length))
            .collect()
    }

    /// Carve an entry from the front of the region at `dup_off`.
    fn insert(tp: &mut Transaction<'_>, buf: &mut Buf, dup_off: usize, name: &[u8]) -> SpaceOutcome {
        let size = OPS.data_entsize(name.len());
        let out = use_free(tp, OPS, buf, dup_off, dup_off, size).unwrap();
        write_entry(OPS, buf.data_mut(), dup_off, 0x100, name, FileType::RegFile).unwrap();
        out
    }

    #[test]
    fn front_carve_moves_slot_zero() {
        let journal = Journal::new(1);
        let mut tp = journal.begin();
        let mut buf = fresh();
        let out = insert(&mut tp, &mut buf, 16, b"a");
        assert_eq!(out, SpaceOutcome { needlog: true, needscan: false });
        assert_eq!(table(&buf), vec![(32, 4064), (0, 0), (0, 0)]);
        assert_eq!(unused_tag(buf.data(), 32), Ok(32));
        tp.abort();
    }

    #[test]
    fn free_between_entries_creates_second_slot() {
        let journal = Journal::new(1);
        let mut tp = journal.begin();
        let mut buf = fresh();
        insert(&mut tp, &mut buf, 16, b"a");
        insert(&mut tp, &mut buf, 32, b"bb");
        let out = make_free(&mut tp, OPS, &mut buf, 16, 16).unwrap();
        assert_eq!(out, SpaceOutcome { needlog: true, needscan: false });
        assert_eq!(table(&buf), vec![(48, 4048), (16, 16), (0, 0)]);

        let out = make_free(&mut tp, OPS, &mut buf, 32, 16).unwrap();
        assert_eq!(out, SpaceOutcome { needlog: true, needscan: false });
        assert_eq!(table(&buf), vec![(16, 4080), (0, 0), (0, 0)]);
        assert_eq!(unused_length(buf.data(), 16), Ok(4080));
        assert_eq!(unused_tag(buf.data(), 16), Ok(16));
        tp.abort();
    }

    #[test]
    fn merge_both_with_full_table_needs_scan() {
        let journal = Journal::new(1);
        let mut tp = journal.begin();
        let mut buf = fresh();
        // a b c d e f, then free b and d to get three regions
        let mut off = 16;
        for name in [b"a", b"b", b"c", b"d", b"e"] {
            insert(&mut tp, &mut buf, off, name);
            off += 16;
        }
        make_free(&mut tp, OPS, &mut buf, 32, 16).unwrap();
        make_free(&mut tp, OPS, &mut buf, 64, 16).unwrap();
        assert_eq!(table(&buf), vec![(96, 4000), (32, 16), (64, 16)]);

        // freeing c joins b and d; slot 2 was in use
        let out = make_free(&mut tp, OPS, &mut buf, 48, 16).unwrap();
        assert!(out.needscan);
        crate::bestfree::freescan(&mut tp, OPS, &mut buf).unwrap();
        assert_eq!(table(&buf), vec![(96, 4000), (32, 48), (0, 0)]);
        tp.abort();
    }

    #[test]
    fn middle_split_into_equal_halves() {
        let journal = Journal::new(1);
        let mut tp = journal.begin();
        let mut buf = fresh();
        insert(&mut tp, &mut buf, 16, b"a");
        // region at 32..4096 (4064); punch 16 bytes so both halves are 2024
        let out = use_free(&mut tp, OPS, &mut buf, 32, 32 + 2024, 16).unwrap();
        assert_eq!(out, SpaceOutcome { needlog: true, needscan: false });
        assert_eq!(table(&buf), vec![(32, 2024), (2072, 2024), (0, 0)]);
        assert_eq!(unused_tag(buf.data(), 32), Ok(32));
        assert_eq!(unused_tag(buf.data(), 2072), Ok(2072));
        tp.abort();
    }

    #[test]
    fn back_trim_keeps_region_start() {
        let journal = Journal::new(1);
        let mut tp = journal.begin();
        let mut buf = fresh();
        let out = use_free(&mut tp, OPS, &mut buf, 16, 4096 - 16, 16).unwrap();
        assert_eq!(out, SpaceOutcome { needlog: true, needscan: false });
        assert_eq!(table(&buf), vec![(16, 4064), (0, 0), (0, 0)]);
        tp.abort();
    }

    #[test]
    fn use_free_rejects_bad_ranges_without_touching_block() {
        let journal = Journal::new(1);
        let mut tp = journal.begin();
        let mut buf = fresh();
        let before = buf.data().to_vec();
        // starts before the region
        assert!(use_free(&mut tp, OPS, &mut buf, 16, 8, 16).unwrap_err().is_corruption());
        // runs past it
        assert!(use_free(&mut tp, OPS, &mut buf, 16, 4088, 16).unwrap_err().is_corruption());
        // not a free region
        insert(&mut tp, &mut buf, 16, b"a");
        let before_entry = buf.data().to_vec();
        let err = use_free(&mut tp, OPS, &mut buf, 16, 16, 16).unwrap_err();
        assert!(matches!(err, DirError::Corrupted { offset: 16, .. }));
        assert_eq!(buf.data(), &before_entry[..]);
        assert_ne!(before, before_entry);
        tp.abort();
    }

    #[test]
    fn use_free_rejects_mismatched_tag() {
        let journal = Journal::new(1);
        let mut tp = journal.begin();
        let mut buf = fresh();
        buf.data_mut()[4095] ^= 1;
        let before = buf.data().to_vec();
        // front trim, back trim, middle split
        for (offset, len) in [(16, 16), (4096 - 16, 16), (64, 16)] {
            let err = use_free(&mut tp, OPS, &mut buf, 16, offset, len).unwrap_err();
            assert!(err.is_corruption());
            assert_eq!(buf.data(), &before[..]);
        }
        tp.abort();
    }

    #[test]
    fn make_free_rejects_range_outside_data_area() {
        let journal = Journal::new(1);
        let mut tp = journal.begin();
        let mut buf = fresh();
        assert!(make_free(&mut tp, OPS, &mut buf, 8, 16).is_err());
        assert!(make_free(&mut tp, OPS, &mut buf, 4088, 16).is_err());
        assert!(make_free(&mut tp, OPS, &mut buf, 16, 12).is_err());
        tp.abort();
    }

    #[test]
    fn check_new_free_rules() {
        let bf = [BestFree::new(32, 64), BestFree::EMPTY, BestFree::EMPTY];
        assert!(check_new_free(&bf, Some(0), BestFree::new(32, 64)).is_ok());
        assert!(check_new_free(&bf, None, BestFree::new(32, 64)).is_err());
        assert!(check_new_free(&bf, Some(0), BestFree::new(32, 56)).is_err());
        assert!(check_new_free(&bf, Some(0), BestFree::new(40, 64)).is_err());
    }
}
