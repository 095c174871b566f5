//! The best-free table.
//!
//! Three `(offset, length)` slots in the data header naming the largest
//! unused regions of the block, sorted by non-increasing length, empty
//! slots `(0, 0)` last. A region missing from a table with all three slots
//! full is no longer than the third slot. Duplicate lengths make the
//! tracked set ambiguous, so a region of the same length as slot 2 may be
//! untracked; lookups treat that as "not present".

use crate::entry::{Record, RecordWalk};
use crate::log::log_header;
use crate::{CorruptAt, Result};
use xd_block::Buf;
use xd_journal::Transaction;
use xd_ondisk::layout::{DATA_FD_COUNT, read_bestfree, write_bestfree};
use xd_ondisk::{BestFree, BestFreeTable, DirOps};
use xd_types::{ParseError, usize_to_u16};

/// Index of the smallest slot.
pub const LAST_SLOT: usize = DATA_FD_COUNT - 1;

/// Table entry describing the unused region at `off` of `len` bytes.
pub fn region(off: usize, len: usize) -> Result<BestFree, ParseError> {
    Ok(BestFree::new(
        usize_to_u16(off, "bestfree.offset")?,
        usize_to_u16(len, "bestfree.length")?,
    ))
}

/// Read the table out of a data block header.
pub fn load(ops: DirOps, buf: &Buf) -> Result<BestFreeTable> {
    let at = ops.data_bestfree_offset();
    read_bestfree(buf.data(), at).at(buf.daddr().0, at)
}

/// Write the table back. The caller logs the header.
pub fn store(ops: DirOps, buf: &mut Buf, bf: &BestFreeTable) -> Result<()> {
    let (at, daddr) = (ops.data_bestfree_offset(), buf.daddr().0);
    write_bestfree(buf.data_mut(), at, bf).at(daddr, at)
}

/// Slot tracking `dup`, if any.
///
/// A region shorter than the last slot cannot be tracked. Otherwise the
/// slots are searched by offset, stopping at the first empty one.
#[must_use]
pub fn freefind(bf: &BestFreeTable, dup: BestFree) -> Option<usize> {
    if dup.length < bf[LAST_SLOT].length {
        return None;
    }
    for (i, slot) in bf.iter().enumerate() {
        if slot.offset == 0 {
            return None;
        }
        if slot.offset == dup.offset {
            return Some(i);
        }
    }
    // only reachable with duplicate lengths
    None
}

/// Insert `dup` if it is strictly longer than some slot, shifting shorter
/// slots down. Returns the slot it landed in.
pub fn freeinsert(bf: &mut BestFreeTable, dup: BestFree) -> Option<usize> {
    let slot = bf.iter().position(|slot| dup.length > slot.length)?;
    bf.copy_within(slot..LAST_SLOT, slot + 1);
    bf[slot] = dup;
    Some(slot)
}

/// Remove `slot`, shifting later slots up and emptying the last.
pub fn freeremove(bf: &mut BestFreeTable, slot: usize) {
    if slot < LAST_SLOT {
        bf.copy_within(slot + 1.., slot);
    }
    bf[LAST_SLOT] = BestFree::EMPTY;
}

/// Check the table against the unused region `dup` and find its slot.
///
/// Every non-empty slot must be ordered, precede all empty slots, not
/// overlap `dup` unless it is `dup` (same length), and be no shorter than
/// an untracked `dup`. On failure returns the name of the broken rule.
pub fn freefind_verify(bf: &BestFreeTable, dup: BestFree) -> Result<Option<usize>, &'static str> {
    let off = u32::from(dup.offset);
    let len = u32::from(dup.length);
    let mut matched = false;
    let mut seenzero = false;

    for (i, slot) in bf.iter().enumerate() {
        if slot.offset == 0 {
            if slot.length != 0 {
                return Err("bestfree slot with zero offset has a length");
            }
            seenzero = true;
            continue;
        }
        if seenzero {
            return Err("bestfree slot follows an empty slot");
        }
        let (slot_off, slot_len) = (u32::from(slot.offset), u32::from(slot.length));
        if slot_off == off {
            matched = true;
            if slot_len != len {
                return Err("bestfree slot length differs from its region");
            }
        } else if slot_off > off {
            if off + len > slot_off {
                return Err("unused region overlaps a later bestfree slot");
            }
        } else if slot_off + slot_len > off {
            return Err("earlier bestfree slot overlaps an unused region");
        }
        if !matched && slot_len < len {
            return Err("untracked unused region longer than a bestfree slot");
        }
        if i > 0 && bf[i - 1].length < slot.length {
            return Err("bestfree slots out of order");
        }
    }
    Ok(freefind(bf, dup))
}

/// Rebuild the table from the records of `block`.
pub fn scan_bestfree(ops: DirOps, daddr: u64, block: &[u8]) -> Result<BestFreeTable> {
    let mut bf = [BestFree::EMPTY; DATA_FD_COUNT];
    for record in RecordWalk::new(ops, daddr, block)? {
        if let Record::Unused { offset, length } = record? {
            let dup = region(offset, length).at(daddr, offset)?;
            let _ = freeinsert(&mut bf, dup);
        }
    }
    Ok(bf)
}

/// Rebuild the table of `buf` in place and log the header.
pub fn freescan(tp: &mut Transaction<'_>, ops: DirOps, buf: &mut Buf) -> Result<()> {
    let bf = scan_bestfree(ops, buf.daddr().0, buf.data())?;
    store(ops, buf, &bf)?;
    log_header(tp, ops, buf);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bf(slots: [(u16, u16); 3]) -> BestFreeTable {
        slots.map(|(offset, length)| BestFree::new(offset, length))
    }

    #[test]
    fn insert_orders_by_length() {
        let mut table = bf([(0, 0); 3]);
        assert_eq!(freeinsert(&mut table, BestFree::new(100, 32)), Some(0));
        assert_eq!(freeinsert(&mut table, BestFree::new(200, 64)), Some(0));
        assert_eq!(freeinsert(&mut table, BestFree::new(300, 48)), Some(1));
        assert_eq!(table, bf([(200, 64), (300, 48), (100, 32)]));
        // not strictly longer than the last slot
        assert_eq!(freeinsert(&mut table, BestFree::new(400, 32)), None);
        assert_eq!(freeinsert(&mut table, BestFree::new(400, 40)), Some(2));
        assert_eq!(table, bf([(200, 64), (300, 48), (400, 40)]));
    }

    #[test]
    fn remove_shifts_up() {
        let mut table = bf([(200, 64), (300, 48), (100, 32)]);
        freeremove(&mut table, 0);
        assert_eq!(table, bf([(300, 48), (100, 32), (0, 0)]));
        freeremove(&mut table, 1);
        assert_eq!(table, bf([(300, 48), (0, 0), (0, 0)]));
        freeremove(&mut table, 2);
        assert_eq!(table, bf([(300, 48), (0, 0), (0, 0)]));
    }

    #[test]
    fn find_by_offset_and_length() {
        let table = bf([(200, 64), (300, 48), (100, 32)]);
        assert_eq!(freefind(&table, BestFree::new(300, 48)), Some(1));
        // shorter than the last slot: cannot be tracked
        assert_eq!(freefind(&table, BestFree::new(500, 16)), None);
        // same length as the last slot but a different region
        assert_eq!(freefind(&table, BestFree::new(500, 32)), None);

        let sparse = bf([(200, 64), (0, 0), (0, 0)]);
        assert_eq!(freefind(&sparse, BestFree::new(300, 8)), None);
        assert_eq!(freefind(&sparse, BestFree::new(200, 64)), Some(0));
    }

    #[test]
    fn verify_accepts_consistent_table() {
        let table = bf([(200, 64), (300, 48), (0, 0)]);
        assert_eq!(freefind_verify(&table, BestFree::new(300, 48)), Ok(Some(1)));
        assert_eq!(freefind_verify(&table, BestFree::new(16, 8)), Ok(None));
    }

    #[test]
    fn verify_rejects_broken_tables() {
        let dup = BestFree::new(300, 48);
        assert!(freefind_verify(&bf([(0, 8), (0, 0), (0, 0)]), dup).is_err());
        assert!(freefind_verify(&bf([(0, 0), (300, 48), (0, 0)]), dup).is_err());
        assert!(freefind_verify(&bf([(300, 40), (0, 0), (0, 0)]), dup).is_err());
        // later slot overlapped by dup
        assert!(freefind_verify(&bf([(320, 64), (300, 48), (0, 0)]), dup).is_err());
        // earlier slot running into dup
        assert!(freefind_verify(&bf([(280, 64), (300, 48), (0, 0)]), dup).is_err());
        // untracked dup longer than a slot
        assert!(freefind_verify(&bf([(100, 32), (0, 0), (0, 0)]), dup).is_err());
        // out of order
        assert!(freefind_verify(&bf([(300, 48), (100, 64), (0, 0)]), dup).is_err());
    }
}
