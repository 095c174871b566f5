//! Data-format directories.
//!
//! A directory here is a run of data blocks with no hash index: lookups
//! walk every block, inserts take the first block whose best-free table
//! shows room and grow the directory otherwise, and removals give the
//! space back (retiring the last block once it is empty).

use crate::mount::DirMount;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};
use xd_alloc::{DirInode, grow_inode, shrink_inode};
use xd_block::{Buf, BufRef};
use xd_dir::bestfree::load;
use xd_dir::entry::{set_entry_target, write_entry};
use xd_dir::{
    DaArgs, DirContext, Record, RecordWalk, SpaceOutcome, data_init, data_read, data_readahead,
    freescan, log_entry, log_header, make_free, read_verified, use_free,
};
use xd_error::{DirError, Result};
use xd_journal::Transaction;
use xd_ondisk::layout::{DATA_SPACE, MAXNAMELEN};
use xd_ondisk::{DirGeometry, DirOps, FileType, NameCmp};
use xd_types::{DaBlock, DirBlock, InodeNumber};

/// Result of a successful lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lookup {
    pub ino: u64,
    pub ftype: FileType,
    /// `Case` when only a case-insensitive match was found.
    pub cmp: NameCmp,
}

/// One active entry, as listed by [`DirHandle::entries`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub ino: u64,
    pub ftype: FileType,
}

/// Reject names no directory entry may hold.
pub fn namecheck(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(DirError::InvalidName);
    }
    if name.len() >= MAXNAMELEN {
        return Err(DirError::NameTooLong);
    }
    if name.iter().any(|&b| b == b'/' || b == 0) {
        return Err(DirError::InvalidName);
    }
    Ok(())
}

/// Directory entry file type for an inode mode.
#[must_use]
pub fn mode_to_ftype(mode: u32) -> FileType {
    FileType::from_mode(mode)
}

fn is_dot_name(name: &[u8]) -> bool {
    name == b"." || name == b".."
}

/// An open directory. Mutators hold the inode lock exclusively for the
/// whole transaction; lookups share it.
pub struct DirHandle {
    mount: Arc<DirMount>,
    inode: RwLock<DirInode>,
    ops_override: Option<DirOps>,
}

impl std::fmt::Debug for DirHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirHandle")
            .field("inode", &*self.inode.read())
            .field("ops_override", &self.ops_override)
            .finish_non_exhaustive()
    }
}

impl DirHandle {
    pub(crate) fn new(mount: Arc<DirMount>, dp: DirInode, ops_override: Option<DirOps>) -> Self {
        Self {
            mount,
            inode: RwLock::new(dp),
            ops_override,
        }
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.inode.read().ino
    }

    /// Snapshot of the directory inode (size and block map).
    #[must_use]
    pub fn inode(&self) -> DirInode {
        self.inode.read().clone()
    }

    /// Dispatch table this directory is read and written with.
    #[must_use]
    pub fn ops(&self) -> DirOps {
        self.mount.ctx().ops_for(self.ops_override)
    }

    #[must_use]
    pub fn mount(&self) -> &Arc<DirMount> {
        &self.mount
    }

    /// Run `f` in a fresh transaction under the exclusive inode lock.
    ///
    /// Success commits. Failure aborts, puts the inode back as it was and
    /// returns any blocks the operation allocated.
    pub(crate) fn mutate<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut DaArgs<'_, '_>) -> Result<T>,
    ) -> Result<T> {
        self.mount.check_live()?;
        let ctx = self.mount.ctx();
        let mut dp = self.inode.write();
        let saved = dp.clone();
        let mut tp = ctx.journal.begin();
        let result = {
            let mut args = DaArgs {
                ctx,
                cache: self.mount.cache(),
                alloc: self.mount.alloc(),
                tp: &mut tp,
                dp: &mut *dp,
                ops: self.ops(),
                ops_override: self.ops_override,
            };
            f(&mut args)
        };
        match result {
            Ok(value) => {
                tp.commit(self.mount.cache())
                    .map_err(|err| self.mount.fail(op, err))?;
                Ok(value)
            }
            Err(err) => {
                tp.abort();
                self.release_new_blocks(&saved, &dp);
                *dp = saved;
                Err(self.mount.fail(op, err))
            }
        }
    }

    fn release_new_blocks(&self, saved: &DirInode, dp: &DirInode) {
        for ext in dp.fork.extents() {
            if saved.fork.extents().any(|old| old == ext) {
                continue;
            }
            if let Err(err) = self.mount.alloc().free_extent(ext.start, ext.len) {
                debug!(start = ext.start.0, len = ext.len, error = %err, "could not release block");
            }
        }
    }

    /// Add `name → ino`.
    ///
    /// `ino == 0` only asks whether the name would fit. With `may_grow`
    /// false the directory must already have room; otherwise `NoSpace`.
    pub fn create_name(&self, name: &[u8], ino: u64, ftype: FileType, may_grow: bool) -> Result<()> {
        namecheck(name)?;
        if is_dot_name(name) {
            return Err(DirError::Exists);
        }
        if ino != 0 {
            self.mount.ctx().ino_validate(ino)?;
        }
        self.mutate("create_name", |args| addname(args, name, ino, ftype, may_grow))
    }

    pub fn lookup(&self, name: &[u8]) -> Result<Lookup> {
        namecheck(name)?;
        self.mount.check_live()?;
        let ctx = self.mount.ctx();
        let dp = self.inode.read();
        let ops = self.ops();
        let cache = self.mount.cache();
        let dbs = data_blocks(&ctx.geo, &dp);
        let found = search(ctx, ops, &dbs, name, |da| {
            let bufref = read_verified(ctx, cache, &dp, self.ops_override, da)?;
            let next = dbs.iter().map(|db| ctx.geo.db_to_da(*db)).find(|next| next.0 > da.0);
            if let Some(next) = next {
                // Failures resurface on the real read of `next`.
                if let Err(err) = data_readahead(ctx, cache, &dp, next) {
                    debug!(block = next.0, error = %err, "readahead failed");
                }
            }
            Ok(bufref)
        })
        .map_err(|err| self.mount.fail("lookup", err))?;
        found
            .map(|found| found.lookup)
            .ok_or_else(|| DirError::NotFound(String::from_utf8_lossy(name).into_owned()))
    }

    /// Remove `name` and return the inode it pointed at.
    pub fn remove_name(&self, name: &[u8]) -> Result<u64> {
        namecheck(name)?;
        if is_dot_name(name) {
            return Err(DirError::InvalidName);
        }
        self.mutate("remove_name", |args| removename(args, name))
    }

    /// Point `name` at `ino` and return the inode it pointed at before.
    pub fn replace(&self, name: &[u8], ino: u64, ftype: FileType) -> Result<u64> {
        namecheck(name)?;
        self.mount.ctx().ino_validate(ino)?;
        self.mutate("replace", |args| replacename(args, name, ino, ftype))
    }

    /// True when only `.` and `..` remain.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.entries()?.iter().all(|entry| is_dot_name(&entry.name)))
    }

    /// Every active entry, in block then offset order.
    pub fn entries(&self) -> Result<Vec<DirEntry>> {
        self.mount.check_live()?;
        let ctx = self.mount.ctx();
        let dp = self.inode.read();
        let ops = self.ops();
        let mut out = Vec::new();
        for db in data_blocks(&ctx.geo, &dp) {
            let bufref = read_verified(ctx, self.mount.cache(), &dp, self.ops_override, ctx.geo.db_to_da(db))
                .map_err(|err| self.mount.fail("entries", err))?;
            let buf = bufref.lock();
            for record in RecordWalk::new(ops, buf.daddr().0, buf.data())? {
                if let Record::Entry { ino, name, ftype, .. } = record? {
                    out.push(DirEntry {
                        name: name.to_vec(),
                        ino,
                        ftype,
                    });
                }
            }
        }
        Ok(out)
    }
}

// ── Operations inside a transaction ─────────────────────────────────────────

/// First data block, holding `.` and `..`.
pub(crate) fn init_dir(args: &mut DaArgs<'_, '_>, parent: u64) -> Result<()> {
    let db = grow_inode(&args.ctx.geo, args.alloc, args.dp, DATA_SPACE)?;
    let bufref = data_init(args, db)?;
    let me = args.dp.ino.0;
    for (name, ino) in [(&b"."[..], me), (&b".."[..], parent)] {
        let size = args.ops.data_entsize(name.len());
        let (daddr, room) = {
            let buf = bufref.lock();
            (buf.daddr().0, pick_region(args.ops, &buf, size)?)
        };
        let off = room.ok_or_else(|| DirError::corrupted(daddr, 0, "no room for dot entries"))?;
        insert_entry(args.tp, args.ops, &bufref, off, name, ino, FileType::Dir)?;
    }
    Ok(())
}

fn addname(
    args: &mut DaArgs<'_, '_>,
    name: &[u8],
    ino: u64,
    ftype: FileType,
    may_grow: bool,
) -> Result<()> {
    let ops = args.ops;
    let geo = args.ctx.geo;
    let just_check = ino == 0;
    let size = ops.data_entsize(name.len());

    let mut target: Option<(BufRef, usize)> = None;
    for db in data_blocks(&geo, args.dp) {
        let bufref = data_read(args, geo.db_to_da(db))?;
        let (hit, room) = {
            let buf = bufref.lock();
            let hit = !just_check && find_in_block(args.ctx, ops, &buf, name)?.is_some();
            let room = if target.is_none() { pick_region(ops, &buf, size)? } else { None };
            (hit, room)
        };
        if hit {
            return Err(DirError::Exists);
        }
        if let Some(off) = room {
            target = Some((bufref, off));
        }
    }

    let (bufref, off) = match target {
        Some(found) => found,
        None if !may_grow => return Err(DirError::NoSpace),
        None if just_check => return Ok(()),
        None => {
            let db = grow_inode(&geo, args.alloc, args.dp, DATA_SPACE)?;
            let bufref = data_init(args, db)?;
            (bufref, ops.data_entry_offset())
        }
    };
    if just_check {
        return Ok(());
    }
    insert_entry(args.tp, ops, &bufref, off, name, ino, ftype)
}

fn removename(args: &mut DaArgs<'_, '_>, name: &[u8]) -> Result<u64> {
    let ops = args.ops;
    let geo = args.ctx.geo;
    let Some(found) = search_locked(args, name)? else {
        return Err(DirError::NotFound(String::from_utf8_lossy(name).into_owned()));
    };

    let mut buf = found.bufref.lock();
    let out = make_free(args.tp, ops, &mut buf, found.offset, ops.data_entsize(found.namelen))?;
    settle(args.tp, ops, &mut buf, out)?;
    debug!(ino = args.dp.ino.0, db = found.db.0, offset = found.offset, "entry removed");

    let deo = ops.data_entry_offset();
    let bf = load(ops, &buf)?;
    let empty = usize::from(bf[0].offset) == deo && usize::from(bf[0].length) == geo.blksize_usize() - deo;
    let last = args.dp.size == geo.db_off_to_byte(DirBlock(found.db.0 + 1), 0);
    if empty && last {
        shrink_inode(&geo, args.alloc, args.tp, args.dp, found.db, &mut buf)?;
    }
    Ok(found.lookup.ino)
}

fn replacename(args: &mut DaArgs<'_, '_>, name: &[u8], ino: u64, ftype: FileType) -> Result<u64> {
    let ops = args.ops;
    let Some(found) = search_locked(args, name)? else {
        return Err(DirError::NotFound(String::from_utf8_lossy(name).into_owned()));
    };
    let mut buf = found.bufref.lock();
    let daddr = buf.daddr().0;
    set_entry_target(ops, buf.data_mut(), found.offset, ino, ftype)
        .map_err(|err| DirError::corrupted(daddr, found.offset, err.to_string()))?;
    log_entry(args.tp, ops, &mut buf, found.offset);
    Ok(found.lookup.ino)
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Mapped data blocks below the directory size.
fn data_blocks(geo: &DirGeometry, dp: &DirInode) -> Vec<DirBlock> {
    (0..geo.byte_to_db(dp.size).0)
        .map(DirBlock)
        .filter(|db| dp.fork.map_range(geo.db_to_da(*db).0, geo.fsbcount).is_some())
        .collect()
}

/// Carve `name` out of the unused region at `off` and log it.
fn insert_entry(
    tp: &mut Transaction<'_>,
    ops: DirOps,
    bufref: &BufRef,
    off: usize,
    name: &[u8],
    ino: u64,
    ftype: FileType,
) -> Result<()> {
    let mut buf = bufref.lock();
    let daddr = buf.daddr().0;
    let size = ops.data_entsize(name.len());
    let out = use_free(tp, ops, &mut buf, off, off, size)?;
    write_entry(ops, buf.data_mut(), off, ino, name, ftype)
        .map_err(|err| DirError::corrupted(daddr, off, err.to_string()))?;
    log_entry(tp, ops, &mut buf, off);
    settle(tp, ops, &mut buf, out)?;
    debug!(block = daddr, offset = off, ino, namelen = name.len(), "entry added");
    Ok(())
}

/// Honour what the space engine asked for.
fn settle(tp: &mut Transaction<'_>, ops: DirOps, buf: &mut Buf, out: SpaceOutcome) -> Result<()> {
    if out.needscan {
        freescan(tp, ops, buf)?;
    } else if out.needlog {
        log_header(tp, ops, buf);
    }
    Ok(())
}

/// Offset of an unused region that can take a `size`-byte entry at its
/// front without leaving a sliver smaller than the smallest entry.
fn pick_region(ops: DirOps, buf: &Buf, size: usize) -> Result<Option<usize>> {
    let bf = load(ops, buf)?;
    if usize::from(bf[0].length) < size {
        return Ok(None);
    }
    let min = ops.data_entsize(1);
    let fits = |len: usize| len == size || len >= size + min;
    if let Some(slot) = bf.iter().find(|slot| slot.offset != 0 && fits(usize::from(slot.length))) {
        return Ok(Some(usize::from(slot.offset)));
    }
    for record in RecordWalk::new(ops, buf.daddr().0, buf.data())? {
        if let Record::Unused { offset, length } = record? {
            if fits(length) {
                return Ok(Some(offset));
            }
        }
    }
    Ok(None)
}

struct Found {
    db: DirBlock,
    bufref: BufRef,
    offset: usize,
    namelen: usize,
    lookup: Lookup,
}

/// Match `name` against the entries of one block. An exact match wins over
/// a case-insensitive one.
fn find_in_block(
    ctx: &DirContext,
    ops: DirOps,
    buf: &Buf,
    name: &[u8],
) -> Result<Option<(usize, usize, Lookup)>> {
    let mut best = None;
    for record in RecordWalk::new(ops, buf.daddr().0, buf.data())? {
        let Record::Entry {
            offset,
            ino,
            name: stored,
            ftype,
            ..
        } = record?
        else {
            continue;
        };
        let cmp = ctx.name_ops.compname(stored, name);
        trace!(block = buf.daddr().0, offset, ?cmp, "compare");
        let lookup = Lookup { ino, ftype, cmp };
        match cmp {
            NameCmp::Exact => return Ok(Some((offset, stored.len(), lookup))),
            NameCmp::Case if best.is_none() => best = Some((offset, stored.len(), lookup)),
            NameCmp::Case | NameCmp::Different => {}
        }
    }
    Ok(best)
}

fn search<F>(ctx: &DirContext, ops: DirOps, dbs: &[DirBlock], name: &[u8], mut read: F) -> Result<Option<Found>>
where
    F: FnMut(DaBlock) -> Result<BufRef>,
{
    let mut best: Option<Found> = None;
    for &db in dbs {
        let bufref = read(ctx.geo.db_to_da(db))?;
        let hit = find_in_block(ctx, ops, &bufref.lock(), name)?;
        let Some((offset, namelen, lookup)) = hit else {
            continue;
        };
        let found = Found {
            db,
            bufref,
            offset,
            namelen,
            lookup,
        };
        if lookup.cmp == NameCmp::Exact {
            return Ok(Some(found));
        }
        if best.is_none() {
            best = Some(found);
        }
    }
    Ok(best)
}

fn search_locked(args: &mut DaArgs<'_, '_>, name: &[u8]) -> Result<Option<Found>> {
    let ctx = Arc::clone(args.ctx);
    let ops = args.ops;
    let dbs = data_blocks(&ctx.geo, args.dp);
    search(&ctx, ops, &dbs, name, |da| data_read(args, da))
}
