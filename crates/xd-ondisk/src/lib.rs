#![forbid(unsafe_code)]
//! On-disk format for directory blocks.
//!
//! Pure layout crate: no I/O, no logging, no side effects. It knows where
//! every field of a directory data block lives for each format variant, how
//! the per-mount geometry converts between address spaces, how names hash,
//! and how v3 blocks are checksummed. Everything above it (the data-block
//! engine, the verifier, the directory operations) goes through the
//! [`DirOps`] dispatch table and never hard-codes a header size.

pub mod crc;
pub mod dispatch;
pub mod geometry;
pub mod hash;
pub mod layout;

pub use crc::{dir3_block_crc, update_cksum, verify_cksum};
pub use dispatch::{
    DirFeatures, DirOps, FreeHdr, LeafHdr, NodeHdr, NodeOps, ShortformHdr,
};
pub use geometry::DirGeometry;
pub use hash::{NameCmp, NameOps, ascii_ci_hashname, da_hashname};
pub use layout::{
    BestFree, BestFreeTable, BlockTail, DataMagic, Dir3BlkHdr, FileType, LeafEntry,
};
