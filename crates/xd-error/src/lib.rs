#![forbid(unsafe_code)]
//! Error types for the xd directory engine.
//!
//! # Error Taxonomy
//!
//! Two layers, same as the rest of the workspace:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `xd-types` | Byte-level range and field violations |
//! | Runtime | `DirError` | `xd-error` (this crate) | Errors surfaced at directory-operation entry points |
//!
//! `xd-error` does not depend on `xd-types`. The `ParseError → DirError`
//! conversion lives in `xd-core`; inside the engine, `xd-dir` turns a failed
//! in-block access into `Corrupted` with the offending byte offset because a
//! block that passed the verifier never produces one.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one errno via [`DirError::to_errno`]. The
//! match is exhaustive so a new variant cannot ship without an errno.
//!
//! | Variant | errno | Meaning |
//! |---------|-------|---------|
//! | `Io` | raw os error, else `EIO` | device failure during buffer I/O |
//! | `Corrupted` | `EUCLEAN` | structural invariant violated (EFSCORRUPTED) |
//! | `BadCrc` | `EBADMSG` | CRC mismatch on read (EFSBADCRC) |
//! | `NoSpace` | `ENOSPC` | extent allocator refused growth |
//! | `NoMem` | `ENOMEM` | working buffer could not be allocated |
//! | `Shutdown` | `EIO` | filesystem was forced down after a write-verify failure |
//! | `ReadOnly` | `EROFS` | mutation attempted on a read-only mount |
//! | `NotFound` | `ENOENT` | name not present |
//! | `Exists` | `EEXIST` | name already present |
//! | `NameTooLong` | `ENAMETOOLONG` | name length ≥ `MAXNAMELEN` |
//! | `InvalidName` | `EINVAL` | name contains `/` or NUL, or is empty |
//! | `Format` | `EINVAL` | wrong magic / unsupported layout |
//! | `Parse` | `EINVAL` | parse failure outside a live block |
//! | `InvalidGeometry` | `EINVAL` | mount geometry out of range |
//!
//! The engine never retries. Errors flow to the directory-operation entry
//! points which abort the transaction, or for corruption raised from a
//! write-verify path, shut the filesystem down.

use thiserror::Error;

/// Linux spells EFSCORRUPTED as EUCLEAN.
pub const EFSCORRUPTED: libc::c_int = libc::EUCLEAN;
/// Linux spells EFSBADCRC as EBADMSG.
pub const EFSBADCRC: libc::c_int = libc::EBADMSG;

/// Unified error type for directory operations.
#[derive(Debug, Error)]
pub enum DirError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A structural invariant of a directory block does not hold.
    ///
    /// `offset` is the byte offset inside the block at which the first
    /// failing check was made; `detail` names the check.
    #[error("corrupt directory block {block} at offset {offset}: {detail}")]
    Corrupted {
        block: u64,
        offset: usize,
        detail: String,
    },

    /// The stored CRC32c of a v3 block does not match its contents.
    #[error("bad CRC on directory block {block}")]
    BadCrc { block: u64 },

    #[error("no space left on device")]
    NoSpace,

    #[error("out of memory")]
    NoMem,

    /// The mount was shut down; no further modifications are accepted.
    #[error("filesystem shut down: {0}")]
    Shutdown(String),

    #[error("read-only filesystem")]
    ReadOnly,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("file exists")]
    Exists,

    #[error("name too long")]
    NameTooLong,

    /// Empty name, or a name containing `/` or NUL.
    #[error("invalid name")]
    InvalidName,

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
}

impl DirError {
    /// Shorthand for building a [`DirError::Corrupted`].
    #[must_use]
    pub fn corrupted(block: u64, offset: usize, detail: impl Into<String>) -> Self {
        Self::Corrupted {
            block,
            offset,
            detail: detail.into(),
        }
    }

    /// Convert this error into a positive errno.
    ///
    /// Callers negate it when handing it back through a kernel-style
    /// interface.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corrupted { .. } => EFSCORRUPTED,
            Self::BadCrc { .. } => EFSBADCRC,
            Self::NoSpace => libc::ENOSPC,
            Self::NoMem => libc::ENOMEM,
            Self::Shutdown(_) => libc::EIO,
            Self::ReadOnly => libc::EROFS,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::InvalidName | Self::Format(_) | Self::Parse(_) | Self::InvalidGeometry(_) => {
                libc::EINVAL
            }
        }
    }

    /// True for errors that indicate on-disk or in-memory damage rather than
    /// a caller mistake or resource exhaustion.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupted { .. } | Self::BadCrc { .. })
    }
}

/// Result alias using `DirError` unless another error type is named.
pub type Result<T, E = DirError> = std::result::Result<T, E>;
