#![forbid(unsafe_code)]
//! Mount wiring and directory operations.
//!
//! A [`DirMount`] owns the per-mount directory context (geometry, dispatch
//! table, name semantics, journal), the buffer cache and the block
//! allocator. A [`DirHandle`] is one directory stored as data-format
//! blocks; its operations run the data-block engine inside a transaction
//! and shut the mount down when they find structural corruption.

pub mod config;
pub mod dir;
pub mod mount;

pub use config::MountConfig;
pub use dir::{DirEntry, DirHandle, Lookup, mode_to_ftype, namecheck};
pub use mount::DirMount;

use xd_error::DirError;
use xd_types::ParseError;

/// Map a parse failure at the crate boundary.
///
/// Running out of bytes or overflowing a field means the structure on disk
/// is damaged; a wrong magic or an out-of-range field means the caller
/// pointed us at something that is not a directory block.
#[must_use]
pub fn parse_to_dir_error(e: &ParseError) -> DirError {
    match e {
        ParseError::InsufficientData { .. } | ParseError::IntegerConversion { .. } => {
            DirError::corrupted(0, 0, e.to_string())
        }
        ParseError::InvalidMagic { .. } | ParseError::InvalidField { .. } => {
            DirError::Format(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_map_by_kind() {
        let short = ParseError::InsufficientData {
            needed: 8,
            offset: 4090,
            actual: 6,
        };
        assert!(parse_to_dir_error(&short).is_corruption());
        assert!(parse_to_dir_error(&ParseError::IntegerConversion { field: "tag" }).is_corruption());

        let magic = ParseError::InvalidMagic {
            expected: 0x5844_3244,
            actual: 0,
        };
        assert!(matches!(parse_to_dir_error(&magic), DirError::Format(_)));
        let field = ParseError::InvalidField {
            field: "namelen",
            reason: "must be in 1..=255",
        };
        let err = parse_to_dir_error(&field);
        assert!(matches!(err, DirError::Format(_)));
        assert_eq!(err.to_errno(), DirError::InvalidName.to_errno());
    }
}
