//! Name hashing and comparison.
//!
//! The leaf arrays of block and leaf/node directories are ordered by
//! [`da_hashname`]; case-insensitive mounts hash with
//! [`ascii_ci_hashname`] instead so that names differing only in ASCII
//! case land on the same hash.

use serde::{Deserialize, Serialize};

/// Result of comparing a stored name with a lookup name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameCmp {
    Different,
    Exact,
    /// Equal only after ASCII case folding.
    Case,
}

/// Mount-wide name semantics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NameOps {
    #[default]
    Default,
    AsciiCi,
}

impl NameOps {
    #[must_use]
    pub fn for_mount(ascii_ci: bool) -> Self {
        if ascii_ci { Self::AsciiCi } else { Self::Default }
    }

    #[must_use]
    pub fn hashname(self, name: &[u8]) -> u32 {
        match self {
            Self::Default => da_hashname(name),
            Self::AsciiCi => ascii_ci_hashname(name),
        }
    }

    #[must_use]
    pub fn compname(self, stored: &[u8], wanted: &[u8]) -> NameCmp {
        if stored.len() != wanted.len() {
            return NameCmp::Different;
        }
        if stored == wanted {
            return NameCmp::Exact;
        }
        match self {
            Self::Default => NameCmp::Different,
            Self::AsciiCi if stored.eq_ignore_ascii_case(wanted) => NameCmp::Case,
            Self::AsciiCi => NameCmp::Different,
        }
    }
}

/// Rotating hash over four bytes at a time.
#[must_use]
pub fn da_hashname(name: &[u8]) -> u32 {
    let mut hash = 0_u32;
    let mut chunks = name.chunks_exact(4);
    for c in &mut chunks {
        hash = (u32::from(c[0]) << 21)
            ^ (u32::from(c[1]) << 14)
            ^ (u32::from(c[2]) << 7)
            ^ u32::from(c[3])
            ^ hash.rotate_left(28);
    }
    match *chunks.remainder() {
        [a, b, c] => {
            (u32::from(a) << 14) ^ (u32::from(b) << 7) ^ u32::from(c) ^ hash.rotate_left(21)
        }
        [a, b] => (u32::from(a) << 7) ^ u32::from(b) ^ hash.rotate_left(14),
        [a] => u32::from(a) ^ hash.rotate_left(7),
        _ => hash,
    }
}

/// Byte-at-a-time hash over the ASCII-lowercased name.
#[must_use]
pub fn ascii_ci_hashname(name: &[u8]) -> u32 {
    name.iter().fold(0_u32, |hash, &b| {
        u32::from(b.to_ascii_lowercase()) ^ hash.rotate_left(7)
    })
}
