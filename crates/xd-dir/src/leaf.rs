//! Block-format trailer: the leaf-hash array and tail at the end of a
//! single-block directory.

use serde::{Deserialize, Serialize};
use xd_ondisk::layout::LEAF_ENTRY_SIZE;
use xd_ondisk::{BlockTail, DirGeometry, LeafEntry};
use xd_types::ParseError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTrailer {
    pub tail: BlockTail,
    /// Start of the leaf array: the end of the data region.
    pub leaf_offset: usize,
    pub leaves: Vec<LeafEntry>,
}

impl BlockTrailer {
    pub fn parse(geo: &DirGeometry, block: &[u8]) -> Result<Self, ParseError> {
        let tail = BlockTail::parse(block)?;
        let leaf_offset = geo.block_leaf_offset(tail.count).ok_or(ParseError::InvalidField {
            field: "block_tail.count",
            reason: "leaf array does not fit in block",
        })?;
        let leaves = (0..tail.count as usize)
            .map(|i| LeafEntry::parse_at(block, leaf_offset + i * LEAF_ENTRY_SIZE))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            tail,
            leaf_offset,
            leaves,
        })
    }

    /// Build a trailer for `leaves`, sorted by hash, with the stale count
    /// taken from the tombstones among them.
    pub fn new(geo: &DirGeometry, mut leaves: Vec<LeafEntry>) -> Result<Self, ParseError> {
        leaves.sort_by_key(|leaf| leaf.hashval);
        let count = u32::try_from(leaves.len())
            .map_err(|_| ParseError::IntegerConversion { field: "block_tail.count" })?;
        #[allow(clippy::cast_possible_truncation)] // bounded by count
        let stale = leaves.iter().filter(|leaf| leaf.is_stale()).count() as u32;
        let leaf_offset = geo.block_leaf_offset(count).ok_or(ParseError::InvalidField {
            field: "block_tail.count",
            reason: "leaf array does not fit in block",
        })?;
        Ok(Self {
            tail: BlockTail { count, stale },
            leaf_offset,
            leaves,
        })
    }

    #[must_use]
    pub fn leaf_entry_offset(&self, index: usize) -> usize {
        self.leaf_offset + index * LEAF_ENTRY_SIZE
    }

    pub fn write(&self, block: &mut [u8]) -> Result<(), ParseError> {
        for (i, leaf) in self.leaves.iter().enumerate() {
            leaf.write_at(block, self.leaf_entry_offset(i))?;
        }
        self.tail.write(block)
    }

    /// Leaves carrying `hash`, in array order.
    pub fn with_hash(&self, hash: u32) -> impl Iterator<Item = &LeafEntry> {
        let start = self.leaves.partition_point(|leaf| leaf.hashval < hash);
        self.leaves[start..]
            .iter()
            .take_while(move |leaf| leaf.hashval == hash)
    }
}
