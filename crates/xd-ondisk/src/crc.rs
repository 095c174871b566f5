//! CRC32C protection for v3 blocks.
//!
//! The checksum covers the whole block with the 4-byte CRC field treated as
//! zero, and is stored little-endian.

use xd_types::{ParseError, ensure_slice, read_le_u32, write_le_u32};

const CRC_LEN: usize = 4;

/// Compute the block checksum with the field at `crc_off` zeroed.
pub fn dir3_block_crc(block: &[u8], crc_off: usize) -> Result<u32, ParseError> {
    ensure_slice(block, crc_off, CRC_LEN)?;
    let crc = crc32c::crc32c(&block[..crc_off]);
    let crc = crc32c::crc32c_append(crc, &[0; CRC_LEN]);
    Ok(crc32c::crc32c_append(crc, &block[crc_off + CRC_LEN..]))
}

/// True when the stored checksum matches the contents.
pub fn verify_cksum(block: &[u8], crc_off: usize) -> Result<bool, ParseError> {
    let stored = read_le_u32(block, crc_off)?;
    Ok(stored == dir3_block_crc(block, crc_off)?)
}

/// Recompute and store the checksum.
pub fn update_cksum(block: &mut [u8], crc_off: usize) -> Result<(), ParseError> {
    let crc = dir3_block_crc(block, crc_off)?;
    write_le_u32(block, crc_off, crc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_then_verify() {
        let mut block = vec![0x5A_u8; 512];
        assert!(!verify_cksum(&block, 4).unwrap());
        update_cksum(&mut block, 4).unwrap();
        assert!(verify_cksum(&block, 4).unwrap());
        block[100] ^= 1;
        assert!(!verify_cksum(&block, 4).unwrap());
    }

    #[test]
    fn crc_field_is_excluded() {
        let mut a = vec![7_u8; 64];
        let mut b = a.clone();
        a[4..8].copy_from_slice(&[1, 2, 3, 4]);
        b[4..8].copy_from_slice(&[9, 9, 9, 9]);
        assert_eq!(dir3_block_crc(&a, 4).unwrap(), dir3_block_crc(&b, 4).unwrap());
    }

    #[test]
    fn matches_plain_crc32c_with_zeroed_field() {
        let mut block: Vec<u8> = (0..=255).collect();
        let expected = {
            let mut copy = block.clone();
            copy[4..8].fill(0);
            crc32c::crc32c(&copy)
        };
        update_cksum(&mut block, 4).unwrap();
        assert_eq!(read_le_u32(&block, 4).unwrap(), expected);
    }

    #[test]
    fn short_block_rejected() {
        assert!(dir3_block_crc(&[0_u8; 6], 4).is_err());
    }
}
