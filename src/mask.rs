//! Block masker — produces the canonical stored image of a metadata block.
//!
//! # Algorithm (spec'd, not open to interpretation)
//!
//! 1. Copy the raw block verbatim.
//! 2. If the block is the super-block (its logical address equals the
//!    super-block offset), leave it unchanged and return.
//! 3. Parse the block header to get `level` and `nritems`.
//! 4. Zero the uninteresting region:
//!    - empty block (`nritems == 0`): everything after the header.
//!    - leaf (`level == 0`): the free-space gap between the item array tail
//!      and the first item's data, plus the data payload of every
//!      checksum-item, plus the inline-extent payload of every file-extent
//!      item whose extent type is `FILE_EXTENT_INLINE`.
//!    - internal node: everything after the last key-pointer.
//! 5. Recompute CRC32C over bytes `[32, len)` into bytes `[0, 4)`; bytes
//!    `[4, 32)` (the rest of the nominal checksum field) are zeroed.
//!
//! Masking is idempotent (§8 property 7): running this twice on its own
//! output yields the same bytes as running it once, because step 4 only
//! ever zeroes bytes that are already zero the second time around, and
//! step 5 recomputes the same CRC over the same (now-masked) content.

use crate::btrfs_format::{self, Header, FILE_EXTENT_INLINE, FILE_EXTENT_INLINE_DATA_OFFSET,
    FILE_EXTENT_TYPE_OFFSET, KEY_PTR_SIZE, KEY_TYPE_EXTENT_CSUM, KEY_TYPE_EXTENT_DATA};
use crate::wire::crc32c_seeded;

/// Seed the filesystem's CRC32C uses for block checksums. Matches the
/// original implementation's convention of seeding with the bitwise
/// complement of 1.
pub const BLOCK_CSUM_SEED: u32 = !1u32;

#[derive(thiserror::Error, Debug)]
pub enum MaskError {
    #[error("Block too small ({0} bytes) to contain a btrfs_header ({})", btrfs_format::HEADER_SIZE)]
    TooSmall(usize),
}

/// The masked, checksummed form of one metadata block, ready to write to
/// the output stream.
#[derive(Debug, Clone)]
pub struct MaskedBlock {
    pub bytes: Vec<u8>,
}

/// Mask `raw`, a `node_size`-byte metadata block read from logical address
/// `la`. `super_offset` is the fixed byte offset of the super-block; blocks
/// at that address are passed through unchanged (step 2).
pub fn mask_block(raw: &[u8], la: u64, super_offset: u64) -> Result<MaskedBlock, MaskError> {
    let mut out = raw.to_vec();

    if la == super_offset {
        return Ok(MaskedBlock { bytes: out });
    }

    let node_size = out.len();
    let header = Header::parse(&out).ok_or(MaskError::TooSmall(node_size))?;

    if header.nritems == 0 {
        zero_range(&mut out, btrfs_format::HEADER_SIZE, node_size);
    } else if header.is_leaf() {
        mask_leaf(&mut out, &header, node_size);
    } else {
        mask_internal_node(&mut out, &header, node_size);
    }

    recompute_crc(&mut out);
    Ok(MaskedBlock { bytes: out })
}

fn zero_range(buf: &mut [u8], start: usize, end: usize) {
    if start < end && end <= buf.len() {
        buf[start..end].fill(0);
    }
}

fn mask_leaf(buf: &mut [u8], header: &Header, node_size: usize) {
    let items = btrfs_format::leaf_items(buf, header.nritems);

    // Free-space gap: between the tail of the item-descriptor array and the
    // start of the first item's data (the item with the smallest data
    // start, since data grows backwards from the end of the block).
    let item_array_tail = btrfs_format::HEADER_SIZE + items.len() * btrfs_format::ITEM_SIZE;
    let first_data_start = items
        .iter()
        .map(|it| btrfs_format::item_data_range(node_size, it).0)
        .min()
        .unwrap_or(node_size);
    zero_range(buf, item_array_tail, first_data_start);

    for item in &items {
        let (start, end) = btrfs_format::item_data_range(node_size, item);
        if start >= end || end > buf.len() {
            continue;
        }

        match item.key.ty {
            KEY_TYPE_EXTENT_CSUM => {
                // Entire payload is checksum data — zero it all.
                zero_range(buf, start, end);
            }
            KEY_TYPE_EXTENT_DATA => {
                if end - start <= FILE_EXTENT_TYPE_OFFSET {
                    continue;
                }
                let extent_type = buf[start + FILE_EXTENT_TYPE_OFFSET];
                if extent_type == FILE_EXTENT_INLINE {
                    let inline_start = start + FILE_EXTENT_INLINE_DATA_OFFSET;
                    zero_range(buf, inline_start.min(end), end);
                }
            }
            _ => {}
        }
    }
}

fn mask_internal_node(buf: &mut [u8], header: &Header, node_size: usize) {
    let last_key_ptr_end =
        btrfs_format::HEADER_SIZE + header.nritems as usize * KEY_PTR_SIZE;
    zero_range(buf, last_key_ptr_end, node_size);
}

fn recompute_crc(buf: &mut [u8]) {
    if buf.len() < btrfs_format::CSUM_SIZE {
        return;
    }
    let crc = crc32c_seeded(&buf[btrfs_format::CSUM_SIZE..], BLOCK_CSUM_SEED);
    buf[0..4].copy_from_slice(&crc.to_le_bytes());
    buf[4..btrfs_format::CSUM_SIZE].fill(0);
}

/// Verify the checksum law (§8 property 8): the stored CRC32C at bytes
/// `[0, 4)` equals the CRC32C of bytes `[32, len)`.
pub fn verify_csum(buf: &[u8]) -> bool {
    if buf.len() < btrfs_format::CSUM_SIZE {
        return false;
    }
    let stored = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let computed = crc32c_seeded(&buf[btrfs_format::CSUM_SIZE..], BLOCK_CSUM_SEED);
    stored == computed
}
