//! Super-block and chunk-tree rewriter (spec.md §4.7).
//!
//! Restoring a metadump produces a single file standing in for what may
//! have been a multi-device, multi-stripe filesystem. Every chunk record —
//! the entries that map the filesystem's logical address space onto
//! physical device offsets — has to be rewritten so it maps onto exactly
//! one stripe backed by the restore target, or nothing downstream of this
//! file (btrfs itself, or any tool inspecting it) would agree on where any
//! given logical byte actually lives.

use std::fs::File;
#[cfg(unix)]
use std::os::unix::fs::FileExt;

use crate::btrfs_format::{
    self, Key, CHUNK_FIXED_SIZE, CHUNK_NUM_STRIPES_OFFSET, CHUNK_SIZE_ONE_STRIPE,
    CHUNK_SUB_STRIPES_OFFSET, CHUNK_TYPE_OFFSET, KEY_SIZE, KEY_TYPE_CHUNK_ITEM, STRIPE_SIZE,
};
use crate::mask::BLOCK_CSUM_SEED;
use crate::wire::crc32c_seeded;

#[derive(thiserror::Error, Debug)]
pub enum FixupError {
    #[error("super-block buffer too small ({0} bytes)")]
    SuperTooSmall(usize),
    #[error("system chunk array overflows SYS_CHUNK_ARRAY_MAX_SIZE ({0} > {1})")]
    SysChunkArrayOverflow(usize, usize),
    #[error("I/O error writing backup super-block: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters extracted from the first super-block seen during restore.
/// Populated once, then read-only for the rest of the run (spec.md §4.6's
/// "populated before any non-super block is processed" invariant).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreDescriptor {
    pub node_size: u32,
    pub fsid: [u8; 16],
    pub device_id: u64,
    pub device_uuid: [u8; 16],
}

impl RestoreDescriptor {
    /// Extract a descriptor from a raw super-block buffer.
    pub fn from_super_block(buf: &[u8]) -> Result<Self, FixupError> {
        if buf.len() < btrfs_format::SUPER_INFO_SIZE {
            return Err(FixupError::SuperTooSmall(buf.len()));
        }
        let node_size = u32::from_le_bytes(
            buf[btrfs_format::SUPER_NODESIZE_OFFSET..btrfs_format::SUPER_NODESIZE_OFFSET + 4]
                .try_into()
                .unwrap(),
        );
        let fsid: [u8; 16] = buf[btrfs_format::HEADER_FSID_OFFSET
            ..btrfs_format::HEADER_FSID_OFFSET + 16]
            .try_into()
            .unwrap();

        let dev_item = btrfs_format::SUPER_DEV_ITEM_OFFSET;
        let device_id = u64::from_le_bytes(
            buf[dev_item + btrfs_format::DEV_ITEM_DEVID_OFFSET
                ..dev_item + btrfs_format::DEV_ITEM_DEVID_OFFSET + 8]
                .try_into()
                .unwrap(),
        );
        let device_uuid: [u8; 16] = buf[dev_item + btrfs_format::DEV_ITEM_UUID_OFFSET
            ..dev_item + btrfs_format::DEV_ITEM_UUID_OFFSET + 16]
            .try_into()
            .unwrap();

        Ok(Self {
            node_size,
            fsid,
            device_id,
            device_uuid,
        })
    }
}

fn recompute_super_crc(buf: &mut [u8]) {
    let crc = crc32c_seeded(&buf[btrfs_format::CSUM_SIZE..], BLOCK_CSUM_SEED);
    buf[0..4].copy_from_slice(&crc.to_le_bytes());
    buf[4..btrfs_format::CSUM_SIZE].fill(0);
}

fn set_metadump_flag(buf: &mut [u8]) {
    let off = btrfs_format::SUPER_FLAGS_OFFSET;
    let mut flags = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
    flags |= btrfs_format::SUPER_FLAG_METADUMP;
    buf[off..off + 8].copy_from_slice(&flags.to_le_bytes());
}

/// Build one synthetic single-stripe `(key, chunk)` system-chunk-array
/// entry covering the full logical address space, as `update_super_old`
/// requires.
fn synthetic_system_chunk_entry(desc: &RestoreDescriptor) -> Vec<u8> {
    let mut out = Vec::with_capacity(KEY_SIZE + CHUNK_SIZE_ONE_STRIPE);

    // Key: objectid = FIRST_CHUNK_TREE_OBJECTID, type = CHUNK_ITEM, offset = 0.
    out.extend_from_slice(&btrfs_format::FIRST_CHUNK_TREE_OBJECTID.to_le_bytes());
    out.push(KEY_TYPE_CHUNK_ITEM);
    out.extend_from_slice(&0u64.to_le_bytes());

    // btrfs_chunk fixed fields.
    out.extend_from_slice(&u64::MAX.to_le_bytes()); // length: cover the full range
    out.extend_from_slice(&btrfs_format::CHUNK_TREE_OBJECTID.to_le_bytes()); // owner
    out.extend_from_slice(&(64 * 1024u64).to_le_bytes()); // stripe_len
    out.extend_from_slice(&btrfs_format::BLOCK_GROUP_SYSTEM.to_le_bytes()); // type
    out.extend_from_slice(&4096u32.to_le_bytes()); // io_align
    out.extend_from_slice(&4096u32.to_le_bytes()); // io_width
    out.extend_from_slice(&4096u32.to_le_bytes()); // sector_size
    out.extend_from_slice(&1u16.to_le_bytes()); // num_stripes
    out.extend_from_slice(&0u16.to_le_bytes()); // sub_stripes

    // Single stripe: devid, physical offset 0, device uuid.
    out.extend_from_slice(&desc.device_id.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes());
    out.extend_from_slice(&desc.device_uuid);

    out
}

/// Old-restore mode: discard whatever system-chunk array the source
/// recorded and replace it with one synthetic entry.
pub fn update_super_old(buf: &mut [u8], desc: &RestoreDescriptor) -> Result<(), FixupError> {
    if buf.len() < btrfs_format::SUPER_INFO_SIZE {
        return Err(FixupError::SuperTooSmall(buf.len()));
    }

    let entry = synthetic_system_chunk_entry(desc);
    if entry.len() > btrfs_format::SYS_CHUNK_ARRAY_MAX_SIZE {
        return Err(FixupError::SysChunkArrayOverflow(
            entry.len(),
            btrfs_format::SYS_CHUNK_ARRAY_MAX_SIZE,
        ));
    }

    let array_off = btrfs_format::SUPER_SYS_CHUNK_ARRAY_OFFSET;
    buf[array_off..array_off + entry.len()].copy_from_slice(&entry);
    buf[array_off + entry.len()..array_off + btrfs_format::SYS_CHUNK_ARRAY_MAX_SIZE].fill(0);

    let size_off = btrfs_format::SUPER_SYS_CHUNK_ARRAY_SIZE_OFFSET;
    buf[size_off..size_off + 4].copy_from_slice(&(entry.len() as u32).to_le_bytes());

    set_metadump_flag(buf);
    recompute_super_crc(buf);
    Ok(())
}

/// Normal-restore mode: keep every existing system-chunk-array key but
/// rewrite each chunk record to single-stripe geometry, repacking the
/// array to drop the space the dropped stripes freed up.
pub fn update_super(buf: &mut [u8], desc: &RestoreDescriptor) -> Result<(), FixupError> {
    if buf.len() < btrfs_format::SUPER_INFO_SIZE {
        return Err(FixupError::SuperTooSmall(buf.len()));
    }

    let array_off = btrfs_format::SUPER_SYS_CHUNK_ARRAY_OFFSET;
    let array_size = u32::from_le_bytes(
        buf[btrfs_format::SUPER_SYS_CHUNK_ARRAY_SIZE_OFFSET
            ..btrfs_format::SUPER_SYS_CHUNK_ARRAY_SIZE_OFFSET + 4]
            .try_into()
            .unwrap(),
    ) as usize;

    let array = buf[array_off..array_off + array_size].to_vec();
    let mut rewritten = Vec::with_capacity(array_size);
    let mut pos = 0usize;

    while pos + KEY_SIZE <= array.len() {
        let key = Key::parse(&array[pos..pos + KEY_SIZE]).ok_or(FixupError::SuperTooSmall(0))?;
        pos += KEY_SIZE;
        if pos + CHUNK_FIXED_SIZE > array.len() {
            break;
        }

        let num_stripes = u16::from_le_bytes(
            array[pos + CHUNK_NUM_STRIPES_OFFSET..pos + CHUNK_NUM_STRIPES_OFFSET + 2]
                .try_into()
                .unwrap(),
        ) as usize;
        let chunk_len = CHUNK_FIXED_SIZE + num_stripes * STRIPE_SIZE;
        if pos + chunk_len > array.len() {
            break;
        }

        let mut chunk = array[pos..pos + CHUNK_FIXED_SIZE].to_vec();
        rewrite_chunk_to_single_stripe(&mut chunk, desc, key.offset);

        rewritten.extend_from_slice(&key.objectid.to_le_bytes());
        rewritten.push(key.ty);
        rewritten.extend_from_slice(&key.offset.to_le_bytes());
        rewritten.extend_from_slice(&chunk);

        pos += chunk_len;
    }

    if rewritten.len() > btrfs_format::SYS_CHUNK_ARRAY_MAX_SIZE {
        return Err(FixupError::SysChunkArrayOverflow(
            rewritten.len(),
            btrfs_format::SYS_CHUNK_ARRAY_MAX_SIZE,
        ));
    }

    buf[array_off..array_off + rewritten.len()].copy_from_slice(&rewritten);
    buf[array_off + rewritten.len()..array_off + btrfs_format::SYS_CHUNK_ARRAY_MAX_SIZE].fill(0);
    buf[btrfs_format::SUPER_SYS_CHUNK_ARRAY_SIZE_OFFSET
        ..btrfs_format::SUPER_SYS_CHUNK_ARRAY_SIZE_OFFSET + 4]
        .copy_from_slice(&(rewritten.len() as u32).to_le_bytes());

    set_metadump_flag(buf);
    recompute_super_crc(buf);
    Ok(())
}

/// Collapse a `btrfs_chunk`'s fixed fields in place to single-stripe
/// geometry. `chunk` must be exactly `CHUNK_FIXED_SIZE` bytes on entry;
/// the caller appends the rewritten single stripe afterward.
fn rewrite_chunk_to_single_stripe(chunk: &mut Vec<u8>, desc: &RestoreDescriptor, physical_offset: u64) {
    let mut ty = u64::from_le_bytes(chunk[CHUNK_TYPE_OFFSET..CHUNK_TYPE_OFFSET + 8].try_into().unwrap());
    ty &= btrfs_format::BLOCK_GROUP_ROLE_MASK;
    chunk[CHUNK_TYPE_OFFSET..CHUNK_TYPE_OFFSET + 8].copy_from_slice(&ty.to_le_bytes());

    chunk[CHUNK_NUM_STRIPES_OFFSET..CHUNK_NUM_STRIPES_OFFSET + 2]
        .copy_from_slice(&1u16.to_le_bytes());
    chunk[CHUNK_SUB_STRIPES_OFFSET..CHUNK_SUB_STRIPES_OFFSET + 2]
        .copy_from_slice(&0u16.to_le_bytes());

    chunk.extend_from_slice(&desc.device_id.to_le_bytes());
    chunk.extend_from_slice(&physical_offset.to_le_bytes());
    chunk.extend_from_slice(&desc.device_uuid);
}

/// Speculatively treat `buf` as one or more node-sized chunk-tree leaves
/// and fix up any that actually are. Returns whether at least one leaf in
/// `buf` matched the chunk tree and was rewritten.
pub fn fixup_chunk_tree_leaf(buf: &mut [u8], desc: &RestoreDescriptor) -> Result<bool, FixupError> {
    let node_size = desc.node_size as usize;
    if node_size == 0 || buf.len() % node_size != 0 {
        return Ok(false);
    }

    let mut matched_any = false;
    for chunk_idx in 0..(buf.len() / node_size) {
        let block = &mut buf[chunk_idx * node_size..(chunk_idx + 1) * node_size];
        if fixup_one_leaf(block, desc, node_size)? {
            matched_any = true;
        }
    }
    Ok(matched_any)
}

fn fixup_one_leaf(block: &mut [u8], desc: &RestoreDescriptor, node_size: usize) -> Result<bool, FixupError> {
    let header = match btrfs_format::Header::parse(block) {
        Some(h) => h,
        None => return Ok(false),
    };

    if header.fsid != desc.fsid || header.level != 0 || header.owner != btrfs_format::CHUNK_TREE_OBJECTID {
        return Ok(false);
    }

    let items = btrfs_format::leaf_items(block, header.nritems);
    let mut new_items: Vec<(btrfs_format::Item, Vec<u8>)> = Vec::with_capacity(items.len());
    let mut any_chunk = false;

    for item in &items {
        let (start, end) = btrfs_format::item_data_range(node_size, item);
        if start >= end || end > block.len() {
            new_items.push((*item, Vec::new()));
            continue;
        }
        if item.key.ty != KEY_TYPE_CHUNK_ITEM || end - start < CHUNK_FIXED_SIZE {
            new_items.push((*item, block[start..end].to_vec()));
            continue;
        }

        any_chunk = true;
        let mut chunk = block[start..start + CHUNK_FIXED_SIZE].to_vec();
        rewrite_chunk_to_single_stripe(&mut chunk, desc, item.key.offset);
        new_items.push((*item, chunk));
    }

    if !any_chunk {
        return Ok(false);
    }

    repack_leaf(block, &header, &new_items, node_size);
    recompute_leaf_crc(block);
    Ok(true)
}

/// Rewrite a leaf's item array and data region after some items shrank
/// (chunk items losing their trailing stripes). Data is repacked
/// back-to-front, matching the filesystem's own "data grows backward from
/// the end of the block" convention.
fn repack_leaf(
    block: &mut [u8],
    header: &btrfs_format::Header,
    items: &[(btrfs_format::Item, Vec<u8>)],
    node_size: usize,
) {
    let mut cursor = node_size;
    for (i, (item, data)) in items.iter().enumerate() {
        cursor -= data.len();
        block[cursor..cursor + data.len()].copy_from_slice(data);

        let desc_off = btrfs_format::HEADER_SIZE + i * btrfs_format::ITEM_SIZE;
        block[desc_off..desc_off + 8].copy_from_slice(&item.key.objectid.to_le_bytes());
        block[desc_off + 8] = item.key.ty;
        block[desc_off + 9..desc_off + 17].copy_from_slice(&item.key.offset.to_le_bytes());
        block[desc_off + 17..desc_off + 21]
            .copy_from_slice(&((node_size - cursor - data.len()) as u32).to_le_bytes());
        block[desc_off + 21..desc_off + 25].copy_from_slice(&(data.len() as u32).to_le_bytes());
    }

    let tail = btrfs_format::HEADER_SIZE + items.len() * btrfs_format::ITEM_SIZE;
    if tail < cursor {
        block[tail..cursor].fill(0);
    }
    let _ = header;
}

fn recompute_leaf_crc(block: &mut [u8]) {
    let crc = crc32c_seeded(&block[btrfs_format::CSUM_SIZE..], BLOCK_CSUM_SEED);
    block[0..4].copy_from_slice(&crc.to_le_bytes());
    block[4..btrfs_format::CSUM_SIZE].fill(0);
}

/// Write `primary` at every backup mirror offset that fits within
/// `target_len` bytes (spec.md §4.7).
#[cfg(unix)]
pub fn write_backup_supers(target: &File, primary: &[u8], target_len: u64) -> Result<(), FixupError> {
    for &offset in &btrfs_format::SUPER_BACKUP_OFFSETS {
        if offset + primary.len() as u64 > target_len {
            continue;
        }
        target.write_at(primary, offset)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_desc() -> RestoreDescriptor {
        RestoreDescriptor {
            node_size: 4096,
            fsid: [7u8; 16],
            device_id: 1,
            device_uuid: [9u8; 16],
        }
    }

    fn blank_super() -> Vec<u8> {
        vec![0u8; btrfs_format::SUPER_INFO_SIZE]
    }

    #[test]
    fn update_super_old_sets_metadump_flag_and_one_chunk() {
        let desc = synthetic_desc();
        let mut buf = blank_super();
        update_super_old(&mut buf, &desc).unwrap();

        let flags = u64::from_le_bytes(
            buf[btrfs_format::SUPER_FLAGS_OFFSET..btrfs_format::SUPER_FLAGS_OFFSET + 8]
                .try_into()
                .unwrap(),
        );
        assert_ne!(flags & btrfs_format::SUPER_FLAG_METADUMP, 0);

        let size = u32::from_le_bytes(
            buf[btrfs_format::SUPER_SYS_CHUNK_ARRAY_SIZE_OFFSET
                ..btrfs_format::SUPER_SYS_CHUNK_ARRAY_SIZE_OFFSET + 4]
                .try_into()
                .unwrap(),
        );
        assert_eq!(size as usize, KEY_SIZE + CHUNK_SIZE_ONE_STRIPE);

        assert!(crate::mask::verify_csum(&buf));
    }

    #[test]
    fn update_super_collapses_multi_stripe_entry() {
        let desc = synthetic_desc();
        let mut buf = blank_super();

        // Build one system-chunk-array entry with 3 stripes.
        let mut entry = Vec::new();
        entry.extend_from_slice(&3u64.to_le_bytes()); // objectid
        entry.push(KEY_TYPE_CHUNK_ITEM);
        entry.extend_from_slice(&0x2000u64.to_le_bytes()); // key.offset -> physical offset used
        entry.extend_from_slice(&(1u64 << 30).to_le_bytes()); // length
        entry.extend_from_slice(&3u64.to_le_bytes()); // owner
        entry.extend_from_slice(&65536u64.to_le_bytes()); // stripe_len
        entry.extend_from_slice(
            &(btrfs_format::BLOCK_GROUP_SYSTEM | 0x0010 /* RAID bit */).to_le_bytes(),
        );
        entry.extend_from_slice(&4096u32.to_le_bytes());
        entry.extend_from_slice(&4096u32.to_le_bytes());
        entry.extend_from_slice(&4096u32.to_le_bytes());
        entry.extend_from_slice(&3u16.to_le_bytes()); // num_stripes
        entry.extend_from_slice(&0u16.to_le_bytes());
        for devid in 0..3u64 {
            entry.extend_from_slice(&devid.to_le_bytes());
            entry.extend_from_slice(&0u64.to_le_bytes());
            entry.extend_from_slice(&[0u8; 16]);
        }

        let array_off = btrfs_format::SUPER_SYS_CHUNK_ARRAY_OFFSET;
        buf[array_off..array_off + entry.len()].copy_from_slice(&entry);
        buf[btrfs_format::SUPER_SYS_CHUNK_ARRAY_SIZE_OFFSET
            ..btrfs_format::SUPER_SYS_CHUNK_ARRAY_SIZE_OFFSET + 4]
            .copy_from_slice(&(entry.len() as u32).to_le_bytes());

        update_super(&mut buf, &desc).unwrap();

        let new_size = u32::from_le_bytes(
            buf[btrfs_format::SUPER_SYS_CHUNK_ARRAY_SIZE_OFFSET
                ..btrfs_format::SUPER_SYS_CHUNK_ARRAY_SIZE_OFFSET + 4]
                .try_into()
                .unwrap(),
        ) as usize;
        assert_eq!(new_size, KEY_SIZE + CHUNK_SIZE_ONE_STRIPE);

        let num_stripes = u16::from_le_bytes(
            buf[array_off + KEY_SIZE + CHUNK_NUM_STRIPES_OFFSET
                ..array_off + KEY_SIZE + CHUNK_NUM_STRIPES_OFFSET + 2]
                .try_into()
                .unwrap(),
        );
        assert_eq!(num_stripes, 1);
        assert!(crate::mask::verify_csum(&buf));
    }

    #[test]
    fn fixup_chunk_tree_leaf_ignores_non_chunk_tree_blocks() {
        let desc = synthetic_desc();
        let mut buf = vec![0u8; 4096];
        buf[btrfs_format::HEADER_FSID_OFFSET..btrfs_format::HEADER_FSID_OFFSET + 16]
            .copy_from_slice(&[1u8; 16]); // wrong fsid
        assert!(!fixup_chunk_tree_leaf(&mut buf, &desc).unwrap());
    }
}
