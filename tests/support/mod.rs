//! Shared in-memory `FsReader` double plus raw-buffer builders, used by the
//! integration tests to assemble a small synthetic filesystem image without
//! touching a real block device.

use std::collections::HashMap;
use std::io;

use btrfsdump::btrfs_format::{
    self, CHUNK_FIXED_SIZE, KEY_TYPE_CHUNK_ITEM, STRIPE_SIZE,
};
use btrfsdump::FsReader;

/// A filesystem built entirely in memory: every metadata block and data
/// extent the test wired up lives in `blocks`/`data`, keyed by logical
/// address.
pub struct FakeFs {
    pub node_size: u32,
    pub super_offset: u64,
    pub blocks: HashMap<u64, Vec<u8>>,
    pub data: HashMap<u64, Vec<u8>>,
    pub metadata_ranges: Vec<(u64, u64)>,
    pub data_ranges: Vec<(u64, u64)>,
    pub log_root: Option<u64>,
}

impl FsReader for FakeFs {
    fn node_size(&self) -> u32 {
        self.node_size
    }

    fn super_offset(&self) -> u64 {
        self.super_offset
    }

    fn read_block(&mut self, la: u64) -> io::Result<Vec<u8>> {
        self.blocks.get(&la).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no block at {la:#x}"))
        })
    }

    fn read_data_extent(&mut self, la: u64, len: usize) -> io::Result<Vec<u8>> {
        let buf = self
            .data
            .get(&la)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no data extent at {la:#x}")))?;
        if buf.len() != len {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "extent length mismatch"));
        }
        Ok(buf.clone())
    }

    fn super_block_bytes(&mut self) -> io::Result<Vec<u8>> {
        self.read_block(self.super_offset)
    }

    fn log_root(&mut self) -> io::Result<Option<u64>> {
        Ok(self.log_root)
    }

    fn extent_tree_metadata_ranges(&mut self) -> io::Result<Vec<(u64, u64)>> {
        Ok(self.metadata_ranges.clone())
    }

    fn walk_log_root_blocks(&mut self, log_root_la: u64) -> io::Result<Vec<u64>> {
        Ok(vec![log_root_la])
    }

    fn free_space_cache_data_extents(&mut self) -> io::Result<Vec<(u64, u64)>> {
        Ok(self.data_ranges.clone())
    }
}

/// Build a `btrfs_chunk` record: fixed fields followed by `devids.len()`
/// stripes, each pinned to physical offset 0 with a zeroed device uuid.
pub fn chunk_record_bytes(num_stripes: u16, devids: &[u64], chunk_type: u64) -> Vec<u8> {
    assert_eq!(num_stripes as usize, devids.len());
    let mut out = Vec::with_capacity(CHUNK_FIXED_SIZE + devids.len() * STRIPE_SIZE);

    out.extend_from_slice(&(1u64 << 30).to_le_bytes()); // length
    out.extend_from_slice(&btrfs_format::CHUNK_TREE_OBJECTID.to_le_bytes()); // owner
    out.extend_from_slice(&65536u64.to_le_bytes()); // stripe_len
    out.extend_from_slice(&chunk_type.to_le_bytes());
    out.extend_from_slice(&4096u32.to_le_bytes()); // io_align
    out.extend_from_slice(&4096u32.to_le_bytes()); // io_width
    out.extend_from_slice(&4096u32.to_le_bytes()); // sector_size
    out.extend_from_slice(&num_stripes.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // sub_stripes

    for &devid in devids {
        out.extend_from_slice(&devid.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // physical offset
        out.extend_from_slice(&[0u8; 16]); // dev_uuid
    }

    out
}

/// Build a super-block buffer carrying one system-chunk-array entry.
pub fn build_super(
    node_size: u32,
    fsid: [u8; 16],
    device_id: u64,
    device_uuid: [u8; 16],
    chunk_key_offset: u64,
    chunk: &[u8],
) -> Vec<u8> {
    let mut buf = vec![0u8; btrfs_format::SUPER_INFO_SIZE];

    buf[btrfs_format::HEADER_FSID_OFFSET..btrfs_format::HEADER_FSID_OFFSET + 16]
        .copy_from_slice(&fsid);
    buf[btrfs_format::SUPER_NODESIZE_OFFSET..btrfs_format::SUPER_NODESIZE_OFFSET + 4]
        .copy_from_slice(&node_size.to_le_bytes());

    let dev_item = btrfs_format::SUPER_DEV_ITEM_OFFSET;
    buf[dev_item + btrfs_format::DEV_ITEM_DEVID_OFFSET..dev_item + btrfs_format::DEV_ITEM_DEVID_OFFSET + 8]
        .copy_from_slice(&device_id.to_le_bytes());
    buf[dev_item + btrfs_format::DEV_ITEM_UUID_OFFSET..dev_item + btrfs_format::DEV_ITEM_UUID_OFFSET + 16]
        .copy_from_slice(&device_uuid);

    let mut entry = Vec::with_capacity(btrfs_format::KEY_SIZE + chunk.len());
    entry.extend_from_slice(&btrfs_format::FIRST_CHUNK_TREE_OBJECTID.to_le_bytes());
    entry.push(KEY_TYPE_CHUNK_ITEM);
    entry.extend_from_slice(&chunk_key_offset.to_le_bytes());
    entry.extend_from_slice(chunk);

    let array_off = btrfs_format::SUPER_SYS_CHUNK_ARRAY_OFFSET;
    buf[array_off..array_off + entry.len()].copy_from_slice(&entry);
    buf[btrfs_format::SUPER_SYS_CHUNK_ARRAY_SIZE_OFFSET..btrfs_format::SUPER_SYS_CHUNK_ARRAY_SIZE_OFFSET + 4]
        .copy_from_slice(&(entry.len() as u32).to_le_bytes());

    buf
}

/// Build an empty leaf (`nritems == 0`) belonging to tree `owner`.
pub fn build_empty_leaf(node_size: usize, fsid: [u8; 16], bytenr: u64, owner: u64) -> Vec<u8> {
    let mut buf = vec![0x5Au8; node_size];
    buf[btrfs_format::HEADER_FSID_OFFSET..btrfs_format::HEADER_FSID_OFFSET + 16]
        .copy_from_slice(&fsid);
    buf[btrfs_format::HEADER_BYTENR_OFFSET..btrfs_format::HEADER_BYTENR_OFFSET + 8]
        .copy_from_slice(&bytenr.to_le_bytes());
    buf[btrfs_format::HEADER_OWNER_OFFSET..btrfs_format::HEADER_OWNER_OFFSET + 8]
        .copy_from_slice(&owner.to_le_bytes());
    buf[btrfs_format::HEADER_NRITEMS_OFFSET..btrfs_format::HEADER_NRITEMS_OFFSET + 4]
        .copy_from_slice(&0u32.to_le_bytes());
    buf[btrfs_format::HEADER_LEVEL_OFFSET] = 0;
    buf
}

/// Build a chunk-tree leaf holding exactly one `CHUNK_ITEM`.
pub fn build_chunk_tree_leaf(
    node_size: usize,
    fsid: [u8; 16],
    bytenr: u64,
    chunk_key_offset: u64,
    chunk: &[u8],
) -> Vec<u8> {
    let mut buf = vec![0u8; node_size];
    buf[btrfs_format::HEADER_FSID_OFFSET..btrfs_format::HEADER_FSID_OFFSET + 16]
        .copy_from_slice(&fsid);
    buf[btrfs_format::HEADER_BYTENR_OFFSET..btrfs_format::HEADER_BYTENR_OFFSET + 8]
        .copy_from_slice(&bytenr.to_le_bytes());
    buf[btrfs_format::HEADER_OWNER_OFFSET..btrfs_format::HEADER_OWNER_OFFSET + 8]
        .copy_from_slice(&btrfs_format::CHUNK_TREE_OBJECTID.to_le_bytes());
    buf[btrfs_format::HEADER_NRITEMS_OFFSET..btrfs_format::HEADER_NRITEMS_OFFSET + 4]
        .copy_from_slice(&1u32.to_le_bytes());
    buf[btrfs_format::HEADER_LEVEL_OFFSET] = 0;

    let desc_off = btrfs_format::HEADER_SIZE;
    buf[desc_off..desc_off + 8].copy_from_slice(&btrfs_format::FIRST_CHUNK_TREE_OBJECTID.to_le_bytes());
    buf[desc_off + 8] = KEY_TYPE_CHUNK_ITEM;
    buf[desc_off + 9..desc_off + 17].copy_from_slice(&chunk_key_offset.to_le_bytes());

    let data_start = node_size - chunk.len();
    buf[desc_off + 17..desc_off + 21].copy_from_slice(&0u32.to_le_bytes()); // data_offset
    buf[desc_off + 21..desc_off + 25].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
    buf[data_start..data_start + chunk.len()].copy_from_slice(chunk);

    buf
}

/// Assemble the small synthetic filesystem used by the round-trip test:
/// a super-block with one 3-stripe system-chunk-array entry, an empty
/// root-tree leaf, and a chunk-tree leaf holding one 3-stripe `CHUNK_ITEM`.
/// No log-root, no free-space-cache extents.
pub fn small_filesystem() -> FakeFs {
    let node_size: u32 = 4096;
    let fsid = [7u8; 16];
    let device_id = 1u64;
    let device_uuid = [9u8; 16];

    let root_leaf_la = 0x20000u64;
    let chunk_leaf_la = 0x30000u64;

    let super_chunk = chunk_record_bytes(3, &[10, 11, 12], btrfs_format::BLOCK_GROUP_SYSTEM);
    let super_bytes = build_super(node_size, fsid, device_id, device_uuid, 0, &super_chunk);

    let leaf_chunk = chunk_record_bytes(3, &[20, 21, 22], btrfs_format::BLOCK_GROUP_METADATA);
    let chunk_leaf_bytes =
        build_chunk_tree_leaf(node_size as usize, fsid, chunk_leaf_la, 0x1000, &leaf_chunk);

    let root_leaf_bytes = build_empty_leaf(node_size as usize, fsid, root_leaf_la, 5);

    let mut blocks = HashMap::new();
    blocks.insert(btrfs_format::SUPER_OFFSET, super_bytes);
    blocks.insert(root_leaf_la, root_leaf_bytes);
    blocks.insert(chunk_leaf_la, chunk_leaf_bytes);

    FakeFs {
        node_size,
        super_offset: btrfs_format::SUPER_OFFSET,
        blocks,
        data: HashMap::new(),
        metadata_ranges: vec![(root_leaf_la, node_size as u64), (chunk_leaf_la, node_size as u64)],
        data_ranges: Vec::new(),
        log_root: None,
    }
}
