//! `FsReader` — the external collaborator boundary.
//!
//! Opening and reading the *source* filesystem is explicitly out of scope
//! for this crate (spec.md §1): a real implementation would talk to a live
//! block device through btrfs ioctls or raw mmap. What lives here is just
//! the contract the dump driver needs from such a reader — a B-tree cursor,
//! leaf iteration, block-by-logical-address reads, and a logical→physical
//! mapping function, exactly as spec.md §1 describes it.
//!
//! Tests exercise the dump driver against a small in-memory double
//! (`tests/support`), not against this trait's intended production
//! implementation.

use std::io;

/// Whether a coalesced run is a metadata node run or a raw data extent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Metadata,
    Data,
}

/// Everything the dumper needs from a live (or simulated) filesystem.
pub trait FsReader {
    /// Metadata node/leaf size for every tree in scope.
    fn node_size(&self) -> u32;

    /// Fixed byte offset of the super-block.
    fn super_offset(&self) -> u64;

    /// Read one raw, unmasked metadata block (`node_size` bytes) at `la`.
    fn read_block(&mut self, la: u64) -> io::Result<Vec<u8>>;

    /// Read `len` raw bytes of a data extent at logical address `la`,
    /// resolved through the logical→physical mapping.
    fn read_data_extent(&mut self, la: u64, len: usize) -> io::Result<Vec<u8>>;

    /// Advisory read-ahead hint; absence must not affect correctness
    /// (spec.md §9, "Coalescer read-ahead is advisory").
    fn request_readahead(&mut self, _la: u64, _len: usize) {}

    /// Raw bytes of the super-block (4 KiB).
    fn super_block_bytes(&mut self) -> io::Result<Vec<u8>>;

    /// Logical address of the log-root tree, if the filesystem has one.
    fn log_root(&mut self) -> io::Result<Option<u64>>;

    /// Scan the extent tree, returning `(la, len)` ranges of every block
    /// flagged as a tree block (metadata), in ascending order.
    fn extent_tree_metadata_ranges(&mut self) -> io::Result<Vec<(u64, u64)>>;

    /// Recursively visit every block of the log-root subtree rooted at
    /// `log_root_la`, including every subtree reachable via leaf root-item
    /// references, returning the full set of metadata block addresses.
    fn walk_log_root_blocks(&mut self, log_root_la: u64) -> io::Result<Vec<u64>>;

    /// Walk the tree-root's file-extent records that back on-disk
    /// free-space caches, returning the `(la, len)` data extents to dump.
    fn free_space_cache_data_extents(&mut self) -> io::Result<Vec<(u64, u64)>>;

    /// Whether this reader can fall back to the legacy (`EXTENT_TREE_V0`)
    /// back-reference scan for undersized extent-item records.
    fn supports_legacy_extent_ref(&self) -> bool {
        false
    }

    /// Legacy back-reference walk; only called when
    /// `supports_legacy_extent_ref()` is true.
    fn legacy_extent_ref_scan(&mut self) -> io::Result<Vec<(u64, u64)>> {
        Ok(Vec::new())
    }
}
