//! # btrfsdump — metadata dump/restore engine for a copy-on-write B-tree filesystem
//!
//! Format guarantees:
//! - All numeric fields in the wire format are little-endian, fixed-width
//! - Every cluster header carries a magic and a self-reported stream offset;
//!   restore rejects a cluster whose offset doesn't match the reader's
//!   running position
//! - Masked metadata blocks are self-checksumming: bytes `[0, 4)` hold a
//!   CRC32C of bytes `[32, len)`, recomputed after every mask or fixup pass
//! - Restore output always has single-device, single-stripe chunk geometry,
//!   regardless of the source filesystem's RAID layout

pub mod btrfs_format;
pub mod coalesce;
pub mod codec;
pub mod dump;
pub mod fixup;
pub mod fsreader;
pub mod mask;
pub mod report;
pub mod restore;
pub mod wire;
pub mod workpool;

pub use coalesce::{CoalescedRun, Coalescer, MAX_PENDING_SIZE};
pub use dump::{DumpError, DumpOptions, Dumper};
pub use fixup::{FixupError, RestoreDescriptor};
pub use fsreader::{BlockKind, FsReader};
pub use mask::{mask_block, MaskError, MaskedBlock};
pub use report::{DumpReport, RestoreReport};
pub use restore::{RestoreError, RestoreOptions, Restorer};
pub use wire::{ClusterHeader, ItemDescriptor, WireError, BLOCK_SIZE, HEADER_MAGIC, ITEMS_PER_CLUSTER};
