//! Cluster framing — the on-disk stream format.
//!
//! # On-disk layout
//!
//! ```text
//! <cluster>+
//!
//! <cluster>      = <header_block:1024> <payload>* <zero_pad>
//! <header_block> = magic(8) bytenr(8) nritems(4) compress(1)
//!                  item_descriptor[nritems] zero_fill_to(1024)
//! <item_descriptor> = bytenr(8) size(4)
//! ```
//!
//! Every numeric field is little-endian. `bytenr` in the cluster header is
//! the byte offset of the header block itself, measured from the start of
//! the stream; a reader must reject a cluster whose recorded `bytenr` does
//! not match its running offset (§8 invariant 1).
//!
//! `compress` is a single byte: `COMPRESS_NONE` or `COMPRESS_ZLIB`. There is
//! no codec negotiation — a cluster either carries zlib payloads or it
//! doesn't, for its entire lifetime.

use std::io::{self, Read, Write};

use crc32fast::Hasher as Crc32Hasher;

/// Frozen magic identifying every cluster header. Never renegotiated.
pub const HEADER_MAGIC: u64 = 0xbd5c_25e2_7295_668b;

/// Size, in bytes, of the region occupied by a cluster header + its item
/// index. Payloads begin immediately after this many bytes.
pub const BLOCK_SIZE: usize = 1024;

/// Mask for rounding a byte count down to the nearest `BLOCK_SIZE` boundary.
pub const BLOCK_MASK: usize = BLOCK_SIZE - 1;

/// No compression; payload stored verbatim.
pub const COMPRESS_NONE: u8 = 0;
/// Zlib-compressed payload (via `flate2`).
pub const COMPRESS_ZLIB: u8 = 1;

/// Fixed byte size of the fields preceding the item descriptor array:
/// magic(8) + bytenr(8) + nritems(4) + compress(1).
const CLUSTER_HEADER_FIXED_SIZE: usize = 8 + 8 + 4 + 1;

/// On-disk size of one item descriptor: bytenr(8) + size(4).
const ITEM_DESCRIPTOR_SIZE: usize = 8 + 4;

/// Maximum number of item descriptors that fit in one `BLOCK_SIZE` header
/// block alongside the fixed header fields.
pub const ITEMS_PER_CLUSTER: usize =
    (BLOCK_SIZE - CLUSTER_HEADER_FIXED_SIZE) / ITEM_DESCRIPTOR_SIZE;

#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("Bad cluster magic: expected {HEADER_MAGIC:#018x}, got {0:#018x}")]
    BadMagic(u64),
    #[error("Cluster bytenr mismatch: header says {header}, stream is at {expected}")]
    BytenrMismatch { header: u64, expected: u64 },
    #[error("Cluster declares {0} items, more than ITEMS_PER_CLUSTER ({ITEMS_PER_CLUSTER})")]
    TooManyItems(u32),
    #[error("Unknown compress byte {0}")]
    BadCompressFlag(u8),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One item's location and on-disk payload size within a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemDescriptor {
    /// Logical address of the block(s) this item represents.
    pub bytenr: u64,
    /// On-disk payload size, in bytes, as stored (post-compression).
    pub size: u32,
}

/// Parsed cluster header: everything needed to locate and validate its
/// payload region, before any payload byte is read.
#[derive(Debug, Clone)]
pub struct ClusterHeader {
    pub bytenr: u64,
    pub compress: u8,
    pub items: Vec<ItemDescriptor>,
}

impl ClusterHeader {
    pub fn is_compressed(&self) -> bool {
        self.compress != COMPRESS_NONE
    }

    /// Total on-disk payload bytes across every item in this cluster.
    pub fn payload_len(&self) -> u64 {
        self.items.iter().map(|i| i.size as u64).sum()
    }

    /// Write the header block, padded with zeros to exactly `BLOCK_SIZE`.
    pub fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        let mut pos = 0usize;

        buf[pos..pos + 8].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
        pos += 8;
        buf[pos..pos + 8].copy_from_slice(&self.bytenr.to_le_bytes());
        pos += 8;
        buf[pos..pos + 4].copy_from_slice(&(self.items.len() as u32).to_le_bytes());
        pos += 4;
        buf[pos] = self.compress;
        pos += 1;

        for item in &self.items {
            buf[pos..pos + 8].copy_from_slice(&item.bytenr.to_le_bytes());
            pos += 8;
            buf[pos..pos + 4].copy_from_slice(&item.size.to_le_bytes());
            pos += 4;
        }

        // Remaining bytes in `buf` are already zero — this is the padding
        // to BLOCK_SIZE that the wire format requires.
        w.write_all(&buf)
    }

    /// Read and validate a header block. `expected_offset` is the reader's
    /// running stream position; a mismatch against the stored `bytenr` is
    /// a fatal framing error (§8 invariant 1).
    pub fn read<R: Read>(mut r: R, expected_offset: u64) -> Result<Self, WireError> {
        let mut buf = [0u8; BLOCK_SIZE];
        r.read_exact(&mut buf)?;
        Self::parse(&buf, expected_offset)
    }

    /// Validate an already-read header block's bytes.
    pub fn parse(buf: &[u8; BLOCK_SIZE], expected_offset: u64) -> Result<Self, WireError> {
        let magic = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        if magic != HEADER_MAGIC {
            return Err(WireError::BadMagic(magic));
        }

        let bytenr = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        if bytenr != expected_offset {
            return Err(WireError::BytenrMismatch {
                header: bytenr,
                expected: expected_offset,
            });
        }

        let nritems = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        if nritems as usize > ITEMS_PER_CLUSTER {
            return Err(WireError::TooManyItems(nritems));
        }

        let compress = buf[20];
        if compress != COMPRESS_NONE && compress != COMPRESS_ZLIB {
            return Err(WireError::BadCompressFlag(compress));
        }

        let mut items = Vec::with_capacity(nritems as usize);
        let mut pos = CLUSTER_HEADER_FIXED_SIZE;
        for _ in 0..nritems {
            let item_bytenr = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            pos += 8;
            let size = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
            pos += 4;
            items.push(ItemDescriptor {
                bytenr: item_bytenr,
                size,
            });
        }

        Ok(Self {
            bytenr,
            compress,
            items,
        })
    }
}

/// Write one complete cluster: header block, then payloads back-to-back in
/// submission order, then zero-padding to the next `BLOCK_SIZE` boundary.
pub fn write_cluster<W: Write>(
    mut w: W,
    bytenr: u64,
    compress: u8,
    items: &[ItemDescriptor],
    payloads: &[Vec<u8>],
) -> io::Result<()> {
    assert_eq!(items.len(), payloads.len());

    let header = ClusterHeader {
        bytenr,
        compress,
        items: items.to_vec(),
    };
    header.write(&mut w)?;

    let mut total_payload = 0usize;
    for payload in payloads {
        w.write_all(payload)?;
        total_payload += payload.len();
    }

    let written = BLOCK_SIZE + total_payload;
    let pad = (BLOCK_SIZE - (written & BLOCK_MASK)) & BLOCK_MASK;
    if pad > 0 {
        w.write_all(&vec![0u8; pad])?;
    }
    Ok(())
}

/// Seeded CRC32C (CRC32, Castagnoli polynomial via `crc32fast`) of `data`,
/// matching the filesystem's own checksum routine. `seed` is XORed into the
/// running state the way the CRC helper tool (§6) expects — the canonical
/// filesystem seed is `!1` (`0xFFFF_FFFE`).
pub fn crc32c_seeded(data: &[u8], seed: u32) -> u32 {
    let mut h = Crc32Hasher::new_with_initial(seed);
    h.update(data);
    h.finalize()
}
