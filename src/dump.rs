//! Dumper driver (spec.md §4.5): walks the source filesystem, coalesces
//! and masks its metadata blocks plus any free-space-cache data extents,
//! compresses them through the worker pool, and writes the cluster stream.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::coalesce::{CoalescedRun, Coalescer, MAX_PENDING_SIZE};
use crate::codec::{Codec, ZlibCodec};
use crate::fsreader::{BlockKind, FsReader};
use crate::wire::{self, ItemDescriptor, WireError, BLOCK_SIZE, COMPRESS_NONE, ITEMS_PER_CLUSTER};
use crate::workpool::WorkerPool;

#[derive(thiserror::Error, Debug)]
pub enum DumpError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("wire framing error: {0}")]
    Wire(#[from] WireError),
    #[error("legacy extent-tree-v0 back-reference scan requested but this filesystem reader does not support it")]
    LegacyExtentRefUnsupported,
    #[error("source filesystem inconsistency: {0}")]
    SourceInconsistent(String),
    #[error("compression failed for at least one item: {0}")]
    CodecFailed(String),
}

#[derive(Debug, Clone)]
pub struct DumpOptions {
    /// `None` disables compression; `Some(level)` enables zlib at `level` (0-9).
    pub compression_level: Option<u32>,
    /// Number of worker threads; only meaningful when compression is enabled.
    pub worker_count: usize,
    /// Whether to additionally attempt the legacy extent-tree-v0
    /// back-reference walk for undersized extent-item records.
    pub legacy_extent_ref: bool,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            compression_level: None,
            worker_count: 1,
            legacy_extent_ref: false,
        }
    }
}

enum PayloadSource {
    Direct(Vec<u8>),
    Pooled(u64),
}

struct ClusterWriter<'w, 'p, W: Write> {
    out: &'w mut W,
    stream_offset: u64,
    compress_discriminant: u8,
    pending: Vec<(u64, PayloadSource)>,
    pool: Option<&'p WorkerPool<Vec<u8>, Vec<u8>>>,
}

impl<'w, 'p, W: Write> ClusterWriter<'w, 'p, W> {
    fn push(&mut self, la: u64, raw: Vec<u8>) -> Result<(), DumpError> {
        let source = match self.pool {
            Some(pool) => PayloadSource::Pooled(pool.submit(raw)),
            None => PayloadSource::Direct(raw),
        };
        self.pending.push((la, source));
        if self.pending.len() >= ITEMS_PER_CLUSTER {
            self.flush_cluster()?;
        }
        Ok(())
    }

    fn flush_cluster(&mut self) -> Result<(), DumpError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut items = Vec::with_capacity(self.pending.len());
        let mut payloads = Vec::with_capacity(self.pending.len());
        for (la, source) in self.pending.drain(..) {
            let payload = match source {
                PayloadSource::Direct(b) => b,
                PayloadSource::Pooled(seq) => self.pool.expect("pooled source implies a pool").take_in_order(seq),
            };
            items.push(ItemDescriptor {
                bytenr: la,
                size: payload.len() as u32,
            });
            payloads.push(payload);
        }

        wire::write_cluster(
            &mut *self.out,
            self.stream_offset,
            self.compress_discriminant,
            &items,
            &payloads,
        )?;

        let total_payload: usize = payloads.iter().map(Vec::len).sum();
        let written = BLOCK_SIZE + total_payload;
        let padded = written + ((BLOCK_SIZE - (written % BLOCK_SIZE)) % BLOCK_SIZE);
        self.stream_offset += padded as u64;
        Ok(())
    }
}

pub struct Dumper;

impl Dumper {
    /// Run a full dump: walk `fs`, write the cluster stream to `out`.
    /// A failure partway through is reported, but whatever was already
    /// coalesced is still flushed so the stream remains well-formed up to
    /// the point of failure (spec.md §4.5).
    pub fn run(fs: &mut dyn FsReader, out: &mut dyn Write, opts: &DumpOptions) -> Result<(), DumpError> {
        let node_size = fs.node_size() as u64;
        let super_offset = fs.super_offset();

        let mut first_err: Option<DumpError> = None;

        // The super-block is read through its own dedicated accessor, not
        // the node-size-keyed coalescer path: `read_block`/`materialize_metadata`
        // stride by `node_size`, which is only coincidentally 4 KiB — routing
        // the (always exactly `SUPER_INFO_SIZE`-byte) super-block through that
        // path would record the wrong payload length whenever node_size differs.
        let super_bytes = match fs.super_block_bytes() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("dump: failed to read super-block: {e}");
                first_err = Some(DumpError::Io(e));
                None
            }
        };

        let mut ranges: Vec<(u64, u64, BlockKind)> = Vec::new();
        if let Err(e) = Self::collect_ranges(fs, opts, node_size, &mut ranges) {
            warn!("dump: stopping range collection early: {e}");
            first_err.get_or_insert(e);
        }

        let codec = opts.compression_level.map(ZlibCodec::new);
        let compress_discriminant = codec.as_ref().map(Codec::discriminant).unwrap_or(COMPRESS_NONE);

        let codec_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let pool = codec.map(|codec| {
            let codec = Arc::new(codec);
            let codec_error = Arc::clone(&codec_error);
            WorkerPool::new(opts.worker_count.max(1), false, move |raw: Vec<u8>| match codec.compress(&raw) {
                Ok(compressed) => compressed,
                Err(e) => {
                    let mut slot = codec_error.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(e.to_string());
                    }
                    raw
                }
            })
        });

        let mut writer = ClusterWriter {
            out,
            stream_offset: 0,
            compress_discriminant,
            pending: Vec::new(),
            pool: pool.as_ref(),
        };

        if let Some(bytes) = super_bytes {
            if let Err(e) = writer.push(super_offset, bytes) {
                first_err.get_or_insert(e);
            }
        }

        let mut coalescer = Coalescer::new(fs);
        for (start, size, kind) in ranges {
            match coalescer.add(start, size, kind) {
                Ok(Some(run)) => Self::dispatch(&mut writer, run)?,
                Ok(None) => {}
                Err(e) => {
                    warn!("dump: coalescer add failed: {e}");
                    first_err.get_or_insert(DumpError::Io(e));
                    break;
                }
            }
        }

        match coalescer.flush() {
            Ok(Some(run)) => Self::dispatch(&mut writer, run)?,
            Ok(None) => {}
            Err(e) => {
                first_err.get_or_insert(DumpError::Io(e));
            }
        }

        writer.flush_cluster()?;
        if let Some(pool) = pool {
            pool.shutdown();
        }

        if first_err.is_none() {
            if let Some(msg) = codec_error.lock().unwrap().take() {
                first_err = Some(DumpError::CodecFailed(msg));
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                info!("dump: completed, wrote {} bytes", writer.stream_offset);
                Ok(())
            }
        }
    }

    fn collect_ranges(
        fs: &mut dyn FsReader,
        opts: &DumpOptions,
        node_size: u64,
        ranges: &mut Vec<(u64, u64, BlockKind)>,
    ) -> Result<(), DumpError> {
        for (la, len) in fs.extent_tree_metadata_ranges()? {
            ranges.push((la, len, BlockKind::Metadata));
        }

        if opts.legacy_extent_ref {
            if fs.supports_legacy_extent_ref() {
                for (la, len) in fs.legacy_extent_ref_scan()? {
                    ranges.push((la, len, BlockKind::Metadata));
                }
            } else {
                return Err(DumpError::LegacyExtentRefUnsupported);
            }
        }

        if let Some(log_root_la) = fs.log_root()? {
            let blocks = fs.walk_log_root_blocks(log_root_la)?;
            if blocks.is_empty() {
                return Err(DumpError::SourceInconsistent(
                    "log-root recorded but its subtree is empty or unreachable".into(),
                ));
            }
            for la in blocks {
                ranges.push((la, node_size, BlockKind::Metadata));
            }
        }

        for (la, len) in fs.free_space_cache_data_extents()? {
            ranges.push((la, len, BlockKind::Data));
        }

        Ok(())
    }

    fn dispatch<W: Write>(writer: &mut ClusterWriter<'_, '_, W>, run: CoalescedRun) -> Result<(), DumpError> {
        assert!(run.data.len() as u64 <= MAX_PENDING_SIZE);
        writer.push(run.start, run.data)
    }
}
