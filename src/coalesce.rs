//! Block coalescer — merges contiguous same-kind block ranges into runs.
//!
//! The dump driver discovers metadata blocks and data extents one at a
//! time, in logical-address order, but writing one cluster item per block
//! would waste item-descriptor slots on runs the filesystem already laid
//! out contiguously. The coalescer accepts `(start, size, kind)` triples
//! and keeps a single pending run, flushing it to the caller whenever:
//!
//! - the next range is not adjacent to the pending run (a gap), or
//! - the next range's kind (metadata vs. data) differs from the pending
//!   run's kind, or
//! - appending would grow the pending run past `MAX_PENDING_SIZE`.
//!
//! Flushing materializes the run's bytes: metadata runs are read block by
//! block and masked (`crate::mask`); data runs are read verbatim through
//! the logical→physical mapping. Read-ahead on the *next* range is
//! requested once the pending run grows, but is advisory only — a
//! `FsReader` that ignores it must still produce identical output.

use std::io;

use crate::fsreader::{BlockKind, FsReader};
use crate::mask;

/// Largest run the coalescer will accumulate before forcing a flush.
pub const MAX_PENDING_SIZE: u64 = 256 * 1024;

/// A materialized, ready-to-submit run of contiguous same-kind bytes.
#[derive(Debug, Clone)]
pub struct CoalescedRun {
    pub start: u64,
    pub kind: BlockKind,
    pub data: Vec<u8>,
}

struct Pending {
    start: u64,
    size: u64,
    kind: BlockKind,
}

pub struct Coalescer<'a, F: FsReader + ?Sized> {
    fs: &'a mut F,
    pending: Option<Pending>,
}

impl<'a, F: FsReader + ?Sized> Coalescer<'a, F> {
    pub fn new(fs: &'a mut F) -> Self {
        Self { fs, pending: None }
    }

    /// Offer one more `(start, size, kind)` range, in ascending logical
    /// order. Returns a flushed run if the incoming range could not be
    /// merged into the one being accumulated.
    pub fn add(&mut self, start: u64, size: u64, kind: BlockKind) -> io::Result<Option<CoalescedRun>> {
        let mut flushed = None;

        let merges = match &self.pending {
            Some(p) => {
                p.kind == kind
                    && p.start + p.size == start
                    && p.size + size <= MAX_PENDING_SIZE
            }
            None => false,
        };

        if !merges {
            flushed = self.flush()?;
            self.pending = Some(Pending { start, size, kind });
        } else if let Some(p) = &mut self.pending {
            p.size += size;
        }

        self.fs.request_readahead(start, size as usize);
        Ok(flushed)
    }

    /// Materialize and clear the pending run, if any.
    pub fn flush(&mut self) -> io::Result<Option<CoalescedRun>> {
        let Some(p) = self.pending.take() else {
            return Ok(None);
        };

        let data = match p.kind {
            BlockKind::Metadata => self.materialize_metadata(p.start, p.size)?,
            BlockKind::Data => self.fs.read_data_extent(p.start, p.size as usize)?,
        };

        Ok(Some(CoalescedRun {
            start: p.start,
            kind: p.kind,
            data,
        }))
    }

    fn materialize_metadata(&mut self, start: u64, size: u64) -> io::Result<Vec<u8>> {
        let node_size = self.fs.node_size() as u64;
        let super_offset = self.fs.super_offset();
        let mut out = Vec::with_capacity(size as usize);

        let mut la = start;
        let end = start + size;
        while la < end {
            let raw = self.fs.read_block(la)?;
            let masked = mask::mask_block(&raw, la, super_offset)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            out.extend_from_slice(&masked.bytes);
            la += node_size;
        }

        Ok(out)
    }
}
