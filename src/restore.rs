//! Restorer driver (spec.md §4.6): reads the cluster stream, decompresses
//! items through the worker pool, and writes each payload at its recorded
//! logical address in the target file, applying super-block and chunk-tree
//! fixup along the way.

use std::fs::File;
use std::io::{self, Read};
use std::sync::{Arc, Condvar, Mutex};

#[cfg(unix)]
use std::os::unix::fs::FileExt;

use log::{info, warn};

use crate::btrfs_format;
use crate::codec::{codec_for, CodecError};
use crate::fixup::{self, FixupError, RestoreDescriptor};
use crate::wire::{ClusterHeader, WireError, BLOCK_SIZE, COMPRESS_NONE};
use crate::workpool::WorkerPool;

#[derive(thiserror::Error, Debug)]
pub enum RestoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("wire framing error: {0}")]
    Wire(#[from] WireError),
    #[error("fixup error: {0}")]
    Fixup(#[from] FixupError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("item at LA {la:#x} failed: {message}")]
    ItemFailed { la: u64, message: String },
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Use `update_super_old` and skip chunk-tree fixup entirely.
    pub old_restore: bool,
    pub worker_count: usize,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            old_restore: false,
            worker_count: 1,
        }
    }
}

/// State of the shared [`DescriptorGate`]: pending until the super-block
/// item is processed, then either `Ready` with the derived descriptor or
/// permanently `Failed` if that processing errored.
#[derive(Clone)]
enum GateState {
    Pending,
    Ready(RestoreDescriptor),
    Failed(String),
}

/// Gates every non-super item until the restore descriptor — derived from
/// the stream's first super-block item — has been populated (spec.md
/// §4.6 / §5: "super-block fixup happens-before any non-super item's
/// fixup in the same or later clusters").
///
/// A super-block processing failure must also unblock every waiter, with
/// an error, rather than leave them parked forever: a poisoned gate that
/// only supports `Ready` would let one bad super-block hang every other
/// worker's `wait()` and, in turn, `WorkerPool::shutdown`'s join.
struct DescriptorGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl DescriptorGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Pending),
            cond: Condvar::new(),
        }
    }

    fn set(&self, desc: RestoreDescriptor) {
        let mut st = self.state.lock().unwrap();
        if matches!(*st, GateState::Pending) {
            *st = GateState::Ready(desc);
            self.cond.notify_all();
        }
    }

    /// Poison the gate so every current and future waiter gets `message`
    /// instead of blocking. A no-op once the gate already settled.
    fn fail(&self, message: String) {
        let mut st = self.state.lock().unwrap();
        if matches!(*st, GateState::Pending) {
            *st = GateState::Failed(message);
            self.cond.notify_all();
        }
    }

    fn wait(&self) -> Result<RestoreDescriptor, String> {
        let mut st = self.state.lock().unwrap();
        loop {
            match &*st {
                GateState::Pending => st = self.cond.wait(st).unwrap(),
                GateState::Ready(desc) => return Ok(desc.clone()),
                GateState::Failed(message) => return Err(message.clone()),
            }
        }
    }
}

struct RestoreWorkItem {
    la: u64,
    compress: u8,
    payload: Vec<u8>,
}

pub struct Restorer;

impl Restorer {
    /// Restore `input`'s cluster stream into `target`, a file already
    /// opened for writing (and, on unix, positioned writes).
    pub fn run(input: &mut dyn Read, target: File, opts: &RestoreOptions) -> Result<(), RestoreError> {
        let target = Arc::new(target);
        let gate = Arc::new(DescriptorGate::new());
        let old_restore = opts.old_restore;
        let worker_count = opts.worker_count.max(1);

        // The pool is spun up lazily, on the first cluster that actually
        // declares compression. A stream whose clusters are all
        // `COMPRESS_NONE` never needs one: every item is fixed up and
        // written synchronously on this thread (spec.md §4's "N == 0 means
        // the driver runs the transform synchronously... without spawning
        // any worker").
        let mut pool: Option<WorkerPool<RestoreWorkItem, Result<(), String>>> = None;

        let mut stream_offset = 0u64;
        let mut total_items = 0u64;

        loop {
            let header = match read_cluster_header(input, stream_offset)? {
                Some(h) => h,
                None => break,
            };

            let mut payloads = Vec::with_capacity(header.items.len());
            for item in &header.items {
                let mut payload = vec![0u8; item.size as usize];
                input.read_exact(&mut payload)?;
                payloads.push(payload);
            }

            let total_payload: u64 = header.items.iter().map(|i| i.size as u64).sum();
            let written = BLOCK_SIZE as u64 + total_payload;
            let pad = (BLOCK_SIZE as u64 - (written % BLOCK_SIZE as u64)) % BLOCK_SIZE as u64;
            skip_bytes(input, pad)?;
            stream_offset += written + pad;
            total_items += header.items.len() as u64;

            if header.compress == COMPRESS_NONE {
                for (item, payload) in header.items.iter().zip(payloads) {
                    let work = RestoreWorkItem {
                        la: item.bytenr,
                        compress: header.compress,
                        payload,
                    };
                    if let Err(message) = restore_one_item(work, &gate, &target, old_restore) {
                        warn!("restore: item at LA {:#x} failed: {message}", item.bytenr);
                        if let Some(pool) = pool.take() {
                            pool.shutdown();
                        }
                        return Err(RestoreError::ItemFailed {
                            la: item.bytenr,
                            message,
                        });
                    }
                }
                continue;
            }

            if pool.is_none() {
                let gate = Arc::clone(&gate);
                let target = Arc::clone(&target);
                pool = Some(WorkerPool::new(worker_count, false, move |item: RestoreWorkItem| {
                    restore_one_item(item, &gate, &target, old_restore)
                }));
            }
            let pool_ref = pool.as_ref().expect("just initialized above");

            let mut seqs = Vec::with_capacity(header.items.len());
            for (item, payload) in header.items.iter().zip(payloads) {
                seqs.push(pool_ref.submit(RestoreWorkItem {
                    la: item.bytenr,
                    compress: header.compress,
                    payload,
                }));
            }

            // Back-pressure: drain every item of this cluster, in submission
            // order, before reading the next one.
            for (seq, item) in seqs.into_iter().zip(&header.items) {
                if let Err(message) = pool_ref.take_in_order(seq) {
                    warn!("restore: item at LA {:#x} failed: {message}", item.bytenr);
                    if let Some(p) = pool.take() {
                        p.shutdown();
                    }
                    return Err(RestoreError::ItemFailed {
                        la: item.bytenr,
                        message,
                    });
                }
            }
        }

        if let Some(pool) = pool {
            pool.shutdown();
        }
        info!("restore: completed, {total_items} items written");
        Ok(())
    }
}

fn read_cluster_header(input: &mut dyn Read, expected_offset: u64) -> Result<Option<ClusterHeader>, RestoreError> {
    let mut buf = [0u8; BLOCK_SIZE];
    let mut filled = 0usize;
    loop {
        let n = input.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(RestoreError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated cluster header",
            )));
        }
        filled += n;
        if filled == BLOCK_SIZE {
            return Ok(Some(ClusterHeader::parse(&buf, expected_offset)?));
        }
    }
}

fn skip_bytes(input: &mut dyn Read, mut n: u64) -> io::Result<()> {
    let mut scratch = [0u8; 512];
    while n > 0 {
        let take = n.min(scratch.len() as u64) as usize;
        input.read_exact(&mut scratch[..take])?;
        n -= take as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn restore_one_item(
    item: RestoreWorkItem,
    gate: &DescriptorGate,
    target: &File,
    old_restore: bool,
) -> Result<(), String> {
    let codec = codec_for(item.compress).map_err(|e| e.to_string())?;
    let mut buf = codec.decompress(&item.payload).map_err(|e| e.to_string())?;

    if item.la == btrfs_format::SUPER_OFFSET {
        let outcome = (|| -> Result<RestoreDescriptor, String> {
            let desc = RestoreDescriptor::from_super_block(&buf).map_err(|e| e.to_string())?;
            if old_restore {
                fixup::update_super_old(&mut buf, &desc).map_err(|e| e.to_string())?;
            } else {
                fixup::update_super(&mut buf, &desc).map_err(|e| e.to_string())?;
            }
            target.write_at(&buf, item.la).map_err(|e| e.to_string())?;
            let target_len = target.metadata().map(|m| m.len()).unwrap_or(0);
            fixup::write_backup_supers(target, &buf, target_len).map_err(|e| e.to_string())?;
            Ok(desc)
        })();

        // Whatever happens, every other waiter must be unblocked: a
        // successful descriptor lets them proceed, a failure must not
        // leave them parked in `gate.wait()` forever.
        return match outcome {
            Ok(desc) => {
                gate.set(desc);
                Ok(())
            }
            Err(message) => {
                gate.fail(message.clone());
                Err(message)
            }
        };
    }

    let desc = gate.wait()?;
    if !old_restore {
        fixup::fixup_chunk_tree_leaf(&mut buf, &desc).map_err(|e| e.to_string())?;
    }
    target.write_at(&buf, item.la).map_err(|e| e.to_string())?;
    Ok(())
}

#[cfg(not(unix))]
fn restore_one_item(_item: RestoreWorkItem, _gate: &DescriptorGate, _target: &File, _old_restore: bool) -> Result<(), String> {
    Err("positioned writes require a unix target".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_gate_unblocks_waiters_once_set() {
        use std::thread;
        use std::time::Duration;

        let gate = Arc::new(DescriptorGate::new());
        let gate2 = Arc::clone(&gate);
        let handle = thread::spawn(move || gate2.wait());

        thread::sleep(Duration::from_millis(20));
        gate.set(RestoreDescriptor {
            node_size: 4096,
            fsid: [1u8; 16],
            device_id: 1,
            device_uuid: [2u8; 16],
        });

        let desc = handle.join().unwrap().unwrap();
        assert_eq!(desc.node_size, 4096);
    }

    #[test]
    fn descriptor_gate_unblocks_waiters_with_an_error_when_poisoned() {
        use std::thread;
        use std::time::Duration;

        let gate = Arc::new(DescriptorGate::new());
        let gate2 = Arc::clone(&gate);
        let handle = thread::spawn(move || gate2.wait());

        thread::sleep(Duration::from_millis(20));
        gate.fail("super-block fixup failed".to_string());

        let result = handle.join().unwrap();
        assert_eq!(result, Err("super-block fixup failed".to_string()));
    }

    #[test]
    fn descriptor_gate_fail_does_not_override_an_already_ready_gate() {
        let gate = DescriptorGate::new();
        gate.set(RestoreDescriptor {
            node_size: 4096,
            fsid: [1u8; 16],
            device_id: 1,
            device_uuid: [2u8; 16],
        });
        gate.fail("too late".to_string());
        assert_eq!(gate.wait().unwrap().node_size, 4096);
    }
}
