//! Payload compression — the `Codec` trait shape carried over from the
//! archive format this crate grew out of, narrowed to the two discriminants
//! the wire format actually defines: `COMPRESS_NONE` and `COMPRESS_ZLIB`.
//!
//! Unlike a general-purpose archive, cluster payloads don't negotiate a
//! codec per item — the cluster header's single `compress` byte applies to
//! every item in that cluster.

use std::io::{self, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::wire::{COMPRESS_NONE, COMPRESS_ZLIB};

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("unknown compress discriminant {0}")]
    UnknownDiscriminant(u8),
    #[error("codec I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A payload transform keyed by the wire format's one-byte discriminant.
pub trait Codec: Send + Sync {
    fn discriminant(&self) -> u8;
    fn compress(&self, raw: &[u8]) -> io::Result<Vec<u8>>;
    fn decompress(&self, payload: &[u8]) -> io::Result<Vec<u8>>;
}

pub struct NoneCodec;

impl Codec for NoneCodec {
    fn discriminant(&self) -> u8 {
        COMPRESS_NONE
    }

    fn compress(&self, raw: &[u8]) -> io::Result<Vec<u8>> {
        Ok(raw.to_vec())
    }

    fn decompress(&self, payload: &[u8]) -> io::Result<Vec<u8>> {
        Ok(payload.to_vec())
    }
}

pub struct ZlibCodec {
    level: Compression,
}

impl ZlibCodec {
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Codec for ZlibCodec {
    fn discriminant(&self) -> u8 {
        COMPRESS_ZLIB
    }

    fn compress(&self, raw: &[u8]) -> io::Result<Vec<u8>> {
        let mut enc = ZlibEncoder::new(Vec::new(), self.level);
        enc.write_all(raw)?;
        enc.finish()
    }

    fn decompress(&self, payload: &[u8]) -> io::Result<Vec<u8>> {
        let mut dec = ZlibDecoder::new(payload);
        let mut out = Vec::new();
        dec.read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Resolve a wire-format discriminant byte to its codec.
pub fn codec_for(discriminant: u8) -> Result<Box<dyn Codec>, CodecError> {
    match discriminant {
        COMPRESS_NONE => Ok(Box::new(NoneCodec)),
        COMPRESS_ZLIB => Ok(Box::new(ZlibCodec::new(6))),
        other => Err(CodecError::UnknownDiscriminant(other)),
    }
}
