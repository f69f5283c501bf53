//! Blocks: compressed batches of events with filtering metadata.
//!
//! On disk each block is a 32-byte header followed by the gzip payload:
//! `[block-id i32][uncompressed-len i32][compressed-len i32]
//!  [ts-min i64][ts-max i64][event-count i32]`, all little-endian.

use std::collections::BTreeSet;
use std::io::{Read, Write};

use bytes::{Buf, BufMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SpectreError};
use crate::model::{Event, UnixNanos};
use crate::storage::bloom::BloomFilter;
use crate::storage::codec;

pub const BLOCK_HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 8 + 4;

/// Gzip level for block payloads; algorithm id 0 in the file header.
pub const COMPRESSION_LEVEL: u32 = 6;

/// Expected per-block cardinalities used to size the Bloom filters.
const EXPECTED_KINDS: usize = 1000;
const EXPECTED_NAMESPACES: usize = 100;
const EXPECTED_GROUPS: usize = 100;
/// Target per-filter false-positive rate.
const BLOOM_FP_RATE: f64 = 0.05;

/// Per-block metadata, persisted in the file's index section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMeta {
    pub id: u32,
    /// File offset of the block header.
    pub offset: u64,
    pub uncompressed_len: u32,
    pub compressed_len: u32,
    pub ts_min: UnixNanos,
    pub ts_max: UnixNanos,
    pub event_count: u32,
    pub kinds: BTreeSet<String>,
    pub namespaces: BTreeSet<String>,
    pub groups: BTreeSet<String>,
    pub kind_filter: BloomFilter,
    pub namespace_filter: BloomFilter,
    pub group_filter: BloomFilter,
}

impl BlockMeta {
    /// Fast membership check across the three Bloom dimensions. A `false`
    /// from any provided filter rules the block out for good.
    pub fn may_match(&self, kind: Option<&str>, namespace: Option<&str>, group: Option<&str>) -> bool {
        if let Some(k) = kind {
            if !self.kind_filter.contains(k) {
                return false;
            }
        }
        if let Some(ns) = namespace {
            if !self.namespace_filter.contains(ns) {
                return false;
            }
        }
        if let Some(g) = group {
            if !self.group_filter.contains(g) {
                return false;
            }
        }
        true
    }
}

/// A sealed block ready to be appended to the file.
pub struct SealedBlock {
    pub meta: BlockMeta,
    pub compressed: Vec<u8>,
}

impl SealedBlock {
    /// Header + compressed payload bytes as laid out on disk.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOCK_HEADER_SIZE + self.compressed.len());
        out.put_i32_le(self.meta.id as i32);
        out.put_i32_le(self.meta.uncompressed_len as i32);
        out.put_i32_le(self.meta.compressed_len as i32);
        out.put_i64_le(self.meta.ts_min);
        out.put_i64_le(self.meta.ts_max);
        out.put_i32_le(self.meta.event_count as i32);
        out.extend_from_slice(&self.compressed);
        out
    }
}

/// Raw block header fields, as read back from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub id: u32,
    pub uncompressed_len: u32,
    pub compressed_len: u32,
    pub ts_min: UnixNanos,
    pub ts_max: UnixNanos,
    pub event_count: u32,
}

impl BlockHeader {
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < BLOCK_HEADER_SIZE {
            return Err(SpectreError::Corruption("truncated block header".into()));
        }
        let id = buf.get_i32_le();
        let uncompressed_len = buf.get_i32_le();
        let compressed_len = buf.get_i32_le();
        let ts_min = buf.get_i64_le();
        let ts_max = buf.get_i64_le();
        let event_count = buf.get_i32_le();
        if id < 0 || uncompressed_len < 0 || compressed_len < 0 || event_count < 0 {
            return Err(SpectreError::Corruption(
                "negative field in block header".into(),
            ));
        }
        if ts_min > ts_max {
            return Err(SpectreError::Corruption(format!(
                "block ts_min {ts_min} exceeds ts_max {ts_max}"
            )));
        }
        Ok(Self {
            id: id as u32,
            uncompressed_len: uncompressed_len as u32,
            compressed_len: compressed_len as u32,
            ts_min,
            ts_max,
            event_count: event_count as u32,
        })
    }
}

/// Accumulates events until the uncompressed payload crosses the target
/// size, then seals into a compressed block with computed metadata.
pub struct BlockBuilder {
    encoded: Vec<u8>,
    events: Vec<Event>,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self {
            encoded: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn uncompressed_len(&self) -> usize {
        self.encoded.len()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Appends one event in insertion order.
    pub fn push(&mut self, event: Event) -> Result<()> {
        codec::append_framed(&mut self.encoded, &event)?;
        self.events.push(event);
        Ok(())
    }

    /// Seals the buffer into a block, returning the sealed bytes and the
    /// events they contain. The builder is left empty.
    pub fn seal(&mut self, id: u32, offset: u64) -> Result<(SealedBlock, Vec<Event>)> {
        if self.events.is_empty() {
            return Err(SpectreError::Internal("sealing an empty block".into()));
        }
        let mut kinds = BTreeSet::new();
        let mut namespaces = BTreeSet::new();
        let mut groups = BTreeSet::new();
        let mut ts_min = i64::MAX;
        let mut ts_max = i64::MIN;
        let mut kind_filter = BloomFilter::with_capacity(EXPECTED_KINDS, BLOOM_FP_RATE);
        let mut namespace_filter = BloomFilter::with_capacity(EXPECTED_NAMESPACES, BLOOM_FP_RATE);
        let mut group_filter = BloomFilter::with_capacity(EXPECTED_GROUPS, BLOOM_FP_RATE);
        for event in &self.events {
            ts_min = ts_min.min(event.timestamp);
            ts_max = ts_max.max(event.timestamp);
            kind_filter.insert(&event.resource.kind);
            namespace_filter.insert(&event.resource.namespace);
            group_filter.insert(&event.resource.group);
            kinds.insert(event.resource.kind.clone());
            namespaces.insert(event.resource.namespace.clone());
            groups.insert(event.resource.group.clone());
        }

        let compressed = compress(&self.encoded)?;
        let meta = BlockMeta {
            id,
            offset,
            uncompressed_len: self.encoded.len() as u32,
            compressed_len: compressed.len() as u32,
            ts_min,
            ts_max,
            event_count: self.events.len() as u32,
            kinds,
            namespaces,
            groups,
            kind_filter,
            namespace_filter,
            group_filter,
        };
        self.encoded.clear();
        let events = std::mem::take(&mut self.events);
        Ok((SealedBlock { meta, compressed }, events))
    }
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn compress(raw: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(COMPRESSION_LEVEL));
    encoder.write_all(raw)?;
    Ok(encoder.finish()?)
}

pub fn decompress(compressed: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_len);
    GzDecoder::new(compressed)
        .read_to_end(&mut out)
        .map_err(|err| SpectreError::Corruption(format!("block decompression failed: {err}")))?;
    if out.len() != expected_len {
        return Err(SpectreError::Corruption(format!(
            "block decompressed to {} bytes, header says {expected_len}",
            out.len()
        )));
    }
    Ok(out)
}

/// Decompresses a sealed block payload and decodes its events.
pub fn read_events(meta: &BlockMeta, compressed: &[u8]) -> Result<Vec<Event>> {
    let raw = decompress(compressed, meta.uncompressed_len as usize)?;
    codec::decode_framed(&raw)
}
