//! Hourly event file layout and reader.
//!
//! `[Header][Block…][IndexSection][Footer]`. The header is
//! `[magic "SPTR"][format u16 LE][compression u8][hour epoch i64 LE]`.
//! The index section is `[len u32 LE][JSON object][crc32 u32 LE]`.
//! The footer is `[index offset i64 LE][index len i32 LE][magic "SPTF"]`
//! and is written last; readers seek to the end first.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime, UtcOffset};
use tracing::warn;

use crate::error::{Result, SpectreError};
use crate::k8s;
use crate::model::{Event, FinalState, UnixNanos, NANOS_PER_SECOND};
use crate::storage::block::{self, BlockHeader, BlockMeta, BLOCK_HEADER_SIZE};

pub const FILE_MAGIC: [u8; 4] = *b"SPTR";
pub const FOOTER_MAGIC: [u8; 4] = *b"SPTF";
pub const FORMAT_VERSION: u16 = 1;
pub const COMPRESSION_GZIP: u8 = 0;
pub const HEADER_SIZE: usize = 4 + 2 + 1 + 8;
pub const FOOTER_SIZE: usize = 8 + 4 + 4;
pub const FILE_EXTENSION: &str = "bin";

/// Fixed file header naming the codec and the hour this file owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u16,
    pub compression: u8,
    /// Unix seconds of the hour boundary, in the writer's timezone frame.
    pub hour_epoch: i64,
}

impl FileHeader {
    pub fn new(hour_epoch: i64) -> Self {
        Self {
            version: FORMAT_VERSION,
            compression: COMPRESSION_GZIP,
            hour_epoch,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        {
            let mut buf = &mut out[..];
            buf.put_slice(&FILE_MAGIC);
            buf.put_u16_le(self.version);
            buf.put_u8(self.compression);
            buf.put_i64_le(self.hour_epoch);
        }
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(SpectreError::Corruption("truncated file header".into()));
        }
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != FILE_MAGIC {
            return Err(SpectreError::Corruption(format!(
                "bad file magic {magic:02x?}"
            )));
        }
        let version = buf.get_u16_le();
        if version != FORMAT_VERSION {
            return Err(SpectreError::Corruption(format!(
                "unsupported format version {version}"
            )));
        }
        let compression = buf.get_u8();
        if compression != COMPRESSION_GZIP {
            return Err(SpectreError::Corruption(format!(
                "unsupported compression id {compression}"
            )));
        }
        let hour_epoch = buf.get_i64_le();
        Ok(Self {
            version,
            compression,
            hour_epoch,
        })
    }
}

/// Per-file index: ordered block metadata, the three inverted indexes,
/// and the final-state map carried across hourly rotation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexSection {
    pub blocks: Vec<BlockMeta>,
    pub kind_to_blocks: BTreeMap<String, Vec<u32>>,
    pub namespace_to_blocks: BTreeMap<String, Vec<u32>>,
    pub group_to_blocks: BTreeMap<String, Vec<u32>>,
    pub final_states: BTreeMap<String, FinalState>,
}

impl IndexSection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a sealed block into the inverted indexes and advances the
    /// final-state map for every resource the block touched.
    pub fn observe_sealed(&mut self, meta: BlockMeta, events: &[Event]) {
        for kind in &meta.kinds {
            push_block_id(self.kind_to_blocks.entry(kind.clone()).or_default(), meta.id);
        }
        for ns in &meta.namespaces {
            push_block_id(
                self.namespace_to_blocks.entry(ns.clone()).or_default(),
                meta.id,
            );
        }
        for group in &meta.groups {
            push_block_id(self.group_to_blocks.entry(group.clone()).or_default(), meta.id);
        }
        for event in events {
            self.observe_final_state(event);
        }
        self.blocks.push(meta);
    }

    pub fn observe_final_state(&mut self, event: &Event) {
        let key = event.resource.state_key();
        let entry = FinalState {
            uid: event.resource.uid.clone(),
            group: event.resource.group.clone(),
            version: event.resource.version.clone(),
            timestamp: event.timestamp,
            event_kind: event.kind,
            snapshot: k8s::minimal_snapshot(&event.payload),
        };
        match self.final_states.get(&key) {
            Some(existing) if existing.timestamp > event.timestamp => {}
            _ => {
                self.final_states.insert(key, entry);
            }
        }
    }

    /// Candidate blocks for a filtered query: intersect the inverted
    /// indexes, confirm with Bloom filters, then apply timestamp overlap.
    pub fn candidate_blocks(
        &self,
        kind: Option<&str>,
        namespace: Option<&str>,
        group: Option<&str>,
        start: UnixNanos,
        end: UnixNanos,
    ) -> Vec<&BlockMeta> {
        let mut candidate_ids: Option<Vec<u32>> = None;
        for (value, index) in [
            (kind, &self.kind_to_blocks),
            (namespace, &self.namespace_to_blocks),
            (group, &self.group_to_blocks),
        ] {
            if let Some(value) = value {
                let ids = match index.get(value) {
                    Some(ids) => ids.clone(),
                    None => return Vec::new(),
                };
                candidate_ids = Some(match candidate_ids {
                    None => ids,
                    Some(existing) => intersect_sorted(&existing, &ids),
                });
                if candidate_ids.as_ref().map(Vec::is_empty) == Some(true) {
                    return Vec::new();
                }
            }
        }

        self.blocks
            .iter()
            .filter(|meta| match &candidate_ids {
                Some(ids) => ids.binary_search(&meta.id).is_ok(),
                None => true,
            })
            .filter(|meta| meta.may_match(kind, namespace, group))
            .filter(|meta| meta.ts_min <= end && meta.ts_max >= start)
            .collect()
    }

    /// `[len u32 LE][JSON][crc32 u32 LE]`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(self)?;
        let len: u32 = payload
            .len()
            .try_into()
            .map_err(|_| SpectreError::Internal("index section exceeds u32::MAX".into()))?;
        let mut out = Vec::with_capacity(payload.len() + 8);
        out.put_u32_le(len);
        out.extend_from_slice(&payload);
        out.put_u32_le(crc32fast::hash(&payload));
        Ok(out)
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(SpectreError::Corruption("truncated index section".into()));
        }
        let len = buf.get_u32_le() as usize;
        if buf.len() < len + 4 {
            return Err(SpectreError::Corruption("index section length mismatch".into()));
        }
        let (payload, mut tail) = buf.split_at(len);
        let stored_crc = tail.get_u32_le();
        if crc32fast::hash(payload) != stored_crc {
            return Err(SpectreError::Corruption("index section checksum mismatch".into()));
        }
        serde_json::from_slice(payload)
            .map_err(|err| SpectreError::Corruption(format!("index section parse error: {err}")))
    }
}

fn push_block_id(ids: &mut Vec<u32>, id: u32) {
    if ids.last() != Some(&id) {
        ids.push(id);
    }
}

fn intersect_sorted(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub index_offset: u64,
    pub index_len: u32,
}

impl Footer {
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut out = [0u8; FOOTER_SIZE];
        {
            let mut buf = &mut out[..];
            buf.put_i64_le(self.index_offset as i64);
            buf.put_i32_le(self.index_len as i32);
            buf.put_slice(&FOOTER_MAGIC);
        }
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < FOOTER_SIZE {
            return Err(SpectreError::Corruption("truncated footer".into()));
        }
        let index_offset = buf.get_i64_le();
        let index_len = buf.get_i32_le();
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != FOOTER_MAGIC {
            return Err(SpectreError::Corruption("bad footer magic".into()));
        }
        if index_offset < HEADER_SIZE as i64 || index_len <= 0 {
            return Err(SpectreError::Corruption("footer fields out of range".into()));
        }
        Ok(Self {
            index_offset: index_offset as u64,
            index_len: index_len as u32,
        })
    }
}

/// Read-only accessor over a finalized (or recovered) hourly file.
pub struct FileReader {
    path: PathBuf,
    pub header: FileHeader,
    pub index: IndexSection,
    /// True when the footer was unreadable and the index was rebuilt by
    /// a forward scan; such files answer queries but with reduced trust.
    pub index_less: bool,
    /// Blocks skipped as unreadable during a recovery scan.
    pub skipped_blocks: u32,
}

impl FileReader {
    /// Opens a file by footer; falls back to a sequential block scan when
    /// the footer or index section is unreadable.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < HEADER_SIZE as u64 {
            return Err(SpectreError::Corruption(format!(
                "{} is shorter than a file header",
                path.display()
            )));
        }
        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let header = FileHeader::decode(&header_buf)?;

        match Self::read_index(&mut file, file_len) {
            Ok(index) => Ok(Self {
                path: path.to_path_buf(),
                header,
                index,
                index_less: false,
                skipped_blocks: 0,
            }),
            Err(err) => {
                warn!(file = %path.display(), err = %err, "footer unreadable, scanning blocks");
                let (index, skipped) = Self::scan_blocks(&mut file, file_len)?;
                Ok(Self {
                    path: path.to_path_buf(),
                    header,
                    index,
                    index_less: true,
                    skipped_blocks: skipped,
                })
            }
        }
    }

    fn read_index(file: &mut File, file_len: u64) -> Result<IndexSection> {
        if file_len < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(SpectreError::Corruption("file has no footer".into()));
        }
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer_buf = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer_buf)?;
        let footer = Footer::decode(&footer_buf)?;
        if footer.index_offset + u64::from(footer.index_len) > file_len {
            return Err(SpectreError::Corruption("footer points past end of file".into()));
        }
        file.seek(SeekFrom::Start(footer.index_offset))?;
        let mut index_buf = vec![0u8; footer.index_len as usize];
        file.read_exact(&mut index_buf)?;
        IndexSection::decode(&index_buf)
    }

    /// Forward scan: read block headers until the first unreadable one,
    /// rebuilding value sets, inverted indexes, and final states from the
    /// decompressed payloads.
    fn scan_blocks(file: &mut File, file_len: u64) -> Result<(IndexSection, u32)> {
        let mut index = IndexSection::new();
        let mut skipped = 0u32;
        let mut offset = HEADER_SIZE as u64;
        loop {
            if offset + BLOCK_HEADER_SIZE as u64 > file_len {
                break;
            }
            file.seek(SeekFrom::Start(offset))?;
            let mut header_buf = [0u8; BLOCK_HEADER_SIZE];
            file.read_exact(&mut header_buf)?;
            let header = match BlockHeader::decode(&header_buf) {
                Ok(h) => h,
                Err(_) => break,
            };
            let end = offset + BLOCK_HEADER_SIZE as u64 + u64::from(header.compressed_len);
            if end > file_len {
                break;
            }
            let mut compressed = vec![0u8; header.compressed_len as usize];
            file.read_exact(&mut compressed)?;

            // Rebuild full metadata by re-sealing the decompressed events.
            match block::decompress(&compressed, header.uncompressed_len as usize)
                .and_then(|raw| crate::storage::codec::decode_framed(&raw))
            {
                Ok(events) => {
                    let mut builder = block::BlockBuilder::new();
                    let mut ok = true;
                    for event in &events {
                        if builder.push(event.clone()).is_err() {
                            ok = false;
                            break;
                        }
                    }
                    if ok && !builder.is_empty() {
                        if let Ok((sealed, _)) = builder.seal(header.id, offset) {
                            index.observe_sealed(sealed.meta, &events);
                        }
                    } else {
                        skipped += 1;
                    }
                }
                Err(err) => {
                    warn!(block_id = header.id, err = %err, "skipping unreadable block");
                    skipped += 1;
                }
            }
            offset = end;
        }
        Ok((index, skipped))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decompresses one block and yields its events.
    pub fn read_block_events(&self, meta: &BlockMeta) -> Result<Vec<Event>> {
        read_block_at(&self.path, meta)
    }
}

/// Reads and decompresses one block by offset. Opens a fresh handle so
/// concurrent block reads never contend on a shared cursor.
pub fn read_block_at(path: &Path, meta: &BlockMeta) -> Result<Vec<Event>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(meta.offset + BLOCK_HEADER_SIZE as u64))?;
    let mut compressed = vec![0u8; meta.compressed_len as usize];
    file.read_exact(&mut compressed)?;
    block::read_events(meta, &compressed)
}

/// Floors a nanosecond timestamp to its hour boundary in the given
/// timezone frame. Returns unix seconds of the boundary.
pub fn hour_epoch_for(ts: UnixNanos, offset: UtcOffset) -> i64 {
    let secs = ts.div_euclid(NANOS_PER_SECOND);
    let local = secs + i64::from(offset.whole_seconds());
    let floored = local - local.rem_euclid(3600);
    floored - i64::from(offset.whole_seconds())
}

/// `YYYY-MM-DD-HH.bin` in the writer's timezone, ASCII only.
pub fn file_name_for_hour(hour_epoch: i64, offset: UtcOffset) -> Result<String> {
    let dt = OffsetDateTime::from_unix_timestamp(hour_epoch)
        .map_err(|err| SpectreError::Validation(format!("hour epoch out of range: {err}")))?
        .to_offset(offset);
    Ok(format!(
        "{:04}-{:02}-{:02}-{:02}.{}",
        dt.year(),
        u8::from(dt.month()),
        dt.day(),
        dt.hour(),
        FILE_EXTENSION
    ))
}

/// Parses `YYYY-MM-DD-HH.bin` back to the hour's unix-second epoch.
pub fn parse_file_name(name: &str, offset: UtcOffset) -> Option<i64> {
    let stem = name.strip_suffix(&format!(".{FILE_EXTENSION}"))?;
    let mut parts = stem.splitn(4, '-');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u8 = parts.next()?.parse().ok()?;
    let day: u8 = parts.next()?.parse().ok()?;
    let hour: u8 = parts.next()?.parse().ok()?;
    let date = Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()?;
    let dt = date.with_hms(hour, 0, 0).ok()?.assume_offset(offset);
    Some(dt.unix_timestamp())
}

/// Whether an hour file overlaps `[start, end]` nanoseconds.
pub fn hour_overlaps(hour_epoch: i64, start: UnixNanos, end: UnixNanos) -> bool {
    let hour_start = hour_epoch * NANOS_PER_SECOND;
    let hour_end = hour_start + crate::model::NANOS_PER_HOUR - 1;
    hour_start <= end && hour_end >= start
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = FileHeader::new(1_700_000_400);
        let decoded = FileHeader::decode(&header.encode()).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn footer_round_trip_and_validation() {
        let footer = Footer {
            index_offset: 1234,
            index_len: 99,
        };
        assert_eq!(Footer::decode(&footer.encode()).unwrap(), footer);
        assert!(Footer::decode(&[0u8; FOOTER_SIZE]).is_err());
    }

    #[test]
    fn file_names_round_trip_in_utc() {
        let offset = UtcOffset::UTC;
        // 2023-11-14 22:00:00 UTC
        let hour = 1_700_000_400 - 1_700_000_400 % 3600;
        let name = file_name_for_hour(hour, offset).unwrap();
        assert!(name.ends_with(".bin"));
        assert_eq!(parse_file_name(&name, offset), Some(hour));
    }

    #[test]
    fn hour_epoch_respects_offset() {
        let offset = UtcOffset::from_hms(5, 30, 0).unwrap();
        let ts = 1_700_003_000 * NANOS_PER_SECOND;
        let epoch = hour_epoch_for(ts, offset);
        // The boundary is on a local hour, so epoch + offset is divisible
        // by 3600 while the UTC value need not be.
        assert_eq!((epoch + 19_800).rem_euclid(3600), 0);
        assert!(epoch * NANOS_PER_SECOND <= ts);
        assert!(ts < (epoch + 3600) * NANOS_PER_SECOND);
    }

    #[test]
    fn index_section_candidates_intersect_dimensions() {
        use crate::storage::block::BlockBuilder;
        let mut index = IndexSection::new();
        let mk = |id: u32, kind: &str, ns: &str, ts: i64| {
            let mut b = BlockBuilder::new();
            let event = crate::model::Event {
                id: format!("e{id}"),
                timestamp: ts,
                kind: crate::model::EventKind::Create,
                resource: crate::model::ResourceRef {
                    group: "apps".into(),
                    version: "v1".into(),
                    kind: kind.into(),
                    namespace: ns.into(),
                    name: format!("n{id}"),
                    uid: format!("u{id}"),
                },
                payload: serde_json::json!({}),
                raw_size: 0,
                involved_uid: None,
            };
            b.push(event.clone()).unwrap();
            (b.seal(id, 0).unwrap().0, vec![event])
        };
        let (s0, e0) = mk(0, "Pod", "prod", 100);
        let (s1, e1) = mk(1, "Pod", "dev", 200);
        let (s2, e2) = mk(2, "Service", "prod", 300);
        index.observe_sealed(s0.meta, &e0);
        index.observe_sealed(s1.meta, &e1);
        index.observe_sealed(s2.meta, &e2);

        let hits = index.candidate_blocks(Some("Pod"), Some("prod"), None, 0, 1_000);
        assert_eq!(hits.iter().map(|m| m.id).collect::<Vec<_>>(), vec![0]);

        let misses = index.candidate_blocks(Some("DaemonSet"), None, None, 0, 1_000);
        assert!(misses.is_empty());

        let time_bounded = index.candidate_blocks(None, Some("prod"), None, 250, 1_000);
        assert_eq!(time_bounded.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn index_section_encode_decode_detects_corruption() {
        let index = IndexSection::new();
        let mut bytes = index.encode().unwrap();
        assert!(IndexSection::decode(&bytes).is_ok());
        let last = bytes.len() - 6;
        bytes[last] ^= 0x1;
        assert!(IndexSection::decode(&bytes).is_err());
    }
}
