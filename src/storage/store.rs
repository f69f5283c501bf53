//! Single-writer event store.
//!
//! One store owns one data directory. All writes pass through a single
//! mutex so block formation and hourly rotation stay deterministic:
//! buffer, seal block, update metadata, update indexes, update the
//! final-state map, in that order. Readers snapshot the in-memory state
//! under the same mutex and then work on immutable bytes.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use time::UtcOffset;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::{Result, SpectreError};
use crate::model::{Event, UnixNanos, NANOS_PER_SECOND};
use crate::storage::block::{BlockBuilder, BLOCK_HEADER_SIZE};
use crate::storage::file::{
    self, FileHeader, FileReader, Footer, IndexSection, FOOTER_SIZE, HEADER_SIZE,
};

/// Immutable view of the currently-open hour, taken under the writer
/// mutex. Sealed blocks are on disk already; `buffered` holds events not
/// yet sealed into a block.
#[derive(Clone)]
pub struct OpenSnapshot {
    pub hour_epoch: i64,
    pub path: PathBuf,
    pub index: IndexSection,
    pub buffered: Vec<Event>,
}

/// Outcome of a retention pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetentionReport {
    pub files_deleted: usize,
    pub states_dropped: usize,
}

struct OpenFile {
    path: PathBuf,
    file: File,
    hour_epoch: i64,
    next_block_id: u32,
    /// End of the last sealed block; the index section goes here.
    write_offset: u64,
    index: IndexSection,
    builder: BlockBuilder,
}

pub struct EventStore {
    data_dir: PathBuf,
    config: StorageConfig,
    tz_offset: UtcOffset,
    inner: Mutex<Option<OpenFile>>,
}

impl EventStore {
    /// Opens (or creates) the store over a data directory. The timezone
    /// offset is captured once so filenames stay consistent for the
    /// lifetime of the process.
    pub fn open(config: StorageConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let tz_offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
        Ok(Self {
            data_dir: config.data_dir.clone(),
            config,
            tz_offset,
            inner: Mutex::new(None),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn tz_offset(&self) -> UtcOffset {
        self.tz_offset
    }

    /// Appends one event. Blocks the caller on disk writes; once inside
    /// the critical section the event is written or the writer fails.
    pub fn write_event(&self, event: Event) -> Result<()> {
        event.validate()?;
        let hour = file::hour_epoch_for(event.timestamp, self.tz_offset);

        let mut guard = self.inner.lock();
        loop {
            match guard.as_ref().map(|open| open.hour_epoch) {
                Some(open_hour) if open_hour == hour => break,
                Some(open_hour) if hour > open_hour => {
                    // Hour boundary: finalize, then carry the final-state
                    // map into the next hour's file.
                    let mut finished = guard.take().ok_or_else(|| {
                        SpectreError::Internal("writer state vanished mid-rotation".into())
                    })?;
                    Self::finalize(&mut finished)?;
                    let carry = finished.index.final_states.clone();
                    info!(
                        file = %finished.path.display(),
                        carried_states = carry.len(),
                        "rotated hourly file"
                    );
                    *guard = Some(self.obtain_file(hour, Some(carry))?);
                }
                Some(open_hour) => {
                    return Err(SpectreError::Validation(format!(
                        "event timestamp {} precedes the open hour {open_hour}",
                        event.timestamp
                    )));
                }
                None => {
                    *guard = Some(self.obtain_file(hour, None)?);
                }
            }
        }

        let open = guard
            .as_mut()
            .ok_or_else(|| SpectreError::Internal("no open file after rotation".into()))?;
        open.builder.push(event)?;
        if open.builder.uncompressed_len() >= self.config.block_target_size {
            Self::seal_block(open)?;
        }
        Ok(())
    }

    /// Bulk import through the normal write path. Events are sorted by
    /// timestamp first so historical batches rotate cleanly; the output
    /// files are indistinguishable from live-captured ones.
    pub fn import(&self, mut events: Vec<Event>) -> Result<usize> {
        events.sort_by_key(|e| e.timestamp);
        let count = events.len();
        for event in events {
            self.write_event(event)?;
        }
        self.finalize_open()?;
        Ok(count)
    }

    /// Finalizes the open file (partial block sealed, index and footer
    /// written, fsynced). The same hour can be re-opened and appended to
    /// afterwards; restore truncates the index away again.
    pub fn finalize_open(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        if let Some(mut open) = guard.take() {
            Self::finalize(&mut open)?;
        }
        Ok(())
    }

    /// Snapshot of the open hour for the query path.
    pub fn snapshot_open(&self) -> Option<OpenSnapshot> {
        let guard = self.inner.lock();
        guard.as_ref().map(|open| OpenSnapshot {
            hour_epoch: open.hour_epoch,
            path: open.path.clone(),
            index: open.index.clone(),
            buffered: open.builder.events().to_vec(),
        })
    }

    /// Hour files on disk, sorted ascending by hour. The open file is
    /// included once it exists on disk.
    pub fn list_files(&self) -> Result<Vec<(i64, PathBuf)>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(hour) = file::parse_file_name(name, self.tz_offset) {
                out.push((hour, entry.path()));
            }
        }
        out.sort_by_key(|(hour, _)| *hour);
        Ok(out)
    }

    /// Deletes files strictly older than the retention age (derived from
    /// the filename hour, not mtime) and rewrites surviving index
    /// sections to drop final states of resources deleted before the
    /// state-retention horizon.
    pub fn run_retention(&self, now: UnixNanos) -> Result<RetentionReport> {
        let mut report = RetentionReport::default();
        let file_horizon =
            now / NANOS_PER_SECOND - self.config.retention_max_age().as_secs() as i64;
        let state_horizon = now - self.config.state_retention().as_nanos() as i64;

        let open_path = {
            let guard = self.inner.lock();
            guard.as_ref().map(|open| open.path.clone())
        };

        for (hour, path) in self.list_files()? {
            if Some(&path) == open_path.as_ref() {
                continue;
            }
            if hour + 3600 <= file_horizon {
                fs::remove_file(&path)?;
                debug!(file = %path.display(), "retention deleted file");
                report.files_deleted += 1;
                continue;
            }
            report.states_dropped += self.rewrite_stale_states(&path, state_horizon)?;
        }
        Ok(report)
    }

    fn rewrite_stale_states(&self, path: &Path, state_horizon: UnixNanos) -> Result<usize> {
        let reader = match FileReader::open(path) {
            Ok(reader) => reader,
            Err(err) => {
                warn!(file = %path.display(), err = %err, "skipping unreadable file in retention");
                return Ok(0);
            }
        };
        if reader.index_less {
            return Ok(0);
        }
        let mut index = reader.index;
        let before = index.final_states.len();
        index.final_states.retain(|_, state| {
            !(state.event_kind == crate::model::EventKind::Delete
                && state.timestamp < state_horizon)
        });
        let dropped = before - index.final_states.len();
        if dropped == 0 {
            return Ok(0);
        }

        let index_offset = index
            .blocks
            .last()
            .map(|meta| meta.offset + BLOCK_HEADER_SIZE as u64 + u64::from(meta.compressed_len))
            .unwrap_or(HEADER_SIZE as u64);
        let mut out = OpenOptions::new().read(true).write(true).open(path)?;
        out.set_len(index_offset)?;
        out.seek(SeekFrom::Start(index_offset))?;
        write_index_and_footer(&mut out, index_offset, &index)?;
        out.sync_all()?;
        Ok(dropped)
    }

    fn obtain_file(
        &self,
        hour: i64,
        carry: Option<std::collections::BTreeMap<String, crate::model::FinalState>>,
    ) -> Result<OpenFile> {
        let name = file::file_name_for_hour(hour, self.tz_offset)?;
        let path = self.data_dir.join(name);
        if path.exists() {
            self.restore_file(hour, &path)
        } else {
            self.create_file(hour, &path, carry)
        }
    }

    fn create_file(
        &self,
        hour: i64,
        path: &Path,
        carry: Option<std::collections::BTreeMap<String, crate::model::FinalState>>,
    ) -> Result<OpenFile> {
        let mut index = IndexSection::new();
        index.final_states = match carry {
            Some(states) => states,
            // A fresh process start mid-stream: pull the carry-over map
            // from the most recent earlier file, if any.
            None => self
                .latest_file_before(hour)?
                .and_then(|p| match FileReader::open(&p) {
                    Ok(reader) => Some(reader.index.final_states),
                    Err(err) => {
                        warn!(file = %p.display(), err = %err, "no carry-over; previous file unreadable");
                        None
                    }
                })
                .unwrap_or_default(),
        };

        let mut handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        handle.write_all(&FileHeader::new(hour).encode())?;
        handle.flush()?;
        info!(file = %path.display(), "opened hourly file");
        Ok(OpenFile {
            path: path.to_path_buf(),
            file: handle,
            hour_epoch: hour,
            next_block_id: 0,
            write_offset: HEADER_SIZE as u64,
            index,
            builder: BlockBuilder::new(),
        })
    }

    /// Re-opens an existing same-hour file after a restart: loads its
    /// metadata, truncates at the end of the last complete block, and
    /// continues appending.
    fn restore_file(&self, hour: i64, path: &Path) -> Result<OpenFile> {
        let reader = FileReader::open(path)?;
        if reader.header.hour_epoch != hour {
            return Err(SpectreError::Corruption(format!(
                "{} header hour {} does not match filename hour {hour}",
                path.display(),
                reader.header.hour_epoch
            )));
        }
        let mut index = reader.index;
        if reader.index_less {
            // A scan rebuild only sees this file's own events; the
            // carry-over map lived in the lost footer. Re-seed it from
            // the previous file, keeping this hour's entries on top.
            if let Some(previous) = self.latest_file_before(hour)? {
                match FileReader::open(&previous) {
                    Ok(prev_reader) => {
                        for (key, state) in prev_reader.index.final_states {
                            index.final_states.entry(key).or_insert(state);
                        }
                    }
                    Err(err) => {
                        warn!(file = %previous.display(), err = %err, "carry-over reseed failed");
                    }
                }
            }
        }
        let next_block_id = index.blocks.iter().map(|b| b.id + 1).max().unwrap_or(0);
        let write_offset = index
            .blocks
            .last()
            .map(|meta| meta.offset + BLOCK_HEADER_SIZE as u64 + u64::from(meta.compressed_len))
            .unwrap_or(HEADER_SIZE as u64);

        let mut handle = OpenOptions::new().read(true).write(true).open(path)?;
        handle.set_len(write_offset)?;
        handle.seek(SeekFrom::Start(write_offset))?;
        info!(
            file = %path.display(),
            blocks = index.blocks.len(),
            "restored open hour after restart"
        );
        Ok(OpenFile {
            path: path.to_path_buf(),
            file: handle,
            hour_epoch: hour,
            next_block_id,
            write_offset,
            index,
            builder: BlockBuilder::new(),
        })
    }

    fn latest_file_before(&self, hour: i64) -> Result<Option<PathBuf>> {
        Ok(self
            .list_files()?
            .into_iter()
            .filter(|(h, _)| *h < hour)
            .next_back()
            .map(|(_, p)| p))
    }

    fn seal_block(open: &mut OpenFile) -> Result<()> {
        let (sealed, events) = open.builder.seal(open.next_block_id, open.write_offset)?;
        let bytes = sealed.to_bytes();
        open.file.seek(SeekFrom::Start(open.write_offset))?;
        open.file.write_all(&bytes)?;
        open.file.flush()?;
        open.write_offset += bytes.len() as u64;
        open.next_block_id += 1;
        open.index.observe_sealed(sealed.meta, &events);
        Ok(())
    }

    fn finalize(open: &mut OpenFile) -> Result<()> {
        if !open.builder.is_empty() {
            Self::seal_block(open)?;
        }
        open.file.seek(SeekFrom::Start(open.write_offset))?;
        write_index_and_footer(&mut open.file, open.write_offset, &open.index)?;
        open.file.sync_all()?;
        Ok(())
    }
}

impl Drop for EventStore {
    fn drop(&mut self) {
        let mut guard = self.inner.lock();
        if let Some(mut open) = guard.take() {
            if let Err(err) = Self::finalize(&mut open) {
                warn!(err = %err, "failed to finalize open file on shutdown");
            }
        }
    }
}

fn write_index_and_footer(out: &mut File, offset: u64, index: &IndexSection) -> Result<()> {
    let encoded = index.encode()?;
    out.write_all(&encoded)?;
    let footer = Footer {
        index_offset: offset,
        index_len: encoded.len() as u32,
    };
    debug_assert_eq!(footer.encode().len(), FOOTER_SIZE);
    out.write_all(&footer.encode())?;
    out.flush()?;
    Ok(())
}
