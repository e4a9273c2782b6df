//! File-backed journal: one log file and one snapshot file per owner key.
//!
//! Every record is framed as `[magic: u32][len: u32][crc32: u32][payload]`
//! (little endian) and every append is followed by `sync_data`. The log is
//! opened per append and closed right after, so idle keys hold no file
//! descriptors. A frame that
//! was only partly written when the process died is cut off on the next open.
//! A checksum mismatch anywhere before the tail is corruption and is reported
//! instead of being skipped.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::ClusterError;
use crate::journal::{
    sequence_conflict, EventJournal, EventStream, PersistedEvent, SeqNr, SnapshotRecord,
};
use crate::types::OwnerKey;

const MAGIC: u32 = 0x5348_4C47; // "SHLG"
const HEADER_LEN: usize = 12;
const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
enum LogRecord {
    Events {
        first_sequence: SeqNr,
        events: Vec<Vec<u8>>,
    },
    /// Written at the head of a log rewritten by retention, so the highest
    /// sequence survives even when every event was removed.
    Truncated { up_to: SeqNr },
}

#[derive(Default)]
struct KeyState {
    loaded: bool,
    highest: SeqNr,
    snapshot_sequence: Option<SeqNr>,
}

/// Journal storing each key's events in `<dir>/<hex key>.log`.
pub struct FileJournal {
    dir: PathBuf,
    keys: DashMap<OwnerKey, Arc<Mutex<KeyState>>>,
}

impl FileJournal {
    /// Open (creating if needed) a journal rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, ClusterError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| {
            ClusterError::persistence(format!("failed to create {}", dir.display()), e)
        })?;
        Ok(Self {
            dir,
            keys: DashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_stem(owner_key: &OwnerKey) -> String {
        owner_key
            .as_str()
            .bytes()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Path of the key's event log.
    pub fn log_path(&self, owner_key: &OwnerKey) -> PathBuf {
        self.dir.join(format!("{}.log", Self::file_stem(owner_key)))
    }

    fn snapshot_path(&self, owner_key: &OwnerKey) -> PathBuf {
        self.dir.join(format!("{}.snap", Self::file_stem(owner_key)))
    }

    fn key_state(&self, owner_key: &OwnerKey) -> Arc<Mutex<KeyState>> {
        self.keys
            .entry(owner_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(KeyState::default())))
            .clone()
    }

    /// Scan the log once per process: compute the highest sequence and cut
    /// off a torn tail.
    async fn ensure_loaded(
        &self,
        owner_key: &OwnerKey,
        state: &mut KeyState,
    ) -> Result<(), ClusterError> {
        if state.loaded {
            return Ok(());
        }
        let path = self.log_path(owner_key);
        let bytes = read_optional(&path).await?.unwrap_or_default();
        let scan = scan_frames(&bytes).map_err(|offset| corrupt(&path, offset))?;

        let mut highest = 0;
        for payload in &scan.frames {
            match decode_record(payload, &path)? {
                LogRecord::Events {
                    first_sequence,
                    events,
                } => {
                    if !events.is_empty() {
                        highest = first_sequence + events.len() as SeqNr - 1;
                    }
                }
                LogRecord::Truncated { up_to } => highest = highest.max(up_to),
            }
        }

        if scan.valid_len < bytes.len() {
            warn!(
                path = %path.display(),
                valid_len = scan.valid_len,
                file_len = bytes.len(),
                "truncating torn tail of event log"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(|e| ClusterError::persistence("failed to open log for truncation", e))?;
            file.set_len(scan.valid_len as u64)
                .await
                .map_err(|e| ClusterError::persistence("failed to truncate torn tail", e))?;
            file.sync_all()
                .await
                .map_err(|e| ClusterError::persistence("failed to sync truncated log", e))?;
        }

        state.highest = highest;
        state.loaded = true;
        Ok(())
    }

    async fn read_snapshot_file(
        &self,
        owner_key: &OwnerKey,
    ) -> Result<Option<SnapshotRecord>, ClusterError> {
        let path = self.snapshot_path(owner_key);
        let Some(bytes) = read_optional(&path).await? else {
            return Ok(None);
        };
        let scan = scan_frames(&bytes).map_err(|offset| corrupt(&path, offset))?;
        match (scan.frames.first(), scan.valid_len == bytes.len()) {
            (Some(payload), true) => rmp_serde::from_slice(payload)
                .map(Some)
                .map_err(|e| ClusterError::malformed("failed to decode snapshot", e)),
            _ => Err(corrupt(&path, scan.valid_len)),
        }
    }
}

#[async_trait]
impl EventJournal for FileJournal {
    async fn append_batch(
        &self,
        owner_key: &OwnerKey,
        first_sequence: SeqNr,
        events: Vec<Vec<u8>>,
    ) -> Result<(), ClusterError> {
        if events.is_empty() {
            return Ok(());
        }
        let handle = self.key_state(owner_key);
        let mut state = handle.lock().await;
        self.ensure_loaded(owner_key, &mut state).await?;

        let expected = state.highest + 1;
        if first_sequence != expected {
            return Err(sequence_conflict(owner_key, expected, first_sequence));
        }
        let count = events.len() as SeqNr;
        let frame = encode_frame(&LogRecord::Events {
            first_sequence,
            events,
        })?;

        let path = self.log_path(owner_key);
        let write = async {
            let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;
            file.write_all(&frame).await?;
            file.sync_data().await
        };
        if let Err(e) = write.await {
            // A partial frame may be left behind; rescan on the next append
            // so the torn bytes are cut.
            state.loaded = false;
            return Err(ClusterError::persistence(
                format!("failed to append to event log of {owner_key}"),
                e,
            ));
        }
        state.highest += count;
        Ok(())
    }

    fn read_from<'a>(&'a self, owner_key: &'a OwnerKey, from_sequence: SeqNr) -> EventStream<'a> {
        let path = self.log_path(owner_key);
        let init = ReadState {
            reader: None,
            started: false,
            pending: VecDeque::new(),
            offset: 0,
        };
        Box::pin(stream::try_unfold(init, move |mut st| {
            let path = path.clone();
            async move {
                if !st.started {
                    st.started = true;
                    let handle = self.key_state(owner_key);
                    let mut state = handle.lock().await;
                    self.ensure_loaded(owner_key, &mut state).await?;
                    drop(state);
                    st.reader = match File::open(&path).await {
                        Ok(file) => Some(BufReader::new(file)),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                        Err(e) => {
                            return Err(ClusterError::persistence("failed to open event log", e))
                        }
                    };
                }
                loop {
                    if let Some(event) = st.pending.pop_front() {
                        return Ok(Some((event, st)));
                    }
                    let Some(reader) = st.reader.as_mut() else {
                        return Ok(None);
                    };
                    let Some(payload) = read_frame(reader, &mut st.offset, &path).await? else {
                        return Ok(None);
                    };
                    if let LogRecord::Events {
                        first_sequence,
                        events,
                    } = decode_record(&payload, &path)?
                    {
                        for (i, payload) in events.into_iter().enumerate() {
                            let sequence = first_sequence + i as SeqNr;
                            if sequence >= from_sequence {
                                st.pending.push_back(PersistedEvent { sequence, payload });
                            }
                        }
                    }
                }
            }
        }))
    }

    async fn highest_sequence(&self, owner_key: &OwnerKey) -> Result<SeqNr, ClusterError> {
        let handle = self.key_state(owner_key);
        let mut state = handle.lock().await;
        self.ensure_loaded(owner_key, &mut state).await?;
        Ok(state.highest)
    }

    async fn save_snapshot(
        &self,
        owner_key: &OwnerKey,
        sequence: SeqNr,
        state_bytes: Vec<u8>,
    ) -> Result<(), ClusterError> {
        let handle = self.key_state(owner_key);
        let mut state = handle.lock().await;
        if state.snapshot_sequence.is_none() {
            state.snapshot_sequence = match self.read_snapshot_file(owner_key).await {
                Ok(existing) => existing.map(|s| s.sequence),
                Err(e) => {
                    warn!(owner_key = %owner_key, error = %e, "replacing unreadable snapshot");
                    None
                }
            };
        }
        if state.snapshot_sequence.is_some_and(|s| s > sequence) {
            return Ok(());
        }

        let frame = encode_frame(&SnapshotRecord {
            sequence,
            state: state_bytes,
        })?;
        let path = self.snapshot_path(owner_key);
        write_atomically(&path, &frame).await?;
        state.snapshot_sequence = Some(sequence);
        debug!(owner_key = %owner_key, sequence, "snapshot written");
        Ok(())
    }

    async fn load_snapshot(
        &self,
        owner_key: &OwnerKey,
    ) -> Result<Option<SnapshotRecord>, ClusterError> {
        self.read_snapshot_file(owner_key).await
    }

    async fn delete_events_up_to(
        &self,
        owner_key: &OwnerKey,
        up_to: SeqNr,
    ) -> Result<(), ClusterError> {
        let handle = self.key_state(owner_key);
        let mut state = handle.lock().await;
        self.ensure_loaded(owner_key, &mut state).await?;
        let up_to = up_to.min(state.highest);
        if up_to == 0 {
            return Ok(());
        }

        let path = self.log_path(owner_key);
        let bytes = read_optional(&path).await?.unwrap_or_default();
        let scan = scan_frames(&bytes).map_err(|offset| corrupt(&path, offset))?;

        let mut out = encode_frame(&LogRecord::Truncated { up_to })?;
        for payload in &scan.frames {
            if let LogRecord::Events {
                first_sequence,
                events,
            } = decode_record(payload, &path)?
            {
                let skip = up_to.saturating_sub(first_sequence - 1) as usize;
                if skip >= events.len() {
                    continue;
                }
                out.extend(encode_frame(&LogRecord::Events {
                    first_sequence: first_sequence + skip as SeqNr,
                    events: events.into_iter().skip(skip).collect(),
                })?);
            }
        }

        write_atomically(&path, &out).await?;
        debug!(owner_key = %owner_key, up_to, "compacted event log");
        Ok(())
    }
}

struct ReadState {
    reader: Option<BufReader<File>>,
    started: bool,
    pending: VecDeque<PersistedEvent>,
    offset: u64,
}

struct FrameScan<'b> {
    frames: Vec<&'b [u8]>,
    valid_len: usize,
}

/// Split a buffer into frame payloads.
///
/// An incomplete frame, or a checksum mismatch in the final frame, ends the
/// scan as a torn tail. A bad frame followed by more data is corruption;
/// its offset is returned as the error.
fn scan_frames(bytes: &[u8]) -> Result<FrameScan<'_>, usize> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while bytes.len() - offset >= HEADER_LEN {
        let header = &bytes[offset..offset + HEADER_LEN];
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if magic != MAGIC || len > MAX_RECORD_LEN {
            return Err(offset);
        }
        let end = offset + HEADER_LEN + len as usize;
        if end > bytes.len() {
            break;
        }
        let payload = &bytes[offset + HEADER_LEN..end];
        if crc32fast::hash(payload) != crc {
            if end == bytes.len() {
                break;
            }
            return Err(offset);
        }
        frames.push(payload);
        offset = end;
    }
    Ok(FrameScan {
        frames,
        valid_len: offset,
    })
}

fn encode_frame<T: Serialize>(record: &T) -> Result<Vec<u8>, ClusterError> {
    let payload = rmp_serde::to_vec(record)
        .map_err(|e| ClusterError::malformed("failed to encode journal record", e))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_RECORD_LEN)
        .ok_or_else(|| ClusterError::PersistenceFailure {
            reason: format!("journal record of {} bytes is too large", payload.len()),
            source: None,
        })?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&MAGIC.to_le_bytes());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn decode_record(payload: &[u8], path: &Path) -> Result<LogRecord, ClusterError> {
    rmp_serde::from_slice(payload).map_err(|e| {
        ClusterError::persistence(format!("undecodable record in {}", path.display()), e)
    })
}

/// Read one frame; `None` at end of file or at a frame still being written.
async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    offset: &mut u64,
    path: &Path,
) -> Result<Option<Vec<u8>>, ClusterError> {
    let mut header = [0u8; HEADER_LEN];
    if read_full(reader, &mut header).await? < HEADER_LEN {
        return Ok(None);
    }
    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    if magic != MAGIC || len > MAX_RECORD_LEN {
        return Err(corrupt(path, *offset as usize));
    }
    let mut payload = vec![0u8; len as usize];
    if read_full(reader, &mut payload).await? < payload.len() {
        return Ok(None);
    }
    if crc32fast::hash(&payload) != crc {
        return Err(corrupt(path, *offset as usize));
    }
    *offset += (HEADER_LEN + payload.len()) as u64;
    Ok(Some(payload))
}

async fn read_full<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<usize, ClusterError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(|e| ClusterError::persistence("failed to read event log", e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, ClusterError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ClusterError::persistence(
            format!("failed to read {}", path.display()),
            e,
        )),
    }
}

/// Write to a temporary file, sync it, then rename it over `path`.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), ClusterError> {
    let tmp = path.with_extension("tmp");
    let write = async {
        let mut file = File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        fs::rename(&tmp, path).await
    };
    write.await.map_err(|e| {
        ClusterError::persistence(format!("failed to write {}", path.display()), e)
    })
}

fn corrupt(path: &Path, offset: usize) -> ClusterError {
    ClusterError::PersistenceFailure {
        reason: format!("corrupt record at offset {offset} in {}", path.display()),
        source: None,
    }
}
