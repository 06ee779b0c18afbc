use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::index::{IndexEntry, IndexState};
use crate::record::{AttachmentRecord, BlobId, MessageRecord, StreamLocation, StreamRecord};
use crate::traits::CacheStore;

/// Index log file name under the store root.
pub const INDEX_FILE: &str = "index.log";
/// Blob directory under the store root.
pub const BLOB_DIR: &str = "blobs";

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

/// The log is never compacted below this many entries.
pub const COMPACT_MIN_ENTRIES: u64 = 1024;
/// Compact once the log holds this many entries per live record.
pub const COMPACT_RATIO: u64 = 4;

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Poisoned(e.to_string())
}

/// Durability knobs for [`FsCacheStore`].
#[derive(Clone, Debug, Default)]
pub struct FsStoreConfig {
    /// `fsync` a blob when its stream is released.
    pub sync_on_close: bool,
    /// `fsync` the index log after every commit.
    pub sync_index: bool,
}

fn encode_frame(entry: &IndexEntry) -> StoreResult<Vec<u8>> {
    let payload =
        bincode::serialize(entry).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

struct IndexLog {
    file: File,
    /// End of the last complete frame.
    offset: u64,
    entries: u64,
}

impl IndexLog {
    fn append(&mut self, frame: &[u8], sync: bool) -> io::Result<()> {
        let written = self
            .file
            .write_all(frame)
            .and_then(|()| if sync { self.file.sync_data() } else { Ok(()) });
        if let Err(e) = written {
            self.rollback();
            return Err(e);
        }
        self.offset += frame.len() as u64;
        self.entries += 1;
        Ok(())
    }

    /// Cut off a partially written frame so the next one starts on a frame
    /// boundary.
    fn rollback(&mut self) {
        if let Err(e) = self.file.set_len(self.offset) {
            warn!(offset = self.offset, error = %e, "failed to cut torn index frame");
        }
    }

    fn needs_compaction(&self, live: usize) -> bool {
        self.entries >= COMPACT_MIN_ENTRIES && self.entries > live as u64 * COMPACT_RATIO
    }
}

/// Filesystem-backed cache store.
///
/// Layout under the root directory:
///
/// ```text
/// index.log                  log of committed index entries
/// blobs/<2 hex>/<64 hex>     one file per stream blob
/// ```
///
/// Each index log entry is framed as
/// `[4 bytes: payload length (LE u32)][4 bytes: CRC32 (LE u32)][bincode payload]`.
/// On open the log is replayed front to back. Entries failing the CRC check
/// are skipped; a torn tail is cut off so later appends stay readable.
/// Once most entries are superseded the log is rewritten from the live
/// records.
pub struct FsCacheStore {
    root: PathBuf,
    config: FsStoreConfig,
    index: RwLock<IndexState>,
    log: Mutex<IndexLog>,
    writers: Mutex<HashMap<BlobId, File>>,
}

impl FsCacheStore {
    /// Open (or create) a store rooted at `root`.
    pub fn open(root: &Path, config: FsStoreConfig) -> StoreResult<Self> {
        fs::create_dir_all(root.join(BLOB_DIR))?;

        let index_path = root.join(INDEX_FILE);
        let (entries, valid_len) = replay_index(&index_path)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&index_path)?;

        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            warn!(
                valid_len,
                file_len,
                "discarding torn tail of index log"
            );
            file.set_len(valid_len)?;
        }

        let logged = entries.len() as u64;
        let mut state = IndexState::new();
        for entry in entries {
            state.apply(entry);
        }
        debug!(root = %root.display(), records = state.len(), logged, "cache store opened");

        let mut log = IndexLog {
            file,
            offset: valid_len,
            entries: logged,
        };
        if log.needs_compaction(state.len()) {
            rewrite_log(&index_path, &mut log, &state)?;
        }

        Ok(Self {
            root: root.to_path_buf(),
            config,
            index: RwLock::new(state),
            log: Mutex::new(log),
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    /// Path of the file backing a blob.
    pub fn blob_path(&self, blob: &BlobId) -> PathBuf {
        let hex = blob.to_hex();
        self.root.join(BLOB_DIR).join(&hex[..2]).join(hex)
    }

    /// Number of entries in the index log, live or superseded.
    pub fn log_entries(&self) -> StoreResult<u64> {
        Ok(self.log.lock().map_err(poisoned)?.entries)
    }

    /// Rewrite the index log with one entry per live record.
    pub fn compact(&self) -> StoreResult<()> {
        let index = self.index.read().map_err(poisoned)?;
        let mut log = self.log.lock().map_err(poisoned)?;
        rewrite_log(&self.index_path(), &mut log, &index)
    }

    fn commit(&self, entry: IndexEntry) -> StoreResult<()> {
        let mut index = self.index.write().map_err(poisoned)?;
        self.apply_logged(&mut index, entry)
    }

    /// Log `entry`, then apply it. Lock order is index, then log.
    fn apply_logged(&self, index: &mut IndexState, entry: IndexEntry) -> StoreResult<()> {
        let frame = encode_frame(&entry)?;
        let mut log = self.log.lock().map_err(poisoned)?;
        log.append(&frame, self.config.sync_index)?;
        index.apply(entry);

        if log.needs_compaction(index.len()) {
            if let Err(e) = rewrite_log(&self.index_path(), &mut log, index) {
                warn!(error = %e, "index log compaction failed");
            }
        }
        Ok(())
    }
}

/// Replace the log at `path` with a snapshot of `state`. The snapshot is
/// written to a sibling file and renamed over the log.
fn rewrite_log(path: &Path, log: &mut IndexLog, state: &IndexState) -> StoreResult<()> {
    let tmp = path.with_extension("log.tmp");
    let snapshot = state.snapshot();
    let mut offset = 0u64;
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        for entry in &snapshot {
            let frame = encode_frame(entry)?;
            writer.write_all(&frame)?;
            offset += frame.len() as u64;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;

    let file = OpenOptions::new().read(true).append(true).open(path)?;
    debug!(before = log.entries, after = snapshot.len(), bytes = offset, "index log compacted");
    *log = IndexLog {
        file,
        offset,
        entries: snapshot.len() as u64,
    };
    Ok(())
}

/// Replay the index log. Returns the decoded entries and the length of the
/// valid prefix of the file.
fn replay_index(path: &Path) -> StoreResult<(Vec<IndexEntry>, u64)> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e.into()),
    };
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    let mut offset: u64 = 0;

    while offset + HEADER_SIZE as u64 <= file_len {
        reader.seek(SeekFrom::Start(offset))?;

        let mut header = [0u8; HEADER_SIZE];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if length == 0 || offset + HEADER_SIZE as u64 + length as u64 > file_len {
            warn!(offset, length, file_len, "invalid index entry length; stopping replay");
            break;
        }

        let mut payload = vec![0u8; length as usize];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(offset, "truncated index entry; stopping replay");
                break;
            }
            Err(e) => return Err(e.into()),
        }

        let next = offset + HEADER_SIZE as u64 + length as u64;
        let actual_crc = crc32fast::hash(&payload);
        if actual_crc != expected_crc {
            warn!(
                offset,
                expected = expected_crc,
                actual = actual_crc,
                "CRC mismatch; skipping index entry"
            );
            offset = next;
            continue;
        }

        match bincode::deserialize::<IndexEntry>(&payload) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(offset, error = %e, "failed to decode index entry; skipping"),
        }
        offset = next;
    }

    debug!(recovered = entries.len(), "index replay complete");
    Ok((entries, offset))
}

impl CacheStore for FsCacheStore {
    fn commit_message(&self, record: &MessageRecord) -> StoreResult<()> {
        self.commit(IndexEntry::Message(record.clone()))
    }

    fn commit_attachment(&self, record: &AttachmentRecord) -> StoreResult<()> {
        self.commit(IndexEntry::Attachment(record.clone()))
    }

    fn commit_stream(&self, record: &StreamRecord) -> StoreResult<()> {
        self.commit(IndexEntry::Stream(record.clone()))
    }

    fn promote_stream(&self, record: &StreamRecord) -> StoreResult<StreamRecord> {
        let mut index = self.index.write().map_err(poisoned)?;
        if let Some(current) = index.complete_stream(&record.location, record.declared_size) {
            if self.blob_len(&current.blob)? == record.declared_size {
                return Ok(current.clone());
            }
        }
        let superseded = index
            .stream(&record.location)
            .filter(|current| current.complete && current.blob != record.blob)
            .map(|current| current.blob);
        self.apply_logged(&mut index, IndexEntry::Stream(record.clone()))?;
        drop(index);

        if let Some(blob) = superseded {
            self.blob_remove(&blob)?;
        }
        Ok(record.clone())
    }

    fn lookup_stream(&self, location: &StreamLocation) -> StoreResult<Option<StreamRecord>> {
        Ok(self.index.read().map_err(poisoned)?.stream(location).cloned())
    }

    fn messages(&self) -> StoreResult<Vec<MessageRecord>> {
        Ok(self.index.read().map_err(poisoned)?.messages())
    }

    fn attachments(&self) -> StoreResult<Vec<AttachmentRecord>> {
        Ok(self.index.read().map_err(poisoned)?.attachments())
    }

    fn streams(&self) -> StoreResult<Vec<StreamRecord>> {
        Ok(self.index.read().map_err(poisoned)?.streams())
    }

    fn blob_append(&self, blob: &BlobId, bytes: &[u8]) -> StoreResult<u64> {
        let mut writers = self.writers.lock().map_err(poisoned)?;
        if !writers.contains_key(blob) {
            let path = self.blob_path(blob);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            writers.insert(*blob, file);
        }
        let file = writers
            .get_mut(blob)
            .ok_or(StoreError::BlobNotFound(*blob))?;
        file.write_all(bytes)?;
        Ok(file.metadata()?.len())
    }

    fn blob_read(&self, blob: &BlobId, offset: u64, max_len: usize) -> StoreResult<Vec<u8>> {
        let mut file = match File::open(self.blob_path(blob)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::BlobNotFound(*blob))
            }
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut data = Vec::with_capacity(max_len.min(64 * 1024));
        file.take(max_len as u64).read_to_end(&mut data)?;
        Ok(data)
    }

    fn blob_len(&self, blob: &BlobId) -> StoreResult<u64> {
        match fs::metadata(self.blob_path(blob)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn blob_reset(&self, blob: &BlobId) -> StoreResult<()> {
        let mut writers = self.writers.lock().map_err(poisoned)?;
        writers.remove(blob);
        let path = self.blob_path(blob);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        File::create(&path)?;
        Ok(())
    }

    fn blob_remove(&self, blob: &BlobId) -> StoreResult<()> {
        self.writers.lock().map_err(poisoned)?.remove(blob);
        match fs::remove_file(self.blob_path(blob)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn blob_close(&self, blob: &BlobId) -> StoreResult<()> {
        let file = self.writers.lock().map_err(poisoned)?.remove(blob);
        if let Some(file) = file {
            if self.config.sync_on_close {
                file.sync_all()?;
            }
            debug!(blob = %blob.short_hex(), "blob closed");
        }
        Ok(())
    }
}

impl std::fmt::Debug for FsCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let records = self.index.read().map(|i| i.len()).unwrap_or(0);
        f.debug_struct("FsCacheStore")
            .field("root", &self.root)
            .field("record_count", &records)
            .finish()
    }
}
