//! Journal-backed persistent store.

use crate::backend::{ConflictFilter, LocalStore};
use crate::batch::StoreBatch;
use crate::error::{StorageError, StorageResult};
use crate::journal::{encode_record, scan};
use crate::state::StoreState;
use fs2::FileExt;
use offsync_protocol::{
    Conflict, ConflictId, EntitySnapshot, OperationId, OperationStatus, ResolutionRecord,
    SyncOperation,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Options for [`FileStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileStoreOptions {
    /// Call `fsync` after every record.
    pub sync_on_write: bool,
}

impl Default for FileStoreOptions {
    fn default() -> Self {
        Self {
            sync_on_write: true,
        }
    }
}

impl FileStoreOptions {
    /// Sets `sync_on_write`.
    #[must_use]
    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }
}

/// Sizes before and after [`FileStore::compact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    /// Journal size before compaction, in bytes.
    pub bytes_before: u64,
    /// Journal size after compaction, in bytes.
    pub bytes_after: u64,
}

/// A persistent store backed by an append-only journal.
///
/// Every store call appends exactly one record, so a crash loses either a
/// whole call or nothing. The journal is replayed on open; a torn tail is
/// truncated away.
///
/// # Locking
///
/// An exclusive advisory lock on `<journal>.lock` is held for the lifetime
/// of the store. A second open of the same journal, from this process or
/// another one, fails with [`StorageError::Locked`].
///
/// # Example
///
/// ```no_run
/// use offsync_store::{FileStore, LocalStore};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("offsync.journal")).unwrap();
/// let pending = store.list_operations(None).unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    options: FileStoreOptions,
    state: RwLock<StoreState>,
    file: Mutex<File>,
    _lock_file: File,
}

impl FileStore {
    /// Opens or creates the journal at `path` with default options.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal is locked, unreadable, or corrupted
    /// before its tail.
    pub fn open(path: &Path) -> StorageResult<Self> {
        Self::open_with_options(path, FileStoreOptions::default())
    }

    /// Opens or creates the journal at `path`.
    ///
    /// Parent directories are created as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal is locked, unreadable, or corrupted
    /// before its tail.
    pub fn open_with_options(path: &Path, options: FileStoreOptions) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_path = lock_path_for(path);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(path.to_path_buf()));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let outcome = scan(&bytes)?;

        if outcome.valid_len < bytes.len() as u64 {
            tracing::warn!(
                path = %path.display(),
                valid = outcome.valid_len,
                total = bytes.len(),
                "truncating torn journal tail"
            );
            file.set_len(outcome.valid_len)?;
            file.sync_all()?;
        }

        let mut state = StoreState::new();
        let records = outcome.records.len();
        for ops in outcome.records {
            state.commit(ops);
        }
        tracing::debug!(path = %path.display(), records, "journal replayed");

        Ok(Self {
            path: path.to_path_buf(),
            options,
            state: RwLock::new(state),
            file: Mutex::new(file),
            _lock_file: lock_file,
        })
    }

    /// Returns the journal path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current journal size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the file metadata cannot be read.
    pub fn journal_size(&self) -> StorageResult<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    /// Rewrites the journal so it holds only the live state.
    ///
    /// The compacted journal is written to a temporary file, synced and then
    /// renamed over the old one, so a crash leaves either journal intact.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary file cannot be written or renamed.
    pub fn compact(&self) -> StorageResult<CompactionReport> {
        let state = self.state.write();
        let mut file = self.file.lock();
        let bytes_before = file.metadata()?.len();

        let record = encode_record(&state.to_journal())?;
        let tmp_path = self.path.with_extension("compact");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&record)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        *file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let bytes_after = file.metadata()?.len();
        tracing::info!(bytes_before, bytes_after, "journal compacted");

        Ok(CompactionReport {
            bytes_before,
            bytes_after,
        })
    }
}

/// The file operations a journal append needs.
trait JournalFile: Write + Seek {
    fn truncate_to(&mut self, len: u64) -> std::io::Result<()>;
    fn sync(&mut self) -> std::io::Result<()>;
}

impl JournalFile for File {
    fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_data()
    }
}

/// Appends one record, or leaves the journal as it was.
///
/// A failed write or sync cuts the journal back to its previous length so
/// a write reported as failed never replays on the next open.
fn append_record<F: JournalFile>(file: &mut F, record: &[u8], sync: bool) -> StorageResult<()> {
    let end = file.seek(SeekFrom::End(0))?;
    let appended = file
        .write_all(record)
        .and_then(|()| if sync { file.sync() } else { Ok(()) });
    if let Err(err) = appended {
        if let Err(rollback) = file.truncate_to(end) {
            tracing::warn!(error = %err, rollback_error = %rollback, "journal rollback failed");
            return Err(rollback.into());
        }
        tracing::warn!(error = %err, "journal append failed and was rolled back");
        return Err(err.into());
    }
    Ok(())
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

impl LocalStore for FileStore {
    fn apply_batch(&self, batch: StoreBatch) -> StorageResult<Vec<u64>> {
        let mut state = self.state.write();
        let (ops, sequences) = state.prepare(batch)?;
        if ops.is_empty() {
            return Ok(sequences);
        }

        let record = encode_record(&ops)?;
        append_record(&mut *self.file.lock(), &record, self.options.sync_on_write)?;

        state.commit(ops);
        Ok(sequences)
    }

    fn get(&self, kind: &str, id: &str) -> StorageResult<Option<EntitySnapshot>> {
        Ok(self.state.read().get(kind, id))
    }

    fn get_all(&self, kind: &str) -> StorageResult<Vec<EntitySnapshot>> {
        Ok(self.state.read().get_all(kind))
    }

    fn list_operations(
        &self,
        status: Option<OperationStatus>,
    ) -> StorageResult<Vec<SyncOperation>> {
        Ok(self.state.read().list_operations(status))
    }

    fn get_operation(&self, id: OperationId) -> StorageResult<Option<SyncOperation>> {
        Ok(self.state.read().get_operation(id))
    }

    fn get_meta(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.state.read().get_meta(key))
    }

    fn get_conflict(&self, id: ConflictId) -> StorageResult<Option<Conflict>> {
        Ok(self.state.read().get_conflict(id))
    }

    fn list_conflicts(&self, filter: &ConflictFilter) -> StorageResult<Vec<Conflict>> {
        Ok(self.state.read().list_conflicts(filter))
    }

    fn list_resolutions(&self, kind: Option<&str>) -> StorageResult<Vec<ResolutionRecord>> {
        Ok(self.state.read().list_resolutions(kind))
    }
}
