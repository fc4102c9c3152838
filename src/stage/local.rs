//! Filesystem-backed object stage

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;

use super::lock::LockTable;
use super::{
    Attributes, LatestPointer, META_SUFFIX, ObjectMetadata, ObjectRef, ObjectStage, Stage,
    StageLock, StagedObject, content_hash, latest_key, stage_prefix, verify_payload,
};
use crate::error::StorageError;

const LOCK_FILE: &str = ".lock";
const LOCK_POLL: Duration = Duration::from_millis(25);
const MIN_HEARTBEAT: Duration = Duration::from_millis(50);

/// Object stage rooted at a local directory
///
/// Payloads and sidecars are written to a temporary file, fsynced and then
/// renamed into place, so readers never observe a partial object. The latest
/// pointer is replaced the same way. Locks combine an in-process table with a
/// lock file so separate processes on the same host also serialize. A holder
/// refreshes its lock file's mtime while it runs; only a file left untouched
/// for `stale_lock_after` is treated as abandoned.
#[derive(Debug, Clone)]
pub struct LocalObjectStage {
    root: PathBuf,
    locks: LockTable,
    lock_timeout: Duration,
    stale_lock_after: Duration,
}

impl LocalObjectStage {
    /// Create a stage rooted at `root`; the directory is created on first write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: LockTable::new(),
            lock_timeout: Duration::from_secs(300),
            stale_lock_after: Duration::from_secs(3600),
        }
    }

    /// Set how long `lock` waits before giving up
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set how long a lock file may go without a heartbeat before it is
    /// considered abandoned
    pub fn with_stale_lock_after(mut self, age: Duration) -> Self {
        self.stale_lock_after = age;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn read_metadata(&self, reference: &ObjectRef) -> Result<ObjectMetadata, StorageError> {
        let path = self.path_for(&reference.meta_key());
        let raw = fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(reference.key()),
            _ => StorageError::from(e),
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn acquire_lock_file(&self, path: &Path, deadline: Instant) -> Result<LockFile, StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "pid={} at={}", std::process::id(), Utc::now());
                    return Ok(LockFile::hold(path.to_path_buf(), self.heartbeat_interval()));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.remove_if_stale(path) {
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(StorageError::LockConflict(format!(
                            "lock file {} is held by another process",
                            path.display()
                        )));
                    }
                    thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.stale_lock_after / 4).max(MIN_HEARTBEAT)
    }

    fn remove_if_stale(&self, path: &Path) -> bool {
        let age = fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok());
        match age {
            Some(age) if age > self.stale_lock_after => {
                tracing::warn!(lock = %path.display(), ?age, "removing abandoned lock file");
                fs::remove_file(path).is_ok()
            }
            _ => false,
        }
    }
}

/// Lock file kept fresh by a heartbeat thread and removed on drop
#[derive(Debug)]
struct LockFile {
    path: PathBuf,
    stop: Option<Sender<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl LockFile {
    fn hold(path: PathBuf, interval: Duration) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        let touched = path.clone();
        let heartbeat = thread::spawn(move || {
            while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                if let Err(e) = touch(&touched) {
                    tracing::warn!(lock = %touched.display(), error = %e, "lock heartbeat failed");
                    break;
                }
            }
        });
        Self {
            path,
            stop: Some(stop),
            heartbeat: Some(heartbeat),
        }
    }
}

fn touch(path: &Path) -> std::io::Result<()> {
    OpenOptions::new()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::now())
}

impl Drop for LockFile {
    fn drop(&mut self) {
        // Disconnecting the channel ends the heartbeat loop.
        drop(self.stop.take());
        if let Some(heartbeat) = self.heartbeat.take() {
            let _ = heartbeat.join();
        }
        let _ = fs::remove_file(&self.path);
    }
}

/// Write `bytes` to `path` through a synced temporary file and a rename
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let parent = path
        .parent()
        .ok_or_else(|| StorageError::Io(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("object");
    let tmp = parent.join(format!(".{}.tmp-{}", file_name, uuid::Uuid::new_v4()));

    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        sync_dir(parent);
        Ok::<(), std::io::Error>(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result.map_err(StorageError::from)
}

fn sync_dir(dir: &Path) {
    // Directory handles cannot be opened for sync on every platform.
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

impl ObjectStage for LocalObjectStage {
    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }

    fn put(
        &self,
        dataset_id: &str,
        stage: Stage,
        partition_key: &str,
        payload: &[u8],
        attributes: Attributes,
    ) -> Result<ObjectRef, StorageError> {
        let reference = ObjectRef {
            dataset_id: dataset_id.to_string(),
            stage,
            partition_key: partition_key.to_string(),
            content_hash: content_hash(payload),
        };

        let payload_path = self.path_for(&reference.key());
        let meta_path = self.path_for(&reference.meta_key());
        if payload_path.exists() && meta_path.exists() {
            tracing::debug!(key = %reference, "object already staged");
            return Ok(reference);
        }

        let metadata = ObjectMetadata {
            dataset_id: reference.dataset_id.clone(),
            stage,
            partition_key: reference.partition_key.clone(),
            content_hash: reference.content_hash.clone(),
            byte_size: payload.len() as u64,
            created_at: Utc::now(),
            attributes,
        };

        write_atomic(&payload_path, payload)?;
        write_atomic(&meta_path, &serde_json::to_vec_pretty(&metadata)?)?;
        tracing::debug!(key = %reference, bytes = payload.len(), "object staged");
        Ok(reference)
    }

    fn get(&self, reference: &ObjectRef) -> Result<StagedObject, StorageError> {
        let payload = fs::read(self.path_for(&reference.key())).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(reference.key()),
            _ => StorageError::from(e),
        })?;
        verify_payload(reference, &payload)?;
        let metadata = self.read_metadata(reference)?;
        Ok(StagedObject {
            reference: reference.clone(),
            metadata,
            payload,
        })
    }

    fn latest_pointer(
        &self,
        dataset_id: &str,
        stage: Stage,
    ) -> Result<Option<LatestPointer>, StorageError> {
        match fs::read(self.path_for(&latest_key(dataset_id, stage))) {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn advance_latest(&self, reference: &ObjectRef) -> Result<LatestPointer, StorageError> {
        if !self.path_for(&reference.key()).exists() {
            return Err(StorageError::NotFound(reference.key()));
        }
        let metadata = self.read_metadata(reference)?;
        let pointer = LatestPointer::new(&metadata);
        write_atomic(
            &self.path_for(&latest_key(&reference.dataset_id, reference.stage)),
            &serde_json::to_vec_pretty(&pointer)?,
        )?;
        tracing::debug!(key = %reference, "latest pointer advanced");
        Ok(pointer)
    }

    fn lock(&self, dataset_id: &str, stage: Stage) -> Result<StageLock, StorageError> {
        let name = stage_prefix(dataset_id, stage);
        let deadline = Instant::now() + self.lock_timeout;
        let table_guard = self.locks.acquire(&name, self.lock_timeout)?;
        let file_guard =
            self.acquire_lock_file(&self.path_for(&name).join(LOCK_FILE), deadline)?;
        Ok(StageLock::new(
            name,
            vec![Box::new(file_guard), Box::new(table_guard)],
        ))
    }

    fn list(&self, dataset_id: &str, stage: Stage) -> Result<Vec<ObjectMetadata>, StorageError> {
        let dir = self.path_for(&stage_prefix(dataset_id, stage));
        let partitions = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut objects = Vec::new();
        for partition in partitions {
            let partition = partition?;
            if !partition.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(partition.path())? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with('.') || !name.ends_with(META_SUFFIX) {
                    continue;
                }
                let raw = fs::read(entry.path())?;
                objects.push(serde_json::from_slice::<ObjectMetadata>(&raw)?);
            }
        }
        objects.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.content_hash.cmp(&b.content_hash))
        });
        Ok(objects)
    }
}
