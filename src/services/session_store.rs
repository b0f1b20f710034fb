use crate::config::UploadConfig;
use crate::services::upload_error::UploadError;
use crate::utils::keyed_mutex::KeyedMutex;
use crate::utils::validation::{guess_content_type, is_valid_upload_id};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Cursor, ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One in-flight resumable upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadSession {
    pub id: String,
    pub temp_path: PathBuf,
    pub total_length: u64,
    pub bytes_received: u64,
    pub completed: bool,
    /// Hand the finished upload over as an open file rather than a path
    pub send_file: bool,
    /// Decoded `Upload-Metadata` pairs
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl UploadSession {
    pub fn is_expired(&self, now: DateTime<Utc>, valid_duration: Duration) -> bool {
        now - self.last_activity > valid_duration
    }

    pub fn remaining(&self) -> u64 {
        self.total_length - self.bytes_received
    }
}

/// Where the bytes of a finished upload can be read from.
#[derive(Debug)]
pub enum ByteSource {
    Memory(Bytes),
    Path(PathBuf),
    File(File),
}

impl ByteSource {
    pub async fn into_reader(self) -> std::io::Result<Box<dyn AsyncRead + Unpin + Send>> {
        match self {
            Self::Memory(bytes) => Ok(Box::new(Cursor::new(bytes))),
            Self::Path(path) => Ok(Box::new(File::open(path).await?)),
            Self::File(file) => Ok(Box::new(file)),
        }
    }
}

/// A finished upload, produced by either the resumable or the one-shot path.
#[derive(Debug)]
pub struct CompletedUpload {
    pub filename: String,
    pub content_type: String,
    pub source: ByteSource,
    pub size: u64,
    /// Temp file to release once the content has been created
    pub temp_path: Option<PathBuf>,
}

/// In-flight resumable uploads keyed by identifier.
///
/// Every mutation of a session happens under that identifier's lock, so two
/// requests racing on the same upload are serialized and the second one
/// sees the offset written by the first.
pub struct UploadSessionStore {
    sessions: DashMap<String, UploadSession>,
    locks: KeyedMutex,
    tmp_dir: PathBuf,
    valid_duration: Duration,
    send_file: bool,
}

impl UploadSessionStore {
    pub fn new(config: &UploadConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            locks: KeyedMutex::new(),
            tmp_dir: config
                .tmp_file_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
            valid_duration: config.valid_duration(),
            send_file: config.send_file,
        }
    }

    pub async fn open(&self, id: &str, total_length: u64) -> Result<UploadSession, UploadError> {
        self.open_with_metadata(id, total_length, HashMap::new())
            .await
    }

    /// Starts a new upload of `total_length` bytes under `id`.
    pub async fn open_with_metadata(
        &self,
        id: &str,
        total_length: u64,
        metadata: HashMap<String, String>,
    ) -> Result<UploadSession, UploadError> {
        if !is_valid_upload_id(id) {
            return Err(UploadError::protocol(format!(
                "invalid upload identifier {id:?}"
            )));
        }

        let now = Utc::now();
        self.expire_stale(now).await;
        let _guard = self.locks.lock(id).await;

        if let Some(existing) = self.snapshot(id) {
            if !existing.is_expired(now, self.valid_duration) {
                return Err(UploadError::Conflict(id.to_string()));
            }
            self.discard(existing).await;
        }

        // A reopened identifier must not touch the file of a finalized
        // upload that is still being consumed.
        let temp_path = self
            .tmp_dir
            .join(format!("{}-{}", id, Uuid::new_v4().simple()));
        File::create(&temp_path).await?;

        let session = UploadSession {
            id: id.to_string(),
            temp_path,
            total_length,
            bytes_received: 0,
            completed: total_length == 0,
            send_file: self.send_file,
            metadata,
            created_at: now,
            last_activity: now,
        };
        self.sessions.insert(id.to_string(), session.clone());

        info!(upload_id = %id, total_length, "📦 Upload session opened");
        Ok(session)
    }

    /// Writes `bytes` at `offset`, which must equal the bytes received so far.
    /// On any failure the session is left exactly as it was.
    pub async fn append(
        &self,
        id: &str,
        offset: u64,
        bytes: &[u8],
    ) -> Result<UploadSession, UploadError> {
        let now = Utc::now();
        self.expire_stale(now).await;
        let _guard = self.locks.lock(id).await;

        let session = self.live_session(id, now).await?;

        if offset != session.bytes_received {
            return Err(UploadError::Range {
                id: id.to_string(),
                expected: session.bytes_received,
                actual: offset,
            });
        }
        if session.completed {
            return Err(UploadError::protocol(format!(
                "upload {id} is already complete"
            )));
        }

        let len = bytes.len() as u64;
        if len > session.remaining() {
            return Err(UploadError::TooLarge(format!(
                "chunk of {} bytes exceeds the {} bytes left in upload {}",
                len,
                session.remaining(),
                id
            )));
        }

        if let Err(e) = write_chunk(&session.temp_path, offset, bytes).await {
            warn!(upload_id = %id, "Chunk write failed, rolling back: {}", e);
            if let Err(e) = truncate(&session.temp_path, session.bytes_received).await {
                warn!(upload_id = %id, "Rollback of temp file failed: {}", e);
            }
            return Err(e.into());
        }

        let updated = {
            let mut entry = self
                .sessions
                .get_mut(id)
                .ok_or_else(|| UploadError::NotFound(id.to_string()))?;
            entry.bytes_received += len;
            entry.last_activity = Utc::now();
            entry.completed = entry.bytes_received == entry.total_length;
            entry.clone()
        };

        debug!(
            upload_id = %id,
            offset = updated.bytes_received,
            total = updated.total_length,
            "Chunk appended"
        );
        Ok(updated)
    }

    pub fn is_complete(&self, id: &str) -> bool {
        self.sessions.get(id).is_some_and(|s| s.completed)
    }

    /// Current state of a live upload.
    pub async fn status(&self, id: &str) -> Result<UploadSession, UploadError> {
        let now = Utc::now();
        self.expire_stale(now).await;
        self.live_session(id, now).await
    }

    /// Removes a finished upload from the live set and returns its bytes.
    /// The temp file stays on disk until [`Self::release`] is called.
    pub async fn finalize(&self, id: &str) -> Result<CompletedUpload, UploadError> {
        let now = Utc::now();
        self.expire_stale(now).await;
        let _guard = self.locks.lock(id).await;

        let session = self.live_session(id, now).await?;
        if !session.completed {
            return Err(UploadError::NotComplete(id.to_string()));
        }

        let source = if session.send_file {
            ByteSource::File(File::open(&session.temp_path).await?)
        } else {
            ByteSource::Path(session.temp_path.clone())
        };
        self.sessions.remove(id);

        let filename = session
            .metadata
            .get("filename")
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| id.to_string());
        let content_type = session
            .metadata
            .get("filetype")
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| guess_content_type(&filename));

        info!(upload_id = %id, size = session.total_length, "✅ Upload finalized");

        Ok(CompletedUpload {
            filename,
            content_type,
            source,
            size: session.total_length,
            temp_path: Some(session.temp_path),
        })
    }

    /// Abandons a live upload and deletes what was received.
    pub async fn terminate(&self, id: &str) -> Result<(), UploadError> {
        let now = Utc::now();
        let _guard = self.locks.lock(id).await;
        let session = self.live_session(id, now).await?;
        self.discard(session).await;
        info!(upload_id = %id, "🗑️ Upload terminated");
        Ok(())
    }

    /// Deletes the temp file of a consumed upload.
    pub async fn release(&self, path: &Path) {
        remove_temp_file(path).await;
    }

    /// Drops every session idle for longer than the valid duration.
    /// Sessions with a request in flight are left for the next pass.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> usize {
        let stale: Vec<UploadSession> = self
            .sessions
            .iter()
            .filter(|s| s.is_expired(now, self.valid_duration) && !self.locks.is_locked(s.key()))
            .map(|s| s.value().clone())
            .collect();

        let mut count = 0;
        for candidate in stale {
            let _guard = self.locks.lock(&candidate.id).await;
            // The identifier may have been reopened since the scan.
            let Some(current) = self.snapshot(&candidate.id) else {
                continue;
            };
            if current.temp_path != candidate.temp_path
                || !current.is_expired(now, self.valid_duration)
            {
                continue;
            }
            info!(upload_id = %current.id, "⌛ Expiring idle upload");
            if self.discard(current).await {
                count += 1;
            }
        }

        self.locks.cleanup();
        count
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn snapshot(&self, id: &str) -> Option<UploadSession> {
        self.sessions.get(id).map(|s| s.clone())
    }

    async fn live_session(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<UploadSession, UploadError> {
        match self.snapshot(id) {
            Some(session) if session.is_expired(now, self.valid_duration) => {
                self.discard(session).await;
                Err(UploadError::NotFound(id.to_string()))
            }
            Some(session) => Ok(session),
            None => Err(UploadError::NotFound(id.to_string())),
        }
    }

    /// Removes `session` if it is still the live entry for its identifier.
    async fn discard(&self, session: UploadSession) -> bool {
        let removed = self
            .sessions
            .remove_if(&session.id, |_, current| current.temp_path == session.temp_path)
            .is_some();
        if removed {
            remove_temp_file(&session.temp_path).await;
        }
        removed
    }
}

async fn write_chunk(path: &Path, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    Ok(())
}

async fn truncate(path: &Path, len: u64) -> std::io::Result<()> {
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(len).await
}

async fn remove_temp_file(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("Removed temp file {:?}", path),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove temp file {:?}: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    fn store_in(dir: &Path) -> UploadSessionStore {
        UploadSessionStore::new(&UploadConfig::enabled_in(dir))
    }

    async fn read_all(source: ByteSource) -> Vec<u8> {
        let mut reader = source.into_reader().await.unwrap();
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await.unwrap();
        data
    }

    #[tokio::test]
    async fn test_contiguous_chunks_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let chunks: [&[u8]; 3] = [b"hello ", b"resumable ", b"world"];
        let total: usize = chunks.iter().map(|c| c.len()).sum();

        store.open("round", total as u64).await.unwrap();
        let mut offset = 0u64;
        for chunk in chunks {
            let session = store.append("round", offset, chunk).await.unwrap();
            offset += chunk.len() as u64;
            assert_eq!(session.bytes_received, offset);
        }

        let completed = store.finalize("round").await.unwrap();
        assert_eq!(completed.size, total as u64);
        assert_eq!(read_all(completed.source).await, b"hello resumable world");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_two_chunk_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        store.open("abc", 10).await.unwrap();
        store.append("abc", 0, b"01234").await.unwrap();
        assert!(!store.is_complete("abc"));
        store.append("abc", 5, b"56789").await.unwrap();
        assert!(store.is_complete("abc"));

        let completed = store.finalize("abc").await.unwrap();
        let temp_path = completed.temp_path.clone().unwrap();
        assert_eq!(read_all(completed.source).await, b"0123456789");

        store.release(&temp_path).await;
        assert!(!temp_path.exists());
    }

    #[tokio::test]
    async fn test_reopened_identifier_keeps_finalized_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        store.open("abc", 10).await.unwrap();
        store.append("abc", 0, b"0123456789").await.unwrap();
        let completed = store.finalize("abc").await.unwrap();
        let finalized_path = completed.temp_path.clone().unwrap();

        // Same identifier opened again while the finished upload is consumed.
        let reopened = store.open("abc", 3).await.unwrap();
        assert_ne!(reopened.temp_path, finalized_path);

        assert_eq!(read_all(completed.source).await, b"0123456789");
        store.release(&finalized_path).await;
        assert!(!finalized_path.exists());

        let session = store.append("abc", 0, b"xyz").await.unwrap();
        assert!(session.completed);
        assert_eq!(std::fs::read(&session.temp_path).unwrap(), b"xyz");
    }

    #[tokio::test]
    async fn test_stale_snapshot_does_not_discard_reopened_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let old = store.open("abc", 4).await.unwrap();
        assert_eq!(store.expire_stale(Utc::now() + Duration::hours(2)).await, 1);
        let fresh = store.open("abc", 4).await.unwrap();

        // A sweep that scanned before the reopen still holds the old session.
        assert!(!store.discard(old).await);
        assert_eq!(store.status("abc").await.unwrap().temp_path, fresh.temp_path);
        assert!(fresh.temp_path.exists());
        assert_eq!(store.expire_stale(Utc::now()).await, 0);
    }

    #[tokio::test]
    async fn test_out_of_order_offset_leaves_state_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.open("abc", 10).await.unwrap();
        store.append("abc", 0, b"01234").await.unwrap();

        for bad in [0u64, 3, 7, 10] {
            let err = store.append("abc", bad, b"xx").await.unwrap_err();
            assert!(
                matches!(err, UploadError::Range { expected: 5, actual, .. } if actual == bad),
                "{err:?}"
            );
        }

        let session = store.status("abc").await.unwrap();
        assert_eq!(session.bytes_received, 5);
        assert!(!session.completed);
        assert_eq!(std::fs::read(&session.temp_path).unwrap(), b"01234");
    }

    #[tokio::test]
    async fn test_finalize_before_complete_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.open("partial", 4).await.unwrap();
        store.append("partial", 0, b"ab").await.unwrap();

        let err = store.finalize("partial").await.unwrap_err();
        assert!(matches!(err, UploadError::NotComplete(_)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_open_conflicts_until_expired() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.open("dup", 3).await.unwrap();

        let err = store.open("dup", 3).await.unwrap_err();
        assert!(matches!(err, UploadError::Conflict(_)));

        let expired = store.expire_stale(Utc::now() + Duration::hours(2)).await;
        assert_eq!(expired, 1);
        store.open("dup", 3).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_sessions_are_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let session = store.open("idle", 2).await.unwrap();
        store.append("idle", 0, b"ab").await.unwrap();

        assert_eq!(store.expire_stale(Utc::now()).await, 0);
        assert_eq!(store.expire_stale(Utc::now() + Duration::seconds(3601)).await, 1);

        assert!(matches!(
            store.append("idle", 2, b"").await.unwrap_err(),
            UploadError::NotFound(_)
        ));
        assert!(matches!(
            store.finalize("idle").await.unwrap_err(),
            UploadError::NotFound(_)
        ));
        assert!(!session.temp_path.exists());
    }

    #[tokio::test]
    async fn test_append_to_unknown_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let err = store.append("ghost", 0, b"x").await.unwrap_err();
        assert!(matches!(err, UploadError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_overflow_and_writes_after_completion_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.open("small", 3).await.unwrap();

        let err = store.append("small", 0, b"abcd").await.unwrap_err();
        assert!(matches!(err, UploadError::TooLarge(_)));
        assert_eq!(store.status("small").await.unwrap().bytes_received, 0);

        store.append("small", 0, b"abc").await.unwrap();
        let err = store.append("small", 3, b"d").await.unwrap_err();
        assert!(matches!(err, UploadError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_zero_length_upload_is_complete_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let session = store.open("empty", 0).await.unwrap();
        assert!(session.completed);

        let completed = store.finalize("empty").await.unwrap();
        assert_eq!(completed.size, 0);
        assert!(read_all(completed.source).await.is_empty());
    }

    #[tokio::test]
    async fn test_send_file_hands_over_open_handle() {
        let dir = tempfile::tempdir().unwrap();
        let config = UploadConfig {
            send_file: true,
            ..UploadConfig::enabled_in(dir.path())
        };
        let store = UploadSessionStore::new(&config);

        let mut metadata = HashMap::new();
        metadata.insert("filename".to_string(), "photo.png".to_string());
        store.open_with_metadata("img", 3, metadata).await.unwrap();
        store.append("img", 0, b"png").await.unwrap();

        let completed = store.finalize("img").await.unwrap();
        assert!(matches!(completed.source, ByteSource::File(_)));
        assert_eq!(completed.filename, "photo.png");
        assert_eq!(completed.content_type, "image/png");
    }

    #[tokio::test]
    async fn test_invalid_identifier_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let err = store.open("../escape", 1).await.unwrap_err();
        assert!(matches!(err, UploadError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_terminate_removes_session_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let session = store.open("bye", 5).await.unwrap();
        store.append("bye", 0, b"12").await.unwrap();

        store.terminate("bye").await.unwrap();
        assert!(store.is_empty());
        assert!(!session.temp_path.exists());
        assert!(matches!(
            store.terminate("bye").await.unwrap_err(),
            UploadError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_appends_at_same_offset() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(dir.path()));
        store.open("race", 8).await.unwrap();

        let tasks: Vec<_> = (0..2)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let chunk = if i == 0 { b"aaaa" } else { b"bbbb" };
                    store.append("race", 0, chunk).await
                })
            })
            .collect();

        let mut ok = 0;
        let mut range = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => ok += 1,
                Err(UploadError::Range { .. }) => range += 1,
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }
        assert_eq!((ok, range), (1, 1));
        assert_eq!(store.status("race").await.unwrap().bytes_received, 4);
    }
}
