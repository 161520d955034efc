//! Directory-backed holding area for converted MP3 files.
//!
//! Files are named `{prefix}_{videoId}_{timestamp}.mp3`; `{videoId}_{timestamp}`
//! is the file key handed out in download URLs. The in-memory index is the
//! source of truth for lookups, the directory is only the backing store.

use std::{
    collections::{HashMap, HashSet},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::Mutex,
    task::JoinHandle,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

pub const ARTIFACT_EXTENSION: &str = "mp3";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact directory {path:?} is not usable: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("artifact {path:?} could not be read: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub file_key: String,
    pub video_id: String,
    pub timestamp: i64,
    pub path: PathBuf,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn size_mb(&self) -> f64 {
        (self.size as f64 / 1_048_576.0 * 100.0).round() / 100.0
    }
}

/// A unique slot handed out before extraction starts. The extractor writes
/// `{stem}.mp3`; intermediate files share the stem.
///
/// A reservation that is dropped without [`ArtifactStore::commit`] or
/// [`ArtifactStore::discard`] (cancelled request, panicking extractor) frees
/// its slot and partial files on its own.
#[derive(Debug)]
pub struct Reservation {
    pub file_key: String,
    pub video_id: String,
    pub timestamp: i64,
    pub stem: PathBuf,
    store: Arc<ArtifactStore>,
    settled: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let store = Arc::clone(&self.store);
        let file_key = std::mem::take(&mut self.file_key);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    warn!("Conversion {file_key} was abandoned, releasing its slot");
                    store.release(&file_key).await;
                });
            }
            Err(_) => {
                if let Ok(mut index) = store.index.try_lock()
                    && matches!(index.get(&file_key), Some(Slot::Pending))
                {
                    index.remove(&file_key);
                }
            }
        }
    }
}

#[derive(Debug)]
enum Slot {
    Pending,
    Ready(Artifact),
}

#[derive(Debug)]
pub struct ArtifactStore {
    dir: PathBuf,
    prefix: String,
    index: Mutex<HashMap<String, Slot>>,
}

impl ArtifactStore {
    /// Creates the directory if needed and checks that it is writable.
    pub async fn open(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        let prefix = prefix.into();
        let directory_error = |source| StoreError::Directory {
            path: dir.clone(),
            source,
        };

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(directory_error)?;

        let probe = dir.join(format!(".{prefix}-write-probe"));
        tokio::fs::write(&probe, b"")
            .await
            .map_err(directory_error)?;
        if let Err(error) = tokio::fs::remove_file(&probe).await {
            warn!("Could not remove write probe {:?}: {error}", probe);
        }

        Ok(Self {
            dir,
            prefix,
            index: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, file_key: &str) -> PathBuf {
        self.dir.join(format!(
            "{}_{file_key}.{ARTIFACT_EXTENSION}",
            self.prefix
        ))
    }

    /// Allocates a key that is unused in the index. Same-millisecond
    /// reservations for one video are pushed to the next free timestamp.
    pub async fn reserve(self: &Arc<Self>, video_id: &str) -> Reservation {
        let mut timestamp = Utc::now().timestamp_millis();
        let mut index = self.index.lock().await;

        let file_key = loop {
            let candidate = file_key_for(video_id, timestamp);
            if !index.contains_key(&candidate) {
                break candidate;
            }
            timestamp += 1;
        };
        index.insert(file_key.clone(), Slot::Pending);

        Reservation {
            stem: self.dir.join(format!("{}_{file_key}", self.prefix)),
            file_key,
            video_id: video_id.to_string(),
            timestamp,
            store: Arc::clone(self),
            settled: false,
        }
    }

    pub async fn commit(
        &self,
        mut reservation: Reservation,
        path: &Path,
    ) -> Result<Artifact, StoreError> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(source) => {
                let error = StoreError::Artifact {
                    path: path.to_path_buf(),
                    source,
                };
                self.discard(reservation).await;
                return Err(error);
            }
        };

        reservation.settled = true;
        let artifact = Artifact {
            file_key: reservation.file_key.clone(),
            video_id: reservation.video_id.clone(),
            timestamp: reservation.timestamp,
            path: path.to_path_buf(),
            size: metadata.len(),
            created_at: Utc::now(),
        };

        self.index
            .lock()
            .await
            .insert(artifact.file_key.clone(), Slot::Ready(artifact.clone()));
        debug!("Stored artifact {} ({} bytes)", artifact.file_key, artifact.size);

        Ok(artifact)
    }

    /// Drops a reservation and any partial files written under its stem.
    pub async fn discard(&self, mut reservation: Reservation) {
        reservation.settled = true;
        self.release(&reservation.file_key).await;
    }

    async fn release(&self, file_key: &str) {
        {
            let mut index = self.index.lock().await;
            if matches!(index.get(file_key), Some(Slot::Pending)) {
                index.remove(file_key);
            }
        }

        let stem = format!("{}_{file_key}", self.prefix);
        let partial_prefix = format!("{stem}.");
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(error) => {
                warn!("Could not open artifact directory for cleanup: {error}");
                return;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(error) => {
                    warn!("Could not iterate artifact directory for cleanup: {error}");
                    break;
                }
            };

            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name == stem || name.starts_with(&partial_prefix) {
                remove_file_logged(&entry.path()).await;
            }
        }
    }

    /// Exact key lookup first, then a substring match over artifact file
    /// names. Several substring matches resolve to the newest one.
    pub async fn find(&self, file_key: &str) -> Option<Artifact> {
        if file_key.is_empty() {
            return None;
        }

        let index = self.index.lock().await;
        if let Some(Slot::Ready(artifact)) = index.get(file_key) {
            return Some(artifact.clone());
        }

        index
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(artifact) => Some(artifact),
                Slot::Pending => None,
            })
            .filter(|artifact| {
                artifact
                    .path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| {
                        name.contains(file_key) && name.ends_with(&format!(".{ARTIFACT_EXTENSION}"))
                    })
            })
            .max_by_key(|artifact| artifact.timestamp)
            .cloned()
    }

    /// Removes the artifact from the index and from disk.
    pub async fn remove(&self, file_key: &str) {
        if let Some(artifact) = self.unindex(file_key).await {
            remove_file_logged(&artifact.path).await;
        }
    }

    /// Forgets the artifact right away and unlinks it once `delay` has
    /// passed, so a transfer that just finished is not cut short.
    pub fn delete_after_serve(
        self: &Arc<Self>,
        file_key: String,
        delay: Duration,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let Some(artifact) = store.unindex(&file_key).await else {
                return;
            };
            tokio::time::sleep(delay).await;
            remove_file_logged(&artifact.path).await;
            debug!("Deleted served artifact {file_key}");
        })
    }

    /// Deletes store-owned files older than `max_age` and forgets index
    /// entries whose files are gone. Returns the number of files removed.
    pub async fn sweep_expired(&self, max_age: Duration) -> usize {
        let started_at = Utc::now();
        let owned_prefix = format!("{}_", self.prefix);

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    warn!("Could not open artifact directory for sweep: {error}");
                }
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = HashSet::new();
        let mut present = HashSet::new();

        loop {
            let maybe_entry = match entries.next_entry().await {
                Ok(value) => value,
                Err(error) => {
                    warn!("Could not iterate artifact directory for sweep: {error}");
                    break;
                }
            };

            let Some(entry) = maybe_entry else {
                break;
            };

            let path = entry.path();
            let Some(name) = entry.file_name().to_str().map(ToString::to_string) else {
                continue;
            };
            if !name.starts_with(&owned_prefix) {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(error) => {
                    warn!("Could not read metadata of {:?}: {error}", path);
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }

            let modified_at = match metadata.modified() {
                Ok(value) => value,
                Err(error) => {
                    warn!("Could not read modification time of {:?}: {error}", path);
                    present.insert(name);
                    continue;
                }
            };

            let age = now.duration_since(modified_at).unwrap_or_default();
            if age <= max_age {
                present.insert(name);
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    removed.insert(name);
                }
                Err(error) if error.kind() == ErrorKind::NotFound => {
                    removed.insert(name);
                }
                Err(error) => {
                    warn!("Could not delete expired artifact {:?}: {error}", path);
                    present.insert(name);
                }
            }
        }

        let mut index = self.index.lock().await;
        index.retain(|_, slot| match slot {
            Slot::Pending => true,
            Slot::Ready(artifact) => {
                let name = artifact
                    .path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or_default();
                if removed.contains(name) {
                    return false;
                }
                present.contains(name) || artifact.created_at >= started_at
            }
        });

        if !removed.is_empty() {
            info!("Swept {} expired artifact(s)", removed.len());
        }
        removed.len()
    }

    /// Indexes `{prefix}_{videoId}_{timestamp}.mp3` files left over from a
    /// previous run. Returns the number of adopted artifacts.
    pub async fn adopt_existing(&self) -> Result<usize, StoreError> {
        let directory_error = |source| StoreError::Directory {
            path: self.dir.clone(),
            source,
        };
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(directory_error)?;

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(directory_error)? {
            let name = entry.file_name();
            let Some((video_id, timestamp)) = name
                .to_str()
                .and_then(|name| parse_artifact_name(&self.prefix, name))
            else {
                continue;
            };

            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(error) => {
                    warn!("Could not read metadata of {:?}: {error}", entry.path());
                    continue;
                }
            };

            found.push(Artifact {
                file_key: file_key_for(&video_id, timestamp),
                video_id,
                timestamp,
                path: entry.path(),
                size: metadata.len(),
                created_at: DateTime::from_timestamp_millis(timestamp).unwrap_or_else(Utc::now),
            });
        }

        let mut index = self.index.lock().await;
        let mut adopted = 0;
        for artifact in found {
            if !index.contains_key(&artifact.file_key) {
                index.insert(artifact.file_key.clone(), Slot::Ready(artifact));
                adopted += 1;
            }
        }

        Ok(adopted)
    }

    /// Runs [`ArtifactStore::sweep_expired`] every `every`, starting one
    /// interval from now.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, max_age: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                ticker.tick().await;
                store.sweep_expired(max_age).await;
            }
        })
    }

    async fn unindex(&self, file_key: &str) -> Option<Artifact> {
        match self.index.lock().await.remove(file_key) {
            Some(Slot::Ready(artifact)) => Some(artifact),
            Some(Slot::Pending) | None => None,
        }
    }
}

pub fn file_key_for(video_id: &str, timestamp: i64) -> String {
    format!("{video_id}_{timestamp}")
}

/// Splits `{prefix}_{videoId}_{timestamp}.mp3`. Video ids may contain `_`,
/// so the timestamp is taken from the right.
pub fn parse_artifact_name(prefix: &str, name: &str) -> Option<(String, i64)> {
    let rest = name
        .strip_prefix(prefix)?
        .strip_prefix('_')?
        .strip_suffix(&format!(".{ARTIFACT_EXTENSION}"))?;
    let (video_id, timestamp) = rest.rsplit_once('_')?;
    if video_id.is_empty() {
        return None;
    }
    let timestamp = timestamp.parse::<i64>().ok()?;
    Some((video_id.to_string(), timestamp))
}

async fn remove_file_logged(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await
        && error.kind() != ErrorKind::NotFound
    {
        warn!("Could not delete artifact {:?}: {error}", path);
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use tempfile::tempdir;

    use super::*;

    async fn store_in(dir: &Path) -> Arc<ArtifactStore> {
        Arc::new(ArtifactStore::open(dir, "ytmp3").await.unwrap())
    }

    async fn put(store: &Arc<ArtifactStore>, video_id: &str, bytes: &[u8]) -> Artifact {
        let reservation = store.reserve(video_id).await;
        let path = reservation.stem.with_extension(ARTIFACT_EXTENSION);
        tokio::fs::write(&path, bytes).await.unwrap();
        store.commit(reservation, &path).await.unwrap()
    }

    fn age_file(path: &Path, age: Duration) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[tokio::test]
    async fn open_creates_missing_directory() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("nested").join("artifacts");

        let store = ArtifactStore::open(&dir, "ytmp3").await.unwrap();
        assert!(dir.is_dir());
        assert_eq!(store.dir(), dir.as_path());
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn concurrent_reservations_never_collide() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path()).await;

        let (first, second, third) = tokio::join!(
            store.reserve("dQw4w9WgXcQ"),
            store.reserve("dQw4w9WgXcQ"),
            store.reserve("dQw4w9WgXcQ"),
        );

        let keys: HashSet<_> = [&first, &second, &third]
            .iter()
            .map(|reservation| reservation.file_key.clone())
            .collect();
        assert_eq!(keys.len(), 3);
        assert!(
            first
                .stem
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("ytmp3_dQw4w9WgXcQ_"))
        );
    }

    #[tokio::test]
    async fn commit_then_find_by_key_and_substring() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path()).await;
        let artifact = put(&store, "dQw4w9WgXcQ", b"ID3audio").await;

        assert_eq!(artifact.size, 8);
        assert_eq!(artifact.path, store.path_for(&artifact.file_key));
        assert_eq!(store.find(&artifact.file_key).await, Some(artifact.clone()));
        assert_eq!(store.find("dQw4w9WgXcQ").await, Some(artifact));
        assert_eq!(store.find("missing_123").await, None);
        assert_eq!(store.find("").await, None);
    }

    #[tokio::test]
    async fn substring_lookup_prefers_the_newest_artifact() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path()).await;
        let older = put(&store, "dQw4w9WgXcQ", b"first").await;
        let newer = put(&store, "dQw4w9WgXcQ", b"second").await;

        assert!(newer.timestamp > older.timestamp);
        assert_eq!(store.find("dQw4w9WgXcQ").await, Some(newer));
    }

    #[tokio::test]
    async fn pending_reservations_are_not_found() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path()).await;
        let reservation = store.reserve("dQw4w9WgXcQ").await;

        assert_eq!(store.find(&reservation.file_key).await, None);
    }

    #[tokio::test]
    async fn discard_removes_partial_files_only_for_its_stem() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path()).await;
        let keep = put(&store, "aaaaaaaaaaa", b"keep").await;
        let reservation = store.reserve("bbbbbbbbbbb").await;
        let partial = reservation.stem.with_extension("webm.part");
        tokio::fs::write(&partial, b"partial").await.unwrap();

        store.discard(reservation).await;

        assert!(!partial.exists());
        assert!(keep.path.exists());
    }

    #[tokio::test]
    async fn dropped_reservation_releases_slot_and_partial_files() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path()).await;
        let reservation = store.reserve("dQw4w9WgXcQ").await;
        let partial = reservation.stem.with_extension("webm.part");
        tokio::fs::write(&partial, b"partial").await.unwrap();

        drop(reservation);
        for _ in 0..50 {
            if store.index.lock().await.is_empty() && !partial.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(store.index.lock().await.is_empty());
        assert!(!partial.exists());
    }

    #[tokio::test]
    async fn committed_reservation_is_not_released_on_drop() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path()).await;
        let artifact = put(&store, "dQw4w9WgXcQ", b"audio").await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.find(&artifact.file_key).await, Some(artifact.clone()));
        assert!(artifact.path.exists());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_store_files() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path()).await;
        let old = put(&store, "oldoldoldol", b"old").await;
        let fresh = put(&store, "freshfreshf", b"fresh").await;
        let foreign = temp.path().join("notes.txt");
        std::fs::write(&foreign, b"not ours").unwrap();

        age_file(&old.path, Duration::from_secs(2 * 60 * 60));
        age_file(&fresh.path, Duration::from_secs(30 * 60));
        age_file(&foreign, Duration::from_secs(2 * 60 * 60));

        let removed = store.sweep_expired(Duration::from_secs(60 * 60)).await;

        assert_eq!(removed, 1);
        assert!(!old.path.exists());
        assert!(fresh.path.exists());
        assert!(foreign.exists());
        assert_eq!(store.find(&old.file_key).await, None);
        assert_eq!(store.find(&fresh.file_key).await, Some(fresh));
    }

    #[tokio::test]
    async fn delete_after_serve_unlinks_after_delay() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path()).await;
        let artifact = put(&store, "dQw4w9WgXcQ", b"audio").await;

        let handle = store.delete_after_serve(artifact.file_key.clone(), Duration::from_millis(20));
        handle.await.unwrap();

        assert!(!artifact.path.exists());
        assert_eq!(store.find(&artifact.file_key).await, None);
    }

    #[tokio::test]
    async fn remove_deletes_file_and_index_entry() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path()).await;
        let artifact = put(&store, "dQw4w9WgXcQ", b"audio").await;

        store.remove(&artifact.file_key).await;
        store.remove(&artifact.file_key).await;

        assert!(!artifact.path.exists());
        assert_eq!(store.find(&artifact.file_key).await, None);
    }

    #[tokio::test]
    async fn adopts_files_from_previous_run() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("ytmp3_a_b-c_d1234_1700000000000.mp3"), b"1").unwrap();
        std::fs::write(temp.path().join("ytmp3_bad.mp3"), b"2").unwrap();
        std::fs::write(temp.path().join("other_x_1.mp3"), b"3").unwrap();

        let store = store_in(temp.path()).await;
        assert_eq!(store.adopt_existing().await.unwrap(), 1);

        let artifact = store.find("a_b-c_d1234_1700000000000").await.unwrap();
        assert_eq!(artifact.video_id, "a_b-c_d1234");
        assert_eq!(artifact.timestamp, 1_700_000_000_000);
        assert_eq!(artifact.size, 1);
    }

    #[test]
    fn parses_artifact_names() {
        assert_eq!(
            parse_artifact_name("ytmp3", "ytmp3_dQw4w9WgXcQ_1700000000000.mp3"),
            Some(("dQw4w9WgXcQ".to_string(), 1_700_000_000_000))
        );
        assert_eq!(parse_artifact_name("ytmp3", "ytmp3_dQw4w9WgXcQ_x.mp3"), None);
        assert_eq!(parse_artifact_name("ytmp3", "ytmp3__17.mp3"), None);
        assert_eq!(parse_artifact_name("ytmp3", "ytmp3_dQw4w9WgXcQ_17.webm"), None);
    }

    #[test]
    fn size_is_reported_in_megabytes() {
        let artifact = Artifact {
            file_key: "k_1".to_string(),
            video_id: "k".to_string(),
            timestamp: 1,
            path: PathBuf::from("/tmp/ytmp3_k_1.mp3"),
            size: 3 * 1_048_576 + 524_288,
            created_at: Utc::now(),
        };
        assert_eq!(artifact.size_mb(), 3.5);
    }
}
