//! Disk cache for transcoded artifacts
//!
//! Artifacts are addressed purely by `CacheFingerprint`. At most one producer
//! runs per fingerprint: concurrent requests for an in-flight key attach to
//! the running production and read the partially written file as it grows.
//! Completed artifacts are tracked in an LRU index and evicted by total size.

mod production;
mod reader;

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use futures::Stream;
use lru::LruCache;
use parking_lot::Mutex;
use production::Production;
pub use production::{ProductionProgress, ProductionStatus};
pub use reader::CachedStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::media::CacheFingerprint;
use crate::transcoding::TranscodingError;

const PART_SUFFIX: &str = "part";

/// Errors that can occur during transcode cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error during {operation} on {path}: {reason}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error(transparent)]
    Transcoding(#[from] TranscodingError),

    #[error("Transcode production failed: {reason}")]
    ProductionFailed { reason: String },
}

impl CacheError {
    fn io(operation: &'static str, path: &Path, error: std::io::Error) -> Self {
        CacheError::Io {
            operation,
            path: path.to_path_buf(),
            reason: error.to_string(),
        }
    }
}

/// Completed artifact entry with access metadata
#[derive(Debug, Clone)]
pub struct CachedArtifact {
    pub path: PathBuf,
    pub size: u64,
    /// When this entry was first indexed
    pub cached_at: Instant,
    pub access_count: u64,
    pub last_accessed: Instant,
}

impl CachedArtifact {
    fn new(path: PathBuf, size: u64) -> Self {
        let now = Instant::now();
        Self {
            path,
            size,
            cached_at: now,
            access_count: 0,
            last_accessed: now,
        }
    }

    fn mark_accessed(&mut self) {
        self.access_count += 1;
        self.last_accessed = Instant::now();
    }

    pub fn age(&self) -> Duration {
        self.cached_at.elapsed()
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_size: u64,
    pub in_flight: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    /// Requests that joined an in-flight production
    pub attach_count: u64,
    pub eviction_count: u64,
    /// Hit rate percentage, counting attaches as hits
    pub hit_rate: f64,
}

impl CacheStats {
    /// Calculate hit rate percentage
    pub fn calculate_hit_rate(hit_count: u64, miss_count: u64) -> f64 {
        if hit_count + miss_count == 0 {
            0.0
        } else {
            (hit_count as f64) / ((hit_count + miss_count) as f64) * 100.0
        }
    }
}

/// Outcome of `TranscodeCache::get_or_produce`.
#[derive(Debug)]
pub enum CacheLookup {
    /// Completed artifact on disk
    Hit(PathBuf),
    /// Joined a production started by another request
    Attached(CachedStream),
    /// Started a new production
    Produced(CachedStream),
}

struct CacheState {
    index: LruCache<String, CachedArtifact>,
    in_flight: HashMap<String, Arc<Production>>,
    total_size: u64,
}

pub(crate) struct CacheInner {
    config: CacheConfig,
    state: Mutex<CacheState>,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
    attach_count: AtomicU64,
    eviction_count: AtomicU64,
}

/// Transcode cache shared by every request. Cheap to clone.
#[derive(Clone)]
pub struct TranscodeCache {
    inner: Arc<CacheInner>,
}

impl TranscodeCache {
    /// Opens the cache directory, indexing completed artifacts and deleting
    /// partial files left by an earlier run.
    ///
    /// # Errors
    /// - `CacheError::Io` - Directory cannot be created or listed
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        let directory = config.directory.clone();
        std::fs::create_dir_all(&directory)
            .map_err(|e| CacheError::io("create directory", &directory, e))?;

        let mut found = Vec::new();
        let entries = std::fs::read_dir(&directory)
            .map_err(|e| CacheError::io("list directory", &directory, e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }

            if path.extension().is_some_and(|ext| ext == PART_SUFFIX) {
                tracing::debug!("Removing stale partial artifact {}", path.display());
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!("Failed to remove {}: {}", path.display(), e);
                }
                continue;
            }

            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, name, path, metadata.len()));
        }

        // Oldest first so recently written artifacts are evicted last
        found.sort_by_key(|(modified, ..)| *modified);
        let mut index = LruCache::unbounded();
        let mut total_size = 0;
        for (_, name, path, size) in found {
            total_size += size;
            index.put(name, CachedArtifact::new(path, size));
        }

        tracing::info!(
            "Opened transcode cache at {} ({} artifacts, {} bytes)",
            directory.display(),
            index.len(),
            total_size
        );

        Ok(Self {
            inner: Arc::new(CacheInner {
                config,
                state: Mutex::new(CacheState {
                    index,
                    in_flight: HashMap::new(),
                    total_size,
                }),
                hit_count: AtomicU64::new(0),
                miss_count: AtomicU64::new(0),
                attach_count: AtomicU64::new(0),
                eviction_count: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Path of a completed artifact, or `None` on a miss.
    pub fn get(&self, key: &CacheFingerprint) -> Option<PathBuf> {
        let mut state = self.inner.state.lock();
        match state.index.get_mut(&key.file_name()) {
            Some(artifact) => {
                artifact.mark_accessed();
                self.inner.hit_count.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "Cache hit for {} (access #{}, age: {:?})",
                    key,
                    artifact.access_count,
                    artifact.age()
                );
                Some(artifact.path.clone())
            }
            None => {
                self.inner.miss_count.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Cache miss for {}", key);
                None
            }
        }
    }

    /// True if a completed artifact exists. Does not touch statistics.
    pub fn contains(&self, key: &CacheFingerprint) -> bool {
        self.inner.state.lock().index.contains(&key.file_name())
    }

    /// True while a producer is running for `key`.
    pub fn is_producing(&self, key: &CacheFingerprint) -> bool {
        self.inner
            .state
            .lock()
            .in_flight
            .contains_key(&key.file_name())
    }

    /// Serves `key` from disk, attaches to its in-flight production, or
    /// starts a new production with `factory`.
    ///
    /// `factory` runs at most once per call and only when no artifact or
    /// live production exists. It receives the token the cache cancels once
    /// every attached consumer has gone away. A production that was cancelled
    /// is never joined: the call waits for it to settle, then serves the
    /// artifact it finished or starts over.
    ///
    /// # Errors
    /// - `CacheError::Io` - Partial artifact could not be created
    /// - `CacheError::Transcoding` - `factory` failed before producing bytes
    pub async fn get_or_produce<F, Fut, S>(
        &self,
        key: &CacheFingerprint,
        factory: F,
    ) -> Result<CacheLookup, CacheError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<S, TranscodingError>>,
        S: Stream<Item = Result<Bytes, TranscodingError>> + Send + 'static,
    {
        let name = key.file_name();

        let (production, reader) = loop {
            let mut settling = {
                let mut state = self.inner.state.lock();

                if let Some(artifact) = state.index.get_mut(&name) {
                    artifact.mark_accessed();
                    self.inner.hit_count.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Cache hit for {}", key);
                    return Ok(CacheLookup::Hit(artifact.path.clone()));
                }

                match state.in_flight.get(&name) {
                    Some(production) if !production.is_doomed() => {
                        let reader = CachedStream::attach(production);
                        self.inner.attach_count.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("Attached to in-flight production of {}", key);
                        return Ok(CacheLookup::Attached(reader));
                    }
                    Some(production) => production.subscribe(),
                    None => {
                        self.inner.miss_count.fetch_add(1, Ordering::Relaxed);
                        let production =
                            Arc::new(Production::new(key.clone(), self.part_path(&name)));
                        let reader = CachedStream::attach(&production);
                        state.in_flight.insert(name.clone(), Arc::clone(&production));
                        tracing::debug!("Cache miss for {}, starting production", key);
                        break (production, reader);
                    }
                }
            };

            tracing::debug!("Waiting for cancelled production of {} to settle", key);
            let _ = settling
                .wait_for(|progress| progress.status != ProductionStatus::Streaming)
                .await;
        };

        let file = match tokio::fs::File::create(production.part_path()).await {
            Ok(file) => file,
            Err(e) => {
                let error = CacheError::io("create", production.part_path(), e);
                self.inner.abandon(&production, error.to_string()).await;
                return Err(error);
            }
        };

        match factory(production.cancel_token()).await {
            Ok(source) => {
                tokio::spawn(production::run(
                    Arc::clone(&self.inner),
                    production,
                    file,
                    Box::pin(source),
                ));
                Ok(CacheLookup::Produced(reader))
            }
            Err(e) => {
                drop(file);
                self.inner.abandon(&production, e.to_string()).await;
                Err(CacheError::Transcoding(e))
            }
        }
    }

    /// Removes a completed artifact. Returns true if one existed.
    pub async fn remove(&self, key: &CacheFingerprint) -> bool {
        let removed = {
            let mut state = self.inner.state.lock();
            let removed = state.index.pop(&key.file_name());
            if let Some(artifact) = &removed {
                state.total_size -= artifact.size;
            }
            removed
        };

        match removed {
            Some(artifact) => {
                remove_artifact_file(&artifact.path).await;
                true
            }
            None => false,
        }
    }

    /// Removes every completed artifact. In-flight productions continue.
    pub async fn clear(&self) {
        let removed: Vec<CachedArtifact> = {
            let mut state = self.inner.state.lock();
            state.total_size = 0;
            std::iter::from_fn(|| state.index.pop_lru().map(|(_, artifact)| artifact)).collect()
        };

        for artifact in &removed {
            remove_artifact_file(&artifact.path).await;
        }
        tracing::debug!("Cleared {} cache entries", removed.len());
    }

    /// Snapshot of cache statistics.
    pub fn statistics(&self) -> CacheStats {
        let state = self.inner.state.lock();
        let hit_count = self.inner.hit_count.load(Ordering::Relaxed);
        let miss_count = self.inner.miss_count.load(Ordering::Relaxed);
        let attach_count = self.inner.attach_count.load(Ordering::Relaxed);

        CacheStats {
            entry_count: state.index.len(),
            total_size: state.total_size,
            in_flight: state.in_flight.len(),
            hit_count,
            miss_count,
            attach_count,
            eviction_count: self.inner.eviction_count.load(Ordering::Relaxed),
            hit_rate: CacheStats::calculate_hit_rate(hit_count + attach_count, miss_count),
        }
    }

    /// Unique per production, so a reader still draining an old partial
    /// file never sees it truncated by a newer production of the same key.
    fn part_path(&self, name: &str) -> PathBuf {
        let nonce = Uuid::new_v4().simple();
        self.inner
            .config
            .directory
            .join(format!("{name}-{nonce}.{PART_SUFFIX}"))
    }
}

impl CacheInner {
    fn cancel_if_unobserved(&self, production: &Production) -> bool {
        let _state = self.state.lock();
        production.cancel_if_unobserved()
    }

    /// Publishes a finished production as a completed artifact.
    ///
    /// The partial file is linked, not renamed, so readers that have not
    /// opened it yet still find it.
    async fn commit(&self, production: &Production, size: u64) {
        let name = production.key().file_name();
        let final_path = self.config.directory.join(&name);
        let limit = self.config.max_entry_size.min(self.config.max_total_size);

        let retained = if size > limit {
            tracing::debug!(
                "Not retaining {} ({} bytes exceeds limit {})",
                production.key(),
                size,
                limit
            );
            false
        } else if let Err(e) = link_artifact(production.part_path(), &final_path).await {
            tracing::warn!(
                "Failed to publish artifact {}: {}",
                final_path.display(),
                e
            );
            false
        } else {
            true
        };

        let evicted = {
            let mut state = self.state.lock();
            state.in_flight.remove(&name);

            let mut evicted = Vec::new();
            if retained {
                while state.total_size + size > self.config.max_total_size {
                    let Some((_, artifact)) = state.index.pop_lru() else {
                        break;
                    };
                    state.total_size -= artifact.size;
                    self.eviction_count.fetch_add(1, Ordering::Relaxed);
                    evicted.push(artifact);
                }

                if let Some(previous) = state.index.put(name, CachedArtifact::new(final_path, size))
                {
                    state.total_size -= previous.size;
                }
                state.total_size += size;

                tracing::debug!(
                    "Cached {} ({} bytes, total cache size: {} bytes)",
                    production.key(),
                    size,
                    state.total_size
                );
            }
            evicted
        };

        for artifact in evicted {
            tracing::debug!(
                "Evicted artifact due to size limit (freed {} bytes)",
                artifact.size
            );
            remove_artifact_file(&artifact.path).await;
        }

        production.publish(ProductionStatus::Completed);
    }

    /// Drops a failed production and reports `reason` to attached readers.
    async fn abandon(&self, production: &Arc<Production>, reason: String) {
        remove_artifact_file(production.part_path()).await;

        {
            let name = production.key().file_name();
            let mut state = self.state.lock();
            if state
                .in_flight
                .get(&name)
                .is_some_and(|current| Arc::ptr_eq(current, production))
            {
                state.in_flight.remove(&name);
            }
        }

        production.publish(ProductionStatus::Failed(reason));
    }
}

async fn link_artifact(part: &Path, target: &Path) -> std::io::Result<()> {
    match tokio::fs::hard_link(part, target).await {
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            tokio::fs::remove_file(target).await?;
            tokio::fs::hard_link(part, target).await
        }
        result => result,
    }
}

async fn remove_artifact_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove artifact {}: {}", path.display(), e);
        }
    }
}

impl std::fmt::Debug for TranscodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodeCache")
            .field("directory", &self.inner.config.directory)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use futures::stream;
    use tempfile::tempdir;

    use super::*;
    use crate::media::ResourceId;

    fn test_config(dir: &Path) -> CacheConfig {
        CacheConfig {
            directory: dir.to_path_buf(),
            ..Default::default()
        }
    }

    fn key(bitrate: u32) -> CacheFingerprint {
        CacheFingerprint::new(ResourceId::generate(), bitrate, "mp3")
    }

    type ChunkStream = stream::Iter<std::vec::IntoIter<Result<Bytes, TranscodingError>>>;

    fn chunks(parts: &[&'static [u8]]) -> ChunkStream {
        let items: Vec<_> = parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
        stream::iter(items)
    }

    async fn collect(stream: CachedStream) -> Result<Vec<u8>, CacheError> {
        let mut output = Vec::new();
        let mut stream = stream;
        while let Some(chunk) = stream.next().await {
            output.extend_from_slice(&chunk?);
        }
        Ok(output)
    }

    async fn wait_until_idle(cache: &TranscodeCache, key: &CacheFingerprint) {
        for _ in 0..200 {
            if !cache.is_producing(key) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("production for {key} did not finish");
    }

    /// Yields `abc`, then once cancelled takes a while to settle on `tail`.
    fn settles_after_cancel(
        cancel: CancellationToken,
        tail: Result<Bytes, TranscodingError>,
    ) -> impl Stream<Item = Result<Bytes, TranscodingError>> + Send + 'static {
        stream::iter([Ok(Bytes::from_static(b"abc"))]).chain(stream::once(async move {
            cancel.cancelled().await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            tail
        }))
    }

    fn file_names(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_miss_produces_then_hits() {
        let dir = tempdir().unwrap();
        let cache = TranscodeCache::open(test_config(dir.path())).unwrap();
        let key = key(128);

        assert!(cache.get(&key).is_none());

        let lookup = cache
            .get_or_produce(&key, |_| async { Ok(chunks(&[b"abc", b"def"])) })
            .await
            .unwrap();
        let CacheLookup::Produced(stream) = lookup else {
            panic!("expected a new production");
        };
        assert_eq!(collect(stream).await.unwrap(), b"abcdef");

        wait_until_idle(&cache, &key).await;
        let path = cache.get(&key).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"abcdef");

        let calls = AtomicU64::new(0);
        let lookup = cache
            .get_or_produce(&key, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(chunks(&[])) }
            })
            .await
            .unwrap();
        assert!(matches!(lookup, CacheLookup::Hit(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let stats = cache.statistics();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.total_size, 6);
        assert_eq!(stats.hit_count, 2);
        assert_eq!(stats.miss_count, 2);
    }

    #[tokio::test]
    async fn test_attached_reader_tails_live_production() {
        let dir = tempdir().unwrap();
        let cache = TranscodeCache::open(test_config(dir.path())).unwrap();
        let key = key(128);
        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Bytes, TranscodingError>>();

        let lookup = cache
            .get_or_produce(&key, move |_| async move { Ok(rx) })
            .await
            .unwrap();
        let CacheLookup::Produced(mut first) = lookup else {
            panic!("expected a new production");
        };
        tx.unbounded_send(Ok(Bytes::from_static(b"abc"))).unwrap();
        assert_eq!(&first.next().await.unwrap().unwrap()[..], b"abc");

        let lookup = cache
            .get_or_produce(&key, |_| async { Ok(chunks(&[b"unused"])) })
            .await
            .unwrap();
        let CacheLookup::Attached(mut second) = lookup else {
            panic!("expected to attach to the running production");
        };
        assert_eq!(&second.next().await.unwrap().unwrap()[..], b"abc");

        // Caught up with the producer
        {
            let mut next = tokio_test::task::spawn(second.next());
            tokio_test::assert_pending!(next.poll());
        }

        tx.unbounded_send(Ok(Bytes::from_static(b"def"))).unwrap();
        drop(tx);
        assert_eq!(collect(first).await.unwrap(), b"def");
        assert_eq!(collect(second).await.unwrap(), b"def");

        wait_until_idle(&cache, &key).await;
        assert!(cache.contains(&key));
        assert_eq!(cache.statistics().attach_count, 1);
    }

    #[tokio::test]
    async fn test_factory_failure_leaves_no_entry() {
        let dir = tempdir().unwrap();
        let cache = TranscodeCache::open(test_config(dir.path())).unwrap();
        let key = key(128);

        let result = cache
            .get_or_produce(&key, |_| async {
                Err::<futures::stream::Empty<Result<Bytes, TranscodingError>>, _>(
                    TranscodingError::StartFailure {
                        program: "lame".to_string(),
                        reason: "not found".to_string(),
                    },
                )
            })
            .await;

        assert!(matches!(
            result,
            Err(CacheError::Transcoding(TranscodingError::StartFailure { .. }))
        ));
        assert!(!cache.is_producing(&key));
        assert!(!cache.contains(&key));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_reaches_consumer() {
        let dir = tempdir().unwrap();
        let cache = TranscodeCache::open(test_config(dir.path())).unwrap();
        let key = key(128);

        let lookup = cache
            .get_or_produce(&key, |_| async {
                Ok(stream::iter(vec![
                    Ok(Bytes::from_static(b"abc")),
                    Err(TranscodingError::ProcessFailure {
                        reason: "encoder crashed".to_string(),
                    }),
                ]))
            })
            .await
            .unwrap();
        let CacheLookup::Produced(stream) = lookup else {
            panic!("expected a new production");
        };

        let err = collect(stream).await.unwrap_err();
        assert!(matches!(err, CacheError::ProductionFailed { .. }));

        wait_until_idle(&cache, &key).await;
        assert!(!cache.contains(&key));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_eviction_by_total_size() {
        let dir = tempdir().unwrap();
        let config = CacheConfig {
            max_total_size: 10,
            ..test_config(dir.path())
        };
        let cache = TranscodeCache::open(config).unwrap();
        let first = key(1);
        let second = key(2);

        let artifacts: [(&CacheFingerprint, &'static [u8]); 2] =
            [(&first, b"123456"), (&second, b"abcdef")];
        for (key, data) in artifacts {
            let lookup = cache
                .get_or_produce(key, move |_| async move { Ok(chunks(&[data])) })
                .await
                .unwrap();
            if let CacheLookup::Produced(stream) = lookup {
                collect(stream).await.unwrap();
            }
            wait_until_idle(&cache, key).await;
        }

        assert!(!cache.contains(&first));
        assert!(cache.contains(&second));
        assert!(!dir.path().join(first.file_name()).exists());
        let stats = cache.statistics();
        assert_eq!(stats.eviction_count, 1);
        assert_eq!(stats.total_size, 6);
    }

    #[tokio::test]
    async fn test_oversized_artifact_is_streamed_not_retained() {
        let dir = tempdir().unwrap();
        let config = CacheConfig {
            max_entry_size: 4,
            ..test_config(dir.path())
        };
        let cache = TranscodeCache::open(config).unwrap();
        let key = key(128);

        let lookup = cache
            .get_or_produce(&key, |_| async { Ok(chunks(&[b"too large"])) })
            .await
            .unwrap();
        let CacheLookup::Produced(stream) = lookup else {
            panic!("expected a new production");
        };
        assert_eq!(collect(stream).await.unwrap(), b"too large");

        wait_until_idle(&cache, &key).await;
        assert!(!cache.contains(&key));
    }

    #[tokio::test]
    async fn test_cancelled_production_is_not_joined() {
        let dir = tempdir().unwrap();
        let cache = TranscodeCache::open(test_config(dir.path())).unwrap();
        let key = key(128);
        let aborted = Err(TranscodingError::Aborted {
            sent: 3,
            estimate: None,
        });

        let lookup = cache
            .get_or_produce(&key, move |cancel| async move {
                Ok(settles_after_cancel(cancel, aborted))
            })
            .await
            .unwrap();
        let CacheLookup::Produced(mut first) = lookup else {
            panic!("expected a new production");
        };
        assert_eq!(&first.next().await.unwrap().unwrap()[..], b"abc");
        drop(first);

        // Source is still being torn down
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.is_producing(&key));

        let lookup = cache
            .get_or_produce(&key, |_| async { Ok(chunks(&[b"abc", b"def"])) })
            .await
            .unwrap();
        let CacheLookup::Produced(second) = lookup else {
            panic!("expected a fresh production");
        };
        assert_eq!(collect(second).await.unwrap(), b"abcdef");

        let stats = cache.statistics();
        assert_eq!(stats.miss_count, 2);
        assert_eq!(stats.attach_count, 0);
        assert!(cache.contains(&key));
    }

    #[tokio::test]
    async fn test_request_during_finishing_production_gets_full_artifact() {
        let dir = tempdir().unwrap();
        let cache = TranscodeCache::open(test_config(dir.path())).unwrap();
        let key = key(128);
        let tail = Ok(Bytes::from_static(b"def"));

        let lookup = cache
            .get_or_produce(&key, move |cancel| async move {
                Ok(settles_after_cancel(cancel, tail))
            })
            .await
            .unwrap();
        let CacheLookup::Produced(mut first) = lookup else {
            panic!("expected a new production");
        };
        assert_eq!(&first.next().await.unwrap().unwrap()[..], b"abc");
        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let calls = AtomicU64::new(0);
        let lookup = cache
            .get_or_produce(&key, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(chunks(&[])) }
            })
            .await
            .unwrap();
        let CacheLookup::Hit(path) = lookup else {
            panic!("expected the finished artifact");
        };
        assert_eq!(std::fs::read(path).unwrap(), b"abcdef");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unread_reader_survives_commit() {
        let dir = tempdir().unwrap();
        let cache = TranscodeCache::open(test_config(dir.path())).unwrap();
        let key = key(128);

        let lookup = cache
            .get_or_produce(&key, |_| async { Ok(chunks(&[b"abc", b"def"])) })
            .await
            .unwrap();
        let CacheLookup::Produced(stream) = lookup else {
            panic!("expected a new production");
        };

        wait_until_idle(&cache, &key).await;
        assert!(cache.contains(&key));
        assert_eq!(collect(stream).await.unwrap(), b"abcdef");

        // Partial file goes once its last reader is dropped
        for _ in 0..200 {
            if file_names(dir.path()).len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(file_names(dir.path()), vec![key.file_name()]);
    }

    #[tokio::test]
    async fn test_artifact_over_total_limit_is_not_retained() {
        let dir = tempdir().unwrap();
        let existing = key(1);
        std::fs::write(dir.path().join(existing.file_name()), b"ab").unwrap();
        let config = CacheConfig {
            max_total_size: 4,
            ..test_config(dir.path())
        };
        let cache = TranscodeCache::open(config).unwrap();
        let key = key(128);

        let lookup = cache
            .get_or_produce(&key, |_| async { Ok(chunks(&[b"too large"])) })
            .await
            .unwrap();
        let CacheLookup::Produced(stream) = lookup else {
            panic!("expected a new production");
        };
        assert_eq!(collect(stream).await.unwrap(), b"too large");

        wait_until_idle(&cache, &key).await;
        assert!(!cache.contains(&key));
        assert!(cache.contains(&existing));
        let stats = cache.statistics();
        assert_eq!(stats.eviction_count, 0);
        assert_eq!(stats.total_size, 2);
    }

    #[tokio::test]
    async fn test_open_indexes_existing_and_drops_partials() {
        let dir = tempdir().unwrap();
        let key = key(128);
        std::fs::write(dir.path().join(key.file_name()), b"cached").unwrap();
        std::fs::write(dir.path().join("deadbeef.part"), b"partial").unwrap();

        let cache = TranscodeCache::open(test_config(dir.path())).unwrap();

        assert!(cache.contains(&key));
        assert_eq!(cache.statistics().total_size, 6);
        assert!(!dir.path().join("deadbeef.part").exists());
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let dir = tempdir().unwrap();
        let first = key(1);
        let second = key(2);
        std::fs::write(dir.path().join(first.file_name()), b"one").unwrap();
        std::fs::write(dir.path().join(second.file_name()), b"two").unwrap();
        let cache = TranscodeCache::open(test_config(dir.path())).unwrap();

        assert!(cache.remove(&first).await);
        assert!(!cache.remove(&first).await);
        assert!(!dir.path().join(first.file_name()).exists());

        cache.clear().await;
        assert!(!cache.contains(&second));
        assert!(!dir.path().join(second.file_name()).exists());
        assert_eq!(cache.statistics().total_size, 0);
    }

    #[test]
    fn test_hit_rate_calculation() {
        assert_eq!(CacheStats::calculate_hit_rate(0, 0), 0.0);
        assert_eq!(CacheStats::calculate_hit_rate(1, 1), 50.0);
        assert_eq!(CacheStats::calculate_hit_rate(3, 1), 75.0);
    }
}
