//! One in-flight transcode writing a partial artifact.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::CacheInner;
use crate::media::CacheFingerprint;
use crate::transcoding::TranscodingError;

pub(super) type SourceStream =
    Pin<Box<dyn Stream<Item = Result<Bytes, TranscodingError>> + Send + 'static>>;

/// Final or current state of a production.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProductionStatus {
    Streaming,
    Completed,
    Failed(String),
}

/// Bytes durably written to the partial artifact so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductionProgress {
    pub written: u64,
    pub status: ProductionStatus,
}

pub(crate) struct Production {
    key: CacheFingerprint,
    part_path: PathBuf,
    progress: watch::Sender<ProductionProgress>,
    cancel: CancellationToken,
}

impl Production {
    pub(super) fn new(key: CacheFingerprint, part_path: PathBuf) -> Self {
        let (progress, _) = watch::channel(ProductionProgress {
            written: 0,
            status: ProductionStatus::Streaming,
        });
        Self {
            key,
            part_path,
            progress,
            cancel: CancellationToken::new(),
        }
    }

    pub(super) fn key(&self) -> &CacheFingerprint {
        &self.key
    }

    pub(super) fn part_path(&self) -> &Path {
        &self.part_path
    }

    pub(super) fn subscribe(&self) -> watch::Receiver<ProductionProgress> {
        self.progress.subscribe()
    }

    pub(super) fn publish(&self, status: ProductionStatus) {
        self.progress.send_modify(|progress| progress.status = status);
    }

    fn advance(&self, written: u64) {
        self.progress.send_modify(|progress| progress.written = written);
    }

    pub(super) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancelled productions accept no new readers.
    pub(super) fn is_doomed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancels the source if nobody is reading. Caller holds the cache lock.
    pub(super) fn cancel_if_unobserved(&self) -> bool {
        if self.progress.receiver_count() > 0 {
            return false;
        }
        self.cancel.cancel();
        true
    }
}

/// Drives `source` into the partial artifact, then commits or abandons it.
///
/// The source is cancelled once the last attached reader is dropped. After a
/// commit the partial file is kept until every reader has let go of it.
pub(super) async fn run(
    cache: Arc<CacheInner>,
    production: Arc<Production>,
    mut file: tokio::fs::File,
    mut source: SourceStream,
) {
    let watcher = {
        let cache = Arc::clone(&cache);
        let production = Arc::clone(&production);
        tokio::spawn(async move {
            loop {
                production.progress.closed().await;
                if cache.cancel_if_unobserved(&production) {
                    tracing::debug!("All consumers of {} are gone", production.key);
                    break;
                }
            }
        })
    };

    let mut written = 0u64;
    let outcome = loop {
        let chunk = match source.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => break Err(e.to_string()),
            None => break Ok(()),
        };

        // Flush so attached readers never observe a length ahead of the file
        if let Err(e) = write_chunk(&mut file, &chunk).await {
            break Err(format!(
                "writing {}: {}",
                production.part_path.display(),
                e
            ));
        }
        written += chunk.len() as u64;
        production.advance(written);
    };

    watcher.abort();
    drop(source);
    drop(file);

    match outcome {
        Ok(()) => {
            tracing::debug!("Production of {} finished ({} bytes)", production.key, written);
            cache.commit(&production, written).await;
            production.progress.closed().await;
            super::remove_artifact_file(&production.part_path).await;
        }
        Err(reason) => {
            if production.is_doomed() {
                tracing::info!("Production of {} cancelled: {}", production.key, reason);
            } else {
                tracing::warn!("Production of {} failed: {}", production.key, reason);
            }
            cache.abandon(&production, reason).await;
        }
    }
}

async fn write_chunk(file: &mut tokio::fs::File, chunk: &[u8]) -> std::io::Result<()> {
    file.write_all(chunk).await?;
    file.flush().await
}
