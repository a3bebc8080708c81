//! Reader that tails a partial artifact while its production runs.

use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use futures::stream::BoxStream;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;

use super::CacheError;
use super::production::{Production, ProductionProgress, ProductionStatus};

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Bytes of one production, from the first byte, as they are written.
///
/// Holding a `CachedStream` keeps the production alive. Dropping the last one
/// cancels the transcode.
pub struct CachedStream {
    inner: BoxStream<'static, Result<Bytes, CacheError>>,
}

struct TailState {
    path: PathBuf,
    file: Option<tokio::fs::File>,
    progress: watch::Receiver<ProductionProgress>,
    position: u64,
    done: bool,
}

impl CachedStream {
    /// Subscribes to progress. Must be called while the registry lock is
    /// held; the partial file is opened on first read.
    pub(super) fn attach(production: &Production) -> Self {
        let state = TailState {
            path: production.part_path().to_path_buf(),
            file: None,
            progress: production.subscribe(),
            position: 0,
            done: false,
        };

        let inner = futures::stream::unfold(state, |mut state| async move {
            state.next_chunk().await.map(|item| (item, state))
        });

        Self {
            inner: Box::pin(inner),
        }
    }
}

impl TailState {
    async fn next_chunk(&mut self) -> Option<Result<Bytes, CacheError>> {
        if self.done {
            return None;
        }

        loop {
            let progress = self.progress.borrow_and_update().clone();

            if self.position < progress.written {
                if self.file.is_none() {
                    match self.open_part().await {
                        Ok(file) => self.file = Some(file),
                        Err(reason) => return self.fail(reason),
                    }
                }
                let Some(file) = self.file.as_mut() else {
                    return self.fail("partial artifact is not open".to_string());
                };

                let available = (progress.written - self.position).min(READ_CHUNK_SIZE as u64);
                let mut buf = vec![0u8; available as usize];
                return match file.read(&mut buf).await {
                    Ok(0) => self.fail("partial artifact is shorter than reported".to_string()),
                    Ok(n) => {
                        self.position += n as u64;
                        buf.truncate(n);
                        Some(Ok(Bytes::from(buf)))
                    }
                    Err(e) => self.fail(format!("reading partial artifact: {e}")),
                };
            }

            match progress.status {
                ProductionStatus::Completed => {
                    self.done = true;
                    return None;
                }
                ProductionStatus::Failed(reason) => return self.fail(reason),
                ProductionStatus::Streaming => {
                    if self.progress.changed().await.is_err()
                        && self.progress.borrow().status == ProductionStatus::Streaming
                    {
                        return self.fail("producer went away".to_string());
                    }
                }
            }
        }
    }

    /// Opens the partial file. It only disappears while a failed production
    /// is being abandoned, so a missing file resolves to that failure.
    async fn open_part(&mut self) -> Result<tokio::fs::File, String> {
        match tokio::fs::File::open(&self.path).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let settled = self
                    .progress
                    .wait_for(|progress| progress.status != ProductionStatus::Streaming)
                    .await;
                match settled {
                    Ok(progress) => match &progress.status {
                        ProductionStatus::Failed(reason) => Err(reason.clone()),
                        _ => Err(format!("partial artifact {} vanished", self.path.display())),
                    },
                    Err(_) => Err("producer went away".to_string()),
                }
            }
            Err(e) => Err(format!("opening partial artifact: {e}")),
        }
    }

    fn fail(&mut self, reason: String) -> Option<Result<Bytes, CacheError>> {
        self.done = true;
        Some(Err(CacheError::ProductionFailed { reason }))
    }
}

impl Stream for CachedStream {
    type Item = Result<Bytes, CacheError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for CachedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedStream").finish_non_exhaustive()
    }
}
