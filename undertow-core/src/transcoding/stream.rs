//! Cancellable byte stream over a running process graph.
//!
//! Cancellation is checked before every read and raced against a blocked
//! read. Once the stream has sent at least `completion_threshold` of the size
//! estimate, cancellation is ignored and the transcode runs to its natural end
//! so the cache receives the full artifact. Below the threshold the processes
//! are killed and the stream ends with `TranscodingError::Aborted`.

use bytes::Bytes;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use super::{ProcessGraph, TranscodingError};

/// Lifecycle of one in-flight transcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    NotStarted,
    Streaming,
    Completed,
    Aborted,
    Failed,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamState::Completed | StreamState::Aborted | StreamState::Failed
        )
    }
}

/// Tuning for a transcode stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamOptions {
    pub chunk_size: usize,
    /// Advisory total output size in bytes
    pub estimate: Option<u64>,
    pub completion_threshold: f64,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            chunk_size: 8192,
            estimate: None,
            completion_threshold: 0.95,
        }
    }
}

enum ReadOutcome {
    Data(std::io::Result<usize>),
    Cancelled,
}

/// Single-pass, finite sequence of chunks read from a transcoder.
pub struct TranscodeStream {
    graph: ProcessGraph,
    options: StreamOptions,
    cancel: CancellationToken,
    state: StreamState,
    sent: u64,
    finishing: bool,
    buffer: Vec<u8>,
    filled: usize,
    eof: bool,
}

impl TranscodeStream {
    pub fn new(graph: ProcessGraph, options: StreamOptions, cancel: CancellationToken) -> Self {
        let chunk_size = options.chunk_size.max(1);
        Self {
            graph,
            options,
            cancel,
            state: StreamState::NotStarted,
            sent: 0,
            finishing: false,
            buffer: vec![0u8; chunk_size],
            filled: 0,
            eof: false,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent
    }

    pub fn estimate(&self) -> Option<u64> {
        self.options.estimate
    }

    /// True once cancellation arrived past the threshold and was ignored.
    pub fn is_finishing(&self) -> bool {
        self.finishing
    }

    pub fn processes_reaped(&self) -> bool {
        self.graph.is_reaped()
    }

    pub fn live_pids(&self) -> Vec<u32> {
        self.graph.live_pids()
    }

    /// Produces the next chunk, `Ok(None)` at end of stream.
    ///
    /// Every chunk is exactly `chunk_size` bytes except the last one. After
    /// any terminal transition the processes are reaped and every further
    /// call returns `Ok(None)`.
    ///
    /// # Errors
    /// - `TranscodingError::Aborted` - Cancelled below the completion threshold
    /// - `TranscodingError::ProcessFailure` - Read error or non-zero exit
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, TranscodingError> {
        match self.state {
            StreamState::NotStarted => self.state = StreamState::Streaming,
            StreamState::Streaming => {}
            _ => return Ok(None),
        }
        if self.eof {
            return self.finish().await;
        }

        loop {
            if !self.finishing && self.cancel.is_cancelled() {
                self.handle_cancellation().await?;
            }

            let target = &mut self.buffer[self.filled..];
            let outcome = if self.finishing {
                ReadOutcome::Data(self.graph.read_chunk(target).await)
            } else {
                let cancel = self.cancel.clone();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => ReadOutcome::Cancelled,
                    result = self.graph.read_chunk(target) => ReadOutcome::Data(result),
                }
            };

            match outcome {
                ReadOutcome::Cancelled => continue,
                ReadOutcome::Data(Ok(0)) => {
                    if self.filled == 0 {
                        return self.finish().await;
                    }
                    self.eof = true;
                    return Ok(Some(self.take_chunk()));
                }
                ReadOutcome::Data(Ok(n)) => {
                    self.filled += n;
                    if self.filled == self.buffer.len() {
                        return Ok(Some(self.take_chunk()));
                    }
                }
                ReadOutcome::Data(Err(e)) => {
                    return Err(self
                        .fail(format!("reading transcoder output: {e}"))
                        .await);
                }
            }
        }
    }

    /// Converts into a `Stream` that ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, TranscodingError>> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            match stream.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), stream)),
                Ok(None) => None,
                Err(e) => Some((Err(e), stream)),
            }
        })
    }

    fn take_chunk(&mut self) -> Bytes {
        let chunk = Bytes::copy_from_slice(&self.buffer[..self.filled]);
        self.sent += self.filled as u64;
        self.filled = 0;
        chunk
    }

    fn past_threshold(&self) -> bool {
        match self.options.estimate {
            Some(estimate) if estimate > 0 => {
                self.sent as f64 >= estimate as f64 * self.options.completion_threshold
            }
            _ => false,
        }
    }

    async fn handle_cancellation(&mut self) -> Result<(), TranscodingError> {
        if self.past_threshold() {
            tracing::debug!(
                "Cancellation after {} of ~{:?} bytes, finishing transcode",
                self.sent,
                self.options.estimate
            );
            self.finishing = true;
            return Ok(());
        }

        tracing::debug!(
            "Cancellation after {} of ~{:?} bytes, aborting transcode",
            self.sent,
            self.options.estimate
        );
        self.graph.kill();
        self.graph.reap().await;
        self.state = StreamState::Aborted;

        Err(TranscodingError::Aborted {
            sent: self.sent,
            estimate: self.options.estimate,
        })
    }

    async fn finish(&mut self) -> Result<Option<Bytes>, TranscodingError> {
        let status = self.graph.reap().await;
        match status {
            Some(status) if !status.success() => {
                self.state = StreamState::Failed;
                Err(TranscodingError::ProcessFailure {
                    reason: format!("transcoder exited with {status}"),
                })
            }
            _ => {
                self.state = StreamState::Completed;
                tracing::debug!("Transcode completed after {} bytes", self.sent);
                Ok(None)
            }
        }
    }

    async fn fail(&mut self, reason: String) -> TranscodingError {
        self.graph.kill();
        self.graph.reap().await;
        self.state = StreamState::Failed;
        TranscodingError::ProcessFailure { reason }
    }
}

impl std::fmt::Debug for TranscodeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodeStream")
            .field("state", &self.state)
            .field("sent", &self.sent)
            .field("estimate", &self.options.estimate)
            .field("finishing", &self.finishing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn shell(script: &str) -> ProcessGraph {
        ProcessGraph::single(&["sh".to_string(), "-c".to_string(), script.to_string()]).unwrap()
    }

    #[tokio::test]
    async fn test_stream_reads_in_chunks() {
        let options = StreamOptions {
            chunk_size: 4,
            ..Default::default()
        };
        let mut stream =
            TranscodeStream::new(shell("printf 0123456789"), options, CancellationToken::new());
        assert_eq!(stream.state(), StreamState::NotStarted);

        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next_chunk().await.unwrap() {
            chunks.push(chunk);
        }

        let sizes: Vec<usize> = chunks.iter().map(|chunk| chunk.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(chunks.concat(), b"0123456789");
        assert_eq!(stream.state(), StreamState::Completed);
        assert_eq!(stream.bytes_sent(), 10);
        assert!(stream.processes_reaped());
        assert!(stream.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_short_pipe_reads_are_coalesced() {
        let options = StreamOptions {
            chunk_size: 6,
            ..Default::default()
        };
        let mut stream = TranscodeStream::new(
            shell("printf abc; sleep 0.1; printf def; sleep 0.1; printf gh"),
            options,
            CancellationToken::new(),
        );

        assert_eq!(&stream.next_chunk().await.unwrap().unwrap()[..], b"abcdef");
        assert_eq!(stream.bytes_sent(), 6);
        assert_eq!(&stream.next_chunk().await.unwrap().unwrap()[..], b"gh");
        assert!(stream.next_chunk().await.unwrap().is_none());
        assert_eq!(stream.state(), StreamState::Completed);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_stream() {
        let mut stream = TranscodeStream::new(
            shell("printf partial; exit 3"),
            StreamOptions::default(),
            CancellationToken::new(),
        );

        let chunk = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"partial");

        let err = stream.next_chunk().await.unwrap_err();
        assert!(matches!(err, TranscodingError::ProcessFailure { .. }));
        assert_eq!(stream.state(), StreamState::Failed);
        assert!(stream.processes_reaped());
    }

    #[tokio::test]
    async fn test_cancel_without_estimate_aborts() {
        let cancel = CancellationToken::new();
        let options = StreamOptions {
            chunk_size: 5,
            ..Default::default()
        };
        let mut stream =
            TranscodeStream::new(shell("printf first; sleep 30"), options, cancel.clone());

        assert!(stream.next_chunk().await.unwrap().is_some());
        cancel.cancel();

        let err = stream.next_chunk().await.unwrap_err();
        assert!(matches!(err, TranscodingError::Aborted { sent: 5, estimate: None }));
        assert_eq!(stream.state(), StreamState::Aborted);
        assert!(stream.processes_reaped());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_blocked_read() {
        let cancel = CancellationToken::new();
        let mut stream = TranscodeStream::new(
            shell("sleep 30"),
            StreamOptions::default(),
            cancel.clone(),
        );

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), stream.next_chunk())
            .await
            .expect("cancellation did not interrupt the read");
        assert!(matches!(result, Err(TranscodingError::Aborted { .. })));
        assert!(stream.processes_reaped());
    }

    #[tokio::test]
    async fn test_cancel_past_threshold_finishes() {
        let cancel = CancellationToken::new();
        let options = StreamOptions {
            chunk_size: 4,
            estimate: Some(10),
            completion_threshold: 0.5,
        };
        let mut stream = TranscodeStream::new(shell("printf 0123456789"), options, cancel.clone());

        let mut collected = Vec::new();
        collected.extend_from_slice(&stream.next_chunk().await.unwrap().unwrap());
        collected.extend_from_slice(&stream.next_chunk().await.unwrap().unwrap());
        cancel.cancel();

        while let Some(chunk) = stream.next_chunk().await.unwrap() {
            collected.extend_from_slice(&chunk);
        }

        assert!(stream.is_finishing());
        assert_eq!(collected, b"0123456789");
        assert_eq!(stream.state(), StreamState::Completed);
    }

    #[tokio::test]
    async fn test_into_stream_ends_after_error() {
        let stream = TranscodeStream::new(
            shell("printf data; exit 1"),
            StreamOptions::default(),
            CancellationToken::new(),
        );

        let items: Vec<_> = stream.into_stream().collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
    }
}
