//! Process graph for transcoding: one transcoder, or a decoder piped into an
//! encoder. Either way exactly one stdout is exposed to readers.
//!
//! Every spawned child is killed and reaped exactly once. `reap` covers the
//! normal and error paths; `Drop` covers everything else.

use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use super::{TranscoderPlan, TranscodingError};

/// Running transcoder processes with a single terminal stdout.
#[derive(Debug)]
pub struct ProcessGraph {
    decoder: Option<Child>,
    main: Option<Child>,
    stdout: Option<ChildStdout>,
}

impl ProcessGraph {
    /// Spawns the processes described by `plan`.
    ///
    /// # Errors
    /// - `TranscodingError::InvalidCommand` - Empty argument vector
    /// - `TranscodingError::StartFailure` - Spawn failed; nothing is left running
    pub async fn spawn(plan: &TranscoderPlan) -> Result<Self, TranscodingError> {
        match plan {
            TranscoderPlan::Direct { command } => Self::single(command),
            TranscoderPlan::Piped { decoder, encoder } => Self::piped(decoder, encoder).await,
        }
    }

    /// Spawns one transcoder with its stdout piped.
    ///
    /// # Errors
    /// - `TranscodingError::InvalidCommand` - Empty argument vector
    /// - `TranscodingError::StartFailure` - Spawn failed
    pub fn single(argv: &[String]) -> Result<Self, TranscodingError> {
        let mut main = spawn_child(argv, Stdio::null())?;
        let stdout = main.stdout.take();

        tracing::debug!(
            "Started transcoder {:?} (pid {:?})",
            argv.first(),
            main.id()
        );

        Ok(Self {
            decoder: None,
            main: Some(main),
            stdout,
        })
    }

    /// Spawns `decoder` and feeds its stdout into `encoder`.
    ///
    /// # Errors
    /// - `TranscodingError::InvalidCommand` - Empty argument vector
    /// - `TranscodingError::StartFailure` - Either spawn failed; the decoder is
    ///   reaped before returning if the encoder could not start
    pub async fn piped(decoder: &[String], encoder: &[String]) -> Result<Self, TranscodingError> {
        let mut decoder_child = spawn_child(decoder, Stdio::null())?;

        let handoff = decoder_child
            .stdout
            .take()
            .ok_or_else(|| TranscodingError::StartFailure {
                program: program_name(decoder),
                reason: "decoder stdout was not captured".to_string(),
            })
            .and_then(|stdout| {
                let stdio: std::io::Result<Stdio> = stdout.try_into();
                stdio.map_err(|e| TranscodingError::StartFailure {
                    program: program_name(decoder),
                    reason: e.to_string(),
                })
            });

        let encoder_child = handoff.and_then(|stdin| spawn_child(encoder, stdin));
        let mut encoder_child = match encoder_child {
            Ok(child) => child,
            Err(e) => {
                terminate(&mut decoder_child, "decoder").await;
                return Err(e);
            }
        };

        let stdout = encoder_child.stdout.take();
        tracing::debug!(
            "Started decoder {:?} (pid {:?}) piped into encoder {:?} (pid {:?})",
            decoder.first(),
            decoder_child.id(),
            encoder.first(),
            encoder_child.id()
        );

        Ok(Self {
            decoder: Some(decoder_child),
            main: Some(encoder_child),
            stdout,
        })
    }

    /// Reads up to `buf.len()` bytes from the terminal stdout. `Ok(0)` is EOF.
    ///
    /// # Errors
    /// Returns the underlying I/O error, or `BrokenPipe` once the pipe is closed.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.stdout.as_mut() {
            Some(stdout) => stdout.read(buf).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "transcoder stdout already closed",
            )),
        }
    }

    /// Sends a kill signal, decoder first. Safe to call repeatedly.
    pub fn kill(&mut self) {
        for (label, child) in [("decoder", &mut self.decoder), ("transcoder", &mut self.main)] {
            if let Some(child) = child.as_mut() {
                // Fails harmlessly if the child already exited
                if let Err(e) = child.start_kill() {
                    tracing::trace!("Kill of {} skipped: {}", label, e);
                }
            }
        }
    }

    /// Closes stdout and waits for every child. Returns the terminal process
    /// exit status the first time; later calls return `None`.
    pub async fn reap(&mut self) -> Option<ExitStatus> {
        self.stdout = None;

        if let Some(mut decoder) = self.decoder.take() {
            if let Err(e) = decoder.wait().await {
                tracing::warn!("Failed to reap decoder process: {}", e);
            }
        }

        let mut main = self.main.take()?;
        match main.wait().await {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::warn!("Failed to reap transcoder process: {}", e);
                None
            }
        }
    }

    /// Pids of children not yet reaped.
    pub fn live_pids(&self) -> Vec<u32> {
        [&self.decoder, &self.main]
            .into_iter()
            .flatten()
            .filter_map(|child| child.id())
            .collect()
    }

    pub fn is_reaped(&self) -> bool {
        self.decoder.is_none() && self.main.is_none()
    }

    pub fn is_piped(&self) -> bool {
        self.decoder.is_some()
    }
}

impl Drop for ProcessGraph {
    fn drop(&mut self) {
        self.stdout = None;
        let children: Vec<Child> = [self.decoder.take(), self.main.take()]
            .into_iter()
            .flatten()
            .collect();
        if children.is_empty() {
            return;
        }

        tracing::debug!("Dropping {} unreaped transcoder process(es)", children.len());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for mut child in children {
                        terminate(&mut child, "transcoder").await;
                    }
                });
            }
            Err(_) => {
                // No runtime left; kill_on_drop delivers the signal
                drop(children);
            }
        }
    }
}

/// Kills and reaps one child.
async fn terminate(child: &mut Child, label: &str) {
    if let Err(e) = child.kill().await {
        tracing::warn!("Failed to kill {} process: {}", label, e);
    }
}

fn program_name(argv: &[String]) -> String {
    argv.first().cloned().unwrap_or_default()
}

fn spawn_child(argv: &[String], stdin: Stdio) -> Result<Child, TranscodingError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| TranscodingError::InvalidCommand {
            reason: "empty command line".to_string(),
        })?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TranscodingError::StartFailure {
            program: program.clone(),
            reason: e.to_string(),
        })?;

    if let Some(stderr) = child.stderr.take() {
        spawn_stderr_reader(program.clone(), stderr);
    }

    Ok(child)
}

/// Drains stderr into the log so a chatty encoder never blocks on a full pipe.
fn spawn_stderr_reader(program: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.trim().is_empty() {
                tracing::debug!("{} stderr: {}", program, line.trim());
            }
        }
    });
}
