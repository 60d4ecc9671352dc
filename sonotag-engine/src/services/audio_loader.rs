//! Crash-isolated audio loading
//!
//! Decoding runs in a short-lived `sonotag-decoder` worker process so
//! a decoder fault on corrupt input kills only the worker. The parent
//! reads the length-prefixed sample frame off the worker's stdout in
//! small poll slices, checking the shutdown token between slices, and
//! enforces a hard wall-clock deadline per attempt. Timeout, abnormal
//! exit, and short frames are the same thing: one failed attempt.
//! Exactly two attempts per file; the second failure is terminal and
//! callers should mark the source invalid rather than retry.

use crate::config::LoaderConfig;
use crate::types::Waveform;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Total decode attempts per file (initial + one retry)
const DECODE_ATTEMPTS: u32 = 2;

/// Loader errors
#[derive(Debug, Error)]
pub enum LoadError {
    /// Both isolated decode attempts terminated abnormally. The source
    /// file should be marked invalid, not retried.
    #[error("decode worker failed for {path} after {attempts} attempts: {reason}")]
    Crash {
        path: PathBuf,
        attempts: u32,
        reason: String,
    },

    /// Cooperative shutdown fired mid-load; never retried.
    #[error("decode cancelled by shutdown")]
    Shutdown,
}

enum AttemptFailure {
    Shutdown,
    Failed(String),
}

/// Audio loader delegating to the isolated decode worker
pub struct AudioLoader {
    config: LoaderConfig,
}

impl AudioLoader {
    pub fn new(config: LoaderConfig) -> Self {
        Self { config }
    }

    /// Decode `path` to mono f32 at `target_sr`.
    pub async fn load_mono(
        &self,
        path: &Path,
        target_sr: u32,
        shutdown: &CancellationToken,
    ) -> Result<Waveform, LoadError> {
        let mut last_reason = String::new();

        for attempt in 1..=DECODE_ATTEMPTS {
            // Observed before every fork, not just between files
            if shutdown.is_cancelled() {
                return Err(LoadError::Shutdown);
            }

            match self.decode_attempt(path, target_sr, shutdown).await {
                Ok(samples) => {
                    debug!(
                        path = %path.display(),
                        samples = samples.len(),
                        attempt,
                        "Decode complete"
                    );
                    return Ok(Waveform::new(samples, target_sr));
                }
                Err(AttemptFailure::Shutdown) => return Err(LoadError::Shutdown),
                Err(AttemptFailure::Failed(reason)) => {
                    warn!(
                        path = %path.display(),
                        attempt,
                        reason = %reason,
                        "Decode attempt failed"
                    );
                    last_reason = reason;
                }
            }
        }

        Err(LoadError::Crash {
            path: path.to_path_buf(),
            attempts: DECODE_ATTEMPTS,
            reason: last_reason,
        })
    }

    async fn decode_attempt(
        &self,
        path: &Path,
        target_sr: u32,
        shutdown: &CancellationToken,
    ) -> Result<Vec<f32>, AttemptFailure> {
        let worker = self.worker_bin();
        let mut child = Command::new(&worker)
            .arg(path)
            .arg(target_sr.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AttemptFailure::Failed(format!("spawn {}: {}", worker.display(), e))
            })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| AttemptFailure::Failed("worker stdout unavailable".to_string()))?;

        let deadline = Instant::now() + self.config.decode_timeout();
        let mut frame: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 16 * 1024];

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    kill_and_reap(&mut child).await;
                    return Err(AttemptFailure::Shutdown);
                }
                read = tokio::time::timeout(self.config.poll_interval(), stdout.read(&mut chunk)) => {
                    match read {
                        // Poll slice elapsed with no data; re-check deadline
                        Err(_elapsed) => {}
                        Ok(Ok(0)) => break,
                        Ok(Ok(n)) => frame.extend_from_slice(&chunk[..n]),
                        Ok(Err(e)) => {
                            kill_and_reap(&mut child).await;
                            return Err(AttemptFailure::Failed(format!("pipe read: {}", e)));
                        }
                    }
                    if Instant::now() >= deadline {
                        kill_and_reap(&mut child).await;
                        return Err(AttemptFailure::Failed(format!(
                            "deadline exceeded ({}s)",
                            self.config.decode_timeout_s
                        )));
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| AttemptFailure::Failed(format!("reap worker: {}", e)))?;
        if !status.success() {
            return Err(AttemptFailure::Failed(format!(
                "worker exited abnormally: {}",
                status
            )));
        }

        parse_frame(&frame).map_err(AttemptFailure::Failed)
    }

    fn worker_bin(&self) -> PathBuf {
        if let Some(bin) = &self.config.worker_bin {
            return bin.clone();
        }
        default_worker_bin()
    }
}

/// `sonotag-decoder` next to the current executable, else rely on PATH
fn default_worker_bin() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|d| d.join("sonotag-decoder")))
        .filter(|p| p.is_file())
        .unwrap_or_else(|| PathBuf::from("sonotag-decoder"))
}

/// Parse the worker frame: u32-le sample count + raw f32-le samples.
///
/// A short or oversized frame is a failed attempt, never a partial
/// success.
fn parse_frame(frame: &[u8]) -> Result<Vec<f32>, String> {
    if frame.len() < 4 {
        return Err(format!("short frame: {} bytes, no header", frame.len()));
    }

    let count = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let expected = 4 + count * 4;
    if frame.len() != expected {
        return Err(format!(
            "frame length mismatch: header claims {} samples ({} bytes), got {} bytes",
            count,
            expected,
            frame.len()
        ));
    }

    let samples = frame[4..]
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(samples)
}

async fn kill_and_reap(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}
