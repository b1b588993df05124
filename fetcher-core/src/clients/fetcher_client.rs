//! Story-fetcher CLI façade (spec §6 "External CLIs").

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::FetchModifier;
use crate::error::{FetcherError, Result};
use crate::outcome::{self, FetcherOutcome};

/// Invokes the external story-fetcher CLI and classifies its output.
#[async_trait]
pub trait FetcherClient: Send + Sync {
    /// Run one fetch/update attempt. `scratch_dir` is pinned as the child
    /// process's working directory (spec §4.4: "each execution gets its own
    /// scratch directory").
    async fn fetch(
        &self,
        url: &str,
        modifier: FetchModifier,
        scratch_dir: &Path,
    ) -> Result<FetcherOutcome>;
}

/// Real [`FetcherClient`] backed by a subprocess, following the
/// `tokio::process::Command` + piped-stdio pattern used by
/// `ferrex-server`'s FFmpeg worker (`stream/transcoding/worker.rs`).
#[derive(Debug, Clone)]
pub struct ProcessFetcherClient {
    binary_path: String,
    timeout: Duration,
}

impl ProcessFetcherClient {
    pub fn new(binary_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary_path: binary_path.into(),
            timeout,
        }
    }
}

#[async_trait]
impl FetcherClient for ProcessFetcherClient {
    async fn fetch(
        &self,
        url: &str,
        modifier: FetchModifier,
        scratch_dir: &Path,
    ) -> Result<FetcherOutcome> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.current_dir(scratch_dir)
            .arg("--mode")
            .arg(modifier.as_cli_flag())
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(%url, mode = modifier.as_cli_flag(), "invoking story-fetcher");

        let mut child = cmd
            .spawn()
            .map_err(|e| FetcherError::Process(format!("spawn failed: {e}")))?;

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        // Drain both pipes concurrently with wait() rather than after it —
        // a chatty child can fill the stdout/stderr pipe buffer and block on
        // write() while we'd otherwise be blocked on wait() ourselves,
        // deadlocking the pair (same shape as `stream/transcoding/worker.rs`'s
        // stderr-reader task running alongside its own `child.wait()`).
        let run = async {
            let mut out_buf = String::new();
            let mut err_buf = String::new();
            let (status, _, _) = tokio::join!(
                child.wait(),
                async {
                    if let Some(out) = stdout.as_mut() {
                        let _ = out.read_to_string(&mut out_buf).await;
                    }
                },
                async {
                    if let Some(err) = stderr.as_mut() {
                        let _ = err.read_to_string(&mut err_buf).await;
                    }
                },
            );
            out_buf.push_str(&err_buf);
            (status, out_buf)
        };

        let (status, output) = match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%url, "story-fetcher timed out, killing process");
                return Ok(FetcherOutcome::TransientFailure {
                    reason: "timeout".to_string(),
                });
            }
        };

        let status =
            status.map_err(|e| FetcherError::Process(format!("wait failed: {e}")))?;

        info!(%url, success = status.success(), "story-fetcher finished");
        Ok(outcome::classify(&output, status.success()))
    }
}
