//! The bash-script runner: computes `scriptID`, applies the QPS and
//! minimum-retry-interval rate limits in order, writes the ledger's start
//! timestamp before launching, and streams output through a bounded pipe.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use governor::{Quota, RateLimiter};
use gpud_core::{GpudError, PluginLedger, RateLimitError, Result};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Cap on captured stdout/stderr; "never buffer unbounded stdout".
const MAX_CAPTURED_OUTPUT_BYTES: usize = 64 * 1024;

type Bucket = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Configuration for one `StartBashScript` caller (usually one per plugin
/// component, but the QPS bucket itself is shared across the whole
/// manager per the single-shared-instance requirement).
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub minimum_retry: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            minimum_retry: Duration::ZERO,
        }
    }
}

/// The outcome of a finished bash run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Shared plugin manager: one QPS token bucket for the whole daemon, plus
/// the ledger handle used for the minimum-retry-interval check. The bucket
/// is internally lock-free (`governor` uses atomics), matching the spec's
/// concurrency policy for the rate limiter.
pub struct PluginManager {
    ledger: Arc<dyn PluginLedger>,
    qps_bucket: Option<Bucket>,
}

impl PluginManager {
    #[must_use]
    pub fn new(ledger: Arc<dyn PluginLedger>, qps: Option<u32>) -> Self {
        let qps_bucket = qps.and_then(NonZeroU32::new).map(|qps| RateLimiter::direct(Quota::per_second(qps)));
        Self { ledger, qps_bucket }
    }

    /// `scriptID` is a pure function of the script's contents: SHA-256 hex.
    #[must_use]
    pub fn script_id(contents: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(contents.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Look up the ledger's last-run status for `scriptID`.
    pub async fn get(&self, script_id: &str) -> Result<gpud_core::LedgerEntry> {
        self.ledger
            .get(script_id)
            .await?
            .ok_or_else(|| GpudError::not_found(script_id))
    }

    /// Run `script_contents` under bash, enforcing the QPS bucket and
    /// minimum-retry-interval before touching the ledger or spawning
    /// anything, then waits for completion and reports exit code/output
    /// back into the ledger.
    ///
    /// Returns `RateLimited(QpsLimitExceeded)` or
    /// `RateLimited(MinimumRetryInterval)` without any side effect when
    /// either applies.
    pub async fn start_bash_script(
        &self,
        bash_path: &str,
        script_name: &str,
        script_contents: &str,
        timeout: Duration,
        opts: RunOptions,
    ) -> Result<RunOutcome> {
        if let Some(bucket) = &self.qps_bucket {
            if bucket.check().is_err() {
                return Err(GpudError::RateLimited(RateLimitError::QpsLimitExceeded));
            }
        }

        let script_id = Self::script_id(script_contents);
        let now = Utc::now().timestamp();

        if opts.minimum_retry > Duration::ZERO {
            if let Some(entry) = self.ledger.get(&script_id).await? {
                if let Some(last) = entry.last_started_unix_seconds {
                    let elapsed = now - last;
                    if elapsed >= 0 && (elapsed as u64) < opts.minimum_retry.as_secs() {
                        return Err(GpudError::RateLimited(RateLimitError::MinimumRetryInterval));
                    }
                }
            }
        }

        // Ledger write happens before the process is launched, so a crash
        // mid-run still counts as "started" for dedup purposes.
        self.ledger.record_start(&script_id, script_name, now).await?;

        let outcome = self.spawn_and_wait(bash_path, script_contents, timeout).await;

        match &outcome {
            Ok(run) => {
                self.ledger.update_exit_code(&script_id, run.exit_code).await?;
                self.ledger
                    .update_output(&script_id, &format!("{}{}", run.stdout, run.stderr))
                    .await?;
            }
            Err(e) => {
                warn!(script_id, error = %e, "bash script execution failed before completion");
            }
        }

        outcome
    }

    async fn spawn_and_wait(&self, bash_path: &str, script: &str, timeout: Duration) -> Result<RunOutcome> {
        let mut child = Command::new(bash_path)
            .arg("-c")
            .arg(script)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| GpudError::Transient(format!("failed to spawn bash: {e}")))?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let stdout_task = tokio::spawn(read_capped(stdout));
        let stderr_task = tokio::spawn(read_capped(stderr));

        let wait_result = tokio::time::timeout(timeout, child.wait()).await;
        let status = match wait_result {
            Ok(status) => status.map_err(|e| GpudError::Transient(format!("bash wait failed: {e}")))?,
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(GpudError::Transient(format!(
                    "bash script timed out after {timeout:?}"
                )));
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(RunOutcome {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

async fn read_capped<R: tokio::io::AsyncRead + Unpin>(reader: R) -> String {
    let mut out = String::new();
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if out.len() >= MAX_CAPTURED_OUTPUT_BYTES {
            debug!("captured output truncated at cap");
            break;
        }
        out.push_str(&line);
        out.push('\n');
    }
    if out.len() > MAX_CAPTURED_OUTPUT_BYTES {
        out.truncate(MAX_CAPTURED_OUTPUT_BYTES);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct InMemoryLedger {
        rows: Mutex<std::collections::HashMap<String, gpud_core::LedgerEntry>>,
    }

    impl InMemoryLedger {
        fn new() -> Self {
            Self {
                rows: Mutex::new(std::collections::HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl PluginLedger for InMemoryLedger {
        async fn get(&self, script_id: &str) -> Result<Option<gpud_core::LedgerEntry>> {
            Ok(self.rows.lock().unwrap().get(script_id).cloned())
        }

        async fn record_start(&self, script_id: &str, script_name: &str, started: i64) -> Result<()> {
            let mut rows = self.rows.lock().unwrap();
            let entry = rows.entry(script_id.to_string()).or_default();
            entry.last_started_unix_seconds = Some(started);
            entry.script_name = Some(script_name.to_string());
            Ok(())
        }

        async fn update_exit_code(&self, script_id: &str, code: i32) -> Result<()> {
            self.rows.lock().unwrap().entry(script_id.to_string()).or_default().last_exit_code = Some(code);
            Ok(())
        }

        async fn update_output(&self, script_id: &str, output: &str) -> Result<()> {
            self.rows.lock().unwrap().entry(script_id.to_string()).or_default().last_output =
                Some(output.to_string());
            Ok(())
        }
    }

    #[test]
    fn script_id_is_pure_function_of_contents() {
        let a = PluginManager::script_id("echo hi");
        let b = PluginManager::script_id("echo hi");
        let c = PluginManager::script_id("echo bye");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn qps_limit_exceeded_before_any_ledger_write() {
        let ledger = Arc::new(InMemoryLedger::new());
        let manager = PluginManager::new(ledger.clone(), Some(1));

        let first = manager
            .start_bash_script("/bin/bash", "echo a", "echo a", Duration::from_secs(5), RunOptions::default())
            .await;
        assert!(first.is_ok());

        let second = manager
            .start_bash_script("/bin/bash", "echo a", "echo a", Duration::from_secs(5), RunOptions::default())
            .await;
        assert!(matches!(
            second,
            Err(GpudError::RateLimited(RateLimitError::QpsLimitExceeded))
        ));
    }

    #[tokio::test]
    async fn minimum_retry_interval_blocks_without_touching_ledger() {
        let ledger = Arc::new(InMemoryLedger::new());
        let manager = PluginManager::new(ledger.clone(), None);
        let opts = RunOptions {
            minimum_retry: Duration::from_secs(120),
        };

        manager
            .start_bash_script("/bin/bash", "echo b", "echo b", Duration::from_secs(5), opts)
            .await
            .unwrap();

        let before = ledger.get(&PluginManager::script_id("echo b")).await.unwrap().unwrap();

        let second = manager
            .start_bash_script("/bin/bash", "echo b", "echo b", Duration::from_secs(5), opts)
            .await;
        assert!(matches!(
            second,
            Err(GpudError::RateLimited(RateLimitError::MinimumRetryInterval))
        ));

        let after = ledger.get(&PluginManager::script_id("echo b")).await.unwrap().unwrap();
        assert_eq!(
            before.last_started_unix_seconds,
            after.last_started_unix_seconds
        );
    }

    #[tokio::test]
    async fn restart_dedup_blocks_across_fresh_manager_instance() {
        let ledger = Arc::new(InMemoryLedger::new());
        {
            let manager = PluginManager::new(ledger.clone(), None);
            manager
                .start_bash_script(
                    "/bin/bash",
                    "echo b",
                    "echo b",
                    Duration::from_secs(5),
                    RunOptions::default(),
                )
                .await
                .unwrap();
        }

        let fresh_manager = PluginManager::new(ledger, None);
        let opts = RunOptions {
            minimum_retry: Duration::from_secs(120),
        };
        let result = fresh_manager
            .start_bash_script("/bin/bash", "echo b", "echo b", Duration::from_secs(5), opts)
            .await;
        assert!(matches!(
            result,
            Err(GpudError::RateLimited(RateLimitError::MinimumRetryInterval))
        ));
    }

    #[tokio::test]
    async fn successful_run_captures_exit_code_and_output() {
        let ledger = Arc::new(InMemoryLedger::new());
        let manager = PluginManager::new(ledger, None);
        let outcome = manager
            .start_bash_script(
                "/bin/bash",
                "echo ok",
                "echo hello",
                Duration::from_secs(5),
                RunOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stdout.contains("hello"));
    }
}
