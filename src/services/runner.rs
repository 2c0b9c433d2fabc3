use crate::cancel::CancellationToken;
use crate::models::{ScanOutcome, ScanRequest, ScanSettings, Secret};
use crate::services::classify::classify_output;
use camino::Utf8Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

/// Environment variable carrying the auth token into the scanner.
pub const TOKEN_ENV: &str = "SNYK_TOKEN";
pub const API_ENV: &str = "SNYK_API";
pub const DISABLE_ANALYTICS_ENV: &str = "SNYK_CFG_DISABLE_ANALYTICS";
pub const INTEGRATION_NAME_ENV: &str = "SNYK_INTEGRATION_NAME";
pub const INTEGRATION_VERSION_ENV: &str = "SNYK_INTEGRATION_VERSION";

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Errors that can occur while running the scanner
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Empty command line")]
    EmptyCommand,

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Scan timed out after {0:?}")]
    Timeout(Duration),

    #[error("Process error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a finished (or cancelled) process produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutput {
    Completed {
        stdout: String,
        stderr: String,
        /// Informative only; `None` when killed by a signal
        exit_code: Option<i32>,
    },
    Cancelled,
}

/// Runs the scanner binary as a child process.
///
/// The token travels through [`TOKEN_ENV`], never argv. Children are killed
/// when their handle is dropped, so an abandoned run never outlives its task.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    timeout: Duration,
    env: Vec<(String, String)>,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            env: vec![
                (INTEGRATION_NAME_ENV.to_string(), crate::APP_NAME.to_uppercase()),
                (INTEGRATION_VERSION_ENV.to_string(), crate::VERSION.to_string()),
            ],
        }
    }

    pub fn from_settings(settings: &ScanSettings) -> Self {
        let mut runner = Self::new(Duration::from_secs(settings.scan_timeout_secs.max(1)));
        if let Some(endpoint) = settings.endpoint() {
            runner.env.push((API_ENV.to_string(), endpoint.to_string()));
        }
        if !settings.usage_analytics_enabled {
            runner.env.push((DISABLE_ANALYTICS_ENV.to_string(), "1".to_string()));
        }
        runner
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `argv` in `work_dir` and collect its output.
    ///
    /// Cancellation is checked before spawning and between stdout reads; a
    /// cancelled or timed-out child is killed and no partial output is
    /// returned.
    pub async fn execute(
        &self,
        argv: &[String],
        work_dir: &Utf8Path,
        secret: Option<&Secret>,
        cancel: &CancellationToken,
    ) -> Result<RunOutput, RunnerError> {
        if cancel.is_cancelled() {
            return Ok(RunOutput::Cancelled);
        }

        let (program, args) = argv.split_first().ok_or(RunnerError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(secret) = secret.filter(|s| !s.is_empty()) {
            cmd.env(TOKEN_ENV, secret.expose());
        }

        tracing::info!("Executing: {}", argv.join(" "));
        let start = Instant::now();

        let mut child = cmd.spawn().map_err(|e| RunnerError::Spawn {
            program: program.clone(),
            source: e,
        })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("stdout was not captured"))?;
        let stderr_task = tokio::spawn(read_all(child.stderr.take()));

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut output = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        loop {
            tokio::select! {
                read = stdout.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        break;
                    }
                    output.extend_from_slice(&chunk[..n]);
                    if cancel.is_cancelled() {
                        terminate(&mut child).await;
                        stderr_task.abort();
                        return Ok(RunOutput::Cancelled);
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Scan cancelled, killing {}", program);
                    terminate(&mut child).await;
                    stderr_task.abort();
                    return Ok(RunOutput::Cancelled);
                }
                _ = &mut deadline => {
                    tracing::warn!("{} timed out after {:?}", program, self.timeout);
                    terminate(&mut child).await;
                    stderr_task.abort();
                    return Err(RunnerError::Timeout(self.timeout));
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                stderr_task.abort();
                return Ok(RunOutput::Cancelled);
            }
            _ = &mut deadline => {
                terminate(&mut child).await;
                stderr_task.abort();
                return Err(RunnerError::Timeout(self.timeout));
            }
        };
        let stderr = stderr_task.await.unwrap_or_default();

        tracing::info!(
            "{} completed in {:.2}s with exit code {:?}",
            program,
            start.elapsed().as_secs_f32(),
            status.code()
        );

        Ok(RunOutput::Completed {
            stdout: String::from_utf8_lossy(&output).into_owned(),
            stderr,
            exit_code: status.code(),
        })
    }

    /// Run one scan and classify its output.
    ///
    /// Runner failures (spawn errors, timeouts) become unstructured errors
    /// against the workspace root so every category always gets an outcome.
    pub async fn run_scan(
        &self,
        argv: &[String],
        request: &ScanRequest,
        secret: Option<&Secret>,
        cancel: &CancellationToken,
    ) -> ScanOutcome {
        let workspace = request.workspace_path.as_path();
        match self.execute(argv, workspace, secret, cancel).await {
            Ok(RunOutput::Cancelled) => ScanOutcome::Cancelled,
            Ok(RunOutput::Completed { stdout, stderr, .. }) => {
                // Some failures only ever reach stderr
                let raw = if stdout.trim().is_empty() { stderr } else { stdout };
                classify_output(&raw, request.category, workspace)
            }
            Err(e) => {
                tracing::error!("{} scan of {} failed: {}", request.category, workspace, e);
                ScanOutcome::UnstructuredError {
                    message: e.to_string(),
                    path: workspace.to_path_buf(),
                }
            }
        }
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        if let Err(e) = reader.read_to_end(&mut buf).await {
            tracing::debug!("Failed to read stderr: {}", e);
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::warn!("Failed to kill scanner process: {}", e);
    }
}
