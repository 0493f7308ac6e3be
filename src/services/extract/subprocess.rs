//! Long-lived extraction subprocess and its line protocol.
//!
//! The external extractor is expensive to initialize, so each worker
//! owns one persistent subprocess. On spawn the extractor emits two
//! readiness lines, `{"ready": true}` after imports and
//! `{"initialized": true}` after converter warmup. After that it accepts
//! one file path per stdin line and answers with exactly one JSON object
//! per line.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("extractor spawn failed: {0}")]
    Spawn(String),
    #[error("extractor handshake failed: {0}")]
    Handshake(String),
    #[error("extractor pipe closed")]
    PipeClosed,
    #[error("extractor protocol error: {0}")]
    Protocol(String),
    #[error("extraction failed: {0}")]
    PerDocument(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no stored payload for document {0}")]
    MissingBlob(String),
    #[error("storage error: {0}")]
    Store(String),
    #[error("metadata error: {0}")]
    Repo(String),
}

impl ExtractError {
    /// Whether the owning worker should discard its subprocess after
    /// this error. Per-document failures leave the process healthy;
    /// transport-level failures do not.
    pub fn poisons_subprocess(&self) -> bool {
        matches!(
            self,
            Self::PipeClosed | Self::Protocol(_) | Self::Io(_) | Self::Handshake(_)
        )
    }
}

/// Parsed extractor command line (program plus arguments).
#[derive(Debug, Clone)]
pub struct ExtractorCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ExtractorCommand {
    /// Split a configured command string on whitespace.
    pub fn parse(command: &str) -> Result<Self, ExtractError> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| ExtractError::Spawn("empty extractor command".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

/// One successful or per-document-failed extraction response.
///
/// The extractor also reports detected language; it rides along into the
/// structured output blob.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractorResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub word_count: Option<i64>,
    #[serde(default)]
    pub char_count: Option<i64>,
    #[serde(default)]
    pub table_count: Option<i64>,
    #[serde(default)]
    pub image_count: Option<i64>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub language_confidence: Option<f64>,
    #[serde(default)]
    pub extraction: Option<serde_json::Value>,
}

/// A spawned extractor with completed readiness handshake.
pub struct ExtractorProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl ExtractorProcess {
    /// Spawn the extractor and wait for both readiness lines.
    ///
    /// A subprocess that fails the handshake within `ready_timeout` is
    /// killed before the error is returned.
    pub async fn spawn(
        command: &ExtractorCommand,
        ready_timeout: Duration,
    ) -> Result<Self, ExtractError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExtractError::Spawn(format!("{}: {}", command.program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExtractError::Spawn("no stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExtractError::Spawn("no stdout pipe".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let handshake = async {
            expect_flag(&mut lines, "ready").await?;
            expect_flag(&mut lines, "initialized").await?;
            Ok::<(), ExtractError>(())
        };
        match tokio::time::timeout(ready_timeout, handshake).await {
            Ok(Ok(())) => Ok(Self {
                child,
                stdin,
                stdout: lines,
            }),
            Ok(Err(e)) => {
                let _ = child.kill().await;
                Err(e)
            }
            Err(_) => {
                let _ = child.kill().await;
                Err(ExtractError::Handshake(format!(
                    "no readiness within {:?}",
                    ready_timeout
                )))
            }
        }
    }

    /// Send one document path and wait for its response line.
    pub async fn extract(&mut self, path: &Path) -> Result<ExtractorResponse, ExtractError> {
        let line = format!("{}\n", path.display());
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        let response_line = self
            .stdout
            .next_line()
            .await?
            .ok_or(ExtractError::PipeClosed)?;
        serde_json::from_str(&response_line)
            .map_err(|e| ExtractError::Protocol(format!("{e}: {response_line}")))
    }

    /// Kill the subprocess. Used on timeout and stall recovery.
    pub async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!("extractor kill failed (already dead?): {}", e);
        }
    }
}

/// Read one readiness line and check its boolean flag.
async fn expect_flag(
    lines: &mut Lines<BufReader<ChildStdout>>,
    flag: &str,
) -> Result<(), ExtractError> {
    let line = lines.next_line().await?.ok_or(ExtractError::PipeClosed)?;
    let value: serde_json::Value = serde_json::from_str(&line)
        .map_err(|e| ExtractError::Handshake(format!("bad readiness line {line:?}: {e}")))?;
    if value.get(flag).and_then(|v| v.as_bool()) == Some(true) {
        Ok(())
    } else {
        Err(ExtractError::Handshake(format!(
            "expected {{\"{flag}\": true}}, got {line}"
        )))
    }
}
