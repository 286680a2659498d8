//! Tool-process plumbing shared by the subprocess-backed adapters.
//!
//! Several engines are driven as external tools speaking JSON on
//! stdin/stdout: the layout/OCR pipeline, the office converter, the ebook
//! tool. This module owns the one tricky part — spawning, feeding stdin,
//! collecting output, and classifying exit conditions — so each adapter
//! only builds its request payload and parses its response type.
//!
//! ## Failure classification
//!
//! * spawn failure (tool missing) → [`BackendError::Unavailable`]
//! * killed by signal (OOM, external kill) → [`BackendError::Transient`]
//! * non-zero exit or malformed JSON → [`BackendError::Fatal`] with the
//!   tool's stderr tail, which is where engines print their diagnostics

use crate::backend::BackendOutput;
use crate::error::BackendError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Upper bound on the stderr tail included in error details.
const STDERR_TAIL: usize = 2048;

/// Job payload for tools speaking the stdin/stdout JSON protocol.
#[derive(Debug, Clone, Serialize)]
pub struct ToolConvertJob {
    pub input: String,
    pub start_page: Option<u32>,
    pub end_page: Option<u32>,
    /// Engine mode: "auto", "txt", "ocr".
    pub method: String,
    pub keep_artifacts: bool,
    pub artifacts_dir: Option<String>,
}

/// Reply from a JSON-protocol tool.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolConvertReply {
    pub ok: bool,
    #[serde(default)]
    pub markdown: String,
    #[serde(default)]
    pub pages_converted: u32,
    /// Tools that convert whole inputs (no pagination) omit this; treating
    /// the single unit as the end is then correct.
    #[serde(default = "default_true")]
    pub reached_end: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ToolConvertReply {
    /// Fold the reply into the uniform backend output, mapping an
    /// `ok=false` reply to a content-level failure.
    pub fn into_output(self) -> Result<BackendOutput, BackendError> {
        if !self.ok {
            return Err(BackendError::Fatal {
                detail: self.error.unwrap_or_else(|| "tool reported failure".into()),
            });
        }
        Ok(BackendOutput {
            markdown: self.markdown,
            pages_converted: self.pages_converted,
            reached_end: self.reached_end,
            warnings: self.warnings,
        })
    }
}

/// Run `tool` with `args`, write `input` as JSON to its stdin, and parse
/// stdout as JSON into `O`.
pub async fn run_json_tool<I, O>(
    tool: &str,
    args: &[&str],
    input: &I,
) -> Result<O, BackendError>
where
    I: Serialize,
    O: DeserializeOwned,
{
    debug!(tool, ?args, "spawning engine tool");

    let mut child = Command::new(tool)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BackendError::Unavailable {
            detail: format!("failed to spawn '{tool}': {e}"),
        })?;

    let payload = serde_json::to_vec(input).map_err(|e| BackendError::Fatal {
        detail: format!("request serialisation failed: {e}"),
    })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(&payload)
            .await
            .map_err(|e| BackendError::Transient {
                detail: format!("'{tool}' stdin closed early: {e}"),
            })?;
        // Drop closes the pipe so the tool sees EOF.
    }

    let out = child
        .wait_with_output()
        .await
        .map_err(|e| BackendError::Transient {
            detail: format!("waiting for '{tool}' failed: {e}"),
        })?;

    if !out.status.success() {
        let stderr = stderr_tail(&out.stderr);
        // No exit code at all means the process died to a signal; that is
        // an environment problem (OOM killer, external kill), not an input
        // problem, so it stays retryable.
        return Err(match out.status.code() {
            None => BackendError::Transient {
                detail: format!("'{tool}' killed by signal: {stderr}"),
            },
            Some(code) => BackendError::Fatal {
                detail: format!("'{tool}' exited {code}: {stderr}"),
            },
        });
    }

    serde_json::from_slice(&out.stdout).map_err(|e| BackendError::Fatal {
        detail: format!(
            "'{tool}' produced unparseable output: {e}; stderr: {}",
            stderr_tail(&out.stderr)
        ),
    })
}

/// Probe that a tool exists and answers `--version`; used during engine
/// initialisation so a missing tool degrades the engine up front instead
/// of failing every chunk.
pub async fn probe_tool(tool: &str) -> Result<(), BackendError> {
    let out = Command::new(tool)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| BackendError::Unavailable {
            detail: format!("'{tool}' not found: {e}"),
        })?;
    if out.success() {
        Ok(())
    } else {
        Err(BackendError::Unavailable {
            detail: format!("'{tool} --version' exited {:?}", out.code()),
        })
    }
}

/// Run a plain command (no JSON protocol) and classify its exit.
pub async fn run_command(tool: &str, args: &[&str]) -> Result<(), BackendError> {
    debug!(tool, ?args, "running command");
    let out = Command::new(tool)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| BackendError::Unavailable {
            detail: format!("failed to spawn '{tool}': {e}"),
        })?;

    if out.status.success() {
        return Ok(());
    }
    let stderr = stderr_tail(&out.stderr);
    Err(match out.status.code() {
        None => BackendError::Transient {
            detail: format!("'{tool}' killed by signal: {stderr}"),
        },
        Some(code) => BackendError::Fatal {
            detail: format!("'{tool}' exited {code}: {stderr}"),
        },
    })
}

/// Run a command and capture stdout as UTF-8 text (for tools that emit the
/// converted document directly, like pandoc).
pub async fn run_capture(tool: &str, args: &[&str]) -> Result<String, BackendError> {
    debug!(tool, ?args, "running capture command");
    let out = Command::new(tool)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| BackendError::Unavailable {
            detail: format!("failed to spawn '{tool}': {e}"),
        })?;

    if !out.status.success() {
        let stderr = stderr_tail(&out.stderr);
        return Err(match out.status.code() {
            None => BackendError::Transient {
                detail: format!("'{tool}' killed by signal: {stderr}"),
            },
            Some(code) => BackendError::Fatal {
                detail: format!("'{tool}' exited {code}: {stderr}"),
            },
        });
    }
    String::from_utf8(out.stdout).map_err(|e| BackendError::Fatal {
        detail: format!("'{tool}' produced non-UTF-8 output: {e}"),
    })
}

/// Check a local input path exists before handing it to a tool, so the
/// error names the file rather than whatever the tool prints.
pub fn require_file(path: &Path) -> Result<(), BackendError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(BackendError::Fatal {
            detail: format!("input file missing: {}", path.display()),
        })
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let s = String::from_utf8_lossy(stderr);
    let s = s.trim();
    if s.len() <= STDERR_TAIL {
        s.to_string()
    } else {
        let mut start = s.len() - STDERR_TAIL;
        while !s.is_char_boundary(start) {
            start += 1;
        }
        format!("…{}", &s[start..])
    }
}
