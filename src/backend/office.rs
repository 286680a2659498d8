//! Office-document adapters: modern formats plus the legacy converter.
//!
//! Modern formats (docx, pptx, xlsx) go straight to the office engine, an
//! external tool on the stdin/stdout JSON protocol. Legacy binary formats
//! (doc, ppt) cannot be parsed directly — the orchestrator runs the
//! two-stage pipeline: [`SofficeConverter`] rewrites the file to its modern
//! equivalent via headless LibreOffice, and only on success does the
//! [`OfficeAdapter`] see the result.

use crate::backend::exec::{self, ToolConvertJob, ToolConvertReply};
use crate::backend::{BackendAdapter, BackendOutput, BackendRequest, LegacyConverter};
use crate::error::BackendError;
use crate::governor::EngineClass;
use crate::registry::EngineId;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug)]
pub struct OfficeAdapter {
    tool: String,
}

impl OfficeAdapter {
    pub async fn init(tool: &str) -> Result<Self, BackendError> {
        exec::probe_tool(tool).await?;
        Ok(Self {
            tool: tool.to_string(),
        })
    }
}

#[async_trait]
impl BackendAdapter for OfficeAdapter {
    fn id(&self) -> EngineId {
        EngineId::Office
    }

    fn engine_class(&self) -> EngineClass {
        EngineClass::Subprocess
    }

    async fn convert(&self, req: BackendRequest<'_>) -> Result<BackendOutput, BackendError> {
        let input = req.input.as_file()?;
        exec::require_file(input)?;

        let job = ToolConvertJob {
            input: input.display().to_string(),
            // Office documents are converted whole; no page windows.
            start_page: None,
            end_page: None,
            method: "auto".to_string(),
            keep_artifacts: req.options.persist_intermediate,
            artifacts_dir: req
                .options
                .artifacts_dir
                .as_ref()
                .map(|p| p.display().to_string()),
        };
        let reply: ToolConvertReply = exec::run_json_tool(&self.tool, &["convert"], &job).await?;
        reply.into_output()
    }
}

/// Headless-LibreOffice first stage for legacy binary formats.
///
/// `soffice --headless --convert-to <ext> --outdir <staging> <input>`
/// writes `<staging>/<stem>.<ext>`; anything else is a failure. LibreOffice
/// is single-instance-per-profile, which is one reason the subprocess class
/// cap exists.
#[derive(Debug)]
pub struct SofficeConverter {
    cmd: String,
}

impl SofficeConverter {
    pub async fn init(cmd: &str) -> Result<Self, BackendError> {
        exec::probe_tool(cmd).await?;
        Ok(Self {
            cmd: cmd.to_string(),
        })
    }
}

#[async_trait]
impl LegacyConverter for SofficeConverter {
    async fn convert_to_modern(
        &self,
        input: &Path,
        target_ext: &str,
        staging: &Path,
    ) -> Result<PathBuf, BackendError> {
        exec::require_file(input)?;
        let staging_str = staging.display().to_string();
        let input_str = input.display().to_string();

        debug!(input = %input_str, target = %target_ext, "legacy conversion");
        exec::run_command(
            &self.cmd,
            &[
                "--headless",
                "--convert-to",
                target_ext,
                "--outdir",
                &staging_str,
                &input_str,
            ],
        )
        .await?;

        let stem = input
            .file_stem()
            .ok_or_else(|| BackendError::Fatal {
                detail: format!("input has no file stem: {}", input.display()),
            })?
            .to_string_lossy();
        let converted = staging.join(format!("{stem}.{target_ext}"));
        if !converted.is_file() {
            // soffice exits 0 on some conversion failures; the missing
            // output file is the reliable signal.
            return Err(BackendError::Fatal {
                detail: format!(
                    "conversion produced no output at {}",
                    converted.display()
                ),
            });
        }
        info!(output = %converted.display(), "legacy conversion complete");
        Ok(converted)
    }
}
