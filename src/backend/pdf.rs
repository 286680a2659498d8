//! PDF layout/OCR pipeline adapter.
//!
//! Wraps the GPU-resident layout-analysis engine, driven as an external
//! tool speaking the stdin/stdout JSON protocol. The engine decides per
//! page between text extraction and OCR when the policy is `auto`; `text`
//! and `ocr` force one mode. The model weights stay resident in the tool's
//! process across calls, which is why this adapter's class is
//! [`EngineClass::GpuModel`] and its per-class cap defaults to 1.

use crate::backend::exec::{self, ToolConvertJob, ToolConvertReply};
use crate::backend::{BackendAdapter, BackendOutput, BackendRequest};
use crate::error::BackendError;
use crate::governor::EngineClass;
use crate::registry::EngineId;
use crate::request::EnginePolicy;
use async_trait::async_trait;
use tracing::debug;

#[derive(Debug)]
pub struct PdfPipelineAdapter {
    tool: String,
}

impl PdfPipelineAdapter {
    /// Probe the pipeline tool and build the adapter.
    ///
    /// Called once per process by the registry's lazy initialisation; a
    /// missing tool degrades the engine instead of failing per chunk.
    pub async fn init(tool: &str) -> Result<Self, BackendError> {
        exec::probe_tool(tool).await?;
        Ok(Self {
            tool: tool.to_string(),
        })
    }

    fn method(policy: EnginePolicy) -> &'static str {
        match policy {
            EnginePolicy::Text => "txt",
            EnginePolicy::Ocr => "ocr",
            // Vlm never routes here; the registry maps it to the VLM engine.
            EnginePolicy::Auto | EnginePolicy::Vlm => "auto",
        }
    }
}

#[async_trait]
impl BackendAdapter for PdfPipelineAdapter {
    fn id(&self) -> EngineId {
        EngineId::PdfPipeline
    }

    fn engine_class(&self) -> EngineClass {
        EngineClass::GpuModel
    }

    async fn convert(&self, req: BackendRequest<'_>) -> Result<BackendOutput, BackendError> {
        let input = req.input.as_file()?;
        exec::require_file(input)?;

        let job = ToolConvertJob {
            input: input.display().to_string(),
            start_page: Some(req.window.start),
            end_page: req.window.end,
            method: Self::method(req.policy).to_string(),
            keep_artifacts: req.options.persist_intermediate,
            artifacts_dir: req
                .options
                .artifacts_dir
                .as_ref()
                .map(|p| p.display().to_string()),
        };
        debug!(
            window = %req.window.seq,
            start = req.window.start,
            method = %job.method,
            "pdf pipeline call"
        );
        let reply: ToolConvertReply = exec::run_json_tool(&self.tool, &["convert"], &job).await?;
        reply.into_output()
    }
}
