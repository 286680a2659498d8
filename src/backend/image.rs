//! Image OCR adapter.
//!
//! Single images go through the same GPU-resident engine as scanned PDFs,
//! always in OCR mode — there is no text layer to extract. Shares the
//! [`EngineClass::GpuModel`] admission cap with the PDF pipeline because
//! both compete for the same model.

use crate::backend::exec::{self, ToolConvertJob, ToolConvertReply};
use crate::backend::{BackendAdapter, BackendOutput, BackendRequest};
use crate::error::BackendError;
use crate::governor::EngineClass;
use crate::registry::EngineId;
use async_trait::async_trait;

#[derive(Debug)]
pub struct ImageOcrAdapter {
    tool: String,
}

impl ImageOcrAdapter {
    pub async fn init(tool: &str) -> Result<Self, BackendError> {
        exec::probe_tool(tool).await?;
        Ok(Self {
            tool: tool.to_string(),
        })
    }
}

#[async_trait]
impl BackendAdapter for ImageOcrAdapter {
    fn id(&self) -> EngineId {
        EngineId::ImageOcr
    }

    fn engine_class(&self) -> EngineClass {
        EngineClass::GpuModel
    }

    async fn convert(&self, req: BackendRequest<'_>) -> Result<BackendOutput, BackendError> {
        let input = req.input.as_file()?;
        exec::require_file(input)?;

        let job = ToolConvertJob {
            input: input.display().to_string(),
            start_page: None,
            end_page: None,
            method: "ocr".to_string(),
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
