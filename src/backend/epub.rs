//! EPUB adapter: whole-book conversion through the ebook tool.
//!
//! EPUB is already reflowable text, so no layout model is involved — the
//! converter tool (pandoc by default) reads the archive and emits GFM
//! directly on stdout. Chapters are not treated as pages; the whole book
//! is one unit of work.

use crate::backend::exec;
use crate::backend::{BackendAdapter, BackendOutput, BackendRequest};
use crate::error::BackendError;
use crate::governor::EngineClass;
use crate::registry::EngineId;
use async_trait::async_trait;

#[derive(Debug)]
pub struct EpubAdapter {
    tool: String,
}

impl EpubAdapter {
    pub async fn init(tool: &str) -> Result<Self, BackendError> {
        exec::probe_tool(tool).await?;
        Ok(Self {
            tool: tool.to_string(),
        })
    }
}

#[async_trait]
impl BackendAdapter for EpubAdapter {
    fn id(&self) -> EngineId {
        EngineId::Epub
    }

    fn engine_class(&self) -> EngineClass {
        EngineClass::Subprocess
    }

    async fn convert(&self, req: BackendRequest<'_>) -> Result<BackendOutput, BackendError> {
        let input = req.input.as_file()?;
        exec::require_file(input)?;

        let markdown = exec::run_capture(
            &self.tool,
            &["-f", "epub", "-t", "gfm", &input.display().to_string()],
        )
        .await?;

        Ok(BackendOutput {
            markdown,
            pages_converted: 1,
            reached_end: true,
            warnings: Vec::new(),
        })
    }
}
