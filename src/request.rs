//! Request types: what to convert, with which engine, over which pages.
//!
//! A [`ConversionRequest`] is immutable once built. Everything the
//! orchestrator needs to run one conversion — input reference, declared
//! format, engine policy, page range, output options, timeout override —
//! is captured up front so a request can be logged, cloned for a retry of
//! failed ranges, or serialised into a job queue without surprises.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Supported input document formats.
///
/// The routing table in [`crate::registry`] maps each format (together with
/// the requested [`EnginePolicy`]) to a concrete engine. Adding a format is
/// a data change there, not new branching logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Docx,
    /// Legacy binary Word format; converted to DOCX before parsing.
    Doc,
    Pptx,
    /// Legacy binary PowerPoint format; converted to PPTX before parsing.
    Ppt,
    Xlsx,
    /// Local HTML file or a fetched web page.
    Html,
    Epub,
    /// Raster image (PNG/JPEG); OCR-only.
    Image,
}

impl DocumentFormat {
    /// Infer the format from a file extension.
    ///
    /// Returns `None` for unknown extensions — callers decide whether that
    /// is an error (`docmark convert` does) or a fallthrough.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "doc" => Some(Self::Doc),
            "pptx" => Some(Self::Pptx),
            "ppt" => Some(Self::Ppt),
            "xlsx" => Some(Self::Xlsx),
            "html" | "htm" => Some(Self::Html),
            "epub" => Some(Self::Epub),
            "png" | "jpg" | "jpeg" | "webp" => Some(Self::Image),
            _ => None,
        }
    }

    /// Whether inputs of this format are split into page-range chunks.
    ///
    /// Only PDF is paginated from the orchestrator's point of view; every
    /// other format is converted as a single unit of work.
    pub fn is_paginated(&self) -> bool {
        matches!(self, Self::Pdf)
    }

    /// Whether this format requires the two-stage legacy pipeline
    /// (convert to the modern equivalent first, then parse).
    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::Doc | Self::Ppt)
    }

    /// The modern counterpart of a legacy format.
    pub fn modern_equivalent(&self) -> Self {
        match self {
            Self::Doc => Self::Docx,
            Self::Ppt => Self::Pptx,
            other => *other,
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Doc => "doc",
            Self::Pptx => "pptx",
            Self::Ppt => "ppt",
            Self::Xlsx => "xlsx",
            Self::Html => "html",
            Self::Epub => "epub",
            Self::Image => "image",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for DocumentFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pdf" => Ok(Self::Pdf),
            "docx" => Ok(Self::Docx),
            "doc" => Ok(Self::Doc),
            "pptx" => Ok(Self::Pptx),
            "ppt" => Ok(Self::Ppt),
            "xlsx" => Ok(Self::Xlsx),
            "html" | "htm" | "url" => Ok(Self::Html),
            "epub" => Ok(Self::Epub),
            "image" | "png" | "jpg" | "jpeg" => Ok(Self::Image),
            other => Err(format!("unknown format: '{other}'")),
        }
    }
}

/// Which engine family should handle the conversion.
///
/// `Auto` lets the engine decide per page (text extraction where possible,
/// OCR where needed); `Text` and `Ocr` force one mode on the layout engine;
/// `Vlm` routes to the vision-language-model engine instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnginePolicy {
    #[default]
    Auto,
    Text,
    Ocr,
    Vlm,
}

impl fmt::Display for EnginePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Text => "text",
            Self::Ocr => "ocr",
            Self::Vlm => "vlm",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for EnginePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "text" | "txt" => Ok(Self::Text),
            "ocr" => Ok(Self::Ocr),
            "vlm" => Ok(Self::Vlm),
            other => Err(format!("unknown engine policy: '{other}'")),
        }
    }
}

/// Where the input document lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRef {
    /// A file on the local filesystem.
    Path(PathBuf),
    /// An HTTP/HTTPS URL; downloaded to a temp file before dispatch.
    Url(String),
}

impl InputRef {
    /// Classify a user-supplied string as URL or local path.
    pub fn parse(input: &str) -> Self {
        if input.starts_with("http://") || input.starts_with("https://") {
            Self::Url(input.to_string())
        } else {
            Self::Path(PathBuf::from(input))
        }
    }
}

impl fmt::Display for InputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(p) => write!(f, "{}", p.display()),
            Self::Url(u) => f.write_str(u),
        }
    }
}

/// A 0-indexed page range, `end` inclusive; `end = None` means "to the last
/// page", which may be unknown until a backend reports end-of-document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PageRange {
    pub start: u32,
    pub end: Option<u32>,
}

impl PageRange {
    /// Range covering the whole document.
    pub fn all() -> Self {
        Self::default()
    }

    /// Bounded range `[start, end]` (inclusive).
    pub fn bounded(start: u32, end: u32) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    /// From `start` to the end of the document.
    pub fn from_page(start: u32) -> Self {
        Self { start, end: None }
    }

    /// `Some(detail)` when the range is malformed.
    pub fn validate(&self) -> Option<String> {
        match self.end {
            Some(end) if end < self.start => Some(format!(
                "end page {} is before start page {}",
                end, self.start
            )),
            _ => None,
        }
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}..={}", self.start, end),
            None => write!(f, "{}..", self.start),
        }
    }
}

/// Persist-to-disk instructions, carried through the request and executed by
/// the caller-facing layer (the CLI), never by the orchestration core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputOptions {
    /// Write the assembled Markdown to `output_dir` after conversion.
    pub persist: bool,
    /// Also keep intermediate engine artifacts (layout JSON, extracted
    /// images) next to the output.
    pub persist_intermediate: bool,
    /// Target directory for persisted files.
    pub output_dir: Option<PathBuf>,
}

/// An immutable description of one conversion.
///
/// Build with [`ConversionRequest::new`] plus the `with_*` modifiers:
///
/// ```rust
/// use docmark::{ConversionRequest, DocumentFormat, EnginePolicy, PageRange};
///
/// let request = ConversionRequest::new("report.pdf", DocumentFormat::Pdf)
///     .with_policy(EnginePolicy::Ocr)
///     .with_pages(PageRange::bounded(0, 49));
/// ```
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    input: InputRef,
    format: DocumentFormat,
    policy: EnginePolicy,
    pages: PageRange,
    output: OutputOptions,
    timeout: Option<Duration>,
}

impl ConversionRequest {
    /// A request with default policy (`auto`), all pages, no persistence.
    pub fn new(input: impl AsRef<str>, format: DocumentFormat) -> Self {
        Self {
            input: InputRef::parse(input.as_ref()),
            format,
            policy: EnginePolicy::default(),
            pages: PageRange::all(),
            output: OutputOptions::default(),
            timeout: None,
        }
    }

    pub fn with_policy(mut self, policy: EnginePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_pages(mut self, pages: PageRange) -> Self {
        self.pages = pages;
        self
    }

    pub fn with_output(mut self, output: OutputOptions) -> Self {
        self.output = output;
        self
    }

    /// Per-request backend-call timeout, overriding the configured default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn input(&self) -> &InputRef {
        &self.input
    }

    pub fn format(&self) -> DocumentFormat {
        self.format
    }

    pub fn policy(&self) -> EnginePolicy {
        self.policy
    }

    pub fn pages(&self) -> PageRange {
        self.pages
    }

    pub fn output(&self) -> &OutputOptions {
        &self.output
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_extension() {
        assert_eq!(
            DocumentFormat::from_path(Path::new("a/b/report.PDF")),
            Some(DocumentFormat::Pdf)
        );
        assert_eq!(
            DocumentFormat::from_path(Path::new("slides.ppt")),
            Some(DocumentFormat::Ppt)
        );
        assert_eq!(DocumentFormat::from_path(Path::new("noext")), None);
        assert_eq!(DocumentFormat::from_path(Path::new("weird.xyz")), None);
    }

    #[test]
    fn legacy_formats_map_to_modern() {
        assert_eq!(DocumentFormat::Doc.modern_equivalent(), DocumentFormat::Docx);
        assert_eq!(DocumentFormat::Ppt.modern_equivalent(), DocumentFormat::Pptx);
        assert_eq!(DocumentFormat::Pdf.modern_equivalent(), DocumentFormat::Pdf);
        assert!(DocumentFormat::Doc.is_legacy());
        assert!(!DocumentFormat::Docx.is_legacy());
    }

    #[test]
    fn only_pdf_is_paginated() {
        assert!(DocumentFormat::Pdf.is_paginated());
        assert!(!DocumentFormat::Epub.is_paginated());
        assert!(!DocumentFormat::Html.is_paginated());
    }

    #[test]
    fn input_ref_classification() {
        assert_eq!(
            InputRef::parse("https://example.com/a.pdf"),
            InputRef::Url("https://example.com/a.pdf".into())
        );
        assert_eq!(
            InputRef::parse("./a.pdf"),
            InputRef::Path(PathBuf::from("./a.pdf"))
        );
    }

    #[test]
    fn range_validation() {
        assert!(PageRange::bounded(0, 10).validate().is_none());
        assert!(PageRange::bounded(5, 5).validate().is_none());
        assert!(PageRange::from_page(3).validate().is_none());
        assert!(PageRange { start: 10, end: Some(2) }.validate().is_some());
    }
}
