//! Input resolution: turn an [`InputRef`] into something an engine can open.
//!
//! Local paths are validated up front (existence, plus a cheap magic-byte
//! check for PDFs) so that a typo'd path fails in milliseconds instead of
//! after an engine initialisation. URL inputs are streamed to a temp file
//! whose lifetime is tied to the returned [`ResolvedInput`] — the file is
//! removed when the conversion's resolved input is dropped.
//!
//! Web pages are the one exception: the web engine fetches the URL itself
//! (it needs response headers and the final redirect target for relative
//! links), so HTML URLs pass through unresolved.

use crate::backend::ResolvedSource;
use crate::error::ConvertError;
use crate::request::{DocumentFormat, InputRef};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// PDF files start with `%PDF-`; anything else with a .pdf name is going to
/// fail deep inside the layout engine with a much worse message.
const PDF_MAGIC: &[u8] = b"%PDF-";

/// A resolved input, alive for the duration of one conversion.
#[derive(Debug)]
pub enum ResolvedInput {
    /// A caller-owned local file; never deleted by us.
    Local(PathBuf),
    /// Downloaded into a temp directory removed on drop.
    Downloaded { path: PathBuf, _guard: TempDir },
    /// An HTML URL the web engine fetches itself.
    PassthroughUrl(String),
}

impl ResolvedInput {
    /// Borrow as the form backend adapters accept.
    pub fn source(&self) -> ResolvedSource<'_> {
        match self {
            Self::Local(p) => ResolvedSource::File(p),
            Self::Downloaded { path, .. } => ResolvedSource::File(path),
            Self::PassthroughUrl(u) => ResolvedSource::Url(u),
        }
    }

    /// The local path, when one exists.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Local(p) => Some(p),
            Self::Downloaded { path, .. } => Some(path),
            Self::PassthroughUrl(_) => None,
        }
    }
}

/// Resolve a request input to a local file (or URL pass-through for web
/// pages), downloading if needed.
pub async fn resolve(
    input: &InputRef,
    format: DocumentFormat,
    client: &reqwest::Client,
    download_timeout: Duration,
) -> Result<ResolvedInput, ConvertError> {
    match input {
        InputRef::Path(path) => {
            validate_local(path, format)?;
            Ok(ResolvedInput::Local(path.clone()))
        }
        InputRef::Url(url) if format == DocumentFormat::Html => {
            debug!(%url, "passing URL through to the web engine");
            Ok(ResolvedInput::PassthroughUrl(url.clone()))
        }
        InputRef::Url(url) => download(url, format, client, download_timeout).await,
    }
}

fn validate_local(path: &Path, format: DocumentFormat) -> Result<(), ConvertError> {
    if !path.is_file() {
        return Err(ConvertError::InputNotFound {
            path: path.to_path_buf(),
        });
    }
    if format == DocumentFormat::Pdf {
        let mut head = [0u8; 5];
        let read_ok = fs::File::open(path)
            .and_then(|mut f| f.read_exact(&mut head))
            .is_ok();
        if !read_ok || head != *PDF_MAGIC {
            return Err(ConvertError::InvalidRequest {
                detail: format!(
                    "'{}' does not look like a PDF (missing %PDF- header)",
                    path.display()
                ),
            });
        }
    }
    Ok(())
}

/// Stream a URL into a temp file named after the format's extension.
async fn download(
    url: &str,
    format: DocumentFormat,
    client: &reqwest::Client,
    timeout: Duration,
) -> Result<ResolvedInput, ConvertError> {
    use futures::StreamExt;

    let guard = TempDir::new().map_err(|e| ConvertError::Internal(format!(
        "could not create download directory: {e}"
    )))?;
    let path = guard.path().join(format!("input.{}", download_ext(url, format)));

    info!(%url, dest = %path.display(), "downloading input");
    let fetch = async {
        let response = client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ConvertError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let mut file =
            tokio::fs::File::create(&path)
                .await
                .map_err(|e| ConvertError::DownloadFailed {
                    url: url.to_string(),
                    reason: format!("could not create temp file: {e}"),
                })?;
        let mut stream = response.bytes_stream();
        let mut total: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ConvertError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            total += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .map_err(|e| ConvertError::DownloadFailed {
                    url: url.to_string(),
                    reason: format!("write failed: {e}"),
                })?;
        }
        file.flush().await.map_err(|e| ConvertError::DownloadFailed {
            url: url.to_string(),
            reason: format!("flush failed: {e}"),
        })?;
        Ok::<u64, ConvertError>(total)
    };

    let total = tokio::time::timeout(timeout, fetch)
        .await
        .map_err(|_| ConvertError::DownloadTimeout {
            url: url.to_string(),
            secs: timeout.as_secs(),
        })??;
    info!(%url, bytes = total, "download complete");

    validate_local(&path, format)?;
    Ok(ResolvedInput::Downloaded {
        path,
        _guard: guard,
    })
}

/// Extension for the downloaded temp file: taken from the URL path when it
/// matches the declared format, otherwise a canonical one for the format.
fn download_ext(url: &str, format: DocumentFormat) -> String {
    let from_url = url
        .split(['?', '#'])
        .next()
        .and_then(|p| p.rsplit('/').next())
        .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()))
        .filter(|ext| DocumentFormat::from_path(Path::new(&format!("x.{ext}"))) == Some(format));
    from_url.unwrap_or_else(|| {
        match format {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Docx => "docx",
            DocumentFormat::Doc => "doc",
            DocumentFormat::Pptx => "pptx",
            DocumentFormat::Ppt => "ppt",
            DocumentFormat::Xlsx => "xlsx",
            DocumentFormat::Html => "html",
            DocumentFormat::Epub => "epub",
            DocumentFormat::Image => "png",
        }
        .to_string()
    })
}
