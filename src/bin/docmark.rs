//! CLI binary for docmark.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `OrchestratorConfig` / `ConversionRequest` and prints results.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use docmark::{
    AggregateStatus, ConversionProgressCallback, ConversionRequest, ConversionResult,
    DocumentFormat, EngineId, EnginePolicy, InputRef, Orchestrator, OrchestratorConfig,
    OutputOptions, PageRange,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────

/// Terminal progress callback: a live bar plus per-chunk log lines.
/// Chunks complete out of order under concurrency; every method is
/// re-entrant.
struct CliProgress {
    bar: ProgressBar,
    errors: AtomicUsize,
}

impl CliProgress {
    /// Bar length is set by `on_plan_ready`; open-ended plans (total 0)
    /// keep the spinner style and count upward without an ETA.
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        bar.set_style(spinner);
        bar.set_prefix("Preparing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
        })
    }
}

impl ConversionProgressCallback for CliProgress {
    fn on_plan_ready(&self, total_chunks: usize) {
        if total_chunks > 0 {
            let style = ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} chunks  ⏱ {elapsed_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ");
            self.bar.set_length(total_chunks as u64);
            self.bar.set_style(style);
        }
        self.bar.set_prefix("Converting");
    }

    fn on_chunk_start(&self, seq: usize) {
        self.bar.set_message(format!("chunk {seq}"));
    }

    fn on_chunk_complete(&self, seq: usize, markdown_len: usize) {
        self.bar.println(format!(
            "  {} chunk {:>3}  {}",
            green("✓"),
            seq,
            dim(&format!("{markdown_len:>6} chars")),
        ));
        self.bar.inc(1);
    }

    fn on_chunk_error(&self, seq: usize, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg = if error.len() > 80 {
            format!("{}\u{2026}", &error[..79])
        } else {
            error.to_string()
        };
        self.bar
            .println(format!("  {} chunk {:>3}  {}", red("✗"), seq, red(&msg)));
        self.bar.inc(1);
    }

    fn on_complete(&self, total_chunks: usize, succeeded: usize) {
        self.bar.finish_and_clear();
        let failed = self.errors.load(Ordering::SeqCst);
        if failed == 0 {
            eprintln!(
                "{} {} chunks converted",
                green("✔"),
                bold(&succeeded.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} chunks converted  ({} failed)",
                if succeeded == 0 { red("✘") } else { cyan("⚠") },
                bold(&succeeded.to_string()),
                total_chunks,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Basic conversion (stdout)
  docmark convert report.pdf

  # Convert to file, OCR every page
  docmark convert scan.pdf --policy ocr -o scan.md

  # Pages 0-49 only (0-indexed, end-inclusive)
  docmark convert book.pdf --pages 0-49 -o intro.md

  # Route PDF to the VLM engine
  docmark convert paper.pdf --policy vlm --vlm-url http://localhost:8200

  # Legacy office document (two-stage: soffice → office engine)
  docmark convert minutes.doc -o minutes.md

  # Web page or remote file
  docmark convert https://example.com/article -o article.md
  docmark convert https://example.com/deck.pptx -o deck.md

  # Structured JSON result with per-chunk outcomes
  docmark convert report.pdf --json > result.json

  # Pre-initialise engines before taking traffic
  docmark warm pdf-pipeline office

  # Engine lifecycle states
  docmark engines

ENGINE TOOLS:
  docmark shells out to external engines; override the commands with
  --pipeline-cmd / --office-cmd / --soffice-cmd / --pandoc-cmd or the
  corresponding DOCMARK_* environment variables.
"#;

/// Convert documents (PDF, office, web, epub, images) to Markdown.
#[derive(Parser, Debug)]
#[command(
    name = "docmark",
    version,
    about = "Convert documents to Markdown through managed conversion engines",
    arg_required_else_help = true,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DOCMARK_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DOCMARK_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert one document to Markdown.
    Convert(ConvertArgs),
    /// Pre-initialise engines (all by default) so the first request is fast.
    Warm {
        /// Engine ids to warm (pdf-pipeline, pdf-vlm, office, legacy-office,
        /// web, epub, image-ocr).
        engines: Vec<String>,
    },
    /// Show the lifecycle state of every engine.
    Engines,
}

#[derive(clap::Args, Debug)]
struct ConvertArgs {
    /// Local file path or HTTP/HTTPS URL.
    input: String,

    /// Input format; inferred from the file extension when omitted.
    #[arg(short, long)]
    format: Option<String>,

    /// Engine policy: auto, text, ocr, vlm.
    #[arg(long, default_value = "auto")]
    policy: String,

    /// Page selection: all, 7, 0-49, or 5- (0-indexed, end-inclusive).
    #[arg(long, default_value = "all")]
    pages: String,

    /// Write Markdown to this file instead of stdout.
    #[arg(short, long, env = "DOCMARK_OUTPUT")]
    output: Option<PathBuf>,

    /// Output the structured result (per-chunk outcomes, stats) as JSON.
    #[arg(long)]
    json: bool,

    /// Fail (exit non-zero) when any chunk fails, instead of emitting the
    /// partial document.
    #[arg(long)]
    strict: bool,

    /// Keep intermediate engine artifacts next to the output.
    #[arg(long)]
    keep_artifacts: bool,

    /// Cap on total concurrent backend calls.
    #[arg(short, long, env = "DOCMARK_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Pages per chunk for paginated inputs.
    #[arg(long, env = "DOCMARK_CHUNK_WINDOW", default_value_t = 16)]
    chunk_window: u32,

    /// Retries per chunk on transient backend failure.
    #[arg(long, env = "DOCMARK_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Per-backend-call timeout in seconds.
    #[arg(long, env = "DOCMARK_CALL_TIMEOUT", default_value_t = 300)]
    call_timeout: u64,

    /// HTTP download timeout in seconds for URL inputs.
    #[arg(long, env = "DOCMARK_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Base URL of the VLM inference server (required for --policy vlm).
    #[arg(long, env = "DOCMARK_VLM_URL")]
    vlm_url: Option<String>,

    /// Layout/OCR pipeline command.
    #[arg(long, env = "DOCMARK_PIPELINE_CMD")]
    pipeline_cmd: Option<String>,

    /// Office converter command.
    #[arg(long, env = "DOCMARK_OFFICE_CMD")]
    office_cmd: Option<String>,

    /// Headless LibreOffice command.
    #[arg(long, env = "DOCMARK_SOFFICE_CMD")]
    soffice_cmd: Option<String>,

    /// HTML/EPUB converter command.
    #[arg(long, env = "DOCMARK_PANDOC_CMD")]
    pandoc_cmd: Option<String>,

    /// Disable the progress bar.
    #[arg(long, env = "DOCMARK_NO_PROGRESS")]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Library INFO logs and the progress bar fight over stderr; keep only
    // one of them unless the user asked for verbosity.
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        match &cli.command {
            Command::Convert(args) if !args.no_progress && !args.json => "error",
            _ => "info",
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Convert(args) => run_convert(args, cli.quiet).await,
        Command::Warm { engines } => run_warm(engines).await,
        Command::Engines => run_engines().await,
    }
}

async fn run_convert(args: ConvertArgs, quiet: bool) -> Result<()> {
    let format = infer_format(&args)?;
    let policy: EnginePolicy = args
        .policy
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let pages = parse_pages(&args.pages)?;

    let show_progress = !quiet && !args.no_progress && !args.json;
    let progress = show_progress.then(CliProgress::new);

    let mut builder = OrchestratorConfig::builder()
        .global_concurrency(args.concurrency)
        .chunk_window(args.chunk_window)
        .max_retries(args.max_retries)
        .call_timeout_secs(args.call_timeout)
        .download_timeout_secs(args.download_timeout);
    let mut engines = docmark::EngineSettings::default();
    if let Some(cmd) = args.pipeline_cmd.clone() {
        engines.pipeline_cmd = cmd;
    }
    if let Some(cmd) = args.office_cmd.clone() {
        engines.office_cmd = cmd;
    }
    if let Some(cmd) = args.soffice_cmd.clone() {
        engines.soffice_cmd = cmd;
    }
    if let Some(cmd) = args.pandoc_cmd.clone() {
        engines.pandoc_cmd = cmd;
    }
    engines.vlm_server_url = args.vlm_url.clone();
    builder = builder.engines(engines);
    if let Some(cb) = &progress {
        builder = builder.progress_callback(cb.clone() as Arc<dyn ConversionProgressCallback>);
    }
    let config = builder.build().context("Invalid configuration")?;

    let output_dir = args
        .output
        .as_ref()
        .and_then(|p| p.parent().map(Path::to_path_buf));
    let request = ConversionRequest::new(&args.input, format)
        .with_policy(policy)
        .with_pages(pages)
        .with_output(OutputOptions {
            persist: args.output.is_some(),
            persist_intermediate: args.keep_artifacts,
            output_dir,
        });

    let orchestrator = Orchestrator::new(config).context("Orchestrator setup failed")?;
    let result = orchestrator
        .convert(&request)
        .await
        .context("Conversion failed")?;

    let result = if args.strict {
        result.into_result().context("Conversion incomplete")?
    } else {
        result
    };

    emit_result(&args, &result, quiet)
}

fn emit_result(args: &ConvertArgs, result: &ConversionResult, quiet: bool) -> Result<()> {
    if let Some(path) = &args.output {
        write_atomic(path, result.markdown.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        if !quiet {
            let marker = match result.status {
                AggregateStatus::Success => green("✔"),
                AggregateStatus::Partial => cyan("⚠"),
                AggregateStatus::Failed => red("✘"),
            };
            eprintln!(
                "{marker}  {}/{} chunks  {}ms  →  {}",
                result.stats.succeeded_chunks,
                result.stats.total_chunks,
                result.stats.total_duration_ms,
                bold(&path.display().to_string()),
            );
        }
    } else if args.json {
        let json = serde_json::to_string_pretty(result).context("Failed to serialise result")?;
        println!("{json}");
    } else {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(result.markdown.as_bytes())
            .context("Failed to write to stdout")?;
        if !result.markdown.ends_with('\n') {
            handle.write_all(b"\n").context("Failed to write to stdout")?;
        }
    }

    if result.status == AggregateStatus::Failed {
        bail!(
            "no content produced: {}",
            result.first_error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn run_warm(engines: Vec<String>) -> Result<()> {
    let config = OrchestratorConfig::default();
    let orchestrator = Orchestrator::new(config).context("Orchestrator setup failed")?;
    let targets: Vec<EngineId> = if engines.is_empty() {
        EngineId::ALL.to_vec()
    } else {
        engines
            .iter()
            .map(|s| s.parse().map_err(|e: String| anyhow::anyhow!(e)))
            .collect::<Result<_>>()?
    };

    let mut failures = 0usize;
    for id in targets {
        match orchestrator.registry().warm(id).await {
            Ok(()) => eprintln!("{} {id}", green("✔")),
            Err(e) => {
                failures += 1;
                eprintln!("{} {id}  {}", red("✗"), dim(&e.to_string()));
            }
        }
    }
    if failures > 0 {
        bail!("{failures} engine(s) failed to warm");
    }
    Ok(())
}

async fn run_engines() -> Result<()> {
    let config = OrchestratorConfig::default();
    let orchestrator = Orchestrator::new(config).context("Orchestrator setup failed")?;
    for id in EngineId::ALL {
        let health = orchestrator.registry().health(id);
        println!("{id:<16} {health:?}");
    }
    Ok(())
}

fn infer_format(args: &ConvertArgs) -> Result<DocumentFormat> {
    if let Some(f) = &args.format {
        return f.parse().map_err(|e: String| anyhow::anyhow!(e));
    }
    match InputRef::parse(&args.input) {
        InputRef::Path(path) => DocumentFormat::from_path(&path).with_context(|| {
            format!(
                "cannot infer format of '{}'; pass --format",
                path.display()
            )
        }),
        InputRef::Url(url) => {
            // A URL with a recognisable file extension is that file; anything
            // else is a web page.
            let path_part = url.split(['?', '#']).next().unwrap_or(&url);
            Ok(DocumentFormat::from_path(Path::new(path_part)).unwrap_or(DocumentFormat::Html))
        }
    }
}

/// Parse `all`, `7`, `0-49`, or `5-` into a [`PageRange`].
fn parse_pages(s: &str) -> Result<PageRange> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("all") {
        return Ok(PageRange::all());
    }
    if let Some(start) = s.strip_suffix('-') {
        let start: u32 = start.trim().parse().context("invalid start page")?;
        return Ok(PageRange::from_page(start));
    }
    if let Some((start, end)) = s.split_once('-') {
        let start: u32 = start.trim().parse().context("invalid start page")?;
        let end: u32 = end.trim().parse().context("invalid end page")?;
        if end < start {
            bail!("end page {end} is before start page {start}");
        }
        return Ok(PageRange::bounded(start, end));
    }
    let page: u32 = s.parse().context("invalid page number")?;
    Ok(PageRange::bounded(page, page))
}

/// Write via a temp file in the target directory plus rename, so a crash
/// mid-write never leaves a truncated output file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = match dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            tempfile::NamedTempFile::new_in(dir)?
        }
        None => tempfile::NamedTempFile::new_in(".")?,
    };
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
