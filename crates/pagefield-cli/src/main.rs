use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use pagefield_core::config_file::{self, ConfigFile};
use pagefield_core::{
    AdaptiveLimiter, ArtifactStore, Authorizer, Credentials, Document, ExportFormat,
    FieldExtractor, GeminiExtractor, HistoryFilter, JobEvent, JobOrchestrator, JobRequest,
    Principal, SqliteHistory, ThrottledExtractor,
};
use pagefield_pdf_mupdf::MupdfRasterizer;

mod output;

use output::ColorMode;

/// Pagefield - extract structured fields from every page of a batch of PDFs
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an extraction job over one or more PDFs
    Extract {
        /// PDF files to process
        #[arg(required = true)]
        pdfs: Vec<PathBuf>,

        /// Extraction instructions, or @path to read them from a file
        #[arg(short, long)]
        instructions: String,

        /// Directory for the output artifact (default: configured artifact dir)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output format: csv or json
        #[arg(long)]
        format: Option<ExportFormat>,

        /// Contributor name recorded in history
        #[arg(long, default_value = "local")]
        user: String,
    },

    /// Show recorded job history
    History {
        /// Only show rows for this contributor
        #[arg(long)]
        user: Option<String>,
    },

    /// Show aggregate and per-contributor statistics
    Stats,
}

/// Grants every local caller admin rights; the CLI runs as the machine's
/// user, not on behalf of remote clients.
struct LocalAuthorizer;

impl Authorizer for LocalAuthorizer {
    fn authenticate(&self, credentials: &Credentials) -> Option<Principal> {
        Some(Principal {
            username: credentials.username.clone(),
            admin: true,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let _log_guard = init_tracing(cli.log_file.as_deref())?;

    let mut config = config_file::load_config();
    config.apply_env();

    let color = ColorMode(!cli.no_color);

    match cli.command {
        Command::Extract {
            pdfs,
            instructions,
            output,
            format,
            user,
        } => extract(&config, pdfs, instructions, output, format, user, color).await,
        Command::History { user } => history(&config, user, color).await,
        Command::Stats => stats(&config, color).await,
    }
}

/// Logs go to stderr by default so they don't fight the progress bars on
/// stdout. With `--log-file`, a non-blocking appender is used and the guard
/// must live until exit.
fn init_tracing(
    log_file: Option<&Path>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "warn,pagefield_core=info".into());

    match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
            Ok(None)
        }
    }
}

fn read_instructions(arg: &str) -> anyhow::Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read instructions from {path}")),
        None => Ok(arg.to_string()),
    }
}

fn load_documents(paths: &[PathBuf]) -> anyhow::Result<Vec<Document>> {
    paths
        .iter()
        .map(|path| {
            if !path.exists() {
                anyhow::bail!("File not found: {}", path.display());
            }
            let data = std::fs::read(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());
            Ok(Document::from_upload(&name, data))
        })
        .collect()
}

fn build_extractor(config: &ConfigFile) -> anyhow::Result<Arc<dyn FieldExtractor>> {
    let model = config.model_config();
    if model.api_key.is_empty() {
        anyhow::bail!(
            "No model API key configured. Set PAGEFIELD_MODEL_API_KEY or [model].api_key in the config file."
        );
    }
    let gemini = GeminiExtractor::new(model);
    Ok(match config.requests_per_second() {
        Some(rps) => Arc::new(ThrottledExtractor::new(
            gemini,
            AdaptiveLimiter::per_second(rps),
        )),
        None => Arc::new(gemini),
    })
}

async fn extract(
    config: &ConfigFile,
    pdfs: Vec<PathBuf>,
    instructions: String,
    output: Option<PathBuf>,
    format: Option<ExportFormat>,
    user: String,
    color: ColorMode,
) -> anyhow::Result<()> {
    let instructions = read_instructions(&instructions)?;
    let documents = load_documents(&pdfs)?;
    let extractor = build_extractor(config)?;

    let history_path = config.history_path();
    let history = Arc::new(
        SqliteHistory::open(&history_path)
            .with_context(|| format!("failed to open history at {}", history_path.display()))?,
    );
    let artifacts = Arc::new(ArtifactStore::new(
        output.unwrap_or_else(|| config.artifact_dir()),
        format.unwrap_or_else(|| config.export_format()),
    ));
    let rasterizer = Arc::new(MupdfRasterizer::new().with_dpi(config.raster_dpi()));

    let orchestrator = JobOrchestrator::new(
        config.pipeline_config(),
        rasterizer,
        extractor,
        artifacts.clone(),
        history,
        Arc::new(LocalAuthorizer),
    );

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, cancelling job");
            cancel_clone.cancel();
        }
    });

    tracing::info!(
        documents = documents.len(),
        artifacts = %artifacts.dir().display(),
        "starting extraction"
    );
    let request = JobRequest {
        documents,
        instructions,
        credentials: Credentials::new(user, ""),
    };
    let mut job = orchestrator.run(request, cancel.clone())?;

    let multi = MultiProgress::new();
    let doc_style =
        ProgressStyle::with_template("{spinner:.cyan} {msg:30} [{bar:30.cyan/dim}] {pos}/{len} pages")?
            .progress_chars("=> ");
    let global_style =
        ProgressStyle::with_template("{spinner:.green} {msg:30} [{bar:30.green/dim}] {pos}%")?
            .progress_chars("=> ");

    let global = multi.add(ProgressBar::new(100));
    global.set_style(global_style);
    global.set_message("Overall");
    global.enable_steady_tick(Duration::from_millis(120));

    let mut bars: HashMap<String, ProgressBar> = HashMap::new();
    let mut stdout = std::io::stdout();

    while let Some(event) = job.next_event().await {
        match event {
            JobEvent::PageProgress {
                document_name,
                page_number,
                total_pages,
                ..
            } => {
                let bar = bars.entry(document_name.clone()).or_insert_with(|| {
                    let bar = multi.insert_before(&global, ProgressBar::new(total_pages as u64));
                    bar.set_style(doc_style.clone());
                    bar.set_message(document_name);
                    bar
                });
                bar.set_position(page_number as u64);
            }
            JobEvent::GlobalProgress { percent, .. } => {
                global.set_position(percent.round() as u64);
            }
            JobEvent::DocumentCompleted {
                document_name,
                elapsed_seconds,
                row_count,
                skipped_pages,
                ..
            } => {
                if let Some(bar) = bars.remove(&document_name) {
                    bar.finish_and_clear();
                }
                let mut line = Vec::new();
                output::print_document_completed(
                    &mut line,
                    &document_name,
                    row_count,
                    elapsed_seconds,
                    &skipped_pages,
                    color,
                )?;
                multi.println(String::from_utf8_lossy(&line).trim_end())?;
            }
            JobEvent::DocumentFailed {
                document_name,
                error,
            } => {
                if let Some(bar) = bars.remove(&document_name) {
                    bar.abandon();
                }
                let mut line = Vec::new();
                output::print_document_failed(&mut line, &document_name, &error, color)?;
                multi.println(String::from_utf8_lossy(&line).trim_end())?;
            }
            JobEvent::Completed(result) => {
                global.finish_and_clear();
                let artifact = result
                    .download_reference
                    .as_deref()
                    .map(|r| artifacts.dir().join(r).display().to_string());
                output::print_summary(&mut stdout, &result, artifact.as_deref(), color)?;
                return Ok(());
            }
            JobEvent::Error { message } => {
                global.abandon();
                output::print_error(&mut stdout, &message, color)?;
                anyhow::bail!("extraction job failed");
            }
        }
    }

    global.abandon();
    for bar in bars.values() {
        bar.abandon();
    }
    stdout.flush()?;
    if cancel.is_cancelled() {
        anyhow::bail!("cancelled");
    }
    anyhow::bail!("job ended without a final result")
}

async fn history(config: &ConfigFile, user: Option<String>, color: ColorMode) -> anyhow::Result<()> {
    let path = config.history_path();
    let filter = match user {
        Some(name) => HistoryFilter::Contributor(name),
        None => HistoryFilter::All,
    };
    let rows = tokio::task::spawn_blocking(move || {
        SqliteHistory::open(&path).and_then(|h| h.summaries(&filter))
    })
    .await??;
    output::print_history(&mut std::io::stdout(), &rows, color)?;
    Ok(())
}

async fn stats(config: &ConfigFile, color: ColorMode) -> anyhow::Result<()> {
    let path = config.history_path();
    let (totals, contributors) = tokio::task::spawn_blocking(move || {
        let history = SqliteHistory::open(&path)?;
        Ok::<_, pagefield_core::HistoryError>((history.stats()?, history.contributor_stats()?))
    })
    .await??;
    output::print_stats(&mut std::io::stdout(), &totals, &contributors, color)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instructions_inline_or_from_file() {
        assert_eq!(read_instructions("list invoices").unwrap(), "list invoices");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.txt");
        std::fs::write(&path, "from file").unwrap();
        let arg = format!("@{}", path.display());
        assert_eq!(read_instructions(&arg).unwrap(), "from file");
        assert!(read_instructions("@/does/not/exist").is_err());
    }

    #[test]
    fn missing_pdf_is_reported() {
        let err = load_documents(&[PathBuf::from("/does/not/exist.pdf")]).unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }

    #[test]
    fn local_authorizer_admits_named_user() {
        let p = LocalAuthorizer
            .authenticate(&Credentials::new("sam", ""))
            .unwrap();
        assert_eq!(p.username, "sam");
        assert!(p.admin);
    }

    #[test]
    fn cli_parses_extract() {
        let cli = Cli::try_parse_from([
            "pagefield",
            "extract",
            "a.pdf",
            "b.pdf",
            "-i",
            "@prompt.txt",
            "--format",
            "json",
        ])
        .unwrap();
        match cli.command {
            Command::Extract {
                pdfs, format, user, ..
            } => {
                assert_eq!(pdfs.len(), 2);
                assert_eq!(format, Some(ExportFormat::Json));
                assert_eq!(user, "local");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
