//! CLI binary for edgequake-receipts.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ExtractionConfig`, resolves the API key, and writes the spreadsheet.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_receipts::config::DEFAULT_GEMINI_BASE_URL;
use edgequake_receipts::{
    extract, ColumnSet, Credential, Diagnostic, ExpenseTable, ExtractionConfig, ExtractionOutput,
    ExtractionProgressCallback, GeminiModel, ProgressCallback, ReceiptError,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

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

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress: one bar over the batch plus a log line per file and
/// per failure.
struct CliProgressCallback {
    bar: ProgressBar,
    failures: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} files  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(style);
        bar.set_prefix("Extracting");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            failures: AtomicUsize::new(0),
        })
    }

    /// Clear the bar when the batch ends without `on_batch_complete`.
    fn abandon(&self) {
        if !self.bar.is_finished() {
            self.bar.finish_and_clear();
        }
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_files: usize) {
        self.bar.set_length(total_files as u64);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Extracting expenses from {total_files} file(s)…"))
        ));
    }

    fn on_file_start(&self, _index: usize, _total: usize, filename: &str) {
        self.bar.set_message(filename.to_string());
    }

    fn on_diagnostic(&self, diagnostic: &Diagnostic) {
        self.failures.fetch_add(1, Ordering::SeqCst);
        let msg = diagnostic.to_string();
        let msg = if msg.chars().count() > 100 {
            format!("{}\u{2026}", msg.chars().take(99).collect::<String>())
        } else {
            msg
        };
        self.bar.println(format!("  {} {}", red("✗"), red(&msg)));
    }

    fn on_file_complete(&self, index: usize, total: usize, filename: &str, rows: usize, _f: f32) {
        self.bar.println(format!(
            "  {} {:>3}/{:<3}  {}  {}",
            if rows > 0 { green("✓") } else { red("✗") },
            index + 1,
            total,
            filename,
            dim(&format!("{rows} row(s)")),
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, total_files: usize, total_rows: usize) {
        self.bar.finish_and_clear();
        let failures = self.failures.load(Ordering::SeqCst);
        eprintln!(
            "{} {} row(s) from {} file(s){}",
            if total_rows == 0 {
                red("✘")
            } else if failures > 0 {
                cyan("⚠")
            } else {
                green("✔")
            },
            bold(&total_rows.to_string()),
            total_files,
            if failures > 0 {
                format!("  ({} failure(s))", red(&failures.to_string()))
            } else {
                String::new()
            },
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract a folder of receipt photos into expenses.xlsx
  receipts2xlsx receipts/*.jpg

  # Invoices as PDF, custom output file
  receipts2xlsx invoice-march.pdf invoice-april.pdf -o q2.xlsx

  # Only lines that were actually paid, French descriptions
  receipts2xlsx --paid-only --language French ticket.png

  # Free-tier friendly: pause 15 s between files, stop after 10 minutes
  receipts2xlsx --pause-between-files 15 --deadline 600 scans/*.pdf

  # Edit rows by hand before exporting
  receipts2xlsx --json scans/*.png > rows.json
  $EDITOR rows.json
  receipts2xlsx --from-json rows.json -o expenses.xlsx

  # Which Gemini models does this key reach?
  receipts2xlsx --list-models

  # Another provider through edgequake-llm
  receipts2xlsx --provider openai --model gpt-4.1-mini,gpt-4.1 receipt.jpg

MODEL FALLBACK:
  --model takes a comma-separated list tried in order for every page. The
  next model is used as soon as one fails (quota, unknown model, network,
  malformed reply). Default: gemini-2.0-flash,gemini-1.5-flash,gemini-1.5-pro

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY          Google Gemini API key (default provider)
  OPENAI_API_KEY          OpenAI API key (--provider openai)
  ANTHROPIC_API_KEY       Anthropic API key (--provider anthropic)
  PDFIUM_LIB_PATH         Path to libpdfium, needed for PDF inputs
  RUST_LOG                Override log filter (e.g. edgequake_receipts=debug)

  Without --api-key or a key in the environment, the key is asked for
  interactively when stdin is a terminal.
"#;

/// Extract receipts and invoices into an expense spreadsheet using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "receipts2xlsx",
    version,
    about = "Extract receipts and invoices into an expense spreadsheet using Vision LLMs",
    long_about = "Read photos (PNG, JPEG, WEBP) and PDFs of receipts or invoices, ask a \
multimodal LLM for the date, merchant, currency, category and line items of each page, and \
write one spreadsheet row per line item.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Receipt images or PDFs: local paths or HTTP/HTTPS URLs.
    #[arg(required_unless_present_any = ["from_json", "list_models"])]
    inputs: Vec<String>,

    /// Spreadsheet to write.
    #[arg(short, long, env = "RECEIPTS_OUTPUT", default_value = "expenses.xlsx")]
    output: PathBuf,

    /// Provider: gemini (default, direct REST) or any edgequake-llm provider.
    #[arg(long, env = "RECEIPTS_PROVIDER", default_value = "gemini")]
    provider: String,

    /// Comma-separated model IDs, tried in order.
    #[arg(long, env = "RECEIPTS_MODELS", value_delimiter = ',')]
    model: Vec<String>,

    /// API key. Falls back to the provider's environment variable.
    #[arg(long)]
    api_key: Option<String>,

    /// Base URL of the Gemini API (for proxies and tests).
    #[arg(long, env = "RECEIPTS_API_BASE")]
    api_base: Option<String>,

    /// Rendering DPI for PDF pages (72–400).
    #[arg(long, env = "RECEIPTS_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Language descriptions and categories are translated into.
    #[arg(long, env = "RECEIPTS_LANGUAGE", default_value = "English")]
    language: String,

    /// Description used for receipts without itemised lines.
    #[arg(long, env = "RECEIPTS_PLACEHOLDER")]
    placeholder: Option<String>,

    /// Keep only rows with a strictly positive amount.
    #[arg(long, env = "RECEIPTS_PAID_ONLY")]
    paid_only: bool,

    /// Leave out the Category column.
    #[arg(long, env = "RECEIPTS_NO_CATEGORY")]
    no_category: bool,

    /// Seconds to wait between two files (rate limits).
    #[arg(long, env = "RECEIPTS_PAUSE", default_value_t = 0)]
    pause_between_files: u64,

    /// Abort the whole batch after this many seconds.
    #[arg(long, env = "RECEIPTS_DEADLINE")]
    deadline: Option<u64>,

    /// Path to a text file containing a custom extraction prompt.
    #[arg(long, env = "RECEIPTS_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "RECEIPTS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Max LLM output tokens per page.
    #[arg(long, env = "RECEIPTS_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "RECEIPTS_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// HTTP download timeout in seconds for URL inputs.
    #[arg(long, env = "RECEIPTS_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Print rows and diagnostics as JSON on stdout instead of writing a spreadsheet.
    #[arg(long, conflicts_with = "from_json")]
    json: bool,

    /// Export rows from a JSON file (as printed by --json) without calling any model.
    #[arg(long, value_name = "FILE")]
    from_json: Option<PathBuf>,

    /// List the Gemini models the API key can use, then exit.
    #[arg(long, conflicts_with_all = ["from_json", "json"])]
    list_models: bool,

    /// Disable progress bar.
    #[arg(long, env = "RECEIPTS_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "RECEIPTS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "RECEIPTS_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar already reports every file and failure, so library
    // INFO logs are muted while it is shown.
    let show_progress = !cli.quiet
        && !cli.no_progress
        && !cli.json
        && !cli.list_models
        && cli.from_json.is_none();
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Re-export mode ───────────────────────────────────────────────────
    if let Some(ref path) = cli.from_json {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read rows from {:?}", path))?;
        let table = rows_from_json(&json).context("Invalid row file")?;
        write_spreadsheet(&cli, &table)?;
        return Ok(());
    }

    // ── Credential ───────────────────────────────────────────────────────
    let credential = resolve_credential(&cli)?;

    // ── Model listing mode ───────────────────────────────────────────────
    if cli.list_models {
        return list_models(&cli, credential).await;
    }

    // ── Build config ─────────────────────────────────────────────────────
    let cli_progress = show_progress.then(CliProgressCallback::new);
    let progress_cb: Option<ProgressCallback> = cli_progress
        .clone()
        .map(|cb| cb as Arc<dyn ExtractionProgressCallback>);
    let config = build_config(&cli, progress_cb).await?;

    // ── Run extraction ───────────────────────────────────────────────────
    let run = extract(&cli.inputs, &config, credential.as_ref());
    let result = match cli.deadline {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), run).await {
            Ok(result) => result,
            Err(_) => {
                if let Some(ref cb) = cli_progress {
                    cb.abandon();
                }
                anyhow::bail!("Deadline of {secs}s reached; batch aborted");
            }
        },
        None => run.await,
    };
    if result.is_err() {
        if let Some(ref cb) = cli_progress {
            cb.abandon();
        }
    }

    let output = match result {
        Ok(output) => output,
        Err(ReceiptError::NothingExtracted { files, diagnostics }) => {
            if !cli.quiet {
                for d in &diagnostics {
                    eprintln!("  {} {}", red("✗"), d);
                }
            }
            return Err(ReceiptError::NothingExtracted { files, diagnostics })
                .context("No spreadsheet written");
        }
        Err(e) => return Err(e).context("Extraction failed"),
    };

    if cli.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
        return Ok(());
    }

    write_spreadsheet(&cli, &output.table)?;
    if !cli.quiet {
        print_summary(&cli, &output, show_progress);
    }
    Ok(())
}

/// Print every model the key can use, name first, description below.
async fn list_models(cli: &Cli, credential: Option<Credential>) -> Result<()> {
    if !cli.provider.eq_ignore_ascii_case("gemini") {
        anyhow::bail!(
            "--list-models queries the Gemini API; provider '{}' is not supported",
            cli.provider
        );
    }
    let credential = credential.ok_or_else(|| ReceiptError::MissingCredential {
        hint: "Supply a Gemini API key via --api-key or GEMINI_API_KEY.".to_string(),
    })?;
    let base = cli.api_base.as_deref().unwrap_or(DEFAULT_GEMINI_BASE_URL);

    let client = reqwest::Client::new();
    let models = GeminiModel::list_models(&client, base, &credential)
        .await
        .context("Could not list models")?;

    for m in &models {
        println!(
            "{}{}",
            bold(m.id()),
            if m.can_generate() {
                String::new()
            } else {
                dim("  (no generateContent)")
            }
        );
        if let Some(ref desc) = m.description {
            println!("    {}", dim(desc.trim()));
        }
    }
    if !cli.quiet {
        eprintln!("{} {} model(s) available", green("✔"), models.len());
    }
    Ok(())
}

/// Accept either a bare row array or a full `--json` dump.
fn rows_from_json(json: &str) -> Result<ExpenseTable> {
    match serde_json::from_str::<ExtractionOutput>(json) {
        Ok(output) => Ok(output.table),
        Err(_) => Ok(ExpenseTable::from_json(json)?),
    }
}

fn write_spreadsheet(cli: &Cli, table: &ExpenseTable) -> Result<()> {
    let columns = ColumnSet::new(!cli.no_category);
    table
        .to_xlsx(&columns)
        .context("Failed to build spreadsheet")?
        .write_to(&cli.output)
        .with_context(|| format!("Failed to write {}", cli.output.display()))?;
    Ok(())
}

fn print_summary(cli: &Cli, output: &ExtractionOutput, show_progress: bool) {
    let stats = &output.stats;
    if !show_progress {
        for d in &output.diagnostics {
            eprintln!("  {} {}", red("✗"), d);
        }
    }
    eprintln!(
        "{}  {} row(s)  {}/{} pages  {}ms  →  {}",
        if output.diagnostics.is_empty() {
            green("✔")
        } else {
            cyan("⚠")
        },
        stats.total_rows,
        stats.processed_pages.saturating_sub(stats.failed_pages),
        stats.processed_pages,
        stats.total_duration_ms,
        bold(&cli.output.display().to_string()),
    );
    eprintln!(
        "   {} model call(s)",
        dim(&stats.model_attempts.to_string())
    );
}

/// `--api-key`, then the provider's environment variable, then an
/// interactive prompt when stdin is a terminal.
fn resolve_credential(cli: &Cli) -> Result<Option<Credential>> {
    if let Some(ref key) = cli.api_key {
        return Ok(Some(Credential::new(key.as_str())));
    }

    if let Some(c) = provider_env_vars(&cli.provider)
        .iter()
        .find_map(|var| Credential::from_env(var))
    {
        return Ok(Some(c));
    }

    if !io::stdin().is_terminal() {
        return Ok(None);
    }

    eprint!("{} API key for {}: ", cyan("?"), bold(&cli.provider));
    io::stderr().flush().ok();
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read API key from stdin")?;
    let credential = Credential::new(line);
    Ok((!credential.is_blank()).then_some(credential))
}

fn provider_env_vars(provider: &str) -> &'static [&'static str] {
    match provider.to_ascii_lowercase().as_str() {
        "gemini" | "google" => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
        "openai" => &["OPENAI_API_KEY"],
        "anthropic" => &["ANTHROPIC_API_KEY"],
        "mistral" => &["MISTRAL_API_KEY"],
        "xai" => &["XAI_API_KEY"],
        "openrouter" => &["OPENROUTER_API_KEY"],
        _ => &[],
    }
}

/// Map CLI args to `ExtractionConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ExtractionConfig> {
    let mut builder = ExtractionConfig::builder()
        .provider_name(cli.provider.as_str())
        .dpi(cli.dpi)
        .target_language(cli.language.as_str())
        .paid_items_only(cli.paid_only)
        .include_category(!cli.no_category)
        .inter_file_delay(Duration::from_secs(cli.pause_between_files))
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .download_timeout_secs(cli.download_timeout);

    let models: Vec<&str> = cli
        .model
        .iter()
        .map(|m| m.trim())
        .filter(|m| !m.is_empty())
        .collect();
    if !models.is_empty() {
        builder = builder.models(models);
    }
    if let Some(ref base) = cli.api_base {
        builder = builder.api_base_url(base.as_str());
    }
    if let Some(ref label) = cli.placeholder {
        builder = builder.placeholder_label(label.as_str());
    }
    if let Some(ref pwd) = cli.password {
        builder = builder.password(pwd.as_str());
    }
    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
