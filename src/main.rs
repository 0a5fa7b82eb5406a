// Module-specific lints configuration
#![allow(clippy::uninlined_format_args)]

use anyhow::{Context, Result, anyhow};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{Shell, generate};
use indicatif::{ProgressBar, ProgressStyle};
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError, error, info, warn};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};

use fluentai::app_config::{Config, LogLevel};
use fluentai::{Controller, RuntimeError, language_utils};

/// CLI Wrapper for LogLevel to implement ValueEnum
#[derive(Debug, Clone, ValueEnum)]
enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<CliLogLevel> for LogLevel {
    fn from(cli_level: CliLogLevel) -> Self {
        match cli_level {
            CliLogLevel::Error => LogLevel::Error,
            CliLogLevel::Warn => LogLevel::Warn,
            CliLogLevel::Info => LogLevel::Info,
            CliLogLevel::Debug => LogLevel::Debug,
            CliLogLevel::Trace => LogLevel::Trace,
        }
    }
}

#[derive(Parser, Debug)]
struct PairArgs {
    /// Source language code (e.g., 'de', 'fr')
    #[arg(short, long)]
    source_language: String,

    /// Target language code (e.g., 'en', 'es')
    #[arg(short, long)]
    target_language: String,
}

#[derive(Parser, Debug)]
struct TranslateArgs {
    #[command(flatten)]
    pair: PairArgs,

    /// Text to translate; every line of stdin is translated when omitted
    #[arg(value_name = "TEXT")]
    text: Option<String>,
}

#[derive(Parser, Debug)]
struct FileArgs {
    #[command(flatten)]
    pair: PairArgs,

    /// Text file to translate line by line
    #[arg(value_name = "INPUT_PATH")]
    input_path: PathBuf,

    /// Output file (defaults to <stem>.<target>.<ext> next to the input)
    #[arg(short, long)]
    output_path: Option<PathBuf>,

    /// Force overwrite of an existing output file
    #[arg(short, long)]
    force_overwrite: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Translate text given as argument or read from stdin
    Translate(TranslateArgs),

    /// Translate a text file line by line
    File(FileArgs),

    /// Start the decoders a language pair needs and print their status
    Check(PairArgs),

    /// Generate shell completions for fluentai
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// FluentAI - translation over external decoder processes
#[derive(Parser, Debug)]
#[command(name = "fluentai")]
#[command(version)]
#[command(about = "Text translation backed by per-language-pair decoder processes")]
#[command(long_about = "FluentAI runs one external decoder (marian-decoder by default) per language
pair, keeps a bounded number of them alive, and chains two of them through a pivot
language when no direct model exists.

EXAMPLES:
    fluentai translate -s de -t en \"Guten Morgen\"   # Direct pair
    fluentai translate -s de -t fr \"Guten Morgen\"   # Pivots through English
    cat notes.txt | fluentai translate -s fr -t en  # One line at a time
    fluentai file -s en -t es notes.txt             # Writes notes.es.txt
    fluentai check -s de -t fr                      # Starts de-en and en-fr
    fluentai completions bash > fluentai.bash

CONFIGURATION:
    Settings are read from config.json by default. A default file is written when
    it does not exist. Models live in <models_dir>/<source>-<target>/ and must hold
    a *.npz weights file, a *vocab*.yml vocabulary and a *decoder*.yml config.")]
struct CommandLineOptions {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "config.json", global = true)]
    config_path: String,

    /// Set logging level
    #[arg(short, long, value_enum, global = true)]
    log_level: Option<CliLogLevel>,
}

/// Optional copy of every log line, set once the config is known
static LOG_FILE: OnceCell<Mutex<File>> = OnceCell::new();

// @struct: Custom logger implementation
struct CustomLogger {
    level: LevelFilter,
}

impl CustomLogger {
    // @initializes: Global logger
    fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
        log::set_boxed_logger(Box::new(CustomLogger { level: LevelFilter::Trace }))?;
        log::set_max_level(level);
        Ok(())
    }

    // @returns: Emoji for log level
    fn get_emoji_for_level(level: Level) -> &'static str {
        match level {
            Level::Error => "❌",
            Level::Warn => "🚧",
            Level::Info => " ",
            Level::Debug => "🔍",
            Level::Trace => "📋",
        }
    }

    // @returns: ANSI color for log level
    fn get_color_for_level(level: Level) -> &'static str {
        match level {
            Level::Error => "1;31",
            Level::Warn => "1;33",
            Level::Info => "1;32",
            Level::Debug => "1;36",
            Level::Trace => "1;35",
        }
    }
}

impl Log for CustomLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let now = chrono::Local::now();
        let emoji = Self::get_emoji_for_level(record.level());
        let color = Self::get_color_for_level(record.level());

        let _ = writeln!(
            std::io::stderr(),
            "\x1B[{}m{} {} {}\x1B[0m",
            color,
            now.format("%H:%M:%S.%3f"),
            emoji,
            record.args()
        );

        if let Some(file) = LOG_FILE.get() {
            let _ = writeln!(
                file.lock(),
                "{} - {} - {} - {}",
                now.format("%Y-%m-%d %H:%M:%S%.3f"),
                record.target(),
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
        if let Some(file) = LOG_FILE.get() {
            let _ = file.lock().flush();
        }
    }
}

fn open_log_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))?;

    // A second call keeps the first file
    let _ = LOG_FILE.set(Mutex::new(file));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Info until the config tells otherwise
    CustomLogger::init(LevelFilter::Info)?;

    let cli = CommandLineOptions::parse();

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = CommandLineOptions::command();
        generate(shell, &mut cmd, "fluentai", &mut std::io::stdout());
        return Ok(());
    }

    if let Some(level) = &cli.log_level {
        log::set_max_level(LogLevel::from(level.clone()).to_level_filter());
    }

    let mut config = Config::load_or_create(&cli.config_path)?;
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone().into();
    }
    log::set_max_level(config.log_level.to_level_filter());

    if let Some(log_file) = &config.log_file {
        open_log_file(log_file)?;
    }

    let controller = Controller::with_config(config)?;

    let result = tokio::select! {
        result = run_command(&controller, cli.command) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down decoders");
            Ok(())
        }
    };

    controller.clear_all().await;
    result
}

async fn run_command(controller: &Controller, command: Commands) -> Result<()> {
    match command {
        Commands::Translate(args) => run_translate(controller, args).await,
        Commands::File(args) => run_file(controller, args).await,
        Commands::Check(args) => run_check(controller, args).await,
        Commands::Completions { .. } => Ok(()),
    }
}

/// Translate once, retrying a single time when the runtime already recovered
async fn translate_with_retry(controller: &Controller, pair: &PairArgs, text: &str) -> Result<String, RuntimeError> {
    match controller.translate(&pair.source_language, &pair.target_language, text).await {
        Err(e) if e.is_retryable() => {
            warn!("{}; retrying once", e);
            controller.translate(&pair.source_language, &pair.target_language, text).await
        }
        other => other,
    }
}

async fn run_translate(controller: &Controller, args: TranslateArgs) -> Result<()> {
    info!(
        "Translating {}",
        language_utils::describe_pair(&args.pair.source_language, &args.pair.target_language)
    );

    if let Some(text) = &args.text {
        let translated = translate_with_retry(controller, &args.pair, text).await?;
        println!("{}", translated);
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut failures = 0usize;
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            println!();
            continue;
        }

        match translate_with_retry(controller, &args.pair, &line).await {
            Ok(translated) => println!("{}", translated),
            Err(e @ (RuntimeError::InvalidRequest(_) | RuntimeError::NotFound(_))) => return Err(e.into()),
            Err(e) => {
                error!("Failed to translate line: {}", e);
                failures += 1;
                println!();
            }
        }
    }

    if failures > 0 {
        return Err(anyhow!("{} line(s) could not be translated", failures));
    }
    Ok(())
}

// @generates: Output path for a translated file
fn default_output_path(input: &Path, target_language: &str) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default().to_string_lossy();
    let file_name = match input.extension() {
        Some(ext) => format!("{}.{}.{}", stem, target_language, ext.to_string_lossy()),
        None => format!("{}.{}", stem, target_language),
    };
    input.with_file_name(file_name)
}

async fn run_file(controller: &Controller, args: FileArgs) -> Result<()> {
    let output_path = args
        .output_path
        .clone()
        .unwrap_or_else(|| default_output_path(&args.input_path, &args.pair.target_language));

    if output_path.exists() && !args.force_overwrite {
        warn!("Output file already exists: {:?}. Use -f to force overwrite.", output_path);
        return Ok(());
    }

    let content = std::fs::read_to_string(&args.input_path)
        .with_context(|| format!("Failed to read file: {:?}", args.input_path))?;
    let lines: Vec<String> = content.lines().map(str::to_string).collect();

    let progress = ProgressBar::new(lines.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} lines ({eta})")
            .context("Invalid progress bar template")?
            .progress_chars("#>-"),
    );

    let translated = controller
        .translate_lines(
            &args.pair.source_language,
            &args.pair.target_language,
            &lines,
            |done, _total| progress.set_position(done as u64),
        )
        .await;
    progress.finish_and_clear();
    let translated = translated?;

    let mut output = translated.join("\n");
    output.push('\n');
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(&output_path, output)
        .with_context(|| format!("Failed to write to file: {:?}", output_path))?;

    info!("Success: {:?}", output_path);
    Ok(())
}

async fn run_check(controller: &Controller, args: PairArgs) -> Result<()> {
    let keys = controller
        .warm_up(&args.source_language, &args.target_language)
        .await?;

    if keys.is_empty() {
        info!("Source and target are the same language, no decoder needed");
    }

    let status = serde_json::to_string_pretty(&controller.status_snapshot())
        .context("Failed to serialize runtime status")?;
    println!("{}", status);
    Ok(())
}
