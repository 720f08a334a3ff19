mod progress;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use drive2pdf::batch::{BatchRunner, resolve_path};
use drive2pdf::config::Config;
use drive2pdf::drive::{DriveConnector, recent_files};
use drive2pdf::session::{Session, SessionFactory};
use drive2pdf::{EventHandler, Watcher};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::progress::TerminalProgress;

const INVALID_WATCH_ARGS: &str = "Invalid args. Only accepts 1 directory to watch for new files.";
const NO_FILES: &str = "No files given.";

#[derive(Parser, Debug)]
#[command(
    name = "drive2pdf",
    version,
    about = "Convert DOC, DOCX, PPT, and PPTX files to PDF through Google Drive"
)]
struct Cli {
    /// Files or directories to convert, or the one directory to watch with -w
    files: Vec<PathBuf>,

    /// Watch a directory (default: current) and convert new documents
    #[arg(short = 'w', long = "watch", alias = "w")]
    watch: bool,

    /// Keep the uploaded copies in Drive after downloading the PDF
    #[arg(long)]
    keep_remote: bool,

    /// Convert whole directories without asking
    #[arg(short = 'y', long)]
    yes: bool,

    /// Seconds an unused Drive session stays open in watch mode
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    idle_timeout: u64,

    /// Where the OAuth token is cached
    #[arg(long, env = "DRIVE2PDF_TOKEN", default_value = "token.json")]
    token: PathBuf,

    /// OAuth client secrets used for first-time authorization
    #[arg(long, env = "DRIVE2PDF_CREDENTIALS", default_value = "credentials.json")]
    credentials: PathBuf,

    /// List the N most recent files in Drive and exit
    #[arg(
        long,
        value_name = "N",
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    recent: Option<usize>,
}

#[derive(Debug, PartialEq, Eq)]
enum Mode {
    Recent(usize),
    /// Watch the given directory, or the current one.
    Watch(Option<PathBuf>),
    Batch(Vec<PathBuf>),
    Invalid(&'static str),
}

fn select_mode(cli: &Cli) -> Mode {
    if let Some(count) = cli.recent {
        return Mode::Recent(count);
    }
    if cli.watch {
        return match cli.files.as_slice() {
            [] => Mode::Watch(None),
            [dir] => Mode::Watch(Some(dir.clone())),
            _ => Mode::Invalid(INVALID_WATCH_ARGS),
        };
    }
    if cli.files.is_empty() {
        Mode::Invalid(NO_FILES)
    } else {
        Mode::Batch(cli.files.clone())
    }
}

fn build_config(cli: &Cli) -> Config {
    let mut config = Config {
        idle_timeout: Duration::from_secs(cli.idle_timeout),
        delete_after: !cli.keep_remote,
        ..Config::default()
    };
    if cli.yes {
        config.confirm_threshold = usize::MAX;
    }
    config.auth.token_path = cli.token.clone();
    config.auth.client_secret_path = cli.credentials.clone();
    config
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err:#}");
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config = build_config(&cli);
    match select_mode(&cli) {
        Mode::Recent(count) => list_recent(&config, count),
        Mode::Watch(dir) => watch(config, dir),
        Mode::Batch(paths) => convert_batch(config, &paths),
        Mode::Invalid(message) => {
            eprintln!("{message}");
            Ok(())
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn list_recent(config: &Config, count: usize) -> Result<()> {
    let connector = DriveConnector::from_config(config)?;
    let session = connector.open().context("opening Drive session")?;
    let files = recent_files(&session, count);
    session.close();
    for file in files.context("listing recent files")? {
        println!("{}  {}", file.id, file.name);
    }
    Ok(())
}

fn watch(config: Config, dir: Option<PathBuf>) -> Result<()> {
    let root = match dir {
        Some(dir) => resolve_path(&dir)?,
        None => std::env::current_dir().context("reading current directory")?,
    };
    if !root.is_dir() {
        eprintln!("{INVALID_WATCH_ARGS}");
        return Ok(());
    }

    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupt);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("installing Ctrl-C handler")?;

    let connector = DriveConnector::from_config(&config)?;
    let handler = Arc::new(EventHandler::with_progress(
        connector,
        config,
        TerminalProgress::new(),
    )?);
    let watcher = Watcher::new(Arc::clone(&handler), &root);
    watcher
        .start(&interrupt)
        .with_context(|| format!("watching {}", root.display()))?;

    let stats = handler.stats();
    println!(
        "Converted {} file(s), {} failed, {} discarded",
        stats.converted, stats.failed, stats.dropped
    );
    Ok(())
}

fn convert_batch(config: Config, paths: &[PathBuf]) -> Result<()> {
    let connector = DriveConnector::from_config(&config)?;
    let progress = TerminalProgress::new();
    let mut confirm = |_dir: &Path, count: usize| ask_to_convert(count);

    let summary = BatchRunner::new(connector, config).run(paths, &mut confirm, &progress)?;

    println!(
        "Converted {} file(s), skipped {}, failed {}",
        summary.converted, summary.skipped, summary.failed
    );
    if !summary.is_success() {
        bail!("{} file(s) failed to convert", summary.failed);
    }
    Ok(())
}

fn ask_to_convert(count: usize) -> bool {
    dialoguer::Confirm::new()
        .with_prompt(format!("There are {count} files to convert, are you sure?"))
        .default(false)
        .interact()
        .unwrap_or_else(|e| {
            warn!(error = %e, "could not read answer, skipping directory");
            false
        })
}
