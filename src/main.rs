//! Bomharvest command line: extract BOM tables from a directory of drawings.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use bomharvest::config::{Settings, APP_NAME, APP_VERSION};
use bomharvest::pipeline::batch_extraction::run_job;

#[derive(Parser, Debug)]
#[command(name = "bomharvest", version, about = "Extract Bill-of-Materials tables from PDF drawings")]
struct Cli {
    /// TOML configuration file. Flags below override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory scanned recursively for PDFs.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Row dataset CSV.
    #[arg(long)]
    rows_output: Option<PathBuf>,

    /// Per-file summary CSV.
    #[arg(long)]
    summary_output: Option<PathBuf>,

    #[arg(long)]
    database: Option<PathBuf>,

    #[arg(long)]
    checkpoint: Option<PathBuf>,

    #[arg(long)]
    fallback_dir: Option<PathBuf>,

    /// Process at most this many files (0 = all).
    #[arg(long)]
    max_files: Option<usize>,

    /// Worker count instead of the one derived from the host.
    #[arg(short, long)]
    workers: Option<usize>,

    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Skip files recorded in the checkpoint.
    #[arg(long)]
    resume: bool,

    /// Only reprocess files the checkpoint records as failed.
    #[arg(long)]
    retry_failed_only: bool,

    /// Retry timeouts and worker crashes.
    #[arg(long)]
    retry: bool,

    #[arg(long)]
    pdfium_lib: Option<PathBuf>,

    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    fn settings(&self) -> anyhow::Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };

        if let Some(input) = &self.input {
            settings.input_dir = input.clone();
        }
        if let Some(path) = &self.rows_output {
            settings.rows_output = path.clone();
        }
        if let Some(path) = &self.summary_output {
            settings.summary_output = path.clone();
        }
        if let Some(path) = &self.database {
            settings.database_path = path.clone();
        }
        if let Some(path) = &self.checkpoint {
            settings.checkpoint_path = path.clone();
        }
        if let Some(path) = &self.fallback_dir {
            settings.fallback_dir = path.clone();
        }
        if let Some(n) = self.max_files {
            settings.max_files = n;
        }
        if self.workers.is_some() {
            settings.workers = self.workers;
        }
        if let Some(secs) = self.timeout_secs {
            settings.per_file_timeout_secs = secs;
        }
        if let Some(path) = &self.pdfium_lib {
            settings.pdfium_library_path = Some(path.clone());
        }
        settings.resume |= self.resume;
        settings.retry_failed_only |= self.retry_failed_only;
        settings.retry.enabled |= self.retry;
        settings.debug |= self.debug;

        settings.validate()?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings()?;
    bomharvest::init_tracing(settings.debug);
    tracing::info!("{APP_NAME} starting v{APP_VERSION}");

    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupt);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl-C received, finishing in-flight files");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let report = tokio::task::spawn_blocking(move || run_job(settings, interrupt))
        .await
        .context("job thread failed")??;

    let code = report.exit_code();
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
