// cms_importer/src/main.rs
// Entry point for the cms-importer CLI application.

use std::io::IsTerminal;
use std::path::Path;
use std::time::Duration;

use clap::Parser;
use cms_importer::cli::{Cli, backup_confirmed};
use cms_importer::error::{ImporterError, Result};
use cms_importer::retry::RetryPolicy;
use cms_importer::runner::{BatchRunner, CancelFlag, ImportJob, JobOptions};
use cms_importer::store::{StoreConfig, open_store};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::error;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<(),> {
    let cli = Cli::parse();

    // Initialize tracing
    let file_appender = tracing_appender::rolling::never(".", "importer.log",);
    let (non_blocking, _guard,) = tracing_appender::non_blocking(file_appender,);
    let default_level = if cli.verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level,),),)
        .with(fmt::layer().with_writer(std::io::stderr,),)
        .with(fmt::layer().with_writer(non_blocking,).with_ansi(false,),)
        .init();

    let spec = cli.command.entity_spec().await?;
    let job = ImportJob {
        path: cli.command.path().to_path_buf(),
        spec,
        options: JobOptions {
            dry_run:     cli.dry_run,
            concurrency: cli.concurrency,
            sample:      cli.sample,
            seed:        cli.seed,
            retry:       RetryPolicy::new(Duration::from_secs(cli.retry_max_elapsed,),),
        },
    };

    if !cli.dry_run && !cli.yes && !confirm_backup().await? {
        println!("Please make a backup before proceeding");
        return Ok((),);
    }

    let store = open_store(StoreConfig {
        url:            cli.store_url.clone(),
        api_token:      cli.api_token.clone(),
        strapi_version: cli.strapi_version,
    },)
    .await?;

    let cancel = CancelFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if on_interrupt.watch_interrupts(tokio::signal::ctrl_c,).await {
            error!("Interrupted again, exiting without waiting for records in flight");
            std::process::exit(130,);
        }
    },);

    let report = match BatchRunner::new(store,).with_cancel_flag(cancel,).run(&job,).await {
        Ok(report,) => report,
        Err(e,) => {
            error!("Import of {} failed: {}", job.path.display(), e);
            return Err(e,);
        },
    };

    if cli.report {
        report.save(Path::new(cms_importer::DEFAULT_REPORT_PATH,),)?;
    }

    if cli.strict && report.has_failures() {
        return Err(ImporterError::RecordsFailed(report.failures.len(),),);
    }

    Ok((),)
}

async fn confirm_backup() -> Result<bool,> {
    if !std::io::stdin().is_terminal() {
        return Err(ImporterError::ConfigurationError(
            "Refusing to write without confirmation; pass --yes once a database backup exists"
                .to_string(),
        ),);
    }

    eprint!("Have you made a database backup? [Y or N] ");
    let mut answer = String::new();
    BufReader::new(tokio::io::stdin(),)
        .read_line(&mut answer,)
        .await
        .map_err(|e| ImporterError::Other(format!("Failed to read answer: {}", e),),)?;
    Ok(backup_confirmed(&answer,),)
}
