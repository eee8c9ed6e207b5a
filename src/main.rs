//! objsync - resumable object migration
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use objsync::config::{CliArgs, Command, DbArgs, SyncConfig};
use objsync::db::{RecordCursor, StatusStore};
use objsync::engine::SyncEngine;
use objsync::plugin::PluginRegistry;
use objsync::progress::{print_header, print_report, print_summary, ProgressReporter};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let args = CliArgs::parse();

    setup_logging(args.verbose)?;

    match args.command {
        Command::Run(run_args) => {
            let config = SyncConfig::from_args(run_args).context("Invalid configuration")?;
            run_sync(config)
        }
        Command::Report(db) => report(&db).map(|()| ExitCode::SUCCESS),
        Command::Errors { db, retry_queue } => list_errors(&db, retry_queue).map(|()| ExitCode::SUCCESS),
        Command::Drop(db) => drop_table(&db).map(|()| ExitCode::SUCCESS),
    }
}

fn run_sync(config: SyncConfig) -> Result<ExitCode> {
    let registry = PluginRegistry::with_builtins();

    let source = registry
        .resolve_storage(&config.source_uri)
        .context("Failed to create source")?;
    let target = registry
        .resolve_storage(&config.target_uri)
        .context("Failed to create target")?;

    let store = Arc::new(StatusStore::new(config.store.clone()));

    let mut engine = SyncEngine::new(config.options.clone())
        .with_source(source)
        .with_target(target)
        .with_store(Arc::clone(&store));
    for spec in &config.filters {
        let filter = registry
            .resolve_filter(spec)
            .with_context(|| format!("Failed to create filter '{}'", spec))?;
        engine = engine.with_filter(filter);
    }
    let engine = Arc::new(engine);

    // Setup signal handler for termination
    let handle = engine.terminate_handle();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, terminating...");
        handle.terminate();
    })
    .context("Failed to set signal handler")?;

    let db_path = config.store.path.display().to_string();
    if config.show_progress {
        print_header(
            &config.source_uri,
            &config.target_uri,
            config.options.sync_threads,
            &db_path,
        );
    }

    // Progress updates from a side thread while the engine runs
    let done = Arc::new(AtomicBool::new(false));
    let progress_thread = config.show_progress.then(|| {
        let engine = Arc::clone(&engine);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let reporter = ProgressReporter::new();
            reporter.set_status("Starting...");
            while !done.load(Ordering::SeqCst) {
                reporter.update(&engine.progress());
                thread::sleep(Duration::from_millis(200));
            }
            reporter.finish_and_clear();
        })
    });

    let result = engine.run();

    done.store(true, Ordering::SeqCst);
    if let Some(handle) = progress_thread {
        let _ = handle.join();
    }
    store.close();

    let summary = result.context("Sync failed")?;
    print_summary(&summary, &db_path);

    if summary.terminated {
        info!("Sync was terminated before completion");
    }
    if summary.counts.objects_failed > 0 {
        info!(failed = summary.counts.objects_failed, "Sync completed with failures");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn open_store(db: &DbArgs) -> Result<StatusStore> {
    let config = db.store_config().context("Invalid configuration")?;
    if !config.path.exists() {
        anyhow::bail!("Database '{}' does not exist", config.path.display());
    }
    Ok(StatusStore::new(config))
}

fn report(db: &DbArgs) -> Result<()> {
    let store = open_store(db)?;
    let counts = store.count_by_status().context("Failed to count records")?;
    print_report(store.table_name(), &counts);
    store.close();
    Ok(())
}

fn list_errors(db: &DbArgs, retry_queue: bool) -> Result<()> {
    let store = open_store(db)?;
    let cursor: RecordCursor = if retry_queue {
        store.retry_queue_records()
    } else {
        store.error_records()
    }
    .context("Failed to query records")?;

    let mut count = 0u64;
    for record in cursor {
        let record = record.context("Failed to read record")?;
        println!(
            "{}\t{}\t{}",
            record.source_id,
            record.retry_count,
            record.error_message.as_deref().unwrap_or("")
        );
        count += 1;
    }
    info!(count, "Listed records");
    store.close();
    Ok(())
}

fn drop_table(db: &DbArgs) -> Result<()> {
    let store = open_store(db)?;
    store.delete_database().context("Failed to drop status table")?;
    info!(table = store.table_name(), "Status table dropped");
    store.close();
    Ok(())
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("objsync=debug,warn")
    } else {
        EnvFilter::new("objsync=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
