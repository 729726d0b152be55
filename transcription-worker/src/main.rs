use anyhow::{Context, Result};
use clap::{Arg, Command};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use transcription_worker::{ReplayTranscriber, TranscriptionWorker, WorkerConfig, WorkerMode};
use vidpair_pipeline::storage::MemoryStore;
use vidpair_pipeline::vidpair_core::SystemClock;
use vidpair_pipeline::{Config, Pipeline};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("vidpair-transcription-worker")
        .version("0.1.0")
        .author("TigreRoll")
        .about("Transcription worker that leases chunk jobs from the vidpair scheduler")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .help("Configuration file (defaults to the standard search path)"),
        )
        .arg(
            Arg::new("store")
                .long("store")
                .short('s')
                .value_name("FILE")
                .help("Store snapshot file, overrides storage.snapshot_path"),
        )
        .arg(
            Arg::new("batch-size")
                .long("batch-size")
                .short('b')
                .value_name("SIZE")
                .help("Number of jobs to take in batch mode")
                .default_value("10")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("mode")
                .long("mode")
                .short('m')
                .value_name("MODE")
                .help("Processing mode: batch or continuous")
                .default_value("batch")
                .value_parser(["batch", "continuous"]),
        )
        .arg(
            Arg::new("worker-name")
                .long("worker-name")
                .value_name("NAME")
                .help("Name for this worker instance")
                .default_value("transcription-worker-1"),
        )
        .arg(
            Arg::new("concurrency")
                .long("concurrency")
                .short('j')
                .value_name("TASKS")
                .help("Concurrent transcription tasks (defaults to the CPU count)")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help("Show what would be processed without actually processing")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("poll-interval")
                .long("poll-interval")
                .value_name("SECONDS")
                .help("Idle wait between polls in continuous mode")
                .default_value("60")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    // Configure logging based on verbose flag
    if matches.get_flag("verbose") {
        tracing_subscriber::fmt()
            .with_target(true)
            .with_thread_ids(true)
            .with_env_filter("debug")
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_env_filter("info")
            .init();
    }

    let config = match matches.get_one::<String>("config") {
        Some(path) => Config::load_from(&PathBuf::from(path))?,
        None => Config::load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Config::default()
        }),
    };
    config.validate().context("invalid configuration")?;

    let batch_size = matches.get_one::<usize>("batch-size").copied().unwrap_or(10);
    let mode = match matches.get_one::<String>("mode").map(String::as_str) {
        Some("continuous") => WorkerMode::Continuous,
        _ => WorkerMode::Batch,
    };
    let worker_name = matches
        .get_one::<String>("worker-name")
        .cloned()
        .unwrap_or_else(|| "transcription-worker-1".to_string());
    let concurrency = matches
        .get_one::<usize>("concurrency")
        .copied()
        .unwrap_or_else(num_cpus::get);
    let poll_interval = matches.get_one::<u64>("poll-interval").copied().unwrap_or(60);
    let dry_run = matches.get_flag("dry-run");

    let snapshot_path = matches
        .get_one::<String>("store")
        .map(PathBuf::from)
        .unwrap_or_else(|| config.storage.snapshot_path.clone());
    let store = Arc::new(
        MemoryStore::open(snapshot_path.clone())
            .await
            .with_context(|| format!("failed to open store {}", snapshot_path.display()))?,
    );
    let pipeline = Pipeline::new(store.clone(), Arc::new(SystemClock), &config);
    pipeline
        .scheduler
        .credentials()
        .register(&config.credentials.keys, chrono::Utc::now())
        .await?;

    let worker_config = WorkerConfig::default()
        .with_batch_size(batch_size)
        .with_mode(mode)
        .with_worker_name(worker_name)
        .with_concurrency(concurrency)
        .with_dry_run(dry_run)
        .with_poll_interval(poll_interval);

    tracing::info!("🚀 vidpair Transcription Worker Starting");
    tracing::info!("💾 Store: {}", snapshot_path.display());
    tracing::info!("📊 Batch Size: {}", batch_size);
    tracing::info!("🔄 Mode: {:?}", mode);
    tracing::info!("🧵 Tasks: {}", worker_config.concurrency());
    tracing::info!("🧪 Dry Run: {}", if dry_run { "enabled" } else { "disabled" });
    if mode == WorkerMode::Continuous {
        tracing::info!("⏱️  Poll Interval: {} seconds", poll_interval);
    }

    let worker = TranscriptionWorker::new(
        worker_config,
        pipeline.scheduler.clone(),
        store.clone(),
        Arc::new(ReplayTranscriber::default()),
    );

    let pending = worker.scan_for_work().await?;
    if pending.is_empty() && mode == WorkerMode::Batch {
        tracing::info!("✅ No chunks need transcription");
        return Ok(());
    }
    tracing::info!("📹 Found {} chunk(s) waiting for transcription", pending.len());

    let shutdown = CancellationToken::new();
    let ctrl_c = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("🛑 Shutdown requested");
                shutdown.cancel();
            }
        })
    };

    let sweeper = (mode == WorkerMode::Continuous).then(|| {
        pipeline
            .maintenance()
            .spawn(config.scheduler.sweep_interval(), shutdown.clone())
    });

    let result = worker.run(shutdown.clone()).await;
    shutdown.cancel();
    ctrl_c.abort();
    if let Some(handle) = sweeper {
        let _ = handle.await;
    }
    store.save().await?;

    let stats = result?;
    tracing::info!("✅ Processing complete!");
    tracing::info!("📊 Chunks processed: {}", stats.chunks_processed);
    tracing::info!("🔁 Chunks requeued: {}", stats.chunks_requeued);
    tracing::info!("❌ Chunks failed: {}", stats.chunks_failed);
    tracing::info!("⏱️  Total time: {:.2}s", stats.total_processing_time_secs);

    if stats.chunks_failed > 0 {
        tracing::warn!("⚠️  Some chunks need manual intervention. Run `vidpair alerts` for details.");
        std::process::exit(1);
    }

    Ok(())
}
