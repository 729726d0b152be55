use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use vidpair_pipeline::config::{Config, ExportFormat};
use vidpair_pipeline::ingest::default_audio_ref;
use vidpair_pipeline::storage::{MemoryStore, Store};
use vidpair_pipeline::vidpair_core::{SystemClock, Video, VideoState};
use vidpair_pipeline::Pipeline;

fn cli() -> Command {
    Command::new("vidpair")
        .version("0.1.0")
        .author("TigreRoll")
        .about("Operator tool for the chunk processing and review pipeline")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (defaults to the standard search path)")
                .global(true),
        )
        .arg(
            Arg::new("store")
                .short('s')
                .long("store")
                .value_name("FILE")
                .help("Store snapshot file, overrides storage.snapshot_path")
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            Command::new("ingest")
                .about("Register a video and plan its overlapping chunks")
                .arg(Arg::new("video").long("video").value_name("ID").required(true))
                .arg(
                    Arg::new("duration")
                        .long("duration")
                        .value_name("SECONDS")
                        .required(true)
                        .value_parser(clap::value_parser!(f64)),
                )
                .arg(Arg::new("title").long("title").value_name("TITLE"))
                .arg(
                    Arg::new("audio-dir")
                        .long("audio-dir")
                        .value_name("DIR")
                        .help("Where the extracted chunk audio lives")
                        .default_value("./audio"),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Show videos, chunk states and the job queue")
                .arg(Arg::new("video").long("video").value_name("ID")),
        )
        .subcommand(Command::new("sweep").about("Reclaim expired leases and review locks once"))
        .subcommand(
            Command::new("export")
                .about("Merge a finished video and write its manifest")
                .arg(Arg::new("video").long("video").value_name("ID").required(true))
                .arg(Arg::new("output").short('o').long("output").value_name("DIR"))
                .arg(
                    Arg::new("format")
                        .short('f')
                        .long("format")
                        .value_name("FORMAT")
                        .value_parser(["jsonl", "srt"])
                        .action(clap::ArgAction::Append),
                ),
        )
        .subcommand(Command::new("alerts").about("List open operator alerts"))
        .subcommand(
            Command::new("retry")
                .about("Release an escalated chunk back to the job queue")
                .arg(Arg::new("chunk").long("chunk").value_name("UUID").required(true))
                .arg(
                    Arg::new("operator")
                        .long("operator")
                        .value_name("NAME")
                        .default_value("operator"),
                ),
        )
        .subcommand(
            Command::new("audit")
                .about("Print the audit trail, optionally for one entity")
                .arg(Arg::new("entity").long("entity").value_name("ID")),
        )
        .subcommand(
            Command::new("config")
                .about("Show, validate or write the configuration")
                .arg(
                    Arg::new("save")
                        .long("save")
                        .value_name("FILE")
                        .help("Write the effective configuration as TOML"),
                ),
        )
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a String> {
    matches
        .get_one::<String>(name)
        .ok_or_else(|| anyhow!("missing required argument --{}", name))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config = match matches.get_one::<String>("config") {
        Some(path) => Config::load_from(&PathBuf::from(path))?,
        None => Config::load().unwrap_or_else(|e| {
            eprintln!("Failed to load config, using defaults: {}", e);
            Config::default()
        }),
    };

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
            .with_env_filter(tracing_subscriber::EnvFilter::new(&config.output.log_level))
            .init();
    }

    config.validate().context("invalid configuration")?;

    let snapshot_path = matches
        .get_one::<String>("store")
        .map(PathBuf::from)
        .unwrap_or_else(|| config.storage.snapshot_path.clone());
    // Inspection commands read the snapshot without taking the process lock
    let read_only = matches!(
        matches.subcommand_name(),
        Some("status") | Some("alerts") | Some("audit") | Some("config")
    );
    let store = if read_only {
        MemoryStore::open_read_only(snapshot_path.clone()).await
    } else {
        MemoryStore::open(snapshot_path.clone()).await
    }
    .with_context(|| format!("failed to open store {}", snapshot_path.display()))?;
    let store = Arc::new(store);
    let pipeline = Pipeline::new(store.clone(), Arc::new(SystemClock), &config);

    let mut dirty = false;
    if !read_only {
        let added = pipeline
            .scheduler
            .credentials()
            .register(&config.credentials.keys, chrono::Utc::now())
            .await?;
        dirty = added > 0;
    }

    match matches.subcommand() {
        Some(("ingest", sub)) => {
            let video_id = required(sub, "video")?;
            let duration = *sub
                .get_one::<f64>("duration")
                .ok_or_else(|| anyhow!("missing required argument --duration"))?;
            let audio_dir = required(sub, "audio-dir")?;

            let mut video = Video::new(video_id.as_str(), duration, chrono::Utc::now());
            if let Some(title) = sub.get_one::<String>("title") {
                video = video.with_title(title.as_str());
            }

            let windows = pipeline.ingestor.plan(duration)?;
            let chunks = pipeline
                .ingestor
                .register_video(video, &windows, |w| default_audio_ref(audio_dir, video_id, w))
                .await?;
            for chunk in &chunks {
                info!(
                    "   #{:03} {:>9.2}s .. {:>9.2}s  {}",
                    chunk.index, chunk.start_secs, chunk.end_secs, chunk.audio_ref
                );
            }
            dirty = true;
        }
        Some(("status", sub)) => {
            let videos = match sub.get_one::<String>("video") {
                Some(id) => vec![store
                    .get_video(id)
                    .await?
                    .ok_or_else(|| anyhow!("unknown video {}", id))?],
                None => store.list_videos().await?,
            };

            for video in videos {
                let chunks = store.chunks_for_video(&video.id).await?;
                let states: Vec<_> = chunks.iter().map(|c| c.state).collect();
                info!(
                    "🎬 {} ({:.1}s, {} chunks): {}",
                    video.title.as_deref().unwrap_or(&video.id),
                    video.duration_secs,
                    chunks.len(),
                    VideoState::derive(&states)
                );
                for chunk in &chunks {
                    let mut flags = Vec::new();
                    if chunk.needs_rereview {
                        flags.push("re-review");
                    }
                    if chunk.needs_manual_intervention {
                        flags.push("manual");
                    }
                    info!(
                        "   #{:03} {:<12} v{:<3} {:>3}% {}{}",
                        chunk.index,
                        chunk.state.to_string(),
                        chunk.sync_version,
                        chunk.state.progress_percentage(),
                        chunk
                            .lock
                            .as_ref()
                            .map(|l| format!("locked by {} until {} ", l.holder, l.expires_at))
                            .unwrap_or_default(),
                        flags.join(",")
                    );
                }
            }

            let stats = pipeline.scheduler.stats().await?;
            info!(
                "📊 Jobs: {} queued, {} leased, {} completed, {} failed",
                stats.queued, stats.leased, stats.completed, stats.failed
            );
        }
        Some(("sweep", _)) => {
            let report = pipeline.maintenance().run_once().await?;
            info!(
                "🧹 {} lease(s) requeued, {} escalated, {} review lock(s) released",
                report.leases.requeued, report.leases.failed, report.locks_released
            );
            dirty = true;
        }
        Some(("export", sub)) => {
            let video_id = required(sub, "video")?;
            let output_dir = sub
                .get_one::<String>("output")
                .map(PathBuf::from)
                .unwrap_or_else(|| config.output.export_dir.clone());
            let formats: Vec<ExportFormat> = match sub.get_many::<String>("format") {
                Some(values) => values
                    .map(|v| match v.as_str() {
                        "srt" => ExportFormat::Srt,
                        _ => ExportFormat::Jsonl,
                    })
                    .collect(),
                None => config.output.formats.clone(),
            };

            let report = pipeline
                .exporter
                .export_video(video_id, &formats, &output_dir)
                .await
                .with_context(|| format!("export of {} failed", video_id))?;
            for file in &report.files {
                info!("📄 {}", file.display());
            }
        }
        Some(("alerts", _)) => {
            let alerts = pipeline.scheduler.open_alerts().await?;
            if alerts.is_empty() {
                info!("✅ No open alerts");
            }
            for alert in alerts {
                warn!("🚨 {}", alert);
            }
        }
        Some(("retry", sub)) => {
            let chunk_id = Uuid::parse_str(required(sub, "chunk")?).context("invalid chunk id")?;
            let operator = required(sub, "operator")?;
            let resolved = pipeline.scheduler.release_for_retry(chunk_id, operator).await?;
            info!("🔓 Chunk {} released, {} alert(s) resolved", chunk_id, resolved);
            dirty = true;
        }
        Some(("audit", sub)) => {
            let entity = sub.get_one::<String>("entity").map(String::as_str);
            for record in store.audit_log(entity).await? {
                println!("{}", record);
            }
        }
        Some(("config", sub)) => {
            println!("{}", config.summary());
            if let Some(path) = sub.get_one::<String>("save") {
                config.save(path)?;
            }
        }
        _ => unreachable!("clap enforces a subcommand"),
    }

    if dirty {
        store.save().await?;
    }
    Ok(())
}
