//! Autoloc playback runner
//!
//! Replays a JSONL file of picks, amplitudes and origins through the
//! location engine and writes every published origin to a JSONL file.
//!
//! Usage:
//!   autoloc_playback --grid grid.conf --stations inventory.txt \
//!       --input events.jsonl --output origins.jsonl
//!
//! Without `--output` published origins only go to the log.
//!
//! Configuration comes from the optional `--config` JSON file, overridden by
//! `AUTOLOC_*` environment variables (a `.env` file is honoured).

use autoloc::config::Config;
use autoloc::engine::Autoloc3;
use autoloc::playback::{read_events, read_inventory, run_playback, PlaybackEvent};
use autoloc::report::{JsonlOriginWriter, LogSink, ReportSink};
use clap::Parser;
use dotenv::dotenv;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const CHANNEL_BUFFER: usize = 10_000;

#[derive(Parser, Debug)]
#[command(about = "Replay seismic picks through the autoloc location engine")]
struct Args {
    /// JSON engine configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Nucleator grid file (overrides the configured one)
    #[arg(long)]
    grid: Option<PathBuf>,

    /// Station inventory, `NET STA lat lon elevation` per line
    #[arg(long)]
    stations: PathBuf,

    /// Station usage / nucleation distance configuration
    #[arg(long)]
    station_config: Option<PathBuf>,

    /// JSONL event file
    #[arg(long)]
    input: PathBuf,

    /// JSONL file receiving published origins
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_json_file(path)?.with_env_overrides(),
        None => Config::from_env(),
    };
    if let Some(grid) = &args.grid {
        config.grid_file = Some(grid.to_string_lossy().to_string());
    }
    if let Some(sc) = &args.station_config {
        config.station_config_file = Some(sc.to_string_lossy().to_string());
    }

    info!("🚀 Autoloc playback");
    info!("   ├─ Input: {}", args.input.display());
    info!("   ├─ Stations: {}", args.stations.display());
    match &args.output {
        Some(path) => info!("   ├─ Output: {}", path.display()),
        None => info!("   ├─ Output: log only"),
    }
    info!("   └─ Playback mode: {}", config.playback);

    let sink: Box<dyn ReportSink> = match &args.output {
        Some(path) => Box::new(JsonlOriginWriter::new(path, config.report_all_phases)?),
        None => Box::new(LogSink::new()),
    };
    info!("📤 Report sink: {}", sink.sink_type());
    let wakeup = config.wakeup_interval;
    let mut engine = Autoloc3::new(config, sink);
    engine.init()?;

    let stations = read_inventory(&args.stations)?;
    let registered = engine.set_stations(stations);
    info!("✅ {} stations registered", registered);

    let engine = Arc::new(Mutex::new(engine));
    let (tx, rx) = mpsc::channel::<PlaybackEvent>(CHANNEL_BUFFER);

    let input = args.input.clone();
    let reader = tokio::spawn(async move {
        match read_events(&input, tx).await {
            Ok(n) => info!("📥 Read {} events from {}", n, input.display()),
            Err(e) => error!("❌ Failed to read {}: {}", input.display(), e),
        }
    });

    let runner = tokio::spawn(run_playback(rx, engine.clone(), wakeup));

    tokio::select! {
        stats = runner => {
            match stats {
                Ok(stats) => info!("✅ Playback done: {} events, {} accepted", stats.events, stats.accepted),
                Err(e) => error!("❌ Playback task failed: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("⚠️  Interrupted, shutting down");
            reader.abort();
        }
    }

    match engine.lock() {
        Ok(mut guard) => guard.shutdown(),
        Err(poisoned) => poisoned.into_inner().shutdown(),
    }
    Ok(())
}
