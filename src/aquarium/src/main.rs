use anyhow::{Context, Result};
use aquarium::config::ConfigLoader;
use aquarium::constants::WORKING_DIR;
use aquarium::logging::setup_logging;
use aquarium::Engine;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Statistics are logged once per this many ticks
const STATISTICS_EVERY: u64 = 10;

#[tokio::main]
pub async fn main() {
    if let Err(err) = run().await {
        eprintln!("Error running aquarium: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => ConfigLoader::load_from_file(&path)?,
        None => ConfigLoader::load_default_config()?,
    };
    setup_logging(Path::new(WORKING_DIR)).context("Failed to set up logging")?;

    let hz = config.headless_tick_hz.max(1);
    let target_fps = config.target_fps;
    let mut engine = Engine::spawn_background(config);
    for diagnostic in engine.diagnostics() {
        warn!("{diagnostic}");
    }

    let period = Duration::from_secs_f64(1.0 / f64::from(hz));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last = Instant::now();

    info!("running headless at {hz} Hz, press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            _ = interval.tick() => {
                let elapsed = last.elapsed().as_secs_f64();
                last = Instant::now();
                // scale to the target so a steady headless rate reads as full speed
                let fps = if elapsed > 0.0 {
                    (target_fps * period.as_secs_f64() / elapsed).min(target_fps * 2.0)
                } else {
                    target_fps
                };

                let output = engine.tick(elapsed, fps);
                for event in &output.events {
                    info!(kind = %event.kind, pid = event.pid, ppid = ?event.ppid, "lifecycle event");
                }

                if engine.tick_count() % STATISTICS_EVERY == 1 {
                    let stats = serde_json::to_string(&engine.statistics())
                        .context("Failed to serialize statistics")?;
                    info!("statistics: {stats}");
                }
            }
        }
    }

    engine.stop().await;
    Ok(())
}
