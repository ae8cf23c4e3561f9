use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod actuator;
mod autopilot;
mod camera;
mod command;
mod config;
mod control;
mod input;
mod mixer;
mod recording;
mod session;

use autopilot::{Autopilot, ProcessPredictor};
use camera::Roi;
use command::{CommandTable, KeyMap};
use config::AppConfig;
use control::{ControlLoop, Hardware, LoopOptions};
use input::{InputSource, KeyChannel, ScriptedInput};
use recording::SessionFolders;

#[derive(Parser, Debug)]
#[command(name = "rover_pilot", version, about = "Drive a differential-drive rover, record training data, replay a model")]
struct Cli {
    /// Config file (TOML). Defaults to the built-in config.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Drive from the keyboard (one line of key names per tick on stdin) and record sessions
    Collect {
        /// Read keys from a script file instead of stdin
        #[arg(long)]
        script: Option<PathBuf>,
    },
    /// Drive from a trained model
    Autopilot {
        /// Stop after this many ticks
        #[arg(long)]
        max_ticks: Option<u64>,
        /// Ignore stdin; only an interrupt or --max-ticks ends the run
        #[arg(long)]
        headless: bool,
    },
}

fn open_hardware(config: &AppConfig) -> Result<(Hardware, Option<Roi>)> {
    let roi = config.camera.roi.map(Roi::from_array).transpose().context("invalid camera roi")?;
    let actuator = actuator::open_actuator(&config.actuator)?;
    let camera = camera::open_camera(&config.camera, &config.storage.image_extension)?;
    Ok((Hardware::new(actuator, camera), roi))
}

fn stdin_keys(keys: KeyMap) -> Box<dyn InputSource> {
    let (channel, tx) = KeyChannel::new(keys);
    input::spawn_stdin_reader(tx);
    Box::new(channel)
}

async fn run_collect(config: AppConfig, script: Option<PathBuf>, shutdown: Arc<AtomicBool>) -> Result<()> {
    let keys = KeyMap::new(config.keys.clone());
    let input: Box<dyn InputSource> = match script {
        Some(path) => Box::new(ScriptedInput::load(keys, &path)?),
        None => stdin_keys(keys),
    };
    let folders = SessionFolders::new(&config.storage.data_dir)?;
    let (hardware, roi) = open_hardware(&config)?;
    let options = LoopOptions {
        roi,
        write_summary: config.storage.write_summary,
        min_tick: Duration::from_millis(config.control.min_tick_ms),
    };
    let table = CommandTable::new(&config.drive, config.control.cruise);
    let mut control = ControlLoop::new(input, hardware, table, folders, options, shutdown);

    info!("collecting into {}", config.storage.data_dir.display());
    let summary = tokio::task::spawn_blocking(move || control.run()).await??;
    info!(
        "control loop finished after {} ticks, {} sessions saved{}",
        summary.ticks,
        summary.sessions.len(),
        if summary.interrupted { " (interrupted)" } else { "" }
    );
    Ok(())
}

async fn run_autopilot(
    config: AppConfig,
    max_ticks: Option<u64>,
    headless: bool,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let pilot_cfg = config.autopilot.clone().context("config has no [autopilot] section")?;
    let predictor = ProcessPredictor::spawn(&pilot_cfg.command)?;
    let (hardware, roi) = open_hardware(&config)?;
    let input = if headless { None } else { Some(stdin_keys(KeyMap::new(config.keys.clone()))) };
    let mut pilot = Autopilot::new(Box::new(predictor), hardware, input, pilot_cfg.frame_path, roi, shutdown);

    let ticks = tokio::task::spawn_blocking(move || pilot.run(max_ticks)).await??;
    info!("autopilot finished after {} ticks", ticks);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!("Starting rover_pilot");

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load_default()?,
    };

    // Interrupts are only observed at tick boundaries.
    let shutdown = Arc::new(AtomicBool::new(false));
    let signal_handle = {
        let flag = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping at the next tick");
                flag.store(true, Ordering::Release);
            }
        })
    };

    let result = match cli.mode {
        Mode::Collect { script } => run_collect(config, script, shutdown).await,
        Mode::Autopilot { max_ticks, headless } => run_autopilot(config, max_ticks, headless, shutdown).await,
    };

    signal_handle.abort();
    result
}
