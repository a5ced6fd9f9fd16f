use crate::cli::{Cli, Commands, RunArgs};
use crate::config::{ConfigCache, ConfigStore};
use crate::device::DeviceValidator;
use crate::jackwatch::JackWatch;
use crate::logging;
use crate::monitor::Monitor;
use crate::queue::{request_channel, spawn_worker};
use crate::recorder::Recorder;
use crate::supervise::{Supervisor, SupervisorSettings};
use anyhow::{Context, Result};
use clap::Parser;
use directories::BaseDirs;
use std::path::PathBuf;
use std::sync::Arc;

pub fn run() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run_daemon(args),
        Commands::Status => run_status(),
        Commands::Devices => run_devices(),
    }
}

fn run_daemon(args: RunArgs) -> Result<()> {
    tracing::info!("starting picorder recording core");
    let store = ConfigStore::new()?;
    if let Some(ref device) = args.device {
        let mut config = store.load()?;
        config.audio_device = device.clone();
        store.save(&config)?;
    }
    let config = Arc::new(ConfigCache::new(store));

    let (recording_dir, state_dir) = resolve_dirs(&args)?;
    let recorder = build_recorder(config.clone(), recording_dir, state_dir)?;
    let validator = Arc::new(DeviceValidator::new(recorder.capture_bin().to_string()));

    let monitor = Monitor::new(recorder.clone(), config, validator).spawn();
    let (queue, requests) = request_channel();
    let worker = spawn_worker(recorder, requests);

    // The queue handle belongs to the UI layer; holding it here keeps the
    // worker alive for the life of the daemon.
    let _queue = queue;
    tracing::info!("auto-record monitor running; terminate the process to exit");
    worker
        .join()
        .map_err(|_| anyhow::anyhow!("recording worker panicked"))?;
    monitor.shutdown();
    Ok(())
}

fn run_status() -> Result<()> {
    let store = ConfigStore::new()?;
    let config = Arc::new(ConfigCache::new(store));
    let (recording_dir, state_dir) = resolve_dirs(&RunArgs::default())?;
    let recorder = build_recorder(config, recording_dir, state_dir)?;
    let (text, elapsed) = recorder.status();
    println!("{text} ({elapsed}s)");
    Ok(())
}

fn run_devices() -> Result<()> {
    let validator = DeviceValidator::new(SupervisorSettings::default().capture_bin);
    for (id, label) in validator.list_devices() {
        if id.is_empty() {
            println!("(none)\t{label}");
        } else {
            println!("{id}\t{label}");
        }
    }
    Ok(())
}

fn build_recorder(
    config: Arc<ConfigCache>,
    recording_dir: PathBuf,
    state_dir: PathBuf,
) -> Result<Arc<Recorder>> {
    let supervisor = Supervisor::new(
        SupervisorSettings::default(),
        recording_dir.clone(),
        state_dir.clone(),
    );
    let jackwatch = JackWatch::new(state_dir);
    Ok(Arc::new(Recorder::new(
        supervisor,
        jackwatch,
        config,
        recording_dir,
    )?))
}

fn resolve_dirs(args: &RunArgs) -> Result<(PathBuf, PathBuf)> {
    let base = BaseDirs::new().context("unable to resolve home directory")?;
    let recording_dir = args
        .recording_dir
        .clone()
        .unwrap_or_else(|| base.home_dir().join("recordings"));
    let state_dir = args
        .state_dir
        .clone()
        .unwrap_or_else(|| base.home_dir().join(".picorder"));
    Ok((recording_dir, state_dir))
}
