use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "picorder", version, about = "Recording core for the picorder appliance")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the recording daemon (worker + auto-record monitor).
    Run(RunArgs),
    /// Print the current recording status line.
    Status,
    /// List usable capture devices.
    Devices,
}

#[derive(Parser, Debug, Clone, Default)]
pub struct RunArgs {
    /// Where finished recordings land (default: ~/recordings).
    #[arg(long)]
    pub recording_dir: Option<PathBuf>,
    /// Where the jack-daemon marker files live (default: ~/.picorder).
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
    /// Override the configured capture device for this run.
    #[arg(long)]
    pub device: Option<String>,
}
