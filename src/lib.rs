pub mod app;
pub mod cli;
pub mod config;
pub mod device;
pub mod jackwatch;
pub mod logging;
pub mod monitor;
pub mod naming;
pub mod queue;
pub mod recorder;
pub mod state;
pub mod supervise;

pub use app::run;
