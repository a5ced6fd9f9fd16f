use crate::config::ConfigCache;
use crate::device::DeviceValidator;
use crate::recorder::Recorder;
use crate::state::Mode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Background auto-record monitor: keeps the jack-watch daemon aligned with
/// the `auto_record` setting and tears recording down when the configured
/// device disappears (USB interface yanked mid-session).
#[derive(Debug)]
pub struct Monitor {
    recorder: Arc<Recorder>,
    config: Arc<ConfigCache>,
    validator: Arc<DeviceValidator>,
    /// Poll fast while something is recording...
    recording_interval: Duration,
    /// ...and slower while idle, to keep CPU use down on the Pi.
    idle_interval: Duration,
}

impl Monitor {
    pub fn new(
        recorder: Arc<Recorder>,
        config: Arc<ConfigCache>,
        validator: Arc<DeviceValidator>,
    ) -> Self {
        Self {
            recorder,
            config,
            validator,
            recording_interval: Duration::from_millis(500),
            idle_interval: Duration::from_secs(1),
        }
    }

    pub fn with_intervals(mut self, recording: Duration, idle: Duration) -> Self {
        self.recording_interval = recording;
        self.idle_interval = idle;
        self
    }

    /// One poll cycle. Factored out of the loop so the decision logic is
    /// testable without threads.
    pub fn poll_once(&self) {
        let mut config = self.config.load();
        let snapshot = self.recorder.read_state(true);
        let device_valid =
            !config.audio_device.is_empty() && self.validator.validate(&config.audio_device);

        if !device_valid {
            if config.auto_record {
                tracing::warn!(
                    device = %config.audio_device,
                    "audio device invalid, disabling auto-record"
                );
                config.auto_record = false;
                if let Err(err) = self.config.save(&config) {
                    tracing::warn!(error = %err, "cannot persist auto-record off");
                }
            }
            self.recorder.stop_jack_daemon();
            if snapshot.active {
                tracing::warn!("stopping recording: audio device no longer valid");
                self.recorder.stop();
            }
            return;
        }

        if config.auto_record {
            self.recorder.start_jack_daemon(&config.audio_device);
        } else {
            self.recorder.stop_jack_daemon();
            if snapshot.active && snapshot.mode == Some(Mode::Auto) {
                self.recorder.stop();
            }
        }
    }

    /// Runs the poll loop until `stop` is raised.
    pub fn run(&self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            self.poll_once();
            let interval = if self.recorder.read_state(true).active {
                self.recording_interval
            } else {
                self.idle_interval
            };
            thread::sleep(interval);
        }
    }

    pub fn spawn(self) -> MonitorHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let join = thread::spawn(move || self.run(&stop_flag));
        MonitorHandle { stop, join }
    }
}

#[derive(Debug)]
pub struct MonitorHandle {
    stop: Arc<AtomicBool>,
    join: thread::JoinHandle<()>,
}

impl MonitorHandle {
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.join.join();
    }
}
