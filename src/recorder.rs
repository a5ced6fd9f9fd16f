use crate::config::ConfigCache;
use crate::device;
use crate::jackwatch::JackWatch;
use crate::naming;
use crate::state::{Mode, Session, SessionStore, Snapshot, StateReading};
use crate::supervise::{SpawnProbe, Supervisor};
use anyhow::{Context, Result};
use chrono::Local;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::SystemTime;

/// 0.1 GB. Recording onto a full SD card corrupts the WAV header, so starts
/// below this are rejected outright.
pub const MIN_FREE_BYTES: u64 = 100 * 1024 * 1024;

/// How a stop request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The tracked session was terminated.
    Stopped,
    /// No session was tracked, but an orphaned capture process holding the
    /// configured device was found by an OS scan and force-killed.
    Recovered,
    /// Nothing was recording.
    NothingToStop,
}

impl StopOutcome {
    pub fn stopped(self) -> bool {
        !matches!(self, StopOutcome::NothingToStop)
    }
}

/// The public start/stop/status API. Mutations run on the single worker
/// thread; every other thread only reads through the store's snapshot path.
#[derive(Debug)]
pub struct Recorder {
    store: SessionStore,
    supervisor: Supervisor,
    jackwatch: JackWatch,
    config: Arc<ConfigCache>,
    recording_dir: PathBuf,
    min_free_bytes: u64,
    /// Closes the race between "process spawned but store not yet written"
    /// and a second start request. Distinct from the session's own active
    /// flag on purpose.
    start_in_flight: AtomicBool,
}

impl Recorder {
    pub fn new(
        supervisor: Supervisor,
        jackwatch: JackWatch,
        config: Arc<ConfigCache>,
        recording_dir: PathBuf,
    ) -> Result<Self> {
        fs::create_dir_all(&recording_dir)
            .with_context(|| format!("create recording dir {}", recording_dir.display()))?;
        Ok(Self {
            store: SessionStore::new(),
            supervisor,
            jackwatch,
            config,
            recording_dir,
            min_free_bytes: MIN_FREE_BYTES,
            start_in_flight: AtomicBool::new(false),
        })
    }

    pub fn with_min_free_bytes(mut self, min_free_bytes: u64) -> Self {
        self.min_free_bytes = min_free_bytes;
        self
    }

    /// Starts a capture on `device`. Returns false with no side effects when
    /// a session is active, a start is already in flight, disk space is low,
    /// or the capture binary rejects the device.
    pub fn start(&self, device: &str, mode: Mode) -> bool {
        if device.is_empty() {
            tracing::warn!("cannot start recording: no audio device selected");
            return false;
        }
        if self
            .start_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("start already in flight");
            return false;
        }
        let started = self.start_locked(device, mode);
        self.start_in_flight.store(false, Ordering::SeqCst);
        started
    }

    fn start_locked(&self, device: &str, mode: Mode) -> bool {
        if self.store.read_blocking().active {
            tracing::debug!("already recording");
            return false;
        }
        match device::free_space_bytes(&self.recording_dir) {
            Ok(free) if free < self.min_free_bytes => {
                tracing::warn!(free, min = self.min_free_bytes, "insufficient disk space");
                return false;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "cannot check disk space, refusing to record");
                return false;
            }
        }

        let target = self
            .recording_dir
            .join(naming::timestamped_filename(Local::now()));
        let mut child = match self.supervisor.spawn_capture(device, &target) {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(device, error = %err, "failed to spawn capture process");
                return false;
            }
        };

        match self.supervisor.probe_capture(&mut child) {
            SpawnProbe::Running => {}
            SpawnProbe::Exited { busy: true, .. } => {
                // One recovery cycle: reap whatever is holding the device,
                // then retry the spawn exactly once.
                let _ = child.wait();
                tracing::info!(device, "device busy, force-reaping and retrying once");
                self.supervisor.kill_conflicting(device);
                child = match self.supervisor.spawn_capture(device, &target) {
                    Ok(child) => child,
                    Err(err) => {
                        tracing::error!(device, error = %err, "retry spawn failed");
                        return false;
                    }
                };
                match self.supervisor.probe_capture(&mut child) {
                    SpawnProbe::Running => {}
                    SpawnProbe::Exited { detail, .. } => {
                        let _ = child.wait();
                        tracing::error!(device, detail = %detail, "device still unavailable after retry");
                        return false;
                    }
                }
            }
            SpawnProbe::Exited { detail, .. } => {
                let _ = child.wait();
                tracing::error!(device, detail = %detail, "capture process rejected device");
                return false;
            }
        }

        let session = Session {
            mode,
            started_at: SystemTime::now(),
            target_file: target,
            process: child,
        };
        match self.store.begin(session) {
            Ok(()) => {
                tracing::info!(device, %mode, "recording started");
                true
            }
            Err(session) => {
                // The in-flight flag should make this unreachable; reap the
                // fresh process rather than leak it if it ever happens.
                tracing::warn!("lost start race with an existing session");
                self.supervisor.terminate_child(session.process, "capture");
                false
            }
        }
    }

    /// Stops the current capture. Idempotent and non-throwing: signal
    /// failures are logged, and the session is always left idle.
    pub fn stop(&self) -> StopOutcome {
        let Some(session) = self.store.take() else {
            return self.stop_untracked();
        };
        let Session {
            mode,
            started_at,
            target_file,
            process,
        } = session;

        // A jack-initiated capture is the daemon's process, not ours; settle
        // it first so its file gets renamed and its markers cleared.
        if mode == Mode::Auto && self.jackwatch.check().is_some() {
            self.jackwatch
                .stop_and_rename(self.supervisor.settings().kill_confirm);
        }

        self.supervisor.terminate_child(process, "capture");

        let elapsed = SystemTime::now()
            .duration_since(started_at)
            .unwrap_or_default()
            .as_secs();
        if target_file.exists() {
            match naming::rename_for_duration(&target_file, elapsed) {
                Some(renamed) => {
                    if let Err(err) = fs::rename(&target_file, &renamed) {
                        tracing::warn!(
                            file = %target_file.display(),
                            error = %err,
                            "cannot rename recording, leaving original name"
                        );
                    } else {
                        tracing::info!(file = %renamed.display(), elapsed, "recording stopped");
                    }
                }
                None => {
                    tracing::warn!(file = %target_file.display(), "unrenameable recording path");
                }
            }
        }

        // Back-to-back stop/start can race the kernel's device release.
        thread::sleep(self.supervisor.settings().device_release_delay);
        StopOutcome::Stopped
    }

    /// Recovery path for an externally desynced state: we track nothing, but
    /// a capture process may still hold the configured device.
    fn stop_untracked(&self) -> StopOutcome {
        let device = self.config.load().audio_device;
        if device.is_empty() {
            tracing::debug!("nothing to stop");
            return StopOutcome::NothingToStop;
        }
        let killed = self.supervisor.kill_conflicting(&device);
        if killed > 0 {
            tracing::warn!(killed, device = %device, "recovered orphaned capture process via scan");
            StopOutcome::Recovered
        } else {
            tracing::debug!("nothing to stop");
            StopOutcome::NothingToStop
        }
    }

    /// Display line and elapsed seconds. A live jack-daemon recording wins
    /// over the session unless a manual session is active; an idle session
    /// with live markers still reports the daemon's capture, since the
    /// daemon starts recording without us ever calling `start`.
    pub fn status(&self) -> (String, u64) {
        let snapshot = self.store.read().snapshot();
        if let Some(daemon_start) = self.jackwatch.check() {
            let manual_active = snapshot.active && snapshot.mode == Some(Mode::Manual);
            if !manual_active {
                let elapsed = elapsed_secs(daemon_start);
                return (format_status(Mode::Auto, elapsed), elapsed);
            }
        }
        if snapshot.active {
            let elapsed = snapshot.started_at.map(elapsed_secs).unwrap_or(0);
            let mode = snapshot.mode.unwrap_or(Mode::Manual);
            return (format_status(mode, elapsed), elapsed);
        }
        ("Not Recording".to_string(), 0)
    }

    /// Session snapshot. The render loop must pass `blocking = false`; the
    /// worker and monitor may block for the authoritative view.
    pub fn read_state(&self, blocking: bool) -> Snapshot {
        if blocking {
            self.store.read_blocking()
        } else {
            self.store.read().snapshot()
        }
    }

    /// Non-blocking read with its source tag, for callers that care whether
    /// they got the live state or the bounded-staleness cache.
    pub fn read_state_tagged(&self) -> StateReading {
        self.store.read()
    }

    pub fn start_jack_daemon(&self, device: &str) -> bool {
        self.supervisor.start_jack_daemon(device)
    }

    pub fn stop_jack_daemon(&self) -> bool {
        self.supervisor.stop_jack_daemon()
    }

    pub fn jack_daemon_running(&self) -> bool {
        self.supervisor.jack_daemon_running()
    }

    pub fn capture_bin(&self) -> &str {
        &self.supervisor.settings().capture_bin
    }
}

fn elapsed_secs(since: SystemTime) -> u64 {
    SystemTime::now()
        .duration_since(since)
        .unwrap_or_default()
        .as_secs()
}

fn format_status(mode: Mode, elapsed: u64) -> String {
    format!("{}: {:02}:{:02}", mode.label(), elapsed / 60, elapsed % 60)
}
