use anyhow::{Context, Result};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Empirically tuned delays from the appliance; tests substitute shorter
/// values and stub binaries.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub capture_bin: String,
    pub jack_bin: String,
    /// How long a SIGTERM'd capture process gets before SIGKILL.
    pub terminate_grace: Duration,
    /// How long to wait for SIGKILL to take effect.
    pub kill_confirm: Duration,
    /// Pause between spawn and the immediate-exit probe.
    pub spawn_probe_delay: Duration,
    /// Pause after force-reaping conflicting processes, before a retry.
    pub conflict_release_delay: Duration,
    /// Pause after stop so the kernel releases the device node.
    pub device_release_delay: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            capture_bin: "arecord".to_string(),
            jack_bin: "silentjack".to_string(),
            terminate_grace: Duration::from_secs(2),
            kill_confirm: Duration::from_millis(500),
            spawn_probe_delay: Duration::from_millis(5),
            conflict_release_delay: Duration::from_millis(150),
            device_release_delay: Duration::from_millis(50),
        }
    }
}

/// Outcome of the post-spawn probe. The capture binary rejects a bad or busy
/// device within single-digit milliseconds, so an immediate exit is the only
/// reliable signal of spawn failure.
#[derive(Debug)]
pub enum SpawnProbe {
    Running,
    Exited { busy: bool, detail: String },
}

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);
const JACK_SCRIPT_NAME: &str = "jack_monitor.sh";

/// Starts and stops the external capture process and the jack-watch daemon.
/// Signal failures are logged and swallowed: a failed kill must never leave
/// the UI stuck in a "still recording" state.
#[derive(Debug)]
pub struct Supervisor {
    settings: SupervisorSettings,
    recording_dir: PathBuf,
    state_dir: PathBuf,
    jack: Mutex<Option<Child>>,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings, recording_dir: PathBuf, state_dir: PathBuf) -> Self {
        Self {
            settings,
            recording_dir,
            state_dir,
            jack: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Spawns the capture process with a fixed argument vector. The device
    /// string is passed as a single argv entry, never through a shell.
    pub fn spawn_capture(&self, device: &str, output: &Path) -> Result<Child> {
        Command::new(&self.settings.capture_bin)
            .args(["-D", device, "-f", "cd", "-t", "wav"])
            .arg(output)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn {} for {device}", self.settings.capture_bin))
    }

    /// Sleeps the probe delay, then checks whether the child already exited.
    /// On exit, drains stderr to classify a busy device.
    pub fn probe_capture(&self, child: &mut Child) -> SpawnProbe {
        thread::sleep(self.settings.spawn_probe_delay);
        match child.try_wait() {
            Ok(None) => SpawnProbe::Running,
            Ok(Some(status)) => {
                let mut detail = String::new();
                if let Some(mut stderr) = child.stderr.take() {
                    let _ = stderr.read_to_string(&mut detail);
                }
                let detail = detail.trim().to_string();
                tracing::warn!(%status, detail = %detail, "capture process exited immediately");
                let busy = detail.to_ascii_lowercase().contains("busy");
                SpawnProbe::Exited { busy, detail }
            }
            Err(err) => {
                tracing::warn!(error = %err, "unable to probe capture process");
                SpawnProbe::Running
            }
        }
    }

    /// Polite terminate with bounded grace, then SIGKILL with a bounded
    /// confirm wait. Pipe handles are dropped up front on every path.
    pub fn terminate_child(&self, mut child: Child, label: &str) {
        drop(child.stdout.take());
        drop(child.stderr.take());
        let pid = child.id() as i32;
        send_signal(pid, libc::SIGTERM);
        if wait_with_deadline(&mut child, self.settings.terminate_grace) {
            tracing::debug!(pid, label, "process exited after SIGTERM");
            return;
        }
        tracing::warn!(pid, label, "process ignored SIGTERM, escalating to SIGKILL");
        if let Err(err) = child.kill() {
            tracing::warn!(pid, label, error = %err, "SIGKILL failed");
        }
        if !wait_with_deadline(&mut child, self.settings.kill_confirm) {
            tracing::warn!(pid, label, "process still running after SIGKILL");
        }
    }

    /// Force-reaps every host process that looks like our capture binary
    /// holding the given device. No grace: this path exists to clear a zombie
    /// keeping the device node open. Returns how many were signalled.
    pub fn kill_conflicting(&self, device: &str) -> usize {
        let pids = self.find_conflicting(device);
        for &pid in &pids {
            tracing::warn!(pid, device, "force-killing conflicting capture process");
            send_signal(pid, libc::SIGKILL);
        }
        if !pids.is_empty() {
            thread::sleep(self.settings.conflict_release_delay);
        }
        pids.len()
    }

    /// Scans `/proc/*/cmdline` for capture processes whose argv names both
    /// our capture binary and the exact device argument. The binary may sit
    /// anywhere in argv, not just slot zero: a script invocation shows up as
    /// `["/bin/sh", "/path/arecord", ...]`. Matching the device too matters,
    /// since different devices may legitimately be captured concurrently.
    pub fn find_conflicting(&self, device: &str) -> Vec<i32> {
        let capture_name = basename(&self.settings.capture_bin);
        let own_pid = std::process::id();
        let entries = match fs::read_dir("/proc") {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, "cannot scan process table");
                return Vec::new();
            }
        };
        let mut pids = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Ok(pid) = name.to_string_lossy().parse::<i32>() else {
                continue;
            };
            if pid as u32 == own_pid {
                continue;
            }
            let Ok(raw) = fs::read(entry.path().join("cmdline")) else {
                continue;
            };
            let argv: Vec<String> = raw
                .split(|b| *b == 0)
                .filter(|part| !part.is_empty())
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect();
            let names_binary = argv.iter().any(|arg| basename(arg) == capture_name);
            if names_binary && argv.iter().any(|arg| arg == device) {
                pids.push(pid);
            }
        }
        pids
    }

    /// Starts the jack-watch daemon if it is not already running. Idempotent:
    /// a live handle is left alone, a stale exited handle is replaced.
    pub fn start_jack_daemon(&self, device: &str) -> bool {
        let mut guard = self.jack.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(child) = guard.as_mut() {
            match child.try_wait() {
                Ok(None) => return true,
                Ok(Some(status)) => {
                    tracing::warn!(%status, "jack daemon exited, restarting");
                    *guard = None;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "cannot poll jack daemon, restarting");
                    *guard = None;
                }
            }
        }
        let script = match self.ensure_jack_script(device) {
            Ok(path) => path,
            Err(err) => {
                tracing::error!(error = %err, "cannot write jack monitor script");
                return false;
            }
        };
        match Command::new(&self.settings.jack_bin)
            .args(["-i", device, "-o"])
            .arg(&script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => {
                tracing::info!(device, pid = child.id(), "jack daemon started");
                *guard = Some(child);
                true
            }
            Err(err) => {
                tracing::error!(device, error = %err, "failed to start jack daemon");
                false
            }
        }
    }

    /// Stops the jack-watch daemon. Returns false when it was not running.
    pub fn stop_jack_daemon(&self) -> bool {
        let child = self
            .jack
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match child {
            Some(child) => {
                self.terminate_child(child, "jack daemon");
                true
            }
            None => false,
        }
    }

    pub fn jack_daemon_running(&self) -> bool {
        let mut guard = self.jack.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Materializes the shell script the jack daemon invokes on jack events.
    /// On insertion it launches its own capture process and writes the three
    /// marker files; on removal it stops that process, renames the file with
    /// its duration, and deletes the markers.
    fn ensure_jack_script(&self, device: &str) -> Result<PathBuf> {
        let path = self.state_dir.join(JACK_SCRIPT_NAME);
        if path.exists() {
            return Ok(path);
        }
        fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("create state dir {}", self.state_dir.display()))?;
        let script = format!(
            r#"#!/bin/bash
# Invoked by the jack-watch daemon on jack state changes.
# $1 = "in" (plugged) or "out" (unplugged)

STATE="$1"
DEVICE="{device}"
RECDIR="{recdir}"
STATEDIR="{statedir}"

mkdir -p "$RECDIR"

if [ "$STATE" = "in" ]; then
    TS=$(date +%Y%m%d_%H%M%S)
    FILE="$RECDIR/recording_$TS.wav"
    {capture} -D "$DEVICE" -f cd -t wav "$FILE" &
    echo $! > "$STATEDIR/.recording_pid"
    echo "$FILE" > "$STATEDIR/.recording_file"
    date +%s > "$STATEDIR/.recording_start"
else
    if [ -f "$STATEDIR/.recording_pid" ]; then
        PID=$(cat "$STATEDIR/.recording_pid")
        START=$(cat "$STATEDIR/.recording_start")
        OLD=$(cat "$STATEDIR/.recording_file")
        kill "$PID" 2>/dev/null
        sleep 0.5
        if [ -f "$OLD" ]; then
            DUR=$(( $(date +%s) - START ))
            H=$((DUR / 3600)); M=$(((DUR % 3600) / 60)); S=$((DUR % 60))
            if [ "$H" -gt 0 ]; then
                SUFFIX=$(printf "%02dh%02dm%02ds" "$H" "$M" "$S")
            else
                SUFFIX=$(printf "%02dm%02ds" "$M" "$S")
            fi
            mv "$OLD" "${{OLD%.wav}}_$SUFFIX.wav" 2>/dev/null
        fi
        rm -f "$STATEDIR/.recording_pid" "$STATEDIR/.recording_file" "$STATEDIR/.recording_start"
    fi
fi
"#,
            device = device,
            recdir = self.recording_dir.display(),
            statedir = self.state_dir.display(),
            capture = self.settings.capture_bin,
        );
        fs::write(&path, script)
            .with_context(|| format!("write jack script {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                .with_context(|| format!("chmod jack script {}", path.display()))?;
        }
        Ok(path)
    }
}

/// `kill(pid, 0)` liveness probe: signal failure means the process is gone.
pub fn pid_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

pub fn send_signal(pid: i32, signal: i32) -> bool {
    let ok = unsafe { libc::kill(pid, signal) == 0 };
    if !ok {
        tracing::debug!(pid, signal, "signal not delivered (process already gone?)");
    }
    ok
}

fn wait_with_deadline(child: &mut Child, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(error = %err, "try_wait failed");
                return false;
            }
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(WAIT_POLL_INTERVAL.min(limit));
    }
}

fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .map(|n| n.to_str().unwrap_or(path))
        .unwrap_or(path)
}
