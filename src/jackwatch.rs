use crate::naming;
use crate::supervise::{pid_alive, send_signal};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const PID_MARKER: &str = ".recording_pid";
const FILE_MARKER: &str = ".recording_file";
const START_MARKER: &str = ".recording_start";

/// Reads the three marker files the jack-watch daemon leaves behind when it
/// autonomously starts a capture: a pid, a target filename, and a unix start
/// time. The daemon's capture process is not the one our session tracks, so
/// this view is folded into status queries independently of the store.
#[derive(Debug, Clone)]
pub struct JackWatch {
    state_dir: PathBuf,
}

impl JackWatch {
    pub fn new(state_dir: PathBuf) -> Self {
        Self { state_dir }
    }

    fn pid_path(&self) -> PathBuf {
        self.state_dir.join(PID_MARKER)
    }

    fn file_path(&self) -> PathBuf {
        self.state_dir.join(FILE_MARKER)
    }

    fn start_path(&self) -> PathBuf {
        self.state_dir.join(START_MARKER)
    }

    /// Is the daemon tracking a live recording? A start marker with a dead
    /// pid means the daemon crashed without cleanup; that desync self-heals
    /// here by deleting all three markers.
    pub fn check(&self) -> Option<SystemTime> {
        let started_at = self.read_start()?;
        let pid = self.read_pid()?;
        if pid_alive(pid) {
            Some(started_at)
        } else {
            tracing::warn!(pid, "jack-daemon markers point at a dead process, cleaning up");
            self.cleanup();
            None
        }
    }

    /// Stops the daemon's capture process, renames its file with the elapsed
    /// duration, and deletes the markers. The markers go unconditionally:
    /// stale markers are worse than a mis-named file.
    pub fn stop_and_rename(&self, settle: Duration) -> bool {
        let pid = self.read_pid();
        let started_at = self.read_start();
        let target = self.read_file();

        let Some(pid) = pid else {
            self.cleanup();
            return false;
        };
        send_signal(pid, libc::SIGTERM);
        thread::sleep(settle);

        if let (Some(target), Some(started_at)) = (target.as_deref(), started_at) {
            rename_with_elapsed(target, started_at);
        }
        self.cleanup();
        true
    }

    /// Removes all three marker files, ignoring ones already gone.
    pub fn cleanup(&self) {
        for path in [self.pid_path(), self.file_path(), self.start_path()] {
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %err, "cannot remove marker");
                }
            }
        }
    }

    fn read_pid(&self) -> Option<i32> {
        let raw = fs::read_to_string(self.pid_path()).ok()?;
        match raw.trim().parse() {
            Ok(pid) => Some(pid),
            Err(err) => {
                tracing::warn!(error = %err, "malformed pid marker");
                None
            }
        }
    }

    fn read_start(&self) -> Option<SystemTime> {
        let raw = fs::read_to_string(self.start_path()).ok()?;
        // The daemon script writes integer epoch seconds; accept fractional too.
        match raw.trim().parse::<f64>() {
            Ok(secs) if secs >= 0.0 => Some(UNIX_EPOCH + Duration::from_secs_f64(secs)),
            _ => {
                tracing::warn!(raw = raw.trim(), "malformed start-time marker");
                None
            }
        }
    }

    fn read_file(&self) -> Option<PathBuf> {
        let raw = fs::read_to_string(self.file_path()).ok()?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(PathBuf::from(trimmed))
        }
    }

    #[cfg(test)]
    pub fn write_markers(&self, pid: i32, target: &Path, started_at: SystemTime) {
        fs::create_dir_all(&self.state_dir).expect("create state dir");
        fs::write(self.pid_path(), format!("{pid}\n")).expect("write pid marker");
        fs::write(self.file_path(), format!("{}\n", target.display())).expect("write file marker");
        let secs = started_at
            .duration_since(UNIX_EPOCH)
            .expect("start after epoch")
            .as_secs();
        fs::write(self.start_path(), format!("{secs}\n")).expect("write start marker");
    }
}

fn rename_with_elapsed(target: &Path, started_at: SystemTime) {
    let elapsed = SystemTime::now()
        .duration_since(started_at)
        .unwrap_or_default()
        .as_secs();
    let Some(renamed) = naming::rename_for_duration(target, elapsed) else {
        return;
    };
    if !target.exists() {
        return;
    }
    if let Err(err) = fs::rename(target, &renamed) {
        tracing::warn!(
            from = %target.display(),
            to = %renamed.display(),
            error = %err,
            "cannot rename jack-daemon recording"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::tempdir;

    #[test]
    fn check_reports_live_recording() {
        let dir = tempdir().expect("tempdir");
        let watch = JackWatch::new(dir.path().to_path_buf());
        let started = SystemTime::now() - Duration::from_secs(10);
        watch.write_markers(std::process::id() as i32, &dir.path().join("x.wav"), started);

        let seen = watch.check().expect("live markers");
        let elapsed = SystemTime::now()
            .duration_since(seen)
            .expect("start in the past")
            .as_secs();
        assert!((9..=11).contains(&elapsed), "elapsed {elapsed}");
    }

    #[test]
    fn check_self_heals_after_daemon_crash() {
        let dir = tempdir().expect("tempdir");
        let watch = JackWatch::new(dir.path().to_path_buf());
        watch.write_markers(2_000_000_000, &dir.path().join("x.wav"), SystemTime::now());

        assert!(watch.check().is_none());
        assert!(!dir.path().join(PID_MARKER).exists());
        assert!(!dir.path().join(FILE_MARKER).exists());
        assert!(!dir.path().join(START_MARKER).exists());
    }

    #[test]
    fn check_ignores_missing_markers() {
        let dir = tempdir().expect("tempdir");
        let watch = JackWatch::new(dir.path().to_path_buf());
        assert!(watch.check().is_none());
    }

    #[test]
    fn stop_and_rename_terminates_and_renames() {
        let dir = tempdir().expect("tempdir");
        let watch = JackWatch::new(dir.path().to_path_buf());
        let target = dir.path().join("recording_20240101_120000.wav");
        fs::write(&target, b"riff").expect("write wav");

        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        let started = SystemTime::now() - Duration::from_secs(65);
        watch.write_markers(child.id() as i32, &target, started);

        assert!(watch.stop_and_rename(Duration::from_millis(50)));
        let _ = child.wait();

        assert!(!target.exists());
        // The settle delay can tip the elapsed count over by one second.
        let renamed_05 = dir.path().join("recording_20240101_120000_01m05s.wav");
        let renamed_06 = dir.path().join("recording_20240101_120000_01m06s.wav");
        assert!(
            renamed_05.exists() || renamed_06.exists(),
            "expected a duration-suffixed rename"
        );
        assert!(!dir.path().join(PID_MARKER).exists());
    }

    #[test]
    fn stop_without_pid_marker_reports_nothing() {
        let dir = tempdir().expect("tempdir");
        let watch = JackWatch::new(dir.path().to_path_buf());
        assert!(!watch.stop_and_rename(Duration::from_millis(10)));
    }
}
