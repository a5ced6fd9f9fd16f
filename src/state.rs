use std::path::PathBuf;
use std::process::Child;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

/// Who initiated the capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Manual,
    Auto,
}

impl Mode {
    pub fn label(self) -> &'static str {
        match self {
            Mode::Manual => "Manual",
            Mode::Auto => "Auto",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// An in-progress capture. The `Child` is the exclusive owner of the spawned
/// capture process; every path out of a session goes through the supervisor's
/// terminate-or-kill before the handle is dropped.
#[derive(Debug)]
pub struct Session {
    pub mode: Mode,
    pub started_at: SystemTime,
    pub target_file: PathBuf,
    pub process: Child,
}

/// Cloneable projection of the session used to answer reads.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub active: bool,
    pub mode: Option<Mode>,
    pub started_at: Option<SystemTime>,
    pub target_file: Option<PathBuf>,
}

impl Snapshot {
    fn of(session: &Option<Session>) -> Self {
        match session {
            Some(s) => Snapshot {
                active: true,
                mode: Some(s.mode),
                started_at: Some(s.started_at),
                target_file: Some(s.target_file.clone()),
            },
            None => Snapshot::default(),
        }
    }
}

/// How a non-blocking read was answered.
#[derive(Debug, Clone)]
pub enum StateReading {
    /// The primary lock was free; this is the live session state.
    Authoritative(Snapshot),
    /// The lock was held by an in-flight start/stop; this is the last
    /// snapshot taken under the lock, stale by at most that operation.
    Cached(Snapshot),
}

impl StateReading {
    pub fn snapshot(self) -> Snapshot {
        match self {
            StateReading::Authoritative(s) | StateReading::Cached(s) => s,
        }
    }

    pub fn is_authoritative(&self) -> bool {
        matches!(self, StateReading::Authoritative(_))
    }
}

/// Single source of truth for the recording session. One mutex guards the
/// session proper; a shadow snapshot behind a second short-hold mutex answers
/// reads that arrive while a start/stop holds the primary lock. The cache is
/// only ever written inside the primary lock's critical section, so it can
/// never run ahead of the authoritative state.
#[derive(Debug, Default)]
pub struct SessionStore {
    session: Mutex<Option<Session>>,
    cache: Mutex<Snapshot>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn refresh_cache(&self, guard: &Option<Session>) -> Snapshot {
        let snapshot = Snapshot::of(guard);
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = snapshot.clone();
        snapshot
    }

    /// Authoritative read. Waits for any in-flight start/stop; only the
    /// worker and monitor threads may use this.
    pub fn read_blocking(&self) -> Snapshot {
        let guard = self.lock();
        self.refresh_cache(&guard)
    }

    /// Non-blocking read for the render loop: falls back to the cached
    /// snapshot instead of waiting on the primary lock.
    pub fn read(&self) -> StateReading {
        match self.session.try_lock() {
            Ok(guard) => StateReading::Authoritative(self.refresh_cache(&guard)),
            Err(std::sync::TryLockError::WouldBlock) => StateReading::Cached(
                self.cache.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            ),
            Err(std::sync::TryLockError::Poisoned(e)) => {
                StateReading::Authoritative(self.refresh_cache(&e.into_inner()))
            }
        }
    }

    /// Installs a new active session. If one is already present the new
    /// session is handed back so the caller can reap its process; the
    /// coordinator treats that as a lost race.
    pub fn begin(&self, session: Session) -> Result<(), Session> {
        let mut guard = self.lock();
        if guard.is_some() {
            return Err(session);
        }
        *guard = Some(session);
        self.refresh_cache(&guard);
        Ok(())
    }

    /// Removes and returns the active session, leaving the store idle. The
    /// caller terminates the process and renames the file outside the lock.
    pub fn take(&self) -> Option<Session> {
        let mut guard = self.lock();
        let session = guard.take();
        self.refresh_cache(&guard);
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::{Duration, Instant};

    fn spawned_session(mode: Mode) -> Session {
        let process = Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        Session {
            mode,
            started_at: SystemTime::now(),
            target_file: PathBuf::from("/tmp/recording_test.wav"),
            process,
        }
    }

    fn reap(mut session: Session) {
        let _ = session.process.kill();
        let _ = session.process.wait();
    }

    #[test]
    fn begin_take_roundtrip() {
        let store = SessionStore::new();
        assert!(!store.read_blocking().active);

        assert!(store.begin(spawned_session(Mode::Manual)).is_ok());
        let snap = store.read_blocking();
        assert!(snap.active);
        assert_eq!(snap.mode, Some(Mode::Manual));
        assert!(snap.target_file.is_some());

        let session = store.take().expect("active session");
        assert!(!store.read_blocking().active);
        assert!(store.take().is_none());
        reap(session);
    }

    #[test]
    fn begin_rejects_second_session() {
        let store = SessionStore::new();
        assert!(store.begin(spawned_session(Mode::Manual)).is_ok());
        let loser = store
            .begin(spawned_session(Mode::Auto))
            .expect_err("second begin must lose");
        reap(loser);
        // The first session is untouched.
        assert_eq!(store.read_blocking().mode, Some(Mode::Manual));
        reap(store.take().expect("first session"));
    }

    #[test]
    fn nonblocking_read_serves_cache_while_lock_held() {
        let store = SessionStore::new();
        assert!(store.begin(spawned_session(Mode::Auto)).is_ok());
        // Prime the cache, then hold the primary lock as an in-flight stop would.
        store.read_blocking();
        let guard = store.session.lock().expect("primary lock");

        let started = Instant::now();
        let reading = store.read();
        assert!(started.elapsed() < Duration::from_millis(10));
        assert!(!reading.is_authoritative());
        let snap = reading.snapshot();
        assert!(snap.active);
        assert_eq!(snap.mode, Some(Mode::Auto));

        drop(guard);
        assert!(store.read().is_authoritative());
        reap(store.take().expect("session"));
    }
}
