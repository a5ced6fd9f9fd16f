use anyhow::{Context, Result};
use std::collections::HashMap;
use std::ffi::CString;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Checks whether an ALSA capture device can actually be opened, by asking
/// the capture binary to dump its hardware params. The probe shells out, so
/// results are cached for a short TTL; the render and monitor paths call this
/// every cycle.
#[derive(Debug)]
pub struct DeviceValidator {
    capture_bin: String,
    probe_timeout: Duration,
    ttl: Duration,
    cache: Mutex<HashMap<String, (bool, Instant)>>,
}

impl DeviceValidator {
    pub fn new(capture_bin: impl Into<String>) -> Self {
        Self::with_timings(capture_bin, Duration::from_secs(2), Duration::from_secs(5))
    }

    pub fn with_timings(
        capture_bin: impl Into<String>,
        probe_timeout: Duration,
        ttl: Duration,
    ) -> Self {
        Self {
            capture_bin: capture_bin.into(),
            probe_timeout,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Cached validity check.
    pub fn validate(&self, device: &str) -> bool {
        if device.is_empty() {
            return false;
        }
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((valid, at)) = cache.get(device) {
                if at.elapsed() < self.ttl {
                    return *valid;
                }
            }
        }
        let valid = self.probe(device);
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device.to_string(), (valid, Instant::now()));
        valid
    }

    /// Uncached probe with a bounded wait; a hung probe is killed and counts
    /// as invalid.
    pub fn probe(&self, device: &str) -> bool {
        if device.is_empty() {
            return false;
        }
        let mut child = match Command::new(&self.capture_bin)
            .args(["-D", device, "--dump-hw-params"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                tracing::debug!(device, error = %err, "cannot spawn device probe");
                return false;
            }
        };

        let deadline = Instant::now() + self.probe_timeout;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() >= deadline => {
                    tracing::debug!(device, "device probe timed out");
                    let _ = child.kill();
                    let _ = child.wait();
                    return false;
                }
                Ok(None) => thread::sleep(Duration::from_millis(20)),
                Err(err) => {
                    tracing::debug!(device, error = %err, "device probe wait failed");
                    let _ = child.kill();
                    let _ = child.wait();
                    return false;
                }
            }
        }

        let mut output = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            let _ = stdout.read_to_string(&mut output);
        }
        if let Some(mut stderr) = child.stderr.take() {
            let _ = stderr.read_to_string(&mut output);
        }
        !(output.contains("Invalid")
            || output.contains("No such")
            || output.to_ascii_lowercase().contains("cannot find"))
    }

    /// Enumerates capture devices via the binary's card listing, keeping only
    /// the ones that pass an uncached probe. The empty id at the front is the
    /// "recording disabled" choice the settings screen offers.
    pub fn list_devices(&self) -> Vec<(String, String)> {
        let mut devices = vec![(String::new(), "None (Disabled)".to_string())];
        let output = match Command::new(&self.capture_bin).arg("-l").output() {
            Ok(out) => String::from_utf8_lossy(&out.stdout).into_owned(),
            Err(err) => {
                tracing::error!(error = %err, "cannot list capture devices");
                return devices;
            }
        };
        for (id, label) in parse_card_listing(&output) {
            if self.probe(&id) {
                devices.push((id, label));
            }
        }
        devices
    }
}

/// Pulls `(plughw:<card>,0, label)` pairs out of an `arecord -l` listing.
pub fn parse_card_listing(output: &str) -> Vec<(String, String)> {
    let mut devices = Vec::new();
    for line in output.lines() {
        if !line.to_ascii_lowercase().contains("card") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(pos) = parts.iter().position(|p| *p == "card") else {
            continue;
        };
        let Some(card_num) = parts.get(pos + 1).map(|p| p.trim_end_matches(':')) else {
            continue;
        };
        if card_num.parse::<u32>().is_err() {
            continue;
        }
        devices.push((format!("plughw:{card_num},0"), parts[pos..].join(" ")));
    }
    devices
}

/// Free bytes available to unprivileged writers at `path`.
pub fn free_space_bytes(path: &Path) -> Result<u64> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("path not representable: {}", path.display()))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("statvfs {}", path.display()));
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    const CARD_LISTING: &str = "\
**** List of CAPTURE Hardware Devices ****
card 1: Device [USB Audio Device], device 0: USB Audio [USB Audio]
  Subdevices: 1/1
  Subdevice #0: subdevice #0
card 2: CODEC [USB AUDIO CODEC], device 0: USB Audio [USB Audio]
";

    #[test]
    fn parses_card_lines_into_plughw_ids() {
        let devices = parse_card_listing(CARD_LISTING);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].0, "plughw:1,0");
        assert!(devices[0].1.starts_with("card 1: Device"));
        assert_eq!(devices[1].0, "plughw:2,0");
    }

    #[test]
    fn parse_ignores_noise_and_non_numeric_cards() {
        assert!(parse_card_listing("no capture devices found\n").is_empty());
        assert!(parse_card_listing("card x: broken\n").is_empty());
    }

    #[test]
    fn validate_caches_probe_results() {
        let dir = tempdir().expect("tempdir");
        let counter = dir.path().join("count");
        let stub = dir.path().join("arecord");
        fs::write(
            &stub,
            format!(
                "#!/bin/sh\necho probe >> {}\necho 'FORMAT: S16_LE'\n",
                counter.display()
            ),
        )
        .expect("write stub");
        fs::set_permissions(&stub, fs::Permissions::from_mode(0o755)).expect("chmod stub");

        let validator = DeviceValidator::new(stub.to_string_lossy().into_owned());
        assert!(validator.validate("plughw:1,0"));
        assert!(validator.validate("plughw:1,0"));
        let probes = fs::read_to_string(&counter).expect("counter file");
        assert_eq!(probes.lines().count(), 1, "second call must hit the cache");
    }

    #[test]
    fn probe_rejects_invalid_device_output() {
        let dir = tempdir().expect("tempdir");
        let stub = dir.path().join("arecord");
        fs::write(&stub, "#!/bin/sh\necho 'No such device' >&2\nexit 1\n").expect("write stub");
        fs::set_permissions(&stub, fs::Permissions::from_mode(0o755)).expect("chmod stub");

        let validator = DeviceValidator::new(stub.to_string_lossy().into_owned());
        assert!(!validator.probe("plughw:7,0"));
    }

    #[test]
    fn empty_device_is_never_valid() {
        let validator = DeviceValidator::new("arecord");
        assert!(!validator.validate(""));
    }

    #[test]
    fn free_space_reports_nonzero_for_tempdir() {
        let dir = tempdir().expect("tempdir");
        let free = free_space_bytes(dir.path()).expect("statvfs");
        assert!(free > 0);
    }
}
