use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

/// Canonical duration suffix: `MMmSSs` under an hour, `HHhMMmSSs` at or above.
pub fn duration_suffix(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours:02}h{minutes:02}m{secs:02}s")
    } else {
        format!("{minutes:02}m{secs:02}s")
    }
}

/// Builds the post-recording name for `path` by inserting `_<suffix>` between
/// the stem and the extension. Returns `None` for a path with no file name;
/// callers leave the file under its original name in that case.
pub fn rename_for_duration(path: &Path, seconds: u64) -> Option<PathBuf> {
    let stem = path.file_stem()?.to_string_lossy();
    let suffix = duration_suffix(seconds);
    let name = match path.extension() {
        Some(ext) => format!("{stem}_{suffix}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{suffix}"),
    };
    Some(path.with_file_name(name))
}

/// `recording_<YYYYMMDD_HHMMSS>.wav`, the name a capture starts under.
pub fn timestamped_filename(now: DateTime<Local>) -> String {
    format!("recording_{}.wav", now.format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn suffix_zero_pads_short_durations() {
        assert_eq!(duration_suffix(0), "00m00s");
        assert_eq!(duration_suffix(7), "00m07s");
        for seconds in 0..60 {
            let suffix = duration_suffix(seconds);
            assert!(suffix.starts_with("00m"), "unexpected suffix {suffix}");
            assert_eq!(suffix.len(), 6);
        }
    }

    #[test]
    fn suffix_switches_to_hours_form() {
        assert_eq!(duration_suffix(3599), "59m59s");
        assert_eq!(duration_suffix(3600), "01h00m00s");
        assert_eq!(duration_suffix(3661), "01h01m01s");
    }

    #[test]
    fn rename_keeps_directory_and_extension() {
        let renamed = rename_for_duration(Path::new("/rec/recording_20240101_120000.wav"), 83)
            .expect("renameable path");
        assert_eq!(
            renamed,
            PathBuf::from("/rec/recording_20240101_120000_01m23s.wav")
        );
    }

    #[test]
    fn rename_without_extension() {
        let renamed = rename_for_duration(Path::new("/rec/raw-take"), 5).expect("renameable path");
        assert_eq!(renamed, PathBuf::from("/rec/raw-take_00m05s"));
    }

    #[test]
    fn rename_rejects_pathless_input() {
        assert!(rename_for_duration(Path::new("/"), 5).is_none());
    }

    #[test]
    fn timestamped_filename_format() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 2).unwrap();
        assert_eq!(timestamped_filename(at), "recording_20240309_140502.wav");
    }
}
