use std::path::PathBuf;

use directories::ProjectDirs;
use time::{Duration, OffsetDateTime, UtcOffset, format_description::BorrowedFormatItem, macros::format_description};

const DISPLAY_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "tally")
}

/// Directory holding `config.toml`. `TALLY_CONFIG_DIR` takes precedence.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TALLY_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    project_dirs().map_or_else(|| PathBuf::from("."), |d| d.config_dir().to_path_buf())
}

/// Directory holding the daemon socket and logs. `TALLY_DATA_DIR` takes precedence.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TALLY_DATA_DIR") {
        return PathBuf::from(dir);
    }
    project_dirs().map_or_else(|| PathBuf::from("."), |d| d.data_dir().to_path_buf())
}

/// Format a timestamp in the local offset when it can be determined.
pub fn format_time(t: OffsetDateTime) -> String {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    t.to_offset(offset)
        .format(DISPLAY_FORMAT)
        .unwrap_or_else(|_| t.to_string())
}

/// Render a duration as `1h 02m 03s`, dropping leading zero units.
pub fn format_duration(d: Duration) -> String {
    let total = d.whole_seconds().max(0);
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    match (h, m) {
        (0, 0) => format!("{s}s"),
        (0, _) => format!("{m}m {s:02}s"),
        _ => format!("{h}h {m:02}m {s:02}s"),
    }
}
