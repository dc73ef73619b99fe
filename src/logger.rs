//! Session logging on top of `tracing`.
//!
//! Events go to stderr and, when enabled, to a session file that is
//! **truncated at each launch** so it only ever holds the most recent run.
//!
//! Log location:
//!   Windows:  `%APPDATA%\PaintStack\paintstack.log`
//!   Linux:    `~/.config/paintstack/paintstack.log`
//!   macOS:    `~/Library/Application Support/PaintStack/paintstack.log`
//!
//! The filter comes from `RUST_LOG` when set, else from the configured level.
//! `log_info!` / `log_warn!` / `log_err!` are thin shorthands over the
//! `tracing` macros for call sites that only have a message.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::settings::{self, CoreSettings};

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Returns the path to the current session log file.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        ::tracing::info!("{}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        ::tracing::warn!("{}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_err {
    ($($arg:tt)*) => {
        ::tracing::error!("{}", format_args!($($arg)*))
    };
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
///
/// * Creates (or truncates) the session file when `log_to_file` is set.
/// * Installs a panic hook that records the panic before the default handler.
pub fn init(settings: &CoreSettings) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file = if settings.log_to_file {
        settings::config_dir().and_then(|dir| open_session_file(&dir.join("paintstack.log")))
    } else {
        None
    };

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);
    let file_layer = file.map(|f| fmt::layer().with_ansi(false).with_writer(Mutex::new(f)));

    if tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        return;
    }

    if let Some(path) = log_path() {
        tracing::debug!(path = %path.display(), "session log opened");
    }

    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("PANIC: {info}");
        prev(info);
    }));
}

/// Create the session file with its header. `None` when it cannot be opened;
/// logging to stderr still works.
fn open_session_file(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let mut file = match OpenOptions::new().create(true).write(true).truncate(true).open(path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("[logger] Failed to open log file {}: {e}", path.display());
            return None;
        }
    };
    let _ = writeln!(file, "=== PaintStack session started {} ===", human_timestamp());
    let _ = writeln!(file, "Log file: {}", path.display());
    let _ = writeln!(file);
    let _ = LOG_PATH.set(path.to_path_buf());
    Some(file)
}

fn human_timestamp() -> String {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => format_utc(d.as_secs()),
        Err(_) => "(unknown time)".to_string(),
    }
}

/// `YYYY-MM-DD HH:MM:SS UTC` for seconds since the Unix epoch.
fn format_utc(secs: u64) -> String {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (y, m, d) = civil_from_days(days);
    format!(
        "{y:04}-{m:02}-{d:02} {:02}:{:02}:{:02} UTC",
        rem / 3600,
        rem / 60 % 60,
        rem % 60
    )
}

/// Proleptic Gregorian date for a day count since 1970-01-01.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let y = yoe + era * 400 + i64::from(m <= 2);
    (y, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_file_is_truncated_and_headed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("session.log");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "old session\n").unwrap();

        drop(open_session_file(&path).unwrap());
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("=== PaintStack session started"));
        assert!(!content.contains("old session"));
    }

    #[test]
    fn timestamps_are_calendar_dates() {
        assert_eq!(format_utc(0), "1970-01-01 00:00:00 UTC");
        assert_eq!(format_utc(951_782_400), "2000-02-29 00:00:00 UTC");
        assert_eq!(format_utc(1_700_000_000), "2023-11-14 22:13:20 UTC");
        assert_eq!(format_utc(1_735_689_599), "2024-12-31 23:59:59 UTC");
        assert!(!human_timestamp().contains("unix"));
    }

    #[test]
    fn macros_expand_without_subscriber() {
        crate::log_info!("opened {} layers", 3);
        crate::log_warn!("plain");
        crate::log_err!("{:?}", (1, 2));
    }
}
