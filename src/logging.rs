//! Console and log-file output for the `audioshelf` binary.
//!
//! Console lines go to stderr so `--json` output on stdout stays parseable.

use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "info";
const DEFAULT_LOG_FILE: &str = "logs/audioshelf.log";

/// `-v` raises the library's level to debug, `-vv` traces everything.
/// Without flags `TRACING_LEVEL` applies, falling back to info.
fn filter_directives(verbose: u8) -> String {
    match verbose {
        0 => env::var("TRACING_LEVEL").unwrap_or_else(|_| DEFAULT_FILTER.to_string()),
        1 => "audioshelf=debug,info".to_string(),
        _ => "trace".to_string(),
    }
}

/// Directory and file name of the log file, relative paths resolved against
/// the working directory.
fn split_log_path(path: &Path) -> (PathBuf, PathBuf) {
    let file = path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("audioshelf.log"));
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    (dir, file)
}

/// Install the global subscriber. Keep the returned guard alive until exit so
/// buffered file output is flushed; it is `None` when the log file could not
/// be opened, in which case only the console is used.
pub fn init_logger(verbose: u8) -> Option<WorkerGuard> {
    let directives = filter_directives(verbose);
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let log_path =
        PathBuf::from(env::var("LOG_FILE_PATH").unwrap_or_else(|_| DEFAULT_LOG_FILE.to_string()));
    let (dir, file) = split_log_path(&log_path);
    let appender = std::fs::create_dir_all(&dir)
        .map_err(|e| e.to_string())
        .and_then(|()| {
            RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix(file.to_string_lossy())
                .build(&dir)
                .map_err(|e| e.to_string())
        });

    let (file_layer, guard, file_error) = match appender {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard), None)
        }
        Err(e) => (None, None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose > 0)
                .without_time()
                .with_ansi(true),
        )
        .with(file_layer)
        .with(filter)
        .init();

    match file_error {
        Some(e) => warn!("Logging to console only, cannot open {}: {}", log_path.display(), e),
        None => debug!("Logging to {} with filter {:?}", log_path.display(), directives),
    }
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_log_path() {
        assert_eq!(
            split_log_path(Path::new("logs/audioshelf.log")),
            (PathBuf::from("logs"), PathBuf::from("audioshelf.log"))
        );
        assert_eq!(
            split_log_path(Path::new("shelf.log")),
            (PathBuf::from("."), PathBuf::from("shelf.log"))
        );
        assert_eq!(
            split_log_path(Path::new("/var/log/")),
            (PathBuf::from("/var"), PathBuf::from("log"))
        );
    }

    #[test]
    fn test_verbose_flags_override_environment() {
        assert_eq!(filter_directives(1), "audioshelf=debug,info");
        assert_eq!(filter_directives(3), "trace");
    }
}
