//! Session logger: routes `tracing` output to a single file in the OS data
//! directory.
//!
//! The file is **truncated (overwritten) at each launch**, so it only ever
//! contains output from the most-recent session.
//!
//! Log location:
//!   Windows:  `%APPDATA%\RetouchFE\retouchfe.log`
//!   Linux:    `~/.local/share/RetouchFE/retouchfe.log`
//!   macOS:    `~/Library/Application Support/RetouchFE/retouchfe.log`
//!
//! Filtering honours `RUST_LOG`; without it the level passed to
//! [`init_with_level`] applies. If the file cannot be opened, output goes to
//! stderr instead.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

pub const APP_DIR: &str = "RetouchFE";

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Returns the path to the current session log file.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

/// Initialise the session logger at INFO. Call once before any logging.
pub fn init() {
    init_with_level(Level::INFO);
}

/// * Creates (or truncates) the log file and installs it as the global
///   `tracing` subscriber.
/// * Installs a panic hook that records the panic in the log before
///   propagating to the default handler.
///
/// Calling this when a subscriber is already installed is harmless.
pub fn init_with_level(level: Level) {
    let path = log_file_path();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let file = OpenOptions::new().create(true).write(true).truncate(true).open(&path);

    let installed = match file {
        Ok(f) => {
            let ok = tracing_subscriber::fmt()
                .with_env_filter(env_filter(level))
                .with_ansi(false)
                .with_writer(Mutex::new(f))
                .try_init()
                .is_ok();
            if ok {
                let _ = LOG_PATH.set(path.clone());
            }
            ok
        }
        Err(e) => {
            // Can't open log file, fall back to stderr
            let ok = init_stderr(level);
            if ok {
                error!(path = %path.display(), error = %e, "failed to open log file, logging to stderr");
            }
            ok
        }
    };

    if !installed {
        return;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        log = %path.display(),
        "=== RetouchFE session started ==="
    );

    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!("PANIC: {}", panic_info);
        prev(panic_info);
    }));
}

/// Log to stderr only (headless runs). Returns false if a subscriber was
/// already installed.
pub fn init_stderr(level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
}

fn log_file_path() -> PathBuf {
    data_dir().join(APP_DIR).join("retouchfe.log")
}

/// Platform data directory (without the app sub-folder).
pub fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata);
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library").join("Application Support");
        }
    }
    // Linux / fallback
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    // Last resort: current working directory
    PathBuf::from(".")
}
