//! Common test utilities with tracing setup.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     // ... test code with tracing::info!, tracing::debug!, etc.
//! }
//! ```
//!
//! # Configuration
//!
//! Environment variables:
//! - `RUST_LOG`: Filter directives (e.g., `stamptree=debug,stamptree::tree=trace`)
//! - `STAMPTREE_LOG_DIR`: Log directory (default: `logs/`)
//! - `STAMPTREE_LOG_CONSOLE`: Set to "0" to disable console output

#![allow(dead_code)]

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, Once};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Ensures tracing is only initialized once across all tests.
static INIT: Once = Once::new();

/// Initialize the tracing subscriber with file and console logging.
///
/// Safe to call multiple times - only the first call takes effect.
/// Logs are written to `logs/stamptree.ndjson` in JSON-lines format.
pub fn init_tracing() {
    INIT.call_once(setup_tracing);
}

fn make_filter(default_level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("{default_level}")))
}

/// Thread-safe NDJSON writer: one pretty-normalized JSON object per line.
struct JsonLineWriter {
    file: Mutex<File>,
}

impl JsonLineWriter {
    fn new(path: PathBuf) -> std::io::Result<Self> {
        Ok(Self {
            file: Mutex::new(File::create(path)?),
        })
    }

    fn write_line(&self, compact: &[u8]) -> std::io::Result<usize> {
        // Re-serialize through serde_json so malformed fragments never end
        // up in the log file; fall back to the raw bytes if parsing fails.
        let line = match serde_json::from_slice::<serde_json::Value>(compact) {
            Ok(value) => serde_json::to_string(&value).unwrap_or_default(),
            Err(_) => String::from_utf8_lossy(compact).into_owned(),
        };

        let mut file = self.file.lock().unwrap();
        writeln!(file, "{}", line.trim_end())?;
        Ok(compact.len())
    }
}

impl Write for &JsonLineWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_line(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.lock().unwrap().flush()
    }
}

#[expect(clippy::expect_used)]
fn setup_tracing() {
    let log_dir = env::var("STAMPTREE_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let console_enabled = env::var("STAMPTREE_LOG_CONSOLE").map_or(true, |v| v != "0");

    std::fs::create_dir_all(&log_dir).expect("Failed to create log directory");
    let log_path = PathBuf::from(log_dir).join("stamptree.ndjson");

    // Leaked to get the 'static lifetime the writer closure needs.
    let file_writer: &'static JsonLineWriter = Box::leak(Box::new(
        JsonLineWriter::new(log_path).expect("Failed to create log file"),
    ));

    let console_layer = console_enabled.then(|| {
        tracing_subscriber::fmt::layer()
            .with_thread_ids(true)
            .with_target(true)
            .compact()
            .with_filter(make_filter(Level::INFO))
    });

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(move || file_writer)
        .with_thread_ids(true)
        .with_target(true)
        .json()
        .with_filter(make_filter(Level::INFO));

    // try_init: another harness may have installed a subscriber already.
    let _ = Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init();
}
