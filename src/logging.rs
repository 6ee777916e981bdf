//! Logger initialization for workers and tools.
//!
//! Logging goes through the `log` facade. `init_logging` installs an `env_logger` backend
//! once per process; components receive their log prefix (usually the worker id) explicitly
//! and log `key=value` pairs.

use env_logger::Builder;
use log::LevelFilter;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::errors::{EngineError, Result};

#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// One of error, warn, info, debug, trace. `RUST_LOG` still refines this.
    pub level: String,
    /// Write to this file instead of stderr
    pub log_file: Option<PathBuf>,
    /// Prepended to every line, e.g. the worker id
    pub prefix: Option<String>,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_file: None,
            prefix: None,
        }
    }
}

/// Keeps the log target alive and lets the caller flush it at shutdown.
#[derive(Clone)]
pub struct LoggingHandle {
    file: Option<Arc<Mutex<File>>>,
}

impl LoggingHandle {
    pub fn flush(&self) {
        log::logger().flush();
        if let Some(ref file) = self.file
            && let Ok(mut f) = file.lock()
        {
            let _ = f.flush();
        }
    }
}

struct SharedFile(Arc<Mutex<File>>);

impl Write for SharedFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.0.lock() {
            Ok(mut f) => f.write(buf),
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.0.lock() {
            Ok(mut f) => f.flush(),
            Err(_) => Ok(()),
        }
    }
}

/// Install the global logger. Fails if the level is unknown, the log file cannot be
/// created, or a logger is already installed.
pub fn init_logging(options: &LoggingOptions) -> Result<LoggingHandle> {
    let level = LevelFilter::from_str(&options.level)
        .map_err(|_| EngineError::Config(format!("invalid log level: {}", options.level)))?;

    let mut builder = Builder::new();
    builder.filter_level(level);
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }

    let prefix = options.prefix.clone();
    builder.format(move |buf, record| {
        let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        match prefix {
            Some(ref p) => writeln!(buf, "{} {:<5} [{}] {}", ts, record.level(), p, record.args()),
            None => writeln!(buf, "{} {:<5} {}", ts, record.level(), record.args()),
        }
    });

    let file = match options.log_file {
        Some(ref path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)?;
            }
            let file = Arc::new(Mutex::new(File::create(path)?));
            builder.target(env_logger::Target::Pipe(Box::new(SharedFile(Arc::clone(
                &file,
            )))));
            Some(file)
        }
        None => {
            builder.target(env_logger::Target::Stderr);
            None
        }
    };

    builder
        .try_init()
        .map_err(|e| EngineError::Config(format!("failed to initialize logger: {}", e)))?;
    Ok(LoggingHandle { file })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_rejected() {
        let options = LoggingOptions {
            level: "loud".to_string(),
            ..Default::default()
        };
        assert!(matches!(init_logging(&options), Err(EngineError::Config(_))));
    }
}
