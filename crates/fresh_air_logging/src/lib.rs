//! Logging setup for Fresh Air pipelines.
//!
//! Installs a `tracing` subscriber that writes to stderr and to a
//! size-rotated file under `~/.fresh_air/logs` (or `$FRESH_AIR_HOME/logs`).

use anyhow::{anyhow, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const HOME_ENV: &str = "FRESH_AIR_HOME";
const DEFAULT_LOG_FILTER: &str = "fresh_air_storage=info";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging options for one process.
#[derive(Debug, Clone)]
pub struct LogConfig<'a> {
    /// Base name of the log file (`<app_name>.log`)
    pub app_name: &'a str,
    /// Console shows everything the file gets; otherwise warnings only
    pub verbose: bool,
    /// Write logs here instead of the home logs directory
    pub log_dir: Option<PathBuf>,
}

impl<'a> LogConfig<'a> {
    pub fn new(app_name: &'a str) -> Self {
        Self {
            app_name,
            verbose: true,
            log_dir: None,
        }
    }

    pub fn quiet(mut self) -> Self {
        self.verbose = false;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }
}

/// Install the global subscriber. Fails if one is already set.
///
/// `RUST_LOG` overrides the default filter (`fresh_air_storage=info`).
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = match &config.log_dir {
        Some(dir) => dir.clone(),
        None => ensure_logs_dir()?,
    };
    let file_writer = RollingWriter::open(&log_dir, config.app_name)
        .context("Failed to initialize rolling log writer")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        file_filter.clone()
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}

/// Fresh Air home directory: `$FRESH_AIR_HOME` or `~/.fresh_air`.
pub fn fresh_air_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var(HOME_ENV) {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir()
        .map(|home| home.join(".fresh_air"))
        .context("Could not determine home directory; set FRESH_AIR_HOME")
}

pub fn logs_dir() -> Result<PathBuf> {
    Ok(fresh_air_home()?.join("logs"))
}

/// Create the logs directory if needed and return it.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir()?;
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Size-capped log file; `<name>.log` rolls to `<name>.log.1` .. `.log.N-1`.
struct RollingLog {
    dir: PathBuf,
    name: String,
    keep: usize,
    max_size: u64,
    file: Option<File>,
    size: u64,
}

impl RollingLog {
    fn open(dir: &Path, name: &str, keep: usize, max_size: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let mut log = Self {
            dir: dir.to_path_buf(),
            name: file_stem(name),
            keep: keep.max(1),
            max_size,
            file: None,
            size: 0,
        };
        log.reopen()?;
        if log.size > log.max_size {
            log.roll()?;
        }
        Ok(log)
    }

    fn path(&self, generation: usize) -> PathBuf {
        match generation {
            0 => self.dir.join(format!("{}.log", self.name)),
            n => self.dir.join(format!("{}.log.{}", self.name, n)),
        }
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(0))?;
        self.size = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    /// Shift every generation up by one, dropping the oldest.
    fn roll(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
        let oldest = self.keep - 1;
        if oldest > 0 {
            for generation in (0..oldest).rev() {
                let from = self.path(generation);
                if from.exists() {
                    fs::rename(&from, self.path(generation + 1))?;
                }
            }
        } else {
            // Single file: start over
            fs::remove_file(self.path(0)).or_else(|e| match e.kind() {
                io::ErrorKind::NotFound => Ok(()),
                _ => Err(e),
            })?;
        }
        self.reopen()
    }
}

impl Write for RollingLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.size > 0 && self.size + buf.len() as u64 > self.max_size {
            self.roll()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file unavailable"))?;
        let written = file.write(buf)?;
        self.size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// `MakeWriter` sharing one rolling file across threads.
#[derive(Clone)]
struct RollingWriter {
    log: Arc<Mutex<RollingLog>>,
}

impl RollingWriter {
    fn open(dir: &Path, name: &str) -> Result<Self> {
        let log = RollingLog::open(dir, name, MAX_LOG_FILES, MAX_LOG_FILE_SIZE)
            .with_context(|| format!("Failed to open log file for {} in {}", name, dir.display()))?;
        Ok(Self {
            log: Arc::new(Mutex::new(log)),
        })
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RollingWriter {
    type Writer = RollingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for RollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.log
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.log
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .flush()
    }
}

fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect();
    if stem.is_empty() {
        "fresh_air".to_string()
    } else {
        stem
    }
}
