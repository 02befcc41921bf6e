//! Container log plumbing.
//!
//! Each container in a running pod gets a log driver instance and a
//! copier that pumps the VM-provided stdout/stderr streams into it. The
//! driver set is extensible through [`LogDriverRegistry`]; the built-in
//! `json-file` driver writes Docker-compatible JSON lines under the pod's
//! resource directory.

use crate::constants::JSON_FILE_LOG_DRIVER;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// =============================================================================
// Driver Interface
// =============================================================================

/// One log line captured from a container stream.
#[derive(Debug, Clone)]
pub struct LogMessage {
    /// `"stdout"` or `"stderr"`.
    pub source: &'static str,
    /// Line contents without the trailing newline.
    pub line: Vec<u8>,
    /// Capture timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Destination for a single container's log stream.
pub trait LogDriver: Send + Sync {
    /// Driver name.
    fn name(&self) -> &'static str;

    /// Appends one message.
    fn log(&self, msg: LogMessage) -> Result<()>;

    /// On-disk log location, for drivers that have one.
    fn log_path(&self) -> Option<PathBuf> {
        None
    }

    /// Flushes and closes the destination. Subsequent `log` calls fail.
    fn close(&self) -> Result<()>;
}

/// Everything a driver may want to know about the container it logs for.
#[derive(Debug, Clone, Default)]
pub struct LogContext {
    /// Driver options from the pod spec (or the daemon default).
    pub config: HashMap<String, String>,
    /// Container id.
    pub container_id: String,
    /// Container name.
    pub container_name: String,
    /// Image reference.
    pub image_name: String,
    /// Container entrypoint, when prepared info is available.
    pub entrypoint: Vec<String>,
    /// Container command, when prepared info is available.
    pub cmd: Vec<String>,
    /// Container creation time.
    pub created: Option<DateTime<Utc>>,
    /// Target path for file-backed drivers.
    pub log_path: Option<PathBuf>,
}

/// Instantiates a driver for one container.
pub type LogDriverCreator = fn(&LogContext) -> Result<Arc<dyn LogDriver>>;

/// Validates driver options before any driver is instantiated.
pub type LogOptValidator = fn(&HashMap<String, String>) -> Result<()>;

// =============================================================================
// Driver Registry
// =============================================================================

/// Registry of available log drivers, keyed by driver name.
pub struct LogDriverRegistry {
    drivers: HashMap<String, (LogDriverCreator, LogOptValidator)>,
}

impl LogDriverRegistry {
    /// Creates a registry with the built-in `json-file` driver.
    pub fn with_builtin() -> Self {
        let mut registry = Self {
            drivers: HashMap::new(),
        };
        registry.register(
            JSON_FILE_LOG_DRIVER,
            json_file_creator,
            json_file_validate_opts,
        );
        registry
    }

    /// Registers a driver under `name`, replacing any existing entry.
    pub fn register(&mut self, name: &str, creator: LogDriverCreator, validator: LogOptValidator) {
        self.drivers.insert(name.to_string(), (creator, validator));
    }

    /// Returns the creator for `name`.
    pub fn creator(&self, name: &str) -> Result<LogDriverCreator> {
        self.drivers
            .get(name)
            .map(|(c, _)| *c)
            .ok_or_else(|| Error::Logger(format!("unknown log driver: {name}")))
    }

    /// Validates driver options for `name`.
    pub fn validate_opts(&self, name: &str, config: &HashMap<String, String>) -> Result<()> {
        let (_, validator) = self
            .drivers
            .get(name)
            .ok_or_else(|| Error::Logger(format!("unknown log driver: {name}")))?;
        validator(config)
    }
}

impl Default for LogDriverRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

// =============================================================================
// json-file Driver
// =============================================================================

fn json_file_creator(ctx: &LogContext) -> Result<Arc<dyn LogDriver>> {
    let path = ctx
        .log_path
        .clone()
        .ok_or_else(|| Error::Logger("json-file driver requires a log path".to_string()))?;
    Ok(Arc::new(JsonFileLogger::open(path)?))
}

fn json_file_validate_opts(config: &HashMap<String, String>) -> Result<()> {
    for key in config.keys() {
        match key.as_str() {
            "max-size" | "max-file" | "labels" | "env" => {}
            other => {
                return Err(Error::Logger(format!(
                    "unknown json-file option: {other}"
                )));
            }
        }
    }
    Ok(())
}

/// Docker-compatible JSON-lines file logger.
///
/// Each message becomes one line:
/// `{"log":"...","stream":"stdout","time":"2026-08-02T00:00:00Z"}`.
pub struct JsonFileLogger {
    file: Mutex<Option<std::fs::File>>,
    path: PathBuf,
}

impl JsonFileLogger {
    /// Opens (creating if needed) the log file at `path`.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
        })
    }

    fn file_lock(&self) -> std::sync::MutexGuard<'_, Option<std::fs::File>> {
        self.file.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LogDriver for JsonFileLogger {
    fn name(&self) -> &'static str {
        JSON_FILE_LOG_DRIVER
    }

    fn log(&self, msg: LogMessage) -> Result<()> {
        let mut guard = self.file_lock();
        let Some(file) = guard.as_mut() else {
            return Err(Error::Logger("json-file logger is closed".to_string()));
        };

        let record = serde_json::json!({
            "log": String::from_utf8_lossy(&msg.line),
            "stream": msg.source,
            "time": msg.timestamp.to_rfc3339(),
        });
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        file.write_all(&line)?;
        Ok(())
    }

    fn log_path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }

    fn close(&self) -> Result<()> {
        if let Some(mut file) = self.file_lock().take() {
            file.flush()?;
        }
        Ok(())
    }
}

// =============================================================================
// Copier
// =============================================================================

/// Pumps a container's stdout/stderr readers into its log driver.
///
/// The copy tasks end when their stream reaches EOF or the driver is
/// closed underneath them.
pub struct LogCopier {
    handles: Vec<JoinHandle<()>>,
}

impl LogCopier {
    /// Starts copy tasks for both streams.
    pub fn spawn(
        container_id: &str,
        stdout: Box<dyn AsyncRead + Send + Unpin>,
        stderr: Box<dyn AsyncRead + Send + Unpin>,
        driver: Arc<dyn LogDriver>,
    ) -> Self {
        let handles = vec![
            tokio::spawn(copy_stream(
                container_id.to_string(),
                "stdout",
                stdout,
                Arc::clone(&driver),
            )),
            tokio::spawn(copy_stream(
                container_id.to_string(),
                "stderr",
                stderr,
                driver,
            )),
        ];
        Self { handles }
    }

    /// Aborts the copy tasks without waiting for EOF.
    pub fn stop(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

async fn copy_stream(
    container_id: String,
    source: &'static str,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    driver: Arc<dyn LogDriver>,
) {
    let mut lines = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match lines.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                let msg = LogMessage {
                    source,
                    line: buf.clone(),
                    timestamp: Utc::now(),
                };
                if let Err(e) = driver.log(msg) {
                    debug!(container = %container_id, stream = source, error = %e, "log driver rejected message, stopping copier");
                    break;
                }
            }
            Err(e) => {
                warn!(container = %container_id, stream = source, error = %e, "log stream read failed");
                break;
            }
        }
    }
}

// =============================================================================
// Per-Container Log State
// =============================================================================

/// Log state attached to one container in a pod status.
#[derive(Default)]
pub struct ContainerLogs {
    /// Driver instance, once configured.
    pub driver: Option<Arc<dyn LogDriver>>,
    /// Running copier, once the pod is started.
    pub copier: Option<LogCopier>,
    /// On-disk log path for file-backed drivers.
    pub log_path: Option<PathBuf>,
}

impl ContainerLogs {
    /// Closes the driver and stops the copier, if present.
    pub fn close(&mut self) {
        if let Some(copier) = self.copier.take() {
            copier.stop();
        }
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.close() {
                warn!(error = %e, "failed to close log driver");
            }
        }
    }
}

impl std::fmt::Debug for ContainerLogs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerLogs")
            .field("driver", &self.driver.as_ref().map(|d| d.name()))
            .field("log_path", &self.log_path)
            .finish()
    }
}

/// Builds the json-file log path for a container under a pod's resource
/// directory: `<resource path>/<cid>-json.log`.
pub fn json_file_log_path(resource_path: &Path, container_id: &str) -> PathBuf {
    resource_path.join(format!("{container_id}-json.log"))
}
