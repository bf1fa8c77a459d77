//! # Watermark persistence
//!
//! The watermark is the last consumed value of the incrementing column. It is
//! kept in memory while a cycle runs and written to a one-line status file
//! once the cycle's records have been delivered.
//!
//! ## Durability
//!
//! Each persist writes the value to a sibling temporary file, fsyncs it and
//! renames it over the status file. A crash leaves either the previous or the
//! new value on disk, never a truncated one.
//!
//! ## Usage
//!
//! ```ignore
//! let mut store = WatermarkStore::open(&config, "orders").await?;
//! let sql = QueryBuilder::new(&config.query_template).build(store.current_value());
//! // ... emit rows ...
//! store.advance(Watermark::new("1042"));
//! store.persist().await?;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use crate::config::SourceConfig;
use crate::error::{Result, SourceError};

/// Position of the last consumed row, as an opaque string token
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(String);

impl Watermark {
    /// Create a watermark
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the string form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the string form
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Why this value cannot round-trip through a one-line status file
    fn unstorable_reason(&self) -> Option<&'static str> {
        if self.0.trim().is_empty() {
            Some("watermark is blank")
        } else if self.0.contains(['\n', '\r']) {
            Some("watermark contains a line break")
        } else {
            None
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Watermark {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Watermark {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Status file backed watermark for one named source
#[derive(Debug)]
pub struct WatermarkStore {
    source_name: String,
    dir: PathBuf,
    path: PathBuf,
    current: Watermark,
    dirty: bool,
}

impl WatermarkStore {
    /// Open the store for `source_name`.
    ///
    /// Creates the status directory, then restores the persisted watermark or
    /// falls back to the configured initial value.
    pub async fn open(config: &SourceConfig, source_name: impl Into<String>) -> Result<Self> {
        let source_name = source_name.into();
        let dir = config.status_file_path.clone();
        let path = config.status_file();

        fs::create_dir_all(&dir)
            .await
            .map_err(|e| SourceError::storage(&dir, e))?;

        let mut store = Self {
            source_name,
            dir,
            path,
            current: Watermark::new(config.initial_watermark.as_str()),
            dirty: false,
        };

        match store.load().await? {
            Some(persisted) => {
                info!(
                    source = %store.source_name,
                    watermark = %persisted,
                    path = %store.path.display(),
                    "Restored watermark from status file"
                );
                store.current = persisted;
            }
            None => {
                info!(
                    source = %store.source_name,
                    watermark = %store.current,
                    "No status file, starting from initial watermark"
                );
            }
        }

        Ok(store)
    }

    /// The in-memory watermark
    pub fn current_value(&self) -> &Watermark {
        &self.current
    }

    /// Move the in-memory watermark; nothing is written until [`persist`](Self::persist)
    pub fn advance(&mut self, value: Watermark) {
        if value != self.current {
            debug!(
                source = %self.source_name,
                from = %self.current,
                to = %value,
                "Advancing watermark"
            );
            self.current = value;
            self.dirty = true;
        }
    }

    /// Durably write the current watermark.
    ///
    /// On failure the temporary file is removed and the in-memory value is
    /// kept, so a later persist can still succeed. A value that [`load`](Self::load)
    /// could not read back is refused before anything is written.
    pub async fn persist(&mut self) -> Result<()> {
        if let Some(reason) = self.current.unstorable_reason() {
            error!(
                source = %self.source_name,
                watermark = ?self.current.as_str(),
                reason,
                "Refusing to persist watermark"
            );
            return Err(SourceError::malformed(&self.path, reason));
        }

        let temp_path = self.temp_path();

        if let Err(err) = self.write_atomically(&temp_path).await {
            let _ = fs::remove_file(&temp_path).await;
            error!(
                source = %self.source_name,
                path = %self.path.display(),
                error = %err,
                "Failed to persist watermark"
            );
            return Err(err);
        }

        self.dirty = false;
        debug!(
            source = %self.source_name,
            watermark = %self.current,
            "Persisted watermark"
        );
        Ok(())
    }

    async fn write_atomically(&self, temp_path: &Path) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SourceError::storage(&self.dir, e))?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp_path)
            .await
            .map_err(|e| SourceError::storage(temp_path, e))?;

        let mut line = self.current.as_str().to_owned();
        line.push('\n');
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| SourceError::storage(temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| SourceError::storage(temp_path, e))?;
        drop(file);

        // Atomic rename
        fs::rename(temp_path, &self.path)
            .await
            .map_err(|e| SourceError::storage(&self.path, e))?;

        // fsync parent directory so the rename itself is durable
        #[cfg(unix)]
        if let Ok(dir) = fs::File::open(&self.dir).await {
            let _ = dir.sync_all().await;
        }

        Ok(())
    }

    /// Read the status file.
    ///
    /// `None` when the file does not exist. One trailing `\n` or `\r\n` is
    /// dropped and the rest is returned verbatim. A file that is unreadable,
    /// not UTF-8, blank, or holds more than one line is an error.
    pub async fn load(&self) -> Result<Option<Watermark>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SourceError::storage(&self.path, e)),
        };

        let text = String::from_utf8(bytes)
            .map_err(|_| SourceError::malformed(&self.path, "contents are not valid UTF-8"))?;

        let line = text
            .strip_suffix("\r\n")
            .or_else(|| text.strip_suffix('\n'))
            .unwrap_or(&text);

        if line.contains(['\n', '\r']) {
            return Err(SourceError::malformed(
                &self.path,
                "expected a single line holding the watermark",
            ));
        }
        if line.trim().is_empty() {
            return Err(SourceError::malformed(&self.path, "file is empty"));
        }

        Ok(Some(Watermark::new(line)))
    }

    /// Status file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name of the source this store belongs to
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Whether the in-memory value differs from the last persisted one
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.dir.join(name)
    }
}
