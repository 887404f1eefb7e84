use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to create directory '{}': {source}", path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to read '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Output file name for a batch finished at `at`,
/// e.g. `feeds-20250106_100000.json`.
pub fn default_file_name(at: DateTime<Utc>) -> String {
    format!("feeds-{}.json", at.format("%Y%m%d_%H%M%S"))
}

/// Writes files below a fixed root directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Stores `data` as `filename` under the root and returns the full path.
    ///
    /// Parent directories are created as needed. The content goes to a
    /// temporary sibling first and is renamed into place after an fsync, so
    /// the destination is never left half written.
    pub fn store(&self, filename: &str, data: &[u8]) -> Result<PathBuf, StorageError> {
        let path = self.root.join(filename);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| StorageError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let temp_path = temp_sibling(&path);
        let write_err = |source| StorageError::Write {
            path: path.clone(),
            source,
        };

        let result = (|| {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
            drop(file);

            // On Windows, rename fails if destination exists
            #[cfg(windows)]
            if path.exists() {
                std::fs::remove_file(&path)?;
            }

            std::fs::rename(&temp_path, &path)
        })();

        if let Err(e) = result {
            let _ = std::fs::remove_file(&temp_path);
            return Err(write_err(e));
        }

        tracing::debug!(path = %path.display(), bytes = data.len(), "Stored file");
        Ok(path)
    }

    /// Reads back a file previously written with [`store`](Self::store).
    pub fn load(&self, filename: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.root.join(filename);
        std::fs::read(&path).map_err(|source| StorageError::Read { path, source })
    }
}

/// Unpredictable temp name next to `path`, so the final rename stays on one
/// filesystem.
fn temp_sibling(path: &Path) -> PathBuf {
    use std::time::{SystemTime, UNIX_EPOCH};
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".tmp.{suffix:016x}"));
    path.with_file_name(name)
}
