//! JSON-file persistence: one typed file per collection, one mutex per file.
//!
//! Readers work from in-memory snapshots held by the owning components; every
//! write funnels through [`JsonFile::store`] which serializes under the
//! per-file mutex and lands on disk via the temp→rename pattern, so a crash
//! leaves either the old or the new content, never a torn file.

pub mod logbuf;

use crate::error::GatewayError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

pub const ACCOUNTS_FILE: &str = "accounts.json";
pub const API_KEYS_FILE: &str = "api_keys.json";
pub const APP_LOGS_FILE: &str = "app_logs.json";
pub const CONFIG_FILE: &str = "config.json";

/// One JSON-encoded collection on disk.
#[derive(Debug)]
pub struct JsonFile<T> {
    path: PathBuf,
    lock: Mutex<()>,
    _collection: PhantomData<fn() -> T>,
}

impl<T> JsonFile<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
            _collection: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the collection. A missing file yields the empty collection; a
    /// present-but-undecodable file is a hard error, not silent data loss.
    pub async fn load(&self) -> Result<T, GatewayError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| {
            GatewayError::Store(format!(
                "failed to decode {}: {e}",
                self.path.display()
            ))
        })
    }

    /// Serializes and atomically replaces the file contents.
    pub async fn store(&self, collection: &T) -> Result<(), GatewayError> {
        let _guard = self.lock.lock().await;
        let json = serde_json::to_vec_pretty(collection)?;

        let temp_path = self.path.with_file_name(format!(
            ".{}.tmp.{}",
            self.path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            std::process::id()
        ));
        tokio::fs::write(&temp_path, &json).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

/// The gateway's data directory and the files inside it.
#[derive(Debug)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Opens the directory, creating it if absent.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, GatewayError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn accounts<T>(&self) -> JsonFile<T>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        JsonFile::new(self.root.join(ACCOUNTS_FILE))
    }

    pub fn api_keys<T>(&self) -> JsonFile<T>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        JsonFile::new(self.root.join(API_KEYS_FILE))
    }

    pub fn app_logs<T>(&self) -> JsonFile<T>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        JsonFile::new(self.root.join(APP_LOGS_FILE))
    }
}
