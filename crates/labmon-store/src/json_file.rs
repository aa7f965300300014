//! One JSON array document on disk.
//!
//! Writes go to a sibling `.tmp` file first and are renamed over the target,
//! so readers never observe a half-written document. Loading a missing file
//! yields an empty collection; loading unparseable JSON is `Corruption` and
//! the caller refuses to start.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use labmon_core::{MonitorError, MonitorResult};

pub struct JsonFile<T> {
    path: PathBuf,
    _marker: PhantomData<T>,
}

impl<T> JsonFile<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Bind to a path, creating the parent directory and an empty `[]`
    /// document when nothing exists yet.
    pub async fn open(path: impl Into<PathBuf>) -> MonitorResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if !tokio::fs::try_exists(&path).await? {
            tokio::fs::write(&path, b"[]").await?;
        }
        Ok(Self {
            path,
            _marker: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the whole collection.
    pub async fn load(&self) -> MonitorResult<Vec<T>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes).map_err(|e| MonitorError::Corruption {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Replace the whole collection atomically.
    pub async fn save(&self, items: &[T]) -> MonitorResult<()> {
        let body = serde_json::to_vec_pretty(items)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
