use crate::error::RedeemError;
use anyhow::Context;
use rand::Rng;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, error, info, warn};

/// Parse a newline-delimited key list. Blank lines are ignored and duplicates
/// are collapsed so a credential can never be issued twice.
pub fn parse_key_list(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    content
        .lines()
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .filter(|key| seen.insert(*key))
        .map(str::to_string)
        .collect()
}

/// Pool of credentials that have not been handed out yet.
///
/// When backed by a file, the remaining keys are written back after every
/// draw, so restarting the process never puts an issued key back in
/// circulation.
#[derive(Debug, Clone)]
pub struct KeyPool {
    path: Option<PathBuf>,
    keys: Arc<TokioMutex<Vec<String>>>,
}

impl KeyPool {
    /// Load the pool from a key file. A missing file is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read key file {}", path.display()))?;
        let keys = parse_key_list(&content);

        if keys.is_empty() {
            warn!(file = %path.display(), "Key file holds no keys");
        }
        info!(count = keys.len(), file = %path.display(), "Initialize key pool");

        Ok(Self {
            path: Some(path.to_path_buf()),
            keys: Arc::new(TokioMutex::new(keys)),
        })
    }

    /// Pool that lives only in memory.
    pub fn in_memory<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let content = keys
            .into_iter()
            .map(Into::into)
            .collect::<Vec<String>>()
            .join("\n");

        Self {
            path: None,
            keys: Arc::new(TokioMutex::new(parse_key_list(&content))),
        }
    }

    pub async fn size(&self) -> usize {
        self.keys.lock().await.len()
    }

    /// Remove and return one randomly chosen key, or `None` when the pool is
    /// exhausted.
    ///
    /// The lock is held across the file rewrite. If the rewrite fails the key
    /// goes back into the pool and the draw fails.
    pub async fn draw(&self) -> Result<Option<String>, RedeemError> {
        let mut keys = self.keys.lock().await;
        if keys.is_empty() {
            return Ok(None);
        }

        let index = rand::thread_rng().gen_range(0..keys.len());
        let key = keys.swap_remove(index);

        if let Err(error) = self.save(&keys).await {
            error!(?error, "Failed to persist key pool after draw");
            keys.push(key);
            return Err(RedeemError::storage(error));
        }

        debug!(remaining = keys.len(), "Drew key from pool");
        Ok(Some(key))
    }

    /// Put back a key whose issuance could not be completed.
    pub async fn restore(&self, key: String) {
        let mut keys = self.keys.lock().await;
        if keys.contains(&key) {
            return;
        }
        keys.push(key);
        if let Err(error) = self.save(&keys).await {
            error!(?error, "Failed to persist key pool after restoring a key");
        }
    }

    /// Writes the remaining keys to a sibling temp file, then renames it over
    /// the key file.
    async fn save(&self, keys: &[String]) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut content = keys.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}
