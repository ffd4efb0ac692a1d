use crate::error::RedeemError;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex as TokioMutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// One issued credential and who received it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedRecord {
    pub credential: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    pub issued_at: DateTime<Utc>,
    /// Set by the first successful payload fetch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_fetch_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked: bool,
}

impl IssuedRecord {
    pub fn new(credential: String, identity: Option<String>, issued_at: DateTime<Utc>) -> Self {
        Self {
            credential,
            identity,
            issued_at,
            first_fetch_at: None,
            revoked: false,
        }
    }
}

#[derive(Debug)]
pub struct LedgerInner {
    path: Option<PathBuf>,
    records: Vec<IssuedRecord>,
}

impl LedgerInner {
    pub fn records(&self) -> &[IssuedRecord] {
        &self.records
    }

    /// Whether `identity` already received a credential
    pub fn has_identity(&self, identity: &str) -> bool {
        self.records
            .iter()
            .any(|record| record.identity.as_deref() == Some(identity))
    }

    pub(crate) fn records_mut(&mut self) -> std::slice::IterMut<'_, IssuedRecord> {
        self.records.iter_mut()
    }

    pub(crate) fn find_mut(&mut self, credential: &str) -> Option<&mut IssuedRecord> {
        self.records
            .iter_mut()
            .find(|record| record.credential == credential)
    }

    /// Append a record and persist. The record is rolled back when the write
    /// fails.
    pub async fn record(&mut self, record: IssuedRecord) -> Result<(), RedeemError> {
        debug!(identity = ?record.identity, "Recording issued key");
        self.records.push(record);

        if let Err(error) = self.save().await {
            error!(?error, "Failed to save ledger after issuing a key");
            self.records.pop();
            return Err(RedeemError::storage(error));
        }
        Ok(())
    }

    pub(crate) fn retain<F>(&mut self, keep: F) -> usize
    where
        F: FnMut(&IssuedRecord) -> bool,
    {
        let before_count = self.records.len();
        self.records.retain(keep);
        before_count - self.records.len()
    }

    /// Rewrites the ledger file atomically.
    pub(crate) async fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let content = serde_json::to_string_pretty(&self.records)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// Every credential handed out, with its eligibility binding. Persisted as a
/// JSON array.
#[derive(Debug, Clone)]
pub struct CredentialLedger {
    inner: Arc<TokioMutex<LedgerInner>>,
}

impl CredentialLedger {
    /// Load the ledger from `path`. A missing file starts an empty ledger; an
    /// unparsable one is moved to `<path>.corrupt` and the ledger starts empty.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let records = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match serde_json::from_str::<Vec<IssuedRecord>>(&content) {
                Ok(records) => records,
                Err(error) => {
                    warn!(?error, ?path, "Failed to parse ledger file.");
                    set_aside(path)?;
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        info!(
            count = records.len(),
            file = %path.display(),
            "Initialize credential ledger"
        );

        Ok(Self::with_records(Some(path.to_path_buf()), records))
    }

    pub fn in_memory() -> Self {
        Self::with_records(None, Vec::new())
    }

    fn with_records(path: Option<PathBuf>, records: Vec<IssuedRecord>) -> Self {
        Self {
            inner: Arc::new(TokioMutex::new(LedgerInner { path, records })),
        }
    }

    /// Lock the ledger. Hold the guard across check-and-record sequences.
    pub async fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().await
    }

    pub async fn issued_count(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn has_identity(&self, identity: &str) -> bool {
        self.inner.lock().await.has_identity(identity)
    }
}

/// Keep a copy of an unparsable ledger for manual recovery.
fn set_aside(path: &Path) -> anyhow::Result<()> {
    let mut corrupt = path.as_os_str().to_owned();
    corrupt.push(".corrupt");
    let corrupt = PathBuf::from(corrupt);

    std::fs::rename(path, &corrupt)
        .with_context(|| format!("Failed to move corrupt ledger {}", path.display()))?;
    warn!(file = %corrupt.display(), "Moved corrupt ledger aside");
    Ok(())
}
