use crate::config::Config;
use crate::identity::{self, IdentityExtractor};
use crate::webhook::WebhookAuditSink;
use key_dispenser_redeem::{
    CredentialLedger, KeyPool, ProtectedGate, RedemptionBroker, SweepHandle, TokenStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct AppState {
    pub broker: RedemptionBroker,
    pub gate: ProtectedGate,
    pub identity: Arc<dyn IdentityExtractor>,
    pub payload_file: PathBuf,
    sweep_interval: Duration,
}

impl AppState {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let workspace = config.workspace_path();
        std::fs::create_dir_all(&workspace)?;

        let pool = KeyPool::load(&config.keys_path())?;
        let ledger = CredentialLedger::load(&config.ledger_path())?;
        let store = TokenStore::new(config.sweep_interval());
        let identity = identity::from_eligibility(config.eligibility, config.trust_forwarded_for);

        let mut broker = RedemptionBroker::new(pool, store, ledger.clone())
            .with_ttl(config.token_ttl())
            .with_eligibility(identity.one_per_identity());
        if let Some(webhook_url) = &config.webhook_url {
            info!(webhook_url, "Audit webhook enabled");
            broker = broker.with_audit(Arc::new(WebhookAuditSink::new(webhook_url)));
        }

        let gate = ProtectedGate::new(ledger, config.key_retention());

        Ok(Self {
            broker,
            gate,
            identity,
            payload_file: config.payload_file_path(),
            sweep_interval: config.sweep_interval(),
        })
    }

    pub fn payload_file(&self) -> &Path {
        self.payload_file.as_path()
    }

    /// Start the stale-link sweep and the retention revocation. Stop the
    /// returned handles on shutdown.
    pub fn start_background_tasks(&self) -> Vec<SweepHandle> {
        vec![
            self.broker.store().start_sweep_task(),
            self.gate.start_revocation_task(self.sweep_interval),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Eligibility;

    fn config_in(dir: &Path) -> Config {
        Config {
            workspace: dir.display().to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_new_loads_workspace_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keys.txt"), "K1\nK2\n").unwrap();

        let state = AppState::new(&config_in(dir.path())).unwrap();
        assert_eq!(state.broker.pool().size().await, 2);
        assert_eq!(state.broker.ledger().issued_count().await, 0);
        assert_eq!(state.payload_file(), dir.path().join("payload.txt"));
        assert!(state.identity.one_per_identity());

        for handle in state.start_background_tasks() {
            handle.stop().await;
        }
    }

    #[tokio::test]
    async fn test_new_requires_key_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AppState::new(&config_in(dir.path())).is_err());
    }

    #[tokio::test]
    async fn test_eligibility_off_allows_anonymous_requests() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keys.txt"), "K1\n").unwrap();
        let config = Config {
            eligibility: Eligibility::Off,
            ..config_in(dir.path())
        };

        let state = AppState::new(&config).unwrap();
        assert!(state.broker.request_access(None).await.is_ok());
    }
}
