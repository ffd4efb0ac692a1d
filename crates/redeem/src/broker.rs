use crate::audit::{AuditEvent, AuditSink, LogAuditSink};
use crate::error::RedeemError;
use crate::ledger::{CredentialLedger, IssuedRecord};
use crate::pool::KeyPool;
use crate::store::{Delivery, TokenStore};
use crate::token::RedemptionToken;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Path prefix of delivery URLs
pub const DELIVERY_PREFIX: &str = "/k";

/// Default lifetime of a redemption link
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(300);

/// The slug and nonce handed back to a successful requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub slug: String,
    pub nonce: String,
    pub expires_in: Duration,
}

impl AccessGrant {
    /// `/k/<slug>?t=<nonce>`. Both parts are base64url and need no escaping.
    pub fn delivery_path(&self) -> String {
        format!("{DELIVERY_PREFIX}/{}?t={}", self.slug, self.nonce)
    }
}

/// Draws credentials from the pool and mints redemption tokens for them.
#[derive(Debug, Clone)]
pub struct RedemptionBroker {
    pool: KeyPool,
    store: TokenStore,
    ledger: CredentialLedger,
    audit: Arc<dyn AuditSink>,
    ttl: Duration,
    one_per_identity: bool,
}

impl RedemptionBroker {
    pub fn new(pool: KeyPool, store: TokenStore, ledger: CredentialLedger) -> Self {
        Self {
            pool,
            store,
            ledger,
            audit: Arc::new(LogAuditSink),
            ttl: DEFAULT_TOKEN_TTL,
            one_per_identity: false,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Limit every identity to a single credential.
    pub fn with_eligibility(mut self, one_per_identity: bool) -> Self {
        self.one_per_identity = one_per_identity;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn pool(&self) -> &KeyPool {
        &self.pool
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub fn ledger(&self) -> &CredentialLedger {
        &self.ledger
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Hand out one credential behind a fresh redemption token.
    ///
    /// The ledger stays locked from the eligibility check until the issuance
    /// is recorded, so one identity can never win twice.
    pub async fn request_access(&self, identity: Option<&str>) -> Result<AccessGrant, RedeemError> {
        let identity = identity.map(str::trim).filter(|id| !id.is_empty());
        if self.one_per_identity && identity.is_none() {
            return Err(RedeemError::malformed("missing requester identity"));
        }

        let mut ledger = self.ledger.lock().await;
        if self.one_per_identity
            && let Some(identity) = identity
            && ledger.has_identity(identity)
        {
            debug!(identity, "Identity already claimed a key");
            return Err(RedeemError::AlreadyClaimed);
        }

        let Some(credential) = self.pool.draw().await? else {
            warn!("Key pool exhausted");
            return Err(RedeemError::PoolExhausted);
        };

        let issued_at = Utc::now();
        let bound_identity = identity
            .filter(|_| self.one_per_identity)
            .map(str::to_string);
        let record = IssuedRecord::new(credential.clone(), bound_identity, issued_at);
        if let Err(error) = ledger.record(record).await {
            self.pool.restore(credential).await;
            return Err(error);
        }
        drop(ledger);

        let token = RedemptionToken::mint(credential.clone(), self.ttl, Instant::now());
        let grant = AccessGrant {
            slug: token.slug().to_string(),
            nonce: token.nonce().to_string(),
            expires_in: self.ttl,
        };
        self.store.insert(token);

        self.audit.record(AuditEvent {
            identity: identity.map(str::to_string),
            credential,
            timestamp: issued_at,
        });

        let remaining = self.pool.size().await;
        info!(remaining, "Issued redemption link");
        Ok(grant)
    }

    /// Release the credential behind `slug` once.
    pub fn resolve(&self, slug: &str, nonce: &str) -> Result<Delivery, RedeemError> {
        self.store.resolve(slug, nonce)
    }

    /// Client-side confirmation that the credential was taken.
    pub fn confirm(&self, slug: &str, nonce: &str) -> Result<(), RedeemError> {
        self.store.confirm(slug, nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Debug, Default)]
    struct RecordingSink {
        events: Mutex<Vec<AuditEvent>>,
    }

    impl AuditSink for RecordingSink {
        fn record(&self, event: AuditEvent) {
            self.events.lock().push(event);
        }
    }

    fn broker(keys: &[&str], one_per_identity: bool) -> RedemptionBroker {
        RedemptionBroker::new(
            KeyPool::in_memory(keys.iter().copied()),
            TokenStore::new(Duration::from_secs(60)),
            CredentialLedger::in_memory(),
        )
        .with_eligibility(one_per_identity)
    }

    #[tokio::test]
    async fn test_two_key_scenario() {
        let broker = broker(&["K1", "K2"], true);

        let t1 = broker.request_access(Some("u1")).await.unwrap();
        let first = broker.resolve(&t1.slug, &t1.nonce).unwrap().credential;
        assert!(first == "K1" || first == "K2");
        assert_eq!(
            broker.resolve(&t1.slug, &t1.nonce),
            Err(RedeemError::AlreadyConsumed)
        );

        assert_eq!(
            broker.request_access(Some("u1")).await,
            Err(RedeemError::AlreadyClaimed)
        );

        let t2 = broker.request_access(Some("u2")).await.unwrap();
        let second = broker.resolve(&t2.slug, &t2.nonce).unwrap().credential;
        assert_ne!(first, second);

        assert_eq!(
            broker.request_access(Some("u3")).await,
            Err(RedeemError::PoolExhausted)
        );
    }

    #[tokio::test]
    async fn test_pool_exhaustion_without_eligibility() {
        let broker = broker(&["K1", "K2", "K3"], false);

        let mut credentials = HashSet::new();
        for _ in 0..3 {
            let grant = broker.request_access(None).await.unwrap();
            credentials.insert(broker.resolve(&grant.slug, &grant.nonce).unwrap().credential);
        }
        assert_eq!(credentials.len(), 3);
        assert_eq!(
            broker.request_access(None).await,
            Err(RedeemError::PoolExhausted)
        );
        assert_eq!(broker.ledger().issued_count().await, 3);
    }

    #[tokio::test]
    async fn test_missing_identity_rejected_when_eligibility_active() {
        let broker = broker(&["K1"], true);

        assert!(matches!(
            broker.request_access(None).await,
            Err(RedeemError::Malformed(_))
        ));
        assert!(matches!(
            broker.request_access(Some("   ")).await,
            Err(RedeemError::Malformed(_))
        ));
        // nothing was drawn
        assert_eq!(broker.pool().size().await, 1);
    }

    #[tokio::test]
    async fn test_rejected_identity_does_not_drain_pool() {
        let broker = broker(&["K1", "K2"], true);
        broker.request_access(Some("u1")).await.unwrap();

        for _ in 0..5 {
            assert_eq!(
                broker.request_access(Some("u1")).await,
                Err(RedeemError::AlreadyClaimed)
            );
        }
        assert_eq!(broker.pool().size().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_same_identity_single_winner() {
        let broker = broker(&["K1", "K2", "K3", "K4"], true);

        let handles = (0..8)
            .map(|_| {
                let broker = broker.clone();
                tokio::spawn(async move { broker.request_access(Some("u1")).await })
            })
            .collect::<Vec<_>>();

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(error) => assert_eq!(error, RedeemError::AlreadyClaimed),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(broker.pool().size().await, 3);
    }

    #[tokio::test]
    async fn test_audit_event_emitted() {
        let sink = Arc::new(RecordingSink::default());
        let broker = broker(&["K1"], true).with_audit(sink.clone());

        let grant = broker.request_access(Some("u1")).await.unwrap();
        let events = sink.events.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].identity.as_deref(), Some("u1"));
        assert_eq!(events[0].credential, "K1");
        assert!(grant.delivery_path().starts_with("/k/"));
        assert!(grant.delivery_path().contains("?t="));
    }

    #[tokio::test]
    async fn test_request_access_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let broker = broker(&["K1"], false);
        let request = broker.request_access(None);
        assert_send(&request);
        assert!(request.await.is_ok());
    }

    #[tokio::test]
    async fn test_huge_ttl_does_not_overflow() {
        let broker = broker(&["K1"], false).with_ttl(Duration::from_secs(u64::MAX));

        let grant = broker.request_access(None).await.unwrap();
        assert!(broker.resolve(&grant.slug, &grant.nonce).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grant_expires_after_ttl() {
        let broker = broker(&["K1", "K2"], false).with_ttl(Duration::from_secs(30));

        let early = broker.request_access(None).await.unwrap();
        let late = broker.request_access(None).await.unwrap();
        assert_eq!(late.expires_in, Duration::from_secs(30));

        tokio::time::advance(Duration::from_millis(29_999)).await;
        assert!(broker.resolve(&early.slug, &early.nonce).is_ok());

        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(
            broker.resolve(&late.slug, &late.nonce),
            Err(RedeemError::Expired)
        );
    }
}
