use crate::error::RedeemError;
use crate::sweep::{SweepHandle, spawn_periodic};
use crate::token::RedemptionToken;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A credential released by a successful resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub credential: String,
    pub expires_in: Duration,
}

#[derive(Debug, Default)]
struct TokenStoreInner {
    tokens: HashMap<String, RedemptionToken>,
}

impl TokenStoreInner {
    fn insert(&mut self, token: RedemptionToken) {
        self.tokens.insert(token.slug().to_string(), token);
    }

    fn resolve(&mut self, slug: &str, nonce: &str, now: Instant) -> Result<Delivery, RedeemError> {
        let token = self.tokens.get_mut(slug).ok_or(RedeemError::Expired)?;

        if token.is_consumed() {
            return Err(RedeemError::AlreadyConsumed);
        }
        if !token.nonce_matches(nonce) {
            return Err(RedeemError::Forbidden);
        }
        if token.is_expired(now) {
            self.tokens.remove(slug);
            return Err(RedeemError::Expired);
        }

        token.consume();
        Ok(Delivery {
            credential: token.credential().to_string(),
            expires_in: token.remaining(now),
        })
    }

    fn confirm(&mut self, slug: &str, nonce: &str, now: Instant) -> Result<(), RedeemError> {
        let token = self.tokens.get_mut(slug).ok_or(RedeemError::Expired)?;

        if !token.nonce_matches(nonce) {
            return Err(RedeemError::Forbidden);
        }
        if token.is_consumed() {
            return Ok(());
        }
        if token.is_expired(now) {
            self.tokens.remove(slug);
            return Err(RedeemError::Expired);
        }

        token.consume();
        Ok(())
    }

    /// Drop consumed and expired tokens, returning how many were removed
    fn sweep(&mut self, now: Instant) -> usize {
        let before_count = self.tokens.len();
        self.tokens
            .retain(|_slug, token| !token.is_consumed() && !token.is_expired(now));

        let removed = before_count - self.tokens.len();
        if removed > 0 {
            debug!(
                removed,
                remaining = self.tokens.len(),
                "Swept redemption tokens"
            );
        }
        removed
    }
}

/// Store of in-flight redemption tokens keyed by slug.
///
/// Every check-and-set runs under a single write lock, so two requests for
/// the same token can never both succeed.
#[derive(Clone, Debug)]
pub struct TokenStore {
    inner: Arc<RwLock<TokenStoreInner>>,
    sweep_interval: Duration,
}

impl TokenStore {
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TokenStoreInner::default())),
            sweep_interval,
        }
    }

    pub fn insert(&self, token: RedemptionToken) {
        self.inner.write().insert(token);
    }

    /// Number of tokens currently held, including ones awaiting the sweep
    pub fn len(&self) -> usize {
        self.inner.read().tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release the bound credential once. The token is consumed on success.
    pub fn resolve(&self, slug: &str, nonce: &str) -> Result<Delivery, RedeemError> {
        self.inner.write().resolve(slug, nonce, Instant::now())
    }

    /// Mark the token consumed without releasing anything. Repeating the call
    /// on a consumed token succeeds until the sweep removes it.
    pub fn confirm(&self, slug: &str, nonce: &str) -> Result<(), RedeemError> {
        self.inner.write().confirm(slug, nonce, Instant::now())
    }

    pub fn sweep(&self) -> usize {
        self.inner.write().sweep(Instant::now())
    }

    /// Start the background sweep on the configured interval.
    /// This must be called from within a tokio runtime.
    pub fn start_sweep_task(&self) -> SweepHandle {
        let store = self.clone();
        spawn_periodic("token-sweep", self.sweep_interval, move || {
            let store = store.clone();
            async move {
                store.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    fn store_with(credential: &str) -> (TokenStore, String, String) {
        let store = TokenStore::new(Duration::from_secs(60));
        let token = RedemptionToken::mint(credential.to_string(), TTL, Instant::now());
        let (slug, nonce) = (token.slug().to_string(), token.nonce().to_string());
        store.insert(token);
        (store, slug, nonce)
    }

    #[tokio::test]
    async fn test_resolve_once() {
        let (store, slug, nonce) = store_with("K1");

        let delivery = store.resolve(&slug, &nonce).unwrap();
        assert_eq!(delivery.credential, "K1");
        assert_eq!(store.resolve(&slug, &nonce), Err(RedeemError::AlreadyConsumed));
    }

    #[tokio::test]
    async fn test_resolve_unknown_slug() {
        let (store, _slug, nonce) = store_with("K1");
        assert_eq!(store.resolve("nope", &nonce), Err(RedeemError::Expired));
    }

    #[tokio::test]
    async fn test_wrong_nonce_never_resolves() {
        let (store, slug, nonce) = store_with("K1");

        assert_eq!(store.resolve(&slug, "guess"), Err(RedeemError::Forbidden));
        assert_eq!(store.resolve(&slug, ""), Err(RedeemError::Forbidden));
        // a failed guess does not burn the token
        assert!(store.resolve(&slug, &nonce).is_ok());
        assert_eq!(store.resolve(&slug, "guess"), Err(RedeemError::AlreadyConsumed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_boundary() {
        let (store, slug, nonce) = store_with("K1");
        let (store2, slug2, nonce2) = store_with("K2");

        tokio::time::advance(TTL - Duration::from_millis(1)).await;
        assert!(store.resolve(&slug, &nonce).is_ok());

        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(store2.resolve(&slug2, &nonce2), Err(RedeemError::Expired));
        // expired tokens are dropped on sight
        assert!(store2.is_empty());
    }

    #[tokio::test]
    async fn test_confirm_burns_token() {
        let (store, slug, nonce) = store_with("K1");

        assert_eq!(store.confirm(&slug, "guess"), Err(RedeemError::Forbidden));
        store.confirm(&slug, &nonce).unwrap();
        store.confirm(&slug, &nonce).unwrap();
        assert_eq!(store.resolve(&slug, &nonce), Err(RedeemError::AlreadyConsumed));
    }

    #[tokio::test]
    async fn test_confirm_after_resolve() {
        let (store, slug, nonce) = store_with("K1");
        store.resolve(&slug, &nonce).unwrap();
        assert!(store.confirm(&slug, &nonce).is_ok());

        store.sweep();
        assert_eq!(store.confirm(&slug, &nonce), Err(RedeemError::Expired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_is_idempotent() {
        let store = TokenStore::new(Duration::from_secs(60));
        let now = Instant::now();
        let live = RedemptionToken::mint("live".into(), TTL, now);
        let short = RedemptionToken::mint("short".into(), Duration::from_secs(1), now);
        let used = RedemptionToken::mint("used".into(), TTL, now);
        let (used_slug, used_nonce) = (used.slug().to_string(), used.nonce().to_string());
        store.insert(live);
        store.insert(short);
        store.insert(used);

        store.resolve(&used_slug, &used_nonce).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(store.sweep(), 2);
        assert_eq!(store.sweep(), 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_task_runs_and_stops() {
        let store = TokenStore::new(Duration::from_secs(60));
        store.insert(RedemptionToken::mint(
            "K1".into(),
            Duration::from_secs(30),
            Instant::now(),
        ));

        let handle = store.start_sweep_task();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(store.is_empty());

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_resolve_single_winner() {
        let (store, slug, nonce) = store_with("K1");

        let handles = (0..16)
            .map(|_| {
                let (store, slug, nonce) = (store.clone(), slug.clone(), nonce.clone());
                tokio::spawn(async move { store.resolve(&slug, &nonce).is_ok() })
            })
            .collect::<Vec<_>>();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
