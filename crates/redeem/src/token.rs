use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::time::Instant;

/// Random bytes in a slug: 96 bits, 16 base64url characters.
pub const SLUG_BYTES: usize = 12;
/// Random bytes in a nonce: 128 bits, 22 base64url characters.
pub const NONCE_BYTES: usize = 16;
/// Longest lifetime a token can carry. Longer TTLs are clamped.
pub const MAX_TOKEN_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Fill `len` bytes from the thread-local CSPRNG and encode them base64url.
pub(crate) fn random_secret(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compare two secrets without short-circuiting on the first differing byte.
pub(crate) fn secrets_match(presented: &str, stored: &str) -> bool {
    presented.as_bytes().ct_eq(stored.as_bytes()).into()
}

/// A single-use authorization to view one credential.
#[derive(Debug, Clone)]
pub struct RedemptionToken {
    slug: String,
    nonce: String,
    credential: String,
    created_at: Instant,
    expires_at: Instant,
    consumed: bool,
}

impl RedemptionToken {
    /// Mint a token with fresh slug and nonce, expiring `ttl` after `now`.
    pub fn mint(credential: String, ttl: Duration, now: Instant) -> Self {
        let expires_at = now.checked_add(ttl.min(MAX_TOKEN_TTL)).unwrap_or(now);
        Self {
            slug: random_secret(SLUG_BYTES),
            nonce: random_secret(NONCE_BYTES),
            credential,
            created_at: now,
            expires_at,
            consumed: false,
        }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn nonce_matches(&self, presented: &str) -> bool {
        secrets_match(presented, &self.nonce)
    }

    /// Usable iff unconsumed, unexpired and the nonce matches.
    pub fn is_usable(&self, presented: &str, now: Instant) -> bool {
        !self.consumed && !self.is_expired(now) && self.nonce_matches(presented)
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    pub(crate) fn consume(&mut self) {
        self.consumed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_clamps_ttl() {
        let now = Instant::now();
        let token = RedemptionToken::mint("K1".into(), Duration::MAX, now);
        assert_eq!(token.expires_at(), now + MAX_TOKEN_TTL);
        assert!(!token.is_expired(now));
    }

    #[test]
    fn test_secret_lengths() {
        assert_eq!(random_secret(SLUG_BYTES).len(), 16);
        assert_eq!(random_secret(NONCE_BYTES).len(), 22);
    }

    #[test]
    fn test_slug_and_nonce_are_independent() {
        let token = RedemptionToken::mint("K1".into(), Duration::from_secs(60), Instant::now());
        assert_ne!(token.slug(), token.nonce());
        assert!(
            token
                .slug()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn test_secrets_match() {
        assert!(secrets_match("abc", "abc"));
        assert!(!secrets_match("abd", "abc"));
        assert!(!secrets_match("ab", "abc"));
        assert!(!secrets_match("", "abc"));
    }

    #[test]
    fn test_usable_window() {
        let now = Instant::now();
        let mut token = RedemptionToken::mint("K1".into(), Duration::from_secs(300), now);
        let nonce = token.nonce().to_string();

        assert!(token.is_usable(&nonce, now));
        assert!(token.is_usable(&nonce, now + Duration::from_secs(299)));
        assert!(!token.is_usable(&nonce, now + Duration::from_secs(300)));
        assert!(!token.is_usable("wrong", now));
        assert_eq!(token.remaining(now), Duration::from_secs(300));

        token.consume();
        assert!(!token.is_usable(&nonce, now));
    }
}
