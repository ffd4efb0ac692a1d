use crate::error::RedeemError;
use crate::ledger::CredentialLedger;
use crate::sweep::{SweepHandle, spawn_periodic};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Capability check in front of the protected payload.
///
/// Independent of the redemption token lifecycle: it only asks whether a
/// presented credential was issued, is still inside its retention window and
/// belongs to the requester. The window opens on the first successful fetch.
#[derive(Debug, Clone)]
pub struct ProtectedGate {
    ledger: CredentialLedger,
    retention: chrono::Duration,
}

impl ProtectedGate {
    pub fn new(ledger: CredentialLedger, retention: Duration) -> Self {
        Self {
            ledger,
            retention: chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX),
        }
    }

    pub async fn authorize(
        &self,
        credential: Option<&str>,
        identity: Option<&str>,
    ) -> Result<(), RedeemError> {
        self.authorize_at(credential, identity, Utc::now()).await
    }

    pub(crate) async fn authorize_at(
        &self,
        credential: Option<&str>,
        identity: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), RedeemError> {
        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(RedeemError::MissingCredential)?;

        let mut ledger = self.ledger.lock().await;
        let record = ledger
            .find_mut(credential)
            .filter(|record| !record.revoked)
            .ok_or(RedeemError::UnknownCredential)?;

        if let Some(bound) = record.identity.as_deref()
            && identity != Some(bound)
        {
            warn!("Payload requested with a key bound to another identity");
            return Err(RedeemError::IdentityMismatch);
        }

        let first_fetch = record.first_fetch_at;
        match first_fetch {
            Some(first) if self.elapsed(first, now) => {
                debug!("Key retention elapsed, revoking");
                record.revoked = true;
                if let Err(error) = ledger.save().await {
                    error!(?error, "Failed to save ledger after revoking a key");
                }
                Err(RedeemError::UnknownCredential)
            }
            Some(_) => Ok(()),
            None => {
                record.first_fetch_at = Some(now);
                if let Err(error) = ledger.save().await {
                    error!(?error, "Failed to save ledger after first payload fetch");
                }
                Ok(())
            }
        }
    }

    /// Revoke every credential whose retention window has elapsed. Records
    /// without an identity are dropped; identity records stay so eligibility
    /// is never reset.
    pub async fn revoke_elapsed(&self) -> usize {
        self.revoke_elapsed_at(Utc::now()).await
    }

    pub(crate) async fn revoke_elapsed_at(&self, now: DateTime<Utc>) -> usize {
        let mut ledger = self.ledger.lock().await;

        let mut revoked = 0;
        for record in ledger.records_mut() {
            if !record.revoked && record.first_fetch_at.is_some_and(|f| self.elapsed(f, now)) {
                record.revoked = true;
                revoked += 1;
            }
        }
        let dropped = ledger.retain(|record| !(record.revoked && record.identity.is_none()));

        if revoked + dropped > 0 {
            debug!(revoked, dropped, "Revoked elapsed keys");
            if let Err(error) = ledger.save().await {
                error!(?error, "Failed to save ledger after revocation sweep");
            }
        }
        revoked
    }

    fn elapsed(&self, first_fetch: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        first_fetch
            .checked_add_signed(self.retention)
            .is_some_and(|end| now >= end)
    }

    /// Start the periodic revocation pass.
    /// This must be called from within a tokio runtime.
    pub fn start_revocation_task(&self, interval: Duration) -> SweepHandle {
        let gate = self.clone();
        spawn_periodic("key-revocation", interval, move || {
            let gate = gate.clone();
            async move {
                gate.revoke_elapsed().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::IssuedRecord;

    const RETENTION: Duration = Duration::from_secs(600);

    async fn gate_with(records: Vec<IssuedRecord>) -> ProtectedGate {
        let ledger = CredentialLedger::in_memory();
        for record in records {
            ledger.lock().await.record(record).await.unwrap();
        }
        ProtectedGate::new(ledger, RETENTION)
    }

    #[tokio::test]
    async fn test_missing_and_unknown_credentials() {
        let gate = gate_with(vec![IssuedRecord::new("K1".into(), None, Utc::now())]).await;

        assert_eq!(
            gate.authorize(None, None).await,
            Err(RedeemError::MissingCredential)
        );
        assert_eq!(
            gate.authorize(Some("  "), None).await,
            Err(RedeemError::MissingCredential)
        );
        assert_eq!(
            gate.authorize(Some("K9"), None).await,
            Err(RedeemError::UnknownCredential)
        );
        assert!(gate.authorize(Some("K1"), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_identity_binding() {
        let gate = gate_with(vec![IssuedRecord::new(
            "K1".into(),
            Some("10.0.0.1".into()),
            Utc::now(),
        )])
        .await;

        assert_eq!(
            gate.authorize(Some("K1"), Some("10.0.0.2")).await,
            Err(RedeemError::IdentityMismatch)
        );
        assert!(gate.authorize(Some("K1"), Some("10.0.0.1")).await.is_ok());
        // a bound key needs its owner
        assert_eq!(
            gate.authorize(Some("K1"), None).await,
            Err(RedeemError::IdentityMismatch)
        );
    }

    #[tokio::test]
    async fn test_retention_window_starts_on_first_fetch() {
        let issued = Utc::now() - chrono::Duration::hours(5);
        let gate = gate_with(vec![IssuedRecord::new("K1".into(), None, issued)]).await;

        let first = Utc::now();
        assert!(gate.authorize_at(Some("K1"), None, first).await.is_ok());

        let inside = first + chrono::Duration::seconds(599);
        assert!(gate.authorize_at(Some("K1"), None, inside).await.is_ok());

        let after = first + chrono::Duration::seconds(600);
        assert_eq!(
            gate.authorize_at(Some("K1"), None, after).await,
            Err(RedeemError::UnknownCredential)
        );
        // stays revoked
        assert_eq!(
            gate.authorize_at(Some("K1"), None, inside).await,
            Err(RedeemError::UnknownCredential)
        );
    }

    #[tokio::test]
    async fn test_revoke_elapsed_keeps_eligibility() {
        let gate = gate_with(vec![
            IssuedRecord::new("K1".into(), Some("u1".into()), Utc::now()),
            IssuedRecord::new("K2".into(), None, Utc::now()),
            IssuedRecord::new("K3".into(), None, Utc::now()),
        ])
        .await;

        let first = Utc::now();
        gate.authorize_at(Some("K1"), Some("u1"), first).await.unwrap();
        gate.authorize_at(Some("K2"), None, first).await.unwrap();

        let later = first + chrono::Duration::seconds(601);
        assert_eq!(gate.revoke_elapsed_at(later).await, 2);
        assert_eq!(gate.revoke_elapsed_at(later).await, 0);

        // K2 dropped, K1 kept as a revoked identity record, K3 never fetched
        assert_eq!(gate.ledger.issued_count().await, 2);
        assert!(gate.ledger.has_identity("u1").await);
        assert_eq!(
            gate.authorize_at(Some("K1"), Some("u1"), later).await,
            Err(RedeemError::UnknownCredential)
        );
        assert!(gate.authorize_at(Some("K3"), None, later).await.is_ok());
    }
}
