use crate::config::Eligibility;
use axum::http::HeaderMap;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;

pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// What a handler knows about the caller.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub headers: &'a HeaderMap,
    pub peer: Option<SocketAddr>,
    /// `account` query parameter, when present
    pub account: Option<&'a str>,
}

/// Derives the identity that eligibility and the payload gate key on.
pub trait IdentityExtractor: Send + Sync + Debug {
    fn identify(&self, request: &RequestContext<'_>) -> Option<String>;

    /// Whether every caller is limited to one key.
    fn one_per_identity(&self) -> bool {
        true
    }
}

/// No per-caller limit. Callers stay anonymous.
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

impl IdentityExtractor for Anonymous {
    fn identify(&self, _request: &RequestContext<'_>) -> Option<String> {
        None
    }

    fn one_per_identity(&self) -> bool {
        false
    }
}

/// The client IP address. With `trust_forwarded_for` the first hop of
/// X-Forwarded-For wins over the socket peer.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientAddress {
    pub trust_forwarded_for: bool,
}

impl IdentityExtractor for ClientAddress {
    fn identify(&self, request: &RequestContext<'_>) -> Option<String> {
        if self.trust_forwarded_for
            && let Some(forwarded) = forwarded_client(request.headers)
        {
            return Some(forwarded);
        }
        request.peer.map(|peer| peer.ip().to_string())
    }
}

/// An account id supplied by an upstream login flow.
#[derive(Debug, Default, Clone, Copy)]
pub struct AccountId;

impl IdentityExtractor for AccountId {
    fn identify(&self, request: &RequestContext<'_>) -> Option<String> {
        request
            .account
            .map(str::trim)
            .filter(|account| !account.is_empty())
            .map(str::to_string)
    }
}

pub fn from_eligibility(
    eligibility: Eligibility,
    trust_forwarded_for: bool,
) -> Arc<dyn IdentityExtractor> {
    match eligibility {
        Eligibility::Off => Arc::new(Anonymous),
        Eligibility::Address => Arc::new(ClientAddress {
            trust_forwarded_for,
        }),
        Eligibility::Account => Arc::new(AccountId),
    }
}

fn forwarded_client(headers: &HeaderMap) -> Option<String> {
    headers
        .get(FORWARDED_FOR_HEADER)?
        .to_str()
        .ok()?
        .split(',')
        .next()
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .map(str::to_string)
}
