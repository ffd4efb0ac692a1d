pub mod audit;
pub mod broker;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod pool;
pub mod store;
pub mod sweep;
pub mod token;

// Re-export public types and functions
pub use audit::{AuditEvent, AuditSink, LogAuditSink};
pub use broker::{AccessGrant, DEFAULT_TOKEN_TTL, DELIVERY_PREFIX, RedemptionBroker};
pub use error::{LINK_GONE_MESSAGE, RedeemError};
pub use gate::ProtectedGate;
pub use ledger::{CredentialLedger, IssuedRecord};
pub use pool::KeyPool;
pub use store::{Delivery, TokenStore};
pub use sweep::SweepHandle;
pub use token::{MAX_TOKEN_TTL, RedemptionToken};
