pub mod middleware;
pub mod routes;

// Re-export public types and functions
pub use middleware::log_request_errors;
pub use routes::{
    ACCESS_KEY_HEADER, ConsumeRequest, DeliveryResponse, StatsResponse, consume_key, deliver_key,
    not_found, request_key, serve_payload, stats,
};
