use axum::{body::Body, http::Request, middleware::Next, response::Response};
use tracing::{error, warn};

pub async fn log_request_errors(req: Request<Body>, next: Next) -> Response {
    // delivery links carry their nonce in the query
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    let response = next.run(req).await;
    let status = response.status();
    if status.is_client_error() {
        warn!(
            method = %method,
            path = %path,
            status = %status,
            "Client error"
        );
    } else if status.is_server_error() {
        error!(
            method = %method,
            path = %path,
            status = %status,
            "Server error"
        );
    }

    response
}
