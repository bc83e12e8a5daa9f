//! staffline/crates/sl-api/src/middleware.rs Middleware
//!
//! Request logging and CORS for the operator surface.

use actix_cors::Cors;
use actix_web::middleware::Logger;

/// Access log in the default format:
/// remote-ip "request-line" status-code response-size "referrer" "user-agent"
pub fn standard_middleware() -> Logger {
    Logger::default()
}

// Operator dashboards may live on another origin.
pub fn cors_policy() -> Cors {
    Cors::default()
        .allow_any_origin()
        .allowed_methods(vec!["GET", "POST", "DELETE"])
        .allowed_headers(vec!["Content-Type", "X-Operator-Key"])
        .max_age(3600)
}
