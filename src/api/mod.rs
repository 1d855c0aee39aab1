//! HTTP API in front of the prober.

pub mod keys;
mod response;
mod server;
mod service;

use std::net::IpAddr;

pub use response::{ApiError, ErrorType};
pub use server::ApiServer;
pub use service::{client_addr, handle, validate_target, AppState, CheckKind};

/// What the rate limit key extractors see of a request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// `<id>@<peer>` identifier echoed in responses
    pub request_id: String,
    /// Client address after proxy rewriting
    pub client_addr: IpAddr,
    /// Trimmed probe target from the request body
    pub target: String,
}
