//! HTTP surface of the relay.
//!
//! - [`routes`]: Shared state, router assembly, banner, health and 404
//! - [`middleware`]: Security headers, CORS and the panic responder
//! - [`chat`]: Model list, completion relay and history placeholders
//! - [`profile`]: Profile read/update through the identity provider
//! - [`validation`]: Chat request checking and sanitisation
//! - [`extract`]: JSON-or-form body extractor
//! - [`streaming`]: SSE framing of completion fragments

pub mod chat;
pub mod extract;
pub mod middleware;
pub mod profile;
pub mod routes;
pub mod streaming;
pub mod validation;

use chrono::{SecondsFormat, Utc};

/// Current time as an RFC 3339 string with millisecond precision.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
