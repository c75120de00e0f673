//! Helpdesk API - HTTP surface of the email pipeline
//!
//! Webhook intake, manual channel sync, outbound sending, the OAuth2
//! consent flow, signed attachment downloads, health and metrics.

pub mod auth;
pub mod handlers;
pub mod routes;

#[cfg(test)]
mod test_support;

pub use auth::AppState;
pub use routes::create_router;
