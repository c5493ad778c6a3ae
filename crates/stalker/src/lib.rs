//! Client library for Stalker/Ministra-family IPTV middleware portals.
//!
//! Implements the session-based HTTP/JSON protocol spoken by set-top-box
//! firmware: token handshake, credential or device-ID authentication,
//! periodic keep-alive, channel catalog retrieval, and per-channel
//! short-lived link issuance. All outbound traffic goes through a resilient
//! fetch layer that sends portal-shaped browser headers, resolves redirects
//! manually, and retries edge-protection challenges with backoff.

pub mod catalog;
pub mod error;
pub mod fetch;
pub mod session;
pub mod watchdog;

mod auth;
mod models;

pub use catalog::{Channel, GenreMap, retrieve_channels};
pub use error::PortalError;
pub use fetch::{RetryPolicy, fetch, fetch_response, is_edge_challenge, is_html};
pub use session::{AuthMethod, PortalConfig, PortalSession};
pub use watchdog::spawn_watchdog;
