//! Proxy pool management
//!
//! - [`rotator`] - Per-proxy health state and per-account selection strategies

pub mod rotator;

pub use rotator::{ProxyConfig, ProxyRotator, ProxyState};
