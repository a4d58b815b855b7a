//! Transport layer for sdhook.
//!
//! Exposes the dispatcher's named operations over HTTP via axum.

pub mod http;

pub use http::{ServerConfig, serve};
