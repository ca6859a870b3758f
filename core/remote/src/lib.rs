//! Remote API abstraction for notesync.
//!
//! This module provides a trait-based interface over the notes backend's
//! REST surface, so the sync engine never talks HTTP directly.
//!
//! # Design Principles
//! - One method per endpoint the engine consumes
//! - Unified error semantics: transport failures are `Error::Network`,
//!   404 is `Error::NotFound`, other statuses are `Error::Api`
//! - Payloads stay opaque `serde_json::Value`s

pub mod api;
pub mod http;
pub mod memory;

pub use api::RemoteApi;
pub use http::{HttpApi, RemoteConfig};
pub use memory::MemoryApi;
