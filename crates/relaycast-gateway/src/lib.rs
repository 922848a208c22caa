//! # Relaycast Gateway
//!
//! Axum HTTP surface: the WhatsApp status webhook (verification handshake
//! and signed status deliveries) plus a small admin API for manual retries
//! and immediate dispatch.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
