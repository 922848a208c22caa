//! # Relaycast Channels
//! Outbound transport implementations.

pub mod whatsapp;

pub use whatsapp::WhatsAppTransport;
