//! Multi-channel realtime messaging: server, client, and the transports
//! they share.

pub mod client;
pub mod config;
pub mod server;
pub mod transport;

#[cfg(test)]
mod e2e_tests;
