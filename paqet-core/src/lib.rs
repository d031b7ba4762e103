//! Packet-level tunneling core.
//!
//! Disguises a reliable byte-stream transport (KCP or QUIC) as ordinary
//! TCP on the wire: inbound frames matching a BPF filter are captured and
//! stripped to their payloads, outbound datagrams are wrapped in forged
//! wire-correct TCP segments with a plausible per-flow state machine.

pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod flow;
pub mod forward;
pub mod http;
pub mod logging;
pub mod packet;
pub mod pool;
pub mod proto;
pub mod server;
pub mod socks;
pub mod transport;
pub mod util;

#[cfg(test)]
mod tests;

pub use client::Client;
pub use config::Config;
pub use error::{Error, Result};
pub use packet::PacketChannel;
pub use server::Server;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
