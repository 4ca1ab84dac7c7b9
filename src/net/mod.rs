//! Networking: wire framing, message envelopes, connection actors and listeners

pub mod client;
pub mod framing;
pub mod protocol;
pub mod tls;
pub mod transport;
