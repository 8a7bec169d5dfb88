//! Trust agent for companion devices: lets a phone associate with a vehicle
//! head unit over Bluetooth transports, reconnect to it securely later, and
//! exchange encrypted application messages with it.
//!
//! The stack, bottom up:
//!
//! - [`transport`]: the byte-oriented link seam the platform implements.
//! - [`stream`]: chunking, compression and encryption of messages.
//! - [`negotiation`]: version and capability agreement with the peer.
//! - [`oob`] and [`encryption`]: the authenticated key exchange and its
//!   out-of-band verification channels.
//! - [`identification`]: reconnection matching without stable identifiers.
//! - [`storage`]: persisted associated-car records.
//! - [`connection`]: the lifecycle driving all of the above, surfacing
//!   [`Car`](connection::Car) handles through the
//!   [`ConnectionManager`](connection::ConnectionManager).
//!
//! Everything here runs on a tokio runtime; the platform Bluetooth stack,
//! keystore and scan plumbing are injected through traits.

pub mod config;
pub mod connection;
pub mod encryption;
pub mod identification;
pub mod negotiation;
pub mod oob;
pub mod storage;
pub mod stream;
pub mod transport;

pub use config::ConnectionConfig;
pub use connection::{
    Car, CarCallback, CarError, ConnectionEvent, ConnectionManager, DiscoveredDevice,
};
