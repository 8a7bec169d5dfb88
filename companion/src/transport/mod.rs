//! Byte-oriented point-to-point transports.
//!
//! The agent never talks to the Bluetooth stack directly; platform crates
//! implement [`TransportLink`] over GATT characteristics or RFCOMM sockets
//! and the core stays transport agnostic. The [`memory`] implementation backs
//! tests and host prototyping.

pub mod framing;
pub mod memory;

use tokio::sync::mpsc;

use crate::connection::scanner::DiscoveredDevice;

/// Bytes a GATT transport must reserve out of the negotiated ATT MTU for the
/// attribute protocol header.
pub const GATT_MTU_RESERVED_BYTES: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("could not connect to peer")]
    ConnectFailed,
    #[error("connecting to peer timed out")]
    ConnectTimeout,
    #[error("transport is not connected")]
    NotConnected,
    #[error("could not write to peer: {0}")]
    Write(#[source] std::io::Error),
    #[error("frame of {size} bytes exceeds the maximum write size {max}")]
    FrameTooLarge { size: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    ConnectionFailed,
    Disconnected,
    MessageReceived(Vec<u8>),
}

/// A point-to-point channel to one peer.
///
/// `send` is one-in-flight: it resolves once the platform reports the write
/// complete, and callers must not issue another send before that. Everything
/// the link observes is posted as a [`TransportEvent`]; the receiver can be
/// taken exactly once.
#[trait_variant::make(TransportLink: Send)]
pub trait LocalTransportLink: Sync {
    async fn connect(&mut self) -> Result<(), TransportError>;

    async fn disconnect(&mut self);

    async fn send(&mut self, message: &[u8]) -> Result<(), TransportError>;

    /// Largest frame `send` accepts, e.g. ATT MTU minus
    /// [`GATT_MTU_RESERVED_BYTES`] for GATT links.
    fn max_write_size(&self) -> usize;

    fn device_name(&self) -> Option<String>;

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;
}

/// Opens transports to discovered devices. Implemented by the platform
/// Bluetooth layer; one connector serves one transport kind.
#[trait_variant::make(TransportConnector: Send)]
pub trait LocalTransportConnector {
    type Link: TransportLink + Send + Sync + 'static;

    async fn open_link(&self, device: &DiscoveredDevice) -> Result<Self::Link, TransportError>;

    /// Whether the peer still has a classic Bluetooth connection up. Gates
    /// the RFCOMM retry-after-failure behaviour.
    async fn is_classic_connected(&self, mac_address: &str) -> bool;

    /// Peers bonded at the platform level, replayed on lifecycle start so
    /// RFCOMM reconnections do not depend on a BLE advertisement.
    async fn bonded_devices(&self) -> Vec<DiscoveredDevice>;
}
