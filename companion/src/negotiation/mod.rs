//! Version and capability negotiation, run raw on the transport before the
//! message stream takes over.

pub mod capabilities;
pub mod version;

use tokio::sync::mpsc;

use crate::transport::TransportEvent;

/// Waits for the next inbound frame. Returns `None` once the peer is gone.
pub(crate) async fn next_frame(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Option<Vec<u8>> {
    loop {
        match events.recv().await? {
            TransportEvent::MessageReceived(frame) => return Some(frame),
            TransportEvent::Disconnected | TransportEvent::ConnectionFailed => return None,
            TransportEvent::Connected => continue,
        }
    }
}
