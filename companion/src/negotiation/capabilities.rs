use tokio::sync::mpsc;
use tracing::{info, warn};

use companion_common::messages::{self, CapabilitiesExchange, OobChannelType};

use crate::transport::{TransportError, TransportEvent, TransportLink};

use super::next_frame;

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("transport failed during capability exchange: {0}")]
    Transport(#[from] TransportError),
    #[error("peer disconnected during capability exchange")]
    Disconnected,
}

/// Exchanges supported out-of-band channel types. Run during association
/// only, once the resolved security version supports out-of-band
/// verification.
///
/// A reply the peer cannot express in this build's schema is not fatal: the
/// handshake falls back to visual verification, so this returns an empty
/// list instead of an error.
pub async fn exchange<T: TransportLink>(
    transport: &mut T,
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    supported: &[OobChannelType],
) -> Result<Vec<OobChannelType>, CapabilityError> {
    let local = CapabilitiesExchange {
        supported_oob_channels: supported.to_vec(),
    };
    let encoded = match messages::to_vec(&local) {
        Ok(encoded) => encoded,
        Err(error) => {
            warn!("could not encode local capabilities: {error}");
            return Ok(Vec::new());
        }
    };

    transport.send(&encoded).await?;

    let frame = next_frame(events).await.ok_or(CapabilityError::Disconnected)?;

    match messages::from_slice::<CapabilitiesExchange>(&frame) {
        Ok(peer) => {
            info!(channels = ?peer.supported_oob_channels, "peer out-of-band capabilities");
            Ok(peer.supported_oob_channels)
        }
        Err(error) => {
            warn!("could not parse peer capabilities, continuing without out-of-band channels: {error}");
            Ok(Vec::new())
        }
    }
}

/// Channel types both sides support, in local preference order.
pub fn intersect(local: &[OobChannelType], peer: &[OobChannelType]) -> Vec<OobChannelType> {
    local
        .iter()
        .copied()
        .filter(|channel| *channel != OobChannelType::Unknown && peer.contains(channel))
        .collect()
}
