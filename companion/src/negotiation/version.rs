use tokio::sync::mpsc;
use tracing::{debug, info};

use companion_common::messages::{self, CodecError, VersionExchange};

use crate::transport::{TransportError, TransportEvent, TransportLink};

use super::next_frame;

pub const MIN_MESSAGE_VERSION: u32 = 2;
pub const MAX_MESSAGE_VERSION: u32 = 3;
pub const MIN_SECURITY_VERSION: u32 = 2;
pub const MAX_SECURITY_VERSION: u32 = 4;

/// Message stream wire format version. Version 1 peers are not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageVersion {
    V2,
    V3,
}

impl MessageVersion {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            2 => Some(MessageVersion::V2),
            3 => Some(MessageVersion::V3),
            _ => None,
        }
    }

    /// Payload compression was introduced with version 3.
    pub fn supports_compression(self) -> bool {
        self >= MessageVersion::V3
    }
}

/// Encryption handshake generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityVersion {
    V2,
    V3,
    V4,
}

impl SecurityVersion {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            2 => Some(SecurityVersion::V2),
            3 => Some(SecurityVersion::V3),
            4 => Some(SecurityVersion::V4),
            _ => None,
        }
    }

    /// Out-of-band verification arrived with security version 3.
    pub fn supports_oob(self) -> bool {
        self >= SecurityVersion::V3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedVersions {
    pub message_version: MessageVersion,
    pub security_version: SecurityVersion,
}

#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error("no common message version with peer range {peer_min}..={peer_max}")]
    IncompatibleMessageVersion { peer_min: u32, peer_max: u32 },
    #[error("no common security version with peer range {peer_min}..={peer_max}")]
    IncompatibleSecurityVersion { peer_min: u32, peer_max: u32 },
    #[error("could not encode or decode version exchange: {0}")]
    Codec(#[from] CodecError),
    #[error("transport failed during version exchange: {0}")]
    Transport(#[from] TransportError),
    #[error("peer disconnected during version exchange")]
    Disconnected,
}

fn local_version_exchange() -> VersionExchange {
    VersionExchange {
        min_message_version: MIN_MESSAGE_VERSION,
        max_message_version: MAX_MESSAGE_VERSION,
        min_security_version: MIN_SECURITY_VERSION,
        max_security_version: MAX_SECURITY_VERSION,
    }
}

/// Resolves one version dimension to the top of the window intersection.
fn resolve_range(
    local_min: u32,
    local_max: u32,
    peer_min: u32,
    peer_max: u32,
) -> Option<u32> {
    let min = local_min.max(peer_min);
    let max = local_max.min(peer_max);

    (min <= max).then_some(max)
}

pub fn resolve(local: &VersionExchange, peer: &VersionExchange) -> Result<ResolvedVersions, VersionError> {
    let message_version = resolve_range(
        local.min_message_version,
        local.max_message_version,
        peer.min_message_version,
        peer.max_message_version,
    )
    .and_then(MessageVersion::from_u32)
    .ok_or(VersionError::IncompatibleMessageVersion {
        peer_min: peer.min_message_version,
        peer_max: peer.max_message_version,
    })?;

    let security_version = resolve_range(
        local.min_security_version,
        local.max_security_version,
        peer.min_security_version,
        peer.max_security_version,
    )
    .and_then(SecurityVersion::from_u32)
    .ok_or(VersionError::IncompatibleSecurityVersion {
        peer_min: peer.min_security_version,
        peer_max: peer.max_security_version,
    })?;

    Ok(ResolvedVersions {
        message_version,
        security_version,
    })
}

/// Runs the version exchange. The mobile side sends first and awaits the
/// peer's ranges.
pub async fn exchange<T: TransportLink>(
    transport: &mut T,
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
) -> Result<ResolvedVersions, VersionError> {
    let local = local_version_exchange();
    transport.send(&messages::to_vec(&local)?).await?;

    let frame = next_frame(events).await.ok_or(VersionError::Disconnected)?;
    let peer: VersionExchange = messages::from_slice(&frame)?;
    debug!(?peer, "received peer versions");

    let resolved = resolve(&local, &peer)?;
    info!(?resolved, "resolved protocol versions");

    Ok(resolved)
}
