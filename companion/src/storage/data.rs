use uuid::Uuid;

use crate::identification::IdentificationKey;

/// MAC address assigned to records that predate the MAC column, so they can
/// still be disambiguated by device id.
pub const MAC_ADDRESS_PLACEHOLDER: &str = "AA:BB:CC:DD:EE:FF";

/// One associated car as persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub device_id: Uuid,
    pub name: Option<String>,
    pub mac_address: String,
    /// Opaque resume material from the encryption subsystem, replaced on
    /// every successful reconnection.
    pub encryption_session: Vec<u8>,
    pub identification_key: IdentificationKey,
    /// Whether `name` was chosen by the user rather than taken from the
    /// device.
    pub user_renamed: bool,
}

impl PeerRecord {
    pub fn info(&self) -> AssociatedCar {
        AssociatedCar {
            device_id: self.device_id,
            name: self.name.clone(),
            mac_address: self.mac_address.clone(),
        }
    }
}

/// Listing entry for an associated car, without any secret material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociatedCar {
    pub device_id: Uuid,
    pub name: Option<String>,
    pub mac_address: String,
}
