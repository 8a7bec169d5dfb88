use std::time::Duration;

use uuid::Uuid;

use companion_common::messages::OobChannelType;

/// Characteristic holding the advertised reconnection data, for scanners that
/// cannot capture service data directly (`24289b40-af40-4149-a5f4-878ccff87566`).
pub const ADVERTISE_DATA_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x24289b40_af40_4149_a5f4_878ccff87566);

/// Default GATT service used for association (`5e2a68a5-27be-43f9-8d1e-4546976fabd7`).
pub const DEFAULT_ASSOCIATION_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x5e2a68a5_27be_43f9_8d1e_4546976fabd7);

/// Default service-data UUID the vehicle advertises under for reconnection
/// (`5e2a68a6-27be-43f9-8d1e-4546976fabd7`).
pub const DEFAULT_RECONNECT_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x5e2a68a6_27be_43f9_8d1e_4546976fabd7);

/// Tunables for the connection stack. Hosts override the defaults where the
/// platform requires it; tests inject short delays.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Identity this device presents during association.
    pub device_id: Uuid,
    pub association_service_uuid: Uuid,
    pub reconnect_service_uuid: Uuid,
    /// Out-of-band channel types this device can serve.
    pub supported_oob_channels: Vec<OobChannelType>,
    /// Bound on the out-of-band read during a security version 4 handshake.
    pub oob_channel_timeout: Duration,
    /// Bound on transport connect completion.
    pub connect_timeout: Duration,
    /// Delay before retrying an RFCOMM connection to a still-bonded peer.
    pub spp_retry_delay: Duration,
    /// GATT service discovery attempts, consumed by the platform transports.
    pub gatt_service_discovery_retries: u32,
    /// Outbound messages larger than this are considered for compression.
    pub compression_threshold: usize,
    /// BLE proxies that never advertise reconnection data but may be
    /// reconnected to by MAC address.
    pub allowed_proxy_names: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            device_id: Uuid::new_v4(),
            association_service_uuid: DEFAULT_ASSOCIATION_SERVICE_UUID,
            reconnect_service_uuid: DEFAULT_RECONNECT_SERVICE_UUID,
            supported_oob_channels: vec![OobChannelType::BtRfcomm, OobChannelType::PreAssociation],
            oob_channel_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(10),
            spp_retry_delay: Duration::from_secs(2),
            gatt_service_discovery_retries: 3,
            compression_threshold: 1024,
            allowed_proxy_names: Vec::new(),
        }
    }
}
