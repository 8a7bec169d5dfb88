use tokio::sync::mpsc;
use uuid::Uuid;

/// Transport a discovered device was seen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    BleGatt,
    SppRfcomm,
}

/// A candidate peer produced by the platform scanner or the bonded-device
/// list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub mac_address: String,
    pub name: Option<String>,
    /// Service data advertised under the reconnection UUID. Absent when the
    /// platform could not capture it, e.g. for BLE proxies; matching then
    /// falls back to the MAC address.
    pub advertised_data: Option<Vec<u8>>,
    pub kind: TransportKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    /// Service UUID the vehicle advertises under.
    pub service_uuid: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("bluetooth adapter is unavailable")]
    AdapterUnavailable,
    #[error("scan could not be started: {0}")]
    Failed(String),
}

/// Platform BLE scanner seam. Results are posted to the event channel; the
/// receiver can be taken exactly once.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceScanner: Send + Sync + 'static {
    fn start_scan(&mut self, filter: &ScanFilter) -> Result<(), ScanError>;

    fn stop_scan(&mut self);

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<DiscoveredDevice>>;
}
