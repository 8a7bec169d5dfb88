//! Connection lifecycle: discovery, association, reconnection and the
//! per-car session facade.

pub mod car;
pub mod manager;
pub mod pending_car;
pub mod scanner;

pub use car::{
    Car, CarCallback, CarError, QueryResponseEvent, ReceivedQuery, DEFAULT_FEATURE_ID,
    INVALID_QUERY_ID,
};
pub use manager::{ConnectionEvent, ConnectionManager, ManagerError};
pub use pending_car::{
    AssociationError, AttemptEvent, CarHandoff, PendingCar, PendingCarState, ReconnectionError,
};
pub use scanner::{DeviceScanner, DiscoveredDevice, ScanError, ScanFilter, TransportKind};
