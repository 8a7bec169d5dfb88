use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use companion_common::messages::OutOfBandAssociationData;

use crate::config::ConnectionConfig;
use crate::identification::{self, AdvertisedData};
use crate::oob::{BoxedOobAcceptor, OobData, OobError};
use crate::storage::{AssociatedCar, CarStore, StorageError, StorageState};
use crate::transport::TransportConnector;

use super::car::Car;
use super::pending_car::{
    AssociationError, AttemptEvent, CarHandoff, PendingCar, ReconnectionError,
};
use super::scanner::{DeviceScanner, DiscoveredDevice, ScanFilter, TransportKind};

/// Events the connection manager surfaces to its host.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A scan result matched a stored record and a reconnection attempt is
    /// starting.
    DeviceDiscovered(DiscoveredDevice),
    AssociationStart,
    /// A short authentication string the user should confirm, during a
    /// visually verified association.
    AuthStringAvailable(String),
    Associated(Car),
    AssociationFailed(AssociationError),
    Connected(Car),
    ConnectionFailed(ReconnectionError),
    Disconnected(Uuid),
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("connection manager is shut down")]
    Closed,
    #[error("another association is already in progress")]
    AssociationInProgress,
    #[error("invalid pre-association data: {0}")]
    Oob(#[from] OobError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("scanner events were already consumed")]
    ScannerUnavailable,
}

enum ManagerCommand {
    Start,
    Stop { done: oneshot::Sender<()> },
    Associate {
        device: DiscoveredDevice,
        oob_acceptor: Option<BoxedOobAcceptor>,
        pre_association: Option<OobData>,
        done: oneshot::Sender<Result<(), ManagerError>>,
    },
    NotifyVisualConfirmation,
    Disassociate {
        device_id: Uuid,
        done: oneshot::Sender<Result<bool, ManagerError>>,
    },
}

/// Owns discovery and the lifecycle of every vehicle connection.
///
/// The manager itself runs as a task with a select loop over scan results,
/// attempt outcomes, car teardowns and host commands; this handle talks to
/// it. Dropping the last handle shuts the task down and disconnects every
/// car.
pub struct ConnectionManager<S> {
    commands: mpsc::UnboundedSender<ManagerCommand>,
    events: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    store: Arc<RwLock<S>>,
}

impl<S> ConnectionManager<S>
where
    S: CarStore + Send + Sync + 'static,
{
    pub fn new<SC, TC>(
        config: ConnectionConfig,
        store: S,
        mut scanner: SC,
        connector: TC,
    ) -> Result<Self, ManagerError>
    where
        SC: DeviceScanner,
        TC: TransportConnector + Send + Sync + 'static,
    {
        let scan_events = scanner.take_events().ok_or(ManagerError::ScannerUnavailable)?;
        let store = Arc::new(RwLock::new(store));

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let (attempt_events_tx, attempt_events_rx) = mpsc::unbounded_channel();
        let (car_disconnects_tx, car_disconnects_rx) = mpsc::unbounded_channel();

        let actor = ManagerActor {
            config: Arc::new(config),
            store: Arc::clone(&store),
            scanner,
            scan_events,
            scanner_alive: true,
            connector: Arc::new(connector),
            commands: commands_rx,
            events: events_tx,
            outcomes_tx,
            outcomes: outcomes_rx,
            attempt_events_tx,
            attempt_events: attempt_events_rx,
            car_disconnects_tx,
            car_disconnects: car_disconnects_rx,
            started: false,
            cars: HashMap::new(),
            ongoing_reconnections: HashSet::new(),
            reconnection_tasks: HashMap::new(),
            association_task: None,
            visual_confirmation: None,
        };
        tokio::spawn(actor.run());

        Ok(ConnectionManager {
            commands: commands_tx,
            events: Some(events_rx),
            store,
        })
    }

    /// Event stream of the manager; can be taken exactly once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events.take()
    }

    /// Starts scanning and replays bonded peers. Also invoked when the
    /// Bluetooth adapter comes back up.
    pub fn start(&self) -> Result<(), ManagerError> {
        self.commands.send(ManagerCommand::Start).map_err(|_| ManagerError::Closed)
    }

    /// Stops scanning, cancels in-flight attempts and disconnects every car.
    /// Also invoked when the Bluetooth adapter goes down.
    pub async fn stop(&self) -> Result<(), ManagerError> {
        let (done, result) = oneshot::channel();
        self.commands
            .send(ManagerCommand::Stop { done })
            .map_err(|_| ManagerError::Closed)?;
        let _ = result.await;

        Ok(())
    }

    /// Adapter state changes map onto the lifecycle.
    pub async fn notify_bluetooth_state(&self, enabled: bool) -> Result<(), ManagerError> {
        if enabled {
            self.start()
        } else {
            self.stop().await
        }
    }

    /// Begins associating with `device`, resolved by the platform's device
    /// chooser. At most one association runs at a time.
    pub async fn associate_device(
        &self,
        device: DiscoveredDevice,
        oob_acceptor: Option<BoxedOobAcceptor>,
        pre_association: Option<&OutOfBandAssociationData>,
    ) -> Result<(), ManagerError> {
        // Reject malformed seeds before anything is spawned.
        let pre_association = pre_association.map(OobData::from_association_data).transpose()?;

        let (done, result) = oneshot::channel();
        self.commands
            .send(ManagerCommand::Associate {
                device,
                oob_acceptor,
                pre_association,
                done,
            })
            .map_err(|_| ManagerError::Closed)?;

        result.await.map_err(|_| ManagerError::Closed)?
    }

    /// Reports that the user confirmed the authentication string of the
    /// ongoing association.
    pub fn notify_visual_confirmation(&self) -> Result<(), ManagerError> {
        self.commands
            .send(ManagerCommand::NotifyVisualConfirmation)
            .map_err(|_| ManagerError::Closed)
    }

    /// Removes an association: disconnects the car if it is connected and
    /// deletes its record. Returns `false` when there was nothing to remove;
    /// a second call is a no-op.
    pub async fn disassociate(&self, device_id: Uuid) -> Result<bool, ManagerError> {
        let (done, result) = oneshot::channel();
        self.commands
            .send(ManagerCommand::Disassociate { device_id, done })
            .map_err(|_| ManagerError::Closed)?;

        result.await.map_err(|_| ManagerError::Closed)?
    }

    /// Persists a user-chosen name for an associated car.
    pub async fn rename_car(&self, device_id: Uuid, name: &str) -> Result<(), ManagerError> {
        self.store
            .write()
            .await
            .update_name(device_id, name, true)
            .await
            .map_err(ManagerError::from)
    }

    /// Lists every associated car, without secret material.
    pub async fn list_associated_cars(&self) -> Result<Vec<AssociatedCar>, ManagerError> {
        let records = self.store.read().await.load_all().await?;

        Ok(records.iter().map(|record| record.info()).collect())
    }
}

enum AttemptOutcome<L> {
    Associated(Box<Result<CarHandoff<L>, AssociationError>>),
    Reconnected {
        mac_address: String,
        result: Box<Result<CarHandoff<L>, ReconnectionError>>,
    },
}

struct ManagerActor<S, SC, TC: TransportConnector> {
    config: Arc<ConnectionConfig>,
    store: Arc<RwLock<S>>,
    scanner: SC,
    scan_events: mpsc::UnboundedReceiver<DiscoveredDevice>,
    scanner_alive: bool,
    connector: Arc<TC>,
    commands: mpsc::UnboundedReceiver<ManagerCommand>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    outcomes_tx: mpsc::UnboundedSender<AttemptOutcome<TC::Link>>,
    outcomes: mpsc::UnboundedReceiver<AttemptOutcome<TC::Link>>,
    attempt_events_tx: mpsc::UnboundedSender<AttemptEvent>,
    attempt_events: mpsc::UnboundedReceiver<AttemptEvent>,
    car_disconnects_tx: mpsc::UnboundedSender<Uuid>,
    car_disconnects: mpsc::UnboundedReceiver<Uuid>,
    started: bool,
    cars: HashMap<Uuid, Car>,
    ongoing_reconnections: HashSet<String>,
    reconnection_tasks: HashMap<String, JoinHandle<()>>,
    association_task: Option<JoinHandle<()>>,
    visual_confirmation: Option<oneshot::Sender<()>>,
}

impl<S, SC, TC> ManagerActor<S, SC, TC>
where
    S: CarStore + Send + Sync + 'static,
    SC: DeviceScanner,
    TC: TransportConnector + Send + Sync + 'static,
{
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    // The last handle is gone; tear everything down.
                    None => {
                        self.stop().await;
                        break;
                    }
                },
                device = self.scan_events.recv(), if self.started && self.scanner_alive => match device {
                    Some(device) => self.handle_discovery(device).await,
                    None => {
                        warn!("scanner event channel closed");
                        self.scanner_alive = false;
                    }
                },
                Some(outcome) = self.outcomes.recv() => self.handle_outcome(outcome),
                Some(device_id) = self.car_disconnects.recv() => {
                    self.cars.remove(&device_id);
                    let _ = self.events.send(ConnectionEvent::Disconnected(device_id));
                },
                Some(event) = self.attempt_events.recv() => match event {
                    AttemptEvent::AuthStringAvailable(code) => {
                        let _ = self.events.send(ConnectionEvent::AuthStringAvailable(code));
                    }
                    AttemptEvent::DeviceIdReceived(device_id) => {
                        debug!(%device_id, "attempt received peer device id");
                    }
                },
            }
        }
    }

    async fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Start => self.start().await,
            ManagerCommand::Stop { done } => {
                self.stop().await;
                let _ = done.send(());
            }
            ManagerCommand::Associate {
                device,
                oob_acceptor,
                pre_association,
                done,
            } => {
                let _ = done.send(self.begin_association(device, oob_acceptor, pre_association));
            }
            ManagerCommand::NotifyVisualConfirmation => {
                match self.visual_confirmation.take() {
                    Some(confirmation) => {
                        let _ = confirmation.send(());
                    }
                    None => warn!("visual confirmation without a pending association"),
                }
            }
            ManagerCommand::Disassociate { device_id, done } => {
                if let Some(car) = self.cars.remove(&device_id) {
                    car.disconnect().await;
                }

                let result = self
                    .store
                    .write()
                    .await
                    .delete(device_id)
                    .await
                    .map_err(ManagerError::from);
                let _ = done.send(result);
            }
        }
    }

    async fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        info!("connection manager starting");

        if let Err(error) = self.ensure_store_opened().await {
            warn!("could not open the car store: {error}");
        }

        let filter = ScanFilter {
            service_uuid: self.config.reconnect_service_uuid,
        };
        if let Err(error) = self.scanner.start_scan(&filter) {
            warn!("could not start scanning: {error}");
        }

        // Bonded classic-Bluetooth peers never show up in BLE scans; replay
        // them as discoveries so RFCOMM reconnections start too.
        for device in self.connector.bonded_devices().await {
            self.handle_discovery(device).await;
        }
    }

    async fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        info!("connection manager stopping");

        self.scanner.stop_scan();

        if let Some(task) = self.association_task.take() {
            task.abort();
        }
        self.visual_confirmation = None;

        for (_, task) in self.reconnection_tasks.drain() {
            task.abort();
        }
        self.ongoing_reconnections.clear();

        for (_, car) in self.cars.drain() {
            car.disconnect().await;
        }
    }

    async fn ensure_store_opened(&self) -> Result<(), StorageError> {
        let mut store = self.store.write().await;
        if store.state().await? != StorageState::Opened {
            store.open().await?;
        }

        Ok(())
    }

    fn begin_association(
        &mut self,
        device: DiscoveredDevice,
        oob_acceptor: Option<BoxedOobAcceptor>,
        pre_association: Option<OobData>,
    ) -> Result<(), ManagerError> {
        if self.association_task.is_some() {
            return Err(ManagerError::AssociationInProgress);
        }

        info!(peer = %device.mac_address, "starting association");
        let _ = self.events.send(ConnectionEvent::AssociationStart);

        let (confirmation_tx, confirmation_rx) = oneshot::channel();
        self.visual_confirmation = Some(confirmation_tx);

        let connector = Arc::clone(&self.connector);
        let config = Arc::clone(&self.config);
        let store = Arc::clone(&self.store);
        let outcomes = self.outcomes_tx.clone();
        let attempt_events = self.attempt_events_tx.clone();

        self.association_task = Some(tokio::spawn(async move {
            let result = async {
                let link = connector.open_link(&device).await?;
                let pending = PendingCar::new(link, config, attempt_events)?;

                pending
                    .associate(&device, oob_acceptor, pre_association, confirmation_rx, &store)
                    .await
            }
            .await;

            let _ = outcomes.send(AttemptOutcome::Associated(Box::new(result)));
        }));

        Ok(())
    }

    async fn handle_discovery(&mut self, device: DiscoveredDevice) {
        if self.ongoing_reconnections.contains(&device.mac_address) {
            return;
        }

        let Some((device_id, advertised)) = self.match_device(&device).await else {
            return;
        };
        if self.cars.contains_key(&device_id) {
            debug!(%device_id, "device is already connected");
            return;
        }

        let _ = self.events.send(ConnectionEvent::DeviceDiscovered(device.clone()));
        self.spawn_reconnection(device, device_id, advertised);
    }

    /// Resolves a scan result to a stored record, either through the
    /// advertised salt and truncated HMAC or by MAC address for peers that
    /// cannot advertise (bonded RFCOMM devices, allow-listed BLE proxies).
    async fn match_device(&self, device: &DiscoveredDevice) -> Option<(Uuid, Option<AdvertisedData>)> {
        match device.advertised_data.as_deref().and_then(AdvertisedData::parse) {
            Some(advertised) => {
                let keys = match self.store.read().await.load_all_identification_keys().await {
                    Ok(keys) => keys,
                    Err(error) => {
                        warn!("could not load identification keys: {error}");
                        return None;
                    }
                };

                identification::find_match(&advertised, &keys).map(|id| (id, Some(advertised)))
            }
            None => {
                if device.kind == TransportKind::BleGatt {
                    let allow_listed = device
                        .name
                        .as_ref()
                        .is_some_and(|name| self.config.allowed_proxy_names.contains(name));
                    if !allow_listed {
                        return None;
                    }
                }

                let records = match self.store.read().await.load_all().await {
                    Ok(records) => records,
                    Err(error) => {
                        warn!("could not load records for MAC matching: {error}");
                        return None;
                    }
                };

                records
                    .into_iter()
                    .find(|record| record.mac_address == device.mac_address)
                    .map(|record| (record.device_id, None))
            }
        }
    }

    fn spawn_reconnection(
        &mut self,
        device: DiscoveredDevice,
        device_id: Uuid,
        advertised: Option<AdvertisedData>,
    ) {
        self.ongoing_reconnections.insert(device.mac_address.clone());

        let connector = Arc::clone(&self.connector);
        let config = Arc::clone(&self.config);
        let store = Arc::clone(&self.store);
        let outcomes = self.outcomes_tx.clone();
        let attempt_events = self.attempt_events_tx.clone();
        let retry_delay = self.config.spp_retry_delay;
        let mac_address = device.mac_address.clone();

        let task = tokio::spawn(async move {
            let result = loop {
                let result = async {
                    let link = connector.open_link(&device).await?;
                    let pending = PendingCar::new(link, Arc::clone(&config), attempt_events.clone())?;

                    pending.reconnect(device_id, advertised, &store).await
                }
                .await;

                // An RFCOMM link to a peer that is still classic-connected
                // is worth retrying; BLE relies on the scanner re-firing.
                let transport_failure = matches!(result, Err(ReconnectionError::Transport(_)));
                if transport_failure
                    && device.kind == TransportKind::SppRfcomm
                    && connector.is_classic_connected(&device.mac_address).await
                {
                    info!(peer = %device.mac_address, "retrying RFCOMM connection");
                    time::sleep(retry_delay).await;
                    continue;
                }

                break result;
            };

            let _ = outcomes.send(AttemptOutcome::Reconnected {
                mac_address: device.mac_address.clone(),
                result: Box::new(result),
            });
        });

        self.reconnection_tasks.insert(mac_address, task);
    }

    fn handle_outcome(&mut self, outcome: AttemptOutcome<TC::Link>) {
        match outcome {
            AttemptOutcome::Associated(result) => {
                self.association_task = None;
                self.visual_confirmation = None;

                match *result {
                    Ok(handoff) if self.started => {
                        let car = handoff.into_car(self.car_disconnects_tx.clone());
                        self.cars.insert(car.device_id(), car.clone());
                        let _ = self.events.send(ConnectionEvent::Associated(car.clone()));
                        let _ = self.events.send(ConnectionEvent::Connected(car));
                    }
                    // A completion that raced the stop is discarded.
                    Ok(_) => debug!("dropping association completed after stop"),
                    Err(error) => {
                        warn!("association failed: {error}");
                        let _ = self.events.send(ConnectionEvent::AssociationFailed(error));
                    }
                }
            }
            AttemptOutcome::Reconnected { mac_address, result } => {
                self.ongoing_reconnections.remove(&mac_address);
                self.reconnection_tasks.remove(&mac_address);

                match *result {
                    Ok(handoff) if self.started => {
                        let car = handoff.into_car(self.car_disconnects_tx.clone());
                        self.cars.insert(car.device_id(), car.clone());
                        let _ = self.events.send(ConnectionEvent::Connected(car));
                    }
                    Ok(_) => debug!("dropping reconnection completed after stop"),
                    Err(error) => {
                        warn!(peer = %mac_address, "reconnection failed: {error}");
                        let _ = self.events.send(ConnectionEvent::ConnectionFailed(error));
                    }
                }
            }
        }
    }
}
