//! End-to-end protocol scenarios against a scripted head unit.

mod support;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::timeout;
use uuid::Uuid;

use companion::config::ConnectionConfig;
use companion::connection::{
    AssociationError, AttemptEvent, ConnectionEvent, ConnectionManager, DiscoveredDevice,
    PendingCar, ReconnectionError, TransportKind, DEFAULT_FEATURE_ID,
};
use companion::encryption::EncryptionError;
use companion::identification::{find_match, AdvertisedData, IdentificationKey};
use companion::negotiation::version::MessageVersion;
use companion::oob::{BoxedOobAcceptor, OobData};
use companion::storage::{CarStore, DatabaseStorage, PeerRecord, SqliteUrl};
use companion::stream::StreamEvent;
use companion::transport::memory::MemoryTransportLink;
use companion_common::messages::OobChannelType;
use platform_support::keystore::software::SoftwareEncryptionKey;

use support::{
    resume_blob, run_vehicle_association, run_vehicle_reconnection, vehicle_versions,
    ChannelScanner, ReconnectionOptions, TestConnector, VehicleOobData, VehicleOptions,
    VehicleVerification,
};

const TEST_MTU: usize = 256;

type TestStore = DatabaseStorage<SoftwareEncryptionKey>;

async fn open_store() -> TestStore {
    let mut store = TestStore::new(SqliteUrl::InMemory).expect("could not create store");
    store.open().await.expect("could not open store");

    store
}

fn test_device(mac: &str) -> DiscoveredDevice {
    DiscoveredDevice {
        mac_address: mac.to_string(),
        name: Some("Garage Car".to_string()),
        advertised_data: None,
        kind: TransportKind::BleGatt,
    }
}

fn pending_car(
    link: MemoryTransportLink,
    config: Arc<ConnectionConfig>,
) -> (PendingCar<MemoryTransportLink>, mpsc::UnboundedReceiver<AttemptEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let pending = PendingCar::new(link, config, events_tx).expect("could not create attempt");

    (pending, events_rx)
}

#[tokio::test]
async fn test_first_time_association_v2_visual_pin() {
    let vehicle_device_id = Uuid::new_v4();
    let phone_device_id = Uuid::new_v4();

    let mut config = ConnectionConfig::default();
    config.device_id = phone_device_id;

    let (phone_link, vehicle_link) = MemoryTransportLink::pair(TEST_MTU);
    let store = RwLock::new(open_store().await);

    // The vehicle only speaks security version 2, so the resolved pair is
    // message 3 / security 2 and the code is accepted silently.
    let vehicle = tokio::spawn(run_vehicle_association(
        vehicle_link,
        VehicleOptions {
            version_reply: vehicle_versions(2, 3, 2, 2),
            capability_reply: None,
            message_version: MessageVersion::V3,
            verification: VehicleVerification::Silent,
            device_id: vehicle_device_id,
        },
    ));

    let (pending, mut attempt_events) = pending_car(phone_link, Arc::new(config));
    let (_confirm_tx, confirm_rx) = oneshot::channel();
    let handoff = pending
        .associate(
            &test_device("AA:BB:CC:00:00:01"),
            None::<BoxedOobAcceptor>,
            None,
            confirm_rx,
            &store,
        )
        .await
        .expect("association should succeed");

    let outcome = vehicle.await.unwrap();

    // Both sides agree on who is who.
    assert_eq!(handoff.device_id, vehicle_device_id);
    assert_eq!(outcome.phone_device_id, phone_device_id);
    assert_eq!(
        attempt_events.recv().await,
        Some(AttemptEvent::DeviceIdReceived(vehicle_device_id))
    );

    // The stored record carries the generated identification key.
    let record = store
        .read()
        .await
        .load_by_device_id(vehicle_device_id)
        .await
        .unwrap()
        .expect("record should exist after association");
    assert_eq!(record.mac_address, "AA:BB:CC:00:00:01");
    assert_eq!(record.identification_key.as_bytes(), &outcome.phone_identification_key);
    assert_eq!(record.encryption_session, resume_blob(outcome.keys.resume_secret));

    // The handed-off stream carries application traffic both ways.
    let (disconnects_tx, _disconnects_rx) = mpsc::unbounded_channel();
    let car = handoff.into_car(disconnects_tx);
    let mut vehicle_stream = outcome.stream;

    car.send_message(b"first message".to_vec(), DEFAULT_FEATURE_ID)
        .await
        .expect("send should succeed");
    match vehicle_stream.next_event().await.unwrap() {
        StreamEvent::MessageReceived(message) => assert_eq!(message.payload, b"first message"),
        other => panic!("expected message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_association_v3_prefers_oob_tokens() {
    let key = [0xABu8; 16];
    let phone_iv = [0x01u8; 12];
    let vehicle_iv = [0x02u8; 12];

    let (phone_link, vehicle_link) = MemoryTransportLink::pair(TEST_MTU);
    let store = RwLock::new(open_store().await);

    let vehicle = tokio::spawn(run_vehicle_association(
        vehicle_link,
        VehicleOptions {
            version_reply: vehicle_versions(2, 3, 2, 3),
            capability_reply: Some(vec![OobChannelType::PreAssociation]),
            message_version: MessageVersion::V3,
            verification: VehicleVerification::OobV3(VehicleOobData {
                key,
                vehicle_iv,
                phone_iv,
            }),
            device_id: Uuid::new_v4(),
        },
    ));

    let (pending, mut attempt_events) = pending_car(phone_link, Arc::new(ConnectionConfig::default()));
    let (_confirm_tx, confirm_rx) = oneshot::channel();
    let oob_data = OobData::new(key, phone_iv, vehicle_iv).unwrap();

    pending
        .associate(
            &test_device("AA:BB:CC:00:00:03"),
            None::<BoxedOobAcceptor>,
            Some(oob_data),
            confirm_rx,
            &store,
        )
        .await
        .expect("association should succeed");
    vehicle.await.unwrap();

    // The whole flow ran without surfacing a PIN.
    while let Ok(event) = attempt_events.try_recv() {
        assert_matches!(event, AttemptEvent::DeviceIdReceived(_));
    }
}

#[tokio::test]
async fn test_association_v3_visual_fallback_requires_confirmation() {
    let (phone_link, vehicle_link) = MemoryTransportLink::pair(TEST_MTU);
    let store = RwLock::new(open_store().await);

    // The vehicle offers no out-of-band channels, forcing the visual path.
    let vehicle = tokio::spawn(run_vehicle_association(
        vehicle_link,
        VehicleOptions {
            version_reply: vehicle_versions(2, 3, 2, 3),
            capability_reply: Some(Vec::new()),
            message_version: MessageVersion::V3,
            verification: VehicleVerification::VisualV3,
            device_id: Uuid::new_v4(),
        },
    ));

    let (pending, mut attempt_events) = pending_car(phone_link, Arc::new(ConnectionConfig::default()));
    let (confirm_tx, confirm_rx) = oneshot::channel();

    // Confirm as soon as the authentication string shows up.
    let confirmer = tokio::spawn(async move {
        loop {
            match attempt_events.recv().await.expect("attempt events closed") {
                AttemptEvent::AuthStringAvailable(code) => {
                    assert_eq!(code.len(), 6);
                    confirm_tx.send(()).unwrap();
                    return;
                }
                AttemptEvent::DeviceIdReceived(_) => continue,
            }
        }
    });

    pending
        .associate(
            &test_device("AA:BB:CC:00:00:04"),
            None::<BoxedOobAcceptor>,
            None,
            confirm_rx,
            &store,
        )
        .await
        .expect("association should succeed");

    vehicle.await.unwrap();
    confirmer.await.unwrap();
}

#[tokio::test]
async fn test_association_v4_with_seeded_oob_data() {
    // Deterministic out-of-band material.
    let key: [u8; 16] = core::array::from_fn(|i| i as u8);
    let phone_iv: [u8; 12] = core::array::from_fn(|i| i as u8);
    let vehicle_iv: [u8; 12] = core::array::from_fn(|i| 0x10 + i as u8);

    let (phone_link, vehicle_link) = MemoryTransportLink::pair(TEST_MTU);
    let store = RwLock::new(open_store().await);

    let vehicle = tokio::spawn(run_vehicle_association(
        vehicle_link,
        VehicleOptions {
            version_reply: vehicle_versions(2, 3, 2, 4),
            capability_reply: Some(vec![OobChannelType::PreAssociation]),
            message_version: MessageVersion::V3,
            verification: VehicleVerification::OobV4(VehicleOobData {
                key,
                vehicle_iv,
                phone_iv,
            }),
            device_id: Uuid::new_v4(),
        },
    ));

    let (pending, mut attempt_events) = pending_car(phone_link, Arc::new(ConnectionConfig::default()));
    let (_confirm_tx, confirm_rx) = oneshot::channel();

    let handoff = pending
        .associate(
            &test_device("AA:BB:CC:00:00:05"),
            None::<BoxedOobAcceptor>,
            Some(OobData::new(key, phone_iv, vehicle_iv).unwrap()),
            confirm_rx,
            &store,
        )
        .await
        .expect("association should succeed");
    vehicle.await.unwrap();

    assert!(store
        .read()
        .await
        .load_by_device_id(handoff.device_id)
        .await
        .unwrap()
        .is_some());

    // No PIN was surfaced to the user at any point.
    while let Ok(event) = attempt_events.try_recv() {
        assert_matches!(event, AttemptEvent::DeviceIdReceived(_));
    }
}

#[tokio::test]
async fn test_association_v4_visual() {
    let (phone_link, vehicle_link) = MemoryTransportLink::pair(TEST_MTU);
    let store = RwLock::new(open_store().await);

    let vehicle = tokio::spawn(run_vehicle_association(
        vehicle_link,
        VehicleOptions {
            version_reply: vehicle_versions(2, 3, 2, 4),
            capability_reply: Some(Vec::new()),
            message_version: MessageVersion::V3,
            verification: VehicleVerification::VisualV4,
            device_id: Uuid::new_v4(),
        },
    ));

    let (pending, mut attempt_events) = pending_car(phone_link, Arc::new(ConnectionConfig::default()));
    let (_confirm_tx, confirm_rx) = oneshot::channel();

    // The vehicle confirms on its own screen; the phone only displays the
    // code.
    pending
        .associate(
            &test_device("AA:BB:CC:00:00:06"),
            None::<BoxedOobAcceptor>,
            None,
            confirm_rx,
            &store,
        )
        .await
        .expect("association should succeed");
    vehicle.await.unwrap();

    let mut saw_auth_string = false;
    while let Ok(event) = attempt_events.try_recv() {
        if let AttemptEvent::AuthStringAvailable(code) = event {
            assert_eq!(code.len(), 6);
            saw_auth_string = true;
        }
    }
    assert!(saw_auth_string, "the visual code must be surfaced");
}

#[tokio::test]
async fn test_incompatible_versions_fail_association() {
    let (phone_link, vehicle_link) = MemoryTransportLink::pair(TEST_MTU);
    let store = RwLock::new(open_store().await);

    // A version 1 only peer cannot be negotiated with; the vehicle side just
    // answers the version exchange and stops.
    let vehicle = tokio::spawn(async move {
        let mut link = vehicle_link;
        use companion::transport::{TransportEvent, TransportLink};
        use companion_common::messages;

        let mut events = link.take_events().unwrap();
        link.connect().await.unwrap();
        loop {
            match events.recv().await.unwrap() {
                TransportEvent::MessageReceived(_) => break,
                _ => continue,
            }
        }
        link.send(&messages::to_vec(&vehicle_versions(1, 1, 1, 1)).unwrap())
            .await
            .unwrap();
    });

    let (pending, _attempt_events) = pending_car(phone_link, Arc::new(ConnectionConfig::default()));
    let (_confirm_tx, confirm_rx) = oneshot::channel();

    let error = pending
        .associate(
            &test_device("AA:BB:CC:00:00:07"),
            None::<BoxedOobAcceptor>,
            None,
            confirm_rx,
            &store,
        )
        .await
        .expect_err("association should fail");

    assert_matches!(error, AssociationError::Version(_));
    vehicle.await.unwrap();
}

#[tokio::test]
async fn test_reconnection_advertisement_matching() {
    // An all-zero identification key and a known salt give a deterministic
    // advertisement.
    let key = IdentificationKey::from_bytes([0u8; 32]);
    let salt = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

    let advertised = AdvertisedData::advertise(&key, salt);
    let bytes = advertised.to_bytes();

    // 3 bytes of truncated HMAC followed by the salt.
    let expected_hmac = support::hmac_sha256(
        &[0u8; 32],
        &[&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0, 0, 0, 0, 0, 0, 0, 0]],
    );
    assert_eq!(&bytes[..3], &expected_hmac[..3]);
    assert_eq!(&bytes[3..], &salt);

    let device_id = Uuid::new_v4();
    let records = vec![
        (Uuid::new_v4(), IdentificationKey::from_bytes([0xFFu8; 32])),
        (device_id, key),
    ];

    let parsed = AdvertisedData::parse(&bytes).unwrap();
    assert_eq!(find_match(&parsed, &records), Some(device_id));
}

#[tokio::test]
async fn test_reconnection_round_trip() {
    let device_id = Uuid::new_v4();
    let identification_key = IdentificationKey::generate();
    let resume_secret = [0x5Au8; 32];

    let store = open_store().await;
    store
        .insert_or_replace(PeerRecord {
            device_id,
            name: Some("Garage Car".to_string()),
            mac_address: "AA:BB:CC:11:22:33".to_string(),
            encryption_session: resume_blob(resume_secret),
            identification_key: identification_key.clone(),
            user_renamed: false,
        })
        .await
        .unwrap();
    let store = RwLock::new(store);

    let (phone_link, vehicle_link) = MemoryTransportLink::pair(TEST_MTU);
    let vehicle = tokio::spawn(run_vehicle_reconnection(
        vehicle_link,
        ReconnectionOptions {
            version_reply: vehicle_versions(2, 3, 2, 4),
            message_version: MessageVersion::V3,
            resume_secret,
            identification_key: *identification_key.as_bytes(),
            verify_phone_proof: true,
        },
    ));

    let advertised = AdvertisedData::advertise(&identification_key, [7u8; 8]);
    let (pending, _attempt_events) = pending_car(phone_link, Arc::new(ConnectionConfig::default()));
    let handoff = pending
        .reconnect(device_id, Some(advertised), &store)
        .await
        .expect("reconnection should succeed");
    let outcome = vehicle.await.unwrap();

    assert_eq!(handoff.device_id, device_id);

    // The stored resume material was rotated to the next secret.
    let blob = store
        .read()
        .await
        .load_resume_blob(device_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(blob, resume_blob(outcome.next_resume_secret));
    assert_ne!(blob, resume_blob(resume_secret));

    // Fresh session keys protect application traffic.
    let (disconnects_tx, _disconnects_rx) = mpsc::unbounded_channel();
    let car = handoff.into_car(disconnects_tx);
    let mut vehicle_stream = outcome.stream;

    car.send_message(b"back again".to_vec(), DEFAULT_FEATURE_ID).await.unwrap();
    match vehicle_stream.next_event().await.unwrap() {
        StreamEvent::MessageReceived(message) => assert_eq!(message.payload, b"back again"),
        other => panic!("expected message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reconnection_key_mismatch_keeps_stored_record() {
    let device_id = Uuid::new_v4();
    let identification_key = IdentificationKey::generate();
    let stored_blob = resume_blob([0x11u8; 32]);

    let store = open_store().await;
    store
        .insert_or_replace(PeerRecord {
            device_id,
            name: None,
            mac_address: "AA:BB:CC:11:22:44".to_string(),
            encryption_session: stored_blob.clone(),
            identification_key: identification_key.clone(),
            user_renamed: false,
        })
        .await
        .unwrap();
    let store = RwLock::new(store);

    let (phone_link, vehicle_link) = MemoryTransportLink::pair(TEST_MTU);

    // The vehicle resumes from a different secret, so its proof cannot
    // verify.
    let vehicle = tokio::spawn(run_vehicle_reconnection(
        vehicle_link,
        ReconnectionOptions {
            version_reply: vehicle_versions(2, 3, 2, 4),
            message_version: MessageVersion::V3,
            resume_secret: [0x22u8; 32],
            identification_key: *identification_key.as_bytes(),
            verify_phone_proof: false,
        },
    ));

    let (pending, _attempt_events) = pending_car(phone_link, Arc::new(ConnectionConfig::default()));
    let error = pending
        .reconnect(device_id, None, &store)
        .await
        .expect_err("reconnection should fail");

    assert_matches!(
        error,
        ReconnectionError::Encryption(EncryptionError::SessionKeyMismatch)
    );
    vehicle.abort();

    // The record is kept: the advertisement may have matched another car.
    let blob = store
        .read()
        .await
        .load_resume_blob(device_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(blob, stored_blob);
}

#[tokio::test]
async fn test_manager_reconnects_on_matching_advertisement() {
    let device_id = Uuid::new_v4();
    let identification_key = IdentificationKey::generate();
    let resume_secret = [0x77u8; 32];
    let mac = "AA:BB:CC:11:22:55";

    let store = open_store().await;
    store
        .insert_or_replace(PeerRecord {
            device_id,
            name: Some("Garage Car".to_string()),
            mac_address: mac.to_string(),
            encryption_session: resume_blob(resume_secret),
            identification_key: identification_key.clone(),
            user_renamed: false,
        })
        .await
        .unwrap();

    let (scanner, scan_tx) = ChannelScanner::new();
    let connector = TestConnector::default();

    let (phone_link, vehicle_link) = MemoryTransportLink::pair(TEST_MTU);
    connector.add_link(mac, phone_link);
    let vehicle = tokio::spawn(run_vehicle_reconnection(
        vehicle_link,
        ReconnectionOptions {
            version_reply: vehicle_versions(2, 3, 2, 4),
            message_version: MessageVersion::V3,
            resume_secret,
            identification_key: *identification_key.as_bytes(),
            verify_phone_proof: true,
        },
    ));

    let mut manager =
        ConnectionManager::new(ConnectionConfig::default(), store, scanner, connector.clone()).unwrap();
    let mut events = manager.take_events().unwrap();
    manager.start().unwrap();

    scan_tx
        .send(DiscoveredDevice {
            mac_address: mac.to_string(),
            name: None,
            advertised_data: Some(
                AdvertisedData::advertise(&identification_key, [3u8; 8]).to_bytes().to_vec(),
            ),
            kind: TransportKind::BleGatt,
        })
        .unwrap();

    assert_matches!(
        timeout(Duration::from_secs(5), events.recv()).await.unwrap(),
        Some(ConnectionEvent::DeviceDiscovered(_))
    );
    let car = match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
        Some(ConnectionEvent::Connected(car)) => car,
        other => panic!("expected Connected, got {other:?}"),
    };
    assert_eq!(car.device_id(), device_id);
    assert_eq!(car.name(), Some("Garage Car"));

    // Application traffic flows through the managed car.
    let outcome = vehicle.await.unwrap();
    let mut vehicle_stream = outcome.stream;
    car.send_message(b"manager routed".to_vec(), DEFAULT_FEATURE_ID).await.unwrap();
    match vehicle_stream.next_event().await.unwrap() {
        StreamEvent::MessageReceived(message) => assert_eq!(message.payload, b"manager routed"),
        other => panic!("expected message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_manager_association_v3_visual_flow() {
    let vehicle_device_id = Uuid::new_v4();
    let mac = "AA:BB:CC:11:22:66";

    let (scanner, _scan_tx) = ChannelScanner::new();
    let connector = TestConnector::default();

    let (phone_link, vehicle_link) = MemoryTransportLink::pair(TEST_MTU);
    connector.add_link(mac, phone_link);
    let vehicle = tokio::spawn(run_vehicle_association(
        vehicle_link,
        VehicleOptions {
            version_reply: vehicle_versions(2, 3, 2, 3),
            capability_reply: Some(Vec::new()),
            message_version: MessageVersion::V3,
            verification: VehicleVerification::VisualV3,
            device_id: vehicle_device_id,
        },
    ));

    let mut manager = ConnectionManager::new(
        ConnectionConfig::default(),
        open_store().await,
        scanner,
        connector.clone(),
    )
    .unwrap();
    let mut events = manager.take_events().unwrap();
    manager.start().unwrap();

    manager
        .associate_device(test_device(mac), None, None)
        .await
        .expect("association request should be accepted");

    assert_matches!(
        timeout(Duration::from_secs(5), events.recv()).await.unwrap(),
        Some(ConnectionEvent::AssociationStart)
    );

    // The user confirms the surfaced code.
    match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
        Some(ConnectionEvent::AuthStringAvailable(code)) => assert_eq!(code.len(), 6),
        other => panic!("expected AuthStringAvailable, got {other:?}"),
    }
    manager.notify_visual_confirmation().unwrap();

    let car = match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
        Some(ConnectionEvent::Associated(car)) => car,
        other => panic!("expected Associated, got {other:?}"),
    };
    assert_eq!(car.device_id(), vehicle_device_id);
    assert_matches!(
        timeout(Duration::from_secs(5), events.recv()).await.unwrap(),
        Some(ConnectionEvent::Connected(_))
    );

    vehicle.await.unwrap();

    // The new record is immediately listable.
    let cars = manager.list_associated_cars().await.unwrap();
    assert_eq!(cars.len(), 1);
    assert_eq!(cars[0].device_id, vehicle_device_id);
    assert_eq!(cars[0].mac_address, mac);
}
