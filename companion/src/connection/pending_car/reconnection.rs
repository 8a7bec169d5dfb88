use tokio::sync::RwLock;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::encryption::ResumeHandshake;
use crate::identification::{AdvertisedData, Challenge, SALT_LENGTH};
use crate::negotiation::version;
use crate::storage::CarStore;
use crate::stream::MessageStream;
use crate::transport::TransportLink;

use super::{
    advance, next_handshake_payload, send_handshake, CarHandoff, PendingCar, PendingCarState,
    ReconnectionError,
};

impl<T: TransportLink + Send + 'static> PendingCar<T> {
    /// Drives a reconnection to a previously associated vehicle: the stored
    /// session is resumed, the vehicle additionally answers a fresh
    /// identification challenge, and the refreshed resume material is
    /// persisted.
    ///
    /// On [`ReconnectionError::Encryption`] with a key mismatch the stored
    /// record is deliberately left untouched: the advertisement may have
    /// matched a different car and a later attempt can still succeed.
    #[instrument(skip_all, fields(device_id = %device_id))]
    pub async fn reconnect<S>(
        mut self,
        device_id: Uuid,
        advertised: Option<AdvertisedData>,
        store: &RwLock<S>,
    ) -> Result<CarHandoff<T>, ReconnectionError>
    where
        S: CarStore + Send + Sync,
    {
        info!("Connecting to vehicle for reconnection");
        self.connect().await?;

        info!("Negotiating protocol versions");
        let versions = version::exchange(&mut self.transport, &mut self.transport_events).await?;

        let record = store
            .read()
            .await
            .load_by_device_id(device_id)
            .await?
            .ok_or(ReconnectionError::UnknownDevice(device_id))?;

        let PendingCar {
            transport,
            transport_events,
            config,
            events: _,
            mut state,
        } = self;
        let mut stream = MessageStream::new(
            transport,
            transport_events,
            versions.message_version,
            config.compression_threshold,
        );

        info!("Resuming stored session");
        advance(&mut state, PendingCarState::EncryptionHandshake);
        let (resume, request) = ResumeHandshake::start(&record.encryption_session)?;
        send_handshake(&mut stream, request).await?;
        let response = next_handshake_payload(&mut stream).await?;
        let established = resume.handle_vehicle_response(&response)?;

        // Beyond the resume proof, the vehicle must answer a fresh challenge
        // under the identification key before the session unlocks.
        info!("Challenging vehicle identity");
        let salt = advertised.map(|data| *data.salt()).unwrap_or([0u8; SALT_LENGTH]);
        let challenge = Challenge::generate();
        let mut payload = record.identification_key.salt_response(&salt).to_vec();
        payload.extend_from_slice(challenge.as_bytes());
        send_handshake(&mut stream, payload).await?;

        let reply = next_handshake_payload(&mut stream).await?;
        if !record.identification_key.verify_challenge_response(&challenge, &reply) {
            return Err(ReconnectionError::ChallengeFailed);
        }

        stream.set_encryption_key(&established.session_key);

        info!("Persisting refreshed session material");
        store
            .write()
            .await
            .update_resume_blob(device_id, &established.resume_blob)
            .await?;

        advance(&mut state, PendingCarState::Done);
        info!("reconnection complete");

        let name = record.name.or_else(|| stream.device_name());

        Ok(CarHandoff {
            device_id,
            name,
            stream,
        })
    }
}
