//! Out-of-band key material and the channels that deliver it.
//!
//! During association the vehicle can hand the phone a symmetric key through
//! a channel different from the one being secured: an RFCOMM socket, or data
//! seeded before association (QR code, NFC). Possession of that key replaces
//! the visual PIN comparison.

pub mod uri;

use std::fmt;
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::io::AsyncRead;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use companion_common::messages::{OobChannelType, OutOfBandAssociationData};

use crate::transport::framing;

/// Wire length of out-of-band key material: two 12-byte IVs and a 16-byte key.
pub const OOB_DATA_LENGTH_BYTES: usize = 40;

const KEY_LENGTH: usize = 16;
const IV_LENGTH: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum OobError {
    #[error("out-of-band data must be {OOB_DATA_LENGTH_BYTES} bytes")]
    InvalidLength,
    #[error("out-of-band IVs must differ")]
    IdenticalIvs,
    #[error("could not encrypt verification token")]
    TokenEncryption,
    #[error("could not decrypt peer verification token")]
    TokenDecryption,
}

/// Out-of-band key material, seen from the mobile side: `local_iv` protects
/// what we send, `remote_iv` what the vehicle sends. Zeroed on drop; the
/// material never outlives one association attempt.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct OobData {
    key: [u8; KEY_LENGTH],
    local_iv: [u8; IV_LENGTH],
    remote_iv: [u8; IV_LENGTH],
}

impl OobData {
    pub fn new(
        key: [u8; KEY_LENGTH],
        local_iv: [u8; IV_LENGTH],
        remote_iv: [u8; IV_LENGTH],
    ) -> Result<Self, OobError> {
        if local_iv == remote_iv {
            return Err(OobError::IdenticalIvs);
        }

        Ok(OobData {
            key,
            local_iv,
            remote_iv,
        })
    }

    /// Parses wire-format material: `ihu_iv || mobile_iv || key`.
    pub fn parse(bytes: &[u8]) -> Result<Self, OobError> {
        if bytes.len() != OOB_DATA_LENGTH_BYTES {
            return Err(OobError::InvalidLength);
        }

        let mut remote_iv = [0u8; IV_LENGTH];
        let mut local_iv = [0u8; IV_LENGTH];
        let mut key = [0u8; KEY_LENGTH];
        remote_iv.copy_from_slice(&bytes[..IV_LENGTH]);
        local_iv.copy_from_slice(&bytes[IV_LENGTH..2 * IV_LENGTH]);
        key.copy_from_slice(&bytes[2 * IV_LENGTH..]);

        Self::new(key, local_iv, remote_iv)
    }

    pub fn from_association_data(data: &OutOfBandAssociationData) -> Result<Self, OobError> {
        let token = data.token.as_ref().ok_or(OobError::InvalidLength)?;

        let key = token
            .encryption_key
            .as_slice()
            .try_into()
            .map_err(|_| OobError::InvalidLength)?;
        let local_iv = token
            .mobile_iv
            .as_slice()
            .try_into()
            .map_err(|_| OobError::InvalidLength)?;
        let remote_iv = token
            .ihu_iv
            .as_slice()
            .try_into()
            .map_err(|_| OobError::InvalidLength)?;

        Self::new(key, local_iv, remote_iv)
    }

    fn cipher(&self) -> Aes128Gcm {
        Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&self.key))
    }

    /// Encrypts the verification token for the peer. The IV is single-use:
    /// each side encrypts exactly one message per association attempt.
    pub fn encrypt_token(&self, token: &[u8]) -> Result<Vec<u8>, OobError> {
        self.cipher()
            .encrypt(Nonce::from_slice(&self.local_iv), token)
            .map_err(|_| OobError::TokenEncryption)
    }

    pub fn decrypt_peer_token(&self, ciphertext: &[u8]) -> Result<Vec<u8>, OobError> {
        self.cipher()
            .decrypt(Nonce::from_slice(&self.remote_iv), ciphertext)
            .map_err(|_| OobError::TokenDecryption)
    }
}

impl fmt::Debug for OobData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("OobData").finish_non_exhaustive()
    }
}

/// Host seam serving one incoming out-of-band stream, e.g. an RFCOMM server
/// socket. Dropping the acceptor (or a pending `accept` future) must close
/// the listener and release its socket.
#[trait_variant::make(OobStreamAcceptor: Send)]
pub trait LocalOobStreamAcceptor {
    type Stream: AsyncRead + Send + Unpin;

    async fn accept(&mut self) -> std::io::Result<Self::Stream>;
}

trait ErasedOobAcceptor: Send {
    fn accept_boxed(&mut self) -> BoxFuture<'_, std::io::Result<Box<dyn AsyncRead + Send + Unpin>>>;
}

impl<A> ErasedOobAcceptor for A
where
    A: OobStreamAcceptor + Send + 'static,
    A::Stream: 'static,
{
    fn accept_boxed(&mut self) -> BoxFuture<'_, std::io::Result<Box<dyn AsyncRead + Send + Unpin>>> {
        Box::pin(async move {
            let stream = self.accept().await?;

            Ok(Box::new(stream) as Box<dyn AsyncRead + Send + Unpin>)
        })
    }
}

/// Type-erased [`OobStreamAcceptor`], so acceptors can cross non-generic
/// boundaries like the connection manager's command channel.
pub struct BoxedOobAcceptor(Box<dyn ErasedOobAcceptor>);

impl BoxedOobAcceptor {
    pub fn new<A>(acceptor: A) -> Self
    where
        A: OobStreamAcceptor + Send + 'static,
        A::Stream: 'static,
    {
        BoxedOobAcceptor(Box::new(acceptor))
    }
}

impl OobStreamAcceptor for BoxedOobAcceptor {
    type Stream = Box<dyn AsyncRead + Send + Unpin>;

    async fn accept(&mut self) -> std::io::Result<Self::Stream> {
        self.0.accept_boxed().await
    }
}

/// Races every available out-of-band channel; the first successful read
/// wins and the rest are cancelled.
pub struct OobChannelSet {
    channels: Vec<BoxFuture<'static, Option<OobData>>>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl OobChannelSet {
    /// Builds the set from the negotiated channel types. A channel is only
    /// included when its backing input is present: an acceptor for
    /// `BtRfcomm`, seeded data for `PreAssociation`. `timeout`, when given,
    /// bounds the whole read.
    pub fn new<A>(
        channel_types: &[OobChannelType],
        mut acceptor: Option<A>,
        mut pre_association: Option<OobData>,
        timeout: Option<Duration>,
    ) -> Self
    where
        A: OobStreamAcceptor + Send + 'static,
    {
        let mut channels: Vec<BoxFuture<'static, Option<OobData>>> = Vec::new();

        for channel_type in channel_types {
            match channel_type {
                OobChannelType::BtRfcomm => {
                    if let Some(mut acceptor) = acceptor.take() {
                        channels.push(
                            async move {
                                let result = read_from_acceptor(&mut acceptor).await;
                                if result.is_none() {
                                    debug!("RFCOMM out-of-band channel failed");
                                }
                                result
                            }
                            .boxed(),
                        );
                    }
                }
                OobChannelType::PreAssociation => {
                    if let Some(data) = pre_association.take() {
                        channels.push(futures::future::ready(Some(data)).boxed());
                    }
                }
                OobChannelType::Unknown => (),
            }
        }

        OobChannelSet {
            channels,
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Token that aborts the read, e.g. when the peer disconnects. Losing
    /// channels are dropped either way, which closes their sockets; no
    /// channel can deliver a result after `read` has returned.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves to the first successfully read key material, or `None` once
    /// every channel has failed, the timeout elapsed or the set was
    /// cancelled.
    pub async fn read(self) -> Option<OobData> {
        if self.channels.is_empty() {
            return None;
        }

        let mut race: FuturesUnordered<_> = self.channels.into_iter().collect();
        let first_success = async move {
            while let Some(result) = race.next().await {
                if let Some(data) = result {
                    info!("out-of-band data acquired");
                    return Some(data);
                }
            }

            None
        };

        let cancel = self.cancel;
        let bound = self.timeout;
        let bounded = async {
            match bound {
                Some(timeout) => time::timeout(timeout, first_success).await.ok().flatten(),
                None => first_success.await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => None,
            result = bounded => result,
        }
    }
}

async fn read_from_acceptor<A: OobStreamAcceptor>(acceptor: &mut A) -> Option<OobData> {
    let mut stream = acceptor.accept().await.ok()?;
    let frame = framing::read_frame(&mut stream, OOB_DATA_LENGTH_BYTES).await.ok()?;

    OobData::parse(&frame).ok()
}
