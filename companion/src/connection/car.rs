use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde_bytes::ByteBuf;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use companion_common::messages::{self, OperationType, Query, QueryResponse};

use crate::stream::{MessageStream, RawStreamEvent, StreamMessage};
use crate::transport::TransportLink;

/// Recipient used for messages from legacy peers that omit the recipient
/// field.
pub const DEFAULT_FEATURE_ID: Uuid = Uuid::from_u128(0xb75d6a81_b0f4_4b53_9a0e_3d3ab54c6e2f);

/// Query id reported to a response handler when no response can ever arrive.
pub const INVALID_QUERY_ID: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CarError {
    #[error("vehicle is disconnected")]
    Disconnected,
    #[error("a different callback is already registered for recipient {0}")]
    CallbackAlreadyRegistered(Uuid),
}

/// An incoming query, to be answered with
/// [`Car::send_query_response`] addressed to `sender`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedQuery {
    pub id: u32,
    pub sender: Uuid,
    pub request: Vec<u8>,
    pub parameters: Vec<u8>,
}

/// Outcome delivered to a query response handler. `query_id` is
/// [`INVALID_QUERY_ID`] when the session ended before a response arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponseEvent {
    pub query_id: i64,
    pub success: bool,
    pub response: Vec<u8>,
}

/// Per-recipient consumer of messages from one car. Callbacks are invoked on
/// the car's dispatch task, in stream order.
pub trait CarCallback: Send + Sync {
    fn on_message_received(&self, payload: Vec<u8>);

    fn on_query_received(&self, query: ReceivedQuery) {
        let _ = query;
    }

    fn on_disconnected(&self) {}
}

type QueryHandler = Box<dyn FnOnce(QueryResponseEvent) + Send>;

enum CarCommand {
    SendMessage {
        payload: Vec<u8>,
        recipient: Uuid,
        done: oneshot::Sender<Result<u32, CarError>>,
    },
    SendQuery {
        request: Vec<u8>,
        parameters: Vec<u8>,
        recipient: Uuid,
        handler: QueryHandler,
    },
    SendQueryResponse {
        query_id: u32,
        success: bool,
        response: Vec<u8>,
        recipient: Uuid,
        done: oneshot::Sender<Result<(), CarError>>,
    },
    SetCallback {
        callback: Arc<dyn CarCallback>,
        recipient: Uuid,
        done: oneshot::Sender<Result<(), CarError>>,
    },
    ClearCallback {
        callback: Arc<dyn CarCallback>,
        recipient: Uuid,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

/// Handle to one connected vehicle session.
///
/// The handle is cheap to clone; the session itself lives on a dispatch task
/// that owns the message stream and transport. Once the session ends, sends
/// fail with [`CarError::Disconnected`] and pending query handlers are
/// resolved with [`INVALID_QUERY_ID`].
#[derive(Clone)]
pub struct Car {
    device_id: Uuid,
    name: Option<String>,
    commands: mpsc::UnboundedSender<CarCommand>,
}

impl fmt::Debug for Car {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Car")
            .field("device_id", &self.device_id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Car {
    pub(crate) fn spawn<T>(
        device_id: Uuid,
        name: Option<String>,
        stream: MessageStream<T>,
        disconnects: mpsc::UnboundedSender<Uuid>,
    ) -> Car
    where
        T: TransportLink + Send + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let actor = CarActor {
            device_id,
            stream,
            commands: commands_rx,
            disconnects,
            callbacks: HashMap::new(),
            unclaimed_messages: HashMap::new(),
            unclaimed_queries: HashMap::new(),
            pending_queries: HashMap::new(),
            next_query_id: 0,
        };
        tokio::spawn(actor.run());

        Car {
            device_id,
            name,
            commands: commands_tx,
        }
    }

    pub fn device_id(&self) -> Uuid {
        self.device_id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Sends an application message to the given recipient, returning the
    /// stream message id.
    pub async fn send_message(&self, payload: Vec<u8>, recipient: Uuid) -> Result<u32, CarError> {
        let (done, result) = oneshot::channel();
        self.commands
            .send(CarCommand::SendMessage {
                payload,
                recipient,
                done,
            })
            .map_err(|_| CarError::Disconnected)?;

        result.await.map_err(|_| CarError::Disconnected)?
    }

    /// Sends a query; `handler` is invoked exactly once with the response,
    /// or with [`INVALID_QUERY_ID`] if the session ends first.
    pub async fn send_query<F>(&self, request: Vec<u8>, parameters: Vec<u8>, recipient: Uuid, handler: F)
    where
        F: FnOnce(QueryResponseEvent) + Send + 'static,
    {
        let command = CarCommand::SendQuery {
            request,
            parameters,
            recipient,
            handler: Box::new(handler),
        };

        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            // The session is gone; resolve the handler immediately.
            if let CarCommand::SendQuery { handler, .. } = command {
                handler(failed_query_response());
            }
        }
    }

    pub async fn send_query_response(
        &self,
        query_id: u32,
        success: bool,
        response: Vec<u8>,
        recipient: Uuid,
    ) -> Result<(), CarError> {
        let (done, result) = oneshot::channel();
        self.commands
            .send(CarCommand::SendQueryResponse {
                query_id,
                success,
                response,
                recipient,
                done,
            })
            .map_err(|_| CarError::Disconnected)?;

        result.await.map_err(|_| CarError::Disconnected)?
    }

    /// Binds `callback` to `recipient`. At most one callback may be bound per
    /// recipient; binding a different one fails without replacing it.
    /// Unclaimed messages buffered for the recipient are drained, in arrival
    /// order, before this returns.
    pub async fn set_callback(&self, callback: Arc<dyn CarCallback>, recipient: Uuid) -> Result<(), CarError> {
        let (done, result) = oneshot::channel();
        self.commands
            .send(CarCommand::SetCallback {
                callback,
                recipient,
                done,
            })
            .map_err(|_| CarError::Disconnected)?;

        result.await.map_err(|_| CarError::Disconnected)?
    }

    /// Unbinds `callback` from `recipient`. A no-op unless the exact same
    /// callback instance is bound.
    pub async fn clear_callback(&self, callback: &Arc<dyn CarCallback>, recipient: Uuid) {
        let _ = self.commands.send(CarCommand::ClearCallback {
            callback: Arc::clone(callback),
            recipient,
        });
    }

    /// Tears the session down. Idempotent.
    pub async fn disconnect(&self) {
        let (done, result) = oneshot::channel();
        if self.commands.send(CarCommand::Disconnect { done }).is_ok() {
            let _ = result.await;
        }
    }
}

fn failed_query_response() -> QueryResponseEvent {
    QueryResponseEvent {
        query_id: INVALID_QUERY_ID,
        success: false,
        response: Vec::new(),
    }
}

struct CarActor<T> {
    device_id: Uuid,
    stream: MessageStream<T>,
    commands: mpsc::UnboundedReceiver<CarCommand>,
    disconnects: mpsc::UnboundedSender<Uuid>,
    callbacks: HashMap<Uuid, Arc<dyn CarCallback>>,
    unclaimed_messages: HashMap<Uuid, VecDeque<Vec<u8>>>,
    unclaimed_queries: HashMap<Uuid, VecDeque<ReceivedQuery>>,
    pending_queries: HashMap<u32, QueryHandler>,
    next_query_id: u32,
}

impl<T: TransportLink + Send + 'static> CarActor<T> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle_command(command).await {
                                self.stream.disconnect().await;
                                break;
                            }
                        }
                        // Every handle is gone; tear the session down.
                        None => {
                            self.stream.disconnect().await;
                            break;
                        }
                    }
                }
                // The raw receive is cancel-safe; decoding happens outside
                // the race so a frame is never lost to a command arriving.
                event = self.stream.next_raw_event() => {
                    match event {
                        RawStreamEvent::Frame(frame) => match self.stream.process_frame(frame).await {
                            Ok(Some(message)) => self.dispatch_message(message),
                            Ok(None) => (),
                            Err(error) => {
                                warn!(device_id = %self.device_id, "stream failed, disconnecting: {error}");
                                self.stream.disconnect().await;
                                break;
                            }
                        },
                        RawStreamEvent::Disconnected => break,
                    }
                }
            }
        }

        self.fan_out_disconnect();
    }

    /// Returns `false` once the session must end, either on an explicit
    /// disconnect or because the transport gave out mid-send.
    async fn handle_command(&mut self, command: CarCommand) -> bool {
        match command {
            CarCommand::Disconnect { done } => {
                self.stream.disconnect().await;
                let _ = done.send(());
                false
            }
            CarCommand::SendMessage {
                payload,
                recipient,
                done,
            } => {
                let result = self
                    .stream
                    .send(StreamMessage::encrypted(
                        OperationType::ClientMessage,
                        payload,
                        Some(recipient),
                    ))
                    .await;

                match result {
                    Ok(message_id) => {
                        let _ = done.send(Ok(message_id));
                        true
                    }
                    Err(error) => {
                        warn!("could not send message: {error}");
                        let _ = done.send(Err(CarError::Disconnected));
                        false
                    }
                }
            }
            CarCommand::SendQuery {
                request,
                parameters,
                recipient,
                handler,
            } => {
                let id = self.next_query_id;
                self.next_query_id = self.next_query_id.wrapping_add(1);

                let query = Query {
                    id,
                    sender: recipient,
                    request: ByteBuf::from(request),
                    parameters: ByteBuf::from(parameters),
                };
                let encoded = match messages::to_vec(&query) {
                    Ok(encoded) => encoded,
                    Err(error) => {
                        warn!("could not encode query: {error}");
                        handler(failed_query_response());
                        return true;
                    }
                };

                let result = self
                    .stream
                    .send(StreamMessage::encrypted(
                        OperationType::Query,
                        encoded,
                        Some(recipient),
                    ))
                    .await;

                match result {
                    Ok(_) => {
                        self.pending_queries.insert(id, handler);
                        true
                    }
                    Err(error) => {
                        warn!("could not send query: {error}");
                        handler(failed_query_response());
                        false
                    }
                }
            }
            CarCommand::SendQueryResponse {
                query_id,
                success,
                response,
                recipient,
                done,
            } => {
                let response = QueryResponse {
                    query_id,
                    success,
                    response: ByteBuf::from(response),
                };
                let encoded = match messages::to_vec(&response) {
                    Ok(encoded) => encoded,
                    Err(error) => {
                        warn!("could not encode query response: {error}");
                        let _ = done.send(Err(CarError::Disconnected));
                        return true;
                    }
                };

                let result = self
                    .stream
                    .send(StreamMessage::encrypted(
                        OperationType::QueryResponse,
                        encoded,
                        Some(recipient),
                    ))
                    .await;

                match result {
                    Ok(_) => {
                        let _ = done.send(Ok(()));
                        true
                    }
                    Err(error) => {
                        warn!("could not send query response: {error}");
                        let _ = done.send(Err(CarError::Disconnected));
                        false
                    }
                }
            }
            CarCommand::SetCallback {
                callback,
                recipient,
                done,
            } => {
                let _ = done.send(self.set_callback(callback, recipient));
                true
            }
            CarCommand::ClearCallback { callback, recipient } => {
                if let Some(existing) = self.callbacks.get(&recipient) {
                    if Arc::ptr_eq(existing, &callback) {
                        self.callbacks.remove(&recipient);
                    }
                }
                true
            }
        }
    }

    fn set_callback(&mut self, callback: Arc<dyn CarCallback>, recipient: Uuid) -> Result<(), CarError> {
        if let Some(existing) = self.callbacks.get(&recipient) {
            if !Arc::ptr_eq(existing, &callback) {
                return Err(CarError::CallbackAlreadyRegistered(recipient));
            }
        }

        // Everything buffered for the recipient is delivered, in arrival
        // order, before new traffic.
        if let Some(buffered) = self.unclaimed_messages.remove(&recipient) {
            debug!(%recipient, count = buffered.len(), "draining unclaimed messages");
            for payload in buffered {
                callback.on_message_received(payload);
            }
        }
        if let Some(buffered) = self.unclaimed_queries.remove(&recipient) {
            debug!(%recipient, count = buffered.len(), "draining unclaimed queries");
            for query in buffered {
                callback.on_query_received(query);
            }
        }

        self.callbacks.insert(recipient, callback);

        Ok(())
    }

    fn dispatch_message(&mut self, message: StreamMessage) {
        let recipient = message.recipient.unwrap_or(DEFAULT_FEATURE_ID);

        match message.operation {
            OperationType::ClientMessage => match self.callbacks.get(&recipient) {
                Some(callback) => callback.on_message_received(message.payload),
                None => {
                    self.unclaimed_messages
                        .entry(recipient)
                        .or_default()
                        .push_back(message.payload);
                }
            },
            OperationType::Query => {
                let query: Query = match messages::from_slice(&message.payload) {
                    Ok(query) => query,
                    Err(error) => {
                        warn!("dropping unparseable query: {error}");
                        return;
                    }
                };
                let received = ReceivedQuery {
                    id: query.id,
                    sender: query.sender,
                    request: query.request.into_vec(),
                    parameters: query.parameters.into_vec(),
                };

                match self.callbacks.get(&recipient) {
                    Some(callback) => callback.on_query_received(received),
                    None => {
                        self.unclaimed_queries
                            .entry(recipient)
                            .or_default()
                            .push_back(received);
                    }
                }
            }
            OperationType::QueryResponse => {
                let response: QueryResponse = match messages::from_slice(&message.payload) {
                    Ok(response) => response,
                    Err(error) => {
                        warn!("dropping unparseable query response: {error}");
                        return;
                    }
                };

                match self.pending_queries.remove(&response.query_id) {
                    Some(handler) => handler(QueryResponseEvent {
                        query_id: i64::from(response.query_id),
                        success: response.success,
                        response: response.response.into_vec(),
                    }),
                    None => {
                        debug!(query_id = response.query_id, "dropping response without a pending query");
                    }
                }
            }
            // Handshake traffic after establishment is out of state; drop it.
            OperationType::EncryptionHandshake => {
                debug!("dropping handshake message received after establishment");
            }
        }
    }

    fn fan_out_disconnect(&mut self) {
        info!(device_id = %self.device_id, "car disconnected");

        // Commands that were enqueued while the teardown raced them can
        // never be served; resolve them as disconnected instead of dropping
        // their handlers and completions on the floor.
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                CarCommand::SendMessage { done, .. } => {
                    let _ = done.send(Err(CarError::Disconnected));
                }
                CarCommand::SendQuery { handler, .. } => handler(failed_query_response()),
                CarCommand::SendQueryResponse { done, .. } => {
                    let _ = done.send(Err(CarError::Disconnected));
                }
                CarCommand::SetCallback { done, .. } => {
                    let _ = done.send(Err(CarError::Disconnected));
                }
                CarCommand::ClearCallback { .. } => (),
                CarCommand::Disconnect { done } => {
                    let _ = done.send(());
                }
            }
        }

        for handler in std::mem::take(&mut self.pending_queries).into_values() {
            handler(failed_query_response());
        }
        for callback in self.callbacks.values() {
            callback.on_disconnected();
        }

        let _ = self.disconnects.send(self.device_id);
    }
}
