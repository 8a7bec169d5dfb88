//! In-memory transport, connected pairwise. Backs the protocol tests and
//! lets hosts prototype against the agent without a Bluetooth stack.

use tokio::io::{self, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::framing;
use super::{TransportError, TransportEvent};

const PIPE_CAPACITY: usize = 256 * 1024;
const MAX_INBOUND_FRAME: usize = 1024 * 1024;

/// One end of an in-memory link. Frames are length-prefix encoded on the
/// underlying pipe, mirroring the RFCOMM wire format.
pub struct MemoryTransportLink {
    device_name: Option<String>,
    max_write_size: usize,
    reader: Option<ReadHalf<DuplexStream>>,
    writer: Option<WriteHalf<DuplexStream>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    reader_task: Option<JoinHandle<()>>,
}

impl MemoryTransportLink {
    /// Creates two connected ends with the given frame size limit.
    pub fn pair(max_write_size: usize) -> (Self, Self) {
        let (left, right) = io::duplex(PIPE_CAPACITY);

        (Self::new(left, max_write_size), Self::new(right, max_write_size))
    }

    fn new(stream: DuplexStream, max_write_size: usize) -> Self {
        let (reader, writer) = io::split(stream);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        MemoryTransportLink {
            device_name: None,
            max_write_size,
            reader: Some(reader),
            writer: Some(writer),
            events_tx,
            events_rx: Some(events_rx),
            reader_task: None,
        }
    }

    pub fn set_device_name(&mut self, name: impl Into<String>) {
        self.device_name = Some(name.into());
    }
}

impl super::TransportLink for MemoryTransportLink {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let Some(mut reader) = self.reader.take() else {
            // Already connected, or torn down.
            return if self.writer.is_some() {
                Ok(())
            } else {
                Err(TransportError::ConnectFailed)
            };
        };

        // Queued before the reader starts so that `Connected` is always the
        // first event observed.
        let _ = self.events_tx.send(TransportEvent::Connected);

        let events = self.events_tx.clone();
        self.reader_task = Some(tokio::spawn(async move {
            loop {
                match framing::read_frame(&mut reader, MAX_INBOUND_FRAME).await {
                    Ok(payload) => {
                        if events.send(TransportEvent::MessageReceived(payload)).is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        let _ = events.send(TransportEvent::Disconnected);
                        break;
                    }
                }
            }
        }));

        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
            let _ = self.events_tx.send(TransportEvent::Disconnected);
        }
    }

    async fn send(&mut self, message: &[u8]) -> Result<(), TransportError> {
        if message.len() > self.max_write_size {
            return Err(TransportError::FrameTooLarge {
                size: message.len(),
                max: self.max_write_size,
            });
        }

        let writer = self.writer.as_mut().ok_or(TransportError::NotConnected)?;

        framing::write_frame(writer, message).await.map_err(TransportError::Write)
    }

    fn max_write_size(&self) -> usize {
        self.max_write_size
    }

    fn device_name(&self) -> Option<String> {
        self.device_name.clone()
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.take()
    }
}
