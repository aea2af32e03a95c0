use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::protocol::message::{ProtocolMessage, ProtocolMessageType};
use crate::protocol::reader::ProtocolReader;
use crate::protocol::writer::ProtocolWriter;
use crate::protocol::MessagePassingProtocol;
use crate::socket::{Socket, SocketConnection, SocketEvent};
use crate::util::buffered_emitter::BufferedEmitter;


#[derive(Default)]
struct ProtocolEvents {
    on_message: BufferedEmitter<Bytes>,
    on_did_dispose: BufferedEmitter<()>,
}

/// Framing on a single socket, without sequencing or acknowledgement. Only 'Regular' frames
///  are passed on, and the protocol is gone when its socket is.
pub struct Protocol {
    socket: Arc<dyn Socket>,
    writer: ProtocolWriter,
    events: Arc<RwLock<ProtocolEvents>>,
    pump_handle: JoinHandle<()>,
}
impl Protocol {
    pub fn new(connection: SocketConnection) -> Protocol {
        let SocketConnection { socket, events: socket_events } = connection;

        let events: Arc<RwLock<ProtocolEvents>> = Default::default();
        let reader = ProtocolReader::new(socket.clone());
        let pump_handle = tokio::spawn(pump(reader, socket_events, events.clone()));

        Protocol {
            writer: ProtocolWriter::new(socket.clone()),
            socket,
            events,
            pump_handle,
        }
    }

    pub fn socket(&self) -> Arc<dyn Socket> {
        self.socket.clone()
    }

    pub fn send(&self, data: Bytes) {
        self.writer.write(&mut ProtocolMessage::new(ProtocolMessageType::Regular, 0, 0, data));
    }

    /// There is nobody to acknowledge a disconnect on this level, so this does nothing.
    pub fn send_disconnect(&self) {
    }

    pub async fn drain(&self) -> anyhow::Result<()> {
        self.writer.drain().await
    }

    pub async fn subscribe_messages(&self) -> mpsc::UnboundedReceiver<Bytes> {
        self.events.write().await
            .on_message.subscribe()
    }

    /// fires when the socket is closed
    pub async fn subscribe_did_dispose(&self) -> mpsc::UnboundedReceiver<()> {
        self.events.write().await
            .on_did_dispose.subscribe()
    }

    pub fn dispose(&self) {
        self.pump_handle.abort();
        self.writer.dispose();
    }
}

impl Drop for Protocol {
    fn drop(&mut self) {
        self.pump_handle.abort();
    }
}

#[async_trait]
impl MessagePassingProtocol for Protocol {
    async fn send(&self, data: Bytes) {
        Protocol::send(self, data)
    }

    async fn subscribe_messages(&self) -> mpsc::UnboundedReceiver<Bytes> {
        Protocol::subscribe_messages(self).await
    }

    async fn drain(&self) -> anyhow::Result<()> {
        Protocol::drain(self).await
    }
}

async fn pump(mut reader: ProtocolReader, mut socket_events: mpsc::UnboundedReceiver<SocketEvent>, events: Arc<RwLock<ProtocolEvents>>) {
    while let Some(event) = socket_events.recv().await {
        match event {
            SocketEvent::Data(chunk) => {
                reader.accept_chunk(chunk);
                while let Some(msg) = reader.next_message() {
                    if msg.message_type == ProtocolMessageType::Regular {
                        events.write().await
                            .on_message.fire(msg.data);
                    }
                    else {
                        trace!("ignoring {:?}", msg);
                    }
                }
            }
            SocketEvent::Close(close_event) => {
                debug!("socket {}", close_event);
                break;
            }
        }
    }

    events.write().await
        .on_did_dispose.fire(());
}
