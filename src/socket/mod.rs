pub mod stream;

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;


/// The byte-level transport that protocols are built on. Incoming data does not go through this
///  trait but through the [SocketEvent] channel that comes with it in a [SocketConnection].
///
/// All methods are expected to be non-blocking: `write` hands the buffer over for sending and
///  fails only if the socket is known to be gone. Errors while actually sending are reported
///  asynchronously by closing the event stream.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Socket: Send + Sync + 'static {
    fn write(&self, buf: Bytes) -> anyhow::Result<()>;

    /// completes once all previously written data was handed to the OS
    async fn drain(&self) -> anyhow::Result<()>;

    /// graceful shutdown of the outgoing direction
    fn end(&self);

    fn dispose(&self);

    /// Hook for offline debugging: protocols report every header, payload and coalesced write
    ///  here. What (if anything) a socket does with this is up to the implementation.
    fn trace_socket_event(&self, event: SocketDiagnosticsEventType, data: &[u8]);
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SocketEvent {
    Data(Bytes),
    /// sent exactly once, as the last event
    Close(SocketCloseEvent),
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct SocketCloseEvent {
    pub had_error: bool,
    pub error: Option<String>,
}
impl SocketCloseEvent {
    pub fn clean() -> SocketCloseEvent {
        SocketCloseEvent::default()
    }

    pub fn with_error(error: impl Display) -> SocketCloseEvent {
        SocketCloseEvent {
            had_error: true,
            error: Some(error.to_string()),
        }
    }
}
impl Display for SocketCloseEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.error {
            Some(e) => write!(f, "closed with error: {}", e),
            None if self.had_error => write!(f, "closed with error"),
            None => write!(f, "closed"),
        }
    }
}

/// A socket together with the receiving end of its events - this is what protocols are
///  constructed from, and what is handed over on reconnect.
pub struct SocketConnection {
    pub socket: Arc<dyn Socket>,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}
impl SocketConnection {
    pub fn new(socket: Arc<dyn Socket>, events: mpsc::UnboundedReceiver<SocketEvent>) -> SocketConnection {
        SocketConnection { socket, events }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SocketDiagnosticsEventType {
    Created,
    Read,
    Write,
    Open,
    Error,
    Close,

    NodeEndReceived,
    NodeEndSent,
    NodeDrainBegin,
    NodeDrainEnd,

    ProtocolHeaderRead,
    ProtocolMessageRead,
    ProtocolHeaderWrite,
    ProtocolMessageWrite,
    ProtocolWrite,
}
