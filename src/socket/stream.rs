use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::socket::{Socket, SocketCloseEvent, SocketConnection, SocketDiagnosticsEventType, SocketEvent};


const READ_BUFFER_SIZE: usize = 64 * 1024;

enum WriteCommand {
    Write(Bytes),
    Drain(oneshot::Sender<std::io::Result<()>>),
    End,
}

/// The sending end of a socket's events. Sending 'close' drops the channel, so it is the last
///  event, and it is sent at most once no matter how many parties detect the socket's end.
struct EventSink {
    events: Mutex<Option<mpsc::UnboundedSender<SocketEvent>>>,
}
impl EventSink {
    /// returns `false` if nobody listens anymore
    fn data(&self, chunk: Bytes) -> bool {
        match self.events.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(events) => events.send(SocketEvent::Data(chunk)).is_ok(),
            None => false,
        }
    }

    fn close(&self, event: SocketCloseEvent) {
        if let Some(events) = self.events.lock().unwrap_or_else(PoisonError::into_inner).take() {
            debug!("socket {}", event);
            let _ = events.send(SocketEvent::Close(event));
        }
    }
}

/// A [Socket] on top of any Tokio byte stream, e.g. a `TcpStream` or a `UnixStream`.
///
/// Reading and writing happen in two spawned tasks. Writes are passed to the writing task through
///  a channel, so [Socket::write] never blocks.
pub struct StreamSocket {
    commands: mpsc::UnboundedSender<WriteCommand>,
    events: Arc<EventSink>,
    read_handle: JoinHandle<()>,
    write_handle: JoinHandle<()>,
}
impl StreamSocket {
    /// Starts reading and writing the stream. This must be called in the context of a Tokio
    ///  runtime.
    pub fn spawn<S>(stream: S) -> SocketConnection
    where S: AsyncRead + AsyncWrite + Send + 'static
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (event_send, event_recv) = mpsc::unbounded_channel();
        let (command_send, command_recv) = mpsc::unbounded_channel();

        let events = Arc::new(EventSink {
            events: Mutex::new(Some(event_send)),
        });

        let socket = Arc::new(StreamSocket {
            commands: command_send,
            events: events.clone(),
            read_handle: tokio::spawn(read_loop(read_half, events.clone())),
            write_handle: tokio::spawn(write_loop(write_half, command_recv, events)),
        });
        socket.trace_socket_event(SocketDiagnosticsEventType::Created, &[]);

        SocketConnection::new(socket, event_recv)
    }
}

#[async_trait]
impl Socket for StreamSocket {
    fn write(&self, buf: Bytes) -> anyhow::Result<()> {
        self.trace_socket_event(SocketDiagnosticsEventType::Write, buf.as_ref());
        self.commands.send(WriteCommand::Write(buf))
            .map_err(|_| anyhow::anyhow!("socket is closed"))
    }

    async fn drain(&self) -> anyhow::Result<()> {
        self.trace_socket_event(SocketDiagnosticsEventType::NodeDrainBegin, &[]);
        let (send, recv) = oneshot::channel();
        self.commands.send(WriteCommand::Drain(send))
            .map_err(|_| anyhow::anyhow!("socket is closed"))?;
        recv.await
            .map_err(|_| anyhow::anyhow!("socket was closed while draining"))??;
        self.trace_socket_event(SocketDiagnosticsEventType::NodeDrainEnd, &[]);
        Ok(())
    }

    fn end(&self) {
        let _ = self.commands.send(WriteCommand::End);
    }

    fn dispose(&self) {
        self.read_handle.abort();
        self.write_handle.abort();
        self.events.close(SocketCloseEvent::clean());
    }

    fn trace_socket_event(&self, event: SocketDiagnosticsEventType, data: &[u8]) {
        trace!(?event, len = data.len(), "socket event");
    }
}

impl Drop for StreamSocket {
    fn drop(&mut self) {
        self.read_handle.abort();
        self.write_handle.abort();
    }
}

async fn read_loop<R: AsyncRead + Unpin>(mut read_half: R, events: Arc<EventSink>) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        buf.reserve(READ_BUFFER_SIZE);
        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                trace!(event = ?SocketDiagnosticsEventType::NodeEndReceived, "socket event");
                events.close(SocketCloseEvent::clean());
                return;
            }
            Ok(n) => {
                trace!(event = ?SocketDiagnosticsEventType::Read, len = n, "socket event");
                if !events.data(buf.split().freeze()) {
                    return;
                }
            }
            Err(e) => {
                error!("error reading from socket: {}", e);
                events.close(SocketCloseEvent::with_error(e));
                return;
            }
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(mut write_half: W, mut commands: mpsc::UnboundedReceiver<WriteCommand>, events: Arc<EventSink>) {
    while let Some(command) = commands.recv().await {
        match command {
            WriteCommand::Write(buf) => {
                if let Err(e) = write_half.write_all(&buf).await {
                    error!("error writing to socket: {}", e);
                    events.close(SocketCloseEvent::with_error(e));
                    return;
                }
            }
            WriteCommand::Drain(done) => {
                let _ = done.send(write_half.flush().await);
            }
            WriteCommand::End => {
                if let Err(e) = write_half.shutdown().await {
                    debug!("error shutting down socket: {}", e);
                }
                trace!(event = ?SocketDiagnosticsEventType::NodeEndSent, "socket event");
                return;
            }
        }
    }
}
