use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::protocol::message::{ProtocolHeader, ProtocolMessage};
use crate::socket::{Socket, SocketCloseEvent, SocketConnection, SocketDiagnosticsEventType, SocketEvent};


/// An in-memory socket that records everything written to it. Incoming data and the socket's
///  closing are triggered explicitly by the test.
pub struct RecordingSocket {
    written: Mutex<Vec<Bytes>>,
    events: mpsc::UnboundedSender<SocketEvent>,
    num_drains: AtomicUsize,
    is_ended: AtomicBool,
    is_disposed: AtomicBool,
    fail_writes: AtomicBool,
}
impl RecordingSocket {
    pub fn new() -> (Arc<RecordingSocket>, SocketConnection) {
        let (send, recv) = mpsc::unbounded_channel();
        let socket = Arc::new(RecordingSocket {
            written: Default::default(),
            events: send,
            num_drains: Default::default(),
            is_ended: Default::default(),
            is_disposed: Default::default(),
            fail_writes: Default::default(),
        });
        let connection = SocketConnection::new(socket.clone(), recv);
        (socket, connection)
    }

    /// all buffers written so far, one entry per call to `write`
    pub fn written(&self) -> Vec<Bytes> {
        self.written.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn take_written(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.written.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Parses everything written since the last call into protocol messages. Panics if the
    ///  written data does not consist of complete frames.
    pub fn take_written_messages(&self) -> Vec<ProtocolMessage> {
        let mut buf = BytesMut::new();
        for chunk in self.take_written() {
            buf.extend_from_slice(&chunk);
        }
        let mut buf = buf.freeze();

        let mut result = Vec::new();
        while buf.has_remaining() {
            let header = ProtocolHeader::deser(&mut buf)
                .expect("written data should consist of complete frames");
            assert!(buf.len() >= header.data_len as usize, "incomplete frame body");
            let data = buf.split_to(header.data_len as usize);
            result.push(ProtocolMessage::new(header.message_type, header.id, header.ack, data));
        }
        result
    }

    pub fn push_data(&self, data: impl Into<Bytes>) {
        let _ = self.events.send(SocketEvent::Data(data.into()));
    }

    pub fn push_message(&self, msg: &ProtocolMessage) {
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        self.push_data(buf.freeze());
    }

    pub fn close(&self, event: SocketCloseEvent) {
        let _ = self.events.send(SocketEvent::Close(event));
    }

    pub fn num_drains(&self) -> usize {
        self.num_drains.load(Ordering::Acquire)
    }

    pub fn is_ended(&self) -> bool {
        self.is_ended.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.is_disposed.load(Ordering::Acquire)
    }

    /// makes all subsequent writes fail
    pub fn set_fail_writes(&self, fail_writes: bool) {
        self.fail_writes.store(fail_writes, Ordering::Release);
    }
}

#[async_trait]
impl Socket for RecordingSocket {
    fn write(&self, buf: Bytes) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            anyhow::bail!("write failure requested by test");
        }
        self.written.lock().unwrap_or_else(PoisonError::into_inner).push(buf);
        Ok(())
    }

    async fn drain(&self) -> anyhow::Result<()> {
        self.num_drains.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn end(&self) {
        self.is_ended.store(true, Ordering::Release);
    }

    fn dispose(&self) {
        self.is_disposed.store(true, Ordering::Release);
    }

    fn trace_socket_event(&self, _event: SocketDiagnosticsEventType, _data: &[u8]) {
    }
}


/// One end of an in-memory socket pair, see [socket_pair].
pub struct PipeSocket {
    own_events: mpsc::UnboundedSender<SocketEvent>,
    peer_events: mpsc::UnboundedSender<SocketEvent>,
    is_closed: AtomicBool,
}
impl PipeSocket {
    fn close_both(&self, event: SocketCloseEvent) {
        if !self.is_closed.swap(true, Ordering::AcqRel) {
            let _ = self.peer_events.send(SocketEvent::Close(event.clone()));
            let _ = self.own_events.send(SocketEvent::Close(event));
        }
    }

    /// simulates a network failure: both ends see the connection close with an error
    pub fn break_connection(&self) {
        self.close_both(SocketCloseEvent::with_error("connection broken"));
    }
}

#[async_trait]
impl Socket for PipeSocket {
    fn write(&self, buf: Bytes) -> anyhow::Result<()> {
        if self.is_closed.load(Ordering::Acquire) {
            anyhow::bail!("write to closed socket");
        }
        self.peer_events.send(SocketEvent::Data(buf))
            .map_err(|_| anyhow::anyhow!("peer socket is gone"))
    }

    async fn drain(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn end(&self) {
        self.close_both(SocketCloseEvent::clean());
    }

    fn dispose(&self) {
        self.close_both(SocketCloseEvent::clean());
    }

    fn trace_socket_event(&self, _event: SocketDiagnosticsEventType, _data: &[u8]) {
    }
}

/// Creates two connected in-memory sockets: data written to one arrives at the other.
pub fn socket_pair() -> (Arc<PipeSocket>, SocketConnection, Arc<PipeSocket>, SocketConnection) {
    let (send_a, recv_a) = mpsc::unbounded_channel();
    let (send_b, recv_b) = mpsc::unbounded_channel();

    let a = Arc::new(PipeSocket {
        own_events: send_a.clone(),
        peer_events: send_b.clone(),
        is_closed: Default::default(),
    });
    let b = Arc::new(PipeSocket {
        own_events: send_b,
        peer_events: send_a,
        is_closed: Default::default(),
    });

    let connection_a = SocketConnection::new(a.clone(), recv_a);
    let connection_b = SocketConnection::new(b.clone(), recv_b);
    (a, connection_a, b, connection_b)
}
