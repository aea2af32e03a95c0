use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use crate::protocol::config::PersistentProtocolConfig;
use crate::protocol::events::SocketTimeoutEvent;
use crate::protocol::message::{ProtocolMessage, ProtocolMessageType};
use crate::protocol::reader::ProtocolReader;
use crate::protocol::unacked_queue::UnacknowledgedQueue;
use crate::protocol::writer::ProtocolWriter;
use crate::protocol::MessagePassingProtocol;
use crate::socket::{Socket, SocketCloseEvent, SocketConnection, SocketEvent};
use crate::util::buffered_emitter::BufferedEmitter;
use crate::util::load_estimator::{global_load_estimator, LoadEstimator};


pub struct PersistentProtocolOptions {
    /// data that was received on the socket before the protocol took it over, e.g. while
    ///  doing a handshake
    pub initial_chunk: Option<Bytes>,
    /// `None` means the process-wide estimator
    pub load_estimator: Option<Arc<dyn LoadEstimator>>,
    pub send_keep_alive: bool,
    pub config: PersistentProtocolConfig,
}
impl Default for PersistentProtocolOptions {
    fn default() -> Self {
        PersistentProtocolOptions {
            initial_chunk: None,
            load_estimator: None,
            send_keep_alive: true,
            config: Default::default(),
        }
    }
}

/// A message protocol that survives the loss of its socket: the owner can hand it a new socket
///  (see [PersistentProtocol::begin_accept_reconnection]), and the conversation continues where
///  it left off.
///
/// 'Regular' messages carry a sequence number, and every frame carries the highest sequence
///  number its sender received so far. Sent messages are kept until the peer acknowledges them,
///  and they are re-sent after a reconnect or when the peer detects a gap and asks for a replay.
///  The receiving side drops duplicates, so the application sees every message exactly once
///  and in order.
///
/// The protocol does not reconnect by itself. It reports a dead peer through
///  [PersistentProtocol::subscribe_socket_timeout], and a closed socket through
///  [PersistentProtocol::subscribe_socket_close], and leaves it to the owner to act on that.
pub struct PersistentProtocol {
    inner: Arc<RwLock<Inner>>,
}

/// everything that belongs to the socket currently in use, and is replaced on reconnect
struct SocketBinding {
    socket: Arc<dyn Socket>,
    reader: ProtocolReader,
    writer: ProtocolWriter,
    generation: u64,
    pump_handle: Option<JoinHandle<()>>,
}
impl SocketBinding {
    fn new(socket: Arc<dyn Socket>, generation: u64) -> SocketBinding {
        SocketBinding {
            reader: ProtocolReader::new(socket.clone()),
            writer: ProtocolWriter::new(socket.clone()),
            socket,
            generation,
            pump_handle: None,
        }
    }

    fn dispose(&mut self) {
        if let Some(handle) = self.pump_handle.take() {
            handle.abort();
        }
        self.reader.dispose();
        self.writer.dispose();
    }
}

struct Inner {
    myself: Weak<RwLock<Inner>>,
    config: PersistentProtocolConfig,
    load_estimator: Arc<dyn LoadEstimator>,

    is_reconnecting: bool,
    did_send_disconnect: bool,
    is_disposed: bool,

    outgoing_unack_msg: UnacknowledgedQueue,
    outgoing_msg_id: u32,
    outgoing_ack_id: u32,
    outgoing_ack_timeout: Option<JoinHandle<()>>,

    incoming_msg_id: u32,
    incoming_ack_id: u32,
    incoming_msg_last_time: Option<Instant>,
    incoming_ack_timeout: Option<JoinHandle<()>>,

    keep_alive_handle: Option<JoinHandle<()>>,
    last_replay_request_time: Option<Instant>,
    last_socket_timeout_time: Instant,

    binding: SocketBinding,

    on_message: BufferedEmitter<Bytes>,
    on_control_message: BufferedEmitter<Bytes>,
    on_did_dispose: BufferedEmitter<()>,
    on_socket_close: BufferedEmitter<SocketCloseEvent>,
    on_socket_timeout: BufferedEmitter<SocketTimeoutEvent>,
}

impl PersistentProtocol {
    pub async fn new(connection: SocketConnection, options: PersistentProtocolOptions) -> PersistentProtocol {
        let SocketConnection { socket, events } = connection;
        let load_estimator = options.load_estimator
            .unwrap_or_else(global_load_estimator);

        let inner = Arc::new_cyclic(|myself| RwLock::new(Inner {
            myself: myself.clone(),
            config: options.config,
            load_estimator,
            is_reconnecting: false,
            did_send_disconnect: false,
            is_disposed: false,
            outgoing_unack_msg: UnacknowledgedQueue::new(),
            outgoing_msg_id: 0,
            outgoing_ack_id: 0,
            outgoing_ack_timeout: None,
            incoming_msg_id: 0,
            incoming_ack_id: 0,
            incoming_msg_last_time: None,
            incoming_ack_timeout: None,
            keep_alive_handle: None,
            last_replay_request_time: None,
            last_socket_timeout_time: Instant::now(),
            binding: SocketBinding::new(socket, 0),
            on_message: Default::default(),
            on_control_message: Default::default(),
            on_did_dispose: Default::default(),
            on_socket_close: Default::default(),
            on_socket_timeout: Default::default(),
        }));

        {
            let mut lock = inner.write().await;
            lock.start_pump(events);
            if options.send_keep_alive {
                lock.start_keep_alive();
            }
            if let Some(chunk) = options.initial_chunk {
                lock.accept_chunk(chunk);
            }
        }

        PersistentProtocol { inner }
    }

    pub async fn send(&self, data: Bytes) {
        self.inner.write().await
            .send(data);
    }

    /// Sends an unsequenced message that is neither acknowledged nor replayed
    pub async fn send_control(&self, data: Bytes) {
        self.inner.read().await
            .binding.writer.write(&mut ProtocolMessage::new(ProtocolMessageType::Control, 0, 0, data));
    }

    /// asks the peer to stop writing until [PersistentProtocol::send_resume]
    pub async fn send_pause(&self) {
        self.inner.read().await
            .binding.writer.write(&mut ProtocolMessage::empty(ProtocolMessageType::Pause, 0));
    }

    pub async fn send_resume(&self) {
        self.inner.read().await
            .binding.writer.write(&mut ProtocolMessage::empty(ProtocolMessageType::Resume, 0));
    }

    /// Tells the peer that this side is going away for good. This is sent at most once, and it
    ///  is flushed right away since the owner is likely to drop the socket next.
    pub async fn send_disconnect(&self) {
        self.inner.write().await
            .send_disconnect();
    }

    /// Treats the conversation as over, just like receiving a 'Disconnect' frame from the peer
    pub async fn accept_disconnect(&self) {
        self.inner.write().await
            .on_did_dispose.fire(());
    }

    pub async fn drain(&self) -> anyhow::Result<()> {
        let writer = self.inner.read().await
            .binding.writer.clone();
        writer.drain().await
    }

    pub async fn unacknowledged_count(&self) -> u32 {
        self.inner.read().await
            .unacknowledged_count()
    }

    pub async fn millis_since_last_incoming_data(&self) -> u64 {
        let last_read_time = self.inner.read().await
            .binding.reader.last_read_time();
        Instant::now().saturating_duration_since(last_read_time).as_millis() as u64
    }

    /// Takes all data that was received on the current socket but is not a complete frame yet.
    ///  This is for moving a socket to a different owner.
    pub async fn read_entire_buffer(&self) -> Bytes {
        self.inner.write().await
            .binding.reader.read_entire_buffer()
    }

    pub async fn socket(&self) -> Arc<dyn Socket> {
        self.inner.read().await
            .binding.socket.clone()
    }

    /// Replaces the socket. Until [PersistentProtocol::end_accept_reconnection] is called, sent
    ///  messages are queued but not written, and the peer is not checked for timeouts.
    ///
    /// The old socket is disposed, and events from it are ignored from here on.
    pub async fn begin_accept_reconnection(&self, connection: SocketConnection, initial_chunk: Option<Bytes>) {
        self.inner.write().await
            .begin_accept_reconnection(connection, initial_chunk);
    }

    /// Completes a reconnect: re-sends the current ack and all unacknowledged messages on the
    ///  new socket, in their original order.
    pub async fn end_accept_reconnection(&self) {
        self.inner.write().await
            .end_accept_reconnection();
    }

    /// Stops all timers and the keep-alive, and releases the socket's reader and writer. The
    ///  socket itself is left to the owner.
    pub async fn dispose(&self) {
        self.inner.write().await
            .dispose();
    }

    /// 'Regular' messages, in order and without duplicates
    pub async fn subscribe_messages(&self) -> mpsc::UnboundedReceiver<Bytes> {
        self.inner.write().await
            .on_message.subscribe()
    }

    pub async fn subscribe_control_messages(&self) -> mpsc::UnboundedReceiver<Bytes> {
        self.inner.write().await
            .on_control_message.subscribe()
    }

    /// fires when the peer disconnected
    pub async fn subscribe_did_dispose(&self) -> mpsc::UnboundedReceiver<()> {
        self.inner.write().await
            .on_did_dispose.subscribe()
    }

    pub async fn subscribe_socket_close(&self) -> mpsc::UnboundedReceiver<SocketCloseEvent> {
        self.inner.write().await
            .on_socket_close.subscribe()
    }

    pub async fn subscribe_socket_timeout(&self) -> mpsc::UnboundedReceiver<SocketTimeoutEvent> {
        self.inner.write().await
            .on_socket_timeout.subscribe()
    }
}

#[async_trait]
impl MessagePassingProtocol for PersistentProtocol {
    async fn send(&self, data: Bytes) {
        PersistentProtocol::send(self, data).await
    }

    async fn subscribe_messages(&self) -> mpsc::UnboundedReceiver<Bytes> {
        PersistentProtocol::subscribe_messages(self).await
    }

    async fn drain(&self) -> anyhow::Result<()> {
        PersistentProtocol::drain(self).await
    }
}

impl Inner {
    fn unacknowledged_count(&self) -> u32 {
        self.outgoing_msg_id - self.outgoing_ack_id
    }

    fn start_pump(&mut self, events: mpsc::UnboundedReceiver<SocketEvent>) {
        let handle = tokio::spawn(pump(self.myself.clone(), self.binding.generation, events));
        self.binding.pump_handle = Some(handle);
    }

    fn start_keep_alive(&mut self) {
        let myself = self.myself.clone();
        let period = self.config.keep_alive_send_time;
        self.keep_alive_handle = Some(tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(inner) = myself.upgrade() else {
                    break;
                };
                let mut inner = inner.write().await;
                if inner.is_disposed {
                    break;
                }
                inner.send_keep_alive();
            }
        }));
    }

    /// Runs `action` after `delay` unless the protocol is disposed (or gone) by then
    fn schedule(&self, delay: Duration, action: fn(&mut Inner)) -> JoinHandle<()> {
        let myself = self.myself.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            if let Some(inner) = myself.upgrade() {
                let mut inner = inner.write().await;
                if !inner.is_disposed {
                    action(&mut inner);
                }
            }
        })
    }

    fn accept_chunk(&mut self, chunk: Bytes) {
        self.binding.reader.accept_chunk(chunk);
        while let Some(msg) = self.binding.reader.next_message() {
            self.receive_message(msg);
            if self.is_disposed {
                break;
            }
        }
    }

    fn send(&mut self, data: Bytes) {
        self.outgoing_msg_id += 1;
        self.incoming_ack_id = self.incoming_msg_id;
        let mut msg = ProtocolMessage::new(ProtocolMessageType::Regular, self.outgoing_msg_id, self.incoming_ack_id, data);

        if self.is_reconnecting {
            trace!("reconnecting - queueing {:?}", msg);
            self.outgoing_unack_msg.push(msg);
        }
        else {
            self.binding.writer.write(&mut msg);
            self.outgoing_unack_msg.push(msg);
            self.recv_ack_check();
        }
    }

    fn send_disconnect(&mut self) {
        if self.did_send_disconnect {
            return;
        }
        self.did_send_disconnect = true;

        debug!("sending disconnect");
        self.binding.writer.write(&mut ProtocolMessage::empty(ProtocolMessageType::Disconnect, 0));
        if let Err(e) = self.binding.writer.flush() {
            debug!("error flushing disconnect message: {}", e);
        }
    }

    fn send_keep_alive(&mut self) {
        self.incoming_ack_id = self.incoming_msg_id;
        self.binding.writer.write(&mut ProtocolMessage::empty(ProtocolMessageType::KeepAlive, self.incoming_ack_id));
    }

    fn send_ack(&mut self) {
        if self.incoming_msg_id <= self.incoming_ack_id {
            // nothing to acknowledge
            return;
        }

        self.incoming_ack_id = self.incoming_msg_id;
        trace!("sending ack {}", self.incoming_ack_id);
        self.binding.writer.write(&mut ProtocolMessage::empty(ProtocolMessageType::Ack, self.incoming_ack_id));
    }

    fn receive_message(&mut self, msg: ProtocolMessage) {
        trace!("received {:?}", msg);

        let ack = if msg.ack > self.outgoing_msg_id {
            warn!("peer acknowledged #{}, but only {} messages were sent - ignoring the excess", msg.ack, self.outgoing_msg_id);
            self.outgoing_msg_id
        }
        else {
            msg.ack
        };
        if ack > self.outgoing_ack_id {
            self.outgoing_ack_id = ack;
            self.outgoing_unack_msg.acknowledge(ack);
        }

        match msg.message_type {
            ProtocolMessageType::None | ProtocolMessageType::Ack | ProtocolMessageType::KeepAlive => {}
            ProtocolMessageType::Regular => {
                if msg.id <= self.incoming_msg_id {
                    trace!("dropping duplicate message #{}", msg.id);
                }
                else if msg.id != self.incoming_msg_id + 1 {
                    // messages were lost, ask the peer to send everything we did not acknowledge yet
                    self.request_replay(msg.id);
                }
                else {
                    self.incoming_msg_id = msg.id;
                    self.incoming_msg_last_time = Some(Instant::now());
                    self.send_ack_check();
                    self.on_message.fire(msg.data);
                }
            }
            ProtocolMessageType::Control => {
                self.on_control_message.fire(msg.data);
            }
            ProtocolMessageType::Disconnect => {
                debug!("peer disconnected");
                self.on_did_dispose.fire(());
            }
            ProtocolMessageType::ReplayRequest => {
                debug!("peer requested replay of {} unacknowledged messages", self.outgoing_unack_msg.len());
                for msg in self.outgoing_unack_msg.iter_mut() {
                    self.binding.writer.write(msg);
                }
                self.recv_ack_check();
            }
            ProtocolMessageType::Pause => {
                self.binding.writer.pause();
            }
            ProtocolMessageType::Resume => {
                self.binding.writer.resume();
            }
        }
    }

    fn request_replay(&mut self, received_id: u32) {
        let now = Instant::now();
        let is_throttled = self.last_replay_request_time
            .map(|t| now.saturating_duration_since(t) <= self.config.replay_request_throttle)
            .unwrap_or(false);
        if is_throttled {
            trace!("received message #{} while expecting #{} - replay was requested recently", received_id, self.incoming_msg_id + 1);
            return;
        }

        debug!("received message #{} while expecting #{} - requesting replay", received_id, self.incoming_msg_id + 1);
        self.last_replay_request_time = Some(now);
        self.binding.writer.write(&mut ProtocolMessage::empty(ProtocolMessageType::ReplayRequest, 0));
    }

    /// Sends an ack if there is something to acknowledge and the last received message is old
    ///  enough. Otherwise re-checks when it will be.
    fn send_ack_check(&mut self) {
        if self.incoming_msg_id <= self.incoming_ack_id {
            return;
        }
        if self.incoming_ack_timeout.is_some() {
            return;
        }

        let time_since_last_incoming_msg = self.incoming_msg_last_time
            .map(|t| Instant::now().saturating_duration_since(t))
            .unwrap_or(Duration::MAX);
        if time_since_last_incoming_msg >= self.config.acknowledge_time {
            self.send_ack();
            return;
        }

        let delay = self.config.acknowledge_time - time_since_last_incoming_msg + self.config.ack_check_slack;
        self.incoming_ack_timeout = Some(self.schedule(delay, |inner| {
            inner.incoming_ack_timeout = None;
            inner.send_ack_check();
        }));
    }

    /// The outgoing timeout watchdog: the peer is considered gone if our oldest unacknowledged
    ///  message, the last data we received and the last timeout we reported are all older than
    ///  the timeout. High load on our side suppresses the timeout.
    fn recv_ack_check(&mut self) {
        if self.outgoing_msg_id <= self.outgoing_ack_id {
            return;
        }
        if self.outgoing_ack_timeout.is_some() {
            return;
        }
        if self.is_reconnecting {
            return;
        }
        let Some(oldest_unacknowledged) = self.outgoing_unack_msg.peek() else {
            return;
        };

        let now = Instant::now();
        let timeout = self.config.timeout_time;

        // a message that was never written is as stale as it gets
        let time_since_oldest_unacknowledged_msg = oldest_unacknowledged.written_time
            .map(|t| now.saturating_duration_since(t));
        let time_since_last_received_some_data = now.saturating_duration_since(self.binding.reader.last_read_time());
        let time_since_last_timeout = now.saturating_duration_since(self.last_socket_timeout_time);

        if time_since_oldest_unacknowledged_msg.map(|d| d >= timeout).unwrap_or(true)
            && time_since_last_received_some_data >= timeout
            && time_since_last_timeout >= timeout
        {
            if !self.load_estimator.has_high_load() {
                warn!("no ack from peer for {:?} and nothing received for {:?} - socket timeout",
                    time_since_oldest_unacknowledged_msg, time_since_last_received_some_data);
                self.last_socket_timeout_time = now;
                self.on_socket_timeout.fire(SocketTimeoutEvent {
                    unacknowledged_msg_count: self.outgoing_unack_msg.len(),
                    time_since_oldest_unacknowledged_msg,
                    time_since_last_received_some_data,
                });
                return;
            }
            debug!("peer looks unresponsive, but this process is under high load - not timing out");
        }

        let delay = [
            time_since_oldest_unacknowledged_msg.map(|d| timeout.saturating_sub(d)).unwrap_or(Duration::ZERO),
            timeout.saturating_sub(time_since_last_received_some_data),
            timeout.saturating_sub(time_since_last_timeout),
            self.config.min_timeout_check_interval,
        ].into_iter().max().unwrap_or(self.config.min_timeout_check_interval);

        self.outgoing_ack_timeout = Some(self.schedule(delay, |inner| {
            inner.outgoing_ack_timeout = None;
            inner.recv_ack_check();
        }));
    }

    fn begin_accept_reconnection(&mut self, connection: SocketConnection, initial_chunk: Option<Bytes>) {
        debug!("beginning reconnection");
        self.is_reconnecting = true;

        self.binding.dispose();
        self.on_control_message.flush_buffer();
        self.on_socket_close.flush_buffer();
        self.on_socket_timeout.flush_buffer();
        self.binding.socket.dispose();

        self.last_replay_request_time = None;
        self.last_socket_timeout_time = Instant::now();

        let SocketConnection { socket, events } = connection;
        self.binding = SocketBinding::new(socket, self.binding.generation + 1);
        self.start_pump(events);

        if let Some(chunk) = initial_chunk {
            self.accept_chunk(chunk);
        }
    }

    fn end_accept_reconnection(&mut self) {
        debug!("ending reconnection, re-sending {} unacknowledged messages", self.outgoing_unack_msg.len());
        self.is_reconnecting = false;

        // the peer may have missed our last ack
        self.incoming_ack_id = self.incoming_msg_id;
        self.binding.writer.write(&mut ProtocolMessage::empty(ProtocolMessageType::Ack, self.incoming_ack_id));

        for msg in self.outgoing_unack_msg.iter_mut() {
            self.binding.writer.write(msg);
        }
        self.recv_ack_check();
    }

    fn abort_tasks(&mut self) {
        for handle in [
            self.outgoing_ack_timeout.take(),
            self.incoming_ack_timeout.take(),
            self.keep_alive_handle.take(),
            self.binding.pump_handle.take(),
        ].into_iter().flatten() {
            handle.abort();
        }
    }

    fn dispose(&mut self) {
        self.is_disposed = true;
        self.abort_tasks();
        self.binding.dispose();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Forwards a socket's events to the protocol as long as the socket is the current one
async fn pump(inner: Weak<RwLock<Inner>>, generation: u64, mut events: mpsc::UnboundedReceiver<SocketEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut inner = inner.write().await;
        if inner.is_disposed || inner.binding.generation != generation {
            return;
        }

        match event {
            SocketEvent::Data(chunk) => {
                inner.accept_chunk(chunk);
            }
            SocketEvent::Close(close_event) => {
                debug!("socket {}", close_event);
                inner.on_socket_close.fire(close_event);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::load::FixedLoadEstimator;
    use crate::test_util::socket::{socket_pair, RecordingSocket};
    use crate::util::load_estimator::MockLoadEstimator;
    use rstest::rstest;

    async fn settle() {
        time::sleep(Duration::from_millis(1)).await;
    }

    async fn new_protocol(send_keep_alive: bool) -> (Arc<RecordingSocket>, PersistentProtocol, Arc<FixedLoadEstimator>) {
        let (socket, connection) = RecordingSocket::new();
        let load_estimator = Arc::new(FixedLoadEstimator::new(false));
        let protocol = PersistentProtocol::new(connection, PersistentProtocolOptions {
            initial_chunk: None,
            load_estimator: Some(load_estimator.clone()),
            send_keep_alive,
            config: Default::default(),
        }).await;
        (socket, protocol, load_estimator)
    }

    fn regular(id: u32, ack: u32, data: &'static [u8]) -> ProtocolMessage {
        ProtocolMessage::new(ProtocolMessageType::Regular, id, ack, Bytes::from_static(data))
    }

    fn received<T>(recv: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
        let mut result = Vec::new();
        while let Ok(event) = recv.try_recv() {
            result.push(event);
        }
        result
    }

    fn frames(messages: &[ProtocolMessage]) -> Vec<(ProtocolMessageType, u32, u32)> {
        messages.iter()
            .map(|m| (m.message_type, m.id, m.ack))
            .collect()
    }

    async fn unacked_ids(protocol: &PersistentProtocol) -> Vec<u32> {
        protocol.inner.read().await
            .outgoing_unack_msg.iter()
            .map(|m| m.id)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_duplicate_delivery() {
        let (socket, protocol, _) = new_protocol(false).await;

        socket.push_message(&regular(1, 0, b"a"));
        socket.push_message(&regular(1, 0, b"a"));
        socket.push_message(&regular(2, 0, b"b"));
        socket.push_message(&regular(2, 0, b"b"));
        socket.push_message(&regular(1, 0, b"a"));
        settle().await;

        let mut messages = protocol.subscribe_messages().await;
        assert_eq!(received(&mut messages), vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert_eq!(protocol.inner.read().await.incoming_msg_id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_triggers_throttled_replay_request() {
        let (socket, protocol, _) = new_protocol(false).await;
        let num_replay_requests = |messages: Vec<ProtocolMessage>| messages.iter()
            .filter(|m| m.message_type == ProtocolMessageType::ReplayRequest)
            .count();

        socket.push_message(&regular(1, 0, b"a"));
        socket.push_message(&regular(5, 0, b"e"));
        settle().await;
        assert_eq!(num_replay_requests(socket.take_written_messages()), 1);

        socket.push_message(&regular(6, 0, b"f"));
        settle().await;
        time::sleep(Duration::from_secs(5)).await;
        socket.push_message(&regular(7, 0, b"g"));
        settle().await;
        assert_eq!(num_replay_requests(socket.take_written_messages()), 0);

        time::sleep(Duration::from_secs(6)).await;
        socket.push_message(&regular(8, 0, b"h"));
        settle().await;
        assert_eq!(num_replay_requests(socket.take_written_messages()), 1);

        // only the message without a gap was delivered
        let mut messages = protocol.subscribe_messages().await;
        assert_eq!(received(&mut messages), vec![Bytes::from_static(b"a")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_prunes_unacked_queue() {
        let (socket, protocol, _) = new_protocol(false).await;

        for _ in 0..5 {
            protocol.send(Bytes::from_static(b"x")).await;
        }
        assert_eq!(unacked_ids(&protocol).await, vec![1, 2, 3, 4, 5]);
        assert_eq!(protocol.unacknowledged_count().await, 5);

        socket.push_message(&ProtocolMessage::empty(ProtocolMessageType::Ack, 3));
        settle().await;

        assert_eq!(unacked_ids(&protocol).await, vec![4, 5]);
        assert_eq!(protocol.inner.read().await.outgoing_ack_id, 3);
        assert_eq!(protocol.unacknowledged_count().await, 2);

        // acks never go backwards
        socket.push_message(&regular(1, 2, b"a"));
        settle().await;
        assert_eq!(protocol.inner.read().await.outgoing_ack_id, 3);
        assert_eq!(unacked_ids(&protocol).await, vec![4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_beyond_sent_messages_is_capped() {
        let (socket, protocol, _) = new_protocol(false).await;
        let mut timeouts = protocol.subscribe_socket_timeout().await;

        protocol.send(Bytes::from_static(b"a")).await;
        socket.push_message(&ProtocolMessage::empty(ProtocolMessageType::Ack, 5));
        settle().await;

        assert_eq!(protocol.inner.read().await.outgoing_ack_id, 1);
        assert_eq!(protocol.unacknowledged_count().await, 0);
        assert!(unacked_ids(&protocol).await.is_empty());

        // later sends are tracked and time out as usual
        protocol.send(Bytes::from_static(b"b")).await;
        assert_eq!(protocol.unacknowledged_count().await, 1);
        time::sleep(Duration::from_secs(21)).await;
        assert_eq!(received(&mut timeouts).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_piggybacks_ack() {
        let (socket, protocol, _) = new_protocol(false).await;

        socket.push_message(&regular(1, 0, b"a"));
        socket.push_message(&regular(2, 0, b"b"));
        settle().await;
        protocol.send(Bytes::from_static(b"reply")).await;
        settle().await;

        assert_eq!(frames(&socket.take_written_messages()), vec![(ProtocolMessageType::Regular, 1, 2)]);

        // everything was acknowledged, so no explicit ack is sent
        time::sleep(Duration::from_secs(3)).await;
        assert!(socket.take_written_messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_is_sent_after_acknowledge_time() {
        let (socket, _protocol, _) = new_protocol(false).await;

        socket.push_message(&regular(1, 0, b"a"));
        settle().await;
        time::sleep(Duration::from_millis(1990)).await;
        assert!(socket.take_written_messages().is_empty());

        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(frames(&socket.take_written_messages()), vec![(ProtocolMessageType::Ack, 0, 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_covers_messages_received_while_waiting() {
        let (socket, _protocol, _) = new_protocol(false).await;

        socket.push_message(&regular(1, 0, b"a"));
        settle().await;
        time::sleep(Duration::from_millis(1000)).await;
        socket.push_message(&regular(2, 0, b"b"));
        settle().await;

        // the first check finds the last message too recent and re-schedules
        time::sleep(Duration::from_millis(1500)).await;
        assert!(socket.take_written_messages().is_empty());

        time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(frames(&socket.take_written_messages()), vec![(ProtocolMessageType::Ack, 0, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_socket_timeout() {
        let (_socket, protocol, _) = new_protocol(false).await;
        let mut timeouts = protocol.subscribe_socket_timeout().await;

        protocol.send(Bytes::from_static(b"a")).await;
        time::sleep(Duration::from_millis(19900)).await;
        assert!(received(&mut timeouts).is_empty());

        time::sleep(Duration::from_millis(200)).await;
        let events = received(&mut timeouts);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].unacknowledged_msg_count, 1);
        assert!(events[0].time_since_oldest_unacknowledged_msg.unwrap() >= Duration::from_secs(20));
        assert!(events[0].time_since_last_received_some_data >= Duration::from_secs(20));

        // no further checks until the next send
        time::sleep(Duration::from_secs(60)).await;
        assert!(received(&mut timeouts).is_empty());

        protocol.send(Bytes::from_static(b"b")).await;
        time::sleep(Duration::from_secs(21)).await;
        assert_eq!(received(&mut timeouts).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_received_data_defers_timeout() {
        let (socket, protocol, _) = new_protocol(false).await;
        let mut timeouts = protocol.subscribe_socket_timeout().await;

        protocol.send(Bytes::from_static(b"a")).await;
        time::sleep(Duration::from_secs(15)).await;
        socket.push_message(&ProtocolMessage::empty(ProtocolMessageType::KeepAlive, 0));
        settle().await;

        time::sleep(Duration::from_secs(10)).await;
        assert!(received(&mut timeouts).is_empty());

        time::sleep(Duration::from_secs(11)).await;
        assert_eq!(received(&mut timeouts).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_load_suppresses_timeout() {
        let (_socket, protocol, load_estimator) = new_protocol(false).await;
        let mut timeouts = protocol.subscribe_socket_timeout().await;
        load_estimator.set_high_load(true);

        protocol.send(Bytes::from_static(b"a")).await;
        time::sleep(Duration::from_secs(30)).await;
        assert!(received(&mut timeouts).is_empty());

        load_estimator.set_high_load(false);
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(received(&mut timeouts).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_is_checked_only_when_timing_out() {
        let mut load_estimator = MockLoadEstimator::new();
        let mut num_calls = 0;
        load_estimator.expect_has_high_load()
            .times(2)
            .returning(move || {
                num_calls += 1;
                num_calls == 1
            });

        let (_socket, connection) = RecordingSocket::new();
        let protocol = PersistentProtocol::new(connection, PersistentProtocolOptions {
            initial_chunk: None,
            load_estimator: Some(Arc::new(load_estimator)),
            send_keep_alive: false,
            config: Default::default(),
        }).await;
        let mut timeouts = protocol.subscribe_socket_timeout().await;

        protocol.send(Bytes::from_static(b"a")).await;
        time::sleep(Duration::from_millis(20100)).await;
        assert!(received(&mut timeouts).is_empty());

        // re-checked after the minimum interval
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(received(&mut timeouts).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_timeout_when_everything_is_acknowledged() {
        let (socket, protocol, _) = new_protocol(false).await;
        let mut timeouts = protocol.subscribe_socket_timeout().await;

        protocol.send(Bytes::from_static(b"a")).await;
        socket.push_message(&ProtocolMessage::empty(ProtocolMessageType::Ack, 1));
        settle().await;

        time::sleep(Duration::from_secs(60)).await;
        assert!(received(&mut timeouts).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_request_from_peer() {
        let (socket, protocol, _) = new_protocol(false).await;

        protocol.send(Bytes::from_static(b"a")).await;
        protocol.send(Bytes::from_static(b"b")).await;
        protocol.send(Bytes::from_static(b"c")).await;
        socket.push_message(&ProtocolMessage::empty(ProtocolMessageType::Ack, 1));
        settle().await;
        socket.take_written();

        socket.push_message(&ProtocolMessage::empty(ProtocolMessageType::ReplayRequest, 0));
        settle().await;

        let replayed = socket.take_written_messages();
        assert_eq!(frames(&replayed), vec![
            (ProtocolMessageType::Regular, 2, 0),
            (ProtocolMessageType::Regular, 3, 0),
        ]);
        assert_eq!(replayed[0].data.as_ref(), b"b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnection_replays_in_order() {
        let (old_socket, protocol, _) = new_protocol(false).await;
        for _ in 0..5 {
            protocol.send(Bytes::from_static(b"x")).await;
        }
        old_socket.push_message(&ProtocolMessage::empty(ProtocolMessageType::Ack, 2));
        settle().await;
        assert_eq!(unacked_ids(&protocol).await, vec![3, 4, 5]);

        let (new_socket, new_connection) = RecordingSocket::new();
        protocol.begin_accept_reconnection(new_connection, None).await;
        assert!(old_socket.is_disposed());
        assert!(protocol.inner.read().await.is_reconnecting);

        protocol.end_accept_reconnection().await;
        protocol.drain().await.unwrap();

        assert_eq!(frames(&new_socket.take_written_messages()), vec![
            (ProtocolMessageType::Ack, 0, 0),
            (ProtocolMessageType::Regular, 3, 0),
            (ProtocolMessageType::Regular, 4, 0),
            (ProtocolMessageType::Regular, 5, 0),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_reconnecting_is_queued() {
        let (_old_socket, protocol, _) = new_protocol(false).await;
        protocol.send(Bytes::from_static(b"a")).await;

        let (new_socket, new_connection) = RecordingSocket::new();
        protocol.begin_accept_reconnection(new_connection, None).await;
        protocol.send(Bytes::from_static(b"b")).await;
        settle().await;
        assert!(new_socket.written().is_empty());
        assert_eq!(unacked_ids(&protocol).await, vec![1, 2]);

        protocol.end_accept_reconnection().await;
        settle().await;
        let written = new_socket.take_written_messages();
        assert_eq!(frames(&written), vec![
            (ProtocolMessageType::Ack, 0, 0),
            (ProtocolMessageType::Regular, 1, 0),
            (ProtocolMessageType::Regular, 2, 0),
        ]);
        assert_eq!(written[2].data.as_ref(), b"b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnection_ignores_old_socket() {
        let (old_socket, protocol, _) = new_protocol(false).await;
        let mut messages = protocol.subscribe_messages().await;
        let mut closes = protocol.subscribe_socket_close().await;

        let (new_socket, new_connection) = RecordingSocket::new();
        let mut initial_chunk = bytes::BytesMut::new();
        regular(1, 0, b"first").ser(&mut initial_chunk);
        protocol.begin_accept_reconnection(new_connection, Some(initial_chunk.freeze())).await;

        old_socket.push_message(&regular(2, 0, b"stale"));
        old_socket.close(SocketCloseEvent::with_error("gone"));
        new_socket.push_message(&regular(2, 0, b"second"));
        settle().await;
        protocol.end_accept_reconnection().await;

        assert_eq!(received(&mut messages), vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]);
        assert!(received(&mut closes).is_empty());

        new_socket.close(SocketCloseEvent::clean());
        settle().await;
        assert_eq!(received(&mut closes), vec![SocketCloseEvent::clean()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnection_discards_buffered_events() {
        let (socket, protocol, _) = new_protocol(false).await;
        socket.push_message(&ProtocolMessage::new(ProtocolMessageType::Control, 0, 0, Bytes::from_static(b"old")));
        socket.close(SocketCloseEvent::clean());
        settle().await;

        let (_new_socket, new_connection) = RecordingSocket::new();
        protocol.begin_accept_reconnection(new_connection, None).await;
        protocol.end_accept_reconnection().await;

        let mut control_messages = protocol.subscribe_control_messages().await;
        let mut closes = protocol.subscribe_socket_close().await;
        assert!(received(&mut control_messages).is_empty());
        assert!(received(&mut closes).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive() {
        let (socket, _protocol, _) = new_protocol(true).await;

        time::sleep(Duration::from_millis(5001)).await;
        assert_eq!(frames(&socket.take_written_messages()), vec![(ProtocolMessageType::KeepAlive, 0, 0)]);

        socket.push_message(&regular(1, 0, b"a"));
        settle().await;
        time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(frames(&socket.take_written_messages()), vec![
            (ProtocolMessageType::Ack, 0, 1),
            (ProtocolMessageType::KeepAlive, 0, 1),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_disabled() {
        let (socket, _protocol, _) = new_protocol(false).await;
        time::sleep(Duration::from_secs(20)).await;
        assert!(socket.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_from_peer() {
        let (socket, protocol, _) = new_protocol(false).await;

        socket.push_message(&ProtocolMessage::empty(ProtocolMessageType::Pause, 0));
        settle().await;
        protocol.send(Bytes::from_static(b"a")).await;
        settle().await;
        assert!(socket.written().is_empty());

        socket.push_message(&ProtocolMessage::empty(ProtocolMessageType::Resume, 0));
        settle().await;
        assert_eq!(frames(&socket.take_written_messages()), vec![(ProtocolMessageType::Regular, 1, 0)]);
    }

    #[rstest]
    #[case::pause(ProtocolMessageType::Pause)]
    #[case::resume(ProtocolMessageType::Resume)]
    #[tokio::test(start_paused = true)]
    async fn test_send_pause_resume(#[case] message_type: ProtocolMessageType) {
        let (socket, protocol, _) = new_protocol(false).await;
        match message_type {
            ProtocolMessageType::Pause => protocol.send_pause().await,
            _ => protocol.send_resume().await,
        }
        settle().await;
        assert_eq!(frames(&socket.take_written_messages()), vec![(message_type, 0, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_disconnect_once() {
        let (socket, protocol, _) = new_protocol(false).await;

        protocol.send_disconnect().await;
        protocol.send_disconnect().await;

        // flushed without waiting for the writer's task
        assert_eq!(frames(&socket.take_written_messages()), vec![(ProtocolMessageType::Disconnect, 0, 0)]);
        settle().await;
        assert!(socket.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_disconnect() {
        let (socket, protocol, _) = new_protocol(false).await;

        socket.push_message(&ProtocolMessage::empty(ProtocolMessageType::Disconnect, 0));
        settle().await;

        let mut did_dispose = protocol.subscribe_did_dispose().await;
        assert_eq!(received(&mut did_dispose), vec![()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_messages() {
        let (socket, protocol, _) = new_protocol(false).await;

        protocol.send_control(Bytes::from_static(b"hello")).await;
        socket.push_message(&ProtocolMessage::new(ProtocolMessageType::Control, 0, 0, Bytes::from_static(b"ctl")));
        settle().await;

        let written = socket.take_written_messages();
        assert_eq!(frames(&written), vec![(ProtocolMessageType::Control, 0, 0)]);
        assert_eq!(written[0].data.as_ref(), b"hello");
        assert_eq!(protocol.unacknowledged_count().await, 0);

        let mut control_messages = protocol.subscribe_control_messages().await;
        let mut messages = protocol.subscribe_messages().await;
        assert_eq!(received(&mut control_messages), vec![Bytes::from_static(b"ctl")]);
        assert!(received(&mut messages).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_socket_close() {
        let (socket, protocol, _) = new_protocol(false).await;
        socket.close(SocketCloseEvent::with_error("boom"));
        settle().await;

        let mut closes = protocol.subscribe_socket_close().await;
        assert_eq!(received(&mut closes), vec![SocketCloseEvent::with_error("boom")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_chunk() {
        let (socket, connection) = RecordingSocket::new();
        let mut buf = bytes::BytesMut::new();
        regular(1, 0, b"early").ser(&mut buf);
        regular(2, 0, b"la").ser(&mut buf);
        let buf = buf.freeze();

        let protocol = PersistentProtocol::new(connection, PersistentProtocolOptions {
            initial_chunk: Some(buf.slice(..buf.len() - 1)),
            load_estimator: Some(Arc::new(FixedLoadEstimator::new(false))),
            send_keep_alive: false,
            config: Default::default(),
        }).await;
        socket.push_data(buf.slice(buf.len() - 1..));
        settle().await;

        let mut messages = protocol.subscribe_messages().await;
        assert_eq!(received(&mut messages), vec![Bytes::from_static(b"early"), Bytes::from_static(b"la")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_entire_buffer() {
        let (socket, protocol, _) = new_protocol(false).await;
        socket.push_data(Bytes::from_static(&[1, 0, 0]));
        settle().await;

        assert_eq!(protocol.read_entire_buffer().await.as_ref(), &[1, 0, 0]);
        assert!(protocol.read_entire_buffer().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_millis_since_last_incoming_data() {
        let (socket, protocol, _) = new_protocol(false).await;
        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(protocol.millis_since_last_incoming_data().await, 3000);

        socket.push_data(Bytes::from_static(&[0]));
        settle().await;
        assert_eq!(protocol.millis_since_last_incoming_data().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_stops_timers() {
        let (socket, protocol, _) = new_protocol(true).await;
        let mut timeouts = protocol.subscribe_socket_timeout().await;
        protocol.send(Bytes::from_static(b"a")).await;
        socket.push_message(&regular(1, 0, b"a"));
        settle().await;
        socket.take_written();

        protocol.dispose().await;
        time::sleep(Duration::from_secs(60)).await;

        assert!(received(&mut timeouts).is_empty());
        assert!(socket.written().is_empty());
        assert!(!socket.is_disposed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hello_world_between_peers() {
        let (_, connection_a, _, connection_b) = socket_pair();
        let options = || PersistentProtocolOptions {
            initial_chunk: None,
            load_estimator: Some(Arc::new(FixedLoadEstimator::new(false))),
            send_keep_alive: false,
            config: Default::default(),
        };
        let a = PersistentProtocol::new(connection_a, options()).await;
        let b = PersistentProtocol::new(connection_b, options()).await;
        let mut b_messages = b.subscribe_messages().await;

        a.send(Bytes::from_static(b"hello")).await;
        a.send(Bytes::from_static(b"world")).await;
        assert_eq!(frames(&a.inner.read().await.outgoing_unack_msg.iter().cloned().collect::<Vec<_>>()), vec![
            (ProtocolMessageType::Regular, 1, 0),
            (ProtocolMessageType::Regular, 2, 0),
        ]);

        settle().await;
        assert_eq!(received(&mut b_messages), vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")]);
        assert_eq!(a.unacknowledged_count().await, 2);

        time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(b.inner.read().await.incoming_ack_id, 2);
        assert_eq!(a.unacknowledged_count().await, 0);
        assert!(unacked_ids(&a).await.is_empty());
    }
}
