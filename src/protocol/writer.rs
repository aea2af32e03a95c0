use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::protocol::message::{ProtocolHeader, ProtocolMessage};
use crate::socket::{Socket, SocketDiagnosticsEventType};


struct WriterState {
    is_disposed: bool,
    is_paused: bool,
    data: Vec<Bytes>,
    total_len: usize,
    /// the pending 'write soon' task, if any
    write_now_handle: Option<JoinHandle<()>>,
    last_write_time: Instant,
}
impl WriterState {
    /// adds a chunk, returning whether the buffer was empty before
    fn add(&mut self, header: Bytes, data: Bytes) -> bool {
        let was_empty = self.total_len == 0;
        self.total_len += header.len() + data.len();
        self.data.push(header);
        self.data.push(data);
        was_empty
    }

    fn take(&mut self) -> Bytes {
        let mut result = BytesMut::with_capacity(self.total_len);
        for chunk in self.data.drain(..) {
            result.extend_from_slice(&chunk);
        }
        self.total_len = 0;
        result.freeze()
    }
}

/// Serializes messages and writes them to a socket.
///
/// Writes are not passed to the socket right away but collected and flushed by a task that
///  is spawned for the first write after a flush. All messages written before that task gets
///  to run go to the socket as a single buffer.
///
/// Clones share their state, i.e. they write through the same buffer.
#[derive(Clone)]
pub struct ProtocolWriter {
    socket: Arc<dyn Socket>,
    state: Arc<Mutex<WriterState>>,
}
impl ProtocolWriter {
    pub fn new(socket: Arc<dyn Socket>) -> ProtocolWriter {
        ProtocolWriter {
            socket,
            state: Arc::new(Mutex::new(WriterState {
                is_disposed: false,
                is_paused: false,
                data: Vec::new(),
                total_len: 0,
                write_now_handle: None,
                last_write_time: Instant::now(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WriterState> {
        lock_state(&self.state)
    }

    pub fn last_write_time(&self) -> Instant {
        self.lock().last_write_time
    }

    /// Best-effort final flush. Errors are ignored since the socket may be gone already.
    pub fn dispose(&self) {
        if let Err(e) = self.flush() {
            debug!("error flushing protocol writer on dispose - ignoring: {}", e);
        }

        let mut state = self.lock();
        state.is_disposed = true;
        if let Some(handle) = state.write_now_handle.take() {
            handle.abort();
        }
    }

    pub async fn drain(&self) -> anyhow::Result<()> {
        self.flush()?;
        self.socket.drain().await
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        let mut state = self.lock();
        write_now(self.socket.as_ref(), &mut state)
    }

    pub fn pause(&self) {
        self.lock().is_paused = true;
    }

    pub fn resume(&self) {
        let mut state = self.lock();
        state.is_paused = false;
        if let Err(e) = write_now(self.socket.as_ref(), &mut state) {
            debug!("error writing to socket on resume: {}", e);
        }
    }

    pub fn write(&self, msg: &mut ProtocolMessage) {
        let mut state = self.lock();
        if state.is_disposed {
            // there can be left-over tasks that complete after the protocol is gone and try to
            //  send a response
            debug!("ignoring write of {:?} to disposed protocol writer", msg);
            return;
        }

        let now = Instant::now();
        msg.written_time = Some(now);
        state.last_write_time = now;

        let mut header = BytesMut::with_capacity(ProtocolHeader::SERIALIZED_LEN);
        msg.header().ser(&mut header);
        self.socket.trace_socket_event(SocketDiagnosticsEventType::ProtocolHeaderWrite, header.as_ref());
        self.socket.trace_socket_event(SocketDiagnosticsEventType::ProtocolMessageWrite, msg.data.as_ref());

        trace!("writing {:?}", msg);
        if state.add(header.freeze(), msg.data.clone()) {
            self.schedule_writing(&mut state);
        }
    }

    fn schedule_writing(&self, state: &mut WriterState) {
        if state.write_now_handle.is_some() {
            return;
        }

        let socket = self.socket.clone();
        let state_weak = Arc::downgrade(&self.state);
        state.write_now_handle = Some(tokio::spawn(async move {
            if let Some(state) = state_weak.upgrade() {
                let mut state = lock_state(&state);
                state.write_now_handle = None;
                if let Err(e) = write_now(socket.as_ref(), &mut state) {
                    debug!("error writing to socket: {}", e);
                }
            }
        }));
    }
}

fn lock_state(state: &Mutex<WriterState>) -> MutexGuard<'_, WriterState> {
    // the state is consistent after every mutation, so a panic elsewhere does not taint it
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn write_now(socket: &dyn Socket, state: &mut WriterState) -> anyhow::Result<()> {
    if state.total_len == 0 || state.is_paused {
        return Ok(());
    }

    let data = state.take();
    socket.trace_socket_event(SocketDiagnosticsEventType::ProtocolWrite, data.as_ref());
    socket.write(data)
}
