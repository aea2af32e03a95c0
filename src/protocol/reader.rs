use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::trace;

use crate::protocol::chunk_stream::ChunkStream;
use crate::protocol::message::{ProtocolHeader, ProtocolMessage};
use crate::socket::{Socket, SocketDiagnosticsEventType};


enum ReadState {
    Header,
    Body(ProtocolHeader),
}
impl ReadState {
    fn read_len(&self) -> usize {
        match self {
            ReadState::Header => ProtocolHeader::SERIALIZED_LEN,
            ReadState::Body(header) => header.data_len as usize,
        }
    }
}

/// Reassembles frames from the chunks a socket delivers. Chunk boundaries are arbitrary, so a
///  frame can arrive in many pieces, and a single chunk can contain many frames.
///
/// The reader is pull-based: the owner feeds chunks with [ProtocolReader::accept_chunk] and then
///  calls [ProtocolReader::next_message] until it returns `None`. Handling a message may lead to
///  the reader being disposed, so the owner's loop is expected to check
///  [ProtocolReader::is_disposed] after every message; a disposed reader returns no further
///  messages, and the bytes it buffered are left untouched.
pub struct ProtocolReader {
    socket: Arc<dyn Socket>,
    incoming_data: ChunkStream,
    state: ReadState,
    last_read_time: Instant,
    is_disposed: bool,
}
impl ProtocolReader {
    pub fn new(socket: Arc<dyn Socket>) -> ProtocolReader {
        ProtocolReader {
            socket,
            incoming_data: ChunkStream::new(),
            state: ReadState::Header,
            last_read_time: Instant::now(),
            is_disposed: false,
        }
    }

    pub fn last_read_time(&self) -> Instant {
        self.last_read_time
    }

    pub fn is_disposed(&self) -> bool {
        self.is_disposed
    }

    pub fn dispose(&mut self) {
        self.is_disposed = true;
    }

    pub fn accept_chunk(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.last_read_time = Instant::now();
        self.incoming_data.accept_chunk(chunk);
    }

    pub fn next_message(&mut self) -> Option<ProtocolMessage> {
        loop {
            if self.is_disposed || self.incoming_data.len() < self.state.read_len() {
                return None;
            }

            let buf = self.incoming_data.read(self.state.read_len());
            match self.state {
                ReadState::Header => {
                    let header = ProtocolHeader::deser(&mut buf.as_ref())
                        .expect("buffer should have exactly the header's length");
                    self.socket.trace_socket_event(SocketDiagnosticsEventType::ProtocolHeaderRead, buf.as_ref());
                    self.state = ReadState::Body(header);
                }
                ReadState::Body(header) => {
                    self.state = ReadState::Header;
                    self.socket.trace_socket_event(SocketDiagnosticsEventType::ProtocolMessageRead, buf.as_ref());
                    trace!("read {:?} with {} bytes", header.message_type, buf.len());
                    return Some(ProtocolMessage::new(header.message_type, header.id, header.ack, buf));
                }
            }
        }
    }

    /// Returns everything that is buffered but not yet part of a returned message. This is for
    ///  handing over bytes from one reader to another, e.g. when a socket is taken over.
    pub fn read_entire_buffer(&mut self) -> Bytes {
        let len = self.incoming_data.len();
        self.incoming_data.read(len)
    }
}
