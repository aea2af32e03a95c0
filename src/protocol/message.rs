use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::time::Instant;
use tracing::warn;


#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ProtocolMessageType {
    None = 0,
    /// sequenced and acknowledged application payload
    Regular = 1,
    /// unsequenced application payload that survives reconnects, e.g. for handshakes
    Control = 2,
    Ack = 3,
    Disconnect = 5,
    ReplayRequest = 6,
    Pause = 7,
    Resume = 8,
    KeepAlive = 9,
}

#[derive(Clone, Eq, PartialEq)]
pub struct ProtocolMessage {
    pub message_type: ProtocolMessageType,
    /// sequence number of a `Regular` message, 0 for all other types
    pub id: u32,
    /// highest `Regular` id the sender has received from the peer, or 0
    pub ack: u32,
    pub data: Bytes,
    /// set by the writer every time the message is written, i.e. updated on re-send
    pub written_time: Option<Instant>,
}
impl Debug for ProtocolMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}{{id:{}, ack:{}, len:{}}}", self.message_type, self.id, self.ack, self.data.len())
    }
}

impl ProtocolMessage {
    pub fn new(message_type: ProtocolMessageType, id: u32, ack: u32, data: Bytes) -> ProtocolMessage {
        ProtocolMessage {
            message_type,
            id,
            ack,
            data,
            written_time: None,
        }
    }

    pub fn empty(message_type: ProtocolMessageType, ack: u32) -> ProtocolMessage {
        Self::new(message_type, 0, ack, Bytes::new())
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// serializes the complete frame, i.e. header and data
    pub fn ser(&self, buf: &mut BytesMut) {
        self.header().ser(buf);
        buf.put_slice(&self.data);
    }

    pub fn header(&self) -> ProtocolHeader {
        ProtocolHeader {
            message_type: self.message_type,
            id: self.id,
            ack: self.ack,
            data_len: frame_data_len(self.data.len()),
        }
    }
}


/// The header stores the data length as a u32, so larger payloads can not be framed.
fn frame_data_len(len: usize) -> u32 {
    debug_assert!(len <= u32::MAX as usize, "payload of {} bytes is too large for a single frame", len);
    len as u32
}


#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ProtocolHeader {
    pub message_type: ProtocolMessageType,
    pub id: u32,
    pub ack: u32,
    pub data_len: u32,
}
impl ProtocolHeader {
    pub const SERIALIZED_LEN: usize = 13;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.message_type.into());
        buf.put_u32(self.id);
        buf.put_u32(self.ack);
        buf.put_u32(self.data_len);
    }

    /// Parses a header from a buffer that holds (at least) [ProtocolHeader::SERIALIZED_LEN] bytes.
    ///
    /// An unknown message type is not fatal: the body still has to be skipped to stay in sync
    ///  with the peer, so it is parsed as 'None' which is a no-op for all receivers.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ProtocolHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            anyhow::bail!("incomplete protocol header: {} bytes", buf.remaining());
        }

        let raw_type = buf.get_u8();
        let message_type = match ProtocolMessageType::try_from(raw_type) {
            Ok(t) => t,
            Err(_) => {
                warn!("received message with unknown type {} - treating it as 'None'", raw_type);
                ProtocolMessageType::None
            }
        };

        Ok(ProtocolHeader {
            message_type,
            id: buf.get_u32(),
            ack: buf.get_u32(),
            data_len: buf.get_u32(),
        })
    }
}
