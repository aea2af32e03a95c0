//! A message protocol on top of an arbitrary duplex byte stream ("socket"), turning a byte pipe
//!  that may be dropped and replaced at any time into a stream of discrete messages.
//!
//! There are two flavors:
//! * [protocol::simple::Protocol] frames messages on a single socket and nothing else. If the
//!    socket goes away, so does the conversation.
//! * [protocol::persistent::PersistentProtocol] adds sequence numbers, acknowledgements,
//!    replay of unacknowledged messages and a way to swap the underlying socket mid-stream
//!    (reconnection) without losing or duplicating messages. Delivery is at-least-once on the
//!    wire and exactly-once, in order, towards the application.
//!
//! ## Frame format
//!
//! All numbers in network byte order (BE):
//! ```ascii
//!  0: message type (u8):
//!     * 0 None
//!     * 1 Regular - sequenced application payload
//!     * 2 Control - unsequenced application payload, e.g. handshake data
//!     * 3 Ack
//!     * 4 (reserved)
//!     * 5 Disconnect
//!     * 6 ReplayRequest - ask the peer to resend all unacknowledged messages
//!     * 7 Pause
//!     * 8 Resume
//!     * 9 KeepAlive
//!  1: id (u32) - sequence number for 'Regular' messages, 0 otherwise
//!  5: ack (u32) - the highest 'Regular' id the sender has received from its peer
//!  9: data length (u32)
//! 13: data
//! ```
//!
//! Every frame carries an ack, so acknowledgements piggy-back on regular traffic. Explicit
//!  'Ack' frames are sent only if there is nothing else going the other way for a while.
//!
//! ## Not covered
//!
//! * ordering across several independent protocols / sockets
//! * exactly-once delivery on the wire: messages may be re-sent, the receiver drops duplicates
//! * encryption, compression, version negotiation

pub mod protocol;
pub mod socket;
pub mod util;
pub mod test_util;
