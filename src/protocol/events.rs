use std::time::Duration;


/// Fired when the peer looks dead: messages remain unacknowledged, and nothing at all was
///  received, for longer than the configured timeout. The protocol itself takes no action, it
///  is up to the owner to drop the socket and reconnect.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SocketTimeoutEvent {
    pub unacknowledged_msg_count: usize,
    /// `None` if the oldest unacknowledged message was not written to a socket yet
    pub time_since_oldest_unacknowledged_msg: Option<Duration>,
    pub time_since_last_received_some_data: Duration,
}
