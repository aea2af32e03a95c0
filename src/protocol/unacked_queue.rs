use std::collections::VecDeque;

use crate::protocol::message::ProtocolMessage;


/// Sent 'Regular' messages that the peer did not acknowledge yet, in the order they were sent
///  (which is ascending id order). Acknowledgement removes messages from the front only.
#[derive(Default)]
pub struct UnacknowledgedQueue {
    messages: VecDeque<ProtocolMessage>,
}
impl UnacknowledgedQueue {
    pub fn new() -> UnacknowledgedQueue {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, msg: ProtocolMessage) {
        debug_assert!(self.messages.back().map(|last| last.id < msg.id).unwrap_or(true));
        self.messages.push_back(msg);
    }

    /// the oldest unacknowledged message
    pub fn peek(&self) -> Option<&ProtocolMessage> {
        self.messages.front()
    }

    /// Removes all messages with an id up to (and including) `ack`, returning how many were removed.
    pub fn acknowledge(&mut self, ack: u32) -> usize {
        let mut num_removed = 0;
        while let Some(head) = self.messages.front() {
            if head.id > ack {
                break;
            }
            self.messages.pop_front();
            num_removed += 1;
        }
        num_removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProtocolMessage> {
        self.messages.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ProtocolMessage> {
        self.messages.iter_mut()
    }
}
