use std::collections::VecDeque;

use tokio::sync::mpsc;


/// Publish / subscribe for a single kind of event. Events that are fired while nobody listens
///  are buffered and handed to the first subscriber, in order, so nothing gets lost between
///  creating an object and subscribing to its events.
///
/// Subscribers are receiving ends of unbounded channels. Dropping a receiver unsubscribes.
pub struct BufferedEmitter<T> {
    subscribers: Vec<mpsc::UnboundedSender<T>>,
    buffer: VecDeque<T>,
}
impl<T> Default for BufferedEmitter<T> {
    fn default() -> Self {
        BufferedEmitter {
            subscribers: Vec::new(),
            buffer: VecDeque::new(),
        }
    }
}

impl<T: Clone> BufferedEmitter<T> {
    pub fn new() -> BufferedEmitter<T> {
        Default::default()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<T> {
        let (send, recv) = mpsc::unbounded_channel();
        self.subscribers.retain(|s| !s.is_closed());
        if self.subscribers.is_empty() {
            for event in self.buffer.drain(..) {
                let _ = send.send(event);
            }
        }
        self.subscribers.push(send);
        recv
    }

    pub fn fire(&mut self, event: T) {
        self.subscribers.retain(|s| !s.is_closed());
        if self.subscribers.is_empty() {
            self.buffer.push_back(event);
            return;
        }

        for subscriber in &self.subscribers {
            let _ = subscriber.send(event.clone());
        }
    }

    /// discards events that were buffered for a future subscriber
    pub fn flush_buffer(&mut self) {
        self.buffer.clear();
    }

    pub fn num_buffered(&self) -> usize {
        self.buffer.len()
    }
}
