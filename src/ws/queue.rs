use std::collections::VecDeque;

use crate::types::Message;

/// Bounded FIFO of messages waiting for the connection to come back.
///
/// When full, admitting a new message evicts the oldest one.
#[derive(Debug)]
pub(crate) struct OutboundQueue {
    messages: VecDeque<Message>,
    max_size: usize,
}

impl OutboundQueue {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(max_size.min(64)),
            max_size,
        }
    }

    /// Append `message`, returning the message evicted to make room, if any.
    ///
    /// A zero-capacity queue stores nothing; callers must not push into one.
    pub(crate) fn push(&mut self, message: Message) -> Option<Message> {
        let evicted = if self.messages.len() >= self.max_size {
            self.messages.pop_front()
        } else {
            None
        };
        self.messages.push_back(message);
        evicted
    }

    pub(crate) fn pop_front(&mut self) -> Option<Message> {
        self.messages.pop_front()
    }

    /// Put back a message that was dequeued but could not be sent.
    pub(crate) fn push_front(&mut self, message: Message) {
        self.messages.push_front(message);
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.messages.clear();
    }
}
