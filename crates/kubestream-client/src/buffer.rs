use std::collections::VecDeque;

use crate::message::Message;

/// Sliding window of the newest messages of one session
#[derive(Clone, Debug)]
pub struct MessageBuffer {
    /// Internal storage, oldest first
    entries: VecDeque<Message>,

    /// Maximum number of messages kept
    capacity: usize,

    /// Id given to the next pushed message
    next_id: u64,
}

impl MessageBuffer {
    /// Create a new buffer; capacity is at least one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            next_id: 0,
        }
    }

    /// Push a message, evicting the oldest when full; returns the stored copy
    pub fn push(&mut self, mut message: Message) -> &Message {
        message.id = self.next_id;
        self.next_id += 1;

        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(message);
        &self.entries[self.entries.len() - 1]
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Message> + ExactSizeIterator {
        self.entries.iter()
    }

    /// All messages (cloned for rendering)
    pub fn all(&self) -> Vec<Message> {
        self.entries.iter().cloned().collect()
    }

    /// Messages whose text contains `needle` (all of them for an empty needle)
    pub fn filtered(&self, needle: &str) -> Vec<Message> {
        self.entries
            .iter()
            .filter(|m| needle.is_empty() || m.text.contains(needle))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: u64) -> Option<&Message> {
        self.position(id).map(|i| &self.entries[i])
    }

    /// Index of a message by id, if it is still held
    pub fn position(&self, id: u64) -> Option<usize> {
        let first = self.entries.front()?.id;
        let index = id.checked_sub(first)? as usize;
        self.entries.get(index).filter(|m| m.id == id).map(|_| index)
    }

    pub fn last(&self) -> Option<&Message> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Export all messages as raw text, one per line
    pub fn export_raw(&self) -> String {
        self.entries
            .iter()
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_id = 0;
    }
}
