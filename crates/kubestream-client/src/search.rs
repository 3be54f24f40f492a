use crate::buffer::MessageBuffer;
use crate::message::Message;

/// Search term plus the current, first and last matching message
///
/// Positions are message ids, so they stay valid while older messages are
/// evicted; an evicted position simply stops resolving.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchCursor {
    term: String,
    first: Option<u64>,
    last: Option<u64>,
    pos: Option<u64>,
}

impl SearchCursor {
    /// Start a new search and move to the first match
    pub fn set(&mut self, term: &str, buffer: &MessageBuffer) {
        self.term = term.to_string();
        self.recompute(buffer);
        self.pos = self.first;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn term(&self) -> &str {
        &self.term
    }

    pub fn is_active(&self) -> bool {
        !self.term.is_empty()
    }

    /// Id of the match the cursor is on
    pub fn current(&self) -> Option<u64> {
        self.pos
    }

    pub fn first(&self) -> Option<u64> {
        self.first
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }

    /// Keep first/last in step with a newly buffered message
    pub fn observe(&mut self, message: &Message, buffer: &MessageBuffer) {
        if !self.is_active() {
            return;
        }
        if self.first.is_some_and(|id| buffer.position(id).is_none()) {
            self.recompute(buffer);
            if self.pos.is_some_and(|id| buffer.position(id).is_none()) {
                self.pos = self.first;
            }
            return;
        }
        if message.text.contains(&self.term) {
            self.last = Some(message.id);
            if self.first.is_none() {
                self.first = Some(message.id);
                self.pos = Some(message.id);
            }
        }
    }

    /// Move to the next match after the cursor
    pub fn next(&mut self, buffer: &MessageBuffer) -> Option<u64> {
        if !self.is_active() {
            return None;
        }
        let start = self
            .pos
            .and_then(|id| buffer.position(id))
            .map_or(0, |i| i + 1);
        let found = buffer
            .iter()
            .skip(start)
            .find(|m| m.text.contains(&self.term))
            .map(|m| m.id)?;
        self.pos = Some(found);
        Some(found)
    }

    /// Move to the previous match before the cursor
    pub fn prev(&mut self, buffer: &MessageBuffer) -> Option<u64> {
        if !self.is_active() {
            return None;
        }
        let end = self.pos.and_then(|id| buffer.position(id))?;
        let found = buffer
            .iter()
            .take(end)
            .rev()
            .find(|m| m.text.contains(&self.term))
            .map(|m| m.id)?;
        self.pos = Some(found);
        Some(found)
    }

    pub fn can_search_next(&self) -> bool {
        self.is_active() && self.pos.is_some() && self.pos != self.last
    }

    pub fn can_search_prev(&self) -> bool {
        self.is_active() && self.pos.is_some() && self.pos != self.first
    }

    fn recompute(&mut self, buffer: &MessageBuffer) {
        if self.term.is_empty() {
            self.first = None;
            self.last = None;
            return;
        }
        let term = self.term.as_str();
        self.first = buffer.iter().find(|m| m.text.contains(term)).map(|m| m.id);
        self.last = buffer.iter().rev().find(|m| m.text.contains(term)).map(|m| m.id);
    }
}
