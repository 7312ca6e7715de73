//! In-memory FIFO of messages the durability endpoint has not received yet
//!
//! Appended at the tail, drained from the head, never reordered or
//! deduplicated. There is no eviction: it grows until flushed or the process
//! exits.

use std::collections::VecDeque;

use crate::protocol::Message;

#[derive(Debug)]
pub struct Backlog {
    destination: String,
    queue: VecDeque<Message>,
}

impl Backlog {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            queue: VecDeque::new(),
        }
    }

    /// The single endpoint name this backlog is scoped to
    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn push(&mut self, message: Message) {
        self.queue.push_back(message);
    }

    pub fn front(&self) -> Option<&Message> {
        self.queue.front()
    }

    pub fn pop_front(&mut self) -> Option<Message> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.queue.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn save(id: &str) -> Message {
        Message::SaveFlight { flight: json!({"id": id}) }
    }

    #[test]
    fn test_fifo_order() {
        let mut backlog = Backlog::new("db");
        backlog.push(save("A"));
        backlog.push(save("B"));
        backlog.push(save("A"));

        assert_eq!(backlog.destination(), "db");
        assert_eq!(backlog.len(), 3);
        let ids: Vec<_> = backlog.iter().filter_map(Message::flight_id).collect();
        assert_eq!(ids, vec!["A", "B", "A"]);

        assert_eq!(backlog.pop_front().unwrap().flight_id(), Some("A"));
        assert_eq!(backlog.front().unwrap().flight_id(), Some("B"));
        assert_eq!(backlog.len(), 2);
    }

    #[test]
    fn test_empty() {
        let mut backlog = Backlog::new("db");
        assert!(backlog.is_empty());
        assert!(backlog.pop_front().is_none());
    }
}
