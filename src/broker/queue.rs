//! Per-recipient inbound queue: priority first, FIFO within a priority.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::types::Message;

#[derive(Debug)]
pub(crate) struct Queued {
    pub rank: u8,
    pub seq: u64,
    pub enqueued_at: Instant,
    pub message: Arc<Message>,
}

impl Queued {
    /// Whether the message's own timeout elapsed while it sat in the queue
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.enqueued_at + self.message.timeout
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: higher rank first, then lower sequence number first
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank
            .cmp(&other.rank)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
pub(crate) struct Inbox {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
    pub notify: Arc<Notify>,
}

impl Inbox {
    pub fn push(&mut self, message: Arc<Message>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Queued {
            rank: message.priority.rank(),
            seq,
            enqueued_at: Instant::now(),
            message,
        });
        self.notify.notify_one();
    }

    pub fn pop(&mut self) -> Option<Queued> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;
    use serde_json::json;

    fn message(label: &str, priority: Priority) -> Arc<Message> {
        Arc::new(
            Message::request("orchestrator", "evo", json!({ "label": label }))
                .with_priority(priority),
        )
    }

    #[test]
    fn test_priority_then_fifo() {
        let mut inbox = Inbox::default();
        inbox.push(message("low-1", Priority::Low));
        inbox.push(message("med-1", Priority::Medium));
        inbox.push(message("high-1", Priority::High));
        inbox.push(message("med-2", Priority::Medium));
        inbox.push(message("high-2", Priority::High));

        let order: Vec<String> = std::iter::from_fn(|| inbox.pop())
            .map(|q| q.message.payload["label"].as_str().unwrap_or_default().to_string())
            .collect();

        assert_eq!(order, vec!["high-1", "high-2", "med-1", "med-2", "low-1"]);
        assert_eq!(inbox.len(), 0);
    }
}
