//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Bounded FIFO of outbound payloads, tagged with enqueue time.
//!
//! Invariants, checked after every push:
//! - length never exceeds `max_size`; excess drops from the front
//!   (oldest first) and the drop count is reported to the caller.
//! - after a prune, no message is older than `max_age`. A `max_age` of
//!   zero or `Duration::MAX` disables pruning entirely.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use bytes::Bytes;

#[derive(Clone, Debug)]
pub struct QueuedMessage {
    pub id: u64,
    pub data: Bytes,
    pub enqueued_at: Instant,
}

pub struct MessageQueue {
    entries: VecDeque<QueuedMessage>,
    next_id: u64,
    max_size: usize,
    max_age: Duration,
}

impl MessageQueue {
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 1,
            max_size,
            max_age,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops messages older than `max_age`. Returns the drop count.
    pub fn prune(&mut self, now: Instant) -> usize {
        if self.max_age == Duration::ZERO || self.max_age == Duration::MAX {
            return 0;
        }
        let mut dropped = 0;
        while let Some(front) = self.entries.front() {
            if now.duration_since(front.enqueued_at) > self.max_age {
                self.entries.pop_front();
                dropped += 1;
            } else {
                break;
            }
        }
        dropped
    }

    /// Prunes, appends, then enforces the size bound. Returns the total
    /// number of messages dropped (aged out plus overflowed).
    pub fn push(&mut self, data: Bytes, now: Instant) -> usize {
        let mut dropped = self.prune(now);
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(QueuedMessage {
            id,
            data,
            enqueued_at: now,
        });
        while self.entries.len() > self.max_size {
            self.entries.pop_front();
            dropped += 1;
        }
        dropped
    }

    pub fn pop_front(&mut self) -> Option<QueuedMessage> {
        self.entries.pop_front()
    }

    /// Puts a message back at the head after a failed flush send.
    pub fn push_front(&mut self, message: QueuedMessage) {
        self.entries.push_front(message);
    }

    /// Requeues a payload at the head (a failed immediate send), still
    /// enforcing the size bound. Returns the drop count; when the queue
    /// is already full the requeued message itself is the oldest and
    /// goes first.
    pub fn requeue_front(&mut self, data: Bytes, enqueued_at: Instant) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_front(QueuedMessage {
            id,
            data,
            enqueued_at,
        });
        let mut dropped = 0;
        while self.entries.len() > self.max_size {
            self.entries.pop_front();
            dropped += 1;
        }
        dropped
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(text: &str) -> Bytes {
        Bytes::copy_from_slice(text.as_bytes())
    }

    #[test]
    fn keeps_the_most_recent_when_full() {
        let mut queue = MessageQueue::new(2, Duration::MAX);
        let now = Instant::now();
        let mut dropped = 0;
        for text in ["a", "b", "c", "d", "e"] {
            dropped += queue.push(bytes(text), now);
        }
        assert_eq!(dropped, 3);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_front().unwrap().data, bytes("d"));
        assert_eq!(queue.pop_front().unwrap().data, bytes("e"));
    }

    #[test]
    fn zero_capacity_drops_every_push() {
        let mut queue = MessageQueue::new(0, Duration::MAX);
        let now = Instant::now();
        assert_eq!(queue.push(bytes("a"), now), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn prune_drops_aged_messages() {
        let mut queue = MessageQueue::new(10, Duration::from_millis(50));
        let start = Instant::now();
        queue.push(bytes("old"), start);
        queue.push(bytes("older"), start);
        let later = start + Duration::from_millis(100);
        queue.push(bytes("fresh"), later);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_front().unwrap().data, bytes("fresh"));
    }

    #[test]
    fn age_gates_disable_pruning() {
        let start = Instant::now();
        let later = start + Duration::from_secs(3600);

        let mut unbounded = MessageQueue::new(10, Duration::MAX);
        unbounded.push(bytes("a"), start);
        assert_eq!(unbounded.prune(later), 0);
        assert_eq!(unbounded.len(), 1);

        let mut zero = MessageQueue::new(10, Duration::ZERO);
        zero.push(bytes("a"), start);
        assert_eq!(zero.prune(later), 0);
        assert_eq!(zero.len(), 1);
    }

    #[test]
    fn ids_are_monotonic_and_order_is_fifo() {
        let mut queue = MessageQueue::new(10, Duration::MAX);
        let now = Instant::now();
        queue.push(bytes("a"), now);
        queue.push(bytes("b"), now);
        let first = queue.pop_front().unwrap();
        let second = queue.pop_front().unwrap();
        assert!(first.id < second.id);
        assert_eq!(first.data, bytes("a"));
    }

    #[test]
    fn push_front_restores_order() {
        let mut queue = MessageQueue::new(10, Duration::MAX);
        let now = Instant::now();
        queue.push(bytes("a"), now);
        queue.push(bytes("b"), now);
        let head = queue.pop_front().unwrap();
        queue.push_front(head);
        assert_eq!(queue.pop_front().unwrap().data, bytes("a"));
        assert_eq!(queue.pop_front().unwrap().data, bytes("b"));
    }
}
