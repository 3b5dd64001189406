//! Drain ordering shared by hooks and batch groups.
//!
//! Higher priority pops first; equal priorities pop in insertion order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Priority of a hook or batch group. Larger values are serviced first.
pub type Priority = i32;

pub const DEFAULT_PRIORITY: Priority = 0;

struct Entry<T> {
    priority: Priority,
    sequence: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

pub(crate) struct PriorityQueue<T> {
    heap: BinaryHeap<Entry<T>>,
    next_sequence: u64,
}

impl<T> PriorityQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_sequence: 0,
        }
    }

    pub(crate) fn push(&mut self, item: T, priority: Priority) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(Entry {
            priority,
            sequence,
            item,
        });
    }

    pub(crate) fn pop(&mut self) -> Option<T> {
        self.heap.pop().map(|entry| entry.item)
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_higher_priority_first() {
        let mut queue = PriorityQueue::new();
        queue.push("low", -1);
        queue.push("default", DEFAULT_PRIORITY);
        queue.push("bridge", 5);
        assert_eq!(queue.pop(), Some("bridge"));
        assert_eq!(queue.pop(), Some("default"));
        assert_eq!(queue.pop(), Some("low"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut queue = PriorityQueue::new();
        for item in 0..5 {
            queue.push(item, 1);
        }
        queue.push(99, 0);
        assert_eq!(queue.len(), 6);
        let popped: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(popped, vec![0, 1, 2, 3, 4, 99]);
    }
}
