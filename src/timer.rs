// Copyright 2025 The stoker authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Indexed min-heap of per-connection idle deadlines.
//!
//! The heap is a plain array ordered by deadline; a side map from key to
//! array position gives O(log n) update-by-key. Expired keys are returned
//! to the reactor, which owns the actual close.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct TimerNode {
    key: usize,
    deadline: Instant,
}

/// Min-heap keyed by absolute deadline with an exact key→index map.
///
/// Invariants: the root holds the smallest deadline, and after every
/// mutation `index[key]` names the array slot actually holding `key`.
#[derive(Debug, Default)]
pub struct IdleTimer {
    heap: Vec<TimerNode>,
    index: HashMap<usize, usize>,
}

impl IdleTimer {
    /// Creates an empty timer.
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            index: HashMap::new(),
        }
    }

    /// Number of armed deadlines.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// True when no deadline is armed.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// True when `key` has an armed deadline.
    pub fn contains(&self, key: usize) -> bool {
        self.index.contains_key(&key)
    }

    /// Arms `key` to expire `timeout` from now. A new key is pushed at the
    /// tail and sifted up; an existing key has its deadline replaced and is
    /// re-sifted in whichever direction the new deadline requires.
    pub fn add(&mut self, key: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        match self.index.get(&key).copied() {
            None => {
                let i = self.heap.len();
                self.index.insert(key, i);
                self.heap.push(TimerNode { key, deadline });
                self.sift_up(i);
            }
            Some(i) => {
                self.heap[i].deadline = deadline;
                if !self.sift_down(i, self.heap.len()) {
                    self.sift_up(i);
                }
            }
        }
    }

    /// Pushes an existing key's deadline out to `timeout` from now. In
    /// practice deadlines only ever grow for a live connection, so the node
    /// sifts down; the upward fallback keeps the heap valid regardless.
    pub fn adjust(&mut self, key: usize, timeout: Duration) {
        if let Some(&i) = self.index.get(&key) {
            self.heap[i].deadline = Instant::now() + timeout;
            if !self.sift_down(i, self.heap.len()) {
                self.sift_up(i);
            }
        }
    }

    /// Pops every deadline at or before `now` and returns the expired keys
    /// in deadline order.
    pub fn tick(&mut self, now: Instant) -> Vec<usize> {
        let mut expired = Vec::new();
        while let Some(root) = self.heap.first() {
            if root.deadline > now {
                break;
            }
            expired.push(root.key);
            self.pop();
        }
        expired
    }

    /// Time until the nearest deadline, saturating at zero; `None` when the
    /// heap is empty (block indefinitely).
    pub fn poll_timeout(&self, now: Instant) -> Option<Duration> {
        self.heap
            .first()
            .map(|node| node.deadline.saturating_duration_since(now))
    }

    /// Removes the root by swapping in the tail and re-heapifying.
    fn pop(&mut self) {
        debug_assert!(!self.heap.is_empty());
        let last = self.heap.len() - 1;
        if last > 0 {
            self.swap_nodes(0, last);
        }
        if let Some(node) = self.heap.pop() {
            self.index.remove(&node.key);
        }
        if !self.heap.is_empty() && !self.sift_down(0, self.heap.len()) {
            self.sift_up(0);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].deadline <= self.heap[i].deadline {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    /// Sifts `i` towards the leaves within `heap[..n]`, always following the
    /// smaller child. Returns whether the node moved.
    fn sift_down(&mut self, mut i: usize, n: usize) -> bool {
        let start = i;
        loop {
            let mut child = i * 2 + 1;
            if child >= n {
                break;
            }
            if child + 1 < n && self.heap[child + 1].deadline < self.heap[child].deadline {
                child += 1;
            }
            if self.heap[i].deadline <= self.heap[child].deadline {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
        }
        i > start
    }

    /// Swaps two heap slots and both index entries together.
    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].key, i);
        self.index.insert(self.heap[j].key, j);
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use super::IdleTimer;

    fn assert_heap_valid(timer: &IdleTimer) {
        for i in 1..timer.heap.len() {
            let parent = (i - 1) / 2;
            assert!(
                timer.heap[parent].deadline <= timer.heap[i].deadline,
                "heap order violated at {i}"
            );
        }
        assert_eq!(timer.heap.len(), timer.index.len());
        for (i, node) in timer.heap.iter().enumerate() {
            assert_eq!(Some(&i), timer.index.get(&node.key));
        }
    }

    #[test]
    fn root_is_always_the_minimum() {
        let mut timer = IdleTimer::new();
        for (key, ms) in [(3, 500), (1, 100), (4, 900), (2, 300), (5, 700)] {
            timer.add(key, Duration::from_millis(ms));
            assert_heap_valid(&timer);
        }
        assert_eq!(1, timer.heap[0].key);
    }

    #[test]
    fn re_adding_a_key_updates_in_place() {
        let mut timer = IdleTimer::new();
        timer.add(1, Duration::from_millis(100));
        timer.add(2, Duration::from_millis(200));
        timer.add(1, Duration::from_millis(900));
        assert_eq!(2, timer.len());
        assert_eq!(2, timer.heap[0].key);
        assert_heap_valid(&timer);
    }

    #[test]
    fn adjust_extends_and_resifts() {
        let mut timer = IdleTimer::new();
        for (key, ms) in [(1, 100), (2, 200), (3, 300)] {
            timer.add(key, Duration::from_millis(ms));
        }
        timer.adjust(1, Duration::from_millis(800));
        assert_eq!(2, timer.heap[0].key);
        assert_heap_valid(&timer);
    }

    #[test]
    fn adjust_on_a_missing_key_is_a_no_op() {
        let mut timer = IdleTimer::new();
        timer.add(1, Duration::from_millis(100));
        timer.adjust(9, Duration::from_millis(500));
        assert_eq!(1, timer.len());
        assert_heap_valid(&timer);
    }

    #[test]
    fn tick_pops_expired_keys_in_deadline_order() {
        let mut timer = IdleTimer::new();
        for (key, ms) in [(7, 30), (8, 10), (9, 20), (10, 5000)] {
            timer.add(key, Duration::from_millis(ms));
        }
        let expired = timer.tick(Instant::now() + Duration::from_millis(100));
        assert_eq!(vec![8, 9, 7], expired);
        assert_eq!(1, timer.len());
        assert!(timer.contains(10));
        assert_heap_valid(&timer);
    }

    #[test]
    fn tick_before_any_deadline_expires_nothing() {
        let mut timer = IdleTimer::new();
        timer.add(1, Duration::from_secs(60));
        assert!(timer.tick(Instant::now()).is_empty());
        assert_eq!(1, timer.len());
    }

    #[test]
    fn poll_timeout_tracks_the_nearest_deadline() {
        let mut timer = IdleTimer::new();
        assert!(timer.poll_timeout(Instant::now()).is_none());
        timer.add(1, Duration::from_secs(60));
        let remaining = timer.poll_timeout(Instant::now()).unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(59));
        // A deadline in the past saturates to zero.
        let remaining = timer.poll_timeout(Instant::now() + Duration::from_secs(120));
        assert_eq!(Some(Duration::ZERO), remaining);
    }

    #[test]
    fn index_stays_exact_across_mixed_churn() {
        let mut timer = IdleTimer::new();
        for key in 0..32 {
            // Spread deadlines with a fixed stride pattern.
            timer.add(key, Duration::from_millis(((key * 37) % 11 * 50 + 10) as u64));
            assert_heap_valid(&timer);
        }
        for key in (0..32).step_by(3) {
            timer.adjust(key, Duration::from_millis(2000));
            assert_heap_valid(&timer);
        }
        let expired = timer.tick(Instant::now() + Duration::from_millis(700));
        assert!(!expired.is_empty());
        assert_heap_valid(&timer);
    }
}
