// Palaver - Line-oriented talker server over CRLF text with a flooding peer mesh
// Copyright (C) 2026  mossfet
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::{HashSet, VecDeque};

use crate::protocol::MessageId;

/// Bounded duplicate-suppression cache of message ids.
///
/// Membership is O(1) through the set; the deque records insertion order so
/// eviction at capacity drops strictly the oldest entry. An id evicted here
/// can be re-processed if a forwarding loop outlives the cache, so capacity
/// should exceed the in-flight burst size times the graph diameter.
pub struct SeenSet {
    set: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    capacity: usize,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record an id. Returns false when it was already present.
    pub fn insert(&mut self, id: MessageId) -> bool {
        if !self.set.insert(id) {
            return false;
        }

        self.order.push_back(id);

        if self.set.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }

        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.set.contains(id)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}
