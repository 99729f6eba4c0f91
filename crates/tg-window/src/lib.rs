#![forbid(unsafe_code)]

//! Bounded FIFO window shared by the precision and drift monitors.
//!
//! Capacity is fixed at construction. Pushing into a full window evicts the
//! oldest element and hands it back to the caller so derived counters can be
//! decremented in O(1) instead of rescanning the window.

use std::collections::VecDeque;
use std::collections::vec_deque;

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WindowError {
    #[error("rolling window capacity must be greater than zero")]
    ZeroCapacity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollingWindow<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RollingWindow<T> {
    pub fn new(capacity: usize) -> Result<Self, WindowError> {
        if capacity == 0 {
            return Err(WindowError::ZeroCapacity);
        }
        Ok(Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    /// Append `item`, returning the evicted oldest element when the window
    /// was already full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Push every item in order and collect what fell out of the window.
    pub fn push_all(&mut self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        items.into_iter().filter_map(|item| self.push(item)).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    #[must_use]
    pub fn oldest(&self) -> Option<&T> {
        self.items.front()
    }

    #[must_use]
    pub fn newest(&self) -> Option<&T> {
        self.items.back()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> vec_deque::Iter<'_, T> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<'a, T> IntoIterator for &'a RollingWindow<T> {
    type Item = &'a T;
    type IntoIter = vec_deque::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
