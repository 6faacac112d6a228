//! Fixed-capacity circular history
//!
//! Backing storage is a `Vec<Option<T>>` addressed by a head index and a
//! length, so `push` and `clear` are O(1) and never shift elements. Once full,
//! every push overwrites the oldest slot.

use crate::error::{SamplerError, SamplerResult};

#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    /// Index of the oldest item
    head: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> SamplerResult<Self> {
        if capacity == 0 {
            return Err(SamplerError::InvalidCapacity(capacity));
        }

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Ok(Self {
            slots,
            head: 0,
            len: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Fill level as a percentage of capacity
    pub fn utilization(&self) -> f64 {
        self.len as f64 / self.capacity() as f64 * 100.0
    }

    fn physical(&self, logical: usize) -> usize {
        (self.head + logical) % self.capacity()
    }

    /// Append an item, evicting the oldest one when the buffer is full.
    pub fn push(&mut self, item: T) {
        let capacity = self.capacity();
        if self.len < capacity {
            let tail = self.physical(self.len);
            self.slots[tail] = Some(item);
            self.len += 1;
        } else {
            self.slots[self.head] = Some(item);
            self.head = (self.head + 1) % capacity;
        }
    }

    /// Most recently pushed item, `None` when empty.
    pub fn latest(&self) -> Option<&T> {
        if self.is_empty() {
            return None;
        }
        self.slots[self.physical(self.len - 1)].as_ref()
    }

    /// Borrowing iterator, oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |i| self.slots[self.physical(i)].as_ref())
    }

    /// Logically empty the buffer. Capacity and backing storage are kept;
    /// stale slots are overwritten by later pushes.
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Snapshot of every item, oldest to newest.
    pub fn all(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }

    /// The last `min(count, len)` items, oldest to newest. Empty for
    /// `count <= 0`.
    pub fn recent(&self, count: i64) -> Vec<T> {
        if count <= 0 || self.is_empty() {
            return Vec::new();
        }

        let take = usize::try_from(count).unwrap_or(usize::MAX).min(self.len);
        let skip = self.len - take;
        self.iter().skip(skip).cloned().collect()
    }

    /// Change the capacity, keeping the newest items that fit.
    pub fn resize(&mut self, new_capacity: usize) -> SamplerResult<()> {
        if new_capacity == 0 {
            return Err(SamplerError::InvalidCapacity(new_capacity));
        }
        if new_capacity == self.capacity() {
            return Ok(());
        }

        let items = self.all();
        let keep_from = items.len().saturating_sub(new_capacity);

        let mut rebuilt = RingBuffer::new(new_capacity)?;
        for item in items.into_iter().skip(keep_from) {
            rebuilt.push(item);
        }

        *self = rebuilt;
        Ok(())
    }
}
