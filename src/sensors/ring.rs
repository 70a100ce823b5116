//! Fixed-length history of decoded readings.
//!
//! A write fills the slot after the newest one and only then advances the
//! newest index, so a reader never observes a half-written slot as newest.

use crate::error::{DioError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Reading<T> {
    pub value: T,
    /// Seconds, from [`crate::gpio::Platform::timestamp`].
    pub timestamp: u32,
    pub invalid: bool,
}

impl<T: Default> Reading<T> {
    pub fn valid(value: T, timestamp: u32) -> Self {
        Self {
            value,
            timestamp,
            invalid: false,
        }
    }

    pub fn invalid(value: T, timestamp: u32) -> Self {
        Self {
            value,
            timestamp,
            invalid: true,
        }
    }

    fn empty() -> Self {
        Self {
            value: T::default(),
            timestamp: 0,
            invalid: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReadingRing<T> {
    slots: Vec<Reading<T>>,
    newest: usize,
}

impl<T: Copy + Default> ReadingRing<T> {
    /// `len` slots, every one initially invalid.
    pub fn new(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(DioError::InvalidLength);
        }
        let mut slots = Vec::new();
        slots.try_reserve_exact(len).map_err(|_| DioError::OutOfMemory {
            requested: len.saturating_mul(core::mem::size_of::<Reading<T>>()),
        })?;
        slots.resize(len, Reading::empty());
        Ok(Self { slots, newest: 0 })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn push(&mut self, reading: Reading<T>) {
        let next = (self.newest + 1) % self.slots.len();
        self.slots[next] = reading;
        self.newest = next;
    }

    /// The reading `age` writes before the newest one. Ages wrap around the
    /// ring length.
    pub fn get(&self, age: usize) -> Reading<T> {
        let len = self.slots.len();
        let index = (self.newest + len - age % len) % len;
        self.slots[index]
    }

    /// Newest first.
    pub fn iter(&self) -> impl Iterator<Item = Reading<T>> + '_ {
        (0..self.slots.len()).map(|age| self.get(age))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_all_invalid() {
        let ring = ReadingRing::<i32>::new(3).unwrap();
        assert!(ring.iter().all(|r| r.invalid && r.value == 0 && r.timestamp == 0));
        assert_eq!(ReadingRing::<i32>::new(0).unwrap_err(), DioError::InvalidLength);
    }

    #[test]
    fn ages_count_back_from_the_newest_write() {
        let mut ring = ReadingRing::new(3).unwrap();
        ring.push(Reading::valid(10, 1));
        ring.push(Reading::valid(20, 2));
        ring.push(Reading::invalid(30, 3));
        ring.push(Reading::valid(40, 4));

        assert_eq!(ring.get(0), Reading::valid(40, 4));
        assert_eq!(ring.get(1), Reading::invalid(30, 3));
        assert_eq!(ring.get(2), Reading::valid(20, 2));
        assert_eq!(ring.get(3), ring.get(0));
        let values: Vec<i32> = ring.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![40, 30, 20]);
    }
}
