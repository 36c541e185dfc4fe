//! Arena-backed FIFO of pending expirations.
//!
//! Every entry is pushed with `now + window` and the window never changes,
//! so insertion order is expiration order and the queue is never re-sorted.
//! Slots are linked by index; popped slots go on a free list and are reused,
//! so the arena never grows beyond the peak number of throttled keys.

use tokio::time::Instant;

use super::RateKey;

/// One throttled key and the instant it stops being throttled.
#[derive(Debug, Clone, Copy)]
struct ExpiryEntry {
    key: RateKey,
    expires_at: Instant,
    next: Option<usize>,
}

#[derive(Debug, Default)]
pub(super) struct ExpiryQueue {
    slots: Vec<ExpiryEntry>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl ExpiryQueue {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Append `key` at the tail.
    pub(super) fn push(&mut self, key: RateKey, expires_at: Instant) {
        debug_assert!(
            self.tail
                .is_none_or(|tail| self.slots[tail].expires_at <= expires_at),
            "expiry queue must stay ordered by expiration"
        );

        let entry = ExpiryEntry {
            key,
            expires_at,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = entry;
                idx
            }
            None => {
                self.slots.push(entry);
                self.slots.len() - 1
            }
        };

        match self.tail {
            Some(tail) => self.slots[tail].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    /// Expiration of the oldest entry, which is the next one due.
    pub(super) fn next_expiry(&self) -> Option<Instant> {
        self.head.map(|head| self.slots[head].expires_at)
    }

    /// Pop the head if it is due at `now`.
    pub(super) fn pop_expired(&mut self, now: Instant) -> Option<RateKey> {
        let head = self.head?;
        let entry = self.slots[head];
        if entry.expires_at > now {
            return None;
        }

        self.head = entry.next;
        if self.head.is_none() {
            self.tail = None;
        }
        self.free.push(head);
        self.len -= 1;
        Some(entry.key)
    }

    pub(super) fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn key(n: u8) -> RateKey {
        RateKey::new(&format!("sender{n}@example.com"), "rcpt@example.com")
    }

    #[test]
    fn pops_in_insertion_order() {
        let start = Instant::now();
        let mut queue = ExpiryQueue::new();
        for n in 0..3 {
            queue.push(key(n), start + Duration::from_secs(u64::from(n)));
        }

        let later = start + Duration::from_secs(10);
        assert_eq!(queue.pop_expired(later), Some(key(0)));
        assert_eq!(queue.pop_expired(later), Some(key(1)));
        assert_eq!(queue.pop_expired(later), Some(key(2)));
        assert_eq!(queue.pop_expired(later), None);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn head_not_due_is_kept() {
        let start = Instant::now();
        let mut queue = ExpiryQueue::new();
        queue.push(key(1), start + Duration::from_secs(5));

        assert_eq!(queue.pop_expired(start), None);
        assert_eq!(queue.next_expiry(), Some(start + Duration::from_secs(5)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn due_exactly_at_expiry() {
        let start = Instant::now();
        let mut queue = ExpiryQueue::new();
        queue.push(key(1), start);

        assert_eq!(queue.pop_expired(start), Some(key(1)));
        assert_eq!(queue.next_expiry(), None);
    }

    #[test]
    fn slots_are_reused_after_pop() {
        let start = Instant::now();
        let mut queue = ExpiryQueue::new();
        queue.push(key(1), start);
        queue.push(key(2), start);
        assert_eq!(queue.pop_expired(start), Some(key(1)));
        assert_eq!(queue.pop_expired(start), Some(key(2)));

        queue.push(key(3), start + Duration::from_secs(1));
        queue.push(key(4), start + Duration::from_secs(2));
        assert_eq!(queue.slots.len(), 2);
        assert_eq!(queue.len(), 2);

        // Links stay correct across reused slots.
        let later = start + Duration::from_secs(3);
        assert_eq!(queue.pop_expired(later), Some(key(3)));
        assert_eq!(queue.pop_expired(later), Some(key(4)));
    }
}
