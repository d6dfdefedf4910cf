use crate::error::{Error, Result};
use crate::types::Superpage;

const PUSHED_PAGES_INVALID: i32 = -1;

/// One registry slot: the client-facing `Superpage` plus the engine's
/// private push/arrival bookkeeping for it.
#[derive(Debug, Clone, Copy)]
pub struct SpQueueEntry {
    pub superpage: Superpage,
    pub bus_address: u64,
    /// Pages pushed into the descriptor ring so far. `-1` marks an unused
    /// slot (mirrors the original sentinel so `clear`/eviction needs no
    /// separate validity bitmap).
    pushed_pages: i32,
    pub max_pages: u32,
}

impl SpQueueEntry {
    fn empty() -> Self {
        Self {
            superpage: Superpage::new(0, 0),
            bus_address: 0,
            pushed_pages: PUSHED_PAGES_INVALID,
            max_pages: 0,
        }
    }

    pub fn pushed_pages(&self) -> u32 {
        self.pushed_pages.max(0) as u32
    }

    pub fn set_pushed_pages(&mut self, pages: u32) {
        self.pushed_pages = pages as i32;
    }

    pub fn is_pushed(&self) -> bool {
        self.pushed_pages() == self.max_pages
    }

    pub fn unpushed_pages(&self) -> u32 {
        self.max_pages - self.pushed_pages()
    }

    fn is_valid(&self) -> bool {
        self.pushed_pages != PUSHED_PAGES_INVALID
    }
}

/// Fixed-capacity ring buffer of slot IDs; never reallocates after
/// construction.
#[derive(Debug, Clone)]
struct Ring {
    ids: Vec<u8>,
    head: usize,
    len: usize,
}

impl Ring {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: vec![0; capacity],
            head: 0,
            len: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.ids.len()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn push_back(&mut self, id: u8) {
        debug_assert!(self.len < self.capacity());
        let index = (self.head + self.len) % self.capacity();
        self.ids[index] = id;
        self.len += 1;
    }

    fn pop_front(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let id = self.ids[self.head];
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        Some(id)
    }

    fn front(&self) -> Option<u8> {
        if self.is_empty() {
            None
        } else {
            Some(self.ids[self.head])
        }
    }

    fn back(&self) -> Option<u8> {
        if self.is_empty() {
            None
        } else {
            Some(self.ids[(self.head + self.len - 1) % self.capacity()])
        }
    }

    fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}

/// Three coupled FIFOs (Pushing → Arrivals → Filled) over one fixed
/// registry of up to `capacity` superpages.
pub struct SpQueue {
    registry: Vec<SpQueueEntry>,
    pushing: Ring,
    arrivals: Ring,
    filled: Ring,
    next_id: u8,
    count: usize,
}

impl SpQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity <= 256,
            "SpQueue id type (u8) can't address more than 256 entries"
        );
        Self {
            registry: vec![SpQueueEntry::empty(); capacity],
            pushing: Ring::with_capacity(capacity),
            arrivals: Ring::with_capacity(capacity),
            filled: Ring::with_capacity(capacity),
            next_id: 0,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.registry.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    pub fn available(&self) -> usize {
        self.capacity() - self.count
    }

    /// Appends to both Pushing and Arrivals (an entry starts life needing
    /// both to be pushed and to be watched for arrival).
    pub fn add(&mut self, superpage: Superpage, bus_address: u64, max_pages: u32) -> Result<u8> {
        if self.is_full() {
            return Err(Error::QueueFull);
        }
        let id = self.next_id;
        self.registry[id as usize] = SpQueueEntry {
            superpage,
            bus_address,
            pushed_pages: 0,
            max_pages,
        };
        self.next_id = (self.next_id + 1) % self.capacity() as u8;
        self.count += 1;
        self.pushing.push_back(id);
        self.arrivals.push_back(id);
        Ok(id)
    }

    pub fn entry(&self, id: u8) -> &SpQueueEntry {
        &self.registry[id as usize]
    }

    pub fn entry_mut(&mut self, id: u8) -> &mut SpQueueEntry {
        &mut self.registry[id as usize]
    }

    pub fn pushing_front(&self) -> Option<u8> {
        self.pushing.front()
    }

    pub fn pushing_front_entry_mut(&mut self) -> Option<&mut SpQueueEntry> {
        let id = self.pushing.front()?;
        Some(&mut self.registry[id as usize])
    }

    pub fn arrivals_front(&self) -> Option<u8> {
        self.arrivals.front()
    }

    pub fn arrivals_front_entry_mut(&mut self) -> Option<&mut SpQueueEntry> {
        let id = self.arrivals.front()?;
        Some(&mut self.registry[id as usize])
    }

    pub fn pushing_len(&self) -> usize {
        self.pushing.len()
    }

    pub fn arrivals_len(&self) -> usize {
        self.arrivals.len()
    }

    pub fn filled_len(&self) -> usize {
        self.filled.len()
    }

    /// ID of the youngest superpage across Pushing > Arrivals > Filled.
    pub fn back_id(&self) -> Option<u8> {
        self.pushing
            .back()
            .or_else(|| self.arrivals.back())
            .or_else(|| self.filled.back())
    }

    /// ID of the oldest superpage across Filled > Arrivals > Pushing.
    pub fn front_id(&self) -> Option<u8> {
        self.filled
            .front()
            .or_else(|| self.arrivals.front())
            .or_else(|| self.pushing.front())
    }

    /// Removes the Pushing-front entry once it has been fully pushed.
    pub fn remove_from_pushing(&mut self) -> Result<u8> {
        let id = self.pushing.front().ok_or(Error::QueueEmpty)?;
        if !self.entry(id).is_pushed() {
            return Err(Error::BadState {
                reason: "pushing-queue front is not fully pushed yet".into(),
            });
        }
        self.pushing.pop_front();
        Ok(id)
    }

    /// Moves the Arrivals-front entry to Filled once its superpage is ready.
    pub fn promote_arrivals_to_filled(&mut self) -> Result<u8> {
        let id = self.arrivals.front().ok_or(Error::QueueEmpty)?;
        if !self.entry(id).superpage.ready {
            return Err(Error::BadState {
                reason: "arrivals-queue front is not ready yet".into(),
            });
        }
        self.arrivals.pop_front();
        self.filled.push_back(id);
        Ok(id)
    }

    /// Pops the Filled-front entry, ending the superpage's lifecycle.
    pub fn pop_filled(&mut self) -> Result<SpQueueEntry> {
        let id = self.filled.pop_front().ok_or(Error::QueueEmpty)?;
        let entry = *self.entry(id);
        self.registry[id as usize].pushed_pages = PUSHED_PAGES_INVALID;
        self.count -= 1;
        Ok(entry)
    }

    pub fn clear(&mut self) {
        for entry in &mut self.registry {
            entry.pushed_pages = PUSHED_PAGES_INVALID;
        }
        self.pushing.clear();
        self.arrivals.clear();
        self.filled.clear();
        self.count = 0;
        self.next_id = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_rejects_when_full_and_accounting_holds() {
        let capacity = 4;
        let mut q = SpQueue::new(capacity);
        for i in 0..capacity {
            q.add(Superpage::new(i * 100, 100), 0, 1).unwrap();
        }
        assert!(q.is_full());
        assert_eq!(q.available(), 0);
        let err = q.add(Superpage::new(0, 1), 0, 1).unwrap_err();
        assert!(matches!(err, Error::QueueFull));
    }

    #[test]
    fn fifo_ordering_through_all_three_subqueues() {
        let mut q = SpQueue::new(4);
        let a = q.add(Superpage::new(0, 100), 0, 1).unwrap();
        let b = q.add(Superpage::new(100, 100), 0, 1).unwrap();

        // Push 'a' to completion, promote, pop.
        q.pushing_front_entry_mut().unwrap().set_pushed_pages(1);
        assert_eq!(q.remove_from_pushing().unwrap(), a);
        q.entry_mut(a).superpage.ready = true;
        q.entry_mut(a).superpage.received = 100;
        assert_eq!(q.promote_arrivals_to_filled().unwrap(), a);
        let popped = q.pop_filled().unwrap();
        assert_eq!(popped.superpage.offset, 0);

        // 'b' must still be the one left, in order.
        assert_eq!(q.pushing_front(), Some(b));
        assert_eq!(q.front_id(), Some(b));
    }

    #[test]
    fn removing_from_pushing_before_fully_pushed_fails() {
        let mut q = SpQueue::new(2);
        q.add(Superpage::new(0, 100), 0, 2).unwrap();
        let err = q.remove_from_pushing().unwrap_err();
        assert!(matches!(err, Error::BadState { .. }));
    }

    #[test]
    fn ids_are_reused_cyclically_after_pop() {
        let mut q = SpQueue::new(2);
        let first = q.add(Superpage::new(0, 1), 0, 1).unwrap();
        q.pushing_front_entry_mut().unwrap().set_pushed_pages(1);
        q.remove_from_pushing().unwrap();
        q.entry_mut(first).superpage.ready = true;
        q.promote_arrivals_to_filled().unwrap();
        q.pop_filled().unwrap();

        q.add(Superpage::new(0, 1), 0, 1).unwrap();
        let second = q.add(Superpage::new(1, 1), 0, 1).unwrap();
        assert_eq!(second, first, "id should be reused once the slot is free");
    }
}
