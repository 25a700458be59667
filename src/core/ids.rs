// Reusable worker id allocator; the lowest released ids are handed out first.
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
pub struct WorkerIds {
    inner: Mutex<IdQueue>,
}

#[derive(Debug, Default)]
struct IdQueue {
    free: VecDeque<usize>,
    next: usize,
}

impl WorkerIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> usize {
        let mut queue = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match queue.free.pop_front() {
            Some(id) => id,
            None => {
                let id = queue.next;
                queue.next += 1;
                id
            }
        }
    }

    pub fn release(&self, id: usize) {
        let mut queue = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(id < queue.next && !queue.free.contains(&id));
        queue.free.push_front(id);
    }

    /// Ids handed out so far, including released ones.
    pub fn high_water(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next
    }
}
