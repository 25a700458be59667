//! Purpose: Lock-free arbitration of log byte ranges between producers and one consumer.
//! Exports: `RingTracker`, `Cursor`, `Seen`, `Readable`.
//! Role: Volatile state rebuilt on every open; never touches log bytes.
//! Invariants: An acquired range never reaches or crosses `written` (mod wrap).
//! Invariants: Every successful `next` transition into a wrap bumps the generation,
//!             so a stale compare-exchange cannot succeed across a wrap.
//! Invariants: The holder of the wrap lock releases it in a bounded number of steps.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

const OFFSET_MASK: u64 = 0x0000_0000_ffff_ffff;
const GENERATION_MASK: u64 = 0x7fff_ffff_0000_0000;
const GENERATION_SHIFT: u32 = 32;
const LOCK_BIT: u64 = 1 << 63;
/// Largest plain offset; doubles as "idle" and "no boundary".
const OFFSET_MAX: u64 = u64::MAX & !LOCK_BIT;

/// The producer cursor: byte offset, wrap generation, and wrap lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Cursor {
    pub offset: u32,
    pub generation: u32,
    pub locked: bool,
}

impl Cursor {
    pub fn encode(self) -> u64 {
        let generation = ((self.generation as u64) << GENERATION_SHIFT) & GENERATION_MASK;
        let lock = if self.locked { LOCK_BIT } else { 0 };
        self.offset as u64 | generation | lock
    }

    pub fn decode(raw: u64) -> Self {
        Self {
            offset: (raw & OFFSET_MASK) as u32,
            generation: ((raw & GENERATION_MASK) >> GENERATION_SHIFT) as u32,
            locked: raw & LOCK_BIT != 0,
        }
    }

    fn next_generation(self) -> u32 {
        self.generation.wrapping_add(1) & (GENERATION_MASK >> GENERATION_SHIFT) as u32
    }
}

/// What a worker slot advertises to the consumer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Seen {
    Idle,
    /// Observed `next` but has not committed its claim yet.
    Unstable(u64),
    /// Holds `offset..` exclusively until it announces.
    Stable(u64),
}

impl Seen {
    pub fn encode(self) -> u64 {
        match self {
            Seen::Idle => OFFSET_MAX,
            Seen::Unstable(offset) => offset | LOCK_BIT,
            Seen::Stable(offset) => offset,
        }
    }

    pub fn decode(raw: u64) -> Self {
        if raw == OFFSET_MAX {
            Seen::Idle
        } else if raw & LOCK_BIT != 0 {
            Seen::Unstable(raw & !LOCK_BIT)
        } else {
            Seen::Stable(raw)
        }
    }
}

/// Contiguous range the consumer may read.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Readable {
    pub offset: usize,
    pub len: usize,
}

#[derive(Debug)]
struct WorkerSlot {
    seen: AtomicU64,
    registered: AtomicBool,
}

#[derive(Debug)]
pub struct RingTracker {
    space: u64,
    next: CachePadded<AtomicU64>,
    end: CachePadded<AtomicU64>,
    written: CachePadded<AtomicU64>,
    workers: Box<[CachePadded<WorkerSlot>]>,
}

impl RingTracker {
    pub fn new(max_workers: usize, space: usize) -> Self {
        assert!(space as u64 <= OFFSET_MASK, "ring space must fit in 32 bits");
        let workers = (0..max_workers)
            .map(|_| {
                CachePadded::new(WorkerSlot {
                    seen: AtomicU64::new(Seen::Idle.encode()),
                    registered: AtomicBool::new(false),
                })
            })
            .collect();
        Self {
            space: space as u64,
            next: CachePadded::new(AtomicU64::new(0)),
            end: CachePadded::new(AtomicU64::new(OFFSET_MAX)),
            written: CachePadded::new(AtomicU64::new(0)),
            workers,
        }
    }

    pub fn space(&self) -> usize {
        self.space as usize
    }

    pub fn max_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn register(&self, slot: usize) {
        let w = &self.workers[slot];
        w.seen.store(Seen::Idle.encode(), Ordering::Relaxed);
        w.registered.store(true, Ordering::Release);
    }

    pub fn unregister(&self, slot: usize) {
        self.workers[slot].registered.store(false, Ordering::Release);
    }

    fn stable_next(&self) -> Cursor {
        let backoff = Backoff::new();
        loop {
            let next = Cursor::decode(self.next.load(Ordering::Acquire));
            if !next.locked {
                debug_assert!((next.offset as u64) < self.space);
                return next;
            }
            backoff.snooze();
        }
    }

    fn stable_seen(slot: &WorkerSlot) -> u64 {
        let backoff = Backoff::new();
        loop {
            let seen = slot.seen.load(Ordering::Acquire);
            if !matches!(Seen::decode(seen), Seen::Unstable(_)) {
                return seen;
            }
            backoff.snooze();
        }
    }

    /// Reserve `len` bytes for worker `slot`. `None` means the ring is full
    /// for now; the caller retries later.
    pub fn acquire(&self, slot: usize, len: usize) -> Option<usize> {
        let len = len as u64;
        let w = &self.workers[slot];
        debug_assert!(len > 0 && len <= self.space);
        debug_assert_eq!(Seen::decode(w.seen.load(Ordering::Relaxed)), Seen::Idle);

        loop {
            let seen = self.stable_next();
            let next = seen.offset as u64;
            w.seen
                .store(Seen::Unstable(next).encode(), Ordering::Relaxed);

            let target = next + len;
            let written = self.written.load(Ordering::SeqCst);
            if next < written && target >= written {
                w.seen.store(Seen::Idle.encode(), Ordering::Release);
                return None;
            }

            let claimed = if target >= self.space {
                // Past the end: take the head of the buffer under the wrap
                // lock, or reset to zero when the tail was filled exactly.
                let exceed = target > self.space;
                let offset = if exceed { len } else { 0 };
                if offset >= written {
                    w.seen.store(Seen::Idle.encode(), Ordering::Release);
                    return None;
                }
                Cursor {
                    offset: offset as u32,
                    generation: seen.next_generation(),
                    locked: exceed,
                }
            } else {
                Cursor {
                    offset: target as u32,
                    generation: seen.generation,
                    locked: false,
                }
            };

            if self
                .next
                .compare_exchange_weak(
                    seen.encode(),
                    claimed.encode(),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                continue;
            }

            w.seen.store(Seen::Stable(next).encode(), Ordering::Relaxed);

            if claimed.locked {
                debug_assert!(self.written.load(Ordering::SeqCst) <= next);
                debug_assert_eq!(self.end.load(Ordering::SeqCst), OFFSET_MAX);
                self.end.store(next, Ordering::SeqCst);
                let unlocked = Cursor {
                    locked: false,
                    ..claimed
                };
                self.next.store(unlocked.encode(), Ordering::Release);
                return Some(0);
            }
            return Some(next as usize);
        }
    }

    /// The worker in `slot` finished writing its acquired range.
    pub fn produce(&self, slot: usize) {
        let w = &self.workers[slot];
        debug_assert!(w.registered.load(Ordering::Relaxed));
        debug_assert!(matches!(
            Seen::decode(w.seen.load(Ordering::Relaxed)),
            Seen::Stable(_)
        ));
        w.seen.store(Seen::Idle.encode(), Ordering::Release);
    }

    /// Next contiguous range every producer has finished with, if any.
    pub fn consume(&self) -> Option<Readable> {
        let mut written = self.written.load(Ordering::SeqCst);
        loop {
            let next = self.stable_next().offset as u64;
            if written == next {
                return None;
            }

            // Smallest in-flight offset at or past `written`; offsets behind
            // it belong to producers that already wrapped.
            let mut ready = OFFSET_MAX;
            for w in self.workers.iter() {
                if !w.registered.load(Ordering::Relaxed) {
                    continue;
                }
                let seen = Self::stable_seen(w);
                if seen >= written {
                    ready = ready.min(seen);
                }
            }

            if next < written {
                let end = self.space.min(self.end.load(Ordering::SeqCst));

                // Everything up to the wrap point is consumed and nobody is
                // writing: wrap the consumer and look again from zero.
                if ready == OFFSET_MAX && written == end {
                    if self.end.load(Ordering::SeqCst) != OFFSET_MAX {
                        self.end.store(OFFSET_MAX, Ordering::SeqCst);
                    }
                    written = 0;
                    self.written.store(written, Ordering::SeqCst);
                    continue;
                }

                ready = ready.min(end);
            } else {
                ready = ready.min(next);
            }

            debug_assert!(ready >= written);
            let len = ready - written;
            if len == 0 {
                return None;
            }
            return Some(Readable {
                offset: written as usize,
                len: len as usize,
            });
        }
    }

    /// Hand `len` consumed bytes back to producers.
    pub fn release(&self, len: usize) {
        let written = self.written.load(Ordering::SeqCst);
        let advanced = written + len as u64;
        debug_assert!(advanced <= self.space);
        let advanced = if advanced == self.space { 0 } else { advanced };
        self.written.store(advanced, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn cursor(&self) -> Cursor {
        Cursor::decode(self.next.load(Ordering::SeqCst))
    }

    #[cfg(test)]
    fn written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }
}
