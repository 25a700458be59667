//! Purpose: Queue facade tying the durable log, the ring tracker, and workers together.
//! Exports: `Queue`.
//! Role: Owns volatile arbitration state; runs recovery on construction; the
//!       single consumer drains batches through it.
//! Invariants: The checkpoint moves only inside the same transaction that
//!             clears the consumed range; the ring is released after commit.
//! Invariants: A callback error rolls back and releases nothing, so the same
//!             range is delivered again.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::core::batch::Batch;
use crate::core::entry::{self, EntryState, HEADER_LEN, Line};
use crate::core::error::{Error, ErrorKind};
use crate::core::ids::WorkerIds;
use crate::core::log::DurableLog;
use crate::core::recovery;
use crate::core::ring::{Readable, RingTracker};
use crate::core::store::DurableStore;
use crate::core::worker::Worker;

/// A readable range can straddle the wrap point; one pass per side.
const CONSUME_PASSES: usize = 2;

pub struct Queue<S: DurableStore> {
    log: DurableLog<S>,
    ring: RingTracker,
    ids: Arc<WorkerIds>,
    consuming: AtomicBool,
}

impl<S: DurableStore> Queue<S> {
    pub fn new(log: DurableLog<S>, max_workers: usize) -> Result<Self, Error> {
        Self::with_worker_ids(log, max_workers, Arc::new(WorkerIds::new()))
    }

    pub fn with_worker_ids(
        log: DurableLog<S>,
        max_workers: usize,
        ids: Arc<WorkerIds>,
    ) -> Result<Self, Error> {
        if max_workers == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("max_workers must be at least 1"));
        }
        let ring = RingTracker::new(max_workers, log.capacity());
        recovery::restore_offsets(&ring, log.consumed_offset())?;
        info!(
            capacity = log.capacity(),
            consumed = log.consumed_offset(),
            max_workers,
            "opened queue"
        );
        Ok(Self {
            log,
            ring,
            ids,
            consuming: AtomicBool::new(false),
        })
    }

    pub fn register_worker(&self) -> Result<Worker<'_, S>, Error> {
        let id = self.ids.acquire();
        if id >= self.ring.max_workers() {
            self.ids.release(id);
            return Err(Error::new(ErrorKind::Busy)
                .with_message(format!("all {} worker slots are taken", self.ring.max_workers()))
                .with_hint("Drop an existing worker or open the queue with more workers."));
        }
        Ok(Worker::new(self, id))
    }

    /// Deliver the next readable records to `f`. Returns `Ok(true)` when at
    /// least one record was delivered and committed.
    ///
    /// Returns `Ok(false)` without calling `f` when nothing is ready or another
    /// consume is already running. An error from `f` (conventionally
    /// `ErrorKind::Aborted`) rolls the pass back and is returned as is.
    pub fn try_consume_batch<F>(&self, mut f: F) -> Result<bool, Error>
    where
        F: FnMut(Batch<'_>) -> Result<(), Error>,
    {
        if self.consuming.swap(true, Ordering::Acquire) {
            debug!("consume already running");
            return Ok(false);
        }
        let _guard = ConsumeGuard(&self.consuming);

        let mut delivered = false;
        for _ in 0..CONSUME_PASSES {
            let Some(readable) = self.ring.consume() else {
                break;
            };
            delivered |= self.consume_range(readable, &mut f)?;
        }
        Ok(delivered)
    }

    fn consume_range<F>(&self, readable: Readable, f: &mut F) -> Result<bool, Error>
    where
        F: FnMut(Batch<'_>) -> Result<(), Error>,
    {
        let Readable { offset, len } = readable;
        let next = match offset + len {
            end if end == self.log.capacity() => 0,
            end => end,
        };

        let delivered = self.log.store().transaction(|tx| {
            // SAFETY: the ring hands this range to the consumer alone until
            // it is released below.
            let batch = Batch::new(offset, unsafe { self.log.view_bytes(offset, len) });
            let delivered = !batch.is_empty();
            if delivered {
                f(batch)?;
            }

            let lines = batch.lines();
            let mut line = Line::ZERO;
            while line < lines.end() {
                if lines.header(line).is_some_and(|h| h.state() != EntryState::Empty) {
                    let at = self.log.region_offset(offset + line.offset());
                    tx.write(at, &[0u8; HEADER_LEN])?;
                }
                line = line.advance(1);
            }
            self.log.write_consumed_offset(tx, next)?;
            Ok(delivered)
        })?;

        self.ring.release(len);
        debug!(offset, len, delivered, checkpoint = next, "consumed range");
        Ok(delivered)
    }

    pub fn capacity(&self) -> usize {
        self.log.capacity()
    }

    pub fn consumed_offset(&self) -> usize {
        self.log.consumed_offset()
    }

    pub fn max_workers(&self) -> usize {
        self.ring.max_workers()
    }

    /// Largest payload a single record may carry.
    pub fn max_record_len(&self) -> usize {
        self.max_record_span() - HEADER_LEN
    }

    /// Half the buffer always fits an empty ring, in place or at the head.
    pub(crate) fn max_record_span(&self) -> usize {
        entry::align_down(self.capacity() / 2)
    }

    pub fn log(&self) -> &DurableLog<S> {
        &self.log
    }

    pub fn into_log(self) -> DurableLog<S> {
        self.log
    }

    pub(crate) fn ring(&self) -> &RingTracker {
        &self.ring
    }

    pub(crate) fn worker_ids(&self) -> &WorkerIds {
        &self.ids
    }
}

struct ConsumeGuard<'a>(&'a AtomicBool);

impl Drop for ConsumeGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
