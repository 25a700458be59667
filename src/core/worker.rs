//! Purpose: Producer handle that appends records with torn-write protection.
//! Exports: `Worker`.
//! Role: One per producing thread; borrows its queue so it cannot outlive it.
//! Invariants: A record becomes visible only when its header loses the dirty
//!             bit, and that store happens after every payload line is durable.
//! Invariants: Every successful acquire is announced exactly once, even when a
//!             storage call fails halfway.
use tracing::{trace, warn};

use crate::core::entry::{self, CACHELINE_SIZE, EntryHeader, FIRST_LINE_PAYLOAD, HEADER_LEN};
use crate::core::error::{Error, ErrorKind};
use crate::core::queue::Queue;
use crate::core::ring::RingTracker;
use crate::core::store::DurableStore;

pub struct Worker<'q, S: DurableStore> {
    queue: &'q Queue<S>,
    id: usize,
}

impl<'q, S: DurableStore> Worker<'q, S> {
    pub(crate) fn new(queue: &'q Queue<S>, id: usize) -> Self {
        queue.ring().register(id);
        Self { queue, id }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Append `payload`. `Ok(false)` means the log is full right now.
    pub fn try_produce(&mut self, payload: &[u8]) -> Result<bool, Error> {
        self.try_produce_then(payload, |_| {})
    }

    /// Like [`Worker::try_produce`], running `on_durable` once the record is
    /// durable and before the consumer may see it.
    pub fn try_produce_then<F>(&mut self, payload: &[u8], on_durable: F) -> Result<bool, Error>
    where
        F: FnOnce(&[u8]),
    {
        let span = self.record_span(payload.len())?;
        let Some(reservation) = self.reserve(span) else {
            return Ok(false);
        };
        self.write_record(reservation.offset, payload)
            .inspect_err(|err| warn!(worker = self.id, error = %err, "produce failed"))?;
        on_durable(payload);
        drop(reservation);
        Ok(true)
    }

    /// Reserve room for a `len`-byte record, then let `fill` write the payload.
    /// `fill` is not called when the log is full.
    pub fn try_produce_with<F>(&mut self, len: usize, fill: F) -> Result<bool, Error>
    where
        F: FnOnce(&mut [u8]),
    {
        let span = self.record_span(len)?;
        let Some(reservation) = self.reserve(span) else {
            return Ok(false);
        };
        let mut payload = vec![0u8; len];
        fill(&mut payload);
        self.write_record(reservation.offset, &payload)
            .inspect_err(|err| warn!(worker = self.id, error = %err, "produce failed"))?;
        drop(reservation);
        Ok(true)
    }

    fn record_span(&self, len: usize) -> Result<usize, Error> {
        if len == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("record payload is empty"));
        }
        match entry::entry_len(len) {
            Some(span) if span <= self.queue.max_record_span() => Ok(span),
            _ => Err(Error::new(ErrorKind::Usage)
                .with_message(format!("record of {len} bytes is too large for the log"))
                .with_hint(format!(
                    "Records are limited to {} bytes for this log.",
                    self.queue.max_record_len()
                ))),
        }
    }

    fn reserve(&self, span: usize) -> Option<Reservation<'q>> {
        let ring = self.queue.ring();
        match ring.acquire(self.id, span) {
            Some(offset) => Some(Reservation {
                ring,
                slot: self.id,
                offset,
            }),
            None => {
                trace!(worker = self.id, span, "log full");
                None
            }
        }
    }

    fn write_record(&self, offset: usize, payload: &[u8]) -> Result<(), Error> {
        let log = self.queue.log();
        let store = log.store();
        let region = store.region();
        let base = log.region_offset(offset);

        // Header and the first slice of payload go out as one line.
        let (head, rest) = payload.split_at(payload.len().min(FIRST_LINE_PAYLOAD));
        let mut line = [0u8; CACHELINE_SIZE];
        line[..HEADER_LEN].copy_from_slice(&EntryHeader::reserved(payload.len()).encode());
        line[HEADER_LEN..HEADER_LEN + head.len()].copy_from_slice(head);
        // SAFETY: the reservation gives this worker sole access to the range.
        unsafe { region.write(base, &line) };
        store.persist(base, CACHELINE_SIZE)?;

        let (body, tail) = rest.split_at(entry::align_down(rest.len()));
        let mut at = base + CACHELINE_SIZE;
        if !body.is_empty() {
            unsafe { region.write(at, body) };
            store.flush(at, body.len())?;
            at += body.len();
        }
        if !tail.is_empty() {
            let mut last = [0u8; CACHELINE_SIZE];
            last[..tail.len()].copy_from_slice(tail);
            unsafe { region.write(at, &last) };
            store.flush(at, CACHELINE_SIZE)?;
        }
        store.drain()?;

        // Commit point. The range is not announced yet, so putting the dirty
        // header back keeps a failed record away from the consumer.
        unsafe { region.write(base, &EntryHeader::durable(payload.len()).encode()) };
        store.persist(base, HEADER_LEN).inspect_err(|_| unsafe {
            region.write(base, &EntryHeader::reserved(payload.len()).encode())
        })
    }
}

impl<S: DurableStore> Drop for Worker<'_, S> {
    fn drop(&mut self) {
        self.queue.ring().unregister(self.id);
        self.queue.worker_ids().release(self.id);
    }
}

/// Acquired range; announcing it on drop lets the consumer move past it.
struct Reservation<'a> {
    ring: &'a RingTracker,
    slot: usize,
    offset: usize,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.ring.produce(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::core::entry::{CACHELINE_SIZE, EntryHeader, EntryState, HEADER_LEN};
    use crate::core::error::{Error, ErrorKind};
    use crate::core::log::{CHECKPOINT_LEN, DurableLog};
    use crate::core::queue::Queue;
    use crate::core::store::{DurableStore, Journal, MemStore, Region};

    fn queue(capacity: usize) -> Queue<MemStore> {
        Queue::new(DurableLog::in_memory(capacity).expect("log"), 2).expect("queue")
    }

    fn header_at(image: &[u8], offset: usize) -> EntryHeader {
        let at = CHECKPOINT_LEN + offset;
        EntryHeader::decode(&image[at..at + 8])
    }

    #[test]
    fn record_layout_spans_lines() {
        let q = queue(1024);
        assert!(!q.try_consume_batch(|_| Ok(())).expect("consume"));
        assert_eq!(q.consumed_offset(), 960);
        // 960 + 192 runs past the end, so the record wraps to the front.
        let start = 0;

        let payload: Vec<u8> = (0..130u8).collect();
        let mut worker = q.register_worker().expect("worker");
        assert!(worker.try_produce(&payload).expect("produce"));

        let image = q.log().store().image();
        let header = header_at(&image, start);
        assert_eq!(header.state(), EntryState::Durable);
        assert_eq!(header.payload_len(), 130);
        let at = CHECKPOINT_LEN + start + 8;
        assert_eq!(&image[at..at + 130], &payload[..]);
        // Tail of the last line is zero padded.
        let end = CHECKPOINT_LEN + start + 3 * CACHELINE_SIZE;
        assert!(image[at + 130..end].iter().all(|b| *b == 0));
    }

    #[test]
    fn hook_sees_durable_record_before_consumer() {
        let q = queue(512);
        assert!(!q.try_consume_batch(|_| Ok(())).expect("consume"));
        let start = q.consumed_offset();
        let mut worker = q.register_worker().expect("worker");

        let mut seen = None;
        let produced = worker
            .try_produce_then(b"hello", |payload| {
                let image = q.log().store().image();
                seen = Some((payload.to_vec(), header_at(&image, start).state()));
            })
            .expect("produce");
        assert!(produced);
        assert_eq!(seen, Some((b"hello".to_vec(), EntryState::Durable)));
    }

    #[test]
    fn fill_closure_writes_payload() {
        let q = queue(512);
        assert!(!q.try_consume_batch(|_| Ok(())).expect("consume"));
        let mut worker = q.register_worker().expect("worker");
        assert!(worker
            .try_produce_with(4, |buf| buf.copy_from_slice(b"abcd"))
            .expect("produce"));
        drop(worker);

        let mut got = Vec::new();
        while q
            .try_consume_batch(|batch| {
                got.extend(batch.entries().map(<[u8]>::to_vec));
                Ok(())
            })
            .expect("consume")
        {}
        assert_eq!(got, vec![b"abcd".to_vec()]);
    }

    #[test]
    fn fill_is_skipped_when_full() {
        let q = queue(256);
        let mut worker = q.register_worker().expect("worker");
        // Fresh logs hold every line until the consumer walks them.
        let mut called = false;
        let produced = worker
            .try_produce_with(8, |_| called = true)
            .expect("produce");
        assert!(!produced);
        assert!(!called);
    }

    #[test]
    fn empty_and_oversized_records_are_usage_errors() {
        let q = queue(512);
        let mut worker = q.register_worker().expect("worker");
        let err = worker.try_produce(b"").expect_err("empty");
        assert_eq!(err.kind(), ErrorKind::Usage);

        let err = worker.try_produce(&[0u8; 512]).expect_err("oversized");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(err.hint().is_some());

        let too_big = vec![0u8; q.max_record_len() + 1];
        let err = worker.try_produce(&too_big).expect_err("over the cap");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn largest_record_fits_wherever_cursors_rest() {
        let q = queue(512);
        assert_eq!(q.max_record_len(), 248);
        let mut worker = q.register_worker().expect("worker");
        let payload = vec![7u8; q.max_record_len()];

        // The walk leaves both cursors at 448; later records land at 0 and 256.
        assert!(!q.try_consume_batch(|_| Ok(())).expect("walk"));
        for _ in 0..6 {
            assert!(worker.try_produce(&payload).expect("produce"));
            let mut got = Vec::new();
            while q
                .try_consume_batch(|batch| {
                    got.extend(batch.entries().map(<[u8]>::to_vec));
                    Ok(())
                })
                .expect("consume")
            {}
            assert_eq!(got, vec![payload.clone()]);
        }
    }

    #[test]
    fn failed_commit_keeps_record_hidden() {
        let store = FlakyCommit {
            inner: MemStore::new(CHECKPOINT_LEN + 512).expect("store"),
            fail_commit: AtomicBool::new(false),
        };
        let q = Queue::new(DurableLog::open(store).expect("log"), 1).expect("queue");
        assert!(!q.try_consume_batch(|_| Ok(())).expect("walk"));
        let start = q.consumed_offset();
        let mut worker = q.register_worker().expect("worker");

        q.log().store().fail_commit.store(true, Ordering::SeqCst);
        let err = worker.try_produce(b"lost").expect_err("commit fails");
        assert_eq!(err.kind(), ErrorKind::Io);
        q.log().store().fail_commit.store(false, Ordering::SeqCst);

        // SAFETY: no producer is running.
        let header = unsafe { q.log().view_bytes(start, HEADER_LEN) };
        assert_eq!(EntryHeader::decode(header).state(), EntryState::Reserved);
        assert!(!q.try_consume_batch(|_| Ok(())).expect("consume"));

        assert!(worker.try_produce(b"kept").expect("produce"));
        let mut got = Vec::new();
        assert!(q
            .try_consume_batch(|batch| {
                got.extend(batch.entries().map(<[u8]>::to_vec));
                Ok(())
            })
            .expect("consume"));
        assert_eq!(got, vec![b"kept".to_vec()]);
    }

    /// Fails the header-word flush that marks a record durable.
    struct FlakyCommit {
        inner: MemStore,
        fail_commit: AtomicBool,
    }

    impl DurableStore for FlakyCommit {
        fn region(&self) -> &Region {
            self.inner.region()
        }

        fn flush(&self, offset: usize, len: usize) -> Result<(), Error> {
            if len == HEADER_LEN && self.fail_commit.load(Ordering::SeqCst) {
                return Err(Error::new(ErrorKind::Io).with_message("flush failed"));
            }
            self.inner.flush(offset, len)
        }

        fn drain(&self) -> Result<(), Error> {
            self.inner.drain()
        }

        fn commit(&self, journal: &Journal) -> Result<(), Error> {
            self.inner.commit(journal)
        }
    }

    #[test]
    fn dropping_worker_returns_its_id() {
        let q = queue(512);
        let first = q.register_worker().expect("worker");
        let id = first.id();
        drop(first);
        let again = q.register_worker().expect("worker");
        assert_eq!(again.id(), id);
    }
}
