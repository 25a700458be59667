//! Purpose: The persisted log: one checkpoint cacheline followed by the record buffer.
//! Exports: `DurableLog`, `CHECKPOINT_LEN`.
//! Role: Pure data over a `DurableStore`; arbitration lives in `ring`.
//! Invariants: `consumed_offset` is cacheline aligned and below `capacity`.
//! Invariants: The checkpoint only changes inside a store transaction.
use crate::core::entry::{self, CACHELINE_SIZE};
use crate::core::error::{Error, ErrorKind};
use crate::core::store::{DurableStore, MemStore, Tx};

pub const CHECKPOINT_LEN: usize = CACHELINE_SIZE;

pub struct DurableLog<S> {
    store: S,
    capacity: usize,
}

impl<S: DurableStore> DurableLog<S> {
    pub fn open(store: S) -> Result<Self, Error> {
        let region_len = store.region().len();
        let capacity = entry::align_down(region_len.saturating_sub(CHECKPOINT_LEN));
        if capacity < 2 * CACHELINE_SIZE {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("log needs at least two cachelines of buffer"));
        }
        if capacity >= u32::MAX as usize {
            return Err(Error::new(ErrorKind::Usage).with_message("log buffer must be below 4 GiB"));
        }

        let log = Self { store, capacity };
        let consumed = log.read_checkpoint();
        let valid = usize::try_from(consumed)
            .is_ok_and(|offset| offset < capacity && entry::is_aligned(offset));
        if !valid {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("checkpoint offset outside the log buffer")
                .with_offset(consumed));
        }
        Ok(log)
    }

    fn read_checkpoint(&self) -> u64 {
        // SAFETY: only the consumer writes the checkpoint line, and it is the
        // caller of every read after construction.
        unsafe { self.store.region().read_u64(0) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Offset recovery resumes scanning from.
    pub fn consumed_offset(&self) -> usize {
        self.read_checkpoint() as usize
    }

    pub(crate) fn write_consumed_offset(&self, tx: &mut Tx, offset: usize) -> Result<(), Error> {
        debug_assert!(offset < self.capacity && entry::is_aligned(offset));
        tx.write_u64(0, offset as u64)
    }

    /// Region offset of buffer offset `offset`.
    pub(crate) fn region_offset(&self, offset: usize) -> usize {
        CHECKPOINT_LEN + offset
    }

    /// # Safety
    /// The caller must own `offset..offset + len` of the buffer: either a
    /// producer's acquired range or the consumer's readable range.
    pub(crate) unsafe fn view_bytes(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.capacity);
        unsafe { self.store.region().bytes(self.region_offset(offset), len) }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }
}

impl DurableLog<MemStore> {
    /// Fresh heap-backed log with `capacity` buffer bytes.
    pub fn in_memory(capacity: usize) -> Result<Self, Error> {
        let len = capacity
            .checked_add(CHECKPOINT_LEN)
            .ok_or_else(|| Error::new(ErrorKind::Usage).with_message("capacity overflows"))?;
        Self::open(MemStore::new(len)?)
    }
}
