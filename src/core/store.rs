//! Purpose: Durable byte-range storage contract the log is built on.
//! Exports: `DurableStore`, `Region`, `Tx`, `Journal`, `JournalWrite`, `MemStore`.
//! Role: Plain stores + flush/drain barrier for producers; redo-journaled
//!       transactions for the consumer's checkpoint updates.
//! Invariants: `Region` never hands out overlapping mutable access by itself;
//!             exclusivity of a written range is the caller's contract.
//! Invariants: A failed transaction applies nothing.
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{Ordering, fence};
use std::sync::{Mutex, PoisonError};

use crate::core::entry::CACHELINE_SIZE;
use crate::core::error::{Error, ErrorKind};

/// Raw byte-addressable memory shared between producer threads and the consumer.
#[derive(Debug)]
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
}

// Access discipline is enforced by the ring tracker, not by the type.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// the region is used, and aligned to `CACHELINE_SIZE`.
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize) -> Self {
        debug_assert_eq!(ptr.as_ptr() as usize % CACHELINE_SIZE, 0);
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: usize, len: usize) {
        let end = offset.checked_add(len);
        assert!(
            matches!(end, Some(end) if end <= self.len),
            "range {offset}+{len} exceeds region of {} bytes",
            self.len
        );
    }

    /// # Safety
    /// No other thread may read or write `offset..offset + bytes.len()`
    /// while this runs.
    pub unsafe fn write(&self, offset: usize, bytes: &[u8]) {
        self.check(offset, bytes.len());
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.as_ptr().add(offset),
                bytes.len(),
            );
        }
    }

    /// # Safety
    /// No thread may write `offset..offset + len` while the slice is alive.
    pub unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        self.check(offset, len);
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) }
    }

    /// # Safety
    /// Same contract as [`Region::bytes`].
    pub unsafe fn read_u64(&self, offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(unsafe { self.bytes(offset, 8) });
        u64::from_le_bytes(raw)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JournalWrite {
    pub offset: usize,
    pub data: Vec<u8>,
}

/// Redo log of the writes performed inside one transaction.
#[derive(Clone, Debug, Default)]
pub struct Journal {
    writes: Vec<JournalWrite>,
}

impl Journal {
    pub fn from_writes(writes: Vec<JournalWrite>) -> Self {
        Self { writes }
    }

    pub fn writes(&self) -> &[JournalWrite] {
        &self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// # Safety
    /// The caller must own every range the journal touches.
    pub unsafe fn apply(&self, region: &Region) {
        for write in &self.writes {
            unsafe { region.write(write.offset, &write.data) };
        }
    }
}

/// Scoped durable update. Writes are buffered and only reach the store when
/// the closure passed to [`DurableStore::transaction`] returns `Ok`.
pub struct Tx {
    region_len: usize,
    journal: Journal,
}

impl Tx {
    fn new(region_len: usize) -> Self {
        Self {
            region_len,
            journal: Journal::default(),
        }
    }

    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), Error> {
        let in_bounds = offset
            .checked_add(bytes.len())
            .is_some_and(|end| end <= self.region_len);
        if !in_bounds {
            return Err(Error::new(ErrorKind::Internal)
                .with_message("transaction write outside region")
                .with_offset(offset as u64));
        }
        self.journal.writes.push(JournalWrite {
            offset,
            data: bytes.to_vec(),
        });
        Ok(())
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) -> Result<(), Error> {
        self.write(offset, &value.to_le_bytes())
    }
}

pub trait DurableStore: Send + Sync {
    fn region(&self) -> &Region;

    /// Start making `offset..offset + len` durable; completion is only
    /// guaranteed by the next [`DurableStore::drain`].
    fn flush(&self, offset: usize, len: usize) -> Result<(), Error>;

    /// Durability barrier for every range flushed so far.
    fn drain(&self) -> Result<(), Error>;

    /// Apply `journal` to the region as a single crash-atomic step.
    fn commit(&self, journal: &Journal) -> Result<(), Error>;

    fn persist(&self, offset: usize, len: usize) -> Result<(), Error> {
        self.flush(offset, len)?;
        self.drain()
    }

    fn transaction<R, F>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut Tx) -> Result<R, Error>,
        Self: Sized,
    {
        let mut tx = Tx::new(self.region().len());
        let out = f(&mut tx)?;
        if !tx.journal.is_empty() {
            self.commit(&tx.journal)?;
        }
        Ok(out)
    }
}

/// Heap-backed store. Flushed bytes are mirrored into a separate media image,
/// so [`MemStore::image`] is exactly what a crash at that instant would leave.
pub struct MemStore {
    region: Region,
    layout: Layout,
    media: Mutex<Vec<u8>>,
}

impl MemStore {
    pub fn new(len: usize) -> Result<Self, Error> {
        Self::from_image(&vec![0u8; len])
    }

    /// Reopen a store from a crash image taken with [`MemStore::image`].
    pub fn from_image(image: &[u8]) -> Result<Self, Error> {
        if image.is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("store length must be non-zero"));
        }
        let layout = Layout::from_size_align(image.len(), CACHELINE_SIZE).map_err(|_| {
            Error::new(ErrorKind::Usage).with_message("store length overflows allocation")
        })?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        // SAFETY: freshly allocated, aligned to CACHELINE_SIZE, freed in Drop.
        let region = unsafe { Region::from_raw(ptr, image.len()) };
        // SAFETY: nobody else can see the region yet.
        unsafe { region.write(0, image) };
        Ok(Self {
            region,
            layout,
            media: Mutex::new(image.to_vec()),
        })
    }

    /// Bytes that have reached the simulated media.
    pub fn image(&self) -> Vec<u8> {
        self.media
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// A new store holding only what survived a crash right now.
    pub fn crash(&self) -> Result<MemStore, Error> {
        MemStore::from_image(&self.image())
    }
}

impl Drop for MemStore {
    fn drop(&mut self) {
        // SAFETY: allocated in `from_image` with the same layout.
        unsafe { alloc::dealloc(self.region.ptr.as_ptr(), self.layout) };
    }
}

impl DurableStore for MemStore {
    fn region(&self) -> &Region {
        &self.region
    }

    fn flush(&self, offset: usize, len: usize) -> Result<(), Error> {
        let mut media = self.media.lock().unwrap_or_else(PoisonError::into_inner);
        // SAFETY: the flushing thread owns the range it just wrote.
        let bytes = unsafe { self.region.bytes(offset, len) };
        media[offset..offset + len].copy_from_slice(bytes);
        Ok(())
    }

    fn drain(&self) -> Result<(), Error> {
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn commit(&self, journal: &Journal) -> Result<(), Error> {
        let mut media = self.media.lock().unwrap_or_else(PoisonError::into_inner);
        // SAFETY: transactions only touch consumer-owned ranges.
        unsafe { journal.apply(&self.region) };
        for write in journal.writes() {
            media[write.offset..write.offset + write.data.len()].copy_from_slice(&write.data);
        }
        Ok(())
    }
}
