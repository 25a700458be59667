// Pool file creation/opening with header validation, mmap, exclusive locking, and a redo journal.
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{Ordering, fence};
use std::sync::{Mutex, PoisonError};

use fs2::FileExt;
use libc::{EACCES, EPERM};
use memmap2::MmapMut;
use serde::Serialize;
use tracing::{info, warn};

use crate::core::entry::{self, CACHELINE_SIZE};
use crate::core::error::{Error, ErrorKind};
use crate::core::store::{DurableStore, Journal, JournalWrite, Region};

const MAGIC: [u8; 4] = *b"MPLG";
const VERSION: u32 = 1;
const ENDIANNESS_LE: u8 = 1;
const HEADER_SIZE: usize = 4096;
const PAGE_SIZE: u64 = 4096;

const JOURNAL_HEADER_LEN: usize = CACHELINE_SIZE;
const JOURNAL_CLEAN: u64 = 0;
const JOURNAL_COMMITTED: u64 = 1;
// offset + length words, data padded to 8 bytes.
const RECORD_OVERHEAD: usize = 16;
const HEADER_WORD_RECORD: usize = RECORD_OVERHEAD + 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolHeader {
    pub file_size: u64,
    pub journal_offset: u64,
    pub journal_size: u64,
    pub data_offset: u64,
    pub data_size: u64,
}

impl PoolHeader {
    fn new(capacity: u64) -> Result<Self, Error> {
        let lines = capacity / CACHELINE_SIZE as u64;
        if capacity % CACHELINE_SIZE as u64 != 0 || lines < 2 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("capacity must be a multiple of 64 bytes and at least 128 bytes"));
        }
        if capacity >= u32::MAX as u64 {
            return Err(Error::new(ErrorKind::Usage).with_message("capacity must be below 4 GiB"));
        }
        // One header word per cacheline plus the checkpoint word.
        let journal_need = JOURNAL_HEADER_LEN as u64 + (lines + 1) * HEADER_WORD_RECORD as u64;
        let journal_size = align_page(journal_need);
        let journal_offset = HEADER_SIZE as u64;
        let data_offset = journal_offset + journal_size;
        let data_size = CACHELINE_SIZE as u64 + capacity;
        Ok(Self {
            file_size: data_offset + data_size,
            journal_offset,
            journal_size,
            data_offset,
            data_size,
        })
    }

    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buf[8] = ENDIANNESS_LE;

        write_u64(&mut buf, 16, self.file_size);
        write_u64(&mut buf, 24, self.journal_offset);
        write_u64(&mut buf, 32, self.journal_size);
        write_u64(&mut buf, 40, self.data_offset);
        write_u64(&mut buf, 48, self.data_size);

        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("header too small"));
        }
        if buf[0..4] != MAGIC {
            return Err(Error::new(ErrorKind::Corrupt).with_message("bad magic"));
        }
        let version = u32::from_le_bytes(read_4(buf, 4));
        if version != VERSION {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("unsupported pool format version {version}")));
        }
        if buf[8] != ENDIANNESS_LE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unsupported endianness"));
        }

        Ok(Self {
            file_size: read_u64(buf, 16),
            journal_offset: read_u64(buf, 24),
            journal_size: read_u64(buf, 32),
            data_offset: read_u64(buf, 40),
            data_size: read_u64(buf, 48),
        })
    }

    fn validate(&self, actual_file_size: u64) -> Result<(), Error> {
        if self.file_size == 0 || self.file_size > actual_file_size {
            return Err(Error::new(ErrorKind::Corrupt).with_message("invalid file size"));
        }
        if self.journal_offset != HEADER_SIZE as u64 || self.journal_offset % PAGE_SIZE != 0 {
            return Err(Error::new(ErrorKind::Corrupt).with_message("invalid journal offset"));
        }
        if self.journal_size < JOURNAL_HEADER_LEN as u64 || self.journal_size % PAGE_SIZE != 0 {
            return Err(Error::new(ErrorKind::Corrupt).with_message("invalid journal size"));
        }
        if self.data_offset != self.journal_offset + self.journal_size {
            return Err(Error::new(ErrorKind::Corrupt).with_message("journal/data bounds mismatch"));
        }
        if self.data_offset + self.data_size != self.file_size {
            return Err(Error::new(ErrorKind::Corrupt).with_message("data bounds mismatch"));
        }
        if self.data_size < 3 * CACHELINE_SIZE as u64 {
            return Err(Error::new(ErrorKind::Corrupt).with_message("data region too small"));
        }
        Ok(())
    }

    pub fn capacity(&self) -> u64 {
        entry::align_down((self.data_size as usize).saturating_sub(CACHELINE_SIZE)) as u64
    }
}

fn align_page(value: u64) -> u64 {
    value.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_8(buf, offset))
}

fn read_8(buf: &[u8], offset: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    out
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[derive(Clone, Copy, Debug)]
pub struct PoolOptions {
    /// Log buffer size in bytes.
    pub capacity: u64,
}

impl PoolOptions {
    pub fn new(capacity: u64) -> Self {
        Self { capacity }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PoolInfo {
    pub path: PathBuf,
    pub file_size: u64,
    pub capacity: u64,
    pub journal_size: u64,
}

/// Memory-mapped pool file. Implements [`DurableStore`] over its data region.
pub struct Pool {
    path: PathBuf,
    // Holds the exclusive lock until the pool is dropped.
    _file: File,
    mmap: MmapMut,
    header: PoolHeader,
    journal: Region,
    data: Region,
    commit_lock: Mutex<()>,
}

impl Pool {
    pub fn create(path: impl AsRef<Path>, options: PoolOptions) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let header = PoolHeader::new(options.capacity)?;
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| io_error(&path, err))?;
        lock_exclusive(&file, &path)?;

        file.set_len(header.file_size)
            .map_err(|err| io_error(&path, err))?;
        write_header(&mut file, &header, &path)?;
        file.sync_all().map_err(|err| io_error(&path, err))?;

        info!(path = %path.display(), capacity = options.capacity, "created pool");
        Self::map(path, file, header)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| io_error(&path, err))?;
        lock_exclusive(&file, &path)?;

        let actual_size = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| io_error(&path, err))?;

        let header = read_header(&mut file, &path)?;
        header
            .validate(actual_size)
            .map_err(|err| err.with_path(&path))?;

        let pool = Self::map(path, file, header)?;
        pool.replay_journal()?;
        info!(path = %pool.path.display(), capacity = header.capacity(), "opened pool");
        Ok(pool)
    }

    fn map(path: PathBuf, file: File, header: PoolHeader) -> Result<Self, Error> {
        let mut mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|err| io_error(&path, err))?
        };
        if (mmap.len() as u64) < header.file_size {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("mapping shorter than header file size")
                .with_path(&path));
        }
        let base = mmap.as_mut_ptr();
        // SAFETY: both ranges lie inside the mapping, which lives as long as
        // the pool and never moves; offsets are page aligned.
        let (journal, data) = unsafe {
            let journal_ptr = NonNull::new_unchecked(base.add(header.journal_offset as usize));
            let data_ptr = NonNull::new_unchecked(base.add(header.data_offset as usize));
            (
                Region::from_raw(journal_ptr, header.journal_size as usize),
                Region::from_raw(data_ptr, header.data_size as usize),
            )
        };

        Ok(Self {
            path,
            _file: file,
            mmap,
            header,
            journal,
            data,
            commit_lock: Mutex::new(()),
        })
    }

    pub fn header(&self) -> PoolHeader {
        self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> PoolInfo {
        PoolInfo {
            path: self.path.clone(),
            file_size: self.header.file_size,
            capacity: self.header.capacity(),
            journal_size: self.header.journal_size,
        }
    }

    fn flush_journal(&self, offset: usize, len: usize) -> Result<(), Error> {
        self.mmap
            .flush_range(self.header.journal_offset as usize + offset, len)
            .map_err(|err| io_error(&self.path, err))
    }

    fn set_journal_state(&self, state: u64, len: usize) -> Result<(), Error> {
        let mut buf = [0u8; 16];
        write_u64(&mut buf, 0, state);
        write_u64(&mut buf, 8, len as u64);
        // SAFETY: the journal area is only touched under `commit_lock` or
        // before the pool is shared.
        unsafe { self.journal.write(0, &buf) };
        self.flush_journal(0, buf.len())
    }

    fn replay_journal(&self) -> Result<(), Error> {
        // SAFETY: called from `open` before the pool is shared.
        let state = unsafe { self.journal.read_u64(0) };
        if state == JOURNAL_CLEAN {
            return Ok(());
        }
        if state != JOURNAL_COMMITTED {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("invalid journal state")
                .with_path(&self.path));
        }
        let len = unsafe { self.journal.read_u64(8) } as usize;
        if len > self.journal.len() - JOURNAL_HEADER_LEN {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("journal length exceeds journal area")
                .with_path(&self.path));
        }
        let encoded = unsafe { self.journal.bytes(JOURNAL_HEADER_LEN, len) };
        let journal = decode_journal(encoded, self.data.len())
            .map_err(|err| err.with_path(&self.path))?;
        warn!(
            path = %self.path.display(),
            writes = journal.writes().len(),
            "replaying interrupted transaction"
        );
        self.apply(&journal)?;
        self.set_journal_state(JOURNAL_CLEAN, 0)
    }

    fn apply(&self, journal: &Journal) -> Result<(), Error> {
        // SAFETY: journaled ranges belong to the consumer.
        unsafe { journal.apply(&self.data) };
        let start = journal.writes().iter().map(|w| w.offset).min();
        let end = journal
            .writes()
            .iter()
            .map(|w| w.offset + w.data.len())
            .max();
        if let (Some(start), Some(end)) = (start, end) {
            self.flush(start, end - start)?;
        }
        Ok(())
    }
}

impl DurableStore for Pool {
    fn region(&self) -> &Region {
        &self.data
    }

    fn flush(&self, offset: usize, len: usize) -> Result<(), Error> {
        self.mmap
            .flush_range(self.header.data_offset as usize + offset, len)
            .map_err(|err| io_error(&self.path, err))
    }

    fn drain(&self) -> Result<(), Error> {
        // msync in `flush` is synchronous.
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn commit(&self, journal: &Journal) -> Result<(), Error> {
        let _guard = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let encoded = encode_journal(journal);
        if encoded.len() > self.journal.len() - JOURNAL_HEADER_LEN {
            return Err(Error::new(ErrorKind::Internal)
                .with_message("transaction journal overflow")
                .with_path(&self.path));
        }
        // SAFETY: guarded by `commit_lock`.
        unsafe { self.journal.write(JOURNAL_HEADER_LEN, &encoded) };
        self.flush_journal(JOURNAL_HEADER_LEN, encoded.len())?;
        self.set_journal_state(JOURNAL_COMMITTED, encoded.len())?;
        self.apply(journal)?;
        self.set_journal_state(JOURNAL_CLEAN, 0)
    }
}

fn encode_journal(journal: &Journal) -> Vec<u8> {
    let mut out = Vec::new();
    for write in journal.writes() {
        out.extend_from_slice(&(write.offset as u64).to_le_bytes());
        out.extend_from_slice(&(write.data.len() as u64).to_le_bytes());
        out.extend_from_slice(&write.data);
        let padded = write.data.len().div_ceil(8) * 8;
        out.resize(out.len() + padded - write.data.len(), 0);
    }
    out
}

fn decode_journal(buf: &[u8], region_len: usize) -> Result<Journal, Error> {
    let corrupt = || Error::new(ErrorKind::Corrupt).with_message("malformed journal record");
    let mut writes = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        if pos + RECORD_OVERHEAD > buf.len() {
            return Err(corrupt());
        }
        let offset = usize::try_from(read_u64(buf, pos)).map_err(|_| corrupt())?;
        let len = usize::try_from(read_u64(buf, pos + 8)).map_err(|_| corrupt())?;
        let data_start = pos + RECORD_OVERHEAD;
        let data_end = data_start.checked_add(len).ok_or_else(corrupt)?;
        let in_region = offset.checked_add(len).is_some_and(|end| end <= region_len);
        if data_end > buf.len() || !in_region {
            return Err(corrupt());
        }
        writes.push(JournalWrite {
            offset,
            data: buf[data_start..data_end].to_vec(),
        });
        pos = data_start + len.div_ceil(8) * 8;
    }
    Ok(Journal::from_writes(writes))
}

fn io_error(path: &Path, err: io::Error) -> Error {
    let kind = match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    };
    Error::new(kind).with_path(path).with_source(err)
}

fn lock_exclusive(file: &File, path: &Path) -> Result<(), Error> {
    FileExt::try_lock_exclusive(file).map_err(|err| {
        Error::new(lock_error_kind(&err))
            .with_message("pool is open in another process")
            .with_path(path)
            .with_source(err)
    })
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

fn read_header(file: &mut File, path: &Path) -> Result<PoolHeader, Error> {
    let mut buf = [0u8; HEADER_SIZE];
    file.seek(SeekFrom::Start(0))
        .map_err(|err| io_error(path, err))?;
    file.read_exact(&mut buf).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Error::new(ErrorKind::Corrupt)
                .with_message("file too small for pool header")
                .with_path(path)
        } else {
            io_error(path, err)
        }
    })?;
    PoolHeader::decode(&buf).map_err(|err| err.with_path(path))
}

fn write_header(file: &mut File, header: &PoolHeader, path: &Path) -> Result<(), Error> {
    let buf = header.encode();
    file.seek(SeekFrom::Start(0))
        .map_err(|err| io_error(path, err))?;
    file.write_all(&buf).map_err(|err| io_error(path, err))?;
    file.flush().map_err(|err| io_error(path, err))?;
    Ok(())
}
