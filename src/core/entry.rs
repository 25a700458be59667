// Entry header layout, cacheline arithmetic, and the typed line cursor over log bytes.
pub const CACHELINE_SIZE: usize = 64;
pub const HEADER_LEN: usize = 8;
/// Payload bytes that share the first cacheline with the header.
pub const FIRST_LINE_PAYLOAD: usize = CACHELINE_SIZE - HEADER_LEN;
pub const DIRTY_FLAG: u64 = 1 << 63;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryState {
    Empty,
    Reserved,
    Durable,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EntryHeader {
    raw: u64,
}

impl EntryHeader {
    pub const EMPTY: EntryHeader = EntryHeader { raw: 0 };

    pub fn reserved(payload_len: usize) -> Self {
        Self {
            raw: payload_len as u64 | DIRTY_FLAG,
        }
    }

    pub fn durable(payload_len: usize) -> Self {
        Self {
            raw: payload_len as u64 & !DIRTY_FLAG,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        self.raw.to_le_bytes()
    }

    pub fn decode(buf: &[u8]) -> Self {
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&buf[..HEADER_LEN]);
        Self {
            raw: u64::from_le_bytes(raw),
        }
    }

    pub fn state(&self) -> EntryState {
        if self.raw == 0 {
            EntryState::Empty
        } else if self.raw & DIRTY_FLAG != 0 {
            EntryState::Reserved
        } else {
            EntryState::Durable
        }
    }

    pub fn payload_len(&self) -> u64 {
        self.raw & !DIRTY_FLAG
    }

    /// Bytes the entry occupies in the log, header included. `None` for
    /// lengths that cannot describe an entry on this platform.
    pub fn span(&self) -> Option<usize> {
        let payload_len = usize::try_from(self.payload_len()).ok()?;
        entry_len(payload_len)
    }
}

pub fn align_up(value: usize) -> Option<usize> {
    value
        .checked_add(CACHELINE_SIZE - 1)
        .map(|v| v & !(CACHELINE_SIZE - 1))
}

pub fn align_down(value: usize) -> usize {
    value & !(CACHELINE_SIZE - 1)
}

pub fn is_aligned(value: usize) -> bool {
    value % CACHELINE_SIZE == 0
}

/// Log footprint of a record with `payload_len` bytes.
pub fn entry_len(payload_len: usize) -> Option<usize> {
    if payload_len as u64 & DIRTY_FLAG != 0 {
        return None;
    }
    align_up(payload_len.checked_add(HEADER_LEN)?)
}

/// Index of a cacheline within a byte range that starts on a line boundary.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Line(usize);

impl Line {
    pub const ZERO: Line = Line(0);

    pub fn from_offset(offset: usize) -> Option<Self> {
        is_aligned(offset).then_some(Line(offset / CACHELINE_SIZE))
    }

    pub fn offset(self) -> usize {
        self.0 * CACHELINE_SIZE
    }

    pub fn advance(self, lines: usize) -> Line {
        Line(self.0 + lines)
    }
}

/// Read-only cacheline view of a consumer-owned byte range.
#[derive(Clone, Copy, Debug)]
pub struct Lines<'a> {
    bytes: &'a [u8],
}

impl<'a> Lines<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        debug_assert!(is_aligned(bytes.len()));
        Self { bytes }
    }

    pub fn count(&self) -> usize {
        self.bytes.len() / CACHELINE_SIZE
    }

    pub fn end(&self) -> Line {
        Line(self.count())
    }

    pub fn header(&self, line: Line) -> Option<EntryHeader> {
        let start = line.offset();
        let bytes = self.bytes.get(start..start + HEADER_LEN)?;
        Some(EntryHeader::decode(bytes))
    }

    /// Payload of the entry whose header sits on `line`, if it fits the view.
    pub fn payload(&self, line: Line, len: usize) -> Option<&'a [u8]> {
        let start = line.offset().checked_add(HEADER_LEN)?;
        let end = start.checked_add(len)?;
        self.bytes.get(start..end)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CACHELINE_SIZE, EntryHeader, EntryState, Line, Lines, align_down, align_up, entry_len,
    };

    #[test]
    fn alignment_is_cacheline() {
        assert_eq!(align_up(0), Some(0));
        assert_eq!(align_up(1), Some(64));
        assert_eq!(align_up(64), Some(64));
        assert_eq!(align_up(65), Some(128));
        assert_eq!(align_up(usize::MAX), None);
        assert_eq!(align_down(127), 64);
    }

    #[test]
    fn entry_len_includes_header() {
        assert_eq!(entry_len(0), Some(64));
        assert_eq!(entry_len(56), Some(64));
        assert_eq!(entry_len(57), Some(128));
        assert_eq!(entry_len(120), Some(128));
        assert_eq!(entry_len(121), Some(192));
    }

    #[test]
    fn header_states_follow_dirty_bit() {
        assert_eq!(EntryHeader::EMPTY.state(), EntryState::Empty);

        let reserved = EntryHeader::reserved(10);
        assert_eq!(reserved.state(), EntryState::Reserved);
        assert_eq!(reserved.payload_len(), 10);

        let durable = EntryHeader::durable(10);
        assert_eq!(durable.state(), EntryState::Durable);
        assert_eq!(EntryHeader::decode(&durable.encode()), durable);
        assert_eq!(durable.span(), Some(CACHELINE_SIZE));
    }

    #[test]
    fn zero_length_reservation_is_not_empty() {
        let reserved = EntryHeader::reserved(0);
        assert_eq!(reserved.state(), EntryState::Reserved);
        assert_eq!(reserved.span(), Some(CACHELINE_SIZE));
    }

    #[test]
    fn line_cursor_is_bounds_checked() {
        let mut bytes = vec![0u8; CACHELINE_SIZE * 2];
        bytes[64..72].copy_from_slice(&EntryHeader::durable(3).encode());
        bytes[72..75].copy_from_slice(b"abc");
        let lines = Lines::new(&bytes);

        assert_eq!(lines.count(), 2);
        let second = Line::from_offset(64).expect("aligned");
        assert_eq!(lines.header(second), Some(EntryHeader::durable(3)));
        assert_eq!(lines.payload(second, 3), Some(&b"abc"[..]));
        assert_eq!(lines.header(second.advance(1)), None);
        assert_eq!(lines.payload(second, 100), None);
        assert_eq!(Line::from_offset(65), None);
    }
}
