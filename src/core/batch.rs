// Read-only view over one readable range and the durable records inside it.
use std::iter::FusedIterator;

use crate::core::entry::{CACHELINE_SIZE, EntryState, Line, Lines};

/// Records handed to a consume callback. Only valid for the duration of the
/// callback; the range is cleared once the callback returns `Ok`.
#[derive(Clone, Copy, Debug)]
pub struct Batch<'a> {
    offset: usize,
    lines: Lines<'a>,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(offset: usize, bytes: &'a [u8]) -> Self {
        Self {
            offset,
            lines: Lines::new(bytes),
        }
    }

    /// Buffer offset of the scanned range.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes covered by the range, including skipped lines.
    pub fn scanned_len(&self) -> usize {
        self.lines.count() * CACHELINE_SIZE
    }

    pub fn entries(&self) -> Entries<'a> {
        Entries {
            lines: self.lines,
            at: Line::ZERO,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries().next().is_none()
    }

    pub(crate) fn lines(&self) -> Lines<'a> {
        self.lines
    }
}

impl<'a> IntoIterator for Batch<'a> {
    type Item = &'a [u8];
    type IntoIter = Entries<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries()
    }
}

/// Payloads of durable entries in log order. Empty lines are stepped over one
/// at a time; reserved entries are skipped by their declared span.
#[derive(Clone, Debug)]
pub struct Entries<'a> {
    lines: Lines<'a>,
    at: Line,
}

impl Entries<'_> {
    fn finish(&mut self) {
        self.at = self.lines.end();
    }
}

impl<'a> Iterator for Entries<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        while self.at < self.lines.end() {
            let header = self.lines.header(self.at)?;
            let state = header.state();
            if state == EntryState::Empty {
                self.at = self.at.advance(1);
                continue;
            }

            // An entry that claims to run past the range cannot be read.
            let range_len = self.lines.count() * CACHELINE_SIZE;
            let Some(span) = header.span().filter(|span| {
                self.at
                    .offset()
                    .checked_add(*span)
                    .is_some_and(|end| end <= range_len)
            }) else {
                self.finish();
                return None;
            };
            let here = self.at;
            self.at = here.advance(span / CACHELINE_SIZE);

            if state == EntryState::Durable {
                // span fits, so the payload does too.
                let len = header.payload_len() as usize;
                return self.lines.payload(here, len);
            }
        }
        None
    }
}

impl FusedIterator for Entries<'_> {}

#[cfg(test)]
mod tests {
    use super::Batch;
    use crate::core::entry::{CACHELINE_SIZE, EntryHeader};

    fn put(bytes: &mut [u8], line: usize, header: EntryHeader, payload: &[u8]) {
        let at = line * CACHELINE_SIZE;
        bytes[at..at + 8].copy_from_slice(&header.encode());
        bytes[at + 8..at + 8 + payload.len()].copy_from_slice(payload);
    }

    #[test]
    fn yields_only_durable_entries() {
        let mut bytes = vec![0u8; CACHELINE_SIZE * 8];
        put(&mut bytes, 0, EntryHeader::durable(3), b"one");
        // Line 1 is empty.
        put(&mut bytes, 2, EntryHeader::reserved(100), &[7u8; 100]);
        put(&mut bytes, 4, EntryHeader::durable(70), &[9u8; 70]);
        put(&mut bytes, 6, EntryHeader::durable(1), b"z");

        let batch = Batch::new(128, &bytes);
        let entries: Vec<&[u8]> = batch.entries().collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], b"one");
        assert_eq!(entries[1], &[9u8; 70][..]);
        assert_eq!(entries[2], b"z");
        assert_eq!(batch.offset(), 128);
        assert_eq!(batch.scanned_len(), 512);
    }

    #[test]
    fn payload_lines_are_not_mistaken_for_headers() {
        let mut bytes = vec![0u8; CACHELINE_SIZE * 3];
        let mut payload = vec![0xffu8; 130];
        // Second line of the payload looks like a durable header.
        payload[56..64].copy_from_slice(&EntryHeader::durable(5).encode());
        put(&mut bytes, 0, EntryHeader::durable(130), &payload);

        let batch = Batch::new(0, &bytes);
        let entries: Vec<&[u8]> = batch.into_iter().collect();
        assert_eq!(entries, vec![&payload[..]]);
    }

    #[test]
    fn entry_overrunning_range_ends_iteration() {
        let mut bytes = vec![0u8; CACHELINE_SIZE * 2];
        put(&mut bytes, 0, EntryHeader::durable(2), b"ok");
        put(&mut bytes, 1, EntryHeader::durable(60), &[1u8; 56]);

        let batch = Batch::new(0, &bytes);
        let mut entries = batch.entries();
        assert_eq!(entries.next(), Some(&b"ok"[..]));
        assert_eq!(entries.next(), None);
        assert_eq!(entries.next(), None);
    }

    #[test]
    fn all_empty_range_is_empty_batch() {
        let bytes = vec![0u8; CACHELINE_SIZE * 4];
        let batch = Batch::new(0, &bytes);
        assert!(batch.is_empty());
    }
}
