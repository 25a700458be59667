//! Purpose: Rebuild volatile tracker positions from the persisted checkpoint.
//! Exports: `restore_offsets` (crate-internal).
//! Role: Runs once per queue construction, before any worker registers.
//! Invariants: Touches no log bytes; only tracker state changes.
//! Invariants: Afterwards every line of the buffer is covered by exactly one
//!             pending readable range, starting at the checkpoint.
use tracing::info;

use crate::core::entry::CACHELINE_SIZE;
use crate::core::error::{Error, ErrorKind};
use crate::core::ring::RingTracker;

const BOOTSTRAP_SLOT: usize = 0;

pub(crate) fn restore_offsets(ring: &RingTracker, consumed: usize) -> Result<(), Error> {
    ring.register(BOOTSTRAP_SLOT);
    let result = replay(ring, consumed);
    ring.unregister(BOOTSTRAP_SLOT);
    result?;
    info!(consumed, capacity = ring.space(), "restored ring offsets");
    Ok(())
}

fn replay(ring: &RingTracker, consumed: usize) -> Result<(), Error> {
    let space = ring.space();

    if consumed == 0 {
        // Nothing to anchor on: treat the whole buffer, less the line the
        // producer cursor must stay behind, as produced.
        return claim(ring, space - CACHELINE_SIZE, 0);
    }

    // Consumed prefix, then move the consumer cursor onto the checkpoint.
    claim(ring, consumed, 0)?;
    match ring.consume() {
        Some(readable) if readable.offset == 0 && readable.len == consumed => {
            ring.release(readable.len);
        }
        other => {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("unexpected readable range {other:?} during recovery"))
                .with_offset(consumed as u64));
        }
    }

    // Tail from the checkpoint to the end, then the head up to one line
    // short of the checkpoint.
    claim(ring, space - consumed, consumed)?;
    if consumed > CACHELINE_SIZE {
        claim(ring, consumed - CACHELINE_SIZE, 0)?;
    }
    Ok(())
}

fn claim(ring: &RingTracker, len: usize, expected: usize) -> Result<(), Error> {
    match ring.acquire(BOOTSTRAP_SLOT, len) {
        Some(offset) if offset == expected => {
            ring.produce(BOOTSTRAP_SLOT);
            Ok(())
        }
        Some(offset) => {
            ring.produce(BOOTSTRAP_SLOT);
            Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!(
                    "recovery claimed {len} bytes at {offset}, expected {expected}"
                ))
                .with_offset(offset as u64))
        }
        None => Err(Error::new(ErrorKind::Corrupt)
            .with_message(format!("recovery could not claim {len} bytes"))
            .with_offset(expected as u64)),
    }
}
