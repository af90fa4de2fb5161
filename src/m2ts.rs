//! # M2TS Front-End
//!
//! BDAV M2TS streams carry 192-byte packets: a 4-byte big-endian arrival
//! timestamp followed by an ordinary 188-byte TS packet. Packets can sit
//! slightly out of order relative to their timestamps, so before the TS
//! payload is fed onwards it is passed through a small reordering window.
//!
//! ```rust
//! use tspump::m2ts::M2tsReorderer;
//!
//! let mut reorder = M2tsReorderer::new();
//! let mut record = [0u8; 192];
//! record[3] = 1;     // timestamp 1
//! record[4] = 0x47;  // TS sync byte
//! assert!(reorder.push(&record).is_none()); // still buffering
//! ```

use crate::error::{PumpError, Result};
use crate::TS_PACKET_SIZE;
use bytes::Bytes;
use std::collections::VecDeque;

/// Size of one M2TS record: timestamp plus TS packet.
pub const M2TS_PACKET_SIZE: usize = 192;

/// How many records the reordering window holds by default.
pub const DEFAULT_REORDER_WINDOW: usize = 4;

#[derive(Debug)]
struct Record {
    timestamp: u32,
    payload: Bytes,
}

/// A fixed window that emits TS packets in ascending timestamp order.
///
/// Records are inserted in time order; ties keep their arrival order.
/// Once the window is full, each push evicts the oldest record, whose TS
/// payload is returned for onward writing.
#[derive(Debug)]
pub struct M2tsReorderer {
    window: VecDeque<Record>,
    capacity: usize,
}

impl Default for M2tsReorderer {
    fn default() -> Self {
        Self::new()
    }
}

impl M2tsReorderer {
    /// A reorderer with the default window size.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REORDER_WINDOW)
    }

    /// A reorderer holding up to `capacity` records. A capacity of one
    /// does no reordering at all, just a one-record delay.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity >= 1, "reorder window needs at least one record");
        Self {
            window: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Accepts one 192-byte record. Returns the TS payload of the oldest
    /// record once the window is full, `None` while it is still filling.
    pub fn push(&mut self, record: &[u8; M2TS_PACKET_SIZE]) -> Option<Bytes> {
        let emitted = if self.window.len() == self.capacity {
            self.window.pop_front().map(|r| r.payload)
        } else {
            None
        };

        let timestamp = u32::from_be_bytes([record[0], record[1], record[2], record[3]]);
        let payload = Bytes::copy_from_slice(&record[4..4 + TS_PACKET_SIZE]);

        // Walk back from the newest end: later arrivals with an equal
        // timestamp stay behind earlier ones.
        let mut position = self.window.len();
        while position > 0 && self.window[position - 1].timestamp > timestamp {
            position -= 1;
        }
        self.window.insert(position, Record { timestamp, payload });

        emitted
    }

    /// Accepts a raw byte run of whole records.
    ///
    /// Returns the TS payloads released along the way. A trailing partial
    /// record is an error, reported after the complete records have been
    /// consumed.
    pub fn push_stream(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        let mut released = Vec::new();
        for chunk in data.chunks(M2TS_PACKET_SIZE) {
            let record: &[u8; M2TS_PACKET_SIZE] = chunk.try_into().map_err(|_| {
                PumpError::InvalidData(format!(
                    "trailing M2TS record truncated to {} bytes",
                    chunk.len()
                ))
            })?;
            released.extend(self.push(record));
        }
        Ok(released)
    }

    /// Drains the window in timestamp order at end of input.
    pub fn finish(&mut self) -> Vec<Bytes> {
        self.window.drain(..).map(|r| r.payload).collect()
    }

    /// Records currently buffered.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}
