use crate::error::{PumpError, Result};
use crate::{TS_PACKET_SIZE, TS_SYNC_BYTE};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::trace;

/// How many times the producer polls a full ring before concluding that
/// the consumer has died.
pub const PARENT_GIVE_UP_AFTER: u32 = 1000;

/// First payload byte of the end-of-stream sentinel. A real TS packet
/// always starts with [`TS_SYNC_BYTE`], so a single `0x01` byte is
/// unambiguous.
const EOF_BYTE: u8 = 0x01;

/// One circular buffer item: a payload of whole TS packets plus the
/// metadata the consumer needs to send it at the right moment.
#[derive(Debug)]
pub struct Slot {
    length: usize,
    time_us: u64,
    discontinuity: bool,
    data: Box<[u8]>,
}

impl Slot {
    fn new(item_size: usize) -> Self {
        Self {
            length: 0,
            time_us: 0,
            discontinuity: false,
            data: vec![0u8; item_size].into_boxed_slice(),
        }
    }

    /// Resets the slot for a fresh item.
    pub fn begin(&mut self) {
        self.length = 0;
        self.time_us = 0;
        self.discontinuity = false;
    }

    /// Appends one TS packet to the payload.
    ///
    /// Panics if the slot has no room for another packet; the producer
    /// flushes an item as soon as it is full, so this cannot happen in the
    /// write path.
    pub fn push_packet(&mut self, packet: &[u8; TS_PACKET_SIZE]) {
        let end = self.length + TS_PACKET_SIZE;
        self.data[self.length..end].copy_from_slice(packet);
        self.length = end;
    }

    /// Turns the slot into the end-of-stream sentinel.
    pub fn mark_eof(&mut self) {
        self.data[0] = EOF_BYTE;
        self.length = 1;
        self.discontinuity = false;
    }

    /// True if this slot is the end-of-stream sentinel.
    pub fn is_eof(&self) -> bool {
        self.length == 1 && self.data[0] == EOF_BYTE
    }

    /// Bytes currently held by the slot.
    pub fn len(&self) -> usize {
        self.length
    }

    /// True if no packets have been appended yet.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The payload accumulated so far.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.length]
    }

    /// Target send time in microseconds on the producer's timeline.
    pub fn time_us(&self) -> u64 {
        self.time_us
    }

    /// Sets the target send time.
    pub fn set_time(&mut self, time_us: u64) {
        self.time_us = time_us;
    }

    /// True if the producer's timeline restarted with this item.
    pub fn discontinuity(&self) -> bool {
        self.discontinuity
    }

    /// Flags this item as the start of a new timeline.
    pub fn set_discontinuity(&mut self, discontinuity: bool) {
        self.discontinuity = discontinuity;
    }
}

/// The shared ring. `start` is advanced only by the consumer, `end` only
/// by the producer; each side publishes its index with a release store and
/// observes the other's with an acquire load, which is all the
/// synchronization the slot contents need.
struct RingBuffer {
    slots: Box<[UnsafeCell<Slot>]>,
    size: usize,
    start: CachePadded<AtomicUsize>,
    end: CachePadded<AtomicUsize>,
}

// Slot access is partitioned by the start/end protocol: the producer only
// touches the slot after `end`, the consumer only the slots between
// `start` and `end`, and index publication orders those accesses.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    fn is_empty(&self) -> bool {
        let start = self.start.load(Ordering::Acquire);
        let end = self.end.load(Ordering::Acquire);
        start == (end + 1) % self.size
    }

    fn is_full(&self) -> bool {
        let start = self.start.load(Ordering::Acquire);
        let end = self.end.load(Ordering::Acquire);
        (end + 2) % self.size == start
    }

    fn committed(&self) -> usize {
        let start = self.start.load(Ordering::Acquire);
        let end = self.end.load(Ordering::Acquire);
        (end + 1 + self.size - start) % self.size
    }
}

/// Creates a ring with `circ_buf_size` usable items (one extra slot is
/// allocated so that full and empty are distinguishable), each holding up
/// to `packets_per_item` TS packets. Returns the producer and consumer
/// halves; each half must stay on its own side.
pub fn ring(circ_buf_size: usize, packets_per_item: usize) -> (RingProducer, RingConsumer) {
    assert!(circ_buf_size >= 1, "ring needs at least one item");
    assert!(packets_per_item >= 1, "items need room for at least one packet");
    let size = circ_buf_size + 1;
    let item_size = packets_per_item * TS_PACKET_SIZE;
    let slots = (0..size)
        .map(|_| UnsafeCell::new(Slot::new(item_size)))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let ring = Arc::new(RingBuffer {
        slots,
        size,
        start: CachePadded::new(AtomicUsize::new(1)),
        end: CachePadded::new(AtomicUsize::new(0)),
    });
    (
        RingProducer { ring: Arc::clone(&ring) },
        RingConsumer { ring },
    )
}

/// The producer half of the ring. Owns the slot after `end`: fill it via
/// [`RingProducer::write_slot`], then publish it with
/// [`RingProducer::commit`].
pub struct RingProducer {
    ring: Arc<RingBuffer>,
}

impl RingProducer {
    /// True when no further item can be committed until the consumer
    /// catches up.
    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    /// Polls until the ring has room, sleeping `poll` between checks.
    ///
    /// Gives up after [`PARENT_GIVE_UP_AFTER`] polls: a consumer that has
    /// not freed a single slot in that long is assumed to have died, and
    /// feeding it further would block forever.
    pub async fn wait_if_full(&self, poll: Duration) -> Result<()> {
        let mut count: u32 = 0;
        while self.ring.is_full() {
            count += 1;
            if count > PARENT_GIVE_UP_AFTER {
                return Err(PumpError::Buffer(
                    "giving up waiting for a full buffer to drain (consumer not responding)"
                        .into(),
                ));
            }
            trace!("buffer full, producer waiting");
            sleep(poll).await;
        }
        Ok(())
    }

    /// The slot currently open for writing. The caller must not hold the
    /// reference across `commit`, which the borrow checker enforces.
    ///
    /// Panics if the ring is full; call [`RingProducer::wait_if_full`]
    /// before opening an item.
    pub fn write_slot(&mut self) -> &mut Slot {
        assert!(!self.ring.is_full(), "write_slot on a full ring");
        let end = self.ring.end.load(Ordering::Relaxed);
        let which = (end + 1) % self.ring.size;
        // The slot after `end` is invisible to the consumer until commit.
        unsafe { &mut *self.ring.slots[which].get() }
    }

    /// Publishes the open slot to the consumer.
    pub fn commit(&mut self) {
        let end = self.ring.end.load(Ordering::Relaxed);
        let which = (end + 1) % self.ring.size;
        self.ring.end.store(which, Ordering::Release);
    }
}

/// The consumer half of the ring. Reads the slot at `start` via
/// [`RingConsumer::read_slot`], then relinquishes it with
/// [`RingConsumer::release`].
pub struct RingConsumer {
    ring: Arc<RingBuffer>,
}

impl RingConsumer {
    /// True when no committed item is waiting.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Number of committed, unread items.
    pub fn committed(&self) -> usize {
        self.ring.committed()
    }

    /// Polls until an item is available, sleeping `poll` between checks.
    ///
    /// Never gives up: the producer may legitimately pause for an
    /// arbitrarily long time (a paused stream, a slow upstream), and the
    /// end of data always arrives in-band as the sentinel item.
    pub async fn wait_if_empty(&self, poll: Duration) {
        while self.ring.is_empty() {
            trace!("buffer empty, consumer waiting");
            sleep(poll).await;
        }
    }

    /// Polls until the ring has filled to capacity, so the pipeline warms
    /// up before any data goes out. Also returns once the end-of-stream
    /// sentinel has been committed: a stream shorter than the ring will
    /// never fill it.
    pub async fn wait_until_full(&self, poll: Duration) {
        while !self.ring.is_full() && !self.eof_committed() {
            trace!("waiting for buffer to fill");
            sleep(poll).await;
        }
    }

    /// True if the most recently committed item is the sentinel.
    fn eof_committed(&self) -> bool {
        if self.ring.is_empty() {
            return false;
        }
        let end = self.ring.end.load(Ordering::Acquire);
        let slot = unsafe { &*self.ring.slots[end].get() };
        slot.is_eof()
    }

    /// The oldest committed item.
    ///
    /// Panics if the ring is empty; call [`RingConsumer::wait_if_empty`]
    /// first.
    pub fn read_slot(&self) -> &Slot {
        assert!(!self.ring.is_empty(), "read_slot on an empty ring");
        let start = self.ring.start.load(Ordering::Relaxed);
        unsafe { &*self.ring.slots[start].get() }
    }

    /// Relinquishes the oldest committed item back to the producer.
    pub fn release(&mut self) {
        let start = self.ring.start.load(Ordering::Relaxed);
        self.ring.start.store((start + 1) % self.ring.size, Ordering::Release);
    }
}

// Keep the sync byte constant in this module honest: the sentinel must
// never collide with real payload.
const _: () = assert!(EOF_BYTE != TS_SYNC_BYTE);
