//! # Circular Buffer
//!
//! A fixed-capacity single-producer/single-consumer ring of payload items,
//! shared between the packet feeder and the pacing task. Each item holds up
//! to a configured number of TS packets together with the time at which the
//! consumer should send them.
//!
//! Both sides block by polling rather than by waiting on a notification:
//! the consumer has to multiplex buffer reads with command input and socket
//! readiness, and short sleeps compose with that where a blocking wait
//! would not.

mod ring;

pub use ring::{ring, RingConsumer, RingProducer, Slot, PARENT_GIVE_UP_AFTER};

#[cfg(test)]
mod tests;
