use crate::config::PacingConfig;
use crate::TS_PACKET_SIZE;
use tracing::debug;

/// What the producer remembers about one accumulated TS packet: its index
/// in the input stream, its PID, and the PCR it carried, if any (already
/// scaled).
#[derive(Debug, Clone, Copy)]
pub struct PacketMeta {
    /// Sequence number of the packet since the start of output.
    pub index: u64,
    /// The packet's PID.
    pub pid: u16,
    /// PCR in 27 MHz ticks, when the packet carried one.
    pub pcr: Option<u64>,
}

/// Assigns the target send time for each circular buffer item.
///
/// In PCR mode the controller keeps a pool of bytes and microseconds "in
/// hand", seeded from a guessed rate and thereafter topped up from the
/// byte/tick distance between successive PCRs; each item's cost is drawn
/// from the pool. Spreading the pool over several items smooths out the
/// rate jitter between adjacent PCRs. In plain mode the configured byte
/// rate is applied directly.
#[derive(Debug)]
pub enum RateControl {
    /// Timing derived from PCRs found in the stream.
    Pcr(PcrRate),
    /// Timing derived from the configured byte rate alone.
    Plain(PlainRate),
}

impl RateControl {
    /// Builds the controller selected by the configuration.
    pub fn new(config: &PacingConfig) -> Self {
        if config.use_pcrs {
            RateControl::Pcr(PcrRate::new(config))
        } else {
            RateControl::Plain(PlainRate::new(config))
        }
    }

    /// Stamps the item described by `packets` (holding `num_bytes` of
    /// payload) and returns its target send time in microseconds.
    pub fn assign(&mut self, packets: &[PacketMeta], num_bytes: usize) -> u64 {
        match self {
            RateControl::Pcr(rate) => rate.assign(packets, num_bytes),
            RateControl::Plain(rate) => rate.assign(num_bytes),
        }
    }

    /// Forgets everything learned from the stream so far, so the next item
    /// re-primes from scratch. Used when the producer signals that the
    /// timeline has changed radically.
    pub fn invalidate(&mut self) {
        if let RateControl::Pcr(rate) = self {
            rate.invalidate();
        }
    }
}

/// PCR-locked timing state. Every field here persists across items; none
/// of it is shared with the consumer.
#[derive(Debug)]
pub struct PcrRate {
    item_size: usize,
    prime_size: u32,
    prime_speedup: u32,
    seed_rate: f64,

    available_bytes: i64,
    available_time: f64,
    pcr_rate: f64,
    last_pcr: u64,
    last_pcr_index: u64,
    had_first_pcr: bool,
    had_second_pcr: bool,
    last_timestamp: u64,
    last_timestamp_near_pcr: u64,
    initial_prime_time: f64,
    initial_prime_bytes: i64,
}

impl PcrRate {
    fn new(config: &PacingConfig) -> Self {
        Self {
            item_size: config.item_size(),
            prime_size: config.prime_size,
            prime_speedup: config.prime_speedup,
            seed_rate: config.byterate as f64,
            available_bytes: 0,
            available_time: 0.0,
            pcr_rate: 0.0,
            last_pcr: 0,
            last_pcr_index: 0,
            had_first_pcr: false,
            had_second_pcr: false,
            last_timestamp: 0,
            last_timestamp_near_pcr: 0,
            initial_prime_time: 0.0,
            initial_prime_bytes: 0,
        }
    }

    fn invalidate(&mut self) {
        self.had_first_pcr = false;
        self.had_second_pcr = false;
        self.available_bytes = 0;
        self.available_time = 0.0;
    }

    fn assign(&mut self, packets: &[PacketMeta], num_bytes: usize) -> u64 {
        // A silly rate just means we haven't started yet.
        if self.pcr_rate < 1.0 {
            self.pcr_rate = self.seed_rate;
        }

        // The pool starts at zero to trigger priming; thereafter it only
        // runs dry if the stream goes a long way without a PCR.
        if self.available_bytes <= 0 || self.available_time <= 0.0 {
            self.available_bytes = (self.item_size * self.prime_size as usize) as i64;
            self.available_time = self.available_bytes as f64 * 1_000_000.0
                / (self.pcr_rate * self.prime_speedup as f64 / 100.0);
            debug!(
                bytes = self.available_bytes,
                time_us = self.available_time,
                rate = self.pcr_rate,
                speedup = self.prime_speedup,
                "priming timing pool"
            );
            if !self.had_second_pcr {
                self.initial_prime_time = self.available_time;
                self.initial_prime_bytes = self.available_bytes;
            }
        }

        // More than one PCR inside a single item should be rare; the first
        // one wins and the pool absorbs any difference.
        let found_pcr = packets.iter().find(|p| p.pcr.is_some());

        // Charge this item against the prevailing conditions.
        let num_us = num_bytes as f64 / self.available_bytes as f64 * self.available_time;
        let timestamp = self.last_timestamp + num_us as u64;
        self.available_bytes -= num_bytes as i64;
        self.available_time -= num_us;

        if let Some(meta) = found_pcr {
            let pcr = meta.pcr.expect("found_pcr only matches packets with a PCR");
            if pcr < self.last_pcr {
                // The PCRs jumped backwards, quite likely a loop back to
                // the start of the file. Previous PCRs are useless as a
                // basis for calculation, and since we no longer know what
                // "time" it is, the next item must re-prime.
                debug!(pcr, last_pcr = self.last_pcr, "PCR discontinuity");
                self.had_first_pcr = false;
                self.had_second_pcr = false;
                self.available_bytes = 0;
                self.available_time = 0.0;
            } else if !self.had_first_pcr {
                // Nothing to compare against yet; just remember it.
                self.had_first_pcr = true;
                debug!(index = meta.index, pcr, "first PCR");
            } else {
                let delta_pcr = pcr - self.last_pcr;
                let delta_bytes = ((meta.index - self.last_pcr_index) * TS_PACKET_SIZE as u64) as i64;
                self.pcr_rate = delta_bytes as f64 * 27.0 / delta_pcr as f64 * 1_000_000.0;
                let extra_time = delta_bytes as f64 * 1_000_000.0 / self.pcr_rate;
                self.available_bytes += delta_bytes;
                self.available_time += extra_time;
                debug!(
                    index = meta.index,
                    pcr,
                    rate = self.pcr_rate,
                    add_bytes = delta_bytes,
                    add_time_us = extra_time,
                    since_last_pcr_us = timestamp - self.last_timestamp_near_pcr,
                    "PCR rate update"
                );
                if !self.had_second_pcr {
                    // The initial priming was based on a guessed rate; now
                    // that a real rate is known, swap the guess out of the
                    // pool for time computed at that rate.
                    self.available_time -= self.initial_prime_time;
                    self.available_time +=
                        self.initial_prime_bytes as f64 * 1_000_000.0 / self.pcr_rate;
                    self.had_second_pcr = true;
                    debug!(
                        bytes = self.available_bytes,
                        time_us = self.available_time,
                        rate = self.pcr_rate,
                        "re-primed timing pool from stream rate"
                    );
                }
            }
            self.last_timestamp_near_pcr = timestamp;
            self.last_pcr = pcr;
            self.last_pcr_index = meta.index;
        }

        self.last_timestamp = timestamp;
        timestamp
    }
}

/// Plain byte-rate timing: each item advances the clock by exactly its
/// size at the configured rate.
#[derive(Debug)]
pub struct PlainRate {
    byterate: u32,
    last_timestamp: u64,
}

impl PlainRate {
    fn new(config: &PacingConfig) -> Self {
        Self {
            byterate: config.byterate,
            last_timestamp: 0,
        }
    }

    fn assign(&mut self, num_bytes: usize) -> u64 {
        let elapsed = (num_bytes as f64 * 1_000_000.0 / self.byterate as f64) as u64;
        self.last_timestamp += elapsed;
        self.last_timestamp
    }
}
