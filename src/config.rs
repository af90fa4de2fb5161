//! # Pacing Configuration
//!
//! Tuning knobs for the buffered, paced output engine. Every value that the
//! engine consults at runtime lives in [`PacingConfig`]; the engine holds no
//! process-wide state, so two writers with different configurations can run
//! in the same process.
//!
//! ```rust
//! use tspump::PacingConfig;
//!
//! let config = PacingConfig::default()
//!     .with_bitrate(3_000_000)
//!     .with_maxnowait(Some(10));
//! assert!(config.validate().is_ok());
//! ```

use crate::error::{PumpError, Result};
use crate::{MAX_PACKETS_PER_ITEM, TS_PACKET_SIZE};
use std::time::Duration;

/// The default number of circular buffer items to allow for when priming
/// the output timer.
pub const DEFAULT_PRIME_SIZE: u32 = 10;

/// Initial guess at the output data rate, in bytes per second, used until
/// the stream's own PCRs have been observed.
pub const DEFAULT_BYTE_RATE: u32 = 250_000;

/// Default number of circular buffer slots (one more is allocated).
pub const DEFAULT_CIRC_BUF_SIZE: usize = 100;

/// Seeded jitter applied to the consumer's idea of time, for testing how
/// the pacing loop copes with an unreliable network.
#[derive(Debug, Clone)]
pub struct PerturbConfig {
    /// Seed for the random number generator.
    pub seed: u64,
    /// Maximum perturbation in milliseconds, applied on either side of zero.
    pub range_ms: u32,
    /// Report each perturbation as it is applied.
    pub verbose: bool,
}

/// Tuning for the circular buffer and the PCR-locked pacing engine.
///
/// The defaults match what the engine was tuned for: 7 TS packets per
/// network packet (one ethernet frame), a 100-item buffer, at most 30
/// packets sent back-to-back before a 1 ms gap is imposed, and PCR-driven
/// timing seeded with a 250 kB/s guess.
#[derive(Debug, Clone)]
pub struct PacingConfig {
    /// Number of usable circular buffer items (the ring allocates one more).
    pub circ_buf_size: usize,
    /// TS packets per buffer item, and therefore per network packet. At
    /// most [`MAX_PACKETS_PER_ITEM`]; more would fragment on ethernet.
    pub packets_per_item: usize,
    /// Maximum number of items sent with no gap between them, or `None`
    /// for no limit. Sending too many packets back-to-back can overrun the
    /// receiving hardware's buffers.
    pub maxnowait: Option<u32>,
    /// Microseconds to wait after `maxnowait` items have gone out with no
    /// gap.
    pub waitfor_us: u32,
    /// Initial output rate in bytes per second.
    pub byterate: u32,
    /// Take timing from PCRs found in the stream (the normal case). When
    /// false, `byterate` is used directly for every item.
    pub use_pcrs: bool,
    /// How many items' worth of data to prime the timing pool with. Larger
    /// values smooth out the rate indicated by adjacent PCRs.
    pub prime_size: u32,
    /// Percentage of normal speed to use for the priming rate; 100 means
    /// no effect.
    pub prime_speedup: u32,
    /// Multiply every PCR by this factor before use.
    pub pcr_scale: f64,
    /// How long the producer sleeps between checks when the ring is full.
    pub parent_wait: Duration,
    /// How long the consumer sleeps between checks when the ring is empty.
    pub child_wait: Duration,
    /// Optional seeded jitter on the consumer clock (testing only).
    pub perturb: Option<PerturbConfig>,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            circ_buf_size: DEFAULT_CIRC_BUF_SIZE,
            packets_per_item: MAX_PACKETS_PER_ITEM,
            maxnowait: Some(30),
            waitfor_us: 1000,
            byterate: DEFAULT_BYTE_RATE,
            use_pcrs: true,
            prime_size: DEFAULT_PRIME_SIZE,
            prime_speedup: 100,
            pcr_scale: 1.0,
            parent_wait: Duration::from_millis(50),
            child_wait: Duration::from_millis(10),
            perturb: None,
        }
    }
}

impl PacingConfig {
    /// Creates a configuration with the default tuning.
    pub fn new() -> Self {
        Self::default()
    }

    /// A preset suitable for HD streams: 20 Mbps, a higher burst allowance
    /// and much shorter buffer polls.
    pub fn hd() -> Self {
        Self {
            maxnowait: Some(40),
            parent_wait: Duration::from_millis(4),
            child_wait: Duration::from_millis(1),
            ..Self::default()
        }
        .with_bitrate(20_000_000)
    }

    /// Sets the initial output rate in bytes per second.
    pub fn with_byterate(mut self, byterate: u32) -> Self {
        self.byterate = byterate;
        self
    }

    /// Sets the initial output rate in bits per second. The rate is stored
    /// internally as bytes per second, so values that are not a multiple of
    /// eight are approximated.
    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.byterate = bitrate / 8;
        self
    }

    /// Sets the number of usable circular buffer items.
    pub fn with_buffer_size(mut self, circ_buf_size: usize) -> Self {
        self.circ_buf_size = circ_buf_size;
        self
    }

    /// Sets how many TS packets go into each buffer item.
    pub fn with_packets_per_item(mut self, packets_per_item: usize) -> Self {
        self.packets_per_item = packets_per_item;
        self
    }

    /// Sets the back-to-back send limit; `None` disables the limit.
    pub fn with_maxnowait(mut self, maxnowait: Option<u32>) -> Self {
        self.maxnowait = maxnowait;
        self
    }

    /// Sets the imposed gap, in microseconds, after a full burst.
    pub fn with_waitfor_us(mut self, waitfor_us: u32) -> Self {
        self.waitfor_us = waitfor_us;
        self
    }

    /// Selects between PCR-driven timing and plain byte-rate timing.
    pub fn with_use_pcrs(mut self, use_pcrs: bool) -> Self {
        self.use_pcrs = use_pcrs;
        self
    }

    /// Sets how many items' worth of data prime the timing pool.
    pub fn with_prime_size(mut self, prime_size: u32) -> Self {
        self.prime_size = prime_size;
        self
    }

    /// Sets the priming rate as a percentage of normal speed.
    pub fn with_prime_speedup(mut self, prime_speedup: u32) -> Self {
        self.prime_speedup = prime_speedup;
        self
    }

    /// Sets the PCR inflation factor.
    pub fn with_pcr_scale(mut self, pcr_scale: f64) -> Self {
        self.pcr_scale = pcr_scale;
        self
    }

    /// Sets the producer's ring-full poll interval.
    pub fn with_parent_wait(mut self, parent_wait: Duration) -> Self {
        self.parent_wait = parent_wait;
        self
    }

    /// Sets the consumer's ring-empty poll interval.
    pub fn with_child_wait(mut self, child_wait: Duration) -> Self {
        self.child_wait = child_wait;
        self
    }

    /// Enables seeded jitter on the consumer clock.
    pub fn with_perturb(mut self, perturb: PerturbConfig) -> Self {
        self.perturb = Some(perturb);
        self
    }

    /// Bytes of payload held by one circular buffer item.
    pub fn item_size(&self) -> usize {
        self.packets_per_item * TS_PACKET_SIZE
    }

    /// Rejects configurations that cannot work: empty buffers, zero prime,
    /// oversized items, out-of-range poll intervals.
    pub fn validate(&self) -> Result<()> {
        if self.circ_buf_size < 1 {
            return Err(PumpError::Config(
                "a circular buffer of 0 items does not make sense".into(),
            ));
        }
        if self.packets_per_item < 1 {
            return Err(PumpError::Config(
                "0 TS packets per item does not make sense".into(),
            ));
        }
        if self.packets_per_item > MAX_PACKETS_PER_ITEM {
            return Err(PumpError::Config(format!(
                "{} TS packets per item is too many (maximum is {})",
                self.packets_per_item, MAX_PACKETS_PER_ITEM
            )));
        }
        if self.byterate == 0 {
            return Err(PumpError::Config("a byte rate of 0 does not make sense".into()));
        }
        if self.prime_size < 1 {
            return Err(PumpError::Config("a prime size of 0 does not make sense".into()));
        }
        if self.prime_speedup < 1 {
            return Err(PumpError::Config(
                "a prime speedup of 0 does not make sense".into(),
            ));
        }
        for (name, wait) in [("parent", self.parent_wait), ("child", self.child_wait)] {
            let ms = wait.as_millis();
            if ms == 0 {
                return Err(PumpError::Config(format!(
                    "a {name} wait of 0 does not make sense"
                )));
            }
            if ms > 999 {
                return Err(PumpError::Config(format!(
                    "a {name} wait of {ms}ms (more than 999) is not allowed"
                )));
            }
        }
        if let Some(perturb) = &self.perturb {
            if perturb.range_ms == 0 {
                return Err(PumpError::Config(
                    "a perturbation range of 0 does not make sense".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PacingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.item_size(), 7 * 188);
        assert_eq!(config.byterate, 250_000);
        assert_eq!(config.maxnowait, Some(30));
    }

    #[test]
    fn test_hd_preset() {
        let config = PacingConfig::hd();
        assert!(config.validate().is_ok());
        assert_eq!(config.byterate, 2_500_000);
        assert_eq!(config.maxnowait, Some(40));
        assert_eq!(config.parent_wait, Duration::from_millis(4));
        assert_eq!(config.child_wait, Duration::from_millis(1));
    }

    #[test]
    fn test_bitrate_is_stored_as_bytes() {
        let config = PacingConfig::default().with_bitrate(3000);
        assert_eq!(config.byterate, 375);
    }

    #[test]
    fn test_rejects_nonsense() {
        assert!(PacingConfig::default().with_buffer_size(0).validate().is_err());
        assert!(PacingConfig::default().with_prime_size(0).validate().is_err());
        assert!(PacingConfig::default().with_prime_speedup(0).validate().is_err());
        assert!(PacingConfig::default()
            .with_packets_per_item(8)
            .validate()
            .is_err());
        assert!(PacingConfig::default()
            .with_parent_wait(Duration::from_millis(1000))
            .validate()
            .is_err());
        assert!(PacingConfig::default()
            .with_child_wait(Duration::ZERO)
            .validate()
            .is_err());
        let bad_perturb = PacingConfig::default().with_perturb(PerturbConfig {
            seed: 1,
            range_ms: 0,
            verbose: false,
        });
        assert!(bad_perturb.validate().is_err());
    }
}
