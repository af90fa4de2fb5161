use crate::buffer::RingConsumer;
use crate::config::{PacingConfig, PerturbConfig};
use crate::error::Result;
use crate::TS_SYNC_BYTE;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};

/// Falling more than this far behind the producer's timeline makes the
/// consumer re-anchor instead of trying to catch up with a flood of
/// back-to-back sends.
const RESET_THRESHOLD_US: i64 = 200_000;

/// The pacing decision for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacePlan {
    /// Re-anchor the wall clock to "now" before sending.
    pub anchor: bool,
    /// Microseconds to sleep before sending.
    pub wait_us: u64,
}

/// Consumer-side pacing state: where our timeline is anchored relative to
/// the producer's, and how many items have gone out without any gap.
#[derive(Debug)]
pub struct PacerState {
    reset: bool,
    delta_start: i64,
    last_packet_time: u64,
    sent_without_delay: u32,
    items: u64,
    maxnowait: Option<u32>,
    waitfor_us: u32,
    perturbed: bool,
}

impl PacerState {
    /// Fresh state; the first item always re-anchors.
    pub fn new(config: &PacingConfig) -> Self {
        Self {
            reset: true,
            delta_start: 0,
            last_packet_time: 0,
            sent_without_delay: 0,
            items: 0,
            maxnowait: config.maxnowait,
            waitfor_us: config.waitfor_us,
            perturbed: config.perturb.is_some(),
        }
    }

    /// Decides how long to wait before sending an item stamped `time_us`,
    /// given that `elapsed_us` have passed on our own clock since the last
    /// anchor (including any test perturbation).
    pub fn plan(&mut self, time_us: u64, elapsed_us: i64, discontinuity: bool) -> PacePlan {
        self.items += 1;
        let gap = time_us.wrapping_sub(self.last_packet_time);

        let mut anchor = false;
        let mut waitfor: i64;
        if self.reset || discontinuity {
            // Our timeline has gone askew (or never started): make "now"
            // the base time and send this item right away.
            anchor = true;
            self.delta_start = time_us as i64;
            waitfor = 0;
            self.reset = false;
            debug!(time_us, gap, delta = self.delta_start, "anchoring timeline");
        } else {
            let adjusted_now = elapsed_us + self.delta_start;
            waitfor = time_us as i64 - adjusted_now;
            trace!(time_us, gap, elapsed_us, adjusted_now, waitfor, "pacing");
            if waitfor > 0 {
                // On time; sleep up to the target.
            } else if waitfor > -RESET_THRESHOLD_US {
                // A little late; not worth any fuss.
                waitfor = 0;
            } else if !self.perturbed {
                warn!(
                    item = self.items,
                    late_us = -waitfor,
                    "outputting late, restarting time sequence"
                );
                self.reset = true;
                waitfor = 0;
            }
            // When time is being deliberately perturbed, lateness is the
            // point of the exercise; leave the value negative so the item
            // goes straight out without touching the burst counter.
        }

        if waitfor == 0 {
            if let Some(max) = self.maxnowait {
                if self.sent_without_delay < max {
                    self.sent_without_delay += 1;
                } else {
                    // Too many items back-to-back would swamp the
                    // receiving hardware; impose a minimal gap. The send
                    // after that gap starts the next run.
                    waitfor = self.waitfor_us as i64;
                    self.sent_without_delay = 1;
                }
            }
        } else if waitfor > 0 {
            self.sent_without_delay = 0;
        }

        PacePlan {
            anchor,
            wait_us: waitfor.max(0) as u64,
        }
    }

    /// Records that the item stamped `time_us` has been sent.
    pub fn note_sent(&mut self, time_us: u64) {
        self.last_packet_time = time_us;
    }
}

struct Perturb {
    rng: StdRng,
    range_ms: i64,
    verbose: bool,
}

impl Perturb {
    fn new(config: &PerturbConfig) -> Self {
        debug!(seed = config.seed, range_ms = config.range_ms, "perturbing consumer time");
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            range_ms: config.range_ms as i64,
            verbose: config.verbose,
        }
    }

    /// A delta in microseconds, uniform over the range on either side of
    /// zero.
    fn delta_us(&mut self) -> i64 {
        let ms = self.rng.gen_range(-self.range_ms..=self.range_ms);
        if self.verbose {
            debug!(ms, "perturbing time");
        }
        ms * 1000
    }
}

/// The consumer: drains the ring at the pace the item timestamps ask for
/// and pushes each payload out of the UDP socket. Runs until it meets the
/// end-of-stream sentinel.
///
/// Waits for the ring to fill before the first send so that the pipeline
/// has some slack behind it from the start.
pub async fn run_pacer(
    mut consumer: RingConsumer,
    socket: UdpSocket,
    config: PacingConfig,
) -> Result<()> {
    let mut state = PacerState::new(&config);
    let mut perturb = config.perturb.as_ref().map(Perturb::new);
    let mut start_wall = Instant::now();
    let mut starting = true;

    info!("buffer filling before first send");
    loop {
        if starting {
            consumer.wait_until_full(config.child_wait).await;
            starting = false;
            info!("buffer primed, starting to send");
        } else {
            consumer.wait_if_empty(config.child_wait).await;
        }

        if consumer.read_slot().is_eof() {
            trace!("found end-of-stream sentinel");
            consumer.release();
            return Ok(());
        }
        let (time_us, discontinuity) = {
            let slot = consumer.read_slot();
            (slot.time_us(), slot.discontinuity())
        };

        let mut elapsed_us = start_wall.elapsed().as_micros() as i64;
        if let Some(perturb) = perturb.as_mut() {
            elapsed_us += perturb.delta_us();
        }

        let plan = state.plan(time_us, elapsed_us, discontinuity);
        if plan.anchor {
            start_wall = Instant::now();
        }
        if plan.wait_us > 0 {
            sleep(Duration::from_micros(plan.wait_us)).await;
        }

        {
            let slot = consumer.read_slot();
            let payload = slot.payload();
            if payload.first() != Some(&TS_SYNC_BYTE) {
                // A payload that does not start with the sync byte means
                // something has gone badly wrong upstream; dropping it is
                // safer than emitting garbage.
                warn!(len = payload.len(), "dropping item without TS sync byte");
            } else if let Err(error) = socket.send(payload).await {
                // A failed UDP send is not worth killing the pipeline
                // over; drop the item and let the producer keep feeding.
                warn!(%error, "UDP send failed, dropping item");
            }
        }
        consumer.release();
        state.note_sent(time_us);
    }
}
