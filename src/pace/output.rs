use super::rate::{PacketMeta, RateControl};
use crate::buffer::RingProducer;
use crate::config::PacingConfig;
use crate::error::Result;
use crate::TS_PACKET_SIZE;
use std::time::Duration;
use tracing::trace;

/// The producer side of the buffered pipeline: accumulates TS packets into
/// the open circular buffer item, stamps each item with its send time on
/// close, and commits it to the consumer.
pub struct BufferedOutput {
    producer: RingProducer,
    rate: RateControl,
    packets: Vec<PacketMeta>,
    packets_per_item: usize,
    pcr_scale: f64,
    parent_wait: Duration,
    started: bool,
    pending_discontinuity: bool,
}

impl BufferedOutput {
    /// Wraps the producer half of a ring in accumulation and timing state.
    pub fn new(producer: RingProducer, config: &PacingConfig) -> Self {
        Self {
            producer,
            rate: RateControl::new(config),
            packets: Vec::with_capacity(config.packets_per_item),
            packets_per_item: config.packets_per_item,
            pcr_scale: config.pcr_scale,
            parent_wait: config.parent_wait,
            started: false,
            pending_discontinuity: false,
        }
    }

    /// Appends one TS packet to the open item, opening a new one if
    /// necessary (which may block while the ring is full). `index` is the
    /// packet's sequence number in the input stream; `pcr` its Program
    /// Clock Reference, if it carried one.
    pub async fn write(
        &mut self,
        packet: &[u8; TS_PACKET_SIZE],
        index: u64,
        pid: u16,
        pcr: Option<u64>,
    ) -> Result<()> {
        if !self.started {
            self.producer.wait_if_full(self.parent_wait).await?;
            self.started = true;
            // A fresh item must never inherit packet metadata, or stale
            // entries could masquerade as PCRs.
            self.packets.clear();
            self.producer.write_slot().begin();
        }

        self.producer.write_slot().push_packet(packet);

        let pcr = pcr.map(|value| (value as f64 * self.pcr_scale) as u64);
        self.packets.push(PacketMeta { index, pid, pcr });

        if self.packets.len() == self.packets_per_item {
            self.flush_item();
        }
        Ok(())
    }

    /// The next committed item starts a new timeline: the consumer
    /// re-anchors its clock and the rate controller re-primes.
    pub fn mark_discontinuity(&mut self) {
        self.pending_discontinuity = true;
        self.rate.invalidate();
    }

    /// Flushes any partial item and commits the end-of-stream sentinel.
    /// The sentinel gets a timestamp like any other item, although the
    /// consumer exits on it without sending.
    pub async fn write_eof(&mut self) -> Result<()> {
        if self.started && !self.producer.write_slot().is_empty() {
            self.flush_item();
        }
        self.producer.wait_if_full(self.parent_wait).await?;
        let time = self.rate.assign(&[], 0);
        let slot = self.producer.write_slot();
        slot.begin();
        slot.mark_eof();
        slot.set_time(time);
        self.producer.commit();
        trace!("committed end-of-stream sentinel");
        Ok(())
    }

    fn flush_item(&mut self) {
        let num_bytes = self.packets.len() * TS_PACKET_SIZE;
        let time = self.rate.assign(&self.packets, num_bytes);
        let slot = self.producer.write_slot();
        slot.set_time(time);
        slot.set_discontinuity(self.pending_discontinuity);
        self.pending_discontinuity = false;
        self.producer.commit();
        self.started = false;
        self.packets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ring;
    use crate::config::PacingConfig;

    fn packet_with_tag(tag: u8) -> [u8; TS_PACKET_SIZE] {
        let mut packet = [0u8; TS_PACKET_SIZE];
        packet[0] = 0x47;
        packet[1] = tag;
        packet
    }

    #[tokio::test]
    async fn test_items_close_when_full() {
        let config = PacingConfig::default()
            .with_buffer_size(4)
            .with_packets_per_item(2)
            .with_use_pcrs(false)
            .with_byterate(1_000_000);
        let (producer, mut consumer) = ring(config.circ_buf_size, config.packets_per_item);
        let mut output = BufferedOutput::new(producer, &config);

        for i in 0..5u8 {
            output
                .write(&packet_with_tag(i), i as u64, 0x100, None)
                .await
                .unwrap();
        }
        // Five packets at two per item: two full items committed, one
        // packet still open.
        assert_eq!(consumer.committed(), 2);
        {
            let slot = consumer.read_slot();
            assert_eq!(slot.len(), 2 * TS_PACKET_SIZE);
            assert_eq!(slot.payload()[1], 0);
            assert_eq!(slot.payload()[TS_PACKET_SIZE + 1], 1);
        }
        consumer.release();

        output.write_eof().await.unwrap();
        // The partial item was flushed ahead of the sentinel.
        assert_eq!(consumer.committed(), 3);
        consumer.release();
        {
            let slot = consumer.read_slot();
            assert_eq!(slot.len(), TS_PACKET_SIZE);
            assert_eq!(slot.payload()[1], 4);
        }
        consumer.release();
        assert!(consumer.read_slot().is_eof());
    }

    #[tokio::test]
    async fn test_timestamps_are_monotone() {
        let config = PacingConfig::default()
            .with_buffer_size(20)
            .with_use_pcrs(false)
            .with_byterate(500_000);
        let (producer, mut consumer) = ring(config.circ_buf_size, config.packets_per_item);
        let mut output = BufferedOutput::new(producer, &config);

        for i in 0..70u64 {
            output
                .write(&packet_with_tag(i as u8), i, 0x100, None)
                .await
                .unwrap();
        }
        let mut last = 0;
        while !consumer.is_empty() {
            let t = consumer.read_slot().time_us();
            assert!(t >= last);
            last = t;
            consumer.release();
        }
        assert!(last > 0);
    }

    /// Feeds three single-packet items, the first two carrying PCRs one
    /// second of ticks apart, and returns the gap between the second and
    /// third item's timestamps.
    async fn locked_gap_with_scale(pcr_scale: f64) -> u64 {
        let config = PacingConfig::default()
            .with_buffer_size(8)
            .with_packets_per_item(1)
            .with_pcr_scale(pcr_scale);
        let (producer, mut consumer) = ring(config.circ_buf_size, config.packets_per_item);
        let mut output = BufferedOutput::new(producer, &config);

        output
            .write(&packet_with_tag(0), 0, 0x100, Some(27_000_000))
            .await
            .unwrap();
        output
            .write(&packet_with_tag(1), 1, 0x100, Some(54_000_000))
            .await
            .unwrap();
        output
            .write(&packet_with_tag(2), 2, 0x100, None)
            .await
            .unwrap();

        consumer.release();
        let t1 = consumer.read_slot().time_us();
        consumer.release();
        let t2 = consumer.read_slot().time_us();
        t2 - t1
    }

    #[tokio::test]
    async fn test_pcr_scale_stretches_the_timeline() {
        // Scaling every PCR by two doubles the tick distance between
        // them, halving the inferred byte rate; once the second PCR has
        // re-primed the pool, inter-item gaps double.
        let base = locked_gap_with_scale(1.0).await;
        let scaled = locked_gap_with_scale(2.0).await;
        let ratio = scaled as f64 / base as f64;
        assert!((ratio - 2.0).abs() < 0.01, "ratio {ratio}");
    }

    #[tokio::test]
    async fn test_discontinuity_flag_rides_next_item() {
        let config = PacingConfig::default()
            .with_buffer_size(4)
            .with_packets_per_item(1)
            .with_use_pcrs(false);
        let (producer, mut consumer) = ring(config.circ_buf_size, config.packets_per_item);
        let mut output = BufferedOutput::new(producer, &config);

        output
            .write(&packet_with_tag(0), 0, 0x100, None)
            .await
            .unwrap();
        output.mark_discontinuity();
        output
            .write(&packet_with_tag(1), 1, 0x100, None)
            .await
            .unwrap();
        output
            .write(&packet_with_tag(2), 2, 0x100, None)
            .await
            .unwrap();

        assert!(!consumer.read_slot().discontinuity());
        consumer.release();
        assert!(consumer.read_slot().discontinuity());
        consumer.release();
        assert!(!consumer.read_slot().discontinuity());
    }
}
