use super::*;
use crate::TS_PACKET_SIZE;
use std::time::Duration;

fn test_packet(tag: u8) -> [u8; TS_PACKET_SIZE] {
    let mut packet = [0u8; TS_PACKET_SIZE];
    packet[0] = 0x47;
    packet[1] = tag;
    packet
}

#[test]
fn test_new_ring_is_empty() {
    let (producer, consumer) = ring(4, 7);
    assert!(!producer.is_full());
    assert!(consumer.is_empty());
    assert_eq!(consumer.committed(), 0);
}

#[test]
fn test_fill_to_capacity() {
    let (mut producer, consumer) = ring(3, 1);
    for tag in 0..3 {
        assert!(!producer.is_full());
        let slot = producer.write_slot();
        slot.begin();
        slot.push_packet(&test_packet(tag));
        producer.commit();
    }
    assert!(producer.is_full());
    assert!(!consumer.is_empty());
    assert_eq!(consumer.committed(), 3);
}

#[test]
fn test_full_and_empty_never_coincide() {
    let (mut producer, mut consumer) = ring(2, 1);
    for _ in 0..10 {
        assert!(!(producer.is_full() && consumer.is_empty()));
        let slot = producer.write_slot();
        slot.begin();
        slot.push_packet(&test_packet(0));
        producer.commit();
        assert!(!(producer.is_full() && consumer.is_empty()));
        consumer.release();
    }
}

#[test]
fn test_slot_round_trip() {
    let (mut producer, mut consumer) = ring(2, 2);
    let slot = producer.write_slot();
    slot.begin();
    slot.push_packet(&test_packet(1));
    slot.push_packet(&test_packet(2));
    slot.set_time(12345);
    slot.set_discontinuity(true);
    producer.commit();

    let read = consumer.read_slot();
    assert_eq!(read.len(), 2 * TS_PACKET_SIZE);
    assert_eq!(read.time_us(), 12345);
    assert!(read.discontinuity());
    assert_eq!(read.payload()[1], 1);
    assert_eq!(read.payload()[TS_PACKET_SIZE + 1], 2);
    assert!(!read.is_eof());
    consumer.release();
    assert!(consumer.is_empty());
}

#[test]
fn test_eof_sentinel() {
    let (mut producer, consumer) = ring(2, 1);
    let slot = producer.write_slot();
    slot.begin();
    slot.mark_eof();
    producer.commit();
    assert!(consumer.read_slot().is_eof());
}

#[tokio::test]
async fn test_fifo_order_across_tasks() {
    let (mut producer, mut consumer) = ring(4, 1);
    let feeder = tokio::spawn(async move {
        for tag in 0..100u8 {
            producer
                .wait_if_full(Duration::from_millis(1))
                .await
                .unwrap();
            let slot = producer.write_slot();
            slot.begin();
            slot.push_packet(&test_packet(tag));
            slot.set_time(tag as u64);
            producer.commit();
        }
        producer.wait_if_full(Duration::from_millis(1)).await.unwrap();
        let slot = producer.write_slot();
        slot.begin();
        slot.mark_eof();
        producer.commit();
    });

    let mut seen = Vec::new();
    loop {
        consumer.wait_if_empty(Duration::from_millis(1)).await;
        {
            let slot = consumer.read_slot();
            if slot.is_eof() {
                break;
            }
            seen.push(slot.payload()[1]);
        }
        consumer.release();
    }
    consumer.release();

    feeder.await.unwrap();
    assert_eq!(seen, (0..100u8).collect::<Vec<_>>());
    assert!(consumer.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_producer_gives_up_when_consumer_stalls() {
    let (mut producer, _consumer) = ring(1, 1);
    let slot = producer.write_slot();
    slot.begin();
    slot.push_packet(&test_packet(0));
    producer.commit();
    assert!(producer.is_full());

    let err = producer
        .wait_if_full(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, crate::PumpError::Buffer(_)));
}

#[tokio::test(start_paused = true)]
async fn test_wait_until_full_returns_on_eof() {
    let (mut producer, consumer) = ring(10, 1);
    let slot = producer.write_slot();
    slot.begin();
    slot.push_packet(&test_packet(0));
    producer.commit();
    let slot = producer.write_slot();
    slot.begin();
    slot.mark_eof();
    producer.commit();

    // Two items in a ten-item ring: the ring will never fill, but the
    // sentinel is already committed, so the warm-up wait must end.
    consumer.wait_until_full(Duration::from_millis(10)).await;
    assert_eq!(consumer.committed(), 2);
}
