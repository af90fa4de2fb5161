use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::{timeout, Instant};
use tspump::{Command, CommandInput, PacingConfig, TsWriter, TS_PACKET_SIZE};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

fn test_packet(tag: u8) -> [u8; TS_PACKET_SIZE] {
    let mut packet = [0u8; TS_PACKET_SIZE];
    packet[0] = 0x47;
    packet[1] = tag;
    packet
}

async fn recv_datagrams(receiver: &UdpSocket, count: usize) -> Vec<(Vec<u8>, Instant)> {
    let mut datagrams = Vec::new();
    let mut buf = vec![0u8; 2048];
    for _ in 0..count {
        let n = timeout(Duration::from_secs(30), receiver.recv(&mut buf))
            .await
            .expect("timed out waiting for datagram")
            .expect("recv failed");
        datagrams.push((buf[..n].to_vec(), Instant::now()));
    }
    datagrams
}

#[tokio::test]
async fn test_buffered_udp_preserves_order_and_framing() {
    init_tracing();
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = receiver.local_addr().unwrap().port();

    let mut writer = TsWriter::open_udp("127.0.0.1", port, None).await.unwrap();
    let config = PacingConfig::default()
        .with_buffer_size(5)
        .with_use_pcrs(false)
        .with_byterate(1_000_000)
        .with_parent_wait(Duration::from_millis(1))
        .with_child_wait(Duration::from_millis(1));
    writer.start_buffering(&config).unwrap();

    for i in 0..70u8 {
        writer.write(&test_packet(i), 0x100, None).await.unwrap();
    }
    assert_eq!(writer.packets_written(), 70);

    let drain = tokio::spawn(async move { recv_datagrams(&receiver, 10).await });
    writer.close().await.unwrap();
    let datagrams = drain.await.unwrap();

    // Ten items of seven packets, in exactly the order they were fed,
    // every packet led by the sync byte.
    let mut expected_tag = 0u8;
    for (payload, _) in &datagrams {
        assert_eq!(payload.len(), 7 * TS_PACKET_SIZE);
        for packet in payload.chunks(TS_PACKET_SIZE) {
            assert_eq!(packet[0], 0x47);
            assert_eq!(packet[1], expected_tag);
            expected_tag += 1;
        }
    }
    assert_eq!(expected_tag, 70);
}

#[tokio::test]
async fn test_plain_pacing_tracks_the_byte_rate() {
    init_tracing();
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = receiver.local_addr().unwrap().port();

    let mut writer = TsWriter::open_udp("127.0.0.1", port, None).await.unwrap();
    // 1316-byte items at 26,320 B/s: one item every 50 ms, ten items in
    // roughly 450 ms from first send to last.
    let config = PacingConfig::default()
        .with_buffer_size(5)
        .with_use_pcrs(false)
        .with_byterate(26_320)
        .with_parent_wait(Duration::from_millis(2))
        .with_child_wait(Duration::from_millis(2));
    writer.start_buffering(&config).unwrap();

    let drain = tokio::spawn(async move { recv_datagrams(&receiver, 10).await });
    for i in 0..70u8 {
        writer.write(&test_packet(i), 0x100, None).await.unwrap();
    }
    writer.close().await.unwrap();
    let datagrams = drain.await.unwrap();

    let elapsed = datagrams.last().unwrap().1 - datagrams.first().unwrap().1;
    assert!(
        elapsed >= Duration::from_millis(300),
        "ten items arrived in {elapsed:?}, faster than the configured rate allows"
    );
    assert!(
        elapsed <= Duration::from_millis(1500),
        "ten items took {elapsed:?}, far slower than the configured rate"
    );
}

#[tokio::test]
async fn test_close_with_no_packets_terminates() {
    init_tracing();
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = receiver.local_addr().unwrap().port();

    let mut writer = TsWriter::open_udp("127.0.0.1", port, None).await.unwrap();
    let config = PacingConfig::default()
        .with_buffer_size(50)
        .with_child_wait(Duration::from_millis(1));
    writer.start_buffering(&config).unwrap();

    // Nothing was ever written: the ring can never fill, so only the
    // in-band sentinel lets the pacer exit.
    timeout(Duration::from_secs(10), writer.close())
        .await
        .expect("close did not terminate")
        .unwrap();
}

#[tokio::test]
async fn test_pcr_paced_stream_end_to_end() {
    init_tracing();
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = receiver.local_addr().unwrap().port();

    let mut writer = TsWriter::open_udp("127.0.0.1", port, None).await.unwrap();
    let config = PacingConfig::default()
        .with_buffer_size(5)
        .with_parent_wait(Duration::from_millis(1))
        .with_child_wait(Duration::from_millis(1));
    writer.start_buffering(&config).unwrap();

    let drain = tokio::spawn(async move { recv_datagrams(&receiver, 10).await });

    // PCRs consistent with 2 MB/s: the engine locks on and the stream
    // still arrives complete and in order.
    let mut pcr = 1_000_000u64;
    for i in 0..70u64 {
        let carries_pcr = i % 21 == 0;
        if carries_pcr {
            pcr += 21 * TS_PACKET_SIZE as u64 * 27_000_000 / 2_000_000;
        }
        writer
            .write(
                &test_packet(i as u8),
                0x100,
                carries_pcr.then_some(pcr),
            )
            .await
            .unwrap();
    }
    writer.close().await.unwrap();

    let datagrams = drain.await.unwrap();
    let mut expected_tag = 0u8;
    for (payload, _) in &datagrams {
        for packet in payload.chunks(TS_PACKET_SIZE) {
            assert_eq!(packet[1], expected_tag);
            expected_tag += 1;
        }
    }
    assert_eq!(expected_tag, 70);
}

#[tokio::test]
async fn test_tcp_commands_steer_the_writer() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = tokio::spawn(async move {
        let (mut peer, _) = listener.accept().await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        peer.write_all(b"]").await.unwrap();
        // Drain whatever the writer sends while we steer it.
        let mut buf = vec![0u8; 4096];
        let mut sent_quit = false;
        loop {
            match peer.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) if !sent_quit => {
                    peer.write_all(b"q").await.unwrap();
                    sent_quit = true;
                }
                Ok(_) => {}
            }
        }
    });

    let mut writer = TsWriter::open_connection(true, "127.0.0.1", port)
        .await
        .unwrap();
    writer.start_input(CommandInput::OutputSocket).unwrap();
    assert_eq!(writer.command(), Command::Pause);

    // Write until the skip command arrives.
    let packet = test_packet(0);
    let mut writes = 0;
    while !writer.command_changed() {
        writer.write(&packet, 0x100, None).await.unwrap();
        writes += 1;
        assert!(writes < 5000, "skip command never surfaced");
    }
    assert_eq!(writer.command(), Command::SkipForwardLots);
    writer.acknowledge_command();

    // Execute the skip "atomically": the quit that arrives in the
    // meantime is held back until the skip has finished.
    writer.set_command_atomic(true);
    let mut writes = 0;
    while writer.command() != Command::Quit {
        writer.write(&packet, 0x100, None).await.unwrap();
        writes += 1;
        assert!(writes < 5000, "quit command never arrived");
    }
    assert!(
        !writer.command_changed(),
        "atomic command must hide the change"
    );
    writer.set_command_atomic(false);
    assert!(writer.command_changed());
    assert_eq!(writer.command(), Command::Quit);
    writer.acknowledge_command();

    writer.close().await.unwrap();
    client.await.unwrap();
}

#[tokio::test]
async fn test_file_output_with_packet_drop() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("degraded.ts");

    let mut writer = TsWriter::open_file(Some(&path)).await.unwrap();
    writer.set_packet_drop(2, 3);
    for i in 0..10u8 {
        writer.write(&test_packet(i), 0x100, None).await.unwrap();
    }
    assert_eq!(writer.packets_written(), 4);
    writer.close().await.unwrap();

    let data = std::fs::read(&path).unwrap();
    assert_eq!(data.len(), 4 * TS_PACKET_SIZE);
    let tags: Vec<u8> = data.chunks(TS_PACKET_SIZE).map(|p| p[1]).collect();
    // Keep two, drop three: packets 0, 1, 5, 6 survive.
    assert_eq!(tags, vec![0, 1, 5, 6]);
    for packet in data.chunks(TS_PACKET_SIZE) {
        assert_eq!(packet[0], 0x47);
    }
}
