//! Integration tests for the UDP telemetry transaction protocol.
//!
//! These tests run both peers against real loopback sockets. Servers bind
//! port 0 so the OS hands out ephemeral ports and parallel test runs never
//! collide on the well-known port.

use std::thread;
use std::time::{Duration, Instant};

use groundtrack::telemetry::{
    PACKET_SIZE, START_SIGNAL, STOP_SIGNAL, TelemetryPacket, wall_clock_seconds,
};
use groundtrack::udp::{TransportError, UdpTelemetryClient, UdpTelemetryServer};

/// Bind a server on an ephemeral port and report the port.
fn ephemeral_server() -> (UdpTelemetryServer, u16) {
    let server = UdpTelemetryServer::bind_to(0).expect("failed to bind ephemeral server");
    let port = server
        .local_addr()
        .expect("failed to query server address")
        .port();
    (server, port)
}

/// Spawn a companion-style echo peer that stamps and returns `count` packets.
fn spawn_echo_peer(server: UdpTelemetryServer, count: usize) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buffer = [0u8; 2 * PACKET_SIZE];
        for _ in 0..count {
            let (received, peer) = server.read(&mut buffer).expect("echo peer receive failed");
            assert_eq!(received, PACKET_SIZE, "echo peer saw a malformed packet");
            let mut bytes = [0u8; PACKET_SIZE];
            bytes.copy_from_slice(&buffer[..PACKET_SIZE]);
            let mut packet = TelemetryPacket::from_bytes(&bytes);
            packet.stamp_recv_time();
            server
                .send_to(&packet.to_bytes(), peer)
                .expect("echo peer send failed");
        }
    })
}

#[test]
fn test_transaction_round_trip() {
    let (server, port) = ephemeral_server();
    let peer = spawn_echo_peer(server, 1);

    let client = UdpTelemetryClient::connect("127.0.0.1", port).expect("client construction");
    client
        .set_timeout(Some(Duration::from_secs(2)))
        .expect("set_timeout");

    let before = wall_clock_seconds();
    let reply = client
        .transaction(TelemetryPacket::new(1.25, -0.75))
        .expect("transaction failed against a responsive peer");
    let after = wall_clock_seconds();

    // Encoder rates survive the round trip unchanged
    assert_eq!(reply.left_encoder_rate, 1.25);
    assert_eq!(reply.right_encoder_rate, -0.75);
    // The send stamp is the client's clock at transmission
    assert!(reply.controller_send_time >= before);
    assert!(reply.controller_send_time <= after);
    // Same host, same clock: the receive stamp cannot precede the send stamp
    assert!(reply.companion_recv_time >= reply.controller_send_time);
    assert!(reply.one_way_latency() >= 0.0);
    assert!(reply.one_way_latency() < 2.0);

    peer.join().unwrap();
}

#[test]
fn test_repeated_transactions_carry_fresh_stamps() {
    let (server, port) = ephemeral_server();
    let peer = spawn_echo_peer(server, 20);

    let client = UdpTelemetryClient::connect("127.0.0.1", port).expect("client construction");
    client
        .set_timeout(Some(Duration::from_secs(2)))
        .expect("set_timeout");

    let mut previous_send = 0.0;
    for cycle in 0..20 {
        let rate = cycle as f64 * 0.1;
        let reply = client
            .transaction(TelemetryPacket::new(rate, -rate))
            .expect("transaction failed");
        assert_eq!(reply.left_encoder_rate, rate);
        assert_eq!(reply.right_encoder_rate, -rate);
        // Each transaction stamps its own send time
        assert!(reply.controller_send_time >= previous_send);
        previous_send = reply.controller_send_time;
    }

    peer.join().unwrap();
}

#[test]
fn test_transaction_times_out_within_bound() {
    // A bound socket that is never serviced: the echo never comes
    let (server, port) = ephemeral_server();

    let client = UdpTelemetryClient::connect("127.0.0.1", port).expect("client construction");
    client
        .set_timeout(Some(Duration::from_millis(200)))
        .expect("set_timeout");

    let start = Instant::now();
    let result = client.transaction(TelemetryPacket::new(0.5, 0.5));
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(TransportError::Timeout)));
    // Bounded by the configured timeout plus scheduling slack, never forever
    assert!(elapsed >= Duration::from_millis(100), "returned too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "timeout not honored: {:?}", elapsed);

    drop(server);
}

#[test]
fn test_undersized_reply_is_rejected() {
    let (server, port) = ephemeral_server();
    let peer = thread::spawn(move || {
        let mut buffer = [0u8; 2 * PACKET_SIZE];
        let (_, sender) = server.read(&mut buffer).expect("receive failed");
        // Truncated reply: half a record
        server
            .send_to(&buffer[..PACKET_SIZE / 2], sender)
            .expect("send failed");
    });

    let client = UdpTelemetryClient::connect("127.0.0.1", port).expect("client construction");
    client
        .set_timeout(Some(Duration::from_secs(2)))
        .expect("set_timeout");

    match client.transaction(TelemetryPacket::new(1.0, 2.0)) {
        Err(TransportError::SizeMismatch { expected, received }) => {
            assert_eq!(expected, PACKET_SIZE);
            assert_eq!(received, PACKET_SIZE / 2);
        }
        other => panic!("expected a size mismatch, got {:?}", other),
    }

    peer.join().unwrap();
}

#[test]
fn test_oversized_reply_is_rejected() {
    let (server, port) = ephemeral_server();
    let peer = thread::spawn(move || {
        let mut buffer = [0u8; 2 * PACKET_SIZE];
        let (_, sender) = server.read(&mut buffer).expect("receive failed");
        let oversized = [0xAAu8; PACKET_SIZE + 16];
        server.send_to(&oversized, sender).expect("send failed");
    });

    let client = UdpTelemetryClient::connect("127.0.0.1", port).expect("client construction");
    client
        .set_timeout(Some(Duration::from_secs(2)))
        .expect("set_timeout");

    match client.transaction(TelemetryPacket::new(1.0, 2.0)) {
        Err(TransportError::SizeMismatch { expected, received }) => {
            assert_eq!(expected, PACKET_SIZE);
            assert_eq!(received, PACKET_SIZE + 16);
        }
        other => panic!("expected a size mismatch, got {:?}", other),
    }

    peer.join().unwrap();
}

#[test]
fn test_control_signal_exchange() {
    let (server, port) = ephemeral_server();
    let peer = thread::spawn(move || {
        // The server learns the client's address from its first datagram
        let mut buffer = [0u8; 8];
        let (received, sender) = server.read(&mut buffer).expect("receive failed");
        assert_eq!(received, 1);
        assert_eq!(buffer[0], START_SIGNAL);
        server.send_to(&[STOP_SIGNAL], sender).expect("send failed");
    });

    let client = UdpTelemetryClient::connect("127.0.0.1", port).expect("client construction");
    client
        .set_timeout(Some(Duration::from_secs(2)))
        .expect("set_timeout");

    client.send(&[START_SIGNAL]).expect("signal send failed");
    // Raw read returns the actual byte count, not the buffer size
    let mut buffer = [0u8; 8];
    let received = client.read(&mut buffer).expect("signal read failed");
    assert_eq!(received, 1);
    assert_eq!(buffer[0], STOP_SIGNAL);

    peer.join().unwrap();
}
