//! End-to-end scenarios over a real reliable-connected queue pair.
//!
//! Both endpoints run in one process against the loopback of the first
//! usable RDMA device (a soft-RoCE or soft-iWARP device is enough). On
//! hosts without any device every test skips.

use portpicker::pick_unused_port;
use rdma_ring::{MessageRing, MessageRingBuilder, RdmaContext, RingError};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// One endpoint plus the control socket that established it.
struct Endpoint {
    ring: MessageRing,
    _stream: TcpStream,
}

/// Wire up two rings of `buffer_size` bytes over a loopback TCP pair.
/// Returns `None` (skipping the test) when the host has no usable device.
fn ring_pair(buffer_size: usize) -> Option<(Endpoint, Endpoint)> {
    if RdmaContext::open(None, 1).is_err() {
        eprintln!("skipping: no usable RDMA device on this host");
        return None;
    }

    let port = pick_unused_port().expect("no free TCP port");
    let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
    let listener = TcpListener::bind(addr).expect("bind loopback");

    let accept_side = thread::spawn(move || {
        let (stream, _peer) = listener.accept().expect("accept");
        let ring = MessageRingBuilder::default()
            .set_buffer_size(buffer_size)
            .establish(stream.as_raw_fd())
            .expect("establish (accept side)");
        Endpoint {
            ring,
            _stream: stream,
        }
    });

    let stream = TcpStream::connect(addr).expect("connect");
    let ring = MessageRingBuilder::default()
        .set_buffer_size(buffer_size)
        .establish(stream.as_raw_fd())
        .expect("establish (connect side)");
    let connect_side = Endpoint {
        ring,
        _stream: stream,
    };

    Some((accept_side.join().expect("accept side"), connect_side))
}

#[test]
fn hello_round_trip() {
    let (server, client) = match ring_pair(4096) {
        Some(pair) => pair,
        None => return,
    };

    client.ring.send(b"hello").unwrap();
    let mut buf = [0_u8; 16];
    let n = server.ring.receive(&mut buf).unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf[..5], &[0x68, 0x65, 0x6c, 0x6c, 0x6f]);
}

#[test]
fn inline_sized_message_of_zero_bytes() {
    let (server, client) = match ring_pair(4096) {
        Some(pair) => pair,
        None => return,
    };

    // 200 payload bytes stay under the inline threshold; the payload being
    // all zeros also proves arrival is signaled by the footer, not by the
    // content.
    client.ring.send(&[0_u8; 200]).unwrap();
    let mut buf = [0xFF_u8; 256];
    let n = server.ring.receive(&mut buf).unwrap();
    assert_eq!(n, 200);
    assert!(buf[..200].iter().all(|&b| b == 0));
}

#[test]
fn wrap_and_padding_in_a_tiny_ring() {
    let (server, client) = match ring_pair(64) {
        Some(pair) => pair,
        None => return,
    };

    let payloads = [[0xAA_u8; 20], [0xBB_u8; 20], [0xCC_u8; 20]];
    let sender = thread::spawn(move || {
        for payload in &payloads {
            client.ring.send(payload).unwrap();
        }
        client
    });

    for expected in &payloads {
        let mut buf = [0_u8; 32];
        let n = server.ring.receive(&mut buf).unwrap();
        assert_eq!(&buf[..n], expected);
    }
    let _client = sender.join().unwrap();
}

#[test]
fn order_and_contents_across_many_messages() {
    let (server, client) = match ring_pair(4096) {
        Some(pair) => pair,
        None => return,
    };

    let messages: Vec<Vec<u8>> = (0_u32..200)
        .map(|i| {
            let len = 1 + (i as usize * 37) % 700;
            (0..len).map(|j| (i as usize + j) as u8).collect()
        })
        .collect();

    let to_send = messages.clone();
    let sender = thread::spawn(move || {
        for msg in &to_send {
            client.ring.send(msg).unwrap();
        }
        client
    });

    let mut buf = vec![0_u8; 1024];
    for expected in &messages {
        let n = server.ring.receive(&mut buf).unwrap();
        assert_eq!(&buf[..n], expected.as_slice());
    }
    let _client = sender.join().unwrap();
}

#[test]
fn blocked_send_completes_after_a_receive() {
    let (server, client) = match ring_pair(1024) {
        Some(pair) => pair,
        None => return,
    };

    let (filled_tx, filled_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();
    let sender = thread::spawn(move || {
        // Two 500 byte payloads fill the 1024 byte ring exactly.
        client.ring.send(&[1_u8; 500]).unwrap();
        client.ring.send(&[2_u8; 500]).unwrap();
        filled_tx.send(()).unwrap();
        // The third cannot fit until the peer consumes.
        client.ring.send(&[3_u8; 500]).unwrap();
        done_tx.send(()).unwrap();
        client
    });

    filled_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("the first two sends must not block");
    assert!(
        done_rx.recv_timeout(Duration::from_millis(300)).is_err(),
        "the third send must block while the ring is full"
    );

    let mut buf = [0_u8; 512];
    let n = server.ring.receive(&mut buf).unwrap();
    assert_eq!(n, 500);
    assert!(buf[..n].iter().all(|&b| b == 1));

    done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("the blocked send must complete after a receive");
    let _client = sender.join().unwrap();

    for expected in [2_u8, 3_u8] {
        let n = server.ring.receive(&mut buf).unwrap();
        assert_eq!(n, 500);
        assert!(buf[..n].iter().all(|&b| b == expected));
    }
}

#[test]
fn small_destination_leaves_the_message_in_place() {
    let (server, client) = match ring_pair(4096) {
        Some(pair) => pair,
        None => return,
    };

    client.ring.send(&[7_u8; 10]).unwrap();

    let mut small = [0_u8; 4];
    match server.ring.receive(&mut small) {
        Err(RingError::BufferTooSmall { needed, capacity }) => {
            assert_eq!(needed, 10);
            assert_eq!(capacity, 4);
        }
        other => panic!("expected BufferTooSmall, got {:?}", other.map(|_n| ())),
    }

    // The failed receive consumed nothing.
    let mut big = [0_u8; 16];
    let n = server.ring.receive(&mut big).unwrap();
    assert_eq!(n, 10);
    assert!(big[..n].iter().all(|&b| b == 7));
}

#[test]
fn has_data_reflects_readiness() {
    let (server, client) = match ring_pair(4096) {
        Some(pair) => pair,
        None => return,
    };

    assert!(!server.ring.has_data());

    client.ring.send(b"ping").unwrap();
    // The write completes asynchronously; readiness must become visible.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !server.ring.has_data() {
        assert!(
            std::time::Instant::now() < deadline,
            "message never became visible"
        );
        thread::yield_now();
    }

    let mut buf = [0_u8; 8];
    let n = server.ring.receive(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");
    assert!(!server.ring.has_data());
}

#[test]
fn zero_length_messages_are_rejected() {
    let (server, client) = match ring_pair(4096) {
        Some(pair) => pair,
        None => return,
    };

    assert!(matches!(
        client.ring.send(&[]),
        Err(RingError::ProtocolError(_))
    ));
    drop(server);
}

#[test]
fn explicit_cursor_flush() {
    let (server, client) = match ring_pair(4096) {
        Some(pair) => pair,
        None => return,
    };

    client.ring.send(b"one").unwrap();
    let mut buf = [0_u8; 8];
    let _n = server.ring.receive(&mut buf).unwrap();
    // Push the cursor right away instead of waiting for the threshold.
    server.ring.flush_read_position().unwrap();
}

#[test]
#[ignore = "needs fault injection to force the peer's queue pair into the error state"]
fn send_fails_after_the_peer_is_gone() {
    let (server, client) = match ring_pair(4096) {
        Some(pair) => pair,
        None => return,
    };

    drop(server);
    // The peer's teardown moved its queue pair to the error state. Retries
    // take transport timeouts, so keep sending until the error completion
    // surfaces as ConnectionLost.
    loop {
        match client.ring.send(b"are you there") {
            Ok(()) => thread::sleep(Duration::from_millis(100)),
            Err(RingError::ConnectionLost) => break,
            Err(other) => panic!("expected ConnectionLost, got {}", other),
        }
    }
    // Once broken, the ring stays broken.
    assert!(matches!(
        client.ring.send(b"still there?"),
        Err(RingError::ConnectionLost)
    ));
}
