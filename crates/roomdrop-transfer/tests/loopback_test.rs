//! Integration tests: real listeners and senders over loopback.
//!
//! Each test builds an engine with shrunk timeouts and a private temp
//! directory, opens room listeners on ephemeral ports, and drives transfers
//! end-to-end, asserting on the lifecycle event feed and the upload dir.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

use roomdrop_transfer::engine::{EngineConfig, TransferEngine};
use roomdrop_transfer::error::TransferError;
use roomdrop_transfer::framing::write_message;
use roomdrop_transfer::protocol::{CHUNK_SIZE, InitData, UDP_CHUNK_SIZE, WireMessage};
use roomdrop_transfer::sender::{send_file_tcp, send_file_udp};
use roomdrop_types::events::TransferEvent;
use roomdrop_types::models::{Protocol, TransferStatus};

fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("roomdrop_test_{}_{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn patterned(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (i % 251) as u8; // prime modulus for good distribution
    }
    data
}

fn test_engine(dir: &PathBuf) -> TransferEngine {
    TransferEngine::new(EngineConfig {
        upload_dir: dir.join("uploads"),
        transfer_timeout: Duration::from_secs(10),
        idle_timeout: Duration::from_secs(5),
        completed_grace: Duration::from_secs(10),
        ..EngineConfig::default()
    })
}

async fn next_matching<F>(
    rx: &mut broadcast::Receiver<TransferEvent>,
    mut pred: F,
) -> TransferEvent
where
    F: FnMut(&TransferEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event bus closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn tcp_transfer_round_trips() {
    let dir = test_dir("tcp_roundtrip");
    let engine = test_engine(&dir);
    let mut events = engine.subscribe();

    // 200_000 bytes = 3 full chunks + 3392 trailing bytes
    let data = patterned(200_000);
    let input = dir.join("input.bin");
    fs::write(&input, &data).unwrap();

    let port = engine.open_listener("A1B2C3D4", Protocol::Tcp, 0).await.unwrap();
    let target: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

    let report = send_file_tcp(&input, target).await.unwrap();
    assert_eq!(report.chunks_sent, 4);
    assert_eq!(report.file_size, 200_000);

    let event = next_matching(&mut events, |e| matches!(e, TransferEvent::Complete { .. })).await;
    match event {
        TransferEvent::Complete {
            transfer_id,
            room_id,
            file_size,
            ..
        } => {
            assert_eq!(transfer_id, report.transfer_id);
            assert_eq!(room_id, "A1B2C3D4");
            assert_eq!(file_size, 200_000);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let uploaded = fs::read(dir.join("uploads").join("input.bin")).unwrap();
    assert_eq!(uploaded, data);

    engine.shutdown_all().await;
}

#[tokio::test]
async fn tcp_progress_events_are_emitted() {
    let dir = test_dir("tcp_progress");
    let engine = test_engine(&dir);
    let mut events = engine.subscribe();

    let data = patterned(CHUNK_SIZE * 2);
    let input = dir.join("two_chunks.bin");
    fs::write(&input, &data).unwrap();

    let port = engine.open_listener("ROOMPROG", Protocol::Tcp, 0).await.unwrap();
    let target: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    send_file_tcp(&input, target).await.unwrap();

    let halfway =
        next_matching(&mut events, |e| matches!(e, TransferEvent::Progress { .. })).await;
    match halfway {
        TransferEvent::Progress {
            percent,
            transferred,
            total,
            ..
        } => {
            assert_eq!(percent, 50);
            assert_eq!(transferred, 1);
            assert_eq!(total, 2);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    next_matching(&mut events, |e| matches!(e, TransferEvent::Complete { .. })).await;
    engine.shutdown_all().await;
}

#[tokio::test]
async fn udp_transfer_round_trips() {
    let dir = test_dir("udp_roundtrip");
    let engine = test_engine(&dir);
    let mut events = engine.subscribe();

    let data = patterned(UDP_CHUNK_SIZE * 3 + 17);
    let input = dir.join("input.bin");
    fs::write(&input, &data).unwrap();

    let port = engine.open_listener("E5F6A7B8", Protocol::Udp, 0).await.unwrap();
    let target: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

    let report = send_file_udp(&input, target).await.unwrap();
    assert_eq!(report.chunks_sent, 4);

    next_matching(&mut events, |e| matches!(e, TransferEvent::Complete { .. })).await;

    let uploaded = fs::read(dir.join("uploads").join("input.bin")).unwrap();
    assert_eq!(uploaded, data);

    engine.shutdown_all().await;
}

#[tokio::test]
async fn udp_reverse_order_still_reconstructs() {
    let dir = test_dir("udp_reverse");
    let engine = test_engine(&dir);
    let mut events = engine.subscribe();

    let data = patterned(UDP_CHUNK_SIZE * 2 + 512);
    let chunks: Vec<&[u8]> = data.chunks(UDP_CHUNK_SIZE).collect();

    let port = engine.open_listener("C9D0E1F2", Protocol::Udp, 0).await.unwrap();
    let target: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let init = WireMessage::Init {
        data: InitData {
            transfer_id: "ignored-by-receiver".into(),
            filename: "reversed.bin".into(),
            file_size: data.len() as u64,
            total: chunks.len() as u32,
        },
        checksum: None,
    };
    socket
        .send_to(&serde_json::to_vec(&init).unwrap(), target)
        .await
        .unwrap();

    // deliver chunks back to front
    for (index, chunk) in chunks.iter().enumerate().rev() {
        let msg = WireMessage::Chunk {
            index: index as u32,
            data: bytes::Bytes::copy_from_slice(chunk),
        };
        socket
            .send_to(&serde_json::to_vec(&msg).unwrap(), target)
            .await
            .unwrap();
    }

    let complete = WireMessage::Complete {
        checksum: hex::encode(Sha256::digest(&data)),
    };
    socket
        .send_to(&serde_json::to_vec(&complete).unwrap(), target)
        .await
        .unwrap();

    next_matching(&mut events, |e| matches!(e, TransferEvent::Complete { .. })).await;

    let uploaded = fs::read(dir.join("uploads").join("reversed.bin")).unwrap();
    assert_eq!(uploaded, data);

    engine.shutdown_all().await;
}

#[tokio::test]
async fn udp_complete_before_chunks_defers_reassembly() {
    let dir = test_dir("udp_deferred");
    let engine = test_engine(&dir);
    let mut events = engine.subscribe();

    let data = patterned(1024);
    let port = engine.open_listener("DEFER001", Protocol::Udp, 0).await.unwrap();
    let target: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let init = WireMessage::Init {
        data: InitData {
            transfer_id: "ignored".into(),
            filename: "deferred.bin".into(),
            file_size: data.len() as u64,
            total: 1,
        },
        checksum: None,
    };
    socket.send_to(&serde_json::to_vec(&init).unwrap(), target).await.unwrap();

    // digest first, payload afterwards
    let complete = WireMessage::Complete {
        checksum: hex::encode(Sha256::digest(&data)),
    };
    socket
        .send_to(&serde_json::to_vec(&complete).unwrap(), target)
        .await
        .unwrap();

    let chunk = WireMessage::Chunk {
        index: 0,
        data: bytes::Bytes::copy_from_slice(&data),
    };
    socket.send_to(&serde_json::to_vec(&chunk).unwrap(), target).await.unwrap();

    next_matching(&mut events, |e| matches!(e, TransferEvent::Complete { .. })).await;
    engine.shutdown_all().await;
}

#[tokio::test]
async fn checksum_mismatch_fails_and_stays_inspectable() {
    let dir = test_dir("bad_checksum");
    let engine = test_engine(&dir);
    let mut events = engine.subscribe();

    let data = patterned(4096);
    let port = engine.open_listener("BADC0DE1", Protocol::Tcp, 0).await.unwrap();

    let mut stream = tokio::net::TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();

    write_message(
        &mut stream,
        &WireMessage::Init {
            data: InitData {
                transfer_id: "t-bad".into(),
                filename: "corrupt.bin".into(),
                file_size: data.len() as u64,
                total: 1,
            },
            checksum: None,
        },
    )
    .await
    .unwrap();
    write_message(
        &mut stream,
        &WireMessage::Chunk {
            index: 0,
            data: bytes::Bytes::copy_from_slice(&data),
        },
    )
    .await
    .unwrap();

    // flip one hex digit of the true digest
    let mut digest = hex::encode(Sha256::digest(&data));
    let flipped = if digest.as_bytes()[0] == b'0' { "1" } else { "0" };
    digest.replace_range(0..1, flipped);
    write_message(&mut stream, &WireMessage::Complete { checksum: digest })
        .await
        .unwrap();

    let event = next_matching(&mut events, |e| matches!(e, TransferEvent::Error { .. })).await;
    match event {
        TransferEvent::Error { transfer_id, code, .. } => {
            assert_eq!(transfer_id, "t-bad");
            assert_eq!(code, "CHUNK_ERROR");
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // never completed, left failed with the chunk store intact
    let report = engine.status("t-bad").expect("still registered");
    assert_eq!(report.status, TransferStatus::Failed);
    assert_eq!(report.transferred, 1);
    assert!(!dir.join("uploads").join("corrupt.bin").exists());

    engine.shutdown_all().await;
}

#[tokio::test]
async fn idle_transfer_times_out_exactly_once() {
    let dir = test_dir("timeout");
    let engine = TransferEngine::new(EngineConfig {
        upload_dir: dir.join("uploads"),
        transfer_timeout: Duration::from_millis(200),
        ..EngineConfig::default()
    });
    let mut events = engine.subscribe();

    let port = engine.open_listener("T1MEOUT0", Protocol::Udp, 0).await.unwrap();
    let target: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let transfer_id = socket.local_addr().unwrap().to_string();

    // init and then silence
    let init = WireMessage::Init {
        data: InitData {
            transfer_id: "ignored".into(),
            filename: "stalled.bin".into(),
            file_size: 1024,
            total: 1,
        },
        checksum: None,
    };
    socket.send_to(&serde_json::to_vec(&init).unwrap(), target).await.unwrap();

    let event = next_matching(&mut events, |e| matches!(e, TransferEvent::Timeout { .. })).await;
    match event {
        TransferEvent::Timeout { transfer_id: id, .. } => assert_eq!(id, transfer_id),
        other => panic!("unexpected event: {:?}", other),
    }
    next_matching(&mut events, |e| matches!(e, TransferEvent::Destroyed { .. })).await;

    // registry entry is gone and the timeout never fires again
    assert!(engine.status(&transfer_id).is_none());
    tokio::time::sleep(Duration::from_millis(400)).await;
    let mut extra_timeouts = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, TransferEvent::Timeout { .. }) {
            extra_timeouts += 1;
        }
    }
    assert_eq!(extra_timeouts, 0);

    engine.shutdown_all().await;
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let dir = test_dir("cancel");
    let engine = test_engine(&dir);
    let mut events = engine.subscribe();

    let port = engine.open_listener("CANCEL01", Protocol::Udp, 0).await.unwrap();
    let target: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let transfer_id = socket.local_addr().unwrap().to_string();

    let init = WireMessage::Init {
        data: InitData {
            transfer_id: "ignored".into(),
            filename: "doomed.bin".into(),
            file_size: 1024,
            total: 1,
        },
        checksum: None,
    };
    socket.send_to(&serde_json::to_vec(&init).unwrap(), target).await.unwrap();

    // wait until the init datagram has registered the transfer
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.status(&transfer_id).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    engine.cancel(&transfer_id).unwrap();
    next_matching(&mut events, |e| matches!(e, TransferEvent::Cancelled { .. })).await;

    // second cancel reports not-found instead of raising
    match engine.cancel(&transfer_id) {
        Err(TransferError::NotFound(id)) => assert_eq!(id, transfer_id),
        other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
    }

    // cancelling an id that never existed behaves the same
    assert!(matches!(
        engine.cancel("never-registered"),
        Err(TransferError::NotFound(_))
    ));

    engine.shutdown_all().await;
}

#[tokio::test]
async fn port_in_use_is_reported_and_isolated() {
    let dir = test_dir("port_in_use");
    let engine = test_engine(&dir);

    // occupy a port outside the engine
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = blocker.local_addr().unwrap().port();

    match engine.open_listener("A1B2C3D4", Protocol::Tcp, taken).await {
        Err(TransferError::PortInUse { port, room_id }) => {
            assert_eq!(port, taken);
            assert_eq!(room_id, "A1B2C3D4");
        }
        other => panic!("expected PortInUse, got {:?}", other.map(|_| ())),
    }

    // a different room is unaffected
    let port = engine.open_listener("FFEEDDCC", Protocol::Tcp, 0).await.unwrap();
    assert!(port > 0);

    // and a second listener for the same live room/protocol fails cleanly
    match engine.open_listener("FFEEDDCC", Protocol::Tcp, 0).await {
        Err(TransferError::ListenerExists { room_id, .. }) => assert_eq!(room_id, "FFEEDDCC"),
        other => panic!("expected ListenerExists, got {:?}", other.map(|_| ())),
    }

    engine.shutdown_all().await;
}

#[tokio::test]
async fn concurrent_transfers_do_not_interfere() {
    let dir = test_dir("concurrent");
    let engine = test_engine(&dir);
    let mut events = engine.subscribe();

    let port = engine.open_listener("SHARED00", Protocol::Udp, 0).await.unwrap();
    let target: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

    let sock_a = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sock_b = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let id_a = sock_a.local_addr().unwrap().to_string();
    let id_b = sock_b.local_addr().unwrap().to_string();

    let data = patterned(2048);
    for (name, sock) in [("a.bin", &sock_a), ("b.bin", &sock_b)] {
        let init = WireMessage::Init {
            data: InitData {
                transfer_id: "ignored".into(),
                filename: name.into(),
                file_size: data.len() as u64,
                total: 1,
            },
            checksum: None,
        };
        sock.send_to(&serde_json::to_vec(&init).unwrap(), target).await.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.status(&id_a).is_none() || engine.status(&id_b).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // cancelling A leaves B untouched
    engine.cancel(&id_a).unwrap();
    assert!(engine.status(&id_a).is_none());
    assert_eq!(
        engine.status(&id_b).expect("b still active").status,
        TransferStatus::Pending
    );

    // B still completes normally
    let chunk = WireMessage::Chunk {
        index: 0,
        data: bytes::Bytes::copy_from_slice(&data),
    };
    sock_b.send_to(&serde_json::to_vec(&chunk).unwrap(), target).await.unwrap();
    let complete = WireMessage::Complete {
        checksum: hex::encode(Sha256::digest(&data)),
    };
    sock_b
        .send_to(&serde_json::to_vec(&complete).unwrap(), target)
        .await
        .unwrap();

    let event = next_matching(&mut events, |e| matches!(e, TransferEvent::Complete { .. })).await;
    match event {
        TransferEvent::Complete { transfer_id, .. } => assert_eq!(transfer_id, id_b),
        other => panic!("unexpected event: {:?}", other),
    }

    engine.shutdown_all().await;
}

#[tokio::test]
async fn room_shutdown_cleans_transfers_and_frees_ports() {
    let dir = test_dir("room_shutdown");
    let engine = test_engine(&dir);
    let mut events = engine.subscribe();

    let tcp_port = engine.open_listener("GONE0001", Protocol::Tcp, 0).await.unwrap();
    let udp_port = engine.open_listener("GONE0001", Protocol::Udp, 0).await.unwrap();
    let target: SocketAddr = format!("127.0.0.1:{}", udp_port).parse().unwrap();

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let transfer_id = socket.local_addr().unwrap().to_string();
    let init = WireMessage::Init {
        data: InitData {
            transfer_id: "ignored".into(),
            filename: "orphan.bin".into(),
            file_size: 1024,
            total: 1,
        },
        checksum: None,
    };
    socket.send_to(&serde_json::to_vec(&init).unwrap(), target).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.status(&transfer_id).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    engine.shutdown_room("GONE0001").await;

    next_matching(&mut events, |e| matches!(e, TransferEvent::Cancelled { .. })).await;
    assert_eq!(engine.transfer_count(), 0);
    assert!(engine.status(&transfer_id).is_none());

    // both ports are released
    std::net::TcpListener::bind(format!("127.0.0.1:{}", tcp_port)).unwrap();
    std::net::UdpSocket::bind(format!("127.0.0.1:{}", udp_port)).unwrap();
}

#[tokio::test]
async fn tcp_premature_disconnect_discards_partial_data() {
    let dir = test_dir("premature");
    let engine = test_engine(&dir);
    let mut events = engine.subscribe();

    let data = patterned(CHUNK_SIZE + 10);
    let port = engine.open_listener("HALFSENT", Protocol::Tcp, 0).await.unwrap();

    let mut stream = tokio::net::TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();
    write_message(
        &mut stream,
        &WireMessage::Init {
            data: InitData {
                transfer_id: "t-half".into(),
                filename: "half.bin".into(),
                file_size: data.len() as u64,
                total: 2,
            },
            checksum: None,
        },
    )
    .await
    .unwrap();
    write_message(
        &mut stream,
        &WireMessage::Chunk {
            index: 0,
            data: bytes::Bytes::copy_from_slice(&data[..CHUNK_SIZE]),
        },
    )
    .await
    .unwrap();

    // walk away mid-transfer
    stream.shutdown().await.unwrap();
    drop(stream);

    let event = next_matching(&mut events, |e| matches!(e, TransferEvent::Error { .. })).await;
    match event {
        TransferEvent::Error { transfer_id, code, .. } => {
            assert_eq!(transfer_id, "t-half");
            assert_eq!(code, "CHUNK_ERROR");
        }
        other => panic!("unexpected event: {:?}", other),
    }
    next_matching(&mut events, |e| matches!(e, TransferEvent::Destroyed { .. })).await;
    assert!(engine.status("t-half").is_none());

    engine.shutdown_all().await;
}
