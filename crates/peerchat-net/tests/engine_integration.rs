//! Integration tests for the connection engine.
//!
//! Each test spawns one or two real engines bound to loopback on ephemeral
//! ports and drives them through `EngineHandle`.
//!
//! Tests CAN use `.unwrap()` and `.expect()`. We test the panic-free
//! behavior of production code through assertions.

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

use peerchat_core::LifecycleState;
use peerchat_net::{
    spawn_engine, DisconnectReason, EngineConfig, EngineError, EngineHandle, PeerEvent,
};
use peerchat_protocol::SENTINEL;
use tokio::sync::broadcast;
use tokio::time::timeout;

// ============================================================================
// Test Helpers
// ============================================================================

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> EngineConfig {
    EngineConfig {
        port: 0,
        bind_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        flush_delay: Duration::from_millis(200),
        connect_timeout: Duration::from_secs(2),
        event_buffer: 8192,
        ..Default::default()
    }
}

fn spawn_test_engine() -> EngineHandle {
    let handle = spawn_engine(test_config()).expect("engine should start");
    assert!(handle.listen_addr().is_some(), "loopback bind should succeed");
    handle
}

fn listen_addr(handle: &EngineHandle) -> SocketAddr {
    handle.listen_addr().expect("engine should be listening")
}

/// Waits for the first event matching `pred`, skipping the rest.
async fn wait_for<F>(rx: &mut broadcast::Receiver<PeerEvent>, mut pred: F) -> PeerEvent
where
    F: FnMut(&PeerEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event channel failed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn is_connected(event: &PeerEvent) -> bool {
    matches!(event, PeerEvent::Connected { .. })
}

fn is_disconnected(event: &PeerEvent) -> bool {
    matches!(event, PeerEvent::Disconnected { .. })
}

/// Connects `a` to `b` and waits until both sides list the link.
async fn link(a: &EngineHandle, b: &EngineHandle) -> peerchat_core::PeerInfo {
    let mut b_events = b.subscribe();
    let info = a.connect(listen_addr(b)).await.expect("connect should succeed");
    wait_for(&mut b_events, is_connected).await;
    info
}

// ============================================================================
// Connection Lifecycle
// ============================================================================

#[tokio::test]
async fn test_connect_registers_on_both_sides() {
    let a = spawn_test_engine();
    let b = spawn_test_engine();

    let info = link(&a, &b).await;
    assert_eq!(info.remote, listen_addr(&b));
    assert_eq!(info.state, LifecycleState::Established);

    let a_list = a.list().await;
    let b_list = b.list().await;
    assert_eq!(a_list.len(), 1);
    assert_eq!(b_list.len(), 1);
    assert_eq!(a_list[0].id, info.id);

    let found = a.lookup(info.id).await.expect("lookup should succeed");
    assert_eq!(found.remote, info.remote);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_message_is_delivered_with_sender_address() {
    let a = spawn_test_engine();
    let b = spawn_test_engine();
    let mut b_events = b.subscribe();

    let info = link(&a, &b).await;
    a.send(info.id, "hello world".to_string())
        .await
        .expect("send should succeed");

    let event = wait_for(&mut b_events, |e| matches!(e, PeerEvent::Message { .. })).await;
    let PeerEvent::Message { from, text, .. } = event else {
        panic!("expected a message");
    };
    assert_eq!(text, "hello world");
    assert_eq!(from.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));

    let b_list = b.list().await;
    assert_eq!(b_list[0].remote, from);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_terminate_removes_link_on_both_sides() {
    let a = spawn_test_engine();
    let b = spawn_test_engine();
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    let info = link(&a, &b).await;
    let closed = a.terminate(info.id).await.expect("terminate should succeed");
    assert_eq!(closed.id, info.id);
    assert_eq!(closed.state, LifecycleState::Closed);

    let event = wait_for(&mut b_events, is_disconnected).await;
    assert!(matches!(
        event,
        PeerEvent::Disconnected {
            reason: DisconnectReason::PeerTerminated,
            ..
        }
    ));
    let event = wait_for(&mut a_events, is_disconnected).await;
    assert!(matches!(
        event,
        PeerEvent::Disconnected {
            reason: DisconnectReason::LocalTerminate,
            ..
        }
    ));

    assert!(a.list().await.is_empty());
    assert!(b.list().await.is_empty());
    assert!(matches!(
        a.lookup(info.id).await,
        Err(EngineError::NotFound(_))
    ));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_terminate_twice_is_not_found() {
    let a = spawn_test_engine();
    let b = spawn_test_engine();

    let info = link(&a, &b).await;
    a.terminate(info.id).await.expect("first terminate");
    assert!(matches!(
        a.terminate(info.id).await,
        Err(EngineError::NotFound(_))
    ));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_connect_to_closed_port_fails_cleanly() {
    let a = spawn_test_engine();

    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = unused.local_addr().unwrap();
    drop(unused);

    let result = a.connect(addr).await;
    assert!(matches!(result, Err(EngineError::ConnectFailure { .. })));
    assert!(a.list().await.is_empty());

    a.shutdown().await;
}

#[tokio::test]
async fn test_ids_are_not_reused() {
    let a = spawn_test_engine();
    let b = spawn_test_engine();

    let first = link(&a, &b).await;
    a.terminate(first.id).await.expect("terminate");
    let second = link(&a, &b).await;
    assert!(second.id > first.id);

    let listed = a.list().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, second.id);

    a.shutdown().await;
    b.shutdown().await;
}

// ============================================================================
// Payloads
// ============================================================================

#[tokio::test]
async fn test_large_message_arrives_intact() {
    let a = spawn_test_engine();
    let b = spawn_test_engine();
    let mut b_events = b.subscribe();

    let info = link(&a, &b).await;
    let payload = "x".repeat(256 * 1024);
    a.send(info.id, payload.clone()).await.expect("send");

    let mut received = String::new();
    while received.len() < payload.len() {
        if let PeerEvent::Message { text, .. } =
            wait_for(&mut b_events, |e| matches!(e, PeerEvent::Message { .. })).await
        {
            received.push_str(&text);
        }
    }
    assert_eq!(received, payload);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_sentinel_text_is_rejected() {
    let a = spawn_test_engine();
    let b = spawn_test_engine();

    let info = link(&a, &b).await;
    let forged = String::from_utf8_lossy(SENTINEL).into_owned();
    assert!(matches!(
        a.send(info.id, forged).await,
        Err(EngineError::ReservedPayload)
    ));
    assert_eq!(a.list().await.len(), 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_text_carrying_sentinel_is_rejected() {
    let a = spawn_test_engine();
    let b = spawn_test_engine();
    let mut b_events = b.subscribe();

    let info = link(&a, &b).await;
    assert!(matches!(
        a.send(info.id, "hi\0TERMINATE\0there".to_string()).await,
        Err(EngineError::ReservedPayload)
    ));
    assert!(matches!(
        a.send(info.id, "bye\0TERMI".to_string()).await,
        Err(EngineError::ReservedPayload)
    ));

    a.send(info.id, "still here".to_string())
        .await
        .expect("send should succeed");
    let event = wait_for(&mut b_events, |e| matches!(e, PeerEvent::Message { .. })).await;
    let PeerEvent::Message { text, .. } = event else {
        panic!("expected a message");
    };
    assert_eq!(text, "still here");
    assert_eq!(a.list().await.len(), 1);
    assert_eq!(b.list().await.len(), 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_bytes_after_sentinel_are_discarded() {
    let a = spawn_test_engine();
    let mut a_events = a.subscribe();

    let mut raw = TcpStream::connect(listen_addr(&a)).unwrap();
    wait_for(&mut a_events, is_connected).await;

    let mut wire = b"bye".to_vec();
    wire.extend_from_slice(SENTINEL);
    wire.extend_from_slice(b"ignored");
    raw.write_all(&wire).unwrap();

    let event = wait_for(&mut a_events, |e| !is_connected(e)).await;
    let PeerEvent::Message { text, .. } = event else {
        panic!("expected the text before the sentinel, got {event:?}");
    };
    assert_eq!(text, "bye");

    let event = wait_for(&mut a_events, |e| !is_connected(e)).await;
    assert!(matches!(
        event,
        PeerEvent::Disconnected {
            reason: DisconnectReason::PeerTerminated,
            ..
        }
    ));
    assert!(a.list().await.is_empty());

    a.shutdown().await;
}

#[tokio::test]
async fn test_abrupt_close_is_peer_closed() {
    let a = spawn_test_engine();
    let mut a_events = a.subscribe();

    let raw = TcpStream::connect(listen_addr(&a)).unwrap();
    wait_for(&mut a_events, is_connected).await;
    drop(raw);

    let event = wait_for(&mut a_events, is_disconnected).await;
    assert!(matches!(
        event,
        PeerEvent::Disconnected {
            reason: DisconnectReason::PeerClosed,
            ..
        }
    ));
    assert!(a.list().await.is_empty());

    a.shutdown().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_terminates_every_link() {
    let a = spawn_test_engine();
    let b = spawn_test_engine();
    let c = spawn_test_engine();
    let mut b_events = b.subscribe();
    let mut c_events = c.subscribe();

    link(&a, &b).await;
    link(&a, &c).await;
    assert_eq!(a.list().await.len(), 2);

    timeout(WAIT, a.shutdown()).await.expect("shutdown should finish");

    for events in [&mut b_events, &mut c_events] {
        let event = wait_for(events, is_disconnected).await;
        assert!(matches!(
            event,
            PeerEvent::Disconnected {
                reason: DisconnectReason::PeerTerminated,
                ..
            }
        ));
    }

    assert!(a.list().await.is_empty());
    assert!(a.connect(listen_addr(&b)).await.is_err());

    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_twice_is_harmless() {
    let a = spawn_test_engine();
    a.shutdown().await;
    timeout(WAIT, a.shutdown()).await.expect("second shutdown returns");
}

#[tokio::test]
async fn test_dropping_every_handle_stops_idle_engine() {
    let a = spawn_test_engine();
    let b = spawn_test_engine();
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    link(&a, &b).await;
    wait_for(&mut a_events, is_connected).await;

    let clone = a.clone();
    drop(a);
    drop(clone);

    let event = wait_for(&mut b_events, is_disconnected).await;
    assert!(matches!(
        event,
        PeerEvent::Disconnected {
            reason: DisconnectReason::PeerTerminated,
            ..
        }
    ));

    let closed = timeout(WAIT, async {
        loop {
            match a_events.recv().await {
                Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(_)) | Ok(_) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "engine loop should stop and close its events");
    assert!(b.list().await.is_empty());

    b.shutdown().await;
}
