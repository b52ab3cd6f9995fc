use nodelink::session::{
    DeviceSession, Effect, ReconnectPhase, SessionDriver, SessionSettings,
};
use nodelink::transport::MockTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

/// Fail every reconnect attempt and collect the scheduled delays.
fn failing_delays(s: &mut DeviceSession, mut now: Instant) -> Vec<u64> {
    let mut delays = Vec::new();
    while let Some(deadline) = s.next_deadline() {
        delays.push(deadline.duration_since(now).as_millis() as u64);
        now = deadline;
        let applied = s.poll_timers(now);
        assert_eq!(applied.effects, vec![Effect::Connect]);
        s.on_reconnect_failed(now);
    }
    delays
}

#[test]
fn backoff_doubles_up_to_cap_then_gives_up() {
    let mut s = DeviceSession::new("node-a", SessionSettings::default());
    let now = Instant::now();
    s.on_connected(now);
    s.on_link_lost(now);

    let delays = failing_delays(&mut s, now);
    assert_eq!(delays, vec![1000, 2000, 4000, 8000, 15000, 15000]);
    assert_eq!(s.reconnect().phase(), ReconnectPhase::GivingUp);
    assert_eq!(s.reconnect().attempts(), 6);
    assert_eq!(s.warnings().count(), 1);
}

#[test]
fn successful_reconnect_resets_backoff() {
    let mut s = DeviceSession::new("node-a", SessionSettings::default());
    let mut now = Instant::now();
    s.on_connected(now);
    s.on_link_lost(now);
    for _ in 0..3 {
        now = s.next_deadline().unwrap();
        s.poll_timers(now);
        s.on_reconnect_failed(now);
    }
    assert_eq!(s.reconnect().attempts(), 3);

    s.on_connected(now);
    assert_eq!(s.reconnect().attempts(), 0);
    assert!(s.next_deadline().is_none());
    s.on_link_lost(now);
    assert_eq!(
        s.next_deadline().map(|d| d.duration_since(now)),
        Some(Duration::from_millis(1000))
    );
}

#[test]
fn manual_disconnect_stops_retries_until_manual_connect() {
    let mut s = DeviceSession::new("node-a", SessionSettings::default());
    let now = Instant::now();
    s.on_connected(now);
    s.manual_disconnect();
    assert!(!s.reconnect().auto_reconnect());

    // A late link-loss report must not restart the loop.
    s.on_link_lost(now);
    assert!(s.next_deadline().is_none());

    let applied = s.manual_reconnect();
    assert_eq!(applied.effects, vec![Effect::Connect]);
    assert!(s.reconnect().auto_reconnect());
    s.on_reconnect_failed(now);
    assert!(s.next_deadline().is_some());
}

#[test]
fn disabled_policy_never_schedules() {
    let mut settings = SessionSettings::default();
    settings.reconnect.enabled = false;
    let mut s = DeviceSession::new("node-a", settings);
    let now = Instant::now();
    s.on_connected(now);
    s.on_link_lost(now);
    assert!(s.next_deadline().is_none());
    assert_eq!(s.reconnect().phase(), ReconnectPhase::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn driver_reconnects_after_failed_attempts() {
    let transport = MockTransport::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut handle = SessionDriver::spawn(
        "node-a",
        SessionSettings::default(),
        Arc::new(transport.clone()),
        tx,
    );
    handle.connect().await.unwrap();
    transport.fail_next_connects(2);
    transport.last_link().unwrap().drop_link();
    assert!(handle.wait_connected(false).await);

    let started = Instant::now();
    let reconnected = timeout(Duration::from_secs(60), handle.wait_connected(true)).await;
    assert_eq!(reconnected, Ok(true));
    // 1s + 2s + 4s of backoff before the third try succeeds.
    assert!(started.elapsed() >= Duration::from_secs(7));
    assert_eq!(transport.connect_attempts(), 4);

    let snap = handle.snapshot().await.unwrap();
    assert_eq!(snap.reconnect.attempts, 0);
    assert_eq!(snap.reconnect.phase, ReconnectPhase::Connected);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn driver_gives_up_after_max_attempts() {
    let transport = MockTransport::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut handle = SessionDriver::spawn(
        "node-a",
        SessionSettings::default(),
        Arc::new(transport.clone()),
        tx,
    );
    handle.connect().await.unwrap();
    transport.fail_next_connects(100);
    transport.last_link().unwrap().drop_link();
    assert!(handle.wait_connected(false).await);

    sleep(Duration::from_secs(120)).await;
    let snap = handle.snapshot().await.unwrap();
    assert_eq!(snap.reconnect.phase, ReconnectPhase::GivingUp);
    assert_eq!(transport.connect_attempts(), 7);

    // A manual connect starts over.
    assert!(handle.connect().await.is_err());
    assert_eq!(transport.connect_attempts(), 8);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn driver_manual_disconnect_does_not_reconnect() {
    let transport = MockTransport::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let handle = SessionDriver::spawn(
        "node-a",
        SessionSettings::default(),
        Arc::new(transport.clone()),
        tx,
    );
    handle.connect().await.unwrap();
    handle.disconnect().await.unwrap();
    assert!(!handle.is_connected());

    sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.connect_attempts(), 1);
    assert!(transport.last_link().unwrap().is_closed());
    let snap = handle.snapshot().await.unwrap();
    assert!(!snap.reconnect.auto_reconnect);
    handle.shutdown().await;
}
