use nodelink::protocol::KeyPolicy;
use nodelink::session::{DeviceSession, Effect, SessionSettings};
use tokio::time::Instant;

fn session() -> DeviceSession {
    let mut s = DeviceSession::new("node-a", SessionSettings::default());
    s.on_connected(Instant::now());
    s
}

#[test]
fn packed_json_objects_feed_one_session() {
    let mut s = session();
    let applied = s.handle_notification(
        br#"{"sensor":"bme280","temperature":21.5}{"m":{"h":40}}"#,
        Instant::now(),
    );
    assert!(applied.structural);
    assert!(applied.metrics_updated);
    assert_eq!(s.sensor(), Some("bme280"));
    assert_eq!(s.metric_keys(), ["temperature", "humidity"]);
    assert_eq!(s.metric("humidity").and_then(|m| m.latest), Some(40.0));
}

#[test]
fn metrics_keep_the_order_the_node_sent() {
    let mut s = session();
    let now = Instant::now();
    s.handle_notification(
        br#"{"sensor":"bme280","metrics":{"temperature":21.5,"pressure":1001,"humidity":40}}"#,
        now,
    );
    assert_eq!(s.metric_keys(), ["temperature", "pressure", "humidity"]);

    // The history series copies the first metric's profile.
    s.start_history_stream().unwrap();
    s.handle_notification(
        br#"{"csv_block":{"id":1,"seq":0,"data":"01/01/24 00:00:00,20.0,\n","last":true}}"#,
        now,
    );
    s.poll_timers(now + std::time::Duration::from_millis(150));
    let history = s.metric("history").map(|m| m.profile.label.as_str());
    assert_eq!(history, Some("Temperature"));
}

#[test]
fn legacy_lines_are_metric_ticks() {
    let mut s = session();
    let applied = s.handle_notification(b"t=21.5\nh=40\0", Instant::now());
    assert!(!applied.structural);
    assert!(applied.metrics_updated);
    assert!(applied.effects.is_empty());
    assert_eq!(s.metric("temperature").map(|m| m.len()), Some(1));
    assert_eq!(s.metric("humidity").and_then(|m| m.latest), Some(40.0));
}

#[test]
fn full_profile_set_defines_active_metrics() {
    let mut s = session();
    s.handle_notification(br#"{"m":{"t":20,"h":50,"p":1000}}"#, Instant::now());
    assert_eq!(s.metric_keys().len(), 3);

    let applied = s.handle_notification(
        br#"{"profiles":{"t":{"label":"Room","unit":"C","min":0,"max":40}}}"#,
        Instant::now(),
    );
    assert!(applied.structural);
    assert_eq!(s.metric_keys(), ["temperature"]);
    let profile = s.metric("temperature").map(|m| &m.profile);
    assert_eq!(profile.map(|p| p.label.as_str()), Some("Room"));
    assert_eq!(profile.map(|p| p.max), Some(40.0));
}

#[test]
fn inverted_range_is_rejected_with_warning() {
    let mut s = session();
    s.handle_notification(b"t=21", Instant::now());
    s.handle_notification(b"profile.t.min=80", Instant::now());
    let profile = s.metric("temperature").map(|m| m.profile.clone());
    assert_eq!(profile.map(|p| p.min), Some(-10.0));
    assert_eq!(s.warnings().count(), 1);
}

#[test]
fn configured_sensor_change_clears_metrics() {
    let mut s = session();
    s.handle_notification(br#"{"config":{"sensor":"bme280"}}"#, Instant::now());
    s.handle_notification(b"t=21;h=30", Instant::now());
    assert_eq!(s.metric_keys().len(), 2);

    // Same sensor again keeps state.
    s.handle_notification(br#"{"config":{"sensor":"bme280","freq":5000}}"#, Instant::now());
    assert_eq!(s.metric_keys().len(), 2);
    assert_eq!(s.live_config().frequency_ms, Some(5000));

    s.handle_notification(br#"{"config":{"sensor":"bme680"}}"#, Instant::now());
    assert!(s.metric_keys().is_empty());
    assert_eq!(s.live_config().sensor.as_deref(), Some("bme680"));
}

#[test]
fn strict_sessions_ignore_unknown_keys() {
    let settings = SessionSettings {
        key_policy: KeyPolicy::Strict,
        ..Default::default()
    };
    let mut s = DeviceSession::new("node-b", settings);
    s.handle_notification(br#"{"temp":19.5,"lux":300}"#, Instant::now());
    assert_eq!(s.metric_keys(), ["temperature"]);
}

#[test]
fn inline_csv_becomes_export() {
    let mut s = session();
    let applied = s.handle_notification(
        br#"{"csv":"date_time,value1,value2\n01/01/24 00:00:00,21.5,1013"}"#,
        Instant::now(),
    );
    assert!(applied.structural);
    assert_eq!(
        applied.effects,
        vec![Effect::Export(
            "date_time,value1,value2\n01/01/24 00:00:00,21.5,\n".to_string()
        )]
    );
}

#[test]
fn garbage_notifications_change_nothing() {
    let mut s = session();
    let applied = s.handle_notification(b"\xff\xfe\0", Instant::now());
    assert!(!applied.structural);
    assert!(!applied.metrics_updated);
    assert!(s.metric_keys().is_empty());
}
