//! Bridge session behaviour against the devkit mocks

use libridge::{BridgeError, SessionState, StatsSnapshot};
use libridge_devkit::{SentCommand, TestHarness};
use serde_json::{json, Value};

const MAPPING: &str = r#"{"m3-42": "node42", "m3-7": "node7"}"#;

#[tokio::test]
async fn test_serial_line_is_published_raw_and_as_json() {
    let h = TestHarness::with_mapping(&["m3-42"], MAPPING).unwrap();
    h.start_connected().await.unwrap();

    h.serial.emit_line("m3-42", "42\r").await.unwrap();
    let raw = h.wait_for_message("testbed/node/node42/out").await.unwrap();
    let parsed = h.wait_for_message("testbed/node/node42/out_json").await.unwrap();

    assert_eq!(raw["node_id"], "node42");
    assert_eq!(raw["payload"], "42");
    assert!(raw["timestamp"].as_f64().unwrap() > 0.0);
    assert_eq!(parsed["node_id"], "node42");
    assert_eq!(parsed["payload"], json!(42));
    assert_eq!(raw["timestamp"], parsed["timestamp"]);

    h.shutdown().await;
}

#[tokio::test]
async fn test_non_json_line_only_gets_raw_record() {
    let h = TestHarness::new(&["m3-1"]).unwrap();
    h.start_connected().await.unwrap();

    h.serial.emit_line("m3-1", "booting...").await.unwrap();
    h.serial.emit_line("m3-1", "{\"temp\": 21.5}").await.unwrap();
    h.wait_for_publishes("testbed/node/m3-1/out", 2).await.unwrap();
    h.wait_for_publishes("testbed/node/m3-1/out_json", 1).await.unwrap();

    let raw: Vec<Value> = h
        .broker
        .published_on("testbed/node/m3-1/out")
        .iter()
        .map(|p| serde_json::from_slice(p).unwrap())
        .collect();
    assert_eq!(raw[0]["payload"], "booting...");
    assert_eq!(raw[1]["payload"], "{\"temp\": 21.5}");

    let json_records = h.broker.published_on("testbed/node/m3-1/out_json");
    assert_eq!(json_records.len(), 1);
    let record: Value = serde_json::from_slice(&json_records[0]).unwrap();
    assert_eq!(record["payload"]["temp"], 21.5);

    let stats = h.session.stats();
    assert_eq!(stats.lines_received, 2);
    assert_eq!(stats.records_published, 2);
    assert_eq!(stats.json_records_published, 1);

    h.shutdown().await;
}

#[tokio::test]
async fn test_lines_keep_their_order_per_node() {
    let h = TestHarness::new(&["a"]).unwrap();
    h.start_connected().await.unwrap();

    for i in 0..20 {
        h.serial.emit_line("a", &format!("line {}", i)).await.unwrap();
    }
    h.wait_for_publishes("testbed/node/a/out", 20).await.unwrap();

    let payloads: Vec<String> = h
        .broker
        .published_on("testbed/node/a/out")
        .iter()
        .map(|p| {
            let v: Value = serde_json::from_slice(p).unwrap();
            v["payload"].as_str().unwrap().to_string()
        })
        .collect();
    let expected: Vec<String> = (0..20).map(|i| format!("line {}", i)).collect();
    assert_eq!(payloads, expected);

    h.shutdown().await;
}

#[tokio::test]
async fn test_inbound_message_is_written_to_mapped_node() {
    let h = TestHarness::with_mapping(&["m3-42"], MAPPING).unwrap();
    h.start_connected().await.unwrap();

    assert_eq!(h.broker.subscriptions(), vec!["testbed/node/node42/in"]);

    h.broker.deliver("testbed/node/node42/in", "blink").await.unwrap();
    h.wait_for_sends(1).await.unwrap();
    assert_eq!(
        h.serial.sent(),
        vec![SentCommand { nodes: vec!["m3-42".to_string()], data: "blink".to_string() }]
    );
    assert_eq!(h.session.stats().messages_forwarded, 1);

    h.shutdown().await;
}

#[tokio::test]
async fn test_unmapped_managed_node_keeps_its_name() {
    let h = TestHarness::with_mapping(&["m3-42", "a8-1"], MAPPING).unwrap();
    h.start_connected().await.unwrap();

    h.broker.deliver("testbed/node/a8-1/in", "x").await.unwrap();
    h.wait_for_sends(1).await.unwrap();
    assert_eq!(h.serial.sent()[0].nodes, vec!["a8-1".to_string()]);

    h.shutdown().await;
}

#[tokio::test]
async fn test_inbound_for_unmanaged_node_is_dropped() {
    let h = TestHarness::with_mapping(&["m3-42"], MAPPING).unwrap();
    h.start_connected().await.unwrap();

    h.broker.deliver("testbed/node/other/in", "x").await.unwrap();
    h.broker.deliver("testbed/node//in", "x").await.unwrap();
    h.wait_for_drops(2).await.unwrap();

    assert!(h.serial.sent().is_empty());
    assert_eq!(h.session.stats().messages_forwarded, 0);

    h.shutdown().await;
}

#[tokio::test]
async fn test_mapping_aliasing_two_nodes_is_rejected() {
    // m3-1 would be published as m3-2, the unmapped node's own name
    let err = TestHarness::with_mapping(&["m3-1", "m3-2"], r#"{"m3-1": "m3-2"}"#)
        .err()
        .expect("aliasing mapping accepted");
    assert!(err.to_string().contains("m3-2"));

    assert!(TestHarness::with_mapping(&["m3-1", "m3-3"], r#"{"m3-1": "m3-2"}"#).is_ok());
}

#[tokio::test]
async fn test_malformed_topic_is_dropped_and_session_keeps_serving() {
    let h = TestHarness::new(&["a"]).unwrap();
    h.start_connected().await.unwrap();

    h.broker.deliver("bad/topic", "x").await.unwrap();
    h.wait_for_drops(1).await.unwrap();
    assert!(h.serial.sent().is_empty());

    h.broker.deliver("testbed/node/a/in", "still alive").await.unwrap();
    h.wait_for_sends(1).await.unwrap();
    assert_eq!(h.serial.sent()[0].data, "still alive");
    assert_eq!(h.session.state(), SessionState::Running);

    h.shutdown().await;
}

#[tokio::test]
async fn test_invalid_utf8_payload_is_dropped() {
    let h = TestHarness::new(&["a"]).unwrap();
    h.start_connected().await.unwrap();

    h.broker.deliver("testbed/node/a/in", vec![0xff, 0xfe, 0x00]).await.unwrap();
    h.wait_for_drops(1).await.unwrap();
    assert!(h.serial.sent().is_empty());
    assert!(h.session.is_looping());

    h.shutdown().await;
}

#[tokio::test]
async fn test_rejected_connection_returns_to_idle() {
    let h = TestHarness::new(&["a"]).unwrap();
    h.session.start().unwrap();
    assert_eq!(h.session.state(), SessionState::Connecting);

    h.broker.connack(5).await.unwrap();
    h.wait_for_state(SessionState::Idle).await.unwrap();
    assert!(!h.session.is_looping());
    assert!(h.broker.subscriptions().is_empty());

    // the launch is torn down so the session can start again
    assert!(!h.serial.is_running());
    assert!(!h.broker.is_connected());
    assert_eq!(h.serial.stop_count(), 1);
    assert_eq!(h.broker.disconnect_count(), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn test_restart_after_rejected_connection() {
    let h = TestHarness::new(&["a"]).unwrap();
    h.session.start().unwrap();
    h.broker.connack(4).await.unwrap();
    h.wait_for_state(SessionState::Idle).await.unwrap();

    h.start_connected().await.unwrap();
    assert_eq!(h.broker.connect_count(), 2);
    assert_eq!(h.serial.start_count(), 2);
    assert_eq!(h.broker.subscriptions(), vec!["testbed/node/a/in"]);

    h.serial.emit_line("a", "back").await.unwrap();
    let record = h.wait_for_message("testbed/node/a/out").await.unwrap();
    assert_eq!(record["payload"], "back");

    h.shutdown().await;
}

#[tokio::test]
async fn test_loop_forever_fails_on_rejected_connection() {
    let h = TestHarness::new(&["a"]).unwrap();
    let runner = h.session.clone();
    let task = tokio::spawn(async move { runner.loop_forever().await });

    let broker = &h.broker;
    libridge_devkit::wait_until("transport connect", libridge_devkit::test_utils::DEFAULT_TIMEOUT, || {
        broker.is_connected()
    })
    .await
    .unwrap();
    h.broker.connack(4).await.unwrap();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(BridgeError::ConnectionRejected { code: 4, .. })));
    assert_eq!(h.session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_reconnect_resubscribes() {
    let h = TestHarness::with_mapping(&["m3-42", "m3-7"], MAPPING).unwrap();
    h.start_connected().await.unwrap();
    assert_eq!(h.broker.subscriptions().len(), 2);

    h.broker.drop_connection().await.unwrap();
    h.wait_for_state(SessionState::Connecting).await.unwrap();
    assert!(!h.session.is_looping());

    h.broker.connack(0).await.unwrap();
    h.wait_for_state(SessionState::Running).await.unwrap();

    let mut subs = h.broker.subscriptions();
    subs.sort();
    assert_eq!(
        subs,
        vec![
            "testbed/node/node42/in",
            "testbed/node/node42/in",
            "testbed/node/node7/in",
            "testbed/node/node7/in",
        ]
    );
    assert_eq!(h.session.stats().connects, 2);

    h.shutdown().await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let h = TestHarness::new(&["a"]).unwrap();
    h.start_connected().await.unwrap();

    h.session.stop();
    h.session.stop();
    h.session.join().await;

    assert_eq!(h.session.state(), SessionState::Stopped);
    assert!(!h.session.is_looping());
    assert_eq!(h.broker.disconnect_count(), 1);
    assert_eq!(h.serial.stop_count(), 1);
}

#[tokio::test]
async fn test_stop_before_start() {
    let h = TestHarness::new(&["a"]).unwrap();
    h.session.stop();
    assert_eq!(h.session.state(), SessionState::Stopped);
    assert!(h.session.start().is_err());
}

#[tokio::test]
async fn test_stop_continues_when_transport_fails() {
    let h = TestHarness::new(&["a"]).unwrap();
    h.start_connected().await.unwrap();

    h.broker.fail_disconnect(true);
    h.shutdown().await;

    assert_eq!(h.session.state(), SessionState::Stopped);
    assert_eq!(h.serial.stop_count(), 1);
    assert!(!h.serial.is_running());
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let h = TestHarness::new(&["a"]).unwrap();
    h.start_connected().await.unwrap();
    assert!(h.session.start().is_err());
    assert_eq!(h.broker.connect_count(), 1);
    h.shutdown().await;
}

#[tokio::test]
async fn test_multiplexer_start_failure_releases_transport() {
    let h = TestHarness::new(&["a"]).unwrap();
    h.serial.fail_start(true);

    assert!(h.session.start().is_err());
    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.broker.disconnect_count(), 1);
}

#[tokio::test]
async fn test_publish_failures_are_counted() {
    let h = TestHarness::new(&["a"]).unwrap();
    h.start_connected().await.unwrap();
    h.broker.fail_publish(true);

    h.serial.emit_line("a", "1").await.unwrap();
    let session = &h.session;
    libridge_devkit::wait_until("publish failures", libridge_devkit::test_utils::DEFAULT_TIMEOUT, || {
        session.stats().publish_failures == 2
    })
    .await
    .unwrap();
    assert_eq!(h.session.state(), SessionState::Running);

    h.shutdown().await;
}

#[tokio::test]
async fn test_loop_forever_returns_after_stop() {
    let h = TestHarness::new(&["a"]).unwrap();
    let runner = h.session.clone();
    let task = tokio::spawn(async move { runner.loop_forever().await });

    let broker = &h.broker;
    libridge_devkit::wait_until("transport connect", libridge_devkit::test_utils::DEFAULT_TIMEOUT, || {
        broker.is_connected()
    })
    .await
    .unwrap();
    assert_eq!(h.session.state(), SessionState::Connecting);
    h.broker.connack(0).await.unwrap();
    h.wait_for_state(SessionState::Running).await.unwrap();

    h.session.stop();
    task.await.unwrap().unwrap();
    assert_eq!(h.session.stats(), StatsSnapshot { connects: 1, ..Default::default() });
}
