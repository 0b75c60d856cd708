mod common;

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use serde_json::json;

use browsing_shield::bridge::{BridgeEvent, NativeMessagingBridge, ReconnectPolicy};
use browsing_shield::protocol::{MessageType, OutboundMessage};
use browsing_shield::BridgeConfig;
use common::{next_link, TestConnector};

fn whitelist_request(url: &str) -> OutboundMessage {
    OutboundMessage::new(MessageType::CheckWhitelist).with("checkwhitelist", json!({ "url": url }))
}

#[tokio::test]
async fn responses_are_matched_by_id_not_order() {
    let (connector, mut links) = TestConnector::new();
    let bridge = NativeMessagingBridge::new(Box::new(connector), BridgeConfig::default());

    let b1 = bridge.clone();
    let t1 = tokio::spawn(async move { b1.send(whitelist_request("https://one.example")).await });
    let mut link = next_link(&mut links).await;
    let first = link.recv().await;

    let b2 = bridge.clone();
    let t2 = tokio::spawn(async move { b2.send(whitelist_request("https://two.example")).await });
    let second = link.recv().await;

    let id1 = first["id"].as_u64().unwrap();
    let id2 = second["id"].as_u64().unwrap();
    assert!(id2 > id1, "ids must increase monotonically");

    // answer out of call order
    link.push(json!({ "id": id2, "info": { "whitelisted": true } }));
    link.push(json!({ "id": id1, "info": { "whitelisted": false } }));

    let r1 = t1.await.unwrap();
    let r2 = t2.await.unwrap();
    assert_eq!(r1.id, id1);
    assert_eq!(r1.body["info"]["whitelisted"], false);
    assert_eq!(r2.id, id2);
    assert_eq!(r2.body["info"]["whitelisted"], true);
}

#[tokio::test]
async fn unmatched_response_ids_are_dropped() {
    let (connector, mut links) = TestConnector::new();
    let bridge = NativeMessagingBridge::new(Box::new(connector), BridgeConfig::default());

    let b = bridge.clone();
    let t = tokio::spawn(async move { b.send(whitelist_request("https://a.example")).await });
    let mut link = next_link(&mut links).await;
    let wire = link.recv().await;
    let id = wire["id"].as_u64().unwrap();

    // a response for a request nobody made
    link.push(json!({ "id": id + 1000, "info": { "whitelisted": true } }));
    // the real answer still lands
    link.push(json!({ "id": id, "info": { "whitelisted": false } }));

    let resp = t.await.unwrap();
    assert_eq!(resp.id, id);
    assert_eq!(resp.body["info"]["whitelisted"], false);
}

#[tokio::test]
async fn gated_messages_wait_for_init_and_flush_in_order() {
    let (connector, mut links) = TestConnector::new();
    let bridge = NativeMessagingBridge::new(Box::new(connector), BridgeConfig::default());

    // scans queue until initialization; notifications of other types pass
    bridge
        .notify(
            OutboundMessage::new(MessageType::ScanRequest)
                .with("scanrequest", json!({ "url": "https://first.example" })),
        )
        .await;
    let mut link = next_link(&mut links).await;
    bridge
        .notify(
            OutboundMessage::new(MessageType::ScanRequest)
                .with("scanrequest", json!({ "url": "https://second.example" })),
        )
        .await;
    bridge
        .notify(
            OutboundMessage::new(MessageType::TabInfo)
                .with("tabinfo", json!({ "action": "open", "tabId": 1 })),
        )
        .await;

    // only the ungated tabinfo reaches the wire before init
    let early = link.recv().await;
    assert_eq!(early["type"], "tabinfo");
    link.expect_silence().await;

    bridge.notify_initialized().await;
    let flushed1 = link.recv().await;
    let flushed2 = link.recv().await;
    assert_eq!(flushed1["type"], "scanrequest");
    assert_eq!(flushed1["scanrequest"]["url"], "https://first.example");
    assert_eq!(flushed2["scanrequest"]["url"], "https://second.example");

    // post-init scans go straight out
    bridge
        .notify(
            OutboundMessage::new(MessageType::ScanRequest)
                .with("scanrequest", json!({ "url": "https://third.example" })),
        )
        .await;
    let direct = link.recv().await;
    assert_eq!(direct["scanrequest"]["url"], "https://third.example");
}

#[tokio::test]
async fn disconnect_resolves_pending_requests_with_empty_responses() {
    let (connector, mut links) = TestConnector::new();
    let bridge = NativeMessagingBridge::new(Box::new(connector), BridgeConfig::default());

    let b = bridge.clone();
    let t = tokio::spawn(async move { b.send(whitelist_request("https://a.example")).await });
    let mut link = next_link(&mut links).await;
    let wire = link.recv().await;
    let id = wire["id"].as_u64().unwrap();

    drop(link);

    let resp = t.await.unwrap();
    assert_eq!(resp.id, id);
    assert!(resp.is_empty(), "disconnect must resolve with an empty response");
    assert_eq!(bridge.pending_requests().await, 0);
}

#[tokio::test]
async fn initialization_recurs_after_disconnect() {
    let (connector, mut links) = TestConnector::new();
    let bridge = NativeMessagingBridge::new(Box::new(connector), BridgeConfig::default());

    bridge
        .notify(
            OutboundMessage::new(MessageType::TabInfo)
                .with("tabinfo", json!({ "action": "open", "tabId": 1 })),
        )
        .await;
    let mut link = next_link(&mut links).await;
    link.recv().await;
    bridge.notify_initialized().await;

    let mut events = bridge.subscribe();
    drop(link);
    loop {
        if matches!(events.recv().await.unwrap(), BridgeEvent::Disconnected) {
            break;
        }
    }

    bridge
        .notify(
            OutboundMessage::new(MessageType::ScanRequest)
                .with("scanrequest", json!({ "url": "https://after.example" })),
        )
        .await;
    let mut link = next_link(&mut links).await;

    // the gate closed again: the scan is held even though init ran before
    link.expect_silence().await;
    bridge.notify_initialized().await;
    let flushed = link.recv().await;
    assert_eq!(flushed["scanrequest"]["url"], "https://after.example");
}

#[tokio::test]
async fn connection_failures_are_throttled() {
    let (connector, _links) = TestConnector::new();
    let fail = connector.fail_flag();
    let attempts = connector.attempt_counter();
    fail.store(true, Ordering::SeqCst);

    let bridge = NativeMessagingBridge::new(
        Box::new(connector),
        BridgeConfig {
            reconnect_cooldown: Duration::from_secs(60),
            max_connect_failures: 0,
        },
    );

    let resp = bridge.send(whitelist_request("https://a.example")).await;
    assert!(resp.is_empty());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    // still inside the cooldown with too many failures: no new attempt
    let resp = bridge.send(whitelist_request("https://b.example")).await;
    assert!(resp.is_empty());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[test]
fn reconnect_policy_window() {
    let mut policy = ReconnectPolicy::new(Duration::from_secs(10), 3);
    let t0 = Instant::now();

    assert!(policy.attempt_allowed(t0));
    policy.record_attempt(t0);
    for _ in 0..4 {
        policy.record_failure();
    }
    // four failures exceed the bound of three
    assert!(!policy.attempt_allowed(t0 + Duration::from_secs(1)));
    // cooldown elapsed
    assert!(policy.attempt_allowed(t0 + Duration::from_secs(11)));
    // success resets the window
    policy.reset();
    assert!(policy.attempt_allowed(t0 + Duration::from_secs(1)));
}

#[tokio::test]
async fn pushes_are_routed_to_events_not_pending_requests() {
    let (connector, mut links) = TestConnector::new();
    let bridge = NativeMessagingBridge::new(Box::new(connector), BridgeConfig::default());
    let mut events = bridge.subscribe();

    let b = bridge.clone();
    let t = tokio::spawn(async move { b.send(whitelist_request("https://a.example")).await });
    let mut link = next_link(&mut links).await;
    let wire = link.recv().await;
    let id = wire["id"].as_u64().unwrap();

    link.push(json!({ "id": "settings", "settings": { "block_ads": true } }));
    link.push(json!({ "id": "bankingSession", "bankingSession": { "active": true } }));
    link.push(json!({ "id": id, "info": { "whitelisted": false }, "server": "host-1" }));

    // first inbound message confirms the connection
    assert!(matches!(events.recv().await.unwrap(), BridgeEvent::Connected));
    match events.recv().await.unwrap() {
        BridgeEvent::SettingsChanged(settings) => {
            assert_eq!(settings["block_ads"], true);
        }
        other => panic!("expected settings push, got {other:?}"),
    }
    assert!(matches!(
        events.recv().await.unwrap(),
        BridgeEvent::BankingModeChanged(session) if session.active
    ));
    // the response carried a server marker: restart handling fires and the
    // pending request still resolves
    assert!(matches!(
        events.recv().await.unwrap(),
        BridgeEvent::ServerRestarted
    ));
    let resp = t.await.unwrap();
    assert_eq!(resp.id, id);
    assert!(bridge.is_server_id_valid().await);
    assert_eq!(bridge.server_id().await, "host-1");
}

#[tokio::test]
async fn server_identity_change_fires_once_per_change() {
    let (connector, mut links) = TestConnector::new();
    let bridge = NativeMessagingBridge::new(Box::new(connector), BridgeConfig::default());
    let mut events = bridge.subscribe();

    let b = bridge.clone();
    let t = tokio::spawn(async move { b.send(whitelist_request("https://a.example")).await });
    let mut link = next_link(&mut links).await;
    let wire = link.recv().await;
    let id = wire["id"].as_u64().unwrap();

    link.push(json!({ "server": "host-1" }));
    link.push(json!({ "server": "host-1" }));
    link.push(json!({ "server": "host-2" }));
    link.push(json!({ "id": id }));
    t.await.unwrap();

    assert!(matches!(events.recv().await.unwrap(), BridgeEvent::Connected));
    assert!(matches!(
        events.recv().await.unwrap(),
        BridgeEvent::ServerRestarted
    ));
    // the repeated marker must not fire; the next event is the second change
    assert!(matches!(
        events.recv().await.unwrap(),
        BridgeEvent::ServerRestarted
    ));
    assert_eq!(bridge.server_id().await, "host-2");
}
