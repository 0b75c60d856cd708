#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use browsing_shield::adblock::{BlockRule, RuleStore, RuleStoreError};
use browsing_shield::bridge::{ChannelError, Connection, Connector};
use browsing_shield::status::{StatusIndication, StatusSink, TabId};

/// The host's side of one established connection: push messages to the
/// bridge via `to_bridge`, observe the wire via `from_bridge`. Dropping the
/// link disconnects the bridge.
pub struct HostLink {
    pub to_bridge: mpsc::UnboundedSender<Value>,
    pub from_bridge: mpsc::UnboundedReceiver<Value>,
}

impl HostLink {
    /// Next message the bridge put on the wire.
    pub async fn recv(&mut self) -> Value {
        tokio::time::timeout(std::time::Duration::from_secs(2), self.from_bridge.recv())
            .await
            .expect("timed out waiting for wire message")
            .expect("wire closed")
    }

    /// Assert nothing reaches the wire within a short window.
    pub async fn expect_silence(&mut self) {
        let silent = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            self.from_bridge.recv(),
        )
        .await
        .is_err();
        assert!(silent, "unexpected wire traffic");
    }

    pub fn push(&self, msg: Value) {
        self.to_bridge.send(msg).expect("bridge inbound closed");
    }
}

/// In-memory stand-in for the native host transport. Every `connect` hands
/// the host side of the new connection to the test through a channel.
pub struct TestConnector {
    links: mpsc::UnboundedSender<HostLink>,
    fail: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl TestConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HostLink>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                links: tx,
                fail: Arc::new(AtomicBool::new(false)),
                attempts: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    /// Flip to make subsequent connection attempts fail.
    pub fn fail_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fail)
    }

    pub fn attempt_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.attempts)
    }
}

#[async_trait]
impl Connector for TestConnector {
    async fn connect(&self) -> Result<Connection, ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ChannelError::MissingStdio);
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let _ = self.links.send(HostLink {
            to_bridge: in_tx,
            from_bridge: out_rx,
        });
        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Wait for the next established connection's host link.
pub async fn next_link(links: &mut mpsc::UnboundedReceiver<HostLink>) -> HostLink {
    tokio::time::timeout(std::time::Duration::from_secs(2), links.recv())
        .await
        .expect("timed out waiting for connection")
        .expect("connector dropped")
}

/// Records every indication batch applied to a tab. `popup` reports what
/// was last applied unless `lose_popups` is set, which simulates the
/// platform dropping the assignment.
#[derive(Default)]
pub struct RecordingSink {
    pub applied: StdMutex<Vec<(TabId, StatusIndication)>>,
    pub lose_popups: AtomicBool,
}

impl RecordingSink {
    pub fn applied_for(&self, tab: TabId) -> Vec<StatusIndication> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == tab)
            .map(|(_, ind)| ind.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn apply(&self, tab_id: TabId, indication: &StatusIndication) {
        self.applied
            .lock()
            .unwrap()
            .push((tab_id, indication.clone()));
    }

    async fn popup(&self, tab_id: TabId) -> Option<String> {
        if self.lose_popups.load(Ordering::SeqCst) {
            return None;
        }
        self.applied
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| *id == tab_id)
            .and_then(|(_, ind)| ind.popup.map(str::to_string))
    }
}

/// Rule store backed by a map, with a hold lock so tests can keep a replace
/// operation in flight.
pub struct MemoryRuleStore {
    pub rules: Mutex<HashMap<u32, BlockRule>>,
    pub hold: Arc<Mutex<()>>,
    pub replace_calls: AtomicUsize,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(HashMap::new()),
            hold: Arc::new(Mutex::new(())),
            replace_calls: AtomicUsize::new(0),
        }
    }

    pub async fn rule(&self, id: u32) -> Option<BlockRule> {
        self.rules.lock().await.get(&id).cloned()
    }

    pub async fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.rules.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn replace(
        &self,
        add: Vec<BlockRule>,
        remove_ids: Vec<u32>,
    ) -> Result<(), RuleStoreError> {
        let _held = self.hold.lock().await;
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        let mut rules = self.rules.lock().await;
        for id in remove_ids {
            rules.remove(&id);
        }
        for rule in add {
            rules.insert(rule.id, rule);
        }
        Ok(())
    }

    async fn rules(&self) -> Result<Vec<BlockRule>, RuleStoreError> {
        Ok(self.rules.lock().await.values().cloned().collect())
    }
}
