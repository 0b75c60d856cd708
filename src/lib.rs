//! # browsing-shield
//!
//! The background service of a browsing-protection browser extension,
//! talking to a companion native process over **Native Messaging**:
//!
//! - A **request/response RPC bridge** over one long-lived channel, with id
//!   correlation, pre-init queueing, and rate-limited reconnects
//! - A **per-tab protection status** state machine driving the extension's
//!   icon, title and popup
//! - **Referrer dedup** so repeated cross-site navigations are reported once
//! - A **declarative ad-block rule set** kept in sync with domain lists and
//!   user exceptions
//!
//! ---
//!
//! ## The wire
//!
//! Native Messaging frames every message as a **4-byte length prefix**
//! (`u32`, native endianness) followed by that many bytes of UTF-8 JSON.
//! This crate sits on the *extension* side of the pipe: it spawns the host
//! process and writes to its stdin, reads from its stdout.
//!
//! On top of the framing, every outgoing message is an envelope
//! `{ id, type, <payload> }`. The host answers with the same `id`; responses
//! may arrive in any order, so correlation is purely by id. Two kinds of
//! inbound message are *not* responses: `settings` and `bankingSession`
//! pushes, and the `server` identity marker that announces a host restart.
//!
//! ### Gotchas worth knowing
//!
//! - **Disconnect is normal.** The host exits when the browser closes or
//!   the product restarts. Every pending request then resolves with an empty
//!   response carrying only its id; nothing hangs, nothing errors.
//! - **No request timeouts.** A request whose response never arrives stays
//!   pending until a disconnect resolves it. Callers that depend on host
//!   restarts to unblock rely on this.
//! - **Some messages must wait.** Scan, category and rating requests can
//!   trigger a block page, which needs customization data from the init
//!   handshake; the bridge queues them until it is told init completed, then
//!   flushes them in order.
//! - **Never log to stdout** in anything that shares the process with the
//!   pipe. This crate logs through `tracing` only.
//!
//! ---
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use browsing_shield::{
//!     AdBlockRuleManager, BridgeConfig, ExtensionInfo, HostProcessConnector, IconTheme,
//!     NativeMessagingBridge, ProtectionService, TabStatusOrchestrator,
//! };
//! # use async_trait::async_trait;
//! # struct NoSink;
//! # #[async_trait]
//! # impl browsing_shield::StatusSink for NoSink {
//! #     async fn apply(&self, _: i64, _: &browsing_shield::StatusIndication) {}
//! #     async fn popup(&self, _: i64) -> Option<String> { None }
//! # }
//! # struct NoStore;
//! # #[async_trait]
//! # impl browsing_shield::AdBlockRuleStore for NoStore {
//! #     async fn replace(&self, _: Vec<browsing_shield::BlockRule>, _: Vec<u32>)
//! #         -> Result<(), browsing_shield::RuleStoreError> { Ok(()) }
//! #     async fn rules(&self) -> Result<Vec<browsing_shield::BlockRule>, browsing_shield::RuleStoreError> { Ok(vec![]) }
//! # }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bridge = NativeMessagingBridge::new(
//!     Box::new(HostProcessConnector::new("/opt/product/native-host")),
//!     BridgeConfig::default(),
//! );
//! let status = TabStatusOrchestrator::new(Arc::new(NoSink), IconTheme::Light);
//! let block_list = browsing_shield::default_block_list();
//! let ad_block = AdBlockRuleManager::new(
//!     Arc::new(NoStore),
//!     block_list.domains.clone(),
//!     block_list.search.url_filter.clone(),
//! );
//! let service = ProtectionService::new(bridge, status, ad_block, ExtensionInfo {
//!     name: "Browsing Shield".into(),
//!     version: "1.0.0".into(),
//!     id: "extension-id".into(),
//!     browser_name: "chrome".into(),
//! });
//! service.start();
//! service.init(serde_json::json!({ "os": "linux" }), vec![]).await;
//!
//! let verdict = service.scan("https://example.com", Some(7), None).await;
//! println!("tab 7 is {verdict:?}");
//! # }
//! ```
//!
//! ---
//!
//! ## Crate layout
//!
//! - [`protocol`] — framing + envelope and verdict types.
//! - [`bridge`] — the RPC bridge: channel ownership, reconnect throttling,
//!   pending-request correlation, init gating, push demux.
//! - [`status`] — the per-tab state machine and [`StatusSink`] seam.
//! - [`referrer`] — the referrer dedup cache.
//! - [`adblock`] — declarative rule synchronization and the
//!   [`AdBlockRuleStore`] seam.
//! - [`service`] — the background-worker flows wiring everything together.
//! - [`config`] — tuning knobs and the embedded default block list.

pub mod adblock;
pub mod bridge;
pub mod config;
pub mod protocol;
pub mod referrer;
pub mod service;
pub mod status;

// -------- Bridge re-exports --------

#[doc(inline)]
pub use bridge::{
    BridgeEvent, ChannelError, Connection, Connector, HostProcessConnector,
    NativeMessagingBridge, ReconnectPolicy,
};

// -------- Protocol re-exports --------

#[doc(inline)]
pub use protocol::{
    BankingSession, BlockDescriptor, BlockType, MessageType, OutboundMessage, Response,
    ScanVerdict, Settings,
};

// -------- Status / referrer re-exports --------

#[doc(inline)]
pub use status::{
    IconTheme, ProtectionStatus, StatusIndication, StatusSink, TabId, TabState,
    TabStatusOrchestrator,
};
#[doc(inline)]
pub use referrer::ReferrerCache;

// -------- Ad-block re-exports --------

#[doc(inline)]
pub use adblock::RuleStore as AdBlockRuleStore;
#[doc(inline)]
pub use adblock::{AdBlockRuleManager, BlockRule, RuleStoreError};

// -------- Service / config re-exports --------

#[doc(inline)]
pub use config::{default_block_list, BridgeConfig, ExtensionInfo};
#[doc(inline)]
pub use service::{ProtectionService, TabSnapshot, UrlInfo, UrlRating, WhitelistInfo};
