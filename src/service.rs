//! The background service tying the pieces together.
//!
//! [`ProtectionService`] owns the bridge, the per-tab status orchestrator,
//! the ad-block manager and the referrer cache, and implements the flows the
//! extension's event handlers call into: the init handshake, URL scans,
//! category/whitelist/rating lookups, user ratings, referrer and tab-info
//! notifications, and reactions to host pushes (settings, banking mode, host
//! restarts). Every public method resolves with a best-effort answer; errors
//! never cross this boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::adblock::AdBlockRuleManager;
use crate::bridge::{BridgeEvent, NativeMessagingBridge};
use crate::config::ExtensionInfo;
use crate::protocol::{
    BlockDescriptor, BlockType, CategoryList, MessageType, OutboundMessage, ScanRequestType,
    ScanVerdict, Settings, TabAction,
};
use crate::referrer::ReferrerCache;
use crate::status::{
    derive_status, is_banking_site, is_shopping_site, shopping_rating, ProtectionStatus,
    TabId, TabState, TabStatusOrchestrator,
};

/// Result of a category lookup (`orspinfo`).
#[derive(Debug, Clone, Default)]
pub struct UrlInfo {
    pub url: Option<String>,
    pub categories: CategoryList,
    pub is_whitelisted: bool,
    pub is_blacklisted: bool,
}

/// Result of a whitelist check.
#[derive(Debug, Clone, Default)]
pub struct WhitelistInfo {
    pub whitelisted: bool,
    pub url: Option<String>,
}

/// Reputation lookup decorated for the search/popup UI.
#[derive(Debug, Clone)]
pub struct UrlRating {
    pub url: String,
    pub extension_name: String,
    pub show_rating_icon: bool,
    pub shopping_site: bool,
    pub banking_site: bool,
    pub trustworthiness: Option<i64>,
    pub unsafe_shopping: bool,
    /// Raw rating response for callers that render more than the flags.
    pub body: Value,
}

/// A tab known at init-handshake time.
#[derive(Debug, Clone)]
pub struct TabSnapshot {
    pub id: TabId,
    pub url: String,
}

struct ServiceInner {
    bridge: NativeMessagingBridge,
    status: TabStatusOrchestrator,
    ad_block: AdBlockRuleManager,
    referrers: Mutex<ReferrerCache>,
    settings: Mutex<Settings>,
    banking_mode: AtomicBool,
    customization_loaded: AtomicBool,
    extension: ExtensionInfo,
}

/// The extension's background service. Cheap to clone.
#[derive(Clone)]
pub struct ProtectionService {
    inner: Arc<ServiceInner>,
}

impl ProtectionService {
    pub fn new(
        bridge: NativeMessagingBridge,
        status: TabStatusOrchestrator,
        ad_block: AdBlockRuleManager,
        extension: ExtensionInfo,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                bridge,
                status,
                ad_block,
                referrers: Mutex::new(ReferrerCache::new()),
                settings: Mutex::new(Settings::default()),
                banking_mode: AtomicBool::new(false),
                customization_loaded: AtomicBool::new(false),
                extension,
            }),
        }
    }

    pub fn bridge(&self) -> &NativeMessagingBridge {
        &self.inner.bridge
    }

    pub fn status(&self) -> &TabStatusOrchestrator {
        &self.inner.status
    }

    pub fn ad_block(&self) -> &AdBlockRuleManager {
        &self.inner.ad_block
    }

    /// Start consuming bridge events. Must be running for settings pushes,
    /// banking mode, host restarts and disconnect handling to take effect.
    pub fn start(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let mut events = inner.bridge.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => inner.handle_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "bridge event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Run the init handshake: report identity and open tabs, record whether
    /// customization data is available, then release messages held for
    /// initialization. Returns false when the host gave no meaningful reply.
    pub async fn init(&self, platform: Value, open_tabs: Vec<TabSnapshot>) -> bool {
        let ext = &self.inner.extension;
        info!(
            name = %ext.name,
            version = %ext.version,
            browser = %ext.browser_name,
            "initializing extension backend"
        );
        let tabs: Vec<Value> = open_tabs
            .iter()
            .map(|t| json!({ "id": t.id, "url": t.url }))
            .collect();
        let msg = OutboundMessage::new(MessageType::Init)
            .with("browserName", Value::from(ext.browser_name.clone()))
            .with("extId", Value::from(ext.id.clone()))
            .with("extensionVersion", Value::from(ext.version.clone()))
            .with("platform", platform)
            .with("tabs", Value::from(tabs));
        let resp = self.inner.bridge.send(msg).await;
        let has_customization = resp
            .field("customization")
            .and_then(Value::as_object)
            .map(|m| !m.is_empty())
            .unwrap_or(false);
        if has_customization {
            self.inner.customization_loaded.store(true, Ordering::SeqCst);
        }
        self.inner.bridge.notify_initialized().await;
        !resp.is_empty()
    }

    /// Scan a navigated URL and drive the tab's status from the verdict.
    pub async fn scan(
        &self,
        url: &str,
        tab: Option<TabId>,
        referrer: Option<&str>,
    ) -> ProtectionStatus {
        let ext = &self.inner.extension;
        let mut scanrequest = json!({
            "url": url,
            "rqtype": ScanRequestType::PrimaryNoBanking.code(),
            "extVer": ext.version,
            "extName": ext.name,
        });
        if let Some(tab) = tab {
            scanrequest["tabId"] = Value::from(tab);
        }
        if let Some(referrer) = referrer {
            // the host expects the misspelled field
            scanrequest["referer"] = Value::from(referrer);
        }
        let resp = self
            .inner
            .bridge
            .send(OutboundMessage::new(MessageType::ScanRequest).with("scanrequest", scanrequest))
            .await;

        if resp.is_empty() {
            warn!(url, "scan got an empty response, treating host as down");
            self.inner
                .status
                .set_override(ProtectionStatus::Error)
                .await;
            if let Some(tab) = tab {
                self.inner
                    .status
                    .set_status(tab, ProtectionStatus::Error)
                    .await;
            }
            return ProtectionStatus::Error;
        }

        let verdict: ScanVerdict = resp.parse().unwrap_or_default();
        let trusted_shopping = self.inner.settings.lock().await.trusted_shopping;
        let state = derive_status(&verdict, trusted_shopping);
        debug!(url, ?state, "scan verdict derived");

        if let Some(tab) = tab {
            let tab_url = verdict
                .block
                .as_ref()
                .and_then(|b| b.url.clone())
                .unwrap_or_else(|| url.to_string());
            let block_page_url = verdict.block.as_ref().map(|b| self.block_page(b));
            self.inner
                .status
                .record_scan(
                    tab,
                    TabState {
                        url: tab_url,
                        block_page_url,
                        block: verdict.block.clone(),
                        categories: verdict.orsp_data.clone(),
                        referrer: referrer.map(str::to_string),
                        status: state,
                    },
                )
                .await;
        }
        state
    }

    /// Category lookup for a URL.
    pub async fn url_info(&self, url: &str) -> UrlInfo {
        let resp = self
            .inner
            .bridge
            .send(
                OutboundMessage::new(MessageType::OrspInfo)
                    .with("orspinfo", json!({ "url": url })),
            )
            .await;
        UrlInfo {
            url: resp
                .field("url")
                .and_then(Value::as_str)
                .map(str::to_string),
            categories: resp
                .field("categories")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default(),
            is_whitelisted: resp
                .field("isWhitelisted")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            is_blacklisted: resp
                .field("isBlacklisted")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }

    /// Ask whether the user has whitelisted a URL.
    pub async fn check_whitelist(&self, url: &str) -> WhitelistInfo {
        let resp = self
            .inner
            .bridge
            .send(
                OutboundMessage::new(MessageType::CheckWhitelist)
                    .with("checkwhitelist", json!({ "url": url })),
            )
            .await;
        match resp.field("info") {
            Some(info) => WhitelistInfo {
                whitelisted: info
                    .get("whitelisted")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                url: info.get("url").and_then(Value::as_str).map(str::to_string),
            },
            None => WhitelistInfo::default(),
        }
    }

    /// Reputation lookup, decorated with the flags the search-result and
    /// popup surfaces render.
    pub async fn rate_url(&self, url: &str) -> UrlRating {
        let resp = self
            .inner
            .bridge
            .send(
                OutboundMessage::new(MessageType::RatingRequest)
                    .with("ratingrequest", json!({ "url": url })),
            )
            .await;
        let orsp_data: CategoryList = resp
            .field("orspData")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let settings = self.inner.settings.lock().await.clone();
        let shopping_site = is_shopping_site(&orsp_data);
        let banking_site = is_banking_site(&orsp_data);
        let rating = shopping_rating(&orsp_data);
        let show_rating_icon = settings.search_results
            || (settings.trusted_shopping && shopping_site && rating.unwrap_or(0) > 0);
        let trustworthiness = if settings.trusted_shopping && shopping_site {
            rating
        } else {
            None
        };
        UrlRating {
            url: url.to_string(),
            extension_name: self.inner.extension.name.clone(),
            show_rating_icon,
            shopping_site,
            banking_site,
            trustworthiness,
            unsafe_shopping: trustworthiness == Some(1),
            body: resp.body,
        }
    }

    /// Forward a user's verdict on a page to the host. The host's
    /// acknowledgement is not interesting; the request is still correlated
    /// so a disconnect cleans it up.
    pub async fn submit_user_rating(&self, url: &str, verdict: &str, categories: Value, notes: &str) {
        let msg = OutboundMessage::new(MessageType::UserRating).with(
            "userrating",
            json!({
                "url": url,
                "verdict": verdict,
                "categories": categories,
                "notes": notes,
            }),
        );
        let bridge = self.inner.bridge.clone();
        tokio::spawn(async move {
            bridge.send(msg).await;
        });
    }

    /// Ask the host to allow a blocked domain.
    pub async fn allow_domain(&self, url: &str) {
        let msg = OutboundMessage::new(MessageType::AllowDomain)
            .with("allowdomain", json!({ "url": url }));
        let bridge = self.inner.bridge.clone();
        tokio::spawn(async move {
            bridge.send(msg).await;
        });
    }

    /// Fetch the host's debug snapshot.
    pub async fn debug_info(&self) -> Value {
        self.inner
            .bridge
            .send(OutboundMessage::new(MessageType::DebugInfo))
            .await
            .body
    }

    /// Report a referrer edge unless it was already reported. While the
    /// host's identity is unknown the dedup cache cannot be reset reliably,
    /// so every edge is reported.
    pub async fn note_referrer(&self, url: &str, referrer: &str) {
        let must_send = if !self.inner.bridge.is_server_id_valid().await {
            true
        } else {
            self.inner.referrers.lock().await.process(referrer, url)
        };
        if !must_send {
            return;
        }
        self.inner
            .bridge
            .notify(
                OutboundMessage::new(MessageType::Referrer)
                    .with("url", Value::from(url))
                    .with("referrer", Value::from(referrer)),
            )
            .await;
    }

    /// Learn an ad-serving domain from a sub-frame URL: look up its
    /// categories and add the host to the user block list when it rates as
    /// ad-serving. Returns whether the domain was added.
    pub async fn learn_ad_domain(&self, frame_url: &str) -> bool {
        let Some(host) = host_of(frame_url) else {
            return false;
        };
        if self
            .inner
            .ad_block
            .user_domains()
            .await
            .iter()
            .any(|d| d == &host)
        {
            return false;
        }
        let info = self.url_info(frame_url).await;
        self.inner
            .ad_block
            .learn_from_categories(&host, &info.categories)
            .await
    }

    // --- tab lifecycle -----------------------------------------------------

    pub async fn on_tab_created(&self, tab: TabId) {
        self.inner
            .status
            .set_status(tab, ProtectionStatus::Unknown)
            .await;
    }

    /// A tab became active. Unknown http(s) tabs get scanned; browser
    /// internal pages are marked Unknown.
    pub async fn on_tab_activated(&self, tab: TabId, url: Option<&str>) {
        if self.inner.status.is_known(tab).await {
            return;
        }
        match url {
            Some(u) if u.starts_with("http://") || u.starts_with("https://") => {
                self.scan(u, Some(tab), None).await;
            }
            Some(_) => {
                self.inner
                    .status
                    .set_status(tab, ProtectionStatus::Unknown)
                    .await;
            }
            None => {}
        }
    }

    /// A tab finished loading or changed; re-apply its indication, notify
    /// the host, and renew the status shown for block pages on reload.
    pub async fn on_tab_updated(&self, tab: TabId, url: Option<&str>) {
        self.inner.status.update(tab).await;
        if let Some(url) = url {
            self.tab_info(TabAction::Open, tab, Some(url), &[]).await;
        }
        if let Some(state) = self.inner.status.tab_state(tab).await {
            if let Some(block) = &state.block {
                let renewed = match block.kind {
                    BlockType::Banking => ProtectionStatus::Banking,
                    BlockType::Suspicious => ProtectionStatus::Warn,
                    _ => ProtectionStatus::Danger,
                };
                self.inner.status.set_status(tab, renewed).await;
            }
        }
    }

    pub async fn on_tab_completed(&self, tab: TabId, url: &str) {
        self.tab_info(TabAction::Complete, tab, Some(url), &[]).await;
    }

    pub async fn on_tab_removed(&self, tab: TabId, open_tabs: &[TabId]) {
        self.inner.status.remove(tab).await;
        self.tab_info(TabAction::Close, tab, None, open_tabs).await;
    }

    pub async fn on_tab_replaced(&self, added: TabId, removed: TabId) {
        self.inner.status.on_tab_replaced(added, removed).await;
    }

    async fn tab_info(&self, action: TabAction, tab: TabId, url: Option<&str>, open_tabs: &[TabId]) {
        let tabinfo = match (url, action) {
            (Some(url), _) => json!({ "action": action, "tabId": tab, "url": url }),
            (None, TabAction::Close) => {
                json!({ "action": action, "tabId": tab, "openTabs": open_tabs })
            }
            (None, _) => return,
        };
        self.inner
            .bridge
            .notify(OutboundMessage::new(MessageType::TabInfo).with("tabinfo", tabinfo))
            .await;
    }

    // --- state accessors ---------------------------------------------------

    pub async fn settings(&self) -> Settings {
        self.inner.settings.lock().await.clone()
    }

    pub fn banking_mode(&self) -> bool {
        self.inner.banking_mode.load(Ordering::SeqCst)
    }

    /// Block-page document for a block verdict. Without customization data
    /// only the general page can be rendered.
    fn block_page(&self, block: &BlockDescriptor) -> String {
        let kind = if self.inner.customization_loaded.load(Ordering::SeqCst) {
            block.kind
        } else {
            BlockType::General
        };
        block_page_path(kind).to_string()
    }
}

impl ServiceInner {
    async fn handle_event(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::Connected => {
                self.status.clear_override().await;
            }
            BridgeEvent::Disconnected => {
                self.status.set_override(ProtectionStatus::Error).await;
            }
            BridgeEvent::SettingsChanged(patch) => {
                let merged = {
                    let mut settings = self.settings.lock().await;
                    settings.merge(&patch);
                    settings.clone()
                };
                info!(block_ads = merged.block_ads, "settings updated");
                self.ad_block.configure(merged.block_ads).await;
            }
            BridgeEvent::BankingModeChanged(session) => {
                self.banking_mode.store(session.active, Ordering::SeqCst);
            }
            BridgeEvent::ServerRestarted => {
                self.referrers.lock().await.clear();
            }
        }
    }
}

/// Block-page document shown for each block type.
pub fn block_page_path(kind: BlockType) -> &'static str {
    match kind {
        BlockType::Banking => "block_pages/block_banking.html",
        BlockType::Category => "block_pages/block_category.html",
        BlockType::Child => "block_pages/block_child.html",
        BlockType::Denied => "block_pages/block_denied.html",
        BlockType::Harmful => "block_pages/block_harmful.html",
        BlockType::Illegal => "block_pages/block_illegal.html",
        BlockType::Suspicious => "block_pages/block_suspicious.html",
        BlockType::Allowed | BlockType::General | BlockType::Unknown => {
            "block_pages/block_general.html"
        }
    }
}

fn host_of(raw: &str) -> Option<String> {
    Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}
