//! Per-tab protection status.
//!
//! Each tracked tab carries the state of its last top-level navigation scan
//! and a derived [`ProtectionStatus`]. A process-wide override (set while
//! the host is unreachable) supersedes every per-tab status until cleared.
//! Every transition pushes exactly one icon/title/popup batch through the
//! [`StatusSink`], including re-entries into the same status — callers rely
//! on forced re-application.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::protocol::{category_value, BlockDescriptor, BlockType, CategoryList, ScanVerdict};

pub type TabId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtectionStatus {
    #[default]
    Unknown,
    Safe,
    Warn,
    Danger,
    Banking,
    Info,
    Error,
    TrustedShoppingWarning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IconTheme {
    #[default]
    Light,
    Dark,
}

/// One icon/title/popup batch. The three values are applied together and
/// must be treated as atomic per transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusIndication {
    pub icon: &'static str,
    pub title: Option<&'static str>,
    pub popup: Option<&'static str>,
}

const MAIN_POPUP: &str = "menu/main.html";
const ERROR_POPUP: &str = "menu/error_status.html";

fn icon(theme: IconTheme, flavor: &'static str) -> &'static str {
    match (flavor, theme) {
        ("okay", IconTheme::Light) => "img/ic_browsing_extension_light_okay.png",
        ("okay", IconTheme::Dark) => "img/ic_browsing_extension_dark_okay.png",
        ("warning", IconTheme::Light) => "img/ic_browsing_extension_light_warning.png",
        ("warning", IconTheme::Dark) => "img/ic_browsing_extension_dark_warning.png",
        ("danger", IconTheme::Light) => "img/ic_browsing_extension_light_danger.png",
        ("danger", IconTheme::Dark) => "img/ic_browsing_extension_dark_danger.png",
        ("informative", IconTheme::Light) => "img/ic_browsing_extension_light_informative.png",
        ("informative", IconTheme::Dark) => "img/ic_browsing_extension_dark_informative.png",
        (_, IconTheme::Light) => "img/ic_browsing_extension_light_unknown.png",
        (_, IconTheme::Dark) => "img/ic_browsing_extension_dark_unknown.png",
    }
}

/// Icon/title/popup triple shown for a status.
pub fn indication_for(status: ProtectionStatus, theme: IconTheme) -> StatusIndication {
    match status {
        ProtectionStatus::Safe => StatusIndication {
            icon: icon(theme, "okay"),
            title: Some("search_rating_safe_p1"),
            popup: Some(MAIN_POPUP),
        },
        ProtectionStatus::Warn => StatusIndication {
            icon: icon(theme, "warning"),
            title: Some("search_rating_suspicious_p1"),
            popup: Some(MAIN_POPUP),
        },
        ProtectionStatus::TrustedShoppingWarning => StatusIndication {
            icon: icon(theme, "warning"),
            title: Some("search_rating_shopping_suspicious"),
            popup: Some(MAIN_POPUP),
        },
        ProtectionStatus::Unknown => StatusIndication {
            icon: icon(theme, "unknown"),
            title: Some("search_rating_unknown"),
            popup: Some(MAIN_POPUP),
        },
        ProtectionStatus::Info => StatusIndication {
            icon: icon(theme, "informative"),
            title: Some("search_rating_allowed"),
            popup: Some(MAIN_POPUP),
        },
        ProtectionStatus::Banking => StatusIndication {
            icon: icon(theme, "informative"),
            title: Some("search_rating_banking"),
            popup: Some(MAIN_POPUP),
        },
        ProtectionStatus::Danger => StatusIndication {
            icon: icon(theme, "danger"),
            title: Some("search_rating_harmful_p1"),
            popup: Some(MAIN_POPUP),
        },
        ProtectionStatus::Error => StatusIndication {
            icon: icon(theme, "danger"),
            title: Some("error_ca_text_p1"),
            popup: Some(ERROR_POPUP),
        },
    }
}

/// Applies indications to the browser's per-tab action. The three calls
/// behind `apply` (icon, title, popup) are the platform's business.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn apply(&self, tab_id: TabId, indication: &StatusIndication);
    /// Currently assigned popup document for the tab, if any.
    async fn popup(&self, tab_id: TabId) -> Option<String>;
}

/// State recorded for one tab, replaced on every top-level navigation scan.
#[derive(Debug, Clone, Default)]
pub struct TabState {
    pub url: String,
    pub block_page_url: Option<String>,
    pub block: Option<BlockDescriptor>,
    pub categories: CategoryList,
    pub referrer: Option<String>,
    pub status: ProtectionStatus,
}

struct Tabs {
    states: HashMap<TabId, TabState>,
    override_status: ProtectionStatus,
}

/// Per-tab state machine driving the visible protection status.
pub struct TabStatusOrchestrator {
    sink: Arc<dyn StatusSink>,
    theme: IconTheme,
    tabs: Mutex<Tabs>,
}

impl TabStatusOrchestrator {
    pub fn new(sink: Arc<dyn StatusSink>, theme: IconTheme) -> Self {
        Self {
            sink,
            theme,
            tabs: Mutex::new(Tabs {
                states: HashMap::new(),
                override_status: ProtectionStatus::Unknown,
            }),
        }
    }

    /// Record a full scan outcome for a tab and update its indication.
    pub async fn record_scan(&self, tab_id: TabId, state: TabState) {
        let effective = {
            let mut tabs = self.tabs.lock().await;
            info!(tab_id, status = ?state.status, "recording scan result");
            tabs.states.insert(tab_id, state);
            self.effective_status(&tabs, tab_id)
        };
        self.apply(tab_id, effective).await;
    }

    /// Set only the derived status for a tab, keeping other recorded state.
    pub async fn set_status(&self, tab_id: TabId, status: ProtectionStatus) {
        let effective = {
            let mut tabs = self.tabs.lock().await;
            info!(tab_id, ?status, "setting tab status");
            tabs.states.entry(tab_id).or_default().status = status;
            self.effective_status(&tabs, tab_id)
        };
        self.apply(tab_id, effective).await;
    }

    pub async fn remove(&self, tab_id: TabId) {
        debug!(tab_id, "removing tab state");
        self.tabs.lock().await.states.remove(&tab_id);
    }

    pub async fn is_known(&self, tab_id: TabId) -> bool {
        self.tabs.lock().await.states.contains_key(&tab_id)
    }

    pub async fn tab_state(&self, tab_id: TabId) -> Option<TabState> {
        self.tabs.lock().await.states.get(&tab_id).cloned()
    }

    /// Transfer a tab's state across a tab-identity swap. Only tabs with a
    /// block-page association move; the removed id's entry is deleted, not
    /// copied.
    pub async fn on_tab_replaced(&self, added_id: TabId, removed_id: TabId) {
        let effective = {
            let mut tabs = self.tabs.lock().await;
            let carries_block = tabs
                .states
                .get(&removed_id)
                .map(|s| s.block_page_url.is_some())
                .unwrap_or(false);
            if !carries_block {
                return;
            }
            info!(removed_id, added_id, "moving block page state to new tab id");
            if let Some(state) = tabs.states.remove(&removed_id) {
                tabs.states.insert(added_id, state);
            }
            self.effective_status(&tabs, added_id)
        };
        self.apply(added_id, effective).await;
    }

    /// Set the process-wide override and re-apply every known tab.
    pub async fn set_override(&self, status: ProtectionStatus) {
        let updates: Vec<(TabId, Option<ProtectionStatus>)> = {
            let mut tabs = self.tabs.lock().await;
            info!(?status, "setting status override");
            tabs.override_status = status;
            let ids: Vec<TabId> = tabs.states.keys().copied().collect();
            ids.into_iter()
                .map(|id| (id, self.effective_status(&tabs, id)))
                .collect()
        };
        for (tab_id, effective) in updates {
            self.apply(tab_id, effective).await;
        }
    }

    pub async fn clear_override(&self) {
        {
            let tabs = self.tabs.lock().await;
            if tabs.override_status == ProtectionStatus::Unknown {
                return;
            }
        }
        info!("clearing status override");
        self.set_override(ProtectionStatus::Unknown).await;
    }

    /// Re-apply the indication for a tab's current effective status.
    pub async fn update(&self, tab_id: TabId) {
        let effective = {
            let tabs = self.tabs.lock().await;
            self.effective_status(&tabs, tab_id)
        };
        self.apply(tab_id, effective).await;
    }

    fn effective_status(&self, tabs: &Tabs, tab_id: TabId) -> Option<ProtectionStatus> {
        if tabs.override_status != ProtectionStatus::Unknown {
            return Some(tabs.override_status);
        }
        tabs.states.get(&tab_id).map(|s| s.status)
    }

    async fn apply(&self, tab_id: TabId, effective: Option<ProtectionStatus>) {
        let Some(status) = effective else {
            debug!(tab_id, "no status recorded for tab, skipping update");
            return;
        };
        let indication = indication_for(status, self.theme);
        self.sink.apply(tab_id, &indication).await;
        if status == ProtectionStatus::Danger {
            // the platform occasionally loses the popup assignment on the
            // danger path; verify and re-apply once
            let assigned = self.sink.popup(tab_id).await;
            if assigned.as_deref() != Some(MAIN_POPUP) {
                warn!(tab_id, "popup assignment missing, re-applying");
                self.sink.apply(tab_id, &indication).await;
            }
        }
    }
}

/// Derive a tab status from a scan verdict. Whitelist wins over blacklist,
/// blacklist over block descriptors, block descriptors over category data.
pub fn derive_status(verdict: &ScanVerdict, trusted_shopping: bool) -> ProtectionStatus {
    if verdict.is_whitelisted {
        return ProtectionStatus::Info;
    }
    if verdict.is_blacklisted {
        return ProtectionStatus::Danger;
    }
    if let Some(block) = &verdict.block {
        return match block.kind {
            BlockType::Banking => ProtectionStatus::Banking,
            BlockType::Suspicious => ProtectionStatus::Warn,
            _ => ProtectionStatus::Danger,
        };
    }
    if verdict.orsp_data.is_empty() {
        return ProtectionStatus::Unknown;
    }
    let mut status = safety_status(category_value("safe", &verdict.orsp_data).unwrap_or(0));
    if trusted_shopping {
        match shopping_rating(&verdict.orsp_data) {
            Some(2) | Some(3) => status = ProtectionStatus::TrustedShoppingWarning,
            Some(rating) if rating >= 4 => status = ProtectionStatus::Safe,
            _ => {}
        }
    }
    status
}

/// Map the reputation service's `safe` category value onto a status.
pub fn safety_status(safe_value: i64) -> ProtectionStatus {
    match safe_value {
        -100 | -80 => ProtectionStatus::Danger,
        -20 => ProtectionStatus::Warn,
        100 => ProtectionStatus::Safe,
        _ => ProtectionStatus::Unknown,
    }
}

const BANK_CATEGORIES: [&str; 6] = [
    "banking",
    "paymentservice",
    "financial",
    "banking_login",
    "fso_banking",
    "fso_paymentservice",
];

pub fn is_banking_site(categories: &CategoryList) -> bool {
    categories.iter().any(|entry| {
        entry
            .keys()
            .any(|key| BANK_CATEGORIES.contains(&key.as_str()))
    })
}

pub fn is_shopping_site(categories: &CategoryList) -> bool {
    category_value("shopping", categories) == Some(100)
        || category_value("shopping_and_auctions", categories) == Some(100)
}

/// Trustworthiness sub-rating for shopping sites; `None` when the site is
/// not a shopping site or carries no rating.
pub fn shopping_rating(categories: &CategoryList) -> Option<i64> {
    if !is_shopping_site(categories) {
        return None;
    }
    category_value("trustworthiness", categories)
}
