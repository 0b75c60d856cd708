//! Declarative ad-block rule management.
//!
//! The rule set is recomputed from three inputs — the static domain list
//! shipped with the crate, domains learned at runtime from category lookups,
//! and per-site exclusions — and installed into the browser's rule store as a
//! replace-by-id operation. Rule ids are partitioned into reserved ranges so
//! partial updates never collide:
//!
//! - [`RULE_ID_AD_BLOCK`] — the general request-domain block rule
//! - [`RULE_ID_AD_BLOCK_SEARCH`] — search-engine ad redirectors
//! - [`RULE_ID_AD_BLOCK_DOMAIN_BASE`] and up — one-rule-per-domain range for
//!   platforms whose rule engine cannot express a domain list in a single
//!   rule; free ids are found by linear scan over the occupied range

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::protocol::CategoryList;

pub const RULE_ID_AD_BLOCK: u32 = 101;
pub const RULE_ID_AD_BLOCK_SEARCH: u32 = 102;
pub const RULE_ID_AD_BLOCK_DOMAIN_BASE: u32 = 200;

/// Category keys that mark a domain as ad-serving.
const AD_SERVING_CATEGORIES: [&str; 2] = ["adserving", "fso_adserving"];

#[derive(Debug, Error)]
pub enum RuleStoreError {
    #[error("rule store rejected update: {0}")]
    Rejected(String),
    #[error("rule store unavailable")]
    Unavailable,
}

/// One declarative block-rule record as the rule store consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRule {
    pub id: u32,
    pub priority: u32,
    pub action: RuleAction,
    pub condition: RuleCondition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleAction {
    #[serde(rename = "type")]
    pub kind: RuleActionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleActionKind {
    Block,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCondition {
    #[serde(rename = "requestDomains", skip_serializing_if = "Option::is_none")]
    pub request_domains: Option<Vec<String>>,
    #[serde(rename = "urlFilter", skip_serializing_if = "Option::is_none")]
    pub url_filter: Option<String>,
    #[serde(rename = "resourceTypes")]
    pub resource_types: Vec<ResourceType>,
    #[serde(
        rename = "excludedInitiatorDomains",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub excluded_initiator_domains: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    MainFrame,
    SubFrame,
    Stylesheet,
    Script,
    Image,
    Xmlhttprequest,
    Media,
}

/// The browser's declarative rule store. Installation mechanics are the
/// platform's business; this crate only issues replace-by-id operations and
/// reads the installed set back.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Remove `remove_ids` and install `add` in one operation.
    async fn replace(&self, add: Vec<BlockRule>, remove_ids: Vec<u32>)
        -> Result<(), RuleStoreError>;
    async fn rules(&self) -> Result<Vec<BlockRule>, RuleStoreError>;
}

struct DomainLists {
    static_domains: Vec<String>,
    user_domains: Vec<String>,
    excluded: Vec<String>,
    search_filter: String,
}

/// Keeps the installed rule set in sync with the domain lists. At most one
/// rule application runs at a time; a call that finds one in flight is a
/// no-op, so the store reflects the most recently completed run only.
pub struct AdBlockRuleManager {
    store: Arc<dyn RuleStore>,
    lists: Mutex<DomainLists>,
    enabled: AtomicBool,
    busy: AtomicBool,
    per_domain_rules: bool,
}

impl AdBlockRuleManager {
    pub fn new(
        store: Arc<dyn RuleStore>,
        static_domains: Vec<String>,
        search_filter: String,
    ) -> Self {
        Self {
            store,
            lists: Mutex::new(DomainLists {
                static_domains,
                user_domains: Vec::new(),
                excluded: Vec::new(),
                search_filter,
            }),
            enabled: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            per_domain_rules: false,
        }
    }

    /// Also maintain the one-rule-per-domain range for platforms that need
    /// it.
    pub fn with_per_domain_rules(mut self) -> Self {
        self.per_domain_rules = true;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub async fn set_exclusions(&self, excluded: Vec<String>) {
        self.lists.lock().await.excluded = excluded;
    }

    pub async fn user_domains(&self) -> Vec<String> {
        self.lists.lock().await.user_domains.clone()
    }

    pub async fn excluded_domains(&self) -> Vec<String> {
        self.lists.lock().await.excluded.clone()
    }

    pub async fn is_blockable(&self, domain: &str, initiator: &str) -> bool {
        let lists = self.lists.lock().await;
        if lists.excluded.iter().any(|d| d == initiator) {
            return false;
        }
        lists.static_domains.iter().any(|d| d == domain)
            || lists.user_domains.iter().any(|d| d == domain)
    }

    /// Recompute the rule set from the current lists and install it. A
    /// second call while one is in flight returns immediately.
    pub async fn apply_rules(&self) {
        if self.busy.swap(true, Ordering::SeqCst) {
            debug!("rule application already in flight");
            return;
        }
        self.apply_rules_inner().await;
        self.busy.store(false, Ordering::SeqCst);
    }

    async fn apply_rules_inner(&self) {
        let (rules, all_domains) = {
            let lists = self.lists.lock().await;
            let mut domains = lists.static_domains.clone();
            domains.extend(lists.user_domains.iter().cloned());
            let rules = vec![
                BlockRule {
                    id: RULE_ID_AD_BLOCK,
                    priority: 1,
                    action: RuleAction {
                        kind: RuleActionKind::Block,
                    },
                    condition: RuleCondition {
                        request_domains: Some(domains.clone()),
                        url_filter: None,
                        resource_types: vec![
                            ResourceType::SubFrame,
                            ResourceType::Script,
                            ResourceType::Image,
                        ],
                        excluded_initiator_domains: lists.excluded.clone(),
                    },
                },
                BlockRule {
                    id: RULE_ID_AD_BLOCK_SEARCH,
                    priority: 1,
                    action: RuleAction {
                        kind: RuleActionKind::Block,
                    },
                    condition: RuleCondition {
                        request_domains: None,
                        url_filter: Some(lists.search_filter.clone()),
                        resource_types: vec![ResourceType::SubFrame],
                        excluded_initiator_domains: Vec::new(),
                    },
                },
            ];
            (rules, domains)
        };
        let remove_ids = rules.iter().map(|r| r.id).collect();
        if let Err(err) = self.store.replace(rules, remove_ids).await {
            warn!(error = %err, "installing ad-block rules failed");
            return;
        }
        if self.per_domain_rules {
            self.apply_per_domain_rules(&all_domains).await;
        }
    }

    /// Maintain the per-domain rule range: one `||domain` rule per blocked
    /// domain, reusing an existing rule's id when its resource coverage
    /// needs widening, otherwise taking the next free id above the occupied
    /// range.
    async fn apply_per_domain_rules(&self, domains: &[String]) {
        let existing = match self.store.rules().await {
            Ok(rules) => rules,
            Err(err) => {
                warn!(error = %err, "reading installed rules failed");
                return;
            }
        };
        let current: Vec<&BlockRule> = existing
            .iter()
            .filter(|r| r.id >= RULE_ID_AD_BLOCK_DOMAIN_BASE)
            .collect();
        let mut fresh: Vec<BlockRule> = Vec::new();
        for domain in domains {
            let filter = format!("||{domain}");
            let matched = current
                .iter()
                .find(|r| r.condition.url_filter.as_deref() == Some(filter.as_str()));
            let mut id =
                RULE_ID_AD_BLOCK_DOMAIN_BASE + current.len() as u32 + fresh.len() as u32;
            if let Some(rule) = matched {
                if rule.condition.resource_types.len() < 2 {
                    // widen the existing rule in place
                    id = rule.id;
                } else {
                    continue;
                }
            }
            fresh.push(per_domain_rule(id, domain));
        }
        if fresh.is_empty() {
            return;
        }
        let ids = fresh.iter().map(|r| r.id).collect();
        if let Err(err) = self.store.replace(fresh, ids).await {
            warn!(error = %err, "installing per-domain rules failed");
        }
    }

    /// Enable or disable blocking. Disabling removes every rule this
    /// manager owns, including the per-domain range.
    pub async fn configure(&self, enable: bool) {
        if self.enabled.load(Ordering::SeqCst) == enable {
            return;
        }
        info!(enable, "configuring ad blocker");
        if enable {
            self.apply_rules().await;
            self.enabled.store(true, Ordering::SeqCst);
        } else {
            let mut remove_ids = vec![RULE_ID_AD_BLOCK, RULE_ID_AD_BLOCK_SEARCH];
            if self.per_domain_rules {
                match self.store.rules().await {
                    Ok(rules) => remove_ids.extend(
                        rules
                            .iter()
                            .filter(|r| r.id >= RULE_ID_AD_BLOCK_DOMAIN_BASE)
                            .map(|r| r.id),
                    ),
                    Err(err) => warn!(error = %err, "reading installed rules failed"),
                }
            }
            if let Err(err) = self.store.replace(Vec::new(), remove_ids).await {
                warn!(error = %err, "removing ad-block rules failed");
            }
            self.enabled.store(false, Ordering::SeqCst);
        }
    }

    /// Record a newly learned ad-serving domain and refresh the rules.
    pub async fn learn_domain(&self, domain: &str) {
        {
            let mut lists = self.lists.lock().await;
            if lists.user_domains.iter().any(|d| d == domain)
                || lists.static_domains.iter().any(|d| d == domain)
            {
                return;
            }
            info!(domain, "learned new ad-serving domain");
            lists.user_domains.push(domain.to_string());
        }
        self.apply_rules().await;
    }

    /// Learn from a category lookup: if the categories mark the domain as
    /// ad-serving, add it to the user list. Returns whether it was added.
    pub async fn learn_from_categories(&self, domain: &str, categories: &CategoryList) -> bool {
        let ad_serving = categories.iter().any(|entry| {
            entry
                .keys()
                .any(|key| AD_SERVING_CATEGORIES.contains(&key.as_str()))
        });
        if !ad_serving {
            return false;
        }
        self.learn_domain(domain).await;
        true
    }
}

fn per_domain_rule(id: u32, domain: &str) -> BlockRule {
    BlockRule {
        id,
        priority: 1,
        action: RuleAction {
            kind: RuleActionKind::Block,
        },
        condition: RuleCondition {
            request_domains: None,
            url_filter: Some(format!("||{domain}")),
            resource_types: vec![
                ResourceType::SubFrame,
                ResourceType::Script,
                ResourceType::Image,
            ],
            excluded_initiator_domains: Vec::new(),
        },
    }
}
