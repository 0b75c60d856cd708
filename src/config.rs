//! Tuning knobs and the embedded default block list.

use std::time::Duration;

use once_cell::sync::Lazy;
use serde::Deserialize;

/// Bridge connection tuning.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Window within which repeated failures suppress new attempts.
    pub reconnect_cooldown: Duration,
    /// Failure count that must be exceeded before attempts are suppressed.
    pub max_connect_failures: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            reconnect_cooldown: Duration::from_secs(10),
            max_connect_failures: 10,
        }
    }
}

/// Identity the service reports to the host during the init handshake and
/// stamps on scan requests.
#[derive(Debug, Clone)]
pub struct ExtensionInfo {
    pub name: String,
    pub version: String,
    pub id: String,
    pub browser_name: String,
}

/// Parsed `data/blocklist.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockListConfig {
    /// Domains blocked by the general ad-block rule.
    pub domains: Vec<String>,
    pub search: SearchFilter,
}

/// Search-engine ad redirectors matched by URL substring.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchFilter {
    pub url_filter: String,
}

static DEFAULT_BLOCK_LIST: Lazy<BlockListConfig> = Lazy::new(|| {
    toml::from_str(include_str!("../data/blocklist.toml"))
        .expect("embedded blocklist.toml is well-formed")
});

/// The block list compiled into the crate; callers may substitute their own.
pub fn default_block_list() -> &'static BlockListConfig {
    &DEFAULT_BLOCK_LIST
}
