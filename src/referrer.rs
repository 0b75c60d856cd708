//! Deduplication of referrer notifications.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};
use url::Url;

/// Remembers which (referrer host, destination host) pairs have already been
/// reported. `process` answers "should this pair be reported now": true the
/// first time a pair is seen, false afterwards. Navigation within one host
/// is never reported. Cleared when the host process restarts, since its side
/// of the dedup state is gone.
#[derive(Debug, Default)]
pub struct ReferrerCache {
    edges: HashMap<String, HashSet<String>>,
}

impl ReferrerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        info!("clearing referrer cache");
        self.edges.clear();
    }

    pub fn process(&mut self, referrer: &str, destination: &str) -> bool {
        let (ref_host, dest_host) = match (host_of(referrer), host_of(destination)) {
            (Some(r), Some(d)) => (r, d),
            _ => {
                debug!("invalid URL in referrer pair");
                return false;
            }
        };
        if ref_host == dest_host {
            return false;
        }
        self.edges.entry(ref_host).or_default().insert(dest_host)
    }

    pub fn len(&self) -> usize {
        self.edges.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

fn host_of(raw: &str) -> Option<String> {
    Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}
