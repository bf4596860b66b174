//! Node catalog
//!
//! Fetches the server list from the control API, keeps it sorted by load, and
//! answers selection queries (best by load, random, free-text search) without
//! another round trip.
//!
//! A failed refresh never empties the catalog: the previous snapshot stays
//! available and is marked stale.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::protocol::Protocol;
use crate::backend::Backend;
use crate::error::SdkError;

/// Nodes under this load are advertised as P2P friendly.
const P2P_MAX_LOAD: f64 = 60.0;

/// A VPN server as reported by the control API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub country: String,
    pub country_code: String,
    pub city: String,
    pub public_ip: String,
    pub latitude: f64,
    pub longitude: f64,
    pub status: String,
    pub is_active: bool,
    /// Backend-computed congestion metric, 0-100. Lower is better.
    pub load_score: f64,
    /// Milliseconds.
    pub latency: u32,
    pub current_connections: u32,
    pub max_connections: u32,
    pub supports_wireguard: bool,
    pub supports_openvpn: bool,
    pub wireguard_port: u16,
    pub openvpn_port: u16,
    pub uptime_percentage: f64,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Node {
    pub fn supports(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Wireguard => self.supports_wireguard,
            Protocol::Openvpn => self.supports_openvpn,
        }
    }

    pub fn port_for(&self, protocol: Protocol) -> Option<u16> {
        let port = match protocol {
            Protocol::Wireguard => self.wireguard_port,
            Protocol::Openvpn => self.openvpn_port,
        };
        (self.supports(protocol) && port != 0).then_some(port)
    }

    pub fn load_level(&self) -> LoadLevel {
        LoadLevel::from_score(self.load_score)
    }

    /// Case-insensitive match against country, city and name.
    pub fn matches_text(&self, needle_lower: &str) -> bool {
        self.country.to_lowercase().contains(needle_lower)
            || self.city.to_lowercase().contains(needle_lower)
            || self.name.to_lowercase().contains(needle_lower)
    }
}

/// Coarse load bucket for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadLevel {
    Low,
    Medium,
    High,
}

impl LoadLevel {
    pub fn from_score(score: f64) -> Self {
        let load = score.round();
        if load > 80.0 {
            LoadLevel::High
        } else if load > 50.0 {
            LoadLevel::Medium
        } else {
            LoadLevel::Low
        }
    }
}

/// Where the cached catalog came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogSource {
    /// Never refreshed
    Loading,
    /// Last refresh succeeded
    Api,
    /// Last refresh failed; serving the previous snapshot
    Stale(String),
    /// Last refresh failed and there is nothing cached
    Error(String),
}

impl std::fmt::Display for CatalogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogSource::Loading => write!(f, "Loading..."),
            CatalogSource::Api => write!(f, "API"),
            CatalogSource::Stale(_) => write!(f, "Stale"),
            CatalogSource::Error(msg) => write!(f, "Error: {}", msg),
        }
    }
}

/// Cached, load-sorted server list.
pub struct NodeCatalog {
    nodes: Vec<Arc<Node>>,
    source: CatalogSource,
}

impl NodeCatalog {
    pub fn new_empty() -> Self {
        Self {
            nodes: Vec::new(),
            source: CatalogSource::Loading,
        }
    }

    /// Re-fetch the catalog and replace the cache wholesale.
    ///
    /// On failure the previous snapshot is kept and the error returned.
    pub async fn refresh(
        &mut self,
        backend: &dyn Backend,
        country: Option<&str>,
        protocol: Option<Protocol>,
    ) -> Result<Vec<Arc<Node>>, SdkError> {
        match backend.get_nodes(country, protocol).await {
            Ok(nodes) => {
                self.replace(nodes);
                log::info!("Loaded {} nodes", self.nodes.len());
                Ok(self.nodes.clone())
            }
            Err(e) => {
                let reason = e.to_string();
                if self.nodes.is_empty() {
                    log::error!("Failed to load nodes: {}", reason);
                    self.source = CatalogSource::Error(reason);
                } else {
                    log::warn!(
                        "Failed to refresh nodes, keeping {} cached: {}",
                        self.nodes.len(),
                        reason
                    );
                    self.source = CatalogSource::Stale(reason);
                }
                Err(e)
            }
        }
    }

    /// Install a fresh snapshot, sorted by ascending load.
    pub fn replace(&mut self, mut nodes: Vec<Node>) {
        // Stable: nodes with equal load keep backend order.
        nodes.sort_by(|a, b| a.load_score.total_cmp(&b.load_score));
        self.nodes = nodes.into_iter().map(Arc::new).collect();
        self.source = CatalogSource::Api;
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn source(&self) -> &CatalogSource {
        &self.source
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.iter().find(|n| n.id == id).cloned()
    }

    pub fn filter<P>(&self, predicate: P) -> Vec<Arc<Node>>
    where
        P: Fn(&Node) -> bool,
    {
        self.nodes.iter().filter(|n| predicate(n)).cloned().collect()
    }

    /// Free-text filter over country, city and name.
    pub fn search(&self, text: &str) -> Vec<Arc<Node>> {
        let needle = text.trim().to_lowercase();
        if needle.is_empty() {
            return self.nodes.clone();
        }
        self.filter(|n| n.matches_text(&needle))
    }

    pub fn p2p_friendly(&self) -> Vec<Arc<Node>> {
        self.filter(|n| n.load_score < P2P_MAX_LOAD)
    }
}

impl Default for NodeCatalog {
    fn default() -> Self {
        Self::new_empty()
    }
}

/// Node with the lowest load; the first one wins a tie.
pub fn best_by_load(nodes: &[Arc<Node>]) -> Result<Arc<Node>, SdkError> {
    let mut iter = nodes.iter();
    let mut best = iter.next().ok_or(SdkError::EmptyCatalog)?;
    for node in iter {
        if node.load_score < best.load_score {
            best = node;
        }
    }
    Ok(Arc::clone(best))
}

/// Uniformly random node.
pub fn random_pick(nodes: &[Arc<Node>]) -> Result<Arc<Node>, SdkError> {
    nodes
        .choose(&mut rand::thread_rng())
        .cloned()
        .ok_or(SdkError::EmptyCatalog)
}
