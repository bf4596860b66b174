//! The client aggregate: node catalog, settings, connection state machine and
//! backend behind one owner. The C API hands this out as an opaque handle.

use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::backend::{Backend, HttpBackend, MemoryBackend, UserStats};
use crate::config::ClientConfig;
use crate::error::SdkError;
use crate::settings::{default_settings_path, SettingsStore};
use crate::vpn::connection::{
    with_timeout, ConnectOutcome, ConnectionEvent, ConnectionManager, ConnectionOptions,
    ConnectionState,
};
use crate::vpn::nodes::{best_by_load, random_pick, Node, NodeCatalog};
use crate::vpn::protocol::{self, Protocol};

/// How the node for a connect is chosen.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectionPolicy {
    /// Lowest load in the whole catalog.
    Quick,
    /// Same rule as `Quick`.
    Secure,
    Random,
    Manual(Arc<Node>),
    /// Whatever `select_node` picked last.
    Selected,
}

impl SelectionPolicy {
    /// FFI code: 0 quick, 1 secure, 2 random, 3 selected.
    pub fn from_code(code: i32) -> Result<Self, SdkError> {
        match code {
            0 => Ok(SelectionPolicy::Quick),
            1 => Ok(SelectionPolicy::Secure),
            2 => Ok(SelectionPolicy::Random),
            3 => Ok(SelectionPolicy::Selected),
            other => Err(SdkError::InvalidParam(format!("Unknown selection policy: {}", other))),
        }
    }
}

impl FromStr for SelectionPolicy {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(SelectionPolicy::Quick),
            "secure" => Ok(SelectionPolicy::Secure),
            "random" => Ok(SelectionPolicy::Random),
            "selected" => Ok(SelectionPolicy::Selected),
            other => Err(SdkError::InvalidParam(format!("Unknown selection policy: {}", other))),
        }
    }
}

pub struct VpnClient {
    backend: Arc<dyn Backend>,
    catalog: NodeCatalog,
    settings: SettingsStore,
    connection: ConnectionManager,
}

impl VpnClient {
    /// Build a client from `config`: the in-process backend when simulating,
    /// the control API otherwise.
    pub fn new(config: &ClientConfig) -> Result<Self, SdkError> {
        config.validate()?;

        let backend: Arc<dyn Backend> = if config.simulate {
            log::info!("Simulation mode: using in-process backend");
            Arc::new(MemoryBackend::simulated())
        } else {
            Arc::new(HttpBackend::new(
                &config.api_url,
                config.access_token.clone(),
                config.request_timeout(),
            )?)
        };

        let settings = match config.settings_path.clone().or_else(default_settings_path) {
            Some(path) => SettingsStore::load(path),
            None => {
                log::warn!("No config directory available; settings will not be saved");
                SettingsStore::in_memory()
            }
        };

        Ok(Self::with_backend(backend, settings, config.connection_options()))
    }

    pub fn with_backend(
        backend: Arc<dyn Backend>,
        settings: SettingsStore,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            connection: ConnectionManager::new(Arc::clone(&backend), options),
            backend,
            catalog: NodeCatalog::new_empty(),
            settings,
        }
    }

    /// Load the catalog, take over a tunnel that is already up and otherwise,
    /// if auto-connect is on, quick-connect.
    ///
    /// A failed initial refresh is not fatal; the catalog just stays empty.
    pub async fn start(&mut self) -> Result<Option<ConnectOutcome>, SdkError> {
        if let Err(e) = self.refresh_nodes(None, None).await {
            log::warn!("Initial node refresh failed: {}", e);
        }
        match self.resume_existing().await {
            Ok(Some(outcome)) => return Ok(Some(outcome)),
            Ok(None) => {}
            Err(e) => log::warn!("Could not check for an existing connection: {}", e),
        }
        if !self.settings.settings().autoconnect {
            return Ok(None);
        }
        log::info!("Auto-connect enabled");
        self.connect(SelectionPolicy::Quick).await.map(Some)
    }

    /// Adopt the backend's running tunnel, if it has one. `Ok(None)` when the
    /// backend reports no connection.
    pub async fn resume_existing(&mut self) -> Result<Option<ConnectOutcome>, SdkError> {
        let timeout = self.connection.options().request_timeout;
        if !with_timeout(timeout, "status check", self.backend.is_connected()).await? {
            return Ok(None);
        }

        let stats = with_timeout(timeout, "stats query", self.backend.vpn_stats()).await?;
        let session =
            match with_timeout(timeout, "session query", self.backend.current_session()).await {
                Ok(session) => Some(session),
                Err(e) => {
                    log::debug!("No session record for the running tunnel: {}", e);
                    None
                }
            };

        let node_id = match (stats.node_id.is_empty(), session.as_ref()) {
            (true, Some(session)) => session.node_id.clone(),
            _ => stats.node_id.clone(),
        };
        let node = self.catalog.get(&node_id).unwrap_or_else(|| {
            log::warn!("Running tunnel is on {} which is not in the catalog", node_id);
            let name = if stats.node_name.is_empty() {
                node_id.clone()
            } else {
                stats.node_name.clone()
            };
            Arc::new(Node {
                id: node_id.clone(),
                name,
                ..Node::default()
            })
        });

        let preferred = self.settings.settings().protocol;
        let protocol = session
            .as_ref()
            .and_then(|s| s.protocol)
            .or_else(|| protocol::resolve(preferred, &node).ok())
            .unwrap_or(preferred);

        self.connection.resume(node, protocol, session).await.map(Some)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.subscribe()
    }

    // ── Catalog ─────────────────────────────────────────────────────────

    pub async fn refresh_nodes(
        &mut self,
        country: Option<&str>,
        protocol: Option<Protocol>,
    ) -> Result<Vec<Arc<Node>>, SdkError> {
        let timeout = self.connection.options().request_timeout;
        let backend = Arc::clone(&self.backend);
        with_timeout(
            timeout,
            "node refresh",
            self.catalog.refresh(backend.as_ref(), country, protocol),
        )
        .await
    }

    pub fn catalog(&self) -> &NodeCatalog {
        &self.catalog
    }

    pub fn search(&self, text: &str) -> Vec<Arc<Node>> {
        self.catalog.search(text)
    }

    /// Cached nodes light enough for peer-to-peer traffic, lowest load first.
    pub fn p2p_nodes(&self) -> Vec<Arc<Node>> {
        self.catalog.p2p_friendly()
    }

    /// Remember `node_id` as the target for `SelectionPolicy::Selected`.
    pub async fn select_node(&self, node_id: &str) -> Result<Arc<Node>, SdkError> {
        let node = self.lookup(node_id)?;
        self.connection.select_node(Some(Arc::clone(&node))).await;
        Ok(node)
    }

    fn lookup(&self, node_id: &str) -> Result<Arc<Node>, SdkError> {
        self.catalog
            .get(node_id)
            .ok_or_else(|| SdkError::InvalidParam(format!("Unknown node: {}", node_id)))
    }

    async fn ensure_catalog(&mut self) {
        if !self.catalog.is_empty() {
            return;
        }
        log::info!("Node catalog empty; refreshing before selection");
        if let Err(e) = self.refresh_nodes(None, None).await {
            log::warn!("Node refresh failed: {}", e);
        }
    }

    async fn pick(&mut self, policy: SelectionPolicy) -> Result<Option<Arc<Node>>, SdkError> {
        match policy {
            SelectionPolicy::Manual(node) => Ok(Some(node)),
            SelectionPolicy::Selected => Ok(None),
            SelectionPolicy::Quick | SelectionPolicy::Secure => {
                self.ensure_catalog().await;
                best_by_load(self.catalog.nodes()).map(Some)
            }
            SelectionPolicy::Random => {
                self.ensure_catalog().await;
                random_pick(self.catalog.nodes()).map(Some)
            }
        }
    }

    // ── Connection ──────────────────────────────────────────────────────

    pub async fn connect(&mut self, policy: SelectionPolicy) -> Result<ConnectOutcome, SdkError> {
        if self.connection.phase().await.is_connected() {
            return Err(SdkError::AlreadyConnected);
        }
        // A tunnel left up by an earlier run is adopted instead of doubled.
        match self.resume_existing().await {
            Ok(Some(outcome)) => {
                log::info!("Already connected to {}", outcome.node.name);
                return Err(SdkError::AlreadyConnected);
            }
            Ok(None) => {}
            Err(e) => log::warn!("Could not check for an existing connection: {}", e),
        }
        let target = self.pick(policy).await?;
        let preferred = self.settings.settings().protocol;
        self.connection.connect(target, preferred).await
    }

    pub async fn quick_connect(&mut self) -> Result<ConnectOutcome, SdkError> {
        self.connect(SelectionPolicy::Quick).await
    }

    pub async fn disconnect(&mut self) -> Result<(), SdkError> {
        self.connection.disconnect().await
    }

    pub async fn switch_server(&mut self, node_id: &str) -> Result<ConnectOutcome, SdkError> {
        let node = self.lookup(node_id)?;
        let preferred = self.settings.settings().protocol;
        self.connection.switch_server(node, preferred).await
    }

    pub async fn state(&self) -> ConnectionState {
        self.connection.snapshot().await
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub async fn user_stats(&self) -> Result<UserStats, SdkError> {
        with_timeout(
            self.connection.options().request_timeout,
            "user stats",
            self.backend.user_stats(),
        )
        .await
    }

    // ── Settings ────────────────────────────────────────────────────────

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut SettingsStore {
        &mut self.settings
    }

    pub fn set_setting(&mut self, key: &str, value: Value) -> Result<(), SdkError> {
        self.settings.set(key, value)
    }

    /// Stop background tasks. The tunnel itself is left alone.
    pub async fn shutdown(&mut self) {
        self.connection.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::connection::ConnectionPhase;
    use crate::vpn::telemetry::TelemetrySample;

    fn node(id: &str, load: f64) -> Node {
        Node {
            id: id.into(),
            name: format!("Node {}", id),
            country: "Germany".into(),
            country_code: "DE".into(),
            load_score: load,
            supports_wireguard: true,
            supports_openvpn: true,
            ..Node::default()
        }
    }

    fn client_with(nodes: Vec<Node>) -> (Arc<MemoryBackend>, VpnClient) {
        let backend = Arc::new(MemoryBackend::new(nodes));
        let client = VpnClient::with_backend(
            backend.clone(),
            SettingsStore::in_memory(),
            ConnectionOptions::default(),
        );
        (backend, client)
    }

    async fn next_sample(events: &mut broadcast::Receiver<ConnectionEvent>) -> TelemetrySample {
        loop {
            if let ConnectionEvent::Telemetry(sample) = events.recv().await.unwrap() {
                return sample;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn quick_connect_end_to_end() {
        let (backend, mut client) = client_with(vec![node("B", 75.0), node("A", 20.0)]);
        backend.set_counters(5_000_000, 1_000_000);
        let mut events = client.subscribe();

        // Empty catalog is refreshed first.
        let outcome = client.quick_connect().await.unwrap();
        assert_eq!(outcome.node.id, "A");
        assert_eq!(outcome.protocol, Protocol::Wireguard);

        let state = client.state().await;
        assert_eq!(state.phase().connected_node().unwrap().id, "A");

        let first = next_sample(&mut events).await;
        assert_eq!(first.throughput.down_bytes_per_sec, 0.0);
        assert_eq!(first.throughput.up_bytes_per_sec, 0.0);
        assert_eq!(first.total_transferred, 6_000_000);

        backend.add_traffic(4096, 0);
        let second = next_sample(&mut events).await;
        assert_eq!(second.throughput.down_bytes_per_sec, 2048.0);
        assert_eq!(second.throughput.up_bytes_per_sec, 0.0);

        client.disconnect().await.unwrap();
        assert_eq!(client.state().await.elapsed(), std::time::Duration::ZERO);
    }

    #[tokio::test]
    async fn empty_catalog_after_refresh_is_reported() {
        let (backend, mut client) = client_with(vec![]);
        assert_eq!(client.quick_connect().await.unwrap_err(), SdkError::EmptyCatalog);
        assert_eq!(
            client.connect(SelectionPolicy::Random).await.unwrap_err(),
            SdkError::EmptyCatalog
        );
        assert_eq!(backend.connect_calls(), 0);
    }

    #[tokio::test]
    async fn selected_policy_requires_a_selection() {
        let (_backend, mut client) = client_with(vec![node("A", 20.0)]);
        client.refresh_nodes(None, None).await.unwrap();
        assert_eq!(
            client.connect(SelectionPolicy::Selected).await.unwrap_err(),
            SdkError::NoNodeSelected
        );
        assert!(matches!(
            client.select_node("missing").await,
            Err(SdkError::InvalidParam(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn preferred_protocol_comes_from_settings() {
        let mut openvpn_only = node("O", 10.0);
        openvpn_only.supports_wireguard = false;
        let (_backend, mut client) = client_with(vec![openvpn_only, node("W", 30.0)]);
        client.refresh_nodes(None, None).await.unwrap();
        client.settings_mut().set_protocol(Protocol::Wireguard).unwrap();

        client.select_node("O").await.unwrap();
        let outcome = client.connect(SelectionPolicy::Selected).await.unwrap();
        assert_eq!(outcome.protocol, Protocol::Openvpn);

        let outcome = client.switch_server("W").await.unwrap();
        assert_eq!(outcome.node.id, "W");
        assert_eq!(outcome.protocol, Protocol::Wireguard);
        assert!(matches!(
            client.connection().phase().await,
            ConnectionPhase::Connected { .. }
        ));
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_autoconnects_when_enabled() {
        let (backend, mut client) = client_with(vec![node("A", 20.0), node("B", 5.0)]);
        assert_eq!(client.start().await.unwrap(), None);
        assert_eq!(backend.connect_calls(), 0);

        client.set_setting("autoconnect", Value::Bool(true)).unwrap();
        let outcome = client.start().await.unwrap().unwrap();
        assert_eq!(outcome.node.id, "B");
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_takes_over_running_tunnel() {
        let (backend, mut client) = client_with(vec![node("A", 20.0), node("B", 5.0)]);
        client.set_setting("autoconnect", Value::Bool(true)).unwrap();
        backend.connect("A", Protocol::Openvpn).await.unwrap();
        let mut events = client.subscribe();

        let outcome = client.start().await.unwrap().unwrap();
        assert_eq!(outcome.node.id, "A");
        assert_eq!(outcome.node.name, "Node A");
        assert_eq!(outcome.protocol, Protocol::Openvpn);
        assert_eq!(backend.connect_calls(), 1);

        let state = client.state().await;
        assert_eq!(state.phase().connected_node().unwrap().id, "A");
        assert!(state.session().is_some());
        assert!(client.connection().is_sampling());

        backend.add_traffic(8192, 0);
        let first = next_sample(&mut events).await;
        assert_eq!(first.throughput.down_bytes_per_sec, 0.0);

        client.disconnect().await.unwrap();
        assert!(!backend.is_tunnel_up());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_reports_tunnel_left_running() {
        let (backend, mut client) = client_with(vec![node("A", 20.0), node("B", 5.0)]);
        client.refresh_nodes(None, None).await.unwrap();
        backend.connect("A", Protocol::Wireguard).await.unwrap();

        assert_eq!(client.quick_connect().await.unwrap_err(), SdkError::AlreadyConnected);
        assert_eq!(backend.connect_calls(), 1);
        assert_eq!(
            client.state().await.phase().connected_node().unwrap().id,
            "A"
        );
        client.shutdown().await;
    }

    #[tokio::test]
    async fn p2p_nodes_follow_refreshed_catalog() {
        let (backend, mut client) = client_with(vec![node("A", 20.0), node("B", 75.0)]);
        client.refresh_nodes(None, None).await.unwrap();
        let ids: Vec<_> = client.p2p_nodes().iter().map(|n| n.id.clone()).collect();
        assert_eq!(ids, vec!["A"]);

        backend.set_nodes(vec![node("C", 59.0), node("A", 61.0)]);
        client.refresh_nodes(None, None).await.unwrap();
        let ids: Vec<_> = client.p2p_nodes().iter().map(|n| n.id.clone()).collect();
        assert_eq!(ids, vec!["C"]);
    }

    #[test]
    fn policy_codes_parse() {
        assert_eq!(SelectionPolicy::from_code(0).unwrap(), SelectionPolicy::Quick);
        assert_eq!(SelectionPolicy::from_code(3).unwrap(), SelectionPolicy::Selected);
        assert!(SelectionPolicy::from_code(9).is_err());
        assert_eq!("Random".parse::<SelectionPolicy>().unwrap(), SelectionPolicy::Random);
    }
}
