//! In-process backend.
//!
//! Keeps a fake tunnel in memory so the whole connection flow can run without
//! a control API: simulation mode (`AUREO_SIMULATE=1`) and the test suite both
//! drive the SDK through it. Failures are injected per call.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{Backend, ConnectResponse, UserStats, VpnStats};
use crate::error::SdkError;
use crate::vpn::nodes::Node;
use crate::vpn::protocol::Protocol;
use crate::vpn::session::Session;

#[derive(Default)]
struct MemoryState {
    nodes: Vec<Node>,
    active: Option<Session>,
    node_name: String,
    bytes_received: u64,
    bytes_sent: u64,
    /// Added to the counters on every stats poll (simulation mode).
    traffic_per_poll: (u64, u64),
    sessions_started: u64,
    fail_get_nodes: Option<String>,
    fail_connect: Option<String>,
    fail_disconnect: Option<String>,
    /// When a disconnect fails, whether the tunnel went down anyway.
    failed_disconnect_drops_tunnel: bool,
    fail_status: Option<String>,
    connect_calls: u32,
    disconnect_calls: u32,
}

pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                nodes,
                ..MemoryState::default()
            }),
        }
    }

    /// Demo catalog with steady background traffic.
    pub fn simulated() -> Self {
        let node = |id: &str, name: &str, city: &str, country: &str, code: &str, load: f64, wg: bool, ovpn: bool| Node {
            id: id.into(),
            name: name.into(),
            hostname: format!("{}.aureo.test", id),
            city: city.into(),
            country: country.into(),
            country_code: code.into(),
            status: "online".into(),
            is_active: true,
            load_score: load,
            latency: (load as u32) + 12,
            max_connections: 500,
            supports_wireguard: wg,
            supports_openvpn: ovpn,
            wireguard_port: if wg { 51820 } else { 0 },
            openvpn_port: if ovpn { 1194 } else { 0 },
            uptime_percentage: 99.9,
            last_heartbeat: Some(Utc::now()),
            ..Node::default()
        };

        let backend = Self::new(vec![
            node("fra-1", "Frankfurt 1", "Frankfurt", "Germany", "DE", 23.0, true, true),
            node("ams-1", "Amsterdam 1", "Amsterdam", "Netherlands", "NL", 41.0, true, false),
            node("nyc-1", "New York 1", "New York", "United States", "US", 67.0, true, true),
            node("sgp-1", "Singapore 1", "Singapore", "Singapore", "SG", 18.0, false, true),
        ]);
        backend.state.lock().traffic_per_poll = (256 * 1024, 32 * 1024);
        backend
    }

    pub fn set_nodes(&self, nodes: Vec<Node>) {
        self.state.lock().nodes = nodes;
    }

    /// Make the next `get_nodes` call fail with `msg`.
    pub fn fail_next_get_nodes(&self, msg: &str) {
        self.state.lock().fail_get_nodes = Some(msg.to_string());
    }

    /// Make the next `connect` call fail with `msg`.
    pub fn fail_next_connect(&self, msg: &str) {
        self.state.lock().fail_connect = Some(msg.to_string());
    }

    /// Make the next `disconnect` call fail with `msg`. `drops_tunnel`
    /// controls whether the tunnel is gone afterwards regardless.
    pub fn fail_next_disconnect(&self, msg: &str, drops_tunnel: bool) {
        let mut state = self.state.lock();
        state.fail_disconnect = Some(msg.to_string());
        state.failed_disconnect_drops_tunnel = drops_tunnel;
    }

    /// Make the next liveness query fail with `msg`.
    pub fn fail_next_status(&self, msg: &str) {
        self.state.lock().fail_status = Some(msg.to_string());
    }

    /// Tear the tunnel down behind the client's back.
    pub fn drop_connection(&self) {
        self.state.lock().active = None;
    }

    pub fn set_counters(&self, bytes_received: u64, bytes_sent: u64) {
        let mut state = self.state.lock();
        state.bytes_received = bytes_received;
        state.bytes_sent = bytes_sent;
    }

    pub fn add_traffic(&self, received: u64, sent: u64) {
        let mut state = self.state.lock();
        state.bytes_received += received;
        state.bytes_sent += sent;
    }

    pub fn connect_calls(&self) -> u32 {
        self.state.lock().connect_calls
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.state.lock().disconnect_calls
    }

    pub fn is_tunnel_up(&self) -> bool {
        self.state.lock().active.is_some()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get_nodes(
        &self,
        country: Option<&str>,
        protocol: Option<Protocol>,
    ) -> Result<Vec<Node>, SdkError> {
        let mut state = self.state.lock();
        if let Some(msg) = state.fail_get_nodes.take() {
            return Err(SdkError::Backend(msg));
        }
        Ok(state
            .nodes
            .iter()
            .filter(|n| {
                country.map_or(true, |c| {
                    n.country.eq_ignore_ascii_case(c) || n.country_code.eq_ignore_ascii_case(c)
                })
            })
            .filter(|n| protocol.map_or(true, |p| n.supports(p)))
            .cloned()
            .collect())
    }

    async fn connect(
        &self,
        node_id: &str,
        protocol: Protocol,
    ) -> Result<ConnectResponse, SdkError> {
        let mut state = self.state.lock();
        state.connect_calls += 1;
        if let Some(msg) = state.fail_connect.take() {
            return Err(SdkError::Backend(msg));
        }
        if state.active.is_some() {
            return Err(SdkError::Backend(
                "already connected to VPN. Disconnect first".to_string(),
            ));
        }
        let node = state
            .nodes
            .iter()
            .find(|n| n.id == node_id)
            .cloned()
            .ok_or_else(|| SdkError::Backend(format!("node not found: {}", node_id)))?;

        state.sessions_started += 1;
        let session = Session {
            id: format!("mem-{}", state.sessions_started),
            user_id: "local".into(),
            node_id: node.id.clone(),
            protocol: Some(protocol),
            client_ip: format!("10.8.0.{}", 1 + state.sessions_started % 250),
            tunnel_ip: node.public_ip.clone(),
            status: "active".into(),
            connected_at: Some(Utc::now()),
            bytes_received: state.bytes_received,
            bytes_sent: state.bytes_sent,
            latency: node.latency,
            ..Session::default()
        };
        state.node_name = node.name;
        state.active = Some(session.clone());

        let client_ip = Some(session.client_ip.clone());
        Ok(ConnectResponse::established(Some(session), client_ip))
    }

    async fn disconnect(&self) -> Result<(), SdkError> {
        let mut state = self.state.lock();
        state.disconnect_calls += 1;
        if let Some(msg) = state.fail_disconnect.take() {
            if state.failed_disconnect_drops_tunnel {
                state.active = None;
            }
            return Err(SdkError::Backend(msg));
        }
        state.active = None;
        Ok(())
    }

    async fn is_connected(&self) -> Result<bool, SdkError> {
        let mut state = self.state.lock();
        if let Some(msg) = state.fail_status.take() {
            return Err(SdkError::Backend(msg));
        }
        Ok(state.active.is_some())
    }

    async fn vpn_stats(&self) -> Result<VpnStats, SdkError> {
        let mut state = self.state.lock();
        let Some(session) = state.active.clone() else {
            return Ok(VpnStats::default());
        };
        let (recv, sent) = state.traffic_per_poll;
        state.bytes_received += recv;
        state.bytes_sent += sent;
        Ok(VpnStats {
            connected: true,
            node_id: session.node_id,
            node_name: state.node_name.clone(),
            bytes_received: state.bytes_received,
            bytes_sent: state.bytes_sent,
            latest_handshake: None,
        })
    }

    async fn current_session(&self) -> Result<Session, SdkError> {
        let mut state = self.state.lock();
        let (received, sent) = (state.bytes_received, state.bytes_sent);
        match state.active.as_mut() {
            Some(session) => {
                session.update_counters(received, sent);
                Ok(session.clone())
            }
            None => Err(SdkError::NotConnected),
        }
    }

    async fn user_stats(&self) -> Result<UserStats, SdkError> {
        let state = self.state.lock();
        let total = (state.bytes_received + state.bytes_sent) as f64;
        Ok(UserStats {
            total_sessions: state.sessions_started,
            active_sessions: u64::from(state.active.is_some()),
            data_transferred_gb: total / (1024.0 * 1024.0 * 1024.0),
        })
    }
}
