//! Backend control surface
//!
//! The SDK never runs a tunnel itself. Everything it knows about the network
//! comes through [`Backend`]: the node list, connect/disconnect, liveness and
//! cumulative traffic counters.
//!
//! - http.rs: control API client (reqwest)
//! - memory.rs: in-process scripted backend for simulation mode and tests

pub mod http;
pub mod memory;

pub use http::HttpBackend;
pub use memory::MemoryBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SdkError;
use crate::vpn::nodes::Node;
use crate::vpn::protocol::Protocol;
use crate::vpn::session::Session;

/// Result of a connect call.
///
/// Older control API builds acknowledge with `success`, newer ones with
/// `connected`; either one set means the tunnel is up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectResponse {
    pub success: bool,
    pub connected: bool,
    pub session: Option<Session>,
    pub client_ip: Option<String>,
    pub error: Option<String>,
}

impl ConnectResponse {
    pub fn is_ack(&self) -> bool {
        self.success || self.connected
    }

    pub fn established(session: Option<Session>, client_ip: Option<String>) -> Self {
        Self {
            success: true,
            connected: true,
            session,
            client_ip,
            error: None,
        }
    }
}

/// Live counters for the active tunnel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VpnStats {
    pub connected: bool,
    pub node_id: String,
    pub node_name: String,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub latest_handshake: Option<String>,
}

/// Account-wide usage totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserStats {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub data_transferred_gb: f64,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn get_nodes(
        &self,
        country: Option<&str>,
        protocol: Option<Protocol>,
    ) -> Result<Vec<Node>, SdkError>;

    async fn connect(&self, node_id: &str, protocol: Protocol)
        -> Result<ConnectResponse, SdkError>;

    async fn disconnect(&self) -> Result<(), SdkError>;

    async fn is_connected(&self) -> Result<bool, SdkError>;

    async fn vpn_stats(&self) -> Result<VpnStats, SdkError>;

    async fn current_session(&self) -> Result<Session, SdkError>;

    async fn user_stats(&self) -> Result<UserStats, SdkError>;
}
