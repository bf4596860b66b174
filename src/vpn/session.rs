//! Backend session record, mirrored read-only on the client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::protocol::Protocol;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub node_id: String,
    /// `None` when the backend sends an empty or unknown protocol.
    #[serde(deserialize_with = "lenient_protocol")]
    pub protocol: Option<Protocol>,
    pub client_ip: String,
    pub tunnel_ip: String,
    pub status: String,
    pub connected_at: Option<DateTime<Utc>>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub data_used_gb: f64,
    /// Milliseconds.
    pub latency: u32,
}

fn lenient_protocol<'de, D>(deserializer: D) -> Result<Option<Protocol>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|p| p.parse().ok()))
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.status.eq_ignore_ascii_case("active") || self.status.eq_ignore_ascii_case("connected")
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent.saturating_add(self.bytes_received)
    }

    /// Apply freshly polled counters and recompute `data_used_gb`.
    pub fn update_counters(&mut self, bytes_received: u64, bytes_sent: u64) {
        self.bytes_received = bytes_received;
        self.bytes_sent = bytes_sent;
        self.data_used_gb = self.total_bytes() as f64 / BYTES_PER_GB;
    }
}
