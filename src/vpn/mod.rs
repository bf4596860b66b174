//! VPN Module for Aureo VPN SDK
//!
//! Client-side orchestration only. Tunnels are run by the backend; this
//! module decides where to connect and keeps a live view of the connection.
//!
//! ## Architecture
//!
//! - nodes.rs: Node catalog, load-based and random selection, search
//! - protocol.rs: WireGuard/OpenVPN resolution against node capabilities
//! - session.rs: Mirror of the backend's session record
//! - connection.rs: Connection state machine and lifecycle
//! - telemetry.rs: Throughput sampler and duration clock
//! - lookup.rs: Public IP and flag URLs for display

pub mod connection;
pub mod lookup;
pub mod nodes;
pub mod protocol;
pub mod session;
pub mod telemetry;

pub use connection::{
    ConnectOutcome, ConnectionEvent, ConnectionManager, ConnectionOptions, ConnectionPhase,
    ConnectionState,
};
pub use lookup::{flag_url, lookup_public_ip};
pub use nodes::{best_by_load, random_pick, CatalogSource, LoadLevel, Node, NodeCatalog};
pub use protocol::Protocol;
pub use session::Session;
pub use telemetry::{
    format_bytes, format_duration, format_speed, TelemetrySample, TelemetrySource, Throughput,
};
