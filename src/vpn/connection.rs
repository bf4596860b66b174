//! Connection state machine
//!
//! Owns the lifecycle of the single tunnel a client may have:
//! - Disconnected -> Connecting -> Connected on a backend ack
//! - Connecting -> Disconnected on a backend failure
//! - Connected -> Disconnecting -> Disconnected on an explicit disconnect,
//!   reconciled against `is_connected` when the backend call fails
//! - Connected -> Lost -> Disconnected when the sampler sees the tunnel gone
//!
//! Every transition goes through one `tokio::sync::Mutex<ConnectionState>` and
//! is published on the event bus.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

use super::nodes::Node;
use super::protocol::{self, Protocol};
use super::session::Session;
use super::telemetry::{
    SessionTasks, TelemetryBaseline, TelemetrySample, TelemetrySource, DEFAULT_CLOCK_INTERVAL,
    DEFAULT_POLL_INTERVAL,
};
use crate::backend::Backend;
use crate::error::SdkError;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const EVENT_CAPACITY: usize = 64;

/// Connection phase. The active node only exists inside the variants that
/// have one.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting {
        node: Arc<Node>,
        protocol: Protocol,
    },
    Connected {
        node: Arc<Node>,
        protocol: Protocol,
        since: Instant,
        connected_at: DateTime<Utc>,
        client_ip: Option<String>,
    },
    Disconnecting {
        node: Arc<Node>,
        protocol: Protocol,
    },
    Lost {
        node: Arc<Node>,
    },
}

impl ConnectionPhase {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionPhase::Connected { .. })
    }

    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            ConnectionPhase::Connecting { .. }
                | ConnectionPhase::Disconnecting { .. }
                | ConnectionPhase::Lost { .. }
        )
    }

    /// The connected node. `None` outside `Connected`.
    pub fn connected_node(&self) -> Option<&Arc<Node>> {
        match self {
            ConnectionPhase::Connected { node, .. } => Some(node),
            _ => None,
        }
    }

    pub fn protocol(&self) -> Option<Protocol> {
        match self {
            ConnectionPhase::Connecting { protocol, .. }
            | ConnectionPhase::Connected { protocol, .. }
            | ConnectionPhase::Disconnecting { protocol, .. } => Some(*protocol),
            _ => None,
        }
    }

    pub fn connected_since(&self) -> Option<Instant> {
        match self {
            ConnectionPhase::Connected { since, .. } => Some(*since),
            _ => None,
        }
    }

    pub fn status_text(&self) -> &'static str {
        match self {
            ConnectionPhase::Disconnected => "Disconnected",
            ConnectionPhase::Connecting { .. } => "Connecting...",
            ConnectionPhase::Connected { .. } => "Connected",
            ConnectionPhase::Disconnecting { .. } => "Disconnecting...",
            ConnectionPhase::Lost { .. } => "Connection lost",
        }
    }

    /// Convert to FFI-friendly integer code
    pub fn as_code(&self) -> i32 {
        match self {
            ConnectionPhase::Disconnected => 0,
            ConnectionPhase::Connecting { .. } => 1,
            ConnectionPhase::Connected { .. } => 2,
            ConnectionPhase::Disconnecting { .. } => 3,
            ConnectionPhase::Lost { .. } => 4,
        }
    }
}

/// Everything the state machine and the sampler share.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    phase: ConnectionPhase,
    selected_node: Option<Arc<Node>>,
    session: Option<Session>,
    baseline: TelemetryBaseline,
    last_sample: Option<TelemetrySample>,
    /// Bumped on every entry into `Connected`; tasks from an older
    /// connection compare against it and retire.
    generation: u64,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            selected_node: None,
            session: None,
            baseline: TelemetryBaseline::new(Instant::now()),
            last_sample: None,
            generation: 0,
        }
    }

    pub fn phase(&self) -> &ConnectionPhase {
        &self.phase
    }

    pub fn selected_node(&self) -> Option<&Arc<Node>> {
        self.selected_node.as_ref()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn baseline(&self) -> TelemetryBaseline {
        self.baseline
    }

    pub fn last_sample(&self) -> Option<&TelemetrySample> {
        self.last_sample.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Time spent in the current connection, zero when not connected.
    pub fn elapsed(&self) -> Duration {
        self.phase
            .connected_since()
            .map(|since| since.elapsed())
            .unwrap_or_default()
    }

    pub(crate) fn set_baseline(&mut self, baseline: TelemetryBaseline) {
        self.baseline = baseline;
    }

    pub(crate) fn set_last_sample(&mut self, sample: Option<TelemetrySample>) {
        self.last_sample = sample;
    }

    /// Refresh the session mirror from a poll. A full session record replaces
    /// the mirror; bare counters only update it.
    pub(crate) fn mirror_session(
        &mut self,
        session: Option<Session>,
        bytes_received: u64,
        bytes_sent: u64,
    ) {
        match (session, self.session.as_mut()) {
            (Some(fresh), _) => self.session = Some(fresh),
            (None, Some(existing)) => existing.update_counters(bytes_received, bytes_sent),
            (None, None) => {}
        }
    }

    fn reset_telemetry(&mut self) {
        self.baseline = TelemetryBaseline::new(Instant::now());
        self.last_sample = None;
    }

    /// Drop everything tied to the active connection.
    fn clear_connection(&mut self) {
        self.phase = ConnectionPhase::Disconnected;
        self.session = None;
        self.reset_telemetry();
    }
}

/// Events published to the presentation layer.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    PhaseChanged(ConnectionPhase),
    Telemetry(TelemetrySample),
    /// Duration clock tick.
    Elapsed(Duration),
    /// Unsolicited loss of the tunnel, reported once before the
    /// `Disconnected` phase change.
    ConnectionLost { node: Arc<Node> },
    Error(SdkError),
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub poll_interval: Duration,
    pub clock_interval: Duration,
    pub request_timeout: Duration,
    pub telemetry_source: TelemetrySource,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            clock_interval: DEFAULT_CLOCK_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            telemetry_source: TelemetrySource::default(),
        }
    }
}

/// What a successful connect established.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOutcome {
    pub node: Arc<Node>,
    pub protocol: Protocol,
    pub client_ip: Option<String>,
}

/// Bound a backend call by `limit`; running out of time counts as the call's
/// failure.
pub(crate) async fn with_timeout<T, F>(limit: Duration, what: &str, call: F) -> Result<T, SdkError>
where
    F: Future<Output = Result<T, SdkError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(SdkError::Backend(format!(
            "{} timed out after {}ms",
            what,
            limit.as_millis()
        ))),
    }
}

fn failure_reason(err: &SdkError) -> String {
    err.backend_reason()
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string())
}

fn publish(events: &broadcast::Sender<ConnectionEvent>, event: ConnectionEvent) {
    // No subscribers is fine.
    let _ = events.send(event);
}

/// Connected -> Lost -> Disconnected, run by the sampler that noticed.
///
/// Does nothing if the connection it was started for is already gone.
pub(crate) async fn handle_connection_lost(
    state: &Mutex<ConnectionState>,
    events: &broadcast::Sender<ConnectionEvent>,
    generation: u64,
) {
    let mut guard = state.lock().await;
    if guard.generation != generation {
        return;
    }
    let Some(node) = guard.phase.connected_node().cloned() else {
        return;
    };

    log::warn!("Connection to {} lost", node.name);
    guard.phase = ConnectionPhase::Lost {
        node: Arc::clone(&node),
    };
    publish(events, ConnectionEvent::PhaseChanged(guard.phase.clone()));

    guard.clear_connection();
    drop(guard);

    publish(events, ConnectionEvent::ConnectionLost { node });
    publish(events, ConnectionEvent::PhaseChanged(ConnectionPhase::Disconnected));
    publish(events, ConnectionEvent::Elapsed(Duration::ZERO));
    log::info!("Connection state: Disconnected (lost)");
}

/// Connection manager
pub struct ConnectionManager {
    backend: Arc<dyn Backend>,
    state: Arc<Mutex<ConnectionState>>,
    events: broadcast::Sender<ConnectionEvent>,
    tasks: Option<SessionTasks>,
    options: ConnectionOptions,
}

impl ConnectionManager {
    pub fn new(backend: Arc<dyn Backend>, options: ConnectionOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            backend,
            state: Arc::new(Mutex::new(ConnectionState::new())),
            events,
            tasks: None,
            options,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub async fn snapshot(&self) -> ConnectionState {
        self.state.lock().await.clone()
    }

    pub async fn phase(&self) -> ConnectionPhase {
        self.state.lock().await.phase.clone()
    }

    pub fn state_handle(&self) -> Arc<Mutex<ConnectionState>> {
        Arc::clone(&self.state)
    }

    /// Whether the telemetry sampler is currently running.
    pub fn is_sampling(&self) -> bool {
        self.tasks.as_ref().map_or(false, SessionTasks::is_sampling)
    }

    /// Choose the node a later connect without an explicit target will use.
    pub async fn select_node(&self, node: Option<Arc<Node>>) {
        if let Some(ref node) = node {
            log::info!("Selected node {} ({})", node.id, node.name);
        }
        self.state.lock().await.selected_node = node;
    }

    pub async fn selected_node(&self) -> Option<Arc<Node>> {
        self.state.lock().await.selected_node.clone()
    }

    async fn set_phase(&self, phase: ConnectionPhase) {
        log::info!("Connection state: {}", phase.status_text());
        self.state.lock().await.phase = phase.clone();
        publish(&self.events, ConnectionEvent::PhaseChanged(phase));
    }

    fn report(&self, err: SdkError) -> SdkError {
        log::error!("{}", err);
        publish(&self.events, ConnectionEvent::Error(err.clone()));
        err
    }

    /// Connect to `target`, or to the selected node when `target` is `None`.
    pub async fn connect(
        &mut self,
        target: Option<Arc<Node>>,
        preferred: Protocol,
    ) -> Result<ConnectOutcome, SdkError> {
        let node = {
            let state = self.state.lock().await;
            if state.phase.is_connected() {
                return Err(SdkError::AlreadyConnected);
            }
            if state.phase.is_busy() {
                return Err(SdkError::ConnectionInProgress);
            }
            target
                .or_else(|| state.selected_node.clone())
                .ok_or(SdkError::NoNodeSelected)?
        };

        // Anything left from a connection that ended without us (loss).
        self.stop_sampler().await;

        let protocol = protocol::resolve(preferred, &node)?;
        log::info!(
            "Connecting to {} ({}) via {}",
            node.name,
            node.id,
            protocol.display_name()
        );

        self.state.lock().await.selected_node = Some(Arc::clone(&node));
        self.set_phase(ConnectionPhase::Connecting {
            node: Arc::clone(&node),
            protocol,
        })
        .await;

        let reply = with_timeout(
            self.options.request_timeout,
            "connect",
            self.backend.connect(&node.id, protocol),
        )
        .await;

        let response = match reply {
            Ok(response) if response.is_ack() => response,
            Ok(response) => {
                let reason = response
                    .error
                    .filter(|e| !e.is_empty())
                    .unwrap_or_else(|| "backend did not confirm the connection".to_string());
                return Err(self.fail_connect(reason).await);
            }
            Err(e) => return Err(self.fail_connect(failure_reason(&e)).await),
        };

        let client_ip = response
            .client_ip
            .clone()
            .or_else(|| response.session.as_ref().map(|s| s.client_ip.clone()))
            .filter(|ip| !ip.is_empty());
        let connected_at = response
            .session
            .as_ref()
            .and_then(|s| s.connected_at)
            .unwrap_or_else(Utc::now);

        let phase = ConnectionPhase::Connected {
            node: Arc::clone(&node),
            protocol,
            since: Instant::now(),
            connected_at,
            client_ip: client_ip.clone(),
        };
        self.enter_connected(phase, response.session).await;

        log::info!("Connected to {}", node.name);
        Ok(ConnectOutcome {
            node,
            protocol,
            client_ip,
        })
    }

    /// Take over a tunnel the backend already has up, e.g. after a restart.
    ///
    /// Enters `Connected` with a fresh baseline and starts the sampler and
    /// clock; the backend is not asked to connect. Elapsed time counts from the
    /// session's `connected_at` when it is known.
    pub async fn resume(
        &mut self,
        node: Arc<Node>,
        protocol: Protocol,
        session: Option<Session>,
    ) -> Result<ConnectOutcome, SdkError> {
        {
            let state = self.state.lock().await;
            if state.phase.is_connected() {
                return Err(SdkError::AlreadyConnected);
            }
            if state.phase.is_busy() {
                return Err(SdkError::ConnectionInProgress);
            }
        }
        self.stop_sampler().await;

        let connected_at = session.as_ref().and_then(|s| s.connected_at);
        let since = connected_at
            .and_then(|at| (Utc::now() - at).to_std().ok())
            .and_then(|age| Instant::now().checked_sub(age))
            .unwrap_or_else(Instant::now);
        let client_ip = session
            .as_ref()
            .map(|s| s.client_ip.clone())
            .filter(|ip| !ip.is_empty());

        log::info!(
            "Resuming existing connection to {} ({}) via {}",
            node.name,
            node.id,
            protocol.display_name()
        );
        self.state.lock().await.selected_node = Some(Arc::clone(&node));
        let phase = ConnectionPhase::Connected {
            node: Arc::clone(&node),
            protocol,
            since,
            connected_at: connected_at.unwrap_or_else(Utc::now),
            client_ip: client_ip.clone(),
        };
        self.enter_connected(phase, session).await;

        Ok(ConnectOutcome {
            node,
            protocol,
            client_ip,
        })
    }

    async fn fail_connect(&self, reason: String) -> SdkError {
        {
            let mut state = self.state.lock().await;
            state.clear_connection();
        }
        self.set_phase(ConnectionPhase::Disconnected).await;
        self.report(SdkError::ConnectFailed(reason))
    }

    /// Enter (or re-enter) `Connected` and start a fresh sampler and clock.
    async fn enter_connected(&mut self, phase: ConnectionPhase, session: Option<Session>) {
        let generation = {
            let mut state = self.state.lock().await;
            state.generation += 1;
            state.phase = phase.clone();
            if session.is_some() {
                state.session = session;
            }
            state.reset_telemetry();
            state.generation
        };
        log::info!("Connection state: {}", phase.status_text());
        publish(&self.events, ConnectionEvent::PhaseChanged(phase));

        self.tasks = Some(SessionTasks::spawn(
            Arc::clone(&self.backend),
            Arc::clone(&self.state),
            self.events.clone(),
            generation,
            &self.options,
        ));
    }

    /// Disconnect the active tunnel.
    ///
    /// Not connected is a no-op. If the backend call fails, the tunnel state is
    /// re-read: gone means the disconnect succeeded anyway, still up (or
    /// unknown) means `DisconnectFailed` and the connection stays as it was.
    pub async fn disconnect(&mut self) -> Result<(), SdkError> {
        let previous = {
            let state = self.state.lock().await;
            match &state.phase {
                ConnectionPhase::Disconnected => {
                    log::debug!("Disconnect requested while already disconnected");
                    return Ok(());
                }
                ConnectionPhase::Connected { .. } => state.phase.clone(),
                _ => return Err(SdkError::ConnectionInProgress),
            }
        };
        let ConnectionPhase::Connected { node, protocol, .. } = &previous else {
            return Err(SdkError::Internal("unexpected phase".to_string()));
        };

        log::info!("Disconnecting from {}", node.name);
        self.stop_sampler().await;
        // The sampler may have seen the tunnel drop while it was being stopped.
        if !self.state.lock().await.phase.is_connected() {
            log::info!("Connection ended while stopping telemetry; nothing to disconnect");
            return Ok(());
        }
        self.set_phase(ConnectionPhase::Disconnecting {
            node: Arc::clone(node),
            protocol: *protocol,
        })
        .await;

        let timeout = self.options.request_timeout;
        let already_down = matches!(
            with_timeout(timeout, "status check", self.backend.is_connected()).await,
            Ok(false)
        );
        if already_down {
            log::info!("Backend reports no tunnel; cleaning up");
            self.finish_disconnect().await;
            return Ok(());
        }

        let err = match with_timeout(timeout, "disconnect", self.backend.disconnect()).await {
            Ok(()) => {
                self.finish_disconnect().await;
                return Ok(());
            }
            Err(e) => e,
        };

        log::warn!("Disconnect call failed: {}; checking tunnel state", err);
        match with_timeout(timeout, "status check", self.backend.is_connected()).await {
            Ok(false) => {
                log::info!("Tunnel is down despite the failed call");
                self.finish_disconnect().await;
                Ok(())
            }
            still_up => {
                if let Err(ref status_err) = still_up {
                    log::warn!("Status check failed too: {}", status_err);
                }
                let session = self.state.lock().await.session.clone();
                self.enter_connected(previous, session).await;
                Err(self.report(SdkError::DisconnectFailed(failure_reason(&err))))
            }
        }
    }

    async fn finish_disconnect(&self) {
        {
            let mut state = self.state.lock().await;
            state.clear_connection();
        }
        self.set_phase(ConnectionPhase::Disconnected).await;
        publish(&self.events, ConnectionEvent::Elapsed(Duration::ZERO));
    }

    /// Disconnect, then connect to `target`. A failed disconnect aborts.
    pub async fn switch_server(
        &mut self,
        target: Arc<Node>,
        preferred: Protocol,
    ) -> Result<ConnectOutcome, SdkError> {
        log::info!("Switching server to {}", target.name);
        if self.phase().await.is_connected() {
            self.disconnect().await?;
        }
        self.connect(Some(target), preferred).await
    }

    /// Stop the sampler and clock, waiting for an in-flight sample. Safe to
    /// call any number of times; always leaves the baseline reset.
    pub async fn stop_sampler(&mut self) {
        if let Some(tasks) = self.tasks.take() {
            tasks.stop().await;
        }
        self.state.lock().await.reset_telemetry();
    }

    pub async fn session(&self) -> Option<Session> {
        self.state.lock().await.session.clone()
    }

    pub async fn telemetry(&self) -> Option<TelemetrySample> {
        self.state.lock().await.last_sample.clone()
    }

    pub async fn elapsed(&self) -> Duration {
        self.state.lock().await.elapsed()
    }

    /// Stop background work without touching the tunnel.
    pub async fn shutdown(&mut self) {
        self.stop_sampler().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ConnectResponse, MemoryBackend, UserStats, VpnStats};
    use crate::vpn::telemetry::Throughput;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    fn node(id: &str, load: f64, wg: bool, ovpn: bool) -> Node {
        Node {
            id: id.into(),
            name: format!("Node {}", id),
            load_score: load,
            supports_wireguard: wg,
            supports_openvpn: ovpn,
            ..Node::default()
        }
    }

    fn setup(nodes: Vec<Node>) -> (Arc<MemoryBackend>, ConnectionManager) {
        let backend = Arc::new(MemoryBackend::new(nodes));
        let manager = ConnectionManager::new(backend.clone(), ConnectionOptions::default());
        (backend, manager)
    }

    #[tokio::test(start_paused = true)]
    async fn connect_success_enters_connected_and_samples() {
        let (backend, mut manager) = setup(vec![node("a", 10.0, true, true)]);
        let target = Arc::new(node("a", 10.0, true, true));

        let outcome = manager
            .connect(Some(Arc::clone(&target)), Protocol::Wireguard)
            .await
            .unwrap();
        assert_eq!(outcome.protocol, Protocol::Wireguard);
        assert!(outcome.client_ip.is_some());

        let state = manager.snapshot().await;
        assert_eq!(state.phase().as_code(), 2);
        assert_eq!(state.phase().connected_node().unwrap().id, "a");
        assert!(state.session().is_some());
        assert!(manager.is_sampling());
        assert!(backend.is_tunnel_up());

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_returns_backend_message() {
        let (backend, mut manager) = setup(vec![node("a", 10.0, true, false)]);
        backend.fail_next_connect("node at capacity");
        let mut events = manager.subscribe();

        let err = manager
            .connect(Some(Arc::new(node("a", 10.0, true, false))), Protocol::Wireguard)
            .await
            .unwrap_err();
        assert_eq!(err, SdkError::ConnectFailed("node at capacity".into()));

        let state = manager.snapshot().await;
        assert_eq!(*state.phase(), ConnectionPhase::Disconnected);
        assert!(state.phase().connected_node().is_none());
        assert!(!manager.is_sampling());

        // Connecting, Disconnected, Error
        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let ConnectionEvent::Error(e) = event {
                assert_eq!(e, SdkError::ConnectFailed("node at capacity".into()));
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn connect_without_target_or_selection_fails() {
        let (backend, mut manager) = setup(vec![]);
        let err = manager.connect(None, Protocol::Wireguard).await.unwrap_err();
        assert_eq!(err, SdkError::NoNodeSelected);
        assert_eq!(backend.connect_calls(), 0);
    }

    #[tokio::test]
    async fn incompatible_node_never_reaches_backend() {
        let (backend, mut manager) = setup(vec![node("x", 1.0, false, false)]);
        let err = manager
            .connect(Some(Arc::new(node("x", 1.0, false, false))), Protocol::Openvpn)
            .await
            .unwrap_err();
        assert_eq!(err, SdkError::NoCompatibleProtocol);
        assert_eq!(backend.connect_calls(), 0);
        assert_eq!(manager.phase().await, ConnectionPhase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_uses_selected_node_and_rejects_double_connect() {
        let (_backend, mut manager) = setup(vec![node("a", 10.0, true, true)]);
        manager.select_node(Some(Arc::new(node("a", 10.0, true, true)))).await;

        let outcome = manager.connect(None, Protocol::Openvpn).await.unwrap();
        assert_eq!(outcome.node.id, "a");
        assert_eq!(outcome.protocol, Protocol::Openvpn);

        let err = manager.connect(None, Protocol::Openvpn).await.unwrap_err();
        assert_eq!(err, SdkError::AlreadyConnected);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_clears_connection() {
        let (backend, mut manager) = setup(vec![node("a", 10.0, true, true)]);
        manager
            .connect(Some(Arc::new(node("a", 10.0, true, true))), Protocol::Wireguard)
            .await
            .unwrap();

        manager.disconnect().await.unwrap();
        let state = manager.snapshot().await;
        assert_eq!(*state.phase(), ConnectionPhase::Disconnected);
        assert!(state.session().is_none());
        assert_eq!(state.elapsed(), Duration::ZERO);
        assert!(!manager.is_sampling());
        assert!(!backend.is_tunnel_up());
        assert_eq!(backend.disconnect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_disconnect_with_tunnel_down_still_succeeds() {
        let (backend, mut manager) = setup(vec![node("a", 10.0, true, true)]);
        manager
            .connect(Some(Arc::new(node("a", 10.0, true, true))), Protocol::Wireguard)
            .await
            .unwrap();

        backend.fail_next_disconnect("socket closed", true);
        manager.disconnect().await.unwrap();
        assert_eq!(manager.phase().await, ConnectionPhase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_disconnect_with_tunnel_up_stays_connected() {
        let (backend, mut manager) = setup(vec![node("a", 10.0, true, true)]);
        manager
            .connect(Some(Arc::new(node("a", 10.0, true, true))), Protocol::Wireguard)
            .await
            .unwrap();

        backend.fail_next_disconnect("permission denied", false);
        let err = manager.disconnect().await.unwrap_err();
        assert_eq!(err, SdkError::DisconnectFailed("permission denied".into()));

        let phase = manager.phase().await;
        assert!(phase.is_connected());
        assert_eq!(phase.connected_node().unwrap().id, "a");
        assert!(manager.is_sampling());
        assert!(backend.is_tunnel_up());

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_cleanup_only_when_backend_already_down() {
        let (backend, mut manager) = setup(vec![node("a", 10.0, true, true)]);
        manager
            .connect(Some(Arc::new(node("a", 10.0, true, true))), Protocol::Wireguard)
            .await
            .unwrap();
        manager.stop_sampler().await;
        backend.drop_connection();

        manager.disconnect().await.unwrap();
        assert_eq!(backend.disconnect_calls(), 0);
        assert_eq!(manager.phase().await, ConnectionPhase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn sampler_detects_lost_connection() {
        let (backend, mut manager) = setup(vec![node("a", 10.0, true, true)]);
        let mut events = manager.subscribe();
        manager
            .connect(Some(Arc::new(node("a", 10.0, true, true))), Protocol::Wireguard)
            .await
            .unwrap();

        backend.drop_connection();

        let lost = loop {
            match events.recv().await.unwrap() {
                ConnectionEvent::ConnectionLost { node } => break node,
                _ => continue,
            }
        };
        assert_eq!(lost.id, "a");

        // Lost is followed by Disconnected.
        loop {
            if let ConnectionEvent::PhaseChanged(phase) = events.recv().await.unwrap() {
                assert_eq!(phase, ConnectionPhase::Disconnected);
                break;
            }
        }

        let state = manager.snapshot().await;
        assert!(state.phase().connected_node().is_none());
        assert!(state.session().is_none());
        assert!(!manager.is_sampling());

        // A fresh connect works after loss.
        manager
            .connect(Some(Arc::new(node("a", 10.0, true, true))), Protocol::Wireguard)
            .await
            .unwrap();
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transient_status_error_keeps_sampling() {
        let (backend, mut manager) = setup(vec![node("a", 10.0, true, true)]);
        let mut events = manager.subscribe();
        manager
            .connect(Some(Arc::new(node("a", 10.0, true, true))), Protocol::Wireguard)
            .await
            .unwrap();
        backend.fail_next_status("timeout");

        // First tick is skipped, second one primes the baseline.
        let sample = loop {
            if let ConnectionEvent::Telemetry(sample) = events.recv().await.unwrap() {
                break sample;
            }
        };
        assert_eq!(sample.throughput.down_bytes_per_sec, 0.0);
        assert!(manager.phase().await.is_connected());

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_sampler_twice_matches_once() {
        let (_backend, mut manager) = setup(vec![node("a", 10.0, true, true)]);
        manager
            .connect(Some(Arc::new(node("a", 10.0, true, true))), Protocol::Wireguard)
            .await
            .unwrap();

        manager.stop_sampler().await;
        let once = manager.snapshot().await;
        manager.stop_sampler().await;
        let twice = manager.snapshot().await;

        assert!(!manager.is_sampling());
        assert!(!once.baseline().is_primed());
        assert!(!twice.baseline().is_primed());
        assert_eq!(once.baseline().previous_bytes_received, 0);
        assert_eq!(twice.baseline().previous_bytes_sent, 0);
        assert_eq!(once.last_sample(), twice.last_sample());
    }

    #[tokio::test(start_paused = true)]
    async fn switch_server_aborts_when_disconnect_fails() {
        let (backend, mut manager) = setup(vec![
            node("a", 10.0, true, true),
            node("b", 20.0, true, true),
        ]);
        manager
            .connect(Some(Arc::new(node("a", 10.0, true, true))), Protocol::Wireguard)
            .await
            .unwrap();

        backend.fail_next_disconnect("busy", false);
        let err = manager
            .switch_server(Arc::new(node("b", 20.0, true, true)), Protocol::Wireguard)
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::DisconnectFailed(_)));
        assert_eq!(backend.connect_calls(), 1);
        assert_eq!(manager.phase().await.connected_node().unwrap().id, "a");

        let outcome = manager
            .switch_server(Arc::new(node("b", 20.0, true, true)), Protocol::Wireguard)
            .await
            .unwrap();
        assert_eq!(outcome.node.id, "b");
        assert_eq!(backend.connect_calls(), 2);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn resume_adopts_running_tunnel() {
        let (backend, mut manager) = setup(vec![node("a", 10.0, true, true)]);
        let reply = backend.connect("a", Protocol::Openvpn).await.unwrap();
        backend.add_traffic(10_000, 5_000);
        let mut events = manager.subscribe();

        let outcome = manager
            .resume(Arc::new(node("a", 10.0, true, true)), Protocol::Openvpn, reply.session)
            .await
            .unwrap();
        assert_eq!(outcome.protocol, Protocol::Openvpn);
        assert!(outcome.client_ip.is_some());
        assert_eq!(backend.connect_calls(), 1);
        assert!(manager.is_sampling());

        // Lifetime counters are not reported as a burst.
        let sample = loop {
            if let ConnectionEvent::Telemetry(sample) = events.recv().await.unwrap() {
                break sample;
            }
        };
        assert_eq!(sample.throughput, Throughput::ZERO);
        assert_eq!(sample.total_transferred, 15_000);

        let err = manager
            .resume(Arc::new(node("a", 10.0, true, true)), Protocol::Openvpn, None)
            .await
            .unwrap_err();
        assert_eq!(err, SdkError::AlreadyConnected);

        manager.disconnect().await.unwrap();
        assert!(!backend.is_tunnel_up());
    }

    /// Holds the first armed liveness query until `release` is notified.
    struct HeldStatusBackend {
        inner: MemoryBackend,
        hold_next_status: AtomicBool,
        release: Notify,
    }

    #[async_trait]
    impl Backend for HeldStatusBackend {
        async fn get_nodes(
            &self,
            country: Option<&str>,
            protocol: Option<Protocol>,
        ) -> Result<Vec<Node>, SdkError> {
            self.inner.get_nodes(country, protocol).await
        }

        async fn connect(
            &self,
            node_id: &str,
            protocol: Protocol,
        ) -> Result<ConnectResponse, SdkError> {
            self.inner.connect(node_id, protocol).await
        }

        async fn disconnect(&self) -> Result<(), SdkError> {
            self.inner.disconnect().await
        }

        async fn is_connected(&self) -> Result<bool, SdkError> {
            if self.hold_next_status.swap(false, Ordering::SeqCst) {
                self.release.notified().await;
            }
            self.inner.is_connected().await
        }

        async fn vpn_stats(&self) -> Result<VpnStats, SdkError> {
            self.inner.vpn_stats().await
        }

        async fn current_session(&self) -> Result<Session, SdkError> {
            self.inner.current_session().await
        }

        async fn user_stats(&self) -> Result<UserStats, SdkError> {
            self.inner.user_stats().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn loss_during_disconnect_does_not_reenter_disconnecting() {
        let backend = Arc::new(HeldStatusBackend {
            inner: MemoryBackend::new(vec![node("a", 10.0, true, true)]),
            hold_next_status: AtomicBool::new(false),
            release: Notify::new(),
        });
        let mut manager = ConnectionManager::new(backend.clone(), ConnectionOptions::default());
        let mut events = manager.subscribe();
        manager
            .connect(Some(Arc::new(node("a", 10.0, true, true))), Protocol::Wireguard)
            .await
            .unwrap();

        // The 2 s sample blocks in its liveness query; the tunnel is gone by
        // the time the query answers, which happens after the disconnect began.
        backend.hold_next_status.store(true, Ordering::SeqCst);
        backend.inner.drop_connection();
        let releaser = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                backend.release.notify_one();
            })
        };
        tokio::time::sleep(Duration::from_millis(2500)).await;

        manager.disconnect().await.unwrap();
        releaser.await.unwrap();

        assert_eq!(manager.phase().await, ConnectionPhase::Disconnected);
        assert_eq!(backend.inner.disconnect_calls(), 0);

        let mut phases = Vec::new();
        let mut saw_lost = false;
        while let Ok(event) = events.try_recv() {
            match event {
                ConnectionEvent::PhaseChanged(phase) => phases.push(phase.as_code()),
                ConnectionEvent::ConnectionLost { .. } => saw_lost = true,
                _ => {}
            }
        }
        assert!(saw_lost);
        // Connecting, Connected, Lost, Disconnected
        assert_eq!(phases, vec![1, 2, 4, 0]);
    }

    #[test]
    fn phase_codes_are_stable() {
        let n = Arc::new(node("a", 1.0, true, true));
        assert_eq!(ConnectionPhase::Disconnected.as_code(), 0);
        assert_eq!(
            ConnectionPhase::Connecting {
                node: n.clone(),
                protocol: Protocol::Wireguard
            }
            .as_code(),
            1
        );
        assert_eq!(ConnectionPhase::Lost { node: n }.as_code(), 4);
    }
}
