//! Aureo VPN SDK: C FFI entry point
//!
//! Exposes `extern "C"` functions for consumption by C#, Python, and other
//! languages via `cdylib`. Every call takes an opaque `AureoClient` handle;
//! async work is dispatched through the shared Tokio runtime
//! (`runtime().block_on()`).

pub mod backend;
pub mod callbacks;
pub mod client;
pub mod config;
pub mod error;
pub mod runtime;
pub mod settings;
pub mod vpn;

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::ptr;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;

use callbacks::{
    spawn_forwarder, telemetry_json, CallbackRegistry, ConnectionLostCallback, DurationCallback,
    ErrorCallback, SharedCallbacks, StateCallback, TelemetryCallback,
};
use client::{SelectionPolicy, VpnClient};
use config::ClientConfig;
use error::{
    clear_error, last_error_code, set_error, set_sdk_error, take_last_error, SdkError, SUCCESS,
};
use runtime::runtime;
use vpn::connection::{ConnectionPhase, ConnectionState};
use vpn::lookup::{flag_url, lookup_public_ip};
use vpn::nodes::{Node, NodeCatalog};
use vpn::protocol::Protocol;
use vpn::telemetry::format_duration;

// ── Client handle ───────────────────────────────────────────────────────────

/// Opaque client handle. Created by `aureo_client_new`, released by
/// `aureo_client_free`.
pub struct AureoClient {
    client: Mutex<VpnClient>,
    callbacks: SharedCallbacks,
    forwarder: JoinHandle<()>,
}

/// Borrow the client behind `handle`.
/// Records `NotInitialized` as the last error when the handle is null.
unsafe fn client_ref<'a>(handle: *const AureoClient) -> Option<&'a AureoClient> {
    let client = handle.as_ref();
    if client.is_none() {
        set_sdk_error(&SdkError::NotInitialized);
    }
    client
}

/// Convenience: run `body` while holding the client lock and turn its result
/// into a status code.
unsafe fn with_client<F>(handle: *const AureoClient, body: F) -> i32
where
    F: FnOnce(&mut VpnClient) -> Result<i32, SdkError>,
{
    let Some(handle) = client_ref(handle) else {
        return SdkError::NotInitialized.code();
    };
    let mut client = handle.client.lock();
    match body(&mut client) {
        Ok(code) => code,
        Err(e) => {
            set_sdk_error(&e);
            e.code()
        }
    }
}

/// Same as [`with_client`] for calls that hand back a JSON string. Null on
/// error.
unsafe fn with_client_json<F>(handle: *const AureoClient, body: F) -> *mut c_char
where
    F: FnOnce(&mut VpnClient) -> Result<Value, SdkError>,
{
    let Some(handle) = client_ref(handle) else {
        return ptr::null_mut();
    };
    let mut client = handle.client.lock();
    match body(&mut client) {
        Ok(value) => json_to_c(&value),
        Err(e) => {
            set_sdk_error(&e);
            ptr::null_mut()
        }
    }
}

/// Allocate a C string on the heap.  Caller frees via `aureo_free_string`.
fn to_c_string(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

fn json_to_c(value: &Value) -> *mut c_char {
    match serde_json::to_string(value) {
        Ok(json) => to_c_string(&json),
        Err(e) => {
            set_error(format!("JSON serialization failed: {}", e));
            ptr::null_mut()
        }
    }
}

/// Read a `*const c_char` into a `&str`, returning `None` on null or invalid UTF-8.
unsafe fn from_c_str<'a>(p: *const c_char) -> Option<&'a str> {
    if p.is_null() {
        return None;
    }
    CStr::from_ptr(p).to_str().ok()
}

/// Like [`from_c_str`] but a null or invalid pointer is a parameter error.
unsafe fn required_str<'a>(p: *const c_char, name: &str) -> Result<&'a str, SdkError> {
    from_c_str(p).ok_or_else(|| SdkError::InvalidParam(format!("{} is null or invalid", name)))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, SdkError> {
    serde_json::to_value(value)
        .map_err(|e| SdkError::Internal(format!("JSON serialization failed: {}", e)))
}

/// Node with display fields added: load bucket and flag image URL.
fn node_json(node: &Node) -> Result<Value, SdkError> {
    let mut value = to_json(node)?;
    if let Value::Object(ref mut map) = value {
        map.insert("load_level".into(), to_json(&node.load_level())?);
        map.insert(
            "flag_url".into(),
            Value::from(flag_url(&node.country_code, &node.country, 40)),
        );
    }
    Ok(value)
}

fn nodes_json<'a>(nodes: impl IntoIterator<Item = &'a std::sync::Arc<Node>>) -> Result<Value, SdkError> {
    nodes
        .into_iter()
        .map(|n| node_json(n))
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array)
}

fn state_json(state: &ConnectionState, catalog: &NodeCatalog) -> Value {
    let phase = state.phase();
    let (node, connected_at, client_ip) = match phase {
        ConnectionPhase::Connected {
            node,
            connected_at,
            client_ip,
            ..
        } => (Some(node), Some(connected_at.to_rfc3339()), client_ip.clone()),
        ConnectionPhase::Connecting { node, .. }
        | ConnectionPhase::Disconnecting { node, .. }
        | ConnectionPhase::Lost { node } => (Some(node), None, None),
        ConnectionPhase::Disconnected => (None, None, None),
    };

    serde_json::json!({
        "state": phase.status_text(),
        "code": phase.as_code(),
        "node_id": node.map(|n| n.id.clone()),
        "node_name": node.map(|n| n.name.clone()),
        "location": node.map(|n| format!("{}, {}", n.city, n.country)),
        "protocol": phase.protocol().map(|p| p.as_str()),
        "client_ip": client_ip,
        "connected_at": connected_at,
        "duration": format_duration(state.elapsed()),
        "selected_node_id": state.selected_node().map(|n| n.id.clone()),
        "session": state.session(),
        "catalog_source": catalog.source().to_string(),
    })
}

// ═══════════════════════════════════════════════════════════════════════════
//  Core
// ═══════════════════════════════════════════════════════════════════════════

/// Create a client from a JSON config (null or empty for defaults).
/// Returns null on error; see `aureo_get_last_error`.
///
/// JSON contract (all fields optional):
/// `{ "api_url": "http://localhost:8080", "access_token": "...", "settings_path": "...",
///    "poll_interval_ms": 2000, "clock_interval_ms": 1000, "request_timeout_ms": 30000,
///    "telemetry_source": "stats", "simulate": false }`
#[no_mangle]
pub unsafe extern "C" fn aureo_client_new(config_json: *const c_char) -> *mut AureoClient {
    clear_error();

    // Initialise logger (ignore errors if already set)
    let _ = env_logger::try_init();

    log::info!("Aureo VPN SDK v{} initialising", env!("CARGO_PKG_VERSION"));

    let raw = from_c_str(config_json).unwrap_or("");
    let config = match ClientConfig::from_json(raw) {
        Ok(c) => c.with_env_overrides(),
        Err(e) => {
            set_sdk_error(&e);
            return ptr::null_mut();
        }
    };

    let client = match VpnClient::new(&config) {
        Ok(c) => c,
        Err(e) => {
            set_sdk_error(&e);
            return ptr::null_mut();
        }
    };

    let callbacks = CallbackRegistry::shared();
    let forwarder = spawn_forwarder(runtime(), callbacks.clone(), client.subscribe());

    log::info!("Aureo VPN client created (api {})", config.api_url);
    Box::into_raw(Box::new(AureoClient {
        client: Mutex::new(client),
        callbacks,
        forwarder,
    }))
}

/// Load the node catalog and auto-connect if that setting is on.
/// Returns 1 if an auto-connect happened, 0 if not, negative on error.
#[no_mangle]
pub unsafe extern "C" fn aureo_client_start(handle: *mut AureoClient) -> i32 {
    clear_error();
    with_client(handle, |client| {
        let connected = runtime().block_on(client.start())?;
        Ok(i32::from(connected.is_some()))
    })
}

/// Tear down a client: disconnect if connected, stop background tasks, free
/// the handle.
#[no_mangle]
pub unsafe extern "C" fn aureo_client_free(handle: *mut AureoClient) {
    clear_error();
    if handle.is_null() {
        return;
    }

    let AureoClient {
        client, forwarder, ..
    } = *Box::from_raw(handle);
    let mut client = client.into_inner();
    runtime().block_on(async {
        // Best-effort disconnect
        if client.connection().phase().await.is_connected() {
            if let Err(e) = client.disconnect().await {
                log::warn!("Disconnect during cleanup failed: {}", e);
            }
        }
        client.shutdown().await;
    });
    forwarder.abort();
    log::info!("Aureo VPN client released");
}

/// Return the SDK version string.  Caller must free with `aureo_free_string`.
#[no_mangle]
pub extern "C" fn aureo_version() -> *mut c_char {
    to_c_string(env!("CARGO_PKG_VERSION"))
}

/// Free a string previously returned by the SDK.
#[no_mangle]
pub unsafe extern "C" fn aureo_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  Nodes
// ═══════════════════════════════════════════════════════════════════════════

/// Re-fetch the node catalog. `country` and `protocol` may be null.
/// Returns the number of nodes, negative on error (the previous catalog is
/// kept).
#[no_mangle]
pub unsafe extern "C" fn aureo_nodes_refresh(
    handle: *mut AureoClient,
    country: *const c_char,
    protocol: *const c_char,
) -> i32 {
    clear_error();

    let country = from_c_str(country).filter(|c| !c.is_empty()).map(str::to_string);
    let protocol = match from_c_str(protocol).filter(|p| !p.is_empty()) {
        Some(p) => match p.parse::<Protocol>() {
            Ok(p) => Some(p),
            Err(e) => {
                set_sdk_error(&e);
                return e.code();
            }
        },
        None => None,
    };

    with_client(handle, |client| {
        let nodes = runtime().block_on(client.refresh_nodes(country.as_deref(), protocol))?;
        Ok(i32::try_from(nodes.len()).unwrap_or(i32::MAX))
    })
}

/// Cached nodes as a JSON array, sorted by load.
/// Caller must free the returned string.
#[no_mangle]
pub unsafe extern "C" fn aureo_nodes_get_json(handle: *mut AureoClient) -> *mut c_char {
    clear_error();
    with_client_json(handle, |client| nodes_json(client.catalog().nodes()))
}

/// Cached nodes whose country, city or name contains `text`.
/// Caller must free the returned string.
#[no_mangle]
pub unsafe extern "C" fn aureo_nodes_search_json(
    handle: *mut AureoClient,
    text: *const c_char,
) -> *mut c_char {
    clear_error();
    let text = from_c_str(text).unwrap_or("").to_string();
    with_client_json(handle, |client| nodes_json(&client.search(&text)))
}

/// Cached nodes suitable for P2P traffic (load under 60), sorted by load.
/// Caller must free the returned string.
#[no_mangle]
pub unsafe extern "C" fn aureo_nodes_p2p_json(handle: *mut AureoClient) -> *mut c_char {
    clear_error();
    with_client_json(handle, |client| nodes_json(&client.p2p_nodes()))
}

/// Remember `node_id` as the target for `aureo_connect(.., 3)`.
#[no_mangle]
pub unsafe extern "C" fn aureo_select_node(
    handle: *mut AureoClient,
    node_id: *const c_char,
) -> i32 {
    clear_error();
    with_client(handle, |client| {
        let node_id = required_str(node_id, "node_id")?;
        runtime().block_on(client.select_node(node_id))?;
        Ok(SUCCESS)
    })
}

// ═══════════════════════════════════════════════════════════════════════════
//  Connection
// ═══════════════════════════════════════════════════════════════════════════

/// Connect using a selection policy.
///
/// | Policy | Node                                  |
/// |--------|---------------------------------------|
/// |   0    | Quick: lowest load                    |
/// |   1    | Secure: lowest load                   |
/// |   2    | Random                                |
/// |   3    | The node chosen by `aureo_select_node` |
#[no_mangle]
pub unsafe extern "C" fn aureo_connect(handle: *mut AureoClient, policy: i32) -> i32 {
    clear_error();
    with_client(handle, |client| {
        let policy = SelectionPolicy::from_code(policy)?;
        runtime().block_on(client.connect(policy))?;
        Ok(SUCCESS)
    })
}

/// Disconnect from the VPN.  Returns 0 on success.
#[no_mangle]
pub unsafe extern "C" fn aureo_disconnect(handle: *mut AureoClient) -> i32 {
    clear_error();
    with_client(handle, |client| {
        runtime().block_on(client.disconnect())?;
        Ok(SUCCESS)
    })
}

/// Disconnect (if connected) and connect to `node_id`.
#[no_mangle]
pub unsafe extern "C" fn aureo_switch_server(
    handle: *mut AureoClient,
    node_id: *const c_char,
) -> i32 {
    clear_error();
    with_client(handle, |client| {
        let node_id = required_str(node_id, "node_id")?;
        runtime().block_on(client.switch_server(node_id))?;
        Ok(SUCCESS)
    })
}

/// Get the current connection state as an integer code.
///
/// | Code | State               |
/// |------|---------------------|
/// |  0   | Disconnected        |
/// |  1   | Connecting          |
/// |  2   | Connected           |
/// |  3   | Disconnecting       |
/// |  4   | Lost                |
/// | -2   | Null client handle  |
#[no_mangle]
pub unsafe extern "C" fn aureo_get_state(handle: *mut AureoClient) -> i32 {
    with_client(handle, |client| {
        Ok(runtime().block_on(client.connection().phase()).as_code())
    })
}

/// Get detailed connection state as JSON.  Caller must free the returned
/// string.
///
/// JSON shape:
/// ```json
/// {
///   "state": "Connected",
///   "code": 2,
///   "node_id": "fra-1",
///   "node_name": "Frankfurt 1",
///   "location": "Frankfurt, Germany",
///   "protocol": "wireguard",
///   "client_ip": "10.8.0.2",
///   "connected_at": "2024-01-01T00:00:00+00:00",
///   "duration": "00:05:12",
///   "selected_node_id": "fra-1",
///   "session": { ... },
///   "catalog_source": "API"
/// }
/// ```
#[no_mangle]
pub unsafe extern "C" fn aureo_get_state_json(handle: *mut AureoClient) -> *mut c_char {
    clear_error();
    with_client_json(handle, |client| {
        let state = runtime().block_on(client.state());
        Ok(state_json(&state, client.catalog()))
    })
}

/// Latest telemetry sample as JSON, or null when nothing has been sampled
/// since connecting. Caller must free the returned string.
#[no_mangle]
pub unsafe extern "C" fn aureo_get_telemetry_json(handle: *mut AureoClient) -> *mut c_char {
    clear_error();
    let Some(handle) = client_ref(handle) else {
        return ptr::null_mut();
    };
    let client = handle.client.lock();
    let (sample, elapsed) = runtime().block_on(async {
        (
            client.connection().telemetry().await,
            client.connection().elapsed().await,
        )
    });
    match sample {
        Some(sample) => {
            let mut value = telemetry_json(&sample);
            value["duration"] = Value::from(format_duration(elapsed));
            json_to_c(&value)
        }
        None => ptr::null_mut(),
    }
}

/// Account usage totals as JSON. Caller must free the returned string.
///
/// JSON shape: `{"total_sessions":12,"active_sessions":1,"data_transferred_gb":3.2}`
#[no_mangle]
pub unsafe extern "C" fn aureo_get_user_stats_json(handle: *mut AureoClient) -> *mut c_char {
    clear_error();
    with_client_json(handle, |client| {
        let stats = runtime().block_on(client.user_stats())?;
        to_json(&stats)
    })
}

// ═══════════════════════════════════════════════════════════════════════════
//  Settings
// ═══════════════════════════════════════════════════════════════════════════

/// All settings as JSON. Caller must free the returned string.
#[no_mangle]
pub unsafe extern "C" fn aureo_settings_get_json(handle: *mut AureoClient) -> *mut c_char {
    clear_error();
    with_client_json(handle, |client| to_json(client.settings().settings()))
}

/// Set one setting. `value_json` is a JSON value, e.g. `true` or `"openvpn"`.
/// The change is written to disk before it takes effect.
#[no_mangle]
pub unsafe extern "C" fn aureo_settings_set(
    handle: *mut AureoClient,
    key: *const c_char,
    value_json: *const c_char,
) -> i32 {
    clear_error();
    with_client(handle, |client| {
        let key = required_str(key, "key")?;
        let raw = required_str(value_json, "value_json")?;
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| SdkError::InvalidParam(format!("Invalid value_json: {}", e)))?;
        client.set_setting(key, value)?;
        Ok(SUCCESS)
    })
}

// ═══════════════════════════════════════════════════════════════════════════
//  Display helpers
// ═══════════════════════════════════════════════════════════════════════════

/// Look up this machine's public IP. Returns null if it cannot be
/// determined. Caller must free the returned string.
#[no_mangle]
pub extern "C" fn aureo_get_public_ip() -> *mut c_char {
    match runtime().block_on(lookup_public_ip()) {
        Some(ip) => to_c_string(&ip),
        None => ptr::null_mut(),
    }
}

/// Flag image URL for a country. Either argument may be null.
/// Caller must free the returned string.
#[no_mangle]
pub unsafe extern "C" fn aureo_flag_url(
    country_code: *const c_char,
    country_name: *const c_char,
    width: u32,
) -> *mut c_char {
    let code = from_c_str(country_code).unwrap_or("");
    let name = from_c_str(country_name).unwrap_or("");
    to_c_string(&flag_url(code, name, width))
}

// ═══════════════════════════════════════════════════════════════════════════
//  Callbacks
// ═══════════════════════════════════════════════════════════════════════════

/// Register a callback for connection state changes.
///
/// Signature: `fn(state_code: i32, user_context: *mut c_void)`
#[no_mangle]
pub unsafe extern "C" fn aureo_on_state_change(
    handle: *mut AureoClient,
    cb: StateCallback,
    ctx: *mut c_void,
) {
    if let Some(handle) = client_ref(handle) {
        handle.callbacks.lock().set_state_callback(cb, ctx);
    }
}

/// Register a callback for errors.
///
/// Signature: `fn(error_code: i32, message: *const c_char, user_context: *mut c_void)`
#[no_mangle]
pub unsafe extern "C" fn aureo_on_error(
    handle: *mut AureoClient,
    cb: ErrorCallback,
    ctx: *mut c_void,
) {
    if let Some(handle) = client_ref(handle) {
        handle.callbacks.lock().set_error_callback(cb, ctx);
    }
}

/// Register a callback for telemetry samples (every poll while connected).
///
/// Signature: `fn(telemetry_json: *const c_char, user_context: *mut c_void)`
#[no_mangle]
pub unsafe extern "C" fn aureo_on_telemetry(
    handle: *mut AureoClient,
    cb: TelemetryCallback,
    ctx: *mut c_void,
) {
    if let Some(handle) = client_ref(handle) {
        handle.callbacks.lock().set_telemetry_callback(cb, ctx);
    }
}

/// Register a callback for an unexpected loss of the tunnel.
///
/// Signature: `fn(node_id: *const c_char, user_context: *mut c_void)`
#[no_mangle]
pub unsafe extern "C" fn aureo_on_connection_lost(
    handle: *mut AureoClient,
    cb: ConnectionLostCallback,
    ctx: *mut c_void,
) {
    if let Some(handle) = client_ref(handle) {
        handle.callbacks.lock().set_connection_lost_callback(cb, ctx);
    }
}

/// Register a callback for the connection clock: once a second while
/// connected, and `00:00:00` when the connection ends.
///
/// Signature: `fn(duration_hhmmss: *const c_char, user_context: *mut c_void)`
#[no_mangle]
pub unsafe extern "C" fn aureo_on_duration(
    handle: *mut AureoClient,
    cb: DurationCallback,
    ctx: *mut c_void,
) {
    if let Some(handle) = client_ref(handle) {
        handle.callbacks.lock().set_duration_callback(cb, ctx);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  Error
// ═══════════════════════════════════════════════════════════════════════════

/// Get the last error message.  Returns null if no error.
/// Caller must free the returned string.
#[no_mangle]
pub extern "C" fn aureo_get_last_error() -> *mut c_char {
    match take_last_error() {
        Some(msg) => to_c_string(&msg),
        None => ptr::null_mut(),
    }
}

/// Get the last error code.  Returns 0 (`SUCCESS`) if no error.
#[no_mangle]
pub extern "C" fn aureo_get_last_error_code() -> i32 {
    last_error_code()
}

/// Clear the stored error state.
#[no_mangle]
pub extern "C" fn aureo_clear_error() {
    clear_error();
}
