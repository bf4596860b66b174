//! C-callable callbacks for state changes, errors, telemetry, the connection
//! clock and connection loss. Each client handle owns its own registry; a forwarder task drains the
//! client's event bus into it.

use std::ffi::CString;
use std::os::raw::{c_char, c_void};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::error::SdkError;
use crate::vpn::connection::ConnectionEvent;
use crate::vpn::telemetry::{format_bytes, format_duration, format_speed, TelemetrySample};

// ── Callback type aliases ───────────────────────────────────────────────────

/// `fn(state_code: i32, user_context: *mut c_void)`
pub type StateCallback = Option<unsafe extern "C" fn(i32, *mut c_void)>;

/// `fn(error_code: i32, message: *const c_char, user_context: *mut c_void)`
pub type ErrorCallback = Option<unsafe extern "C" fn(i32, *const c_char, *mut c_void)>;

/// `fn(telemetry_json: *const c_char, user_context: *mut c_void)`
pub type TelemetryCallback = Option<unsafe extern "C" fn(*const c_char, *mut c_void)>;

/// `fn(node_id: *const c_char, user_context: *mut c_void)`
pub type ConnectionLostCallback = Option<unsafe extern "C" fn(*const c_char, *mut c_void)>;

/// `fn(duration_hhmmss: *const c_char, user_context: *mut c_void)`
pub type DurationCallback = Option<unsafe extern "C" fn(*const c_char, *mut c_void)>;

// ── Send + Sync wrapper for raw pointers ────────────────────────────────────

/// Wrapper so that raw user-context pointers can be stored in a `Mutex`.
/// The caller is responsible for thread-safety of the pointed-to data.
#[derive(Clone, Copy)]
struct SendPtr(*mut c_void);
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

impl Default for SendPtr {
    fn default() -> Self {
        SendPtr(std::ptr::null_mut())
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct CallbackRegistry {
    state_cb: StateCallback,
    state_ctx: SendPtr,

    error_cb: ErrorCallback,
    error_ctx: SendPtr,

    telemetry_cb: TelemetryCallback,
    telemetry_ctx: SendPtr,

    lost_cb: ConnectionLostCallback,
    lost_ctx: SendPtr,

    duration_cb: DurationCallback,
    duration_ctx: SendPtr,
}

pub type SharedCallbacks = Arc<Mutex<CallbackRegistry>>;

impl CallbackRegistry {
    pub fn shared() -> SharedCallbacks {
        Arc::new(Mutex::new(CallbackRegistry::default()))
    }

    pub fn set_state_callback(&mut self, cb: StateCallback, ctx: *mut c_void) {
        self.state_cb = cb;
        self.state_ctx = SendPtr(ctx);
    }

    pub fn set_error_callback(&mut self, cb: ErrorCallback, ctx: *mut c_void) {
        self.error_cb = cb;
        self.error_ctx = SendPtr(ctx);
    }

    pub fn set_telemetry_callback(&mut self, cb: TelemetryCallback, ctx: *mut c_void) {
        self.telemetry_cb = cb;
        self.telemetry_ctx = SendPtr(ctx);
    }

    pub fn set_connection_lost_callback(&mut self, cb: ConnectionLostCallback, ctx: *mut c_void) {
        self.lost_cb = cb;
        self.lost_ctx = SendPtr(ctx);
    }

    pub fn set_duration_callback(&mut self, cb: DurationCallback, ctx: *mut c_void) {
        self.duration_cb = cb;
        self.duration_ctx = SendPtr(ctx);
    }
}

// ── Invocation helpers ──────────────────────────────────────────────────────

/// Notify the host application that the connection phase changed.
pub fn fire_state_change(registry: &Mutex<CallbackRegistry>, state: i32) {
    let reg = registry.lock();
    if let Some(cb) = reg.state_cb {
        let ctx = reg.state_ctx.0;
        // Drop lock before calling into foreign code to avoid deadlocks.
        drop(reg);
        unsafe { cb(state, ctx) };
    }
}

/// Notify the host application of an error.
pub fn fire_error(registry: &Mutex<CallbackRegistry>, code: i32, msg: &str) {
    let reg = registry.lock();
    if let Some(cb) = reg.error_cb {
        let ctx = reg.error_ctx.0;
        drop(reg);
        if let Ok(c_msg) = CString::new(msg) {
            unsafe { cb(code, c_msg.as_ptr(), ctx) };
        }
    }
}

/// Hand a telemetry sample to the host application as JSON.
pub fn fire_telemetry(registry: &Mutex<CallbackRegistry>, sample_json: &str) {
    let reg = registry.lock();
    if let Some(cb) = reg.telemetry_cb {
        let ctx = reg.telemetry_ctx.0;
        drop(reg);
        if let Ok(c_json) = CString::new(sample_json) {
            unsafe { cb(c_json.as_ptr(), ctx) };
        }
    }
}

/// Notify the host application that the tunnel dropped on its own.
pub fn fire_connection_lost(registry: &Mutex<CallbackRegistry>, node_id: &str) {
    let reg = registry.lock();
    if let Some(cb) = reg.lost_cb {
        let ctx = reg.lost_ctx.0;
        drop(reg);
        if let Ok(c_id) = CString::new(node_id) {
            unsafe { cb(c_id.as_ptr(), ctx) };
        }
    }
}

/// Connection clock tick, `HH:MM:SS`. `00:00:00` once the connection ends.
pub fn fire_duration(registry: &Mutex<CallbackRegistry>, formatted: &str) {
    let reg = registry.lock();
    if let Some(cb) = reg.duration_cb {
        let ctx = reg.duration_ctx.0;
        drop(reg);
        if let Ok(c_text) = CString::new(formatted) {
            unsafe { cb(c_text.as_ptr(), ctx) };
        }
    }
}

/// Telemetry sample with display strings alongside the raw numbers.
pub fn telemetry_json(sample: &TelemetrySample) -> serde_json::Value {
    serde_json::json!({
        "download_bps": sample.throughput.down_bytes_per_sec,
        "upload_bps": sample.throughput.up_bytes_per_sec,
        "bytes_received": sample.bytes_received,
        "bytes_sent": sample.bytes_sent,
        "total_transferred": sample.total_transferred,
        "download_speed": format_speed(sample.throughput.down_bytes_per_sec),
        "upload_speed": format_speed(sample.throughput.up_bytes_per_sec),
        "data_transferred": format_bytes(sample.total_transferred),
    })
}

fn dispatch(registry: &Mutex<CallbackRegistry>, event: ConnectionEvent) {
    match event {
        ConnectionEvent::PhaseChanged(phase) => fire_state_change(registry, phase.as_code()),
        ConnectionEvent::Telemetry(sample) => {
            fire_telemetry(registry, &telemetry_json(&sample).to_string())
        }
        ConnectionEvent::ConnectionLost { node } => {
            fire_connection_lost(registry, &node.id);
            let err = SdkError::ConnectionLost;
            fire_error(registry, err.code(), &format!("{}: {}", err, node.name));
        }
        ConnectionEvent::Error(err) => fire_error(registry, err.code(), &err.to_string()),
        ConnectionEvent::Elapsed(elapsed) => fire_duration(registry, &format_duration(elapsed)),
    }
}

/// Forward a client's events to its registered callbacks until the event
/// bus closes.
pub fn spawn_forwarder(
    runtime: &tokio::runtime::Runtime,
    registry: SharedCallbacks,
    mut events: broadcast::Receiver<ConnectionEvent>,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => dispatch(&registry, event),
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Callback forwarder lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        log::debug!("Callback forwarder stopped");
    })
}
