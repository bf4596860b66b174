//! Tokio runtime for async operations.
//!
//! One lazily-initialized multi-thread runtime shared by every client handle.
//! FFI functions drive async work with `runtime().block_on()`; samplers and
//! callback forwarders are spawned onto it.

use once_cell::sync::Lazy;

static RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("aureo-vpn-sdk")
        .build()
        .expect("failed to create tokio runtime")
});

/// Returns a reference to the global Tokio runtime.
pub fn runtime() -> &'static tokio::runtime::Runtime {
    &RUNTIME
}
