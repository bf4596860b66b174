//! SDK error types, error codes, and last-error storage for the C API.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use thiserror::Error;

// ── Error codes ─────────────────────────────────────────────────────────────

pub const SUCCESS: i32 = 0;
pub const ERROR_INVALID_PARAM: i32 = -1;
pub const ERROR_NOT_INITIALIZED: i32 = -2;
pub const ERROR_ALREADY_CONNECTED: i32 = -3;
pub const ERROR_NOT_CONNECTED: i32 = -4;
pub const ERROR_INTERNAL: i32 = -5;
pub const ERROR_BACKEND: i32 = -6;
pub const ERROR_CONFIG: i32 = -7;
pub const ERROR_STORAGE: i32 = -8;
pub const ERROR_EMPTY_CATALOG: i32 = -9;
pub const ERROR_NO_COMPATIBLE_PROTOCOL: i32 = -10;
pub const ERROR_NO_NODE_SELECTED: i32 = -11;
pub const ERROR_CONNECT_FAILED: i32 = -12;
pub const ERROR_DISCONNECT_FAILED: i32 = -13;
pub const ERROR_CONNECTION_LOST: i32 = -14;
pub const ERROR_IN_PROGRESS: i32 = -15;

// ── SdkError enum ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SdkError {
    #[error("Client not initialized")]
    NotInitialized,

    #[error("No servers available")]
    EmptyCatalog,

    #[error("Server supports neither WireGuard nor OpenVPN")]
    NoCompatibleProtocol,

    #[error("Please select a server first")]
    NoNodeSelected,

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Failed to disconnect: {0}")]
    DisconnectFailed(String),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Connection in progress")]
    ConnectionInProgress,

    #[error("Not connected")]
    NotConnected,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SdkError {
    /// Map this error to its integer error code for the C API.
    pub fn code(&self) -> i32 {
        match self {
            SdkError::NotInitialized => ERROR_NOT_INITIALIZED,
            SdkError::EmptyCatalog => ERROR_EMPTY_CATALOG,
            SdkError::NoCompatibleProtocol => ERROR_NO_COMPATIBLE_PROTOCOL,
            SdkError::NoNodeSelected => ERROR_NO_NODE_SELECTED,
            SdkError::ConnectFailed(_) => ERROR_CONNECT_FAILED,
            SdkError::DisconnectFailed(_) => ERROR_DISCONNECT_FAILED,
            SdkError::ConnectionLost => ERROR_CONNECTION_LOST,
            SdkError::AlreadyConnected => ERROR_ALREADY_CONNECTED,
            SdkError::ConnectionInProgress => ERROR_IN_PROGRESS,
            SdkError::NotConnected => ERROR_NOT_CONNECTED,
            SdkError::Backend(_) => ERROR_BACKEND,
            SdkError::Config(_) => ERROR_CONFIG,
            SdkError::Storage(_) => ERROR_STORAGE,
            SdkError::InvalidParam(_) => ERROR_INVALID_PARAM,
            SdkError::Internal(_) => ERROR_INTERNAL,
        }
    }

    /// The backend's own message for connect/disconnect failures, verbatim.
    pub fn backend_reason(&self) -> Option<&str> {
        match self {
            SdkError::ConnectFailed(msg)
            | SdkError::DisconnectFailed(msg)
            | SdkError::Backend(msg) => Some(msg),
            _ => None,
        }
    }
}

// ── Last-error storage ──────────────────────────────────────────────────────

static LAST_ERROR: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));
static LAST_ERROR_CODE: Lazy<Mutex<i32>> = Lazy::new(|| Mutex::new(SUCCESS));

/// Store a free-form error message for the C caller.
pub fn set_error(msg: impl Into<String>) {
    *LAST_ERROR_CODE.lock() = ERROR_INTERNAL;
    *LAST_ERROR.lock() = Some(msg.into());
}

/// Store an `SdkError`, recording both the message and code.
pub fn set_sdk_error(err: &SdkError) {
    *LAST_ERROR_CODE.lock() = err.code();
    *LAST_ERROR.lock() = Some(err.to_string());
}

/// Clear the stored error.
pub fn clear_error() {
    *LAST_ERROR.lock() = None;
    *LAST_ERROR_CODE.lock() = SUCCESS;
}

/// Take the last error message, leaving `None` behind.
pub fn take_last_error() -> Option<String> {
    LAST_ERROR.lock().take()
}

/// Return the last error code without clearing it.
pub fn last_error_code() -> i32 {
    *LAST_ERROR_CODE.lock()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct() {
        let all = [
            SdkError::NotInitialized,
            SdkError::EmptyCatalog,
            SdkError::NoCompatibleProtocol,
            SdkError::NoNodeSelected,
            SdkError::ConnectFailed(String::new()),
            SdkError::DisconnectFailed(String::new()),
            SdkError::ConnectionLost,
            SdkError::AlreadyConnected,
            SdkError::ConnectionInProgress,
            SdkError::NotConnected,
            SdkError::Backend(String::new()),
            SdkError::Config(String::new()),
            SdkError::Storage(String::new()),
            SdkError::InvalidParam(String::new()),
            SdkError::Internal(String::new()),
        ];
        let mut codes: Vec<i32> = all.iter().map(SdkError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
        assert!(codes.iter().all(|c| *c < SUCCESS));
    }

    #[test]
    fn backend_message_is_preserved_verbatim() {
        let err = SdkError::ConnectFailed("API error (503): node offline".into());
        assert_eq!(err.backend_reason(), Some("API error (503): node offline"));
        assert_eq!(err.to_string(), "Connection failed: API error (503): node offline");
        assert_eq!(SdkError::EmptyCatalog.backend_reason(), None);
    }
}
