//! Transport protocol selection.
//!
//! A node's capability flags are authoritative: the user's preferred protocol
//! is only honoured when the node actually supports it.

use serde::{Deserialize, Serialize};

use super::nodes::Node;
use crate::error::SdkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Wireguard,
    Openvpn,
}

impl Protocol {
    /// Wire name used by the control API and the settings file.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Wireguard => "wireguard",
            Protocol::Openvpn => "openvpn",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Protocol::Wireguard => "WireGuard",
            Protocol::Openvpn => "OpenVPN",
        }
    }

    /// The fallback protocol.
    pub fn other(&self) -> Protocol {
        match self {
            Protocol::Wireguard => Protocol::Openvpn,
            Protocol::Openvpn => Protocol::Wireguard,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl std::str::FromStr for Protocol {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wireguard" => Ok(Protocol::Wireguard),
            "openvpn" => Ok(Protocol::Openvpn),
            other => Err(SdkError::InvalidParam(format!("Unknown protocol: {}", other))),
        }
    }
}

/// Pick the protocol to use against `node`.
pub fn resolve(preferred: Protocol, node: &Node) -> Result<Protocol, SdkError> {
    if node.supports(preferred) {
        return Ok(preferred);
    }

    let fallback = preferred.other();
    if node.supports(fallback) {
        log::info!(
            "Node {} does not support {}, falling back to {}",
            node.name,
            preferred,
            fallback
        );
        return Ok(fallback);
    }

    Err(SdkError::NoCompatibleProtocol)
}
