//! Control API client.
//!
//! Talks to the Aureo control API over HTTP. The API owns the tunnel; this
//! client only tracks which session it opened so that liveness and counters
//! can be read back from it.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::{Backend, ConnectResponse, UserStats, VpnStats};
use crate::error::SdkError;
use crate::vpn::nodes::Node;
use crate::vpn::protocol::Protocol;
use crate::vpn::session::Session;

#[derive(Debug, Deserialize)]
struct NodeListResponse {
    #[serde(default)]
    nodes: Vec<Node>,
}

#[derive(Debug, Serialize)]
struct CreateSessionRequest<'a> {
    node_id: &'a str,
    protocol: Protocol,
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    session: Session,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

/// Format an error response the way the control API's own clients do.
fn api_error_message(status: u16, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorResponse>(body) {
        if !parsed.message.is_empty() {
            return format!("API error ({}): {}", status, parsed.message);
        }
        if !parsed.error.is_empty() {
            return format!("API error ({}): {}", status, parsed.error);
        }
    }
    format!("API error ({}): {}", status, body)
}

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
    /// Session opened by this client, if any.
    active: Mutex<Option<Session>>,
}

impl HttpBackend {
    pub fn new(
        base_url: &str,
        access_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SdkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SdkError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.filter(|t| !t.is_empty()),
            active: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, SdkError> {
        let request = match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        request
            .send()
            .await
            .map_err(|e| SdkError::Backend(format!("Failed to perform request: {}", e)))
    }

    async fn check(response: Response) -> Result<Response, SdkError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        log::error!("API error {}: {}", status, body);
        Err(SdkError::Backend(api_error_message(status.as_u16(), &body)))
    }

    fn active_session_id(&self) -> Option<String> {
        self.active.lock().as_ref().map(|s| s.id.clone())
    }

    /// Fetch the tracked session. `Ok(None)` once the API no longer knows it.
    async fn fetch_active(&self) -> Result<Option<Session>, SdkError> {
        let Some(id) = self.active_session_id() else {
            return Ok(None);
        };

        let response = self
            .send(self.client.get(self.url(&format!("/api/v1/sessions/{}", id))))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            log::info!("Session {} no longer exists", id);
            *self.active.lock() = None;
            return Ok(None);
        }

        let session: Session = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| SdkError::Backend(format!("Failed to parse session response: {}", e)))?;

        *self.active.lock() = Some(session.clone());
        Ok(Some(session))
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn get_nodes(
        &self,
        country: Option<&str>,
        protocol: Option<Protocol>,
    ) -> Result<Vec<Node>, SdkError> {
        let mut params: Vec<(&str, &str)> = Vec::new();
        if let Some(country) = country.filter(|c| !c.is_empty()) {
            params.push(("country", country));
        }
        if let Some(protocol) = protocol {
            params.push(("protocol", protocol.as_str()));
        }

        log::debug!("Fetching nodes from {}", self.base_url);
        let response = self
            .send(self.client.get(self.url("/api/v1/nodes")).query(&params))
            .await?;
        let list: NodeListResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| SdkError::Backend(format!("Failed to parse nodes response: {}", e)))?;
        Ok(list.nodes)
    }

    async fn connect(
        &self,
        node_id: &str,
        protocol: Protocol,
    ) -> Result<ConnectResponse, SdkError> {
        let body = CreateSessionRequest { node_id, protocol };
        let response = self
            .send(self.client.post(self.url("/api/v1/sessions")).json(&body))
            .await?;
        let created: CreateSessionResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| SdkError::Backend(format!("Failed to parse session response: {}", e)))?;

        let session = created.session;
        log::info!("Session {} created on node {}", session.id, node_id);
        let client_ip = Some(session.client_ip.clone()).filter(|ip| !ip.is_empty());
        *self.active.lock() = Some(session.clone());
        Ok(ConnectResponse::established(Some(session), client_ip))
    }

    async fn disconnect(&self) -> Result<(), SdkError> {
        let Some(id) = self.active_session_id() else {
            return Ok(());
        };

        let response = self
            .send(self.client.delete(self.url(&format!("/api/v1/sessions/{}", id))))
            .await?;
        if response.status() != StatusCode::NOT_FOUND {
            Self::check(response).await?;
        }
        *self.active.lock() = None;
        Ok(())
    }

    async fn is_connected(&self) -> Result<bool, SdkError> {
        Ok(self.fetch_active().await?.map_or(false, |s| s.is_active()))
    }

    async fn vpn_stats(&self) -> Result<VpnStats, SdkError> {
        match self.fetch_active().await? {
            Some(session) if session.is_active() => Ok(VpnStats {
                connected: true,
                node_name: String::new(),
                bytes_received: session.bytes_received,
                bytes_sent: session.bytes_sent,
                latest_handshake: None,
                node_id: session.node_id,
            }),
            _ => Ok(VpnStats::default()),
        }
    }

    async fn current_session(&self) -> Result<Session, SdkError> {
        self.fetch_active().await?.ok_or(SdkError::NotConnected)
    }

    async fn user_stats(&self) -> Result<UserStats, SdkError> {
        let response = self
            .send(self.client.get(self.url("/api/v1/user/stats")))
            .await?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| SdkError::Backend(format!("Failed to parse user stats response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_prefers_message_then_error_then_body() {
        assert_eq!(
            api_error_message(401, r#"{"error":"unauthorized","message":"token expired"}"#),
            "API error (401): token expired"
        );
        assert_eq!(
            api_error_message(503, r#"{"error":"node offline"}"#),
            "API error (503): node offline"
        );
        assert_eq!(
            api_error_message(500, "upstream exploded"),
            "API error (500): upstream exploded"
        );
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let backend =
            HttpBackend::new("http://localhost:8080/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(backend.url("/api/v1/nodes"), "http://localhost:8080/api/v1/nodes");
    }

    #[test]
    fn empty_token_is_treated_as_absent() {
        let backend =
            HttpBackend::new("http://localhost:8080", Some(String::new()), Duration::from_secs(1))
                .unwrap();
        assert!(backend.access_token.is_none());
    }

    #[test]
    fn node_list_tolerates_extra_fields() {
        let parsed: NodeListResponse = serde_json::from_str(
            r#"{"nodes":[{"id":"a","load_score":3.0,"is_operator_owned":true}],
                "total_count":1,"count":1,"source":"db"}"#,
        )
        .unwrap();
        assert_eq!(parsed.nodes.len(), 1);
        assert_eq!(parsed.nodes[0].id, "a");
    }

    #[test]
    fn created_session_with_blank_protocol_still_parses() {
        let created: CreateSessionResponse = serde_json::from_str(
            r#"{"session":{"id":"s1","node_id":"fra-1","protocol":"","status":"active"},
                "config":"[Interface]"}"#,
        )
        .unwrap();
        assert_eq!(created.session.id, "s1");
        assert_eq!(created.session.protocol, None);
    }

    #[tokio::test]
    async fn disconnect_without_session_is_a_no_op() {
        let backend =
            HttpBackend::new("http://127.0.0.1:9", None, Duration::from_millis(50)).unwrap();
        assert_eq!(backend.disconnect().await, Ok(()));
        assert_eq!(backend.is_connected().await, Ok(false));
        assert_eq!(backend.current_session().await, Err(SdkError::NotConnected));
    }
}
