//! HTTP negotiate step.
//!
//! `POST {hub_url}/negotiate?negotiateVersion=1` with the bearer token and
//! tenant header. The response names the connection and carries the token
//! the socket URL must present.

use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::HubError;

/// Tenant routing header sent on negotiate and on the socket upgrade.
pub const TENANT_HEADER: &str = "X-Tenant";

/// Negotiate protocol version requested by this client.
pub const NEGOTIATE_VERSION: &str = "1";

/// Body returned by the negotiate endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    /// Server-side connection id.
    #[serde(default)]
    pub connection_id: Option<String>,
    /// Token to present as `?id=` on the socket URL.
    #[serde(default)]
    pub connection_token: Option<String>,
    /// Negotiate version the server speaks.
    #[serde(default)]
    pub negotiate_version: Option<u32>,
}

/// Result of a successful negotiate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Server-side connection id (may be empty if the server omitted it).
    pub connection_id: String,
    /// Token for the socket URL.
    pub connection_token: String,
}

/// Negotiate endpoint for a hub URL.
pub fn negotiate_url(hub_url: &str) -> String {
    format!("{}/negotiate", hub_url.trim_end_matches('/'))
}

/// Run the negotiate request.
///
/// # Errors
///
/// Returns [`HubError::Negotiate`] on network failure, non-2xx status,
/// an unparseable body, or a body without `connectionToken`.
pub async fn negotiate(
    http: &Client,
    hub_url: &str,
    access_token: &str,
    tenant_id: &str,
) -> Result<Negotiated, HubError> {
    let url = negotiate_url(hub_url);
    log::debug!("[Hub] Negotiating at {url}");

    let response = http
        .post(&url)
        .query(&[("negotiateVersion", NEGOTIATE_VERSION)])
        .bearer_auth(access_token)
        .header(TENANT_HEADER, tenant_id)
        .send()
        .await
        .map_err(|e| HubError::Negotiate(format!("request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(HubError::Negotiate(format!("HTTP {status}")));
    }

    let body: NegotiateResponse = response
        .json()
        .await
        .map_err(|e| HubError::Negotiate(format!("invalid response body: {e}")))?;

    let connection_token = body
        .connection_token
        .filter(|token| !token.is_empty())
        .ok_or_else(|| HubError::Negotiate("response has no connectionToken".into()))?;

    Ok(Negotiated {
        connection_id: body.connection_id.unwrap_or_default(),
        connection_token,
    })
}
