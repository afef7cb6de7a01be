use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use neolia_api::panel::{NeoliaPanelConfig, PanelPairing};

use crate::error::{ApiError, ApiResult};
use crate::fields::Fields;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HassState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_changed: Option<String>,
}

#[derive(Debug, Serialize)]
struct PairRequest<'a> {
    code: &'a str,
    panel_id: &'a str,
}

pub struct HassClient {
    base_url: String,
    http: reqwest::Client,
    token: Option<String>,
}

impl HassClient {
    const DEFAULT_TIMEOUT_SECS: u64 = 10;
    const PAIR_TIMEOUT_MS: u64 = 1800;
    pub const PANEL_CONFIG_SENSOR: &'static str = "sensor.neolia_panel_config";

    pub fn new(base_url: &str) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(Self::DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            http,
            token: None,
        })
    }

    pub fn with_token(base_url: &str, token: &str) -> ApiResult<Self> {
        let mut client = Self::new(base_url)?;
        client.set_token(token)?;
        Ok(client)
    }

    pub fn set_token(&mut self, token: &str) -> ApiResult<()> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ApiError::config("Home Assistant token not configured"));
        }
        self.token = Some(token.to_string());
        Ok(())
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint_url(&self, endpoint: &str) -> ApiResult<Url> {
        if self.base_url.is_empty() {
            return Err(ApiError::config("Home Assistant URL is empty"));
        }
        Ok(Url::parse(&format!(
            "{}/{}",
            self.base_url,
            endpoint.trim_start_matches('/')
        ))?)
    }

    fn token(&self) -> ApiResult<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| ApiError::config("Home Assistant token not initialized"))
    }

    async fn check_status(
        &self,
        response: reqwest::Response,
        action: &str,
    ) -> ApiResult<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !body.is_empty() {
            log::debug!("Home Assistant {action} returned {status}: {body}");
        }

        if status == StatusCode::UNAUTHORIZED {
            log::warn!("Home Assistant unauthorized during {action}. Verify the access token");
        }

        Err(ApiError::http_status(
            format!("Home Assistant error during {action}"),
            status,
        ))
    }

    /// Reads the panel configuration Home Assistant publishes as the state
    /// of [`Self::PANEL_CONFIG_SENSOR`]. That state is itself a JSON
    /// document, so payload problems surface as [`ApiError::InvalidFormat`].
    pub async fn fetch_panel_config(&self) -> ApiResult<NeoliaPanelConfig> {
        let sensor = Self::PANEL_CONFIG_SENSOR;
        let url = self.endpoint_url(&format!("/api/states/{sensor}"))?;
        let response = self.http.get(url).bearer_auth(self.token()?).send().await?;
        let response = self
            .check_status(response, &format!("GET /api/states/{sensor}"))
            .await?;
        let body: Value = response.json().await?;

        parse_panel_config(&body)
    }

    /// `GET /api/config` with the configured token. Never fails, any error
    /// counts as unreachable.
    pub async fn test_connection(&self) -> bool {
        let Ok(url) = self.endpoint_url("/api/config") else {
            return false;
        };
        let Ok(token) = self.token() else {
            return false;
        };
        match self.http.get(url).bearer_auth(token).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                log::debug!("Home Assistant connection test failed: {err}");
                false
            }
        }
    }

    /// LAN pairing through the Neolia integration: trades the panel's SN4
    /// code for the Home Assistant url and the panel token.
    pub async fn pair_panel(&self, code: &str, panel_id: &str) -> ApiResult<PanelPairing> {
        let code = code.trim();
        if code.chars().count() != 4 {
            return Err(ApiError::validation("invalid panel code (SN4 required)"));
        }

        let url = self.endpoint_url("/api/neolia/pair")?;
        let response = self
            .http
            .post(url)
            .timeout(Duration::from_millis(Self::PAIR_TIMEOUT_MS))
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&PairRequest {
                code,
                panel_id: panel_id.trim(),
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let context = match status {
                StatusCode::UNAUTHORIZED => "SN4 code mismatch",
                StatusCode::CONFLICT => "SN4 code not set in Home Assistant",
                StatusCode::FORBIDDEN => "request refused (not LAN)",
                _ => "Home Assistant pairing failed",
            };
            return Err(ApiError::http_status(context, status));
        }

        let mut body: Value = response.json().await?;
        // some native http stacks hand the document back as a JSON string
        if let Value::String(text) = &body {
            body = serde_json::from_str(text).unwrap_or(Value::Null);
        }

        let ha_url = body.get("ha_url").and_then(Value::as_str).unwrap_or_default();
        if ha_url.is_empty() {
            return Err(ApiError::InvalidResponse(
                "pairing response missing ha_url".to_string(),
            ));
        }

        let token = body.get("token").and_then(Value::as_str).unwrap_or_default();
        if token.is_empty() {
            log::warn!("Pairing succeeded but Home Assistant returned no token");
            return Err(ApiError::InvalidResponse(
                "pairing succeeded but token missing".to_string(),
            ));
        }

        Ok(PanelPairing {
            ha_url: ha_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    pub fn ws_endpoint_url(&self) -> ApiResult<Url> {
        let mut url = self.endpoint_url("/api/websocket")?;
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme).map_err(|()| {
            ApiError::service_error("Failed to convert HA url scheme for websocket".to_string())
        })?;
        Ok(url)
    }
}

fn parse_panel_config(body: &Value) -> ApiResult<NeoliaPanelConfig> {
    let invalid = || ApiError::InvalidFormat(HassClient::PANEL_CONFIG_SENSOR.to_string());

    let Some(state) = body.get("state").and_then(Value::as_str) else {
        log::error!("Panel config sensor has no string state: {body}");
        return Err(invalid());
    };

    let inner = serde_json::from_str::<Value>(state).map_err(|err| {
        log::error!("Cannot parse panel config sensor state {state:?}: {err}");
        invalid()
    })?;

    let fields = Fields::from_value(inner).ok_or_else(invalid)?;

    Ok(NeoliaPanelConfig {
        neolia_code: fields.string("neolia_code"),
        panel_host: fields.string("panel_host"),
        mqtt_ws_port: fields.port("mqtt_ws_port"),
    })
}

/// Fetches the Home Assistant published panel configuration for the given
/// instance.
pub async fn fetch_neolia_panel_config(
    base_url: &str,
    token: &str,
) -> ApiResult<NeoliaPanelConfig> {
    HassClient::with_token(base_url, token)?
        .fetch_panel_config()
        .await
}
