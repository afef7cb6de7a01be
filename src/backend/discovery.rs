use std::time::Duration;

use neolia_api::panel::PanelDiscoveryResult;

use crate::error::{ApiError, ApiResult};
use crate::fields::{FieldSchema, Fields};

const DISCOVERY_SCHEMA: FieldSchema =
    FieldSchema::new(&["mqttHost", "mqttWsPort"]).recommended(&["haBaseUrl", "haToken"]);

/// Client for the Neolia configurator, which maps a panel's 4 digit code to
/// its MQTT and Home Assistant endpoints.
pub struct DiscoveryClient {
    base_url: String,
    http: reqwest::Client,
}

impl DiscoveryClient {
    const DEFAULT_TIMEOUT_SECS: u64 = 10;

    pub fn new(base_url: &str) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(Self::DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn validate_code(code: &str) -> ApiResult<&str> {
        let code = code.trim();
        if code.len() == 4 && code.bytes().all(|b| b.is_ascii_digit()) {
            Ok(code)
        } else {
            Err(ApiError::validation("Neolia code must contain 4 digits"))
        }
    }

    pub async fn discover(&self, code: &str) -> ApiResult<PanelDiscoveryResult> {
        if self.base_url.is_empty() {
            return Err(ApiError::config("Neolia discovery URL not configured"));
        }
        let code = Self::validate_code(code)?;

        let url = format!("{}/api/panels/resolve", self.base_url);
        log::debug!("Resolving panel code {code} at {url}");

        let response = self
            .http
            .get(&url)
            .query(&[("code", code)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if !body.is_empty() {
                log::debug!("Discovery returned {status}: {body}");
            }
            return Err(ApiError::http_status("Neolia discovery failed", status));
        }

        let body: serde_json::Value = response.json().await?;
        let fields = Fields::from_value(body).ok_or_else(|| {
            ApiError::InvalidResponse("invalid discovery response: not an object".to_string())
        })?;

        let report = DISCOVERY_SCHEMA.check(&fields);
        if !report.is_valid() {
            log::error!(
                "Discovery response misses required fields: {:?}",
                report.missing_required
            );
            return Err(ApiError::InvalidResponse(
                "invalid discovery response: MQTT host/port missing".to_string(),
            ));
        }
        if !report.missing_recommended.is_empty() {
            log::warn!(
                "Discovery response without Home Assistant credentials: {:?}",
                report.missing_recommended
            );
        }

        Ok(PanelDiscoveryResult {
            ha_base_url: fields.string("haBaseUrl"),
            ha_token: fields.string("haToken"),
            mqtt_host: fields.string("mqttHost"),
            mqtt_ws_port: fields.port("mqttWsPort"),
            mqtt_username: fields.string("mqttUsername"),
            mqtt_password: fields.string("mqttPassword"),
        })
    }
}

/// Resolves `code` against the configurator at `base_url`.
pub async fn resolve_panel_config_by_code(
    base_url: &str,
    code: &str,
) -> ApiResult<PanelDiscoveryResult> {
    DiscoveryClient::new(base_url)?.discover(code).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{Value, json};

    use crate::backend::discovery::resolve_panel_config_by_code;
    use crate::error::ApiError;
    use crate::test_support::serve;

    fn router(reply: Result<Value, StatusCode>, hits: Arc<AtomicUsize>) -> Router {
        Router::new().route(
            "/api/panels/resolve",
            get(move |Query(query): Query<Vec<(String, String)>>| {
                let reply = reply.clone();
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(query, [("code".to_string(), "1234".to_string())]);
                    reply.map(Json)
                }
            }),
        )
    }

    #[tokio::test]
    async fn resolves_code() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(router(
            Ok(json!({
                "haBaseUrl": "http://192.168.1.80:8123",
                "haToken": "tok",
                "mqttHost": "192.168.1.80",
                "mqttWsPort": 1884,
            })),
            hits.clone(),
        ))
        .await;

        let res = resolve_panel_config_by_code(&format!("{base}/"), " 1234 ").await.unwrap();

        assert_eq!(res.ha_base_url, "http://192.168.1.80:8123");
        assert_eq!(res.mqtt_host, "192.168.1.80");
        assert_eq!(res.mqtt_ws_port, 1884);
        assert_eq!(res.mqtt_username, "");
        assert!(res.has_hass_credentials());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bad_codes_never_reach_the_network() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(router(Ok(json!({})), hits.clone())).await;

        for code in ["12a4", "123", "12345", "", "١٢٣٤"] {
            let err = resolve_panel_config_by_code(&base, code).await.unwrap_err();
            assert!(matches!(err, ApiError::Validation(_)), "{code}: {err}");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn http_error_carries_status() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(router(Err(StatusCode::INTERNAL_SERVER_ERROR), hits)).await;

        let err = resolve_panel_config_by_code(&base, "1234").await.unwrap_err();
        assert!(err.to_string().contains("500"), "{err}");
    }

    #[tokio::test]
    async fn missing_mqtt_host_is_rejected() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(router(
            Ok(json!({ "mqttWsPort": 1884, "haBaseUrl": "x", "haToken": "y" })),
            hits,
        ))
        .await;

        let err = resolve_panel_config_by_code(&base, "1234").await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponse(_)));
        assert!(err.to_string().contains("MQTT host/port missing"), "{err}");
    }

    #[tokio::test]
    async fn missing_ha_credentials_still_succeeds() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(router(
            Ok(json!({ "mqttHost": "10.0.0.2", "mqttWsPort": "9001" })),
            hits,
        ))
        .await;

        let res = resolve_panel_config_by_code(&base, "1234").await.unwrap();
        assert_eq!(res.mqtt_ws_port, 9001);
        assert!(!res.has_hass_credentials());
    }

    #[tokio::test]
    async fn empty_base_url_is_a_config_error() {
        let err = resolve_panel_config_by_code("  ", "1234").await.unwrap_err();
        assert!(matches!(err, ApiError::Config(_)));
    }
}
