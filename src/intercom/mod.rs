pub mod listener;

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use url::Url;
use uuid::Uuid;

use neolia_api::config::IntercomConfig;
use neolia_api::intercom::{CallStatus, IntercomCall};

use crate::error::{ApiError, ApiResult};

pub use self::listener::IncomingCallListener;

#[derive(Debug, Deserialize)]
struct WebhookReply {
    #[serde(default)]
    room: String,
    #[serde(default)]
    caller_token: String,
    #[serde(default)]
    callee_token: String,
    #[serde(default)]
    livekit_url: String,
}

/// Push notification payload announcing a call with pre-issued tokens.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallNotification {
    #[serde(default)]
    pub call_id: String,
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub caller_token: String,
    #[serde(default)]
    pub callee_token: String,
    #[serde(default)]
    pub livekit_url: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
}

pub struct IntercomClient {
    backend_url: Url,
    http: reqwest::Client,
}

impl IntercomClient {
    const DEFAULT_TIMEOUT_SECS: u64 = 10;

    pub fn new(config: &IntercomConfig) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(Self::DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            backend_url: config.backend_url.clone(),
            http,
        })
    }

    /// Asks the intercom backend to place a test call from `from` to `to`.
    pub async fn simulate_incoming_call(&self, from: &str, to: &str) -> ApiResult<IntercomCall> {
        let url = Url::parse(&format!(
            "{}/webhook/call",
            self.backend_url.as_str().trim_end_matches('/')
        ))?;
        let response = self
            .http
            .post(url)
            .form(&[("from_num", from), ("to", to), ("video", "yes")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::http_status("Failed to create call", status));
        }

        let reply: WebhookReply = response.json().await?;
        log::info!("Intercom call created in room {}", reply.room);

        Ok(IntercomCall {
            id: Uuid::new_v4().to_string(),
            room: reply.room,
            caller_token: reply.caller_token,
            callee_token: reply.callee_token,
            livekit_url: reply.livekit_url,
            from: from.to_string(),
            to: to.to_string(),
            status: CallStatus::Ringing,
            start_time: Utc::now(),
            video_enabled: true,
            audio_enabled: true,
        })
    }
}

#[must_use]
pub fn handle_incoming_call_notification(payload: CallNotification) -> IntercomCall {
    IntercomCall {
        id: payload.call_id,
        room: payload.room,
        caller_token: payload.caller_token,
        callee_token: payload.callee_token,
        livekit_url: payload.livekit_url,
        from: payload.from,
        to: payload.to,
        status: CallStatus::Ringing,
        start_time: Utc::now(),
        video_enabled: true,
        audio_enabled: true,
    }
}
