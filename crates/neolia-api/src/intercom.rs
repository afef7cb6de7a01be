use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    #[default]
    Ringing,
    Active,
    Ended,
}

/// A call placed by the door intercom. Tokens grant access to the LiveKit
/// room for each side.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IntercomCall {
    #[serde(default)]
    pub id: String,
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
    #[serde(default)]
    pub status: CallStatus,
    /// Milliseconds since the epoch on the wire.
    #[serde(with = "chrono::serde::ts_milliseconds", default = "Utc::now")]
    pub start_time: DateTime<Utc>,
    #[serde(default = "enabled")]
    pub video_enabled: bool,
    #[serde(default = "enabled")]
    pub audio_enabled: bool,
}

const fn enabled() -> bool {
    true
}
