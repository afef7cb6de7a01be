use serde::{Deserialize, Serialize};

/// Home Assistant and MQTT endpoints announced by the Neolia configuration
/// topic.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NeoliaHaConnection {
    pub base_url: String,
    pub token: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
}
