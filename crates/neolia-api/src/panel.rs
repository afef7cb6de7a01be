use serde::{Deserialize, Serialize};

/// Network credentials for a panel, as resolved from its installer code.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PanelDiscoveryResult {
    pub ha_base_url: String,
    pub ha_token: String,
    pub mqtt_host: String,
    pub mqtt_ws_port: u16,
    pub mqtt_username: String,
    pub mqtt_password: String,
}

impl PanelDiscoveryResult {
    #[must_use]
    pub fn has_hass_credentials(&self) -> bool {
        !self.ha_base_url.is_empty() && !self.ha_token.is_empty()
    }
}

/// Panel configuration published by Home Assistant through the
/// `sensor.neolia_panel_config` entity. Never persisted.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NeoliaPanelConfig {
    pub neolia_code: String,
    pub panel_host: String,
    pub mqtt_ws_port: u16,
}

/// Home Assistant url and token returned by the LAN pairing endpoint.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct PanelPairing {
    pub ha_url: String,
    pub token: String,
}
