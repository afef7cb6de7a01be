use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AppTarget {
    #[default]
    Default,
    Panel,
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct AppSection {
    #[serde(default)]
    pub target: AppTarget,
    /// Forces panel mode regardless of build target or viewport.
    #[serde(default)]
    pub panel_override: bool,
    #[serde(default = "AppSection::default_viewport_width")]
    pub viewport_width: u32,
    /// Platform name reported by the native bridge (`android`, `ios`, `web`).
    #[serde(default)]
    pub native_platform: String,
    #[serde(default)]
    pub user_agent: String,
    /// Running as an installed, standalone web app.
    #[serde(default)]
    pub standalone: bool,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            target: AppTarget::Default,
            panel_override: false,
            viewport_width: Self::default_viewport_width(),
            native_platform: String::new(),
            user_agent: String::new(),
            standalone: false,
        }
    }
}

impl AppSection {
    const fn default_viewport_width() -> u32 {
        1280
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct NetworkConfig {
    /// Home Assistant host used during development. Empty in production,
    /// which makes onboarding mandatory.
    #[serde(default)]
    pub dev_ha_host: String,
    /// MQTT host used during development. Falls back to `dev_ha_host`.
    #[serde(default)]
    pub dev_mqtt_host: String,
    #[serde(default)]
    pub dev_token: String,
    #[serde(default = "NetworkConfig::default_cloud_url")]
    pub cloud_url: String,
    #[serde(default)]
    pub panel_url: String,
    #[serde(default = "NetworkConfig::default_ha_port")]
    pub ha_port: u16,
    #[serde(default = "NetworkConfig::default_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default = "NetworkConfig::default_configurator_port")]
    pub configurator_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            dev_ha_host: String::new(),
            dev_mqtt_host: String::new(),
            dev_token: String::new(),
            cloud_url: Self::default_cloud_url(),
            panel_url: String::new(),
            ha_port: Self::default_ha_port(),
            mqtt_port: Self::default_mqtt_port(),
            configurator_port: Self::default_configurator_port(),
        }
    }
}

impl NetworkConfig {
    pub const DEFAULT_HA_PORT: u16 = 8123;
    pub const DEFAULT_MQTT_PORT: u16 = 1884;
    pub const DEFAULT_CONFIGURATOR_PORT: u16 = 8765;
    pub const CLOUD_BASE_URL: &'static str = "https://bl09dhclkeomkczlb0b7ktsssxmevmdq.ui.nabu.casa";
    pub const PANEL_FALLBACK_URL: &'static str = "http://homeassistant.local:8123";

    fn default_cloud_url() -> String {
        Self::CLOUD_BASE_URL.to_string()
    }

    const fn default_ha_port() -> u16 {
        Self::DEFAULT_HA_PORT
    }

    const fn default_mqtt_port() -> u16 {
        Self::DEFAULT_MQTT_PORT
    }

    const fn default_configurator_port() -> u16 {
        Self::DEFAULT_CONFIGURATOR_PORT
    }

    /// Initial Home Assistant url for development, or an empty string when
    /// no development host is configured.
    #[must_use]
    pub fn dev_initial_ha_url(&self) -> String {
        let host = self.dev_ha_host.trim();
        if host.is_empty() {
            return String::new();
        }
        format!("http://{host}:{}", self.ha_port)
    }

    #[must_use]
    pub fn dev_initial_mqtt_host(&self) -> String {
        let host = self.dev_mqtt_host.trim();
        if host.is_empty() {
            self.dev_ha_host.trim().to_string()
        } else {
            host.to_string()
        }
    }

    #[must_use]
    pub fn has_dev_network_config(&self) -> bool {
        !self.dev_ha_host.trim().is_empty() || !self.dev_initial_mqtt_host().is_empty()
    }

    /// The fixed LAN url every panel talks to.
    #[must_use]
    pub fn panel_base_url(&self) -> String {
        let configured = self.panel_url.trim().trim_end_matches('/');
        if !configured.is_empty() {
            return configured.to_string();
        }
        let dev = self.dev_initial_ha_url();
        if dev.is_empty() {
            Self::PANEL_FALLBACK_URL.to_string()
        } else {
            dev
        }
    }

    #[must_use]
    pub fn cloud_base_url(&self) -> String {
        let url = self.cloud_url.trim().trim_end_matches('/');
        if url.is_empty() {
            Self::CLOUD_BASE_URL.to_string()
        } else {
            url.to_string()
        }
    }

    #[must_use]
    pub fn shared_token(&self) -> String {
        self.dev_token.trim().to_string()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DiscoveryConfig {
    /// Base url of the panel discovery service. Empty means unconfigured.
    #[serde(default)]
    pub url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct StorageConfig {
    #[serde(default = "StorageConfig::default_state_dir")]
    pub state_dir: Utf8PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: Self::default_state_dir(),
        }
    }
}

impl StorageConfig {
    fn default_state_dir() -> Utf8PathBuf {
        Utf8PathBuf::from("state")
    }

    #[must_use]
    pub fn panel_file(&self) -> Utf8PathBuf {
        self.state_dir.join("panel-config.yaml")
    }

    #[must_use]
    pub fn sip_file(&self) -> Utf8PathBuf {
        self.state_dir.join("sip-config.yaml")
    }

    #[must_use]
    pub fn credentials_file(&self) -> Utf8PathBuf {
        self.state_dir.join("ha-credentials.enc")
    }

    #[must_use]
    pub fn device_key_file(&self) -> Utf8PathBuf {
        self.state_dir.join("device.key")
    }
}

/// Debounce windows of the foreground recovery policies, in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecoveryConfig {
    #[serde(default = "RecoveryConfig::default_refresh_ms")]
    pub entity_refresh_ms: u64,
    #[serde(default = "RecoveryConfig::default_reload_ms")]
    pub foreground_reload_ms: u64,
    #[serde(default = "RecoveryConfig::default_ios_reload_ms")]
    pub ios_reload_ms: u64,
    #[serde(default = "RecoveryConfig::default_long_background_ms")]
    pub long_background_ms: u64,
    #[serde(default = "RecoveryConfig::default_true")]
    pub foreground_reload: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            entity_refresh_ms: Self::default_refresh_ms(),
            foreground_reload_ms: Self::default_reload_ms(),
            ios_reload_ms: Self::default_ios_reload_ms(),
            long_background_ms: Self::default_long_background_ms(),
            foreground_reload: Self::default_true(),
        }
    }
}

impl RecoveryConfig {
    const fn default_refresh_ms() -> u64 {
        3_000
    }

    const fn default_reload_ms() -> u64 {
        5_000
    }

    const fn default_ios_reload_ms() -> u64 {
        2_000
    }

    const fn default_long_background_ms() -> u64 {
        120_000
    }

    const fn default_true() -> bool {
        true
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct IntercomConfig {
    #[serde(default = "IntercomConfig::default_backend_url")]
    pub backend_url: Url,
    #[serde(default = "IntercomConfig::default_ws_url")]
    pub ws_url: Url,
    #[serde(default)]
    pub enabled: bool,
}

impl Default for IntercomConfig {
    fn default() -> Self {
        Self {
            backend_url: Self::default_backend_url(),
            ws_url: Self::default_ws_url(),
            enabled: false,
        }
    }
}

impl IntercomConfig {
    fn default_backend_url() -> Url {
        Url::parse("https://api.sip.neolia.ch").expect("intercom backend URL should always be valid")
    }

    fn default_ws_url() -> Url {
        Url::parse("wss://api.sip.neolia.ch/ws/intercom")
            .expect("intercom websocket URL should always be valid")
    }
}

/// Broker used to receive the Neolia configuration at startup. Empty host and
/// zero port pick the defaults for the current platform.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub use_secure: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "MqttConfig::default_panel_code")]
    pub panel_code: String,
    #[serde(default = "MqttConfig::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: 0,
            use_secure: false,
            username: String::new(),
            password: String::new(),
            panel_code: Self::default_panel_code(),
            timeout_ms: Self::default_timeout_ms(),
        }
    }
}

impl MqttConfig {
    pub const DEFAULT_PANEL_CODE: &'static str = "NEOLIA_DEFAULT_PANEL";
    pub const PANEL_HOST: &'static str = "homeassistant.local";
    pub const DEFAULT_HOST: &'static str = "192.168.1.219";
    pub const PANEL_USERNAME: &'static str = "panel";
    pub const PANEL_PASSWORD: &'static str = "PanelMQTT!2025";
    pub const SECURE_PORT: u16 = 8884;
    /// Websocket listener ports tried in order when none is configured.
    pub const FALLBACK_PORTS: [u16; 2] = [NetworkConfig::DEFAULT_MQTT_PORT, 9001];

    fn default_panel_code() -> String {
        Self::DEFAULT_PANEL_CODE.to_string()
    }

    const fn default_timeout_ms() -> u64 {
        15_000
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub intercom: IntercomConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
}

impl AppConfig {
    #[must_use]
    pub fn has_discovery(&self) -> bool {
        !self.discovery.url.trim().is_empty()
    }
}
