//! Startup provisioning over MQTT.
//!
//! The Neolia configurator publishes a retained `neolia-config` document on
//! `neolia/config/global` (and optionally per panel). It carries the Home
//! Assistant url and token along with the broker endpoint, so a freshly
//! installed panel can connect without onboarding.

use std::time::Duration;

use serde_json::Value;

use neolia_api::bootstrap::NeoliaHaConnection;
use neolia_api::config::{MqttConfig, NetworkConfig};

use crate::backend::mqtt::MqttWsClient;
use crate::error::{ApiError, ApiResult};
use crate::fields::{FieldSchema, Fields};
use crate::platform::PlatformInfo;

pub const CONFIG_TOPIC_GLOBAL: &str = "neolia/config/global";
pub const CONFIG_TOPIC_PREFIX: &str = "neolia/panel";
pub const NEOLIA_CONFIG_SERVICE: &str = "neolia-config";

const CONFIG_SCHEMA: FieldSchema = FieldSchema::new(&["network", "home_structure"]);
const HA_SCHEMA: FieldSchema = FieldSchema::new(&["url", "token"]);
const NETWORK_SCHEMA: FieldSchema = FieldSchema::new(&["mqtt_host", "mqtt_port"]);

/// Global and per-panel configuration topics, in subscription order.
#[must_use]
pub fn config_topics(panel_code: &str) -> Vec<String> {
    vec![
        CONFIG_TOPIC_GLOBAL.to_string(),
        format!("{CONFIG_TOPIC_PREFIX}/{panel_code}/config"),
    ]
}

/// A validated `neolia-config` document. Sections are kept as loose views
/// since only a few keys are read.
#[derive(Clone, Debug)]
pub struct NeoliaGlobalConfig {
    pub version: String,
    pub site_name: String,
    pub default_page: String,
    pub network: Fields,
    pub home_structure: Fields,
}

/// Parses a configuration payload. The document may arrive JSON-encoded
/// twice (a JSON string holding the object).
pub fn parse_neolia_config(payload: &[u8]) -> ApiResult<NeoliaGlobalConfig> {
    let mut value: Value = serde_json::from_slice(payload)?;
    if let Value::String(text) = value {
        value = serde_json::from_str(&text)?;
    }

    let doc = Fields::from_value(value).ok_or_else(|| {
        ApiError::InvalidFormat("Neolia config payload is not an object".to_string())
    })?;

    let service = doc.string("service");
    if service != NEOLIA_CONFIG_SERVICE {
        return Err(ApiError::InvalidFormat(format!(
            "unexpected service in Neolia config payload: {service:?}"
        )));
    }

    let report = CONFIG_SCHEMA.check(&doc);
    if !report.is_valid() {
        return Err(ApiError::InvalidFormat(format!(
            "Neolia config payload misses {:?}",
            report.missing_required
        )));
    }
    let (Some(network), Some(home_structure)) =
        (doc.object("network"), doc.object("home_structure"))
    else {
        return Err(ApiError::InvalidFormat(
            "Neolia config network and home_structure must be objects".to_string(),
        ));
    };

    Ok(NeoliaGlobalConfig {
        version: doc.string("version"),
        site_name: doc.object("site").unwrap_or_default().string("name"),
        default_page: doc.object("panel").unwrap_or_default().string("default_page"),
        network,
        home_structure,
    })
}

/// Home Assistant and broker endpoints of `config`.
pub fn extract_ha_connection(config: &NeoliaGlobalConfig) -> ApiResult<NeoliaHaConnection> {
    let ha = config.home_structure.object("ha").unwrap_or_default();
    if !HA_SCHEMA.check(&ha).is_valid() {
        return Err(ApiError::InvalidResponse(
            "home_structure.ha url or token missing".to_string(),
        ));
    }

    let report = NETWORK_SCHEMA.check(&config.network);
    let mqtt_port = config.network.port("mqtt_port");
    if !report.is_valid() || mqtt_port == 0 {
        return Err(ApiError::InvalidResponse(
            "network mqtt_host or mqtt_port missing".to_string(),
        ));
    }

    Ok(NeoliaHaConnection {
        base_url: ha.string("url").trim_end_matches('/').to_string(),
        token: ha.string("token"),
        mqtt_host: config.network.string("mqtt_host"),
        mqtt_port,
    })
}

/// Where and how to reach the configuration broker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BrokerSettings {
    pub host: String,
    /// Tried in order until one accepts.
    pub ports: Vec<u16>,
    pub secure: bool,
    pub username: String,
    pub password: String,
    pub panel_code: String,
}

impl BrokerSettings {
    /// Explicit settings win. Otherwise panels use the LAN broker with the
    /// panel account, other clients the development host or the default.
    #[must_use]
    pub fn resolve(mqtt: &MqttConfig, network: &NetworkConfig, platform: &PlatformInfo) -> Self {
        let panel = platform.is_panel_mode() || platform.display_mode().is_panel();
        let or = |value: &str, fallback: &str| {
            let value = value.trim();
            if value.is_empty() {
                fallback.to_string()
            } else {
                value.to_string()
            }
        };

        let host = if !mqtt.host.trim().is_empty() {
            mqtt.host.trim().to_string()
        } else if panel {
            MqttConfig::PANEL_HOST.to_string()
        } else {
            or(&network.dev_initial_mqtt_host(), MqttConfig::DEFAULT_HOST)
        };

        let ports = if mqtt.port != 0 {
            vec![mqtt.port]
        } else if mqtt.use_secure {
            vec![MqttConfig::SECURE_PORT]
        } else {
            MqttConfig::FALLBACK_PORTS.to_vec()
        };

        let (username, password) = if panel {
            (
                or(&mqtt.username, MqttConfig::PANEL_USERNAME),
                or(&mqtt.password, MqttConfig::PANEL_PASSWORD),
            )
        } else {
            (mqtt.username.trim().to_string(), mqtt.password.clone())
        };

        Self {
            host,
            ports,
            secure: mqtt.use_secure,
            username,
            password,
            panel_code: or(&mqtt.panel_code, MqttConfig::DEFAULT_PANEL_CODE),
        }
    }

    #[must_use]
    pub fn broker_url(&self, port: u16) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}:{port}/mqtt", self.host)
    }

    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        config_topics(&self.panel_code)
    }
}

/// What a successful provisioning produced.
#[derive(Clone, Debug)]
pub struct Provisioned {
    pub connection: NeoliaHaConnection,
    pub config: NeoliaGlobalConfig,
    /// Broker port that answered.
    pub broker_port: u16,
}

/// Connects to the broker, waits for a configuration document and returns
/// the connection it announces.
pub struct MqttBootstrap {
    settings: BrokerSettings,
    timeout: Duration,
}

impl MqttBootstrap {
    const PORT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

    #[must_use]
    pub const fn new(settings: BrokerSettings, timeout: Duration) -> Self {
        Self { settings, timeout }
    }

    #[must_use]
    pub const fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Gives up after the configured timeout, covering connection and wait.
    pub async fn provision(&self) -> ApiResult<Provisioned> {
        tokio::time::timeout(self.timeout, self.run())
            .await
            .map_err(|_| {
                ApiError::service_error(format!(
                    "no Neolia configuration received on {:?} within {} ms",
                    self.settings.topics(),
                    self.timeout.as_millis()
                ))
            })?
    }

    async fn connect(&self) -> ApiResult<(MqttWsClient, u16)> {
        let topics = self.settings.topics();
        for &port in &self.settings.ports {
            let url = self.settings.broker_url(port);
            log::debug!("Trying MQTT broker at {url}");

            let attempt = async {
                let mut client =
                    MqttWsClient::connect(&url, &self.settings.username, &self.settings.password)
                        .await?;
                client.subscribe(&topics).await?;
                ApiResult::Ok(client)
            };

            match tokio::time::timeout(Self::PORT_ATTEMPT_TIMEOUT, attempt).await {
                Ok(Ok(client)) => return Ok((client, port)),
                Ok(Err(err)) => log::warn!("MQTT broker at {url} failed: {err}"),
                Err(_) => log::warn!("MQTT broker at {url} timed out"),
            }
        }

        let tried = self
            .settings
            .ports
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        Err(ApiError::service_error(format!(
            "cannot reach MQTT broker {} (ports tried: {tried})",
            self.settings.host
        )))
    }

    async fn run(&self) -> ApiResult<Provisioned> {
        let (mut client, broker_port) = self.connect().await?;
        let topics = self.settings.topics();

        let outcome = loop {
            let msg = match client.next_message().await {
                Ok(msg) => msg,
                Err(err) => break Err(err),
            };
            if !topics.contains(&msg.topic) {
                continue;
            }

            match parse_neolia_config(&msg.payload) {
                Ok(config) => {
                    log::info!(
                        "Neolia configuration received on {} (site {:?}, version {})",
                        msg.topic,
                        config.site_name,
                        config.version
                    );
                    break extract_ha_connection(&config).map(|connection| Provisioned {
                        connection,
                        config,
                        broker_port,
                    });
                }
                Err(err) => log::warn!("Ignoring payload on {}: {err}", msg.topic),
            }
        };

        client.disconnect().await;
        outcome
    }
}
