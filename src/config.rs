use camino::Utf8Path;
use config::{Config, ConfigError};

pub use neolia_api::config::*;

/// Environment variables mapped onto configuration keys. When several
/// variables target the same key, the first one set wins.
const ENV_OVERRIDES: &[(&str, &[&str])] = &[
    (
        "discovery.url",
        &["NEOLIA_DEV_CONFIGURATOR_HOST", "NEOLIA_DISCOVERY_URL"],
    ),
    ("network.dev_ha_host", &["NEOLIA_DEV_HA_HOST"]),
    ("network.dev_mqtt_host", &["NEOLIA_DEV_MQTT_HOST"]),
    ("network.dev_token", &["NEOLIA_DEV_HA_TOKEN"]),
    ("network.panel_url", &["NEOLIA_PANEL_URL"]),
    ("app.target", &["NEOLIA_APP_TARGET"]),
    ("app.native_platform", &["NEOLIA_NATIVE_PLATFORM"]),
    ("app.user_agent", &["NEOLIA_USER_AGENT"]),
    ("app.standalone", &["NEOLIA_STANDALONE"]),
    ("mqtt.enabled", &["NEOLIA_MQTT_BOOTSTRAP"]),
    ("mqtt.host", &["NEOLIA_MQTT_HOST"]),
    ("mqtt.panel_code", &["NEOLIA_PANEL_CODE"]),
    ("storage.state_dir", &["NEOLIA_STATE_DIR"]),
];

pub fn parse(filename: Option<&Utf8Path>) -> Result<AppConfig, ConfigError> {
    parse_with_env(filename, |name| std::env::var(name).ok())
}

pub fn parse_with_env(
    filename: Option<&Utf8Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder()
        .set_default("storage.state_dir", "state")?
        .set_default("network.ha_port", i64::from(NetworkConfig::DEFAULT_HA_PORT))?
        .set_default("network.mqtt_port", i64::from(NetworkConfig::DEFAULT_MQTT_PORT))?
        .set_default(
            "network.configurator_port",
            i64::from(NetworkConfig::DEFAULT_CONFIGURATOR_PORT),
        )?
        .set_default("network.cloud_url", NetworkConfig::CLOUD_BASE_URL)?;

    if let Some(filename) = filename {
        builder = builder.add_source(config::File::with_name(filename.as_str()));
    } else {
        builder = builder.add_source(config::File::with_name("neolia").required(false));
    }

    for (key, names) in ENV_OVERRIDES {
        let value = names
            .iter()
            .filter_map(|name| env(name))
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty());
        builder = builder.set_override_option(*key, value)?;
    }

    builder.build()?.try_deserialize()
}
