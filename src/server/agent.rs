use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::backend::bootstrap::{BrokerSettings, MqttBootstrap};
use crate::connection::ConnectionInitializer;
use crate::error::ApiResult;
use crate::model::credentials::HaCredentials;
use crate::model::hass::Connection;
use crate::panel::{PanelConfigLoader, PanelConfigSource};
use crate::recovery::RecoveryHandler;
use crate::server::appstate::AppState;

/// Drives the connection pipeline: initializer, connection manager, then
/// the panel config loader.
pub struct Agent {
    state: AppState,
    source: Arc<dyn PanelConfigSource>,
    loader: Mutex<PanelConfigLoader>,
    bootstrapped: AtomicBool,
    cancel: CancellationToken,
}

impl Agent {
    const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);

    pub fn new(
        state: AppState,
        source: Arc<dyn PanelConfigSource>,
        cancel: CancellationToken,
    ) -> Self {
        let loader = PanelConfigLoader::new(state.panel_store(), source.clone());
        Self {
            state,
            source,
            loader: Mutex::new(loader),
            bootstrapped: AtomicBool::new(false),
            cancel,
        }
    }

    #[must_use]
    pub const fn state(&self) -> &AppState {
        &self.state
    }

    pub async fn bring_up(&self) -> ApiResult<()> {
        let config = self.state.config();
        let mode = self.state.display_mode();

        ConnectionInitializer::new(
            self.state.hass(),
            Arc::new(self.state.credentials()),
            config.network.clone(),
        )
        .run(mode, &self.cancel)
        .await;

        self.connect().await
    }

    async fn connect(&self) -> ApiResult<()> {
        let mode = self.state.display_mode();
        let cfg = self.state.effective_config().await;
        if !cfg.is_complete() {
            log::warn!("Home Assistant url or token missing, not connecting");
            return Ok(());
        }

        self.state.manager().init(&cfg.base_url, &cfg.token).await?;
        self.loader.lock().await.maybe_load(mode, &cfg).await;
        Ok(())
    }

    /// Takes the Home Assistant connection announced on the configuration
    /// broker. Applied at most once per session; returns whether it was.
    pub async fn run_mqtt_bootstrap(&self) -> ApiResult<bool> {
        if self.bootstrapped.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let config = self.state.config();
        let settings = BrokerSettings::resolve(&config.mqtt, &config.network, &self.state.platform());
        let bootstrap = MqttBootstrap::new(settings, Duration::from_millis(config.mqtt.timeout_ms));
        log::debug!(
            "MQTT bootstrap via {} on ports {:?}",
            bootstrap.settings().host,
            bootstrap.settings().ports
        );

        let provisioned = tokio::select! {
            () = self.cancel.cancelled() => return Ok(false),
            res = bootstrap.provision() => res?,
        };
        if self.bootstrapped.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let conn = provisioned.connection;
        log::info!(
            "Home Assistant provisioned over MQTT: {} (broker port {})",
            conn.base_url,
            provisioned.broker_port
        );

        self.state
            .hass()
            .lock()
            .await
            .set_connection(Connection::new(conn.base_url.clone(), conn.token.clone()));

        let creds = HaCredentials {
            base_url: conn.base_url.clone(),
            token: conn.token.clone(),
        };
        if let Err(err) = self.state.store_credentials(creds).await {
            log::warn!("Failed to store provisioned credentials: {err}");
        }

        self.state.manager().init(&conn.base_url, &conn.token).await?;
        Ok(true)
    }

    /// Reconnects when the socket went away. Runs until cancelled.
    pub async fn watchdog(&self) {
        let mut tick = interval(Self::WATCHDOG_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                _ = tick.tick() => {}
            }

            let initialized = self.state.hass().lock().await.is_initialized();
            if !initialized || self.state.manager().is_connected() {
                continue;
            }
            if let Err(err) = self.connect().await {
                log::debug!("Home Assistant reconnect failed: {err}");
            }
        }
    }
}

#[async_trait]
impl RecoveryHandler for Agent {
    async fn refresh_entities(&self) -> ApiResult<()> {
        self.state.manager().refresh_entities().await
    }

    async fn reload(&self) -> ApiResult<()> {
        self.state.manager().teardown().await;
        self.state.hass().lock().await.disconnect();
        self.state.panel_store().lock().await.reset();
        *self.loader.lock().await =
            PanelConfigLoader::new(self.state.panel_store(), self.source.clone());
        self.bootstrapped.store(false, Ordering::SeqCst);

        self.bring_up().await?;
        if self.state.config().mqtt.enabled {
            if let Err(err) = self.run_mqtt_bootstrap().await {
                log::warn!("MQTT bootstrap failed: {err}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::routing::get;
    use axum::{Json, Router};
    use camino::Utf8PathBuf;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::{Mutex, mpsc};
    use tokio_util::sync::CancellationToken;

    use crate::backend::hass::{EntityMap, HassConnector, HassLink, HassSession, HassState};
    use crate::config::{AppConfig, AppTarget, MqttConfig};
    use crate::connection::{ConnectionInitializer, InitOutcome};
    use crate::error::ApiResult;
    use crate::model::hass::{ConnectionStatus, HassStore};
    use crate::panel::SensorSource;
    use crate::platform::PlatformInfo;
    use crate::recovery::RecoveryHandler;
    use crate::server::agent::Agent;
    use crate::server::appstate::AppState;
    use crate::test_support::{mqtt_broker, serve, serve_addr};

    struct Idle;

    #[async_trait]
    impl HassSession for Idle {
        async fn call_service(
            &self,
            _domain: &str,
            _service: &str,
            _data: serde_json::Map<String, serde_json::Value>,
        ) -> ApiResult<()> {
            Ok(())
        }

        async fn get_states(&self) -> ApiResult<Vec<HassState>> {
            Ok(vec![])
        }
    }

    #[derive(Default)]
    struct Recording {
        urls: std::sync::Mutex<Vec<String>>,
        senders: std::sync::Mutex<Vec<mpsc::Sender<EntityMap>>>,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl HassConnector for Recording {
        async fn connect(&self, url: &str, _token: &str) -> ApiResult<HassLink> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(url.to_string());
            let (tx, rx) = mpsc::channel(1);
            self.senders.lock().unwrap().push(tx);
            Ok(HassLink {
                session: Arc::new(Idle),
                updates: rx,
            })
        }
    }

    async fn panel_agent(dir: &TempDir) -> (Agent, Arc<Recording>) {
        let router = Router::new().route(
            "/api/states/sensor.neolia_panel_config",
            get(|| async {
                Json(json!({
                    "entity_id": "sensor.neolia_panel_config",
                    "state": r#"{"neolia_code":"4821","panel_host":"192.168.1.50","mqtt_ws_port":1884}"#,
                }))
            }),
        );
        let base = serve(router).await;

        let mut config = AppConfig::default();
        config.app.target = AppTarget::Panel;
        config.network.panel_url = base;
        config.network.dev_token = "shared".to_string();
        config.storage.state_dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let connector = Arc::new(Recording::default());
        let platform = PlatformInfo {
            panel_build: true,
            ..PlatformInfo::default()
        };
        let state = AppState::with_parts(config, platform, connector.clone()).unwrap();
        let agent = Agent::new(state, Arc::new(SensorSource), CancellationToken::new());
        (agent, connector)
    }

    #[tokio::test]
    async fn panel_pipeline_connects_and_loads_config() {
        let dir = TempDir::new().unwrap();
        let (agent, connector) = panel_agent(&dir).await;

        agent.bring_up().await.unwrap();

        let state = agent.state();
        assert!(state.hass().lock().await.is_initialized());
        assert_eq!(state.hass().lock().await.status(), ConnectionStatus::Connected);
        assert_eq!(
            connector.urls.lock().unwrap()[0],
            state.config().network.panel_base_url()
        );

        let panel = state.panel_store();
        let panel = panel.lock().await;
        assert_eq!(panel.config().unwrap().neolia_code, "4821");
        assert_eq!(panel.config().unwrap().mqtt_ws_port, 1884);
    }

    #[tokio::test]
    async fn reload_rebuilds_everything() {
        let dir = TempDir::new().unwrap();
        let (agent, connector) = panel_agent(&dir).await;
        agent.bring_up().await.unwrap();

        agent.reload().await.unwrap();

        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        let panel = agent.state().panel_store();
        assert!(panel.lock().await.loaded());
        assert!(agent.state().manager().is_connected());
    }

    fn neolia_document(url: &str) -> Vec<u8> {
        json!({
            "service": "neolia-config",
            "version": 1,
            "network": { "mqtt_host": "127.0.0.1", "mqtt_port": 1884 },
            "home_structure": { "ha": { "url": url, "token": "provisioned" } }
        })
        .to_string()
        .into_bytes()
    }

    fn tablet_agent(dir: &TempDir, broker_port: u16) -> (Agent, Arc<Recording>) {
        let mut config = AppConfig::default();
        config.storage.state_dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        config.mqtt = MqttConfig {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: broker_port,
            timeout_ms: 5_000,
            ..MqttConfig::default()
        };

        let connector = Arc::new(Recording::default());
        let platform = PlatformInfo::from_config(&config);
        let state = AppState::with_parts(config, platform, connector.clone()).unwrap();
        let agent = Agent::new(state, Arc::new(SensorSource), CancellationToken::new());
        (agent, connector)
    }

    #[tokio::test]
    async fn mqtt_bootstrap_applies_once_per_session() {
        let dir = TempDir::new().unwrap();
        let messages = vec![(
            "neolia/config/global".to_string(),
            neolia_document("http://10.0.0.9:8123"),
        )];
        let addr = serve_addr(mqtt_broker(messages)).await;
        let (agent, connector) = tablet_agent(&dir, addr.port());

        assert!(agent.run_mqtt_bootstrap().await.unwrap());
        assert!(!agent.run_mqtt_bootstrap().await.unwrap());

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(connector.urls.lock().unwrap()[0], "http://10.0.0.9:8123");
        let hass = agent.state().hass();
        assert_eq!(hass.lock().await.connection().unwrap().token, "provisioned");

        // the next start restores what the broker announced
        let store = Arc::new(Mutex::new(HassStore::new()));
        let outcome = ConnectionInitializer::new(
            store.clone(),
            Arc::new(agent.state().credentials()),
            agent.state().config().network.clone(),
        )
        .run(agent.state().display_mode(), &CancellationToken::new())
        .await;
        assert_eq!(outcome, InitOutcome::Restored);
        assert_eq!(store.lock().await.connection().unwrap().url, "http://10.0.0.9:8123");
    }

    #[tokio::test]
    async fn failed_mqtt_bootstrap_can_be_retried() {
        let dir = TempDir::new().unwrap();
        let addr = serve_addr(mqtt_broker(vec![(
            "neolia/config/global".to_string(),
            b"{\"service\":\"neolia-config\",\"network\":{},\"home_structure\":{}}".to_vec(),
        )]))
        .await;
        let (agent, connector) = tablet_agent(&dir, addr.port());

        assert!(agent.run_mqtt_bootstrap().await.is_err());
        assert!(agent.run_mqtt_bootstrap().await.is_err());

        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
        assert!(agent.state().hass().lock().await.connection().is_none());
    }
}
