use std::sync::Arc;

use tokio::sync::Mutex;

use crate::backend::hass::{ConnectionManager, HassConnector, WsConnector};
use crate::config::AppConfig;
use crate::connection::{EffectiveConfig, resolve_effective_config};
use crate::error::ApiResult;
use crate::model::credentials::{CredentialStore, HaCredentials};
use crate::model::hass::HassStore;
use crate::model::panel::PanelConfigStore;
use crate::model::sip::SipConfigStore;
use crate::platform::{DisplayMode, PlatformInfo};

#[derive(Clone)]
pub struct AppState {
    conf: Arc<AppConfig>,
    platform: Arc<PlatformInfo>,
    hass: Arc<Mutex<HassStore>>,
    manager: ConnectionManager,
    panel: Arc<Mutex<PanelConfigStore>>,
    sip: Arc<Mutex<SipConfigStore>>,
    credentials: CredentialStore,
}

impl AppState {
    pub fn from_config(config: AppConfig) -> ApiResult<Self> {
        let platform = PlatformInfo::from_config(&config);
        Self::with_parts(config, platform, Arc::new(WsConnector))
    }

    pub fn with_parts(
        config: AppConfig,
        platform: PlatformInfo,
        connector: Arc<dyn HassConnector>,
    ) -> ApiResult<Self> {
        let storage = &config.storage;

        let panel = PanelConfigStore::load(storage.panel_file())?;
        if panel.onboarding().has_completed_sn_step {
            log::debug!(
                "Panel onboarding done (code {})",
                panel.onboarding().entered_neolia_code
            );
        }
        let sip = SipConfigStore::load(storage.sip_file())?;
        let credentials =
            CredentialStore::new(storage.credentials_file(), storage.device_key_file());

        let hass = Arc::new(Mutex::new(HassStore::new()));
        let manager = ConnectionManager::new(connector, hass.clone());

        Ok(Self {
            conf: Arc::new(config),
            platform: Arc::new(platform),
            hass,
            manager,
            panel: Arc::new(Mutex::new(panel)),
            sip: Arc::new(Mutex::new(sip)),
            credentials,
        })
    }

    #[must_use]
    pub fn config(&self) -> Arc<AppConfig> {
        self.conf.clone()
    }

    #[must_use]
    pub fn platform(&self) -> Arc<PlatformInfo> {
        self.platform.clone()
    }

    #[must_use]
    pub fn display_mode(&self) -> DisplayMode {
        self.platform.display_mode()
    }

    #[must_use]
    pub fn hass(&self) -> Arc<Mutex<HassStore>> {
        self.hass.clone()
    }

    #[must_use]
    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    #[must_use]
    pub fn panel_store(&self) -> Arc<Mutex<PanelConfigStore>> {
        self.panel.clone()
    }

    #[must_use]
    pub fn sip_store(&self) -> Arc<Mutex<SipConfigStore>> {
        self.sip.clone()
    }

    #[must_use]
    pub fn credentials(&self) -> CredentialStore {
        self.credentials.clone()
    }

    pub async fn effective_config(&self) -> EffectiveConfig {
        let hass = self.hass.lock().await;
        resolve_effective_config(self.display_mode(), hass.connection(), &self.conf.network)
    }

    /// Remembers credentials entered by the user for the next start.
    pub async fn store_credentials(&self, creds: HaCredentials) -> ApiResult<()> {
        let store = self.credentials.clone();
        tokio::task::spawn_blocking(move || store.store(&creds)).await?
    }

    pub async fn logout(&self) -> ApiResult<()> {
        self.manager.teardown().await;
        self.hass.lock().await.disconnect();
        self.panel.lock().await.reset();

        let store = self.credentials.clone();
        tokio::task::spawn_blocking(move || store.clear()).await??;
        self.sip.lock().await.reset()?;

        log::info!("Logged out");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use crate::backend::hass::{EntityMap, HassConnector, HassLink, HassSession, HassState};
    use crate::config::AppConfig;
    use crate::connection::{ConnectionInitializer, InitOutcome};
    use crate::error::ApiResult;
    use crate::model::credentials::HaCredentials;
    use crate::model::hass::{Connection, ConnectionStatus, HassStore};
    use crate::platform::{DisplayMode, PlatformInfo};
    use crate::server::appstate::AppState;

    struct Quiet;

    #[async_trait]
    impl HassSession for Quiet {
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

    struct QuietConnector {
        senders: std::sync::Mutex<Vec<mpsc::Sender<EntityMap>>>,
    }

    #[async_trait]
    impl HassConnector for QuietConnector {
        async fn connect(&self, _url: &str, _token: &str) -> ApiResult<HassLink> {
            let (tx, rx) = mpsc::channel(1);
            self.senders.lock().unwrap().push(tx);
            Ok(HassLink {
                session: Arc::new(Quiet),
                updates: rx,
            })
        }
    }

    fn state(dir: &TempDir) -> AppState {
        let mut config = AppConfig::default();
        config.storage.state_dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let connector = Arc::new(QuietConnector {
            senders: std::sync::Mutex::new(vec![]),
        });
        let platform = PlatformInfo {
            viewport_width: 1280,
            ..PlatformInfo::default()
        };
        AppState::with_parts(config, platform, connector).unwrap()
    }

    fn creds() -> HaCredentials {
        HaCredentials {
            base_url: "http://10.0.0.5:8123".to_string(),
            token: "user-token".to_string(),
        }
    }

    #[tokio::test]
    async fn logout_forgets_connection_credentials_and_sip() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let _listener = state.manager().subscribe(|_: &EntityMap| {});

        state.store_credentials(creds()).await.unwrap();
        state.sip_store().lock().await.set_auth_code("1234").unwrap();
        state
            .hass()
            .lock()
            .await
            .set_connection(Connection::new("http://10.0.0.5:8123", "user-token"));
        state
            .manager()
            .init("http://10.0.0.5:8123", "user-token")
            .await
            .unwrap();
        assert!(state.config().storage.credentials_file().is_file());

        state.logout().await.unwrap();

        assert!(!state.manager().is_connected());
        let hass = state.hass();
        let hass = hass.lock().await;
        assert!(hass.connection().is_none());
        assert_eq!(hass.status(), ConnectionStatus::Disconnected);
        drop(hass);
        assert!(!state.config().storage.credentials_file().is_file());
        assert!(state.sip_store().lock().await.auth_code().is_none());
        assert!(state.credentials().load().unwrap().is_none());
        assert_eq!(state.manager().listener_count(), 1);
    }

    #[tokio::test]
    async fn stored_credentials_are_restored_on_next_start() {
        let dir = TempDir::new().unwrap();
        state(&dir).store_credentials(creds()).await.unwrap();

        let next = state(&dir);
        let store = Arc::new(tokio::sync::Mutex::new(HassStore::new()));
        let outcome = ConnectionInitializer::new(
            store.clone(),
            Arc::new(next.credentials()),
            next.config().network.clone(),
        )
        .run(DisplayMode::Mobile, &CancellationToken::new())
        .await;

        assert_eq!(outcome, InitOutcome::Restored);
        let store = store.lock().await;
        assert_eq!(store.connection().unwrap().url, "http://10.0.0.5:8123");
        assert_eq!(store.connection().unwrap().token, "user-token");
    }
}
