use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use neolia_api::panel::NeoliaPanelConfig;

use crate::backend::hass::fetch_neolia_panel_config;
use crate::connection::EffectiveConfig;
use crate::error::ApiResult;
use crate::model::panel::PanelConfigStore;
use crate::platform::DisplayMode;

#[async_trait]
pub trait PanelConfigSource: Send + Sync {
    async fn fetch(&self, base_url: &str, token: &str) -> ApiResult<NeoliaPanelConfig>;
}

/// Reads the config sensor over Home Assistant REST.
pub struct SensorSource;

#[async_trait]
impl PanelConfigSource for SensorSource {
    async fn fetch(&self, base_url: &str, token: &str) -> ApiResult<NeoliaPanelConfig> {
        fetch_neolia_panel_config(base_url, token).await
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadOutcome {
    NotPanel,
    /// Url or token missing. Retried on a later call.
    Deferred,
    Skipped,
    Loaded,
    Failed,
}

/// Fetches the panel configuration once per loader, in panel mode only.
pub struct PanelConfigLoader {
    store: Arc<Mutex<PanelConfigStore>>,
    source: Arc<dyn PanelConfigSource>,
    attempted: bool,
}

impl PanelConfigLoader {
    pub fn new(store: Arc<Mutex<PanelConfigStore>>, source: Arc<dyn PanelConfigSource>) -> Self {
        Self {
            store,
            source,
            attempted: false,
        }
    }

    pub async fn maybe_load(&mut self, mode: DisplayMode, cfg: &EffectiveConfig) -> LoadOutcome {
        if !mode.is_panel() {
            return LoadOutcome::NotPanel;
        }

        if !cfg.is_complete() {
            log::debug!("Panel config load deferred, Home Assistant url or token missing");
            return LoadOutcome::Deferred;
        }

        {
            let mut store = self.store.lock().await;
            if self.attempted || store.loaded() || store.loading() {
                return LoadOutcome::Skipped;
            }
            self.attempted = true;
            store.set_loading(true);
        }

        let res = self.source.fetch(&cfg.base_url, &cfg.token).await;

        let mut store = self.store.lock().await;
        match res {
            Ok(config) => {
                log::info!(
                    "Panel config loaded: code {}, host {}, mqtt port {}",
                    config.neolia_code,
                    config.panel_host,
                    config.mqtt_ws_port
                );
                store.set_config(config);
                LoadOutcome::Loaded
            }
            Err(err) => {
                log::error!("Failed to load panel config: {err}");
                store.set_error(err.to_string());
                LoadOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    use neolia_api::panel::NeoliaPanelConfig;

    use crate::connection::EffectiveConfig;
    use crate::error::{ApiError, ApiResult};
    use crate::model::panel::PanelConfigStore;
    use crate::panel::{LoadOutcome, PanelConfigLoader, PanelConfigSource};
    use crate::platform::DisplayMode;

    struct Fake {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PanelConfigSource for Fake {
        async fn fetch(&self, _base_url: &str, _token: &str) -> ApiResult<NeoliaPanelConfig> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ApiError::InvalidFormat(
                    "sensor.neolia_panel_config".to_string(),
                ));
            }
            Ok(NeoliaPanelConfig {
                neolia_code: "1234".to_string(),
                panel_host: "h".to_string(),
                mqtt_ws_port: 1884,
            })
        }
    }

    fn setup(fail: bool) -> (PanelConfigLoader, Arc<Mutex<PanelConfigStore>>, Arc<Fake>, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("panel.yaml")).unwrap();
        let store = Arc::new(Mutex::new(PanelConfigStore::load(path).unwrap()));
        let fake = Arc::new(Fake {
            fail,
            calls: AtomicUsize::new(0),
        });
        let loader = PanelConfigLoader::new(store.clone(), fake.clone());
        (loader, store, fake, dir)
    }

    fn cfg(token: &str) -> EffectiveConfig {
        EffectiveConfig {
            base_url: "http://192.168.1.219:8123".to_string(),
            token: token.to_string(),
            is_panel: true,
        }
    }

    #[tokio::test]
    async fn loads_once_in_panel_mode() {
        let (mut loader, store, fake, _dir) = setup(false);

        assert_eq!(loader.maybe_load(DisplayMode::Panel, &cfg("t")).await, LoadOutcome::Loaded);
        assert_eq!(loader.maybe_load(DisplayMode::Panel, &cfg("t")).await, LoadOutcome::Skipped);

        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.lock().await.config().unwrap().neolia_code, "1234");
    }

    #[tokio::test]
    async fn other_modes_do_nothing() {
        let (mut loader, store, fake, _dir) = setup(false);

        for mode in [DisplayMode::Mobile, DisplayMode::Tablet] {
            assert_eq!(loader.maybe_load(mode, &cfg("t")).await, LoadOutcome::NotPanel);
        }
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
        assert!(!store.lock().await.loaded());
    }

    #[tokio::test]
    async fn missing_token_defers_without_consuming_the_attempt() {
        let (mut loader, _store, fake, _dir) = setup(false);

        assert_eq!(loader.maybe_load(DisplayMode::Panel, &cfg("")).await, LoadOutcome::Deferred);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);

        assert_eq!(loader.maybe_load(DisplayMode::Panel, &cfg("t")).await, LoadOutcome::Loaded);
    }

    #[tokio::test]
    async fn failure_is_stored_not_retried() {
        let (mut loader, store, fake, _dir) = setup(true);

        assert_eq!(loader.maybe_load(DisplayMode::Panel, &cfg("t")).await, LoadOutcome::Failed);
        {
            let store = store.lock().await;
            assert!(store.loaded());
            assert!(store.error().unwrap().contains("sensor.neolia_panel_config"));
        }

        store.lock().await.reset();
        assert_eq!(loader.maybe_load(DisplayMode::Panel, &cfg("t")).await, LoadOutcome::Skipped);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }
}
