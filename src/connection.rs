use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use neolia_api::config::NetworkConfig;

use crate::model::credentials::CredentialSource;
use crate::model::hass::{Connection, HassStore};
use crate::platform::DisplayMode;

/// Home Assistant endpoint a component should talk to right now.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EffectiveConfig {
    pub base_url: String,
    pub token: String,
    pub is_panel: bool,
}

impl EffectiveConfig {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.base_url.trim().is_empty() && !self.token.trim().is_empty()
    }
}

/// Panels always use the LAN instance. Everything else uses the current
/// connection, falling back per field to the cloud url and shared token.
#[must_use]
pub fn resolve_effective_config(
    mode: DisplayMode,
    connection: Option<&Connection>,
    network: &NetworkConfig,
) -> EffectiveConfig {
    if mode.is_panel() {
        return EffectiveConfig {
            base_url: network.panel_base_url(),
            token: network.shared_token(),
            is_panel: true,
        };
    }

    let pick = |value: Option<&str>, fallback: String| {
        value
            .map(str::trim)
            .filter(|x| !x.is_empty())
            .map_or(fallback, ToString::to_string)
    };

    EffectiveConfig {
        base_url: pick(connection.map(|c| c.url.as_str()), network.cloud_base_url()),
        token: pick(connection.map(|c| c.token.as_str()), network.shared_token()),
        is_panel: false,
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InitOutcome {
    /// Panel mode, LAN instance selected.
    Panel,
    /// A usable connection was already present.
    Kept,
    /// Connection restored from stored credentials.
    Restored,
    /// No stored credentials, cloud instance selected.
    CloudFallback,
    /// Cancelled while reading credentials. Connection untouched.
    Cancelled,
}

/// Picks the Home Assistant instance and credentials at startup.
///
/// [`ConnectionInitializer::run`] consumes the initializer, so initialization
/// is marked complete exactly once per instance.
pub struct ConnectionInitializer {
    store: Arc<Mutex<HassStore>>,
    credentials: Arc<dyn CredentialSource>,
    network: NetworkConfig,
}

impl ConnectionInitializer {
    pub fn new(
        store: Arc<Mutex<HassStore>>,
        credentials: Arc<dyn CredentialSource>,
        network: NetworkConfig,
    ) -> Self {
        Self {
            store,
            credentials,
            network,
        }
    }

    pub async fn run(self, mode: DisplayMode, cancel: &CancellationToken) -> InitOutcome {
        let outcome = self.select(mode, cancel).await;
        log::info!("Connection initialized ({mode:?}): {outcome:?}");
        self.store.lock().await.mark_initialized();
        outcome
    }

    async fn select(&self, mode: DisplayMode, cancel: &CancellationToken) -> InitOutcome {
        if mode.is_panel() {
            let conn = Connection::new(self.network.panel_base_url(), self.network.shared_token());
            log::debug!("Panel mode, using LAN instance {}", conn.url);
            self.store.lock().await.set_connection(conn);
            return InitOutcome::Panel;
        }

        if self
            .store
            .lock()
            .await
            .connection()
            .is_some_and(Connection::is_usable)
        {
            return InitOutcome::Kept;
        }

        let loaded = tokio::select! {
            biased;
            () = cancel.cancelled() => return InitOutcome::Cancelled,
            res = self.credentials.load_credentials() => res,
        };
        if cancel.is_cancelled() {
            return InitOutcome::Cancelled;
        }

        let (conn, outcome) = match loaded {
            Ok(Some(creds))
                if !creds.base_url.trim().is_empty() && !creds.token.trim().is_empty() =>
            {
                log::info!("Restored Home Assistant credentials for {}", creds.base_url);
                (
                    Connection::new(creds.base_url.trim_end_matches('/'), creds.token),
                    InitOutcome::Restored,
                )
            }
            Ok(_) => {
                log::info!("No stored Home Assistant credentials, using cloud instance");
                (self.cloud_connection(), InitOutcome::CloudFallback)
            }
            Err(err) => {
                log::error!("Failed to read stored Home Assistant credentials: {err}");
                (self.cloud_connection(), InitOutcome::CloudFallback)
            }
        };

        self.store.lock().await.set_connection(conn);
        outcome
    }

    fn cloud_connection(&self) -> Connection {
        Connection::new(self.network.cloud_base_url(), self.network.shared_token())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::{Mutex, Notify};
    use tokio_util::sync::CancellationToken;

    use neolia_api::config::NetworkConfig;

    use crate::connection::{ConnectionInitializer, InitOutcome, resolve_effective_config};
    use crate::error::{ApiError, ApiResult};
    use crate::model::credentials::{CredentialSource, HaCredentials};
    use crate::model::hass::{Connection, HassStore};
    use crate::platform::DisplayMode;

    enum Stored {
        Nothing,
        Creds(HaCredentials),
        Broken,
        Never(Arc<Notify>),
    }

    struct FakeCredentials {
        stored: Stored,
        reads: AtomicUsize,
    }

    impl FakeCredentials {
        fn new(stored: Stored) -> Arc<Self> {
            Arc::new(Self {
                stored,
                reads: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CredentialSource for FakeCredentials {
        async fn load_credentials(&self) -> ApiResult<Option<HaCredentials>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            match &self.stored {
                Stored::Nothing => Ok(None),
                Stored::Creds(creds) => Ok(Some(creds.clone())),
                Stored::Broken => Err(ApiError::InvalidFormat("blob".to_string())),
                Stored::Never(started) => {
                    started.notify_one();
                    std::future::pending().await
                }
            }
        }
    }

    fn network() -> NetworkConfig {
        NetworkConfig {
            dev_token: "shared".to_string(),
            panel_url: "http://192.168.1.219:8123".to_string(),
            ..NetworkConfig::default()
        }
    }

    fn setup(
        stored: Stored,
    ) -> (ConnectionInitializer, Arc<Mutex<HassStore>>, Arc<FakeCredentials>) {
        let store = Arc::new(Mutex::new(HassStore::new()));
        let creds = FakeCredentials::new(stored);
        let init = ConnectionInitializer::new(store.clone(), creds.clone(), network());
        (init, store, creds)
    }

    #[tokio::test]
    async fn panel_ignores_stored_credentials() {
        let (init, store, creds) = setup(Stored::Creds(HaCredentials {
            base_url: "https://remote".to_string(),
            token: "user".to_string(),
        }));
        store
            .lock()
            .await
            .set_connection(Connection::new("https://old", "old"));

        let outcome = init.run(DisplayMode::Panel, &CancellationToken::new()).await;

        assert_eq!(outcome, InitOutcome::Panel);
        assert_eq!(creds.reads.load(Ordering::SeqCst), 0);
        let store = store.lock().await;
        let conn = store.connection().unwrap();
        assert_eq!(conn.url, "http://192.168.1.219:8123");
        assert_eq!(conn.token, "shared");
        assert!(store.is_initialized());
    }

    #[tokio::test]
    async fn mobile_without_credentials_uses_cloud() {
        let (init, store, _creds) = setup(Stored::Nothing);

        let outcome = init.run(DisplayMode::Mobile, &CancellationToken::new()).await;

        assert_eq!(outcome, InitOutcome::CloudFallback);
        let store = store.lock().await;
        assert_eq!(store.connection().unwrap().url, NetworkConfig::CLOUD_BASE_URL);
        assert_eq!(store.connection().unwrap().token, "shared");
        assert!(store.is_initialized());
    }

    #[tokio::test]
    async fn tablet_restores_stored_credentials() {
        let (init, store, _creds) = setup(Stored::Creds(HaCredentials {
            base_url: "http://10.0.0.5:8123/".to_string(),
            token: "user-token".to_string(),
        }));

        let outcome = init.run(DisplayMode::Tablet, &CancellationToken::new()).await;

        assert_eq!(outcome, InitOutcome::Restored);
        let store = store.lock().await;
        assert_eq!(store.connection().unwrap().url, "http://10.0.0.5:8123");
        assert_eq!(store.connection().unwrap().token, "user-token");
    }

    #[tokio::test]
    async fn read_error_falls_back_and_completes() {
        let (init, store, _creds) = setup(Stored::Broken);

        let outcome = init.run(DisplayMode::Mobile, &CancellationToken::new()).await;

        assert_eq!(outcome, InitOutcome::CloudFallback);
        let store = store.lock().await;
        assert!(store.is_initialized());
        assert_eq!(store.connection().unwrap().url, NetworkConfig::CLOUD_BASE_URL);
    }

    #[tokio::test]
    async fn usable_connection_is_kept() {
        let (init, store, creds) = setup(Stored::Nothing);
        store
            .lock()
            .await
            .set_connection(Connection::new("http://mine:8123", "mine"));

        let outcome = init.run(DisplayMode::Mobile, &CancellationToken::new()).await;

        assert_eq!(outcome, InitOutcome::Kept);
        assert_eq!(creds.reads.load(Ordering::SeqCst), 0);
        assert_eq!(store.lock().await.connection().unwrap().url, "http://mine:8123");
    }

    #[tokio::test]
    async fn cancelled_read_leaves_connection_untouched() {
        let started = Arc::new(Notify::new());
        let (init, store, _creds) = setup(Stored::Never(started.clone()));
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { init.run(DisplayMode::Mobile, &cancel).await })
        };
        started.notified().await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), InitOutcome::Cancelled);
        let store = store.lock().await;
        assert!(store.connection().is_none());
        assert!(store.is_initialized());
    }

    #[test]
    fn effective_config_falls_back_per_field() {
        let net = network();

        let panel = resolve_effective_config(DisplayMode::Panel, None, &net);
        assert!(panel.is_panel);
        assert_eq!(panel.base_url, "http://192.168.1.219:8123");

        let conn = Connection::new("http://10.0.0.5:8123", "");
        let cfg = resolve_effective_config(DisplayMode::Tablet, Some(&conn), &net);
        assert_eq!(cfg.base_url, "http://10.0.0.5:8123");
        assert_eq!(cfg.token, "shared");
        assert!(!cfg.is_panel);

        let cfg = resolve_effective_config(DisplayMode::Mobile, None, &net);
        assert_eq!(cfg.base_url, NetworkConfig::CLOUD_BASE_URL);
        assert!(cfg.is_complete());
    }
}
