pub mod client;
pub mod ws;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{ApiError, ApiResult};
use crate::model::hass::HassStore;

pub use self::client::{HassClient, HassState, fetch_neolia_panel_config};
pub use self::ws::WsConnector;

/// Latest known state of every entity, keyed by entity id.
pub type EntityMap = BTreeMap<String, HassState>;

pub type Listener = Arc<dyn Fn(&EntityMap) + Send + Sync>;

/// A live, authenticated Home Assistant session.
#[async_trait]
pub trait HassSession: Send + Sync {
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Map<String, Value>,
    ) -> ApiResult<()>;

    async fn get_states(&self) -> ApiResult<Vec<HassState>>;
}

/// What a successful connect hands back: the command side and the stream of
/// full entity maps. The stream ends when the session dies.
pub struct HassLink {
    pub session: Arc<dyn HassSession>,
    pub updates: mpsc::Receiver<EntityMap>,
}

#[async_trait]
pub trait HassConnector: Send + Sync {
    async fn connect(&self, url: &str, token: &str) -> ApiResult<HassLink>;
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

#[derive(Default)]
struct Shared {
    session: Mutex<Option<Arc<dyn HassSession>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
    entities: Mutex<Arc<EntityMap>>,
    listeners: Mutex<Listeners>,
    fanout: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Shared {
    /// Caches the map and hands it to every listener in registration order.
    /// Concurrent publishes never interleave.
    fn publish(&self, entities: EntityMap) {
        let _fanout = lock(&self.fanout);
        let entities = Arc::new(entities);
        *lock(&self.entities) = entities.clone();

        let listeners: Vec<Listener> = lock(&self.listeners)
            .entries
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in &listeners {
            listener(&entities);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }
}

/// Handle returned by [`ConnectionManager::subscribe`].
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    /// Removes exactly this registration. Other registrations of the same
    /// listener stay.
    pub fn unsubscribe(self) {
        if let Some(shared) = self.shared.upgrade() {
            lock(&shared.listeners)
                .entries
                .retain(|(id, _)| *id != self.id);
        }
    }
}

/// Owns the single Home Assistant connection of the process.
///
/// One pump task per connection forwards entity maps to the listeners.
/// Listeners outlive connections: they keep receiving updates after a
/// reconnect until they unsubscribe.
#[derive(Clone)]
pub struct ConnectionManager {
    connector: Arc<dyn HassConnector>,
    store: Arc<tokio::sync::Mutex<HassStore>>,
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn HassConnector>,
        store: Arc<tokio::sync::Mutex<HassStore>>,
    ) -> Self {
        Self {
            connector,
            store,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Establishes a connection, replacing any previous one. The previous
    /// session is dropped before dialing, so a failed attempt leaves the
    /// manager disconnected.
    pub async fn init(&self, url: &str, token: &str) -> ApiResult<()> {
        if self.drop_session() {
            log::debug!("Dropping previous Home Assistant session before reconnecting");
        }
        self.store.lock().await.mark_connecting();

        let link = match self.connector.connect(url, token).await {
            Ok(link) => link,
            Err(err) => {
                log::error!("Home Assistant connection to {url} failed: {err}");
                self.store.lock().await.mark_error(err.to_string());
                return Err(err);
            }
        };
        let HassLink {
            session,
            mut updates,
        } = link;

        let generation = self.shared.generation.load(Ordering::SeqCst);
        *lock(&self.shared.session) = Some(session);
        self.store.lock().await.mark_connected();

        let shared = self.shared.clone();
        let store = self.store.clone();
        let pump = tokio::spawn(async move {
            while let Some(entities) = updates.recv().await {
                if !shared.is_current(generation) {
                    return;
                }
                shared.publish(entities);
            }

            if shared.is_current(generation) {
                log::warn!("Home Assistant connection lost");
                lock(&shared.session).take();
                store.lock().await.mark_disconnected();
            }
        });

        if let Some(previous) = lock(&self.shared.pump).replace(pump) {
            previous.abort();
        }

        Ok(())
    }

    /// Invalidates the running pump and forgets the session. Returns whether
    /// a session was live.
    fn drop_session(&self) -> bool {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let had_session = lock(&self.shared.session).take().is_some();
        if let Some(pump) = lock(&self.shared.pump).take() {
            pump.abort();
        }
        had_session
    }

    #[must_use]
    pub fn current(&self) -> Option<Arc<dyn HassSession>> {
        lock(&self.shared.session).clone()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        lock(&self.shared.session).is_some()
    }

    /// Last entity map received, empty before the first push.
    #[must_use]
    pub fn entities(&self) -> Arc<EntityMap> {
        lock(&self.shared.entities).clone()
    }

    pub fn subscribe(&self, listener: impl Fn(&EntityMap) + Send + Sync + 'static) -> Subscription {
        self.subscribe_listener(Arc::new(listener))
    }

    pub fn subscribe_listener(&self, listener: Listener) -> Subscription {
        let mut listeners = lock(&self.shared.listeners);
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.entries.push((id, listener));
        drop(listeners);

        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        lock(&self.shared.listeners).entries.len()
    }

    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Map<String, Value>,
    ) -> ApiResult<()> {
        let session = self.current().ok_or(ApiError::NotConnected)?;
        session.call_service(domain, service, data).await
    }

    /// Same as [`Self::call_service`], but feeds the outcome into the
    /// connection issue counter.
    pub async fn call_service_tracked(
        &self,
        domain: &str,
        service: &str,
        data: Map<String, Value>,
    ) -> ApiResult<()> {
        let res = self.call_service(domain, service, data).await;

        let mut store = self.store.lock().await;
        match &res {
            Ok(()) => store.reset_connection_issue(),
            Err(err) => {
                log::error!("Service {domain}.{service} failed: {err}");
                store.increment_connection_issue();
            }
        }
        drop(store);

        res
    }

    /// Pulls a fresh entity list and publishes it like a pushed update.
    pub async fn refresh_entities(&self) -> ApiResult<()> {
        let session = self.current().ok_or(ApiError::NotConnected)?;
        let states = session.get_states().await?;
        log::debug!("Refreshed {} entities", states.len());

        self.shared.publish(
            states
                .into_iter()
                .map(|state| (state.entity_id.clone(), state))
                .collect(),
        );
        Ok(())
    }

    /// Drops the connection. Listeners stay registered.
    pub async fn teardown(&self) {
        self.drop_session();
        *lock(&self.shared.entities) = Arc::new(EntityMap::new());
        self.store.lock().await.mark_disconnected();
    }
}
