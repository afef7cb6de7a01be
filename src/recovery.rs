use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use neolia_api::config::RecoveryConfig;

use crate::error::ApiResult;
use crate::platform::PlatformKind;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Visibility {
    Hidden,
    Visible,
}

#[derive(Clone, Copy, Debug)]
pub struct VisibilityEvent {
    pub visibility: Visibility,
    pub at: Instant,
    /// Time since the last hide, on visible events that follow one.
    pub hidden_duration: Option<Duration>,
    /// Set on the first visible event the dispatcher sees.
    pub first_visible: bool,
    pub platform: PlatformKind,
}

impl VisibilityEvent {
    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.visibility == Visibility::Visible
    }
}

/// Ordered by strength: merging picks the maximum.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum RecoveryAction {
    None,
    RefreshEntities,
    Reload,
}

pub trait RecoveryPolicy: Send {
    fn name(&self) -> &'static str;

    fn on_event(&mut self, event: &VisibilityEvent) -> RecoveryAction;

    /// Back to the state of a freshly started client.
    fn reset(&mut self);
}

#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    async fn refresh_entities(&self) -> ApiResult<()>;

    async fn reload(&self) -> ApiResult<()>;
}

fn elapsed_since(last: Option<Instant>, at: Instant) -> Option<Duration> {
    last.map(|last| at.saturating_duration_since(last))
}

/// Refreshes entity states on every return to the foreground, at most once
/// per window.
pub struct EntityRefreshPolicy {
    window: Duration,
    last: Option<Instant>,
}

impl EntityRefreshPolicy {
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self { window, last: None }
    }
}

impl RecoveryPolicy for EntityRefreshPolicy {
    fn name(&self) -> &'static str {
        "entity-refresh"
    }

    fn on_event(&mut self, event: &VisibilityEvent) -> RecoveryAction {
        if !event.is_visible() {
            return RecoveryAction::None;
        }
        if elapsed_since(self.last, event.at).is_some_and(|x| x < self.window) {
            return RecoveryAction::None;
        }
        self.last = Some(event.at);
        RecoveryAction::RefreshEntities
    }

    fn reset(&mut self) {
        self.last = None;
    }
}

/// Full reload when coming back to the foreground, except for the initial
/// visible state.
pub struct ForegroundReloadPolicy {
    window: Duration,
    last: Option<Instant>,
}

impl ForegroundReloadPolicy {
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self { window, last: None }
    }
}

impl RecoveryPolicy for ForegroundReloadPolicy {
    fn name(&self) -> &'static str {
        "foreground-reload"
    }

    fn on_event(&mut self, event: &VisibilityEvent) -> RecoveryAction {
        if !event.is_visible() || event.first_visible {
            return RecoveryAction::None;
        }
        if elapsed_since(self.last, event.at).is_some_and(|x| x <= self.window) {
            return RecoveryAction::None;
        }
        self.last = Some(event.at);
        RecoveryAction::Reload
    }

    fn reset(&mut self) {
        self.last = None;
    }
}

/// iOS suspends sockets aggressively in the background; reload on resume.
pub struct IosReloadPolicy {
    window: Duration,
    last: Option<Instant>,
}

impl IosReloadPolicy {
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self { window, last: None }
    }
}

impl RecoveryPolicy for IosReloadPolicy {
    fn name(&self) -> &'static str {
        "ios-reload"
    }

    fn on_event(&mut self, event: &VisibilityEvent) -> RecoveryAction {
        if !event.platform.ios || !event.is_visible() {
            return RecoveryAction::None;
        }
        if elapsed_since(self.last, event.at).is_some_and(|x| x < self.window) {
            return RecoveryAction::None;
        }
        self.last = Some(event.at);
        RecoveryAction::Reload
    }

    fn reset(&mut self) {
        self.last = None;
    }
}

/// Installed iOS web apps: one reload per hide after a long stay in the
/// background.
pub struct LongBackgroundGuard {
    threshold: Duration,
    reloaded: bool,
}

impl LongBackgroundGuard {
    #[must_use]
    pub const fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            reloaded: false,
        }
    }
}

impl RecoveryPolicy for LongBackgroundGuard {
    fn name(&self) -> &'static str {
        "long-background"
    }

    fn on_event(&mut self, event: &VisibilityEvent) -> RecoveryAction {
        if !event.platform.ios_pwa {
            return RecoveryAction::None;
        }
        match event.visibility {
            Visibility::Hidden => {
                self.reloaded = false;
                RecoveryAction::None
            }
            Visibility::Visible => {
                let long = event.hidden_duration.is_some_and(|x| x > self.threshold);
                if long && !self.reloaded {
                    self.reloaded = true;
                    RecoveryAction::Reload
                } else {
                    RecoveryAction::None
                }
            }
        }
    }

    fn reset(&mut self) {
        self.reloaded = false;
    }
}

/// Single observer of visibility transitions, fanning each one out to the
/// registered policies and merging their verdicts into one action.
pub struct VisibilityDispatcher {
    platform: PlatformKind,
    policies: Vec<Box<dyn RecoveryPolicy>>,
    hidden_since: Option<Instant>,
    seen_visible: bool,
}

impl VisibilityDispatcher {
    #[must_use]
    pub fn new(platform: PlatformKind) -> Self {
        Self {
            platform,
            policies: vec![],
            hidden_since: None,
            seen_visible: false,
        }
    }

    /// Dispatcher with the standard policy set.
    #[must_use]
    pub fn from_config(config: &RecoveryConfig, platform: PlatformKind) -> Self {
        let mut dispatcher = Self::new(platform)
            .with_policy(EntityRefreshPolicy::new(Duration::from_millis(
                config.entity_refresh_ms,
            )))
            .with_policy(IosReloadPolicy::new(Duration::from_millis(config.ios_reload_ms)))
            .with_policy(LongBackgroundGuard::new(Duration::from_millis(
                config.long_background_ms,
            )));

        if config.foreground_reload {
            dispatcher = dispatcher.with_policy(ForegroundReloadPolicy::new(Duration::from_millis(
                config.foreground_reload_ms,
            )));
        }
        dispatcher
    }

    #[must_use]
    pub fn with_policy(mut self, policy: impl RecoveryPolicy + 'static) -> Self {
        self.policies.push(Box::new(policy));
        self
    }

    #[must_use]
    pub fn policy_names(&self) -> Vec<&'static str> {
        self.policies.iter().map(|p| p.name()).collect()
    }

    /// Feeds one transition to every policy and returns the merged action.
    pub fn observe(&mut self, visibility: Visibility, at: Instant) -> RecoveryAction {
        let event = match visibility {
            Visibility::Hidden => {
                self.hidden_since = Some(at);
                VisibilityEvent {
                    visibility,
                    at,
                    hidden_duration: None,
                    first_visible: false,
                    platform: self.platform,
                }
            }
            Visibility::Visible => {
                let first_visible = !self.seen_visible;
                self.seen_visible = true;
                VisibilityEvent {
                    visibility,
                    at,
                    hidden_duration: elapsed_since(self.hidden_since, at),
                    first_visible,
                    platform: self.platform,
                }
            }
        };

        let mut merged = RecoveryAction::None;
        for policy in &mut self.policies {
            let action = policy.on_event(&event);
            if action != RecoveryAction::None {
                log::debug!("[{}] wants {action:?} on {visibility:?}", policy.name());
            }
            merged = merged.max(action);
        }
        merged
    }

    /// Forgets every transition seen so far. A reload restarts the client,
    /// so the next visible event counts as the first one again.
    pub fn remount(&mut self) {
        self.hidden_since = None;
        self.seen_visible = false;
        for policy in &mut self.policies {
            policy.reset();
        }
    }

    /// Observes a transition and carries out the merged action. Failures are
    /// logged, never retried. Carrying out a reload remounts the dispatcher.
    pub async fn dispatch(
        &mut self,
        visibility: Visibility,
        at: Instant,
        handler: &dyn RecoveryHandler,
    ) -> RecoveryAction {
        let action = self.observe(visibility, at);
        let res = match action {
            RecoveryAction::None => Ok(()),
            RecoveryAction::RefreshEntities => handler.refresh_entities().await,
            RecoveryAction::Reload => {
                log::info!("Reloading after {visibility:?} transition");
                let res = handler.reload().await;
                self.remount();
                res
            }
        };
        if let Err(err) = res {
            log::error!("Foreground recovery ({action:?}) failed: {err}");
        }
        action
    }

    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<Visibility>,
        handler: Arc<dyn RecoveryHandler>,
    ) {
        while let Some(visibility) = events.recv().await {
            self.dispatch(visibility, Instant::now(), handler.as_ref())
                .await;
        }
    }
}
