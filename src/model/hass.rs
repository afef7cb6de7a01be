use serde::{Deserialize, Serialize};

/// Number of consecutive failed commands after which the connectivity
/// banner is shown.
pub const CONNECTION_ISSUE_THRESHOLD: u32 = 3;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// The Home Assistant instance the client talks to.
///
/// Replaced wholesale on reconnect or logout. `connected` mirrors socket
/// readiness and is only flipped by the connection manager.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct Connection {
    pub url: String,
    pub token: String,
    #[serde(default)]
    connected: bool,
}

impl Connection {
    #[must_use]
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            connected: false,
        }
    }

    #[must_use]
    pub const fn connected(&self) -> bool {
        self.connected
    }

    /// Both url and token are filled in.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        !self.url.trim().is_empty() && !self.token.trim().is_empty()
    }
}

/// Shared Home Assistant session state.
#[derive(Clone, Debug, Default)]
pub struct HassStore {
    connection: Option<Connection>,
    status: ConnectionStatus,
    last_error: Option<String>,
    connection_issues: u32,
    initialized: bool,
}

impl HassStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn set_connection(&mut self, connection: Connection) {
        self.connection = Some(connection);
    }

    /// Logout: forget the connection entirely.
    pub fn disconnect(&mut self) {
        self.connection = None;
        self.status = ConnectionStatus::Disconnected;
        self.last_error = None;
    }

    #[must_use]
    pub const fn status(&self) -> ConnectionStatus {
        self.status
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self.status, ConnectionStatus::Connected)
    }

    pub(crate) fn mark_connecting(&mut self) {
        self.status = ConnectionStatus::Connecting;
        self.last_error = None;
    }

    pub(crate) fn mark_connected(&mut self) {
        self.status = ConnectionStatus::Connected;
        self.last_error = None;
        self.set_socket_ready(true);
    }

    pub(crate) fn mark_disconnected(&mut self) {
        self.status = ConnectionStatus::Disconnected;
        self.set_socket_ready(false);
    }

    pub(crate) fn mark_error(&mut self, error: impl Into<String>) {
        self.status = ConnectionStatus::Error;
        self.last_error = Some(error.into());
        self.set_socket_ready(false);
    }

    fn set_socket_ready(&mut self, ready: bool) {
        if let Some(conn) = &mut self.connection {
            conn.connected = ready;
        }
    }

    pub fn increment_connection_issue(&mut self) {
        self.connection_issues = self.connection_issues.saturating_add(1);
    }

    pub fn reset_connection_issue(&mut self) {
        self.connection_issues = 0;
    }

    #[must_use]
    pub const fn connection_issues(&self) -> u32 {
        self.connection_issues
    }

    #[must_use]
    pub const fn show_connection_banner(&self) -> bool {
        self.connection_issues >= CONNECTION_ISSUE_THRESHOLD
    }

    pub(crate) fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }
}

#[cfg(test)]
mod tests {
    use crate::model::hass::{Connection, ConnectionStatus, HassStore};

    #[test]
    fn connected_flag_follows_socket_state() {
        let mut store = HassStore::new();
        store.set_connection(Connection::new("http://ha:8123", "token"));
        assert!(!store.connection().unwrap().connected());

        store.mark_connected();
        assert!(store.connection().unwrap().connected());
        assert_eq!(store.status(), ConnectionStatus::Connected);

        store.mark_error("socket closed");
        assert!(!store.connection().unwrap().connected());
        assert_eq!(store.last_error(), Some("socket closed"));
    }

    #[test]
    fn replacing_connection_resets_connected_flag() {
        let mut store = HassStore::new();
        store.set_connection(Connection::new("http://a:8123", "t1"));
        store.mark_connected();

        store.set_connection(Connection::new("http://b:8123", "t2"));
        let conn = store.connection().unwrap();
        assert_eq!(conn.url, "http://b:8123");
        assert!(!conn.connected());
    }

    #[test]
    fn banner_after_three_consecutive_issues() {
        let mut store = HassStore::new();
        store.increment_connection_issue();
        store.increment_connection_issue();
        assert!(!store.show_connection_banner());

        store.increment_connection_issue();
        assert!(store.show_connection_banner());

        store.reset_connection_issue();
        assert!(!store.show_connection_banner());
    }

    #[test]
    fn usable_requires_url_and_token() {
        assert!(Connection::new("http://ha:8123", "t").is_usable());
        assert!(!Connection::new("http://ha:8123", " ").is_usable());
        assert!(!Connection::new("", "t").is_usable());
    }
}
