use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SipConfig {
    /// `user@domain`
    pub uri: String,
    pub password: String,
    pub ws_servers: String,
    #[serde(default)]
    pub display_name: String,
}

impl SipConfig {
    /// All mandatory fields present, a `user@domain` uri, and a secure
    /// websocket transport.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.uri.is_empty()
            && !self.password.is_empty()
            && !self.ws_servers.is_empty()
            && self.uri.contains('@')
            && self.ws_servers.starts_with("wss://")
    }
}
