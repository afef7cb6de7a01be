use std::fs::{self, File};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use neolia_api::sip::SipConfig;

use crate::error::ApiResult;

#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
struct SipStoreFile {
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    config: Option<SipConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth_code: Option<String>,
}

/// Persisted SIP account of the user, used to register with the intercom
/// registrar.
#[derive(Clone, Debug)]
pub struct SipConfigStore {
    file: Utf8PathBuf,
    config: Option<SipConfig>,
    auth_code: Option<String>,
}

impl SipConfigStore {
    pub const VERSION: u32 = 1;

    pub fn load(file: Utf8PathBuf) -> ApiResult<Self> {
        let mut state = Self {
            file,
            config: None,
            auth_code: None,
        };

        if !state.file.is_file() {
            return Ok(state);
        }

        match File::open(&state.file).and_then(|fd| {
            serde_yml::from_reader::<_, SipStoreFile>(fd).map_err(std::io::Error::other)
        }) {
            Ok(stored) if stored.version == Self::VERSION => {
                state.config = stored.config;
                state.auth_code = stored.auth_code;
            }
            Ok(stored) => {
                log::warn!(
                    "Unsupported SIP config version {} in {}, using defaults",
                    stored.version,
                    state.file
                );
            }
            Err(err) => {
                log::warn!("Failed to parse {}, using defaults: {}", state.file, err);
            }
        }

        Ok(state)
    }

    pub fn save(&self) -> ApiResult<()> {
        if let Some(parent) = self.file.parent() {
            if !parent.as_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let stored = SipStoreFile {
            version: Self::VERSION,
            config: self.config.clone(),
            auth_code: self.auth_code.clone(),
        };
        let file = File::create(&self.file)?;
        serde_yml::to_writer(file, &stored)?;
        Ok(())
    }

    #[must_use]
    pub const fn config(&self) -> Option<&SipConfig> {
        self.config.as_ref()
    }

    #[must_use]
    pub fn auth_code(&self) -> Option<&str> {
        self.auth_code.as_deref()
    }

    pub fn set_config(&mut self, config: Option<SipConfig>) -> ApiResult<()> {
        self.config = config;
        self.save()
    }

    pub fn set_auth_code(&mut self, code: &str) -> ApiResult<()> {
        self.auth_code = Some(code.trim().to_string());
        self.save()
    }

    /// Logout.
    pub fn reset(&mut self) -> ApiResult<()> {
        self.config = None;
        self.auth_code = None;
        self.save()
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.config.as_ref().is_some_and(SipConfig::is_valid)
    }
}
