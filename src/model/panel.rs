use std::fs::{self, File};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use neolia_api::panel::NeoliaPanelConfig;

use crate::error::ApiResult;

/// The part of the panel onboarding state that survives restarts.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PanelOnboarding {
    #[serde(default)]
    pub entered_neolia_code: String,
    #[serde(default)]
    pub has_completed_sn_step: bool,
}

#[derive(Clone, Debug)]
pub struct PanelConfigStore {
    file: Utf8PathBuf,
    onboarding: PanelOnboarding,
    config: Option<NeoliaPanelConfig>,
    error: Option<String>,
    loading: bool,
    loaded: bool,
}

impl PanelConfigStore {
    pub fn load(file: Utf8PathBuf) -> ApiResult<Self> {
        let onboarding = if file.is_file() {
            match File::open(&file).and_then(|fd| {
                serde_yml::from_reader::<_, PanelOnboarding>(fd).map_err(std::io::Error::other)
            }) {
                Ok(onboarding) => onboarding,
                Err(err) => {
                    log::warn!("Failed to parse {file}, using defaults: {err}");
                    PanelOnboarding::default()
                }
            }
        } else {
            PanelOnboarding::default()
        };

        Ok(Self {
            file,
            onboarding,
            config: None,
            error: None,
            loading: false,
            loaded: false,
        })
    }

    /// Writes the onboarding fields only. The resolved panel config holds
    /// network credentials and stays in memory.
    pub fn save(&self) -> ApiResult<()> {
        if let Some(parent) = self.file.parent() {
            if !parent.as_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(&self.file)?;
        serde_yml::to_writer(file, &self.onboarding)?;
        Ok(())
    }

    #[must_use]
    pub const fn onboarding(&self) -> &PanelOnboarding {
        &self.onboarding
    }

    pub fn set_entered_neolia_code(&mut self, code: &str) -> ApiResult<()> {
        self.onboarding.entered_neolia_code = code.trim().to_string();
        self.save()
    }

    pub fn set_completed_sn_step(&mut self, done: bool) -> ApiResult<()> {
        self.onboarding.has_completed_sn_step = done;
        self.save()
    }

    #[must_use]
    pub const fn config(&self) -> Option<&NeoliaPanelConfig> {
        self.config.as_ref()
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    #[must_use]
    pub const fn loading(&self) -> bool {
        self.loading
    }

    #[must_use]
    pub const fn loaded(&self) -> bool {
        self.loaded
    }

    pub fn set_config(&mut self, config: NeoliaPanelConfig) {
        self.config = Some(config);
        self.error = None;
        self.loading = false;
        self.loaded = true;
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.loading = false;
        self.loaded = true;
    }

    pub const fn set_loading(&mut self, loading: bool) {
        self.loading = loading;
    }

    /// Clears the session fields. Onboarding progress is kept.
    pub fn reset(&mut self) {
        self.config = None;
        self.error = None;
        self.loading = false;
        self.loaded = false;
    }
}
