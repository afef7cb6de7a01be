use neolia_api::config::{AppConfig, AppTarget};

/// How the client presents itself. Panel is the wall-mounted, natively
/// hosted mode wired to a fixed LAN Home Assistant.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DisplayMode {
    Mobile,
    Tablet,
    Panel,
}

impl DisplayMode {
    pub const MOBILE_MAX_WIDTH: u32 = 600;

    #[must_use]
    pub const fn is_panel(self) -> bool {
        matches!(self, Self::Panel)
    }
}

/// Runtime facts about the host, as reported by the native shell.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PlatformInfo {
    /// Platform name reported by the native bridge (`android`, `ios`, `web`).
    pub native_platform: String,
    pub user_agent: String,
    /// Running as an installed, standalone web app.
    pub standalone: bool,
    pub panel_override: bool,
    pub panel_build: bool,
    pub viewport_width: u32,
}

impl PlatformInfo {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            native_platform: config.app.native_platform.trim().to_ascii_lowercase(),
            user_agent: config.app.user_agent.clone(),
            standalone: config.app.standalone,
            panel_override: config.app.panel_override,
            panel_build: config.app.target == AppTarget::Panel,
            viewport_width: config.app.viewport_width,
        }
    }

    #[must_use]
    pub fn is_android_device(&self) -> bool {
        self.user_agent.to_ascii_lowercase().contains("android")
    }

    /// Native Android webview detection. The bridge may report late (or
    /// `web`) on some panels, so an Android user agent is enough on its own:
    /// kiosk shells serve the app from arbitrary origins.
    #[must_use]
    pub fn is_native_android(&self) -> bool {
        self.native_platform == "android" || self.is_android_device()
    }

    #[must_use]
    pub fn is_panel_mode(&self) -> bool {
        self.is_native_android()
    }

    #[must_use]
    pub fn is_ios(&self) -> bool {
        ["iPad", "iPhone", "iPod"]
            .iter()
            .any(|x| self.user_agent.contains(x))
    }

    #[must_use]
    pub fn is_ios_pwa(&self) -> bool {
        self.is_ios() && self.standalone
    }

    /// Panel comes from the build target or an explicit override, never from
    /// runtime sniffing. Otherwise the viewport decides.
    #[must_use]
    pub const fn display_mode(&self) -> DisplayMode {
        if self.panel_override || self.panel_build {
            DisplayMode::Panel
        } else if self.viewport_width < DisplayMode::MOBILE_MAX_WIDTH {
            DisplayMode::Mobile
        } else {
            DisplayMode::Tablet
        }
    }

    #[must_use]
    pub fn kind(&self) -> PlatformKind {
        PlatformKind {
            ios: self.is_ios(),
            ios_pwa: self.is_ios_pwa(),
        }
    }
}

/// The platform facts recovery policies care about.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PlatformKind {
    pub ios: bool,
    pub ios_pwa: bool,
}
