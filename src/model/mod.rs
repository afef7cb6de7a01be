pub mod credentials;
pub mod hass;
pub mod panel;
pub mod sip;
