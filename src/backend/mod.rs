pub mod bootstrap;
pub mod discovery;
pub mod hass;
pub mod mqtt;
