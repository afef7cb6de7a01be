pub mod bootstrap;
pub mod config;
pub mod intercom;
pub mod panel;
pub mod sip;
