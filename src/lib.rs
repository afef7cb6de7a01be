pub mod backend;
pub mod config;
pub mod connection;
pub mod error;
pub mod fields;
pub mod intercom;
pub mod model;
pub mod panel;
pub mod platform;
pub mod recovery;
pub mod server;

#[cfg(test)]
mod test_support;
