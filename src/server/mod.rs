pub mod agent;
pub mod appstate;
