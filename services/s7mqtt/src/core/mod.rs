//! Service core: configuration and process plumbing

pub mod bootstrap;
pub mod config;
pub mod reconnect;
