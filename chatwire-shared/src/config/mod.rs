//! # Configuration
//!
//! Server configuration: profile defaults layered with a config file,
//! `CHATWIRE_*` environment variables and CLI overrides.

pub mod server;
