#![cfg_attr(not(test), forbid(unsafe_code))]

//! Wire models, conversation addressing, and configuration shared by the
//! Chatwire server and its clients.

pub mod config;
pub mod models;
