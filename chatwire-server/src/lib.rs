#![cfg_attr(not(test), forbid(unsafe_code))]

//! Chat delivery service: durable direct and group threads on an append-only
//! log, plus a live WebSocket relay.

pub mod app_state;
pub mod bus;
pub mod commands;
pub mod db;
pub mod handlers;
pub mod http;
pub mod middleware;
pub mod openapi;
pub mod routes;
pub mod server;
pub mod services;
mod tracer;
