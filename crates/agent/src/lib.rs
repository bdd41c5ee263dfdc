//! Container monitor daemon
//!
//! Wires the monitoring pipelines to Docker and SQLite and serves the HTTP API.

pub mod api;
pub mod config;
