//! Parley gateway library.
//!
//! Relays an upstream agent's event stream to browser clients, proxies
//! chat commands and serves session history.

pub mod api;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod history;
pub mod relay;
pub mod upstream;
