//! Intercepting CDP proxy that infers locator health from relayed traffic.
//!
//! One WebSocket endpoint faces the automation client, one connection per
//! session faces the real browser; commands and replies pass through
//! unmodified apart from a fixed field whitelist, while the locator tracker
//! observes both directions.

pub mod browser;
pub mod cli;
pub mod discover;
pub mod dump;
pub mod logging;
pub mod server;
pub mod session;
