//! Locator extraction and verification tracking for the CDP healing proxy.
//!
//! The proxy relays Chrome DevTools Protocol traffic between an automation
//! client and a real browser. This crate holds the traffic-inference half of
//! that job:
//!
//! - [`extract`] recovers locator expressions from the several wire encodings
//!   of "find an element"
//! - [`wire`] models Playwright's recursive argument encoding as an explicit
//!   tagged tree
//! - [`tracker`] classifies locators as verified or broken from reply signals
//!   and a periodic sweep
//! - [`report`] defines the broken-locator record and its append-only sink

pub mod error;
pub mod extract;
pub mod report;
pub mod tracker;
pub mod wire;

pub use error::{Error, Result};
pub use extract::{Engine, SelectorInfo, extract_selector};
pub use report::{BrokenLocatorReport, JsonlSink, ReportSink};
pub use tracker::{LocatorTracker, PendingSelectors, spawn_sweeper};
