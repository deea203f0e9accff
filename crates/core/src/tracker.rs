//! Time-windowed locator health classification.
//!
//! The protocol carries no explicit "selector did not resolve" signal, so the
//! tracker infers health from three inputs: sightings registered by the proxy
//! ([`LocatorTracker::track`]), resolution evidence parsed out of browser
//! replies ([`LocatorTracker::observe_reply`]), and a periodic sweep that
//! classifies locators which stayed unverified long enough as broken.
//!
//! The registry is shared process-wide and partitioned by session id. Per
//! entry, `verified` and `reported` are monotonic, mutually exclusive
//! terminal states: attempts only grow and the flags only flip once, so the
//! sweep and the session paths never need a global lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::extract::Engine;
use crate::report::{BrokenLocatorReport, ReportSink, unix_millis};
use crate::wire::WireValue;

/// Interval between sweep passes.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Quiet period after the last attempt before an unverified locator may be
/// reported. A locator still being actively retried is never reported
/// mid-attempt.
const CONFIRMATION_DELAY: Duration = Duration::from_secs(5);

/// Below this observation window a single sighting is not enough evidence.
const MIN_EVIDENCE_WINDOW: Duration = Duration::from_millis(100);

const BROKEN_ATTEMPT_THRESHOLD: u32 = 3;
const BROKEN_DURATION_THRESHOLD: Duration = Duration::from_millis(1000);

/// Terminal entries idle longer than this are evicted.
const RETENTION_WINDOW: Duration = Duration::from_secs(60);

/// Selectors that legitimately go unverified in normal traffic; auto-marked
/// verified to suppress known false positives.
const SKIP_LIST: [&str; 3] = [":scope > LEGEND", "body", "html"];

/// In-flight command id -> selector, owned by a session and shared with its
/// browser connection. An entry is consumed at most once, when the reply for
/// that id arrives.
pub type PendingSelectors = DashMap<u64, String>;

#[derive(Debug)]
struct LocatorStatus {
    engine: Engine,
    first_seen: Instant,
    last_attempt: Instant,
    attempts: u32,
    verified: bool,
    reported: bool,
}

impl LocatorStatus {
    fn new(engine: Engine, now: Instant) -> Self {
        Self {
            engine,
            first_seen: now,
            last_attempt: now,
            attempts: 1,
            verified: false,
            reported: false,
        }
    }

    fn terminal(&self) -> bool {
        self.verified || self.reported
    }
}

/// Process-wide locator health registry.
///
/// Constructed once at startup and passed by `Arc` to the proxy sessions and
/// the sweep task.
pub struct LocatorTracker {
    sessions: DashMap<String, DashMap<String, LocatorStatus>>,
    sink: Arc<dyn ReportSink>,
}

impl LocatorTracker {
    pub fn new(sink: Arc<dyn ReportSink>) -> Self {
        Self {
            sessions: DashMap::new(),
            sink,
        }
    }

    /// Register a locator sighting. Upserts: a new selector starts at one
    /// attempt, a known one records another. Empty selectors are ignored.
    pub fn track(&self, session_id: &str, selector: &str, engine: Engine) {
        self.track_at(session_id, selector, engine, Instant::now());
    }

    fn track_at(&self, session_id: &str, selector: &str, engine: Engine, now: Instant) {
        if selector.is_empty() {
            return;
        }
        let session = self.sessions.entry(session_id.to_string()).or_default();
        match session.entry(selector.to_string()) {
            Entry::Occupied(mut occupied) => {
                let status = occupied.get_mut();
                status.attempts += 1;
                status.last_attempt = now;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LocatorStatus::new(engine, now));
            }
        }
    }

    /// Mark a locator as verified (it resolved). Idempotent; never reverts a
    /// terminal state.
    pub fn verify(&self, session_id: &str, selector: &str) {
        if selector.is_empty() {
            return;
        }
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        if let Some(mut status) = session.get_mut(selector) {
            if !status.terminal() {
                tracing::debug!(session = session_id, selector, "locator verified");
                status.verified = true;
            }
        }
    }

    pub fn is_verified(&self, session_id: &str, selector: &str) -> bool {
        self.sessions
            .get(session_id)
            .and_then(|session| session.get(selector).map(|status| status.verified))
            .unwrap_or(false)
    }

    /// Run the reply-side analysis against a decoded browser message.
    ///
    /// Two independent verification checks run first (strict-mode violation,
    /// then direct resolution evidence), plus an observational check for an
    /// explicit `success=false` marker. The pending entry for the reply's
    /// command id is consumed exactly once, after the checks. Malformed or
    /// unrelated replies are ignored.
    pub fn observe_reply(&self, session_id: &str, pending: &PendingSelectors, reply: &Value) {
        self.verify_from_strict_violation(session_id, reply);

        let id = reply.get("id").and_then(Value::as_u64);
        let pending_selector = id.and_then(|id| pending.get(&id).map(|entry| entry.value().clone()));

        if let Some(tree) = result_value_tree(reply) {
            if reply_signals_resolution(&tree) {
                if let Some(selector) = &pending_selector {
                    self.verify(session_id, selector);
                }
            }

            if tree.get("success").and_then(WireValue::as_bool) == Some(false) {
                // Observational only: the terminal transition stays sweep-driven.
                let selector = pending_selector.as_deref().unwrap_or("unknown");
                tracing::warn!(
                    session = session_id,
                    selector,
                    "reply carried success=false for locator probe"
                );
            }
        }

        if let Some(id) = id {
            pending.remove(&id);
        }
    }

    /// A strict-mode violation proves the locator resolved, just to multiple
    /// elements.
    fn verify_from_strict_violation(&self, session_id: &str, reply: &Value) {
        let Some(description) = reply
            .pointer("/result/exceptionDetails/exception/description")
            .and_then(Value::as_str)
        else {
            return;
        };
        if !description.contains("strict mode violation") || !description.contains("resolved to") {
            return;
        }
        if let Some(selector) = quoted_locator(description) {
            self.verify(session_id, &selector);
        }
    }

    /// Run one sweep pass now. Returns the number of reports emitted.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Sweep with an explicit notion of "now".
    ///
    /// A fault while emitting one entry's report is logged and does not abort
    /// the rest of the pass.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut emitted = 0;

        for session in self.sessions.iter() {
            let session_id = session.key();
            let locators = session.value();

            for mut entry in locators.iter_mut() {
                let selector = entry.key().clone();
                let status = entry.value_mut();
                if status.terminal() {
                    continue;
                }

                if SKIP_LIST.contains(&selector.as_str()) {
                    status.verified = true;
                    continue;
                }

                let window = status.last_attempt.duration_since(status.first_seen);
                if window < MIN_EVIDENCE_WINDOW && status.attempts < 2 {
                    continue;
                }

                let enough_evidence = status.attempts >= BROKEN_ATTEMPT_THRESHOLD
                    || window >= BROKEN_DURATION_THRESHOLD;
                let quiet = now.saturating_duration_since(status.last_attempt) > CONFIRMATION_DELAY;
                if !(enough_evidence && quiet) {
                    continue;
                }

                let report = BrokenLocatorReport {
                    session_id: session_id.clone(),
                    selector: selector.clone(),
                    engine: status.engine.clone(),
                    attempts: status.attempts,
                    duration_ms: window.as_millis() as u64,
                    reason: format!(
                        "unverified after {} attempts over {}ms",
                        status.attempts,
                        window.as_millis()
                    ),
                    timestamp_ms: unix_millis(),
                };
                status.reported = true;
                emitted += 1;

                tracing::info!(
                    session = %session_id,
                    selector = %selector,
                    attempts = status.attempts,
                    "broken locator reported"
                );
                if let Err(err) = self.sink.append(&report) {
                    tracing::error!(
                        error = %err,
                        session = %session_id,
                        selector = %selector,
                        "failed to append broken-locator report"
                    );
                }
            }

            locators.retain(|_, status| {
                !(status.terminal()
                    && now.saturating_duration_since(status.last_attempt) > RETENTION_WINDOW)
            });
        }

        self.sessions.retain(|_, locators| !locators.is_empty());
        emitted
    }
}

/// Decoded `result.result.value` wire tree of a reply, when the reply carries
/// an object-typed result.
fn result_value_tree(reply: &Value) -> Option<WireValue> {
    let inner = reply.pointer("/result/result")?;
    if inner.get("type").and_then(Value::as_str) != Some("object") {
        return None;
    }
    let value = inner.get("value").filter(|v| v.is_object())?;
    Some(WireValue::decode(value))
}

/// Does a result payload prove the locator resolved? Any combination of
/// `visible=true && attached=true`, a positive "resolved to N element" count,
/// or a resolution log line counts.
fn reply_signals_resolution(tree: &WireValue) -> bool {
    let Some(entries) = tree.entries() else {
        return false;
    };

    let mut visible = false;
    let mut attached = false;
    let mut resolved_count = 0u32;
    let mut saw_resolution_log = false;

    for (key, value) in entries {
        match key.as_str() {
            "visible" => visible = value.as_bool().unwrap_or(false),
            "attached" => attached = value.as_bool().unwrap_or(false),
            "log" => {
                if let Some(log) = value.as_str() {
                    if let Some(count) = resolved_element_count(log) {
                        resolved_count = count;
                    }
                    saw_resolution_log = saw_resolution_log || log.contains("resolved to");
                }
            }
            _ => {}
        }
    }

    (visible && attached) || resolved_count > 0 || saw_resolution_log
}

/// Parse `N` out of a "resolved to N element(s)" log line.
fn resolved_element_count(log: &str) -> Option<u32> {
    let start = log.find("resolved to ")? + "resolved to ".len();
    let end = log[start..].find(" element")?;
    log[start..start + end].trim().parse().ok()
}

/// Extract the quoted selector from a strict-mode-violation description.
///
/// Pattern: `locator("...") resolved to N elements`.
fn quoted_locator(description: &str) -> Option<String> {
    let start = description.find("locator(\"")? + "locator(\"".len();
    let end = description[start..].find("\")")?;
    Some(description[start..start + end].to_string())
}

/// Spawn the periodic sweep task.
///
/// Ticks every [`SWEEP_INTERVAL`] until the shutdown channel flips to `true`
/// (or its sender is dropped), then exits cleanly.
pub fn spawn_sweeper(
    tracker: Arc<LocatorTracker>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracker.sweep();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("locator sweep task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct MemorySink {
        reports: Mutex<Vec<BrokenLocatorReport>>,
    }

    impl ReportSink for MemorySink {
        fn append(&self, report: &BrokenLocatorReport) -> crate::Result<()> {
            self.reports.lock().push(report.clone());
            Ok(())
        }
    }

    fn tracker() -> (LocatorTracker, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        (LocatorTracker::new(sink.clone()), sink)
    }

    const SESSION: &str = "s000001";

    #[test]
    fn track_upserts_attempts() {
        let (tracker, _) = tracker();
        tracker.track(SESSION, "#foo", Engine::Css);
        tracker.track(SESSION, "#foo", Engine::Css);
        tracker.track(SESSION, "#foo", Engine::Css);

        let session = tracker.sessions.get(SESSION).unwrap();
        let status = session.get("#foo").unwrap();
        assert_eq!(status.attempts, 3);
        assert!(!status.verified);
        assert!(!status.reported);
    }

    #[test]
    fn empty_selector_is_ignored() {
        let (tracker, _) = tracker();
        tracker.track(SESSION, "", Engine::Css);
        tracker.verify(SESSION, "");
        assert!(tracker.sessions.get(SESSION).is_none());
    }

    #[test]
    fn verified_entries_are_never_reported() {
        let (tracker, sink) = tracker();
        let now = Instant::now();
        tracker.track_at(SESSION, "#foo", Engine::Css, now);
        tracker.track_at(SESSION, "#foo", Engine::Css, now);
        tracker.track_at(SESSION, "#foo", Engine::Css, now);
        tracker.verify(SESSION, "#foo");
        tracker.verify(SESSION, "#foo"); // idempotent

        assert_eq!(tracker.sweep_at(now + Duration::from_secs(10)), 0);
        assert!(sink.reports.lock().is_empty());
        assert!(tracker.is_verified(SESSION, "#foo"));
    }

    #[test]
    fn reported_entries_never_become_verified() {
        let (tracker, _) = tracker();
        let now = Instant::now();
        for _ in 0..3 {
            tracker.track_at(SESSION, "#gone", Engine::Css, now);
        }
        assert_eq!(tracker.sweep_at(now + Duration::from_secs(6)), 1);

        tracker.verify(SESSION, "#gone");
        assert!(!tracker.is_verified(SESSION, "#gone"));
    }

    #[test]
    fn skip_list_selectors_are_auto_verified() {
        let (tracker, sink) = tracker();
        let now = Instant::now();
        for selector in [":scope > LEGEND", "body", "html"] {
            for _ in 0..5 {
                tracker.track_at(SESSION, selector, Engine::Css, now);
            }
        }

        assert_eq!(tracker.sweep_at(now + Duration::from_secs(30)), 0);
        assert!(sink.reports.lock().is_empty());
        for selector in [":scope > LEGEND", "body", "html"] {
            assert!(tracker.is_verified(SESSION, selector));
        }
    }

    #[test]
    fn brief_single_sightings_are_not_enough_evidence() {
        let (tracker, sink) = tracker();
        let now = Instant::now();
        tracker.track_at(SESSION, "#blink", Engine::Css, now);

        // Quiet period long past, but window < 100ms and a single attempt.
        assert_eq!(tracker.sweep_at(now + Duration::from_secs(60)), 0);
        assert!(sink.reports.lock().is_empty());
    }

    #[test]
    fn repeated_unverified_attempts_are_reported_once() {
        let (tracker, sink) = tracker();
        let now = Instant::now();
        for _ in 0..3 {
            tracker.track_at(SESSION, "#stale", Engine::Css, now);
        }

        // Still inside the confirmation delay: no decision yet.
        assert_eq!(tracker.sweep_at(now + Duration::from_secs(4)), 0);

        assert_eq!(tracker.sweep_at(now + Duration::from_secs(6)), 1);
        // A second pass never duplicates the report.
        assert_eq!(tracker.sweep_at(now + Duration::from_secs(8)), 0);

        let reports = sink.reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].selector, "#stale");
        assert_eq!(reports[0].attempts, 3);
        assert_eq!(reports[0].reason, "unverified after 3 attempts over 0ms");
    }

    #[test]
    fn slow_resolution_counts_as_evidence_without_retries() {
        let (tracker, sink) = tracker();
        let now = Instant::now();
        tracker.track_at(SESSION, "#slow", Engine::Css, now);
        tracker.track_at(SESSION, "#slow", Engine::Css, now + Duration::from_millis(1500));

        assert_eq!(tracker.sweep_at(now + Duration::from_secs(10)), 1);
        let reports = sink.reports.lock();
        assert_eq!(reports[0].attempts, 2);
        assert_eq!(reports[0].duration_ms, 1500);
    }

    #[test]
    fn terminal_entries_are_evicted_after_retention() {
        let (tracker, _) = tracker();
        let now = Instant::now();
        tracker.track_at(SESSION, "#foo", Engine::Css, now);
        tracker.verify(SESSION, "#foo");

        tracker.sweep_at(now + Duration::from_secs(30));
        assert!(tracker.sessions.get(SESSION).is_some());

        tracker.sweep_at(now + Duration::from_secs(61));
        // Entry evicted, empty session dropped from the registry.
        assert!(tracker.sessions.get(SESSION).is_none());
    }

    #[test]
    fn strict_mode_violation_verifies_the_locator() {
        let (tracker, _) = tracker();
        tracker.track(SESSION, "#btn", Engine::Css);

        let reply = json!({
            "id": 12,
            "result": {
                "exceptionDetails": {
                    "exception": {
                        "description": "Error: strict mode violation: locator(\"#btn\") resolved to 3 elements:\n 1) <button>..."
                    }
                }
            }
        });
        let pending = PendingSelectors::new();
        tracker.observe_reply(SESSION, &pending, &reply);

        assert!(tracker.is_verified(SESSION, "#btn"));
    }

    #[test]
    fn visible_and_attached_verify_the_pending_selector() {
        let (tracker, _) = tracker();
        tracker.track(SESSION, "#foo", Engine::Css);

        let pending = PendingSelectors::new();
        pending.insert(7, "#foo".to_string());

        let reply = json!({
            "id": 7,
            "result": { "result": { "type": "object", "value": { "o": [
                { "k": "visible", "v": true },
                { "k": "attached", "v": true }
            ]}}}
        });
        tracker.observe_reply(SESSION, &pending, &reply);

        assert!(tracker.is_verified(SESSION, "#foo"));
        assert!(pending.is_empty(), "pending entry must be consumed");
    }

    #[test]
    fn resolution_log_line_verifies_the_pending_selector() {
        let (tracker, _) = tracker();
        tracker.track(SESSION, ".row", Engine::Css);

        let pending = PendingSelectors::new();
        pending.insert(9, ".row".to_string());

        let reply = json!({
            "id": 9,
            "result": { "result": { "type": "object", "value": { "o": [
                { "k": "log", "v": "locator resolved to 2 elements" }
            ]}}}
        });
        tracker.observe_reply(SESSION, &pending, &reply);

        assert!(tracker.is_verified(SESSION, ".row"));
    }

    #[test]
    fn success_false_is_observational_only() {
        let (tracker, _) = tracker();
        tracker.track(SESSION, "#nope", Engine::Css);

        let pending = PendingSelectors::new();
        pending.insert(4, "#nope".to_string());

        let reply = json!({
            "id": 4,
            "result": { "result": { "type": "object", "value": { "o": [
                { "k": "success", "v": false }
            ]}}}
        });
        tracker.observe_reply(SESSION, &pending, &reply);

        assert!(!tracker.is_verified(SESSION, "#nope"));
        assert!(pending.is_empty());
        let session = tracker.sessions.get(SESSION).unwrap();
        assert!(!session.get("#nope").unwrap().reported);
    }

    #[test]
    fn replies_without_evidence_still_consume_the_pending_entry() {
        let (tracker, _) = tracker();
        let pending = PendingSelectors::new();
        pending.insert(3, "#foo".to_string());

        tracker.observe_reply(SESSION, &pending, &json!({ "id": 3 }));
        assert!(pending.is_empty());

        // Replies without an id (events) leave the map alone.
        pending.insert(5, "#bar".to_string());
        tracker.observe_reply(SESSION, &pending, &json!({ "method": "Page.loadEventFired" }));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn quoted_locator_parses_the_description() {
        let description = "strict mode violation: locator(\"div.item >> nth=0\") resolved to 5 elements";
        assert_eq!(quoted_locator(description).as_deref(), Some("div.item >> nth=0"));
        assert_eq!(quoted_locator("no locator here"), None);
    }

    #[test]
    fn resolved_element_count_parses_log_lines() {
        assert_eq!(resolved_element_count("waiting... resolved to 12 elements"), Some(12));
        assert_eq!(resolved_element_count("resolved to 1 element"), Some(1));
        assert_eq!(resolved_element_count("resolved to zero"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_on_shutdown() {
        let (tracker, _) = tracker();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_sweeper(Arc::new(tracker), shutdown_rx);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
