//! Recovers locator expressions from decoded CDP commands.
//!
//! Playwright probes the DOM through several equivalent wire encodings:
//! direct `DOM.querySelector` calls, utility-script invocations of
//! `Runtime.callFunctionOn` carrying a deeply nested selector payload, and
//! ad-hoc `Runtime.evaluate` expressions. The extractor normalizes all of
//! them to a `(selector, engine)` pair. Absence of a match is the normal
//! outcome for most traffic; nothing in here ever fails.

use std::fmt;
use std::sync::LazyLock;

use regex_lite::Regex;
use serde_json::Value;

use crate::wire::WireValue;

/// Marker identifying Playwright's utility-script calling convention inside a
/// `Runtime.callFunctionOn` function declaration.
const UTILITY_SCRIPT_MARKER: &str = "utilityScript.evaluate";

/// Positional arguments searched for a selector payload.
const ARGUMENT_RANGE: std::ops::Range<usize> = 5..8;

/// Best-effort scans over raw `Runtime.evaluate` expressions.
static QUERY_SELECTOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"querySelector\(['"]([^'"]+)['"]\)"#).unwrap());
static XPATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"xpath=(.+?)(?:"|\}|\s|$)"#).unwrap());

/// Locator dialect reported alongside a selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Engine {
    Css,
    Xpath,
    /// Another named matching engine (e.g. TEXT, ROLE), uppercased.
    Named(String),
    Unknown,
}

impl Engine {
    /// Map a wire engine name onto a dialect.
    pub fn from_name(name: &str) -> Engine {
        match name.to_ascii_lowercase().as_str() {
            "css" => Engine::Css,
            "xpath" => Engine::Xpath,
            _ => Engine::Named(name.to_ascii_uppercase()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Engine::Css => "CSS",
            Engine::Xpath => "XPATH",
            Engine::Named(name) => name,
            Engine::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for Engine {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A locator expression recovered from a command.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorInfo {
    pub selector: String,
    pub engine: Engine,
}

impl SelectorInfo {
    fn new(selector: &str, engine: Engine) -> Self {
        Self {
            selector: selector.to_string(),
            engine,
        }
    }
}

/// Recover a locator expression from a decoded client command.
pub fn extract_selector(command: &Value) -> Option<SelectorInfo> {
    let method = command.get("method")?.as_str()?;
    let params = command.get("params")?;

    match method {
        "DOM.querySelector" | "DOM.querySelectorAll" => {
            let selector = params.get("selector")?.as_str()?;
            Some(SelectorInfo::new(selector, Engine::Css))
        }
        "Runtime.callFunctionOn" => from_function_call(params),
        "Runtime.evaluate" => from_expression(params.get("expression")?.as_str()?),
        _ => None,
    }
}

/// Walk a utility-script invocation's positional arguments for a selector
/// payload.
fn from_function_call(params: &Value) -> Option<SelectorInfo> {
    let declaration = params.get("functionDeclaration")?.as_str()?;
    if !declaration.contains(UTILITY_SCRIPT_MARKER) {
        return None;
    }

    let arguments = params.get("arguments")?.as_array()?;
    if arguments.len() < 7 {
        return None;
    }

    for argument in arguments
        .iter()
        .take(ARGUMENT_RANGE.end)
        .skip(ARGUMENT_RANGE.start)
    {
        let Some(value) = argument.get("value").filter(|v| v.is_object()) else {
            continue;
        };
        if let Some(info) = from_argument(&WireValue::decode(value)) {
            return Some(info);
        }
    }
    None
}

/// Top level of an argument payload: a direct `source`/`css` property
/// short-circuits, otherwise descend through `info`.
fn from_argument(node: &WireValue) -> Option<SelectorInfo> {
    for (key, value) in node.entries()? {
        match key.as_str() {
            "css" | "source" => {
                if let Some(selector) = value.as_str() {
                    let engine = if key == "css" { Engine::Css } else { Engine::Unknown };
                    return Some(SelectorInfo::new(selector, engine));
                }
            }
            "info" => {
                if let Some(info) = from_info(value) {
                    return Some(info);
                }
            }
            _ => {}
        }
    }
    None
}

/// The `info` object carries `source`, an optional `engine` name, and a
/// `parsed` breakdown that takes precedence when it yields a selector.
fn from_info(info: &WireValue) -> Option<SelectorInfo> {
    let entries = info.entries()?;

    let mut selector = None;
    let mut engine = Engine::Unknown;
    for (key, value) in entries {
        match key.as_str() {
            "source" => {
                if let Some(text) = value.as_str() {
                    selector.get_or_insert_with(|| text.to_string());
                }
            }
            "engine" => {
                if let Some(name) = value.as_str() {
                    engine = Engine::from_name(name);
                }
            }
            "parsed" => {
                if let Some(parsed) = from_parsed(value) {
                    return Some(parsed);
                }
            }
            _ => {}
        }
    }

    selector.map(|selector| SelectorInfo { selector, engine })
}

/// `parsed.parts` is an array of selector fragments; the first one carrying a
/// `source` wins, with `name` naming its engine.
fn from_parsed(parsed: &WireValue) -> Option<SelectorInfo> {
    let parts = parsed.get("parts")?.items()?;
    for part in parts {
        let Some(entries) = part.entries() else {
            continue;
        };
        let mut selector = None;
        let mut engine = Engine::Unknown;
        for (key, value) in entries {
            match key.as_str() {
                "source" => {
                    if let Some(text) = value.as_str() {
                        selector.get_or_insert_with(|| text.to_string());
                    }
                }
                "name" => {
                    if let Some(name) = value.as_str() {
                        engine = Engine::from_name(name);
                    }
                }
                _ => {}
            }
        }
        if let Some(selector) = selector {
            return Some(SelectorInfo { selector, engine });
        }
    }
    None
}

/// Regex fallback over raw expression text. Heuristic by design; the first
/// pattern that matches wins.
fn from_expression(expression: &str) -> Option<SelectorInfo> {
    if let Some(caps) = QUERY_SELECTOR_RE.captures(expression) {
        return Some(SelectorInfo::new(&caps[1], Engine::Css));
    }
    if let Some(caps) = XPATH_RE.captures(expression) {
        return Some(SelectorInfo::new(&caps[1], Engine::Xpath));
    }
    None
}
