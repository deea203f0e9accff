//! Tagged value tree for Playwright's wire argument encoding.
//!
//! Playwright serializes call arguments as a recursive structure where
//! objects are `{"o": [{"k": <key>, "v": <node>}, ...]}` (ordered property
//! lists) and arrays are `{"a": [<node>, ...]}`. Anything else is a scalar
//! leaf. Modeling this explicitly keeps the extraction walk free of
//! dynamic-typing assumptions: every accessor returns an `Option`, and a
//! malformed node simply fails to match instead of erroring.

use serde_json::Value;

/// One node of the wire value tree.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    /// Scalar leaf carrying the raw JSON value.
    Scalar(Value),
    /// Ordered property list (the `"o"` encoding). Duplicate keys are kept.
    Object(Vec<(String, WireValue)>),
    /// Array (the `"a"` encoding).
    Array(Vec<WireValue>),
}

impl WireValue {
    /// Decode a JSON value into the tree.
    ///
    /// Property entries missing a string `k` are dropped; entries missing a
    /// `v` decode to a null leaf. A node that is neither encoding becomes a
    /// scalar leaf.
    pub fn decode(value: &Value) -> WireValue {
        if let Some(obj) = value.as_object() {
            if let Some(props) = obj.get("o").and_then(Value::as_array) {
                let mut entries = Vec::with_capacity(props.len());
                for prop in props {
                    let Some(key) = prop.get("k").and_then(Value::as_str) else {
                        continue;
                    };
                    let node = prop
                        .get("v")
                        .map(WireValue::decode)
                        .unwrap_or(WireValue::Scalar(Value::Null));
                    entries.push((key.to_string(), node));
                }
                return WireValue::Object(entries);
            }
            if let Some(items) = obj.get("a").and_then(Value::as_array) {
                return WireValue::Array(items.iter().map(WireValue::decode).collect());
            }
        }
        WireValue::Scalar(value.clone())
    }

    /// First property with the given key, if this node is a property list.
    pub fn get(&self, key: &str) -> Option<&WireValue> {
        match self {
            WireValue::Object(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Property pairs of an object node.
    pub fn entries(&self) -> Option<&[(String, WireValue)]> {
        match self {
            WireValue::Object(entries) => Some(entries),
            _ => None,
        }
    }

    /// Items of an array node.
    pub fn items(&self) -> Option<&[WireValue]> {
        match self {
            WireValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            WireValue::Scalar(value) => value.as_str(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            WireValue::Scalar(value) => value.as_bool(),
            _ => None,
        }
    }
}
