//! Masking of credentials and personal data in logged request contexts.
//!
//! Every outbound request is logged at debug level with its full context
//! (method, URL, headers, body, query). Tokens, confirmation codes and
//! phone numbers must never land in logs verbatim, so the context passes
//! through `sanitize_json` first. Masking is key-driven: fully secret keys
//! collapse to `***`, identifying-but-useful keys keep two characters on
//! each end as a debugging hint.

use serde_json::Value;

const MASK: &str = "***";

/// Keys whose values are masked completely.
const FULL_MASK_KEYS: &[&str] = &["token", "confirmcode", "code", "password", "authid"];

/// Keys whose values keep their ends visible (phone numbers, device ids).
const PARTIAL_MASK_KEYS: &[&str] = &["phone", "x-device-id", "unique_device_id"];

/// Mask a value while keeping two characters on each end as a hint.
/// Values of four characters or fewer are masked completely.
pub fn mask_partial(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return MASK.to_string();
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}{MASK}{tail}")
}

/// Mask the credential part of an `Authorization` header, keeping the
/// scheme (`Bearer ***`).
pub fn mask_bearer(value: &str) -> String {
    match value.split_once(' ') {
        Some((scheme, _)) => format!("{scheme} {MASK}"),
        None => MASK.to_string(),
    }
}

/// Produce a copy of `value` safe for logging.
pub fn sanitize_json(value: &Value) -> Value {
    sanitize_value("", value)
}

fn sanitize_value(key: &str, value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_value(k, v)))
                .collect(),
        ),
        // List items inherit the key of the field holding the list.
        Value::Array(items) => Value::Array(
            items.iter().map(|item| sanitize_value(key, item)).collect(),
        ),
        other => {
            let lowered = key.to_ascii_lowercase();
            if FULL_MASK_KEYS.contains(&lowered.as_str()) {
                return Value::String(MASK.to_string());
            }
            if PARTIAL_MASK_KEYS.contains(&lowered.as_str()) {
                return match other {
                    Value::String(s) => Value::String(mask_partial(s)),
                    Value::Number(n) => Value::String(mask_partial(&n.to_string())),
                    _ => Value::String(MASK.to_string()),
                };
            }
            if lowered == "authorization" {
                if let Value::String(s) = other {
                    return Value::String(mask_bearer(s));
                }
            }
            other.clone()
        }
    }
}
