//! Token records and the in-memory store holding them.
//!
//! Two independently-expiring credentials exist: the mobile identity token
//! (issued after phone confirmation) and the CRM command token derived from
//! it. Both are pure data here — parsing, expiry predicates and atomic
//! replacement; all I/O lives in [`super::session`].
//!
//! The remote payloads use SCREAMING keys and mix numbers with numeric
//! strings, so parsing walks `serde_json::Value` with the loose extract
//! helpers at the bottom of this module. The original payload is kept in
//! `raw` so hosts can persist and later restore tokens without this crate
//! dictating a storage format.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use std::time::Duration;

use crate::error::{ApiError, AuthError};

/// Wire format of token timestamps (interpreted as UTC).
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Primary identity credential of the mobile API.
#[derive(Debug, Clone)]
pub struct MobileToken {
    pub token: String,
    pub user_id: i64,
    pub profile_id: i64,
    pub access_begin: Option<DateTime<Utc>>,
    pub access_end: Option<DateTime<Utc>>,
    pub phone: Option<String>,
    pub unique_device_id: Option<String>,
    /// Original payload, kept for host-side persistence.
    pub raw: Value,
}

impl MobileToken {
    /// Parse a `get-token` response payload.
    pub fn from_payload(payload: &Value) -> Result<Self, ApiError> {
        Ok(Self {
            token: require_str(payload, "TOKEN")?,
            user_id: require_i64(payload, "USER_ID")?,
            profile_id: require_i64(payload, "PROFILE_ID")?,
            access_begin: parse_timestamp(payload.get("ACCESS_BEGIN")),
            access_end: parse_timestamp(payload.get("ACCESS_END")),
            phone: str_value(payload, "PHONE"),
            unique_device_id: str_value(payload, "UNIQUE_DEVICE_ID"),
            raw: payload.clone(),
        })
    }

    /// A token with no `access_end` never expires; otherwise it counts as
    /// expired once `now` reaches `access_end - margin`.
    pub fn is_expired_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        match self.access_end {
            Some(end) => now >= end - chrono::Duration::seconds(margin.as_secs() as i64),
            None => false,
        }
    }

    pub fn is_expired(&self, margin: Duration) -> bool {
        self.is_expired_at(Utc::now(), margin)
    }
}

/// Secondary credential required specifically for door-open commands.
#[derive(Debug, Clone)]
pub struct CrmToken {
    pub token: String,
    pub user_id: Option<i64>,
    pub access_begin: Option<DateTime<Utc>>,
    pub access_end: Option<DateTime<Utc>>,
    pub raw: Value,
}

impl CrmToken {
    /// Parse a CRM authorization response payload.
    pub fn from_payload(payload: &Value) -> Result<Self, ApiError> {
        Ok(Self {
            token: require_str(payload, "TOKEN")?,
            user_id: int_value(payload, "USER_ID"),
            access_begin: parse_timestamp(payload.get("ACCESS_BEGIN")),
            access_end: parse_timestamp(payload.get("ACCESS_END")),
            raw: payload.clone(),
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        match self.access_end {
            Some(end) => now >= end - chrono::Duration::seconds(margin.as_secs() as i64),
            None => false,
        }
    }

    pub fn is_expired(&self, margin: Duration) -> bool {
        self.is_expired_at(Utc::now(), margin)
    }
}

/// Holds the current pair of credentials. Tokens are only ever replaced
/// wholesale, never mutated in place.
#[derive(Debug, Default)]
pub struct TokenStore {
    mobile: Option<MobileToken>,
    crm: Option<CrmToken>,
}

impl TokenStore {
    pub fn mobile(&self) -> Option<&MobileToken> {
        self.mobile.as_ref()
    }

    pub fn crm(&self) -> Option<&CrmToken> {
        self.crm.as_ref()
    }

    /// The current mobile token, or why it cannot be used.
    pub fn mobile_valid(&self, margin: Duration) -> Result<&MobileToken, AuthError> {
        let token = self.mobile.as_ref().ok_or(AuthError::NoToken)?;
        if token.is_expired(margin) {
            return Err(AuthError::Expired);
        }
        Ok(token)
    }

    /// The CRM token if present and outside its expiry margin.
    pub fn crm_fresh(&self, margin: Duration) -> Option<CrmToken> {
        self.crm.as_ref().filter(|t| !t.is_expired(margin)).cloned()
    }

    pub fn set_mobile(&mut self, token: MobileToken) {
        self.mobile = Some(token);
    }

    pub fn set_crm(&mut self, token: CrmToken) {
        self.crm = Some(token);
    }

    pub fn clear_crm(&mut self) {
        self.crm = None;
    }
}

// ── Loose payload helpers ───────────────────────────────────────────

/// String value, accepting numbers and stringifying them.
pub(crate) fn str_value(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Integer value, accepting numeric strings.
pub(crate) fn int_value(payload: &Value, key: &str) -> Option<i64> {
    match payload.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn require_str(payload: &Value, key: &str) -> Result<String, ApiError> {
    str_value(payload, key)
        .ok_or_else(|| ApiError::Format(format!("field {key} is missing or empty")))
}

pub(crate) fn require_i64(payload: &Value, key: &str) -> Result<i64, ApiError> {
    int_value(payload, key)
        .ok_or_else(|| ApiError::Format(format!("field {key} is missing or not a number")))
}

/// Parse a `%Y-%m-%d %H:%M:%S` timestamp as UTC. Unparseable values are
/// logged and treated as absent.
pub(crate) fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let text = value?.as_str()?;
    if text.is_empty() {
        return None;
    }
    match NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT) {
        Ok(naive) => Some(naive.and_utc()),
        Err(err) => {
            tracing::warn!(value = %text, error = %err, "unparseable token timestamp");
            None
        }
    }
}
