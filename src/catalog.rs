//! Relay discovery: fetch, normalize, dedupe and order the door relays
//! visible to an account.
//!
//! The remote API splits relays into two categories ("own" `isShared=0`
//! and "shared" `isShared=1`) and legitimately returns the same physical
//! relay in both. A refresh therefore fetches both categories, normalizes
//! each raw record, merges on a dedupe key and replaces the cached catalog
//! wholesale. One category failing does not abort the other; only a total
//! failure surfaces an error, leaving the previous cache for callers to
//! fall back on.
//!
//! Record identity (`uid`) is synthesized from scope, MAC and door number
//! so repeated refreshes update entities in place instead of re-creating
//! them.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use crate::auth::session::AuthSession;
use crate::auth::token::{int_value, str_value, MobileToken};
use crate::error::AuthError;

/// CRM parameters needed to open a relay, nested in the raw payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayOpener {
    pub relay_id: Option<i64>,
    pub relay_num: Option<i64>,
    pub mac: Option<String>,
}

/// One normalized door relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRecord {
    /// Stable identity: `{scope}:{mac}:{door_id}`.
    pub uid: String,
    pub address: String,
    /// Canonical uppercase colon-separated MAC.
    pub mac: String,
    pub door_id: u32,
    pub is_main: bool,
    pub has_video: bool,
    pub image_url: Option<String>,
    pub open_link: Option<String>,
    pub entrance_uid: Option<String>,
    pub porch_num: Option<String>,
    pub opener: Option<RelayOpener>,
    /// Original payload, kept for host-side persistence and diagnostics.
    pub raw: Value,
}

type DedupeKey = (String, String, Option<i64>, Option<i64>);

/// Fetches and caches the relay listing for one account scope.
pub struct RelayCatalog {
    session: Arc<AuthSession>,
    scope_id: String,
    records: RwLock<Vec<RelayRecord>>,
}

impl RelayCatalog {
    /// `scope_id` namespaces the synthesized uids (one catalog per account).
    pub fn new(session: Arc<AuthSession>, scope_id: impl Into<String>) -> Self {
        Self {
            session,
            scope_id: scope_id.into(),
            records: RwLock::new(Vec::new()),
        }
    }

    /// Fetch both relay categories, merge and replace the cached catalog.
    ///
    /// Errors only when both categories fail; the cache is left untouched
    /// in that case so callers can keep operating on the previous listing.
    pub async fn refresh(&self) -> Result<Vec<RelayRecord>, AuthError> {
        let mut merged: Vec<RelayRecord> = Vec::new();
        let mut seen: HashSet<DedupeKey> = HashSet::new();
        let mut failures = 0usize;
        let mut last_error: Option<AuthError> = None;

        for (shared, label) in [(false, "own"), (true, "shared")] {
            match self.session.fetch_relays_page(shared).await {
                Ok(items) => {
                    let mut kept = 0usize;
                    for item in &items {
                        let Some(record) = parse_relay(&self.scope_id, item) else {
                            continue;
                        };
                        if !seen.insert(dedupe_key(&record)) {
                            tracing::debug!(
                                category = label,
                                mac = %record.mac,
                                "skipping relay already seen in the other category"
                            );
                            continue;
                        }
                        merged.push(record);
                        kept += 1;
                    }
                    tracing::debug!(category = label, total = items.len(), kept, "relay category fetched");
                }
                Err(err) => {
                    tracing::warn!(category = label, error = %err, "relay category fetch failed");
                    failures += 1;
                    last_error = Some(err);
                }
            }
        }

        if failures == 2 {
            return Err(last_error.unwrap_or(AuthError::NoToken));
        }

        // Main entrance first, then addresses alphabetically; the sort is
        // stable so equal keys keep their fetch order.
        merged.sort_by_key(|record| (!record.is_main, record.address.to_lowercase()));

        tracing::info!(relays = merged.len(), "relay catalog refreshed");
        *self.records.write() = merged.clone();
        Ok(merged)
    }

    /// The current cached listing (last successful refresh).
    pub fn snapshot(&self) -> Vec<RelayRecord> {
        self.records.read().clone()
    }

    /// Look up a cached relay by uid.
    pub fn find(&self, uid: &str) -> Option<RelayRecord> {
        self.records.read().iter().find(|r| r.uid == uid).cloned()
    }
}

/// The CRM rejects any buyer id other than the configured default, so this
/// always returns the default — but logs when the candidates derived from
/// the relay or the token disagree, to surface future API drift.
pub fn coerce_buyer_id(relay: &RelayRecord, token: &MobileToken, default: u32) -> u32 {
    let mut candidates: Vec<(&str, i64)> = Vec::new();
    if let Some(opener) = &relay.opener {
        if let Some(relay_id) = opener.relay_id {
            candidates.push(("relay_id", relay_id));
        }
    }
    if token.profile_id > 0 {
        candidates.push(("profile_id", token.profile_id));
    }
    for (source, candidate) in candidates {
        if candidate != i64::from(default) {
            tracing::warn!(
                source,
                candidate,
                default,
                "buyer id candidate disagrees with the forced default"
            );
        }
    }
    default
}

// ── Normalization ───────────────────────────────────────────────────

/// Parse one raw relay payload; records with no resolvable MAC are
/// discarded.
fn parse_relay(scope_id: &str, raw: &Value) -> Option<RelayRecord> {
    if !raw.is_object() {
        tracing::debug!("skipping non-object relay entry");
        return None;
    }

    let opener = raw.get("OPENER").and_then(parse_opener);

    // MAC: top-level field first, opener fallback; first non-empty wins.
    let mac_raw = str_value(raw, "MAC_ADDR")
        .or_else(|| str_value(raw, "mac"))
        .or_else(|| opener.as_ref().and_then(|o| o.mac.clone()));
    let Some(mac) = mac_raw.as_deref().and_then(canonicalize_mac) else {
        tracing::debug!(address = %str_value(raw, "ADDRESS").unwrap_or_default(),
            "discarding relay without a resolvable MAC");
        return None;
    };

    let porch_num = str_value(raw, "PORCH_NUM");
    let door_id = opener
        .as_ref()
        .and_then(|o| o.relay_num)
        .or_else(|| porch_num.as_deref().and_then(|p| p.trim().parse().ok()))
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(1);

    let uid = format!(
        "{scope_id}:{}:{door_id}",
        mac.replace(':', "").to_lowercase()
    );

    Some(RelayRecord {
        uid,
        address: str_value(raw, "ADDRESS").unwrap_or_default(),
        mac,
        door_id,
        is_main: as_bool_loose(raw.get("IS_MAIN")),
        has_video: as_bool_loose(raw.get("HAS_VIDEO")),
        image_url: str_value(raw, "IMAGE_URL"),
        open_link: raw.get("LINKS").and_then(|links| str_value(links, "open")),
        entrance_uid: str_value(raw, "ENTRANCE_UID"),
        porch_num,
        opener,
        raw: raw.clone(),
    })
}

fn parse_opener(raw: &Value) -> Option<RelayOpener> {
    if !raw.is_object() {
        return None;
    }
    Some(RelayOpener {
        relay_id: int_value(raw, "relay_id").or_else(|| int_value(raw, "relayId")),
        relay_num: int_value(raw, "relay_num").or_else(|| int_value(raw, "relayNum")),
        mac: str_value(raw, "mac"),
    })
}

/// Canonicalize a MAC into uppercase colon-separated pairs. Anything that
/// does not contain exactly twelve hex digits (with optional `:`/`-`/`.`
/// separators) is unusable.
fn canonicalize_mac(raw: &str) -> Option<String> {
    if raw.is_empty()
        || !raw
            .chars()
            .all(|c| c.is_ascii_hexdigit() || matches!(c, ':' | '-' | '.'))
    {
        return None;
    }
    let hex: String = raw
        .chars()
        .filter(char::is_ascii_hexdigit)
        .collect::<String>()
        .to_ascii_uppercase();
    if hex.len() != 12 {
        return None;
    }
    let bytes = hex.as_bytes();
    let mut out = String::with_capacity(17);
    for (i, pair) in bytes.chunks(2).enumerate() {
        if i > 0 {
            out.push(':');
        }
        out.push(pair[0] as char);
        out.push(pair[1] as char);
    }
    Some(out)
}

/// The API mixes booleans, numbers and `"1"`/`"true"` strings.
fn as_bool_loose(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => s == "1" || s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("yes"),
        _ => false,
    }
}

fn dedupe_key(record: &RelayRecord) -> DedupeKey {
    (
        record
            .entrance_uid
            .as_deref()
            .unwrap_or_default()
            .to_lowercase(),
        record.mac.to_uppercase(),
        record.opener.as_ref().and_then(|o| o.relay_id),
        record.opener.as_ref().and_then(|o| o.relay_num),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn raw_relay(address: &str, mac: &str, is_main: &str) -> Value {
        json!({
            "ADDRESS": address,
            "MAC_ADDR": mac,
            "IS_MAIN": is_main,
            "HAS_VIDEO": "1",
            "ENTRANCE_UID": "entrance-1",
            "PORCH_NUM": "2",
            "IMAGE_URL": "https://cdn.example/frame.jpg",
            "LINKS": {"open": "/api/open/custom"},
            "OPENER": {"relay_id": 10, "relay_num": 1, "mac": mac},
        })
    }

    #[test]
    fn parse_resolves_mac_and_door_id() {
        let record = parse_relay("scope", &raw_relay("Lenina 1", "08:13:cd:00:0d:7f", "1")).unwrap();
        assert_eq!(record.mac, "08:13:CD:00:0D:7F");
        assert_eq!(record.door_id, 1); // opener relay_num wins over porch
        assert!(record.is_main);
        assert!(record.has_video);
        assert_eq!(record.open_link.as_deref(), Some("/api/open/custom"));
        assert_eq!(record.uid, "scope:0813cd000d7f:1");
    }

    #[test]
    fn parse_falls_back_to_opener_mac() {
        let mut raw = raw_relay("Lenina 1", "", "0");
        raw["MAC_ADDR"] = Value::Null;
        let record = parse_relay("scope", &raw).unwrap();
        assert_eq!(record.mac, "08:13:CD:00:0D:7F");
    }

    #[test]
    fn parse_discards_record_without_mac() {
        let raw = json!({"ADDRESS": "Nowhere 1", "OPENER": {"relay_num": 1}});
        assert!(parse_relay("scope", &raw).is_none());
    }

    #[test]
    fn door_id_falls_back_to_porch_then_one() {
        let mut raw = raw_relay("Lenina 1", "0813CD000D7F", "0");
        raw["OPENER"] = json!({"relay_id": 10, "mac": "0813CD000D7F"});
        let record = parse_relay("scope", &raw).unwrap();
        assert_eq!(record.door_id, 2); // PORCH_NUM

        raw["PORCH_NUM"] = json!("porch");
        let record = parse_relay("scope", &raw).unwrap();
        assert_eq!(record.door_id, 1); // final fallback
    }

    #[test]
    fn mac_canonicalization_accepts_separator_variants() {
        assert_eq!(
            canonicalize_mac("08-13-cd-00-0d-7f").as_deref(),
            Some("08:13:CD:00:0D:7F")
        );
        assert_eq!(
            canonicalize_mac("0813cd000d7f").as_deref(),
            Some("08:13:CD:00:0D:7F")
        );
        assert!(canonicalize_mac("0813cd000d").is_none()); // too short
        assert!(canonicalize_mac("not a mac").is_none());
        assert!(canonicalize_mac("").is_none());
    }

    #[test]
    fn loose_bool_accepts_api_variants() {
        assert!(as_bool_loose(Some(&json!(true))));
        assert!(as_bool_loose(Some(&json!(1))));
        assert!(as_bool_loose(Some(&json!("1"))));
        assert!(as_bool_loose(Some(&json!("true"))));
        assert!(as_bool_loose(Some(&json!("yes"))));
        assert!(!as_bool_loose(Some(&json!("0"))));
        assert!(!as_bool_loose(Some(&json!(0))));
        assert!(!as_bool_loose(None));
    }

    #[test]
    fn buyer_id_always_coerces_to_default() {
        let record = parse_relay("scope", &raw_relay("Lenina 1", "0813CD000D7F", "1")).unwrap();
        let token = MobileToken::from_payload(&json!({
            "TOKEN": "t", "USER_ID": 42, "PROFILE_ID": 7,
        }))
        .unwrap();
        assert_eq!(coerce_buyer_id(&record, &token, 1), 1);
    }

    // ── Refresh behavior against a mock server ──────────────────────

    async fn catalog_with_session(server: &MockServer) -> RelayCatalog {
        let config = ClientConfig::default().with_base_urls(server.uri(), server.uri());
        let session = Arc::new(AuthSession::new(config).unwrap());
        session
            .restore_mobile_token(&json!({
                "TOKEN": "mob-token",
                "USER_ID": 42,
                "PROFILE_ID": 7,
                "ACCESS_END": "2099-01-01 00:00:00",
            }))
            .unwrap();
        RelayCatalog::new(session, "scope")
    }

    fn relays_mock(is_shared: &str, body: Value) -> Mock {
        Mock::given(method("GET"))
            .and(path("/domofon/relays"))
            .and(query_param("isShared", is_shared))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
    }

    #[tokio::test]
    async fn refresh_dedupes_across_categories() {
        let server = MockServer::start().await;
        relays_mock("0", json!([raw_relay("Lenina 1", "0813CD000D7F", "1")]))
            .mount(&server)
            .await;
        // The shared category returns the same physical relay plus one more.
        relays_mock(
            "1",
            json!([
                raw_relay("Lenina 1", "0813CD000D7F", "1"),
                {
                    "ADDRESS": "Kirova 5",
                    "MAC_ADDR": "AA:BB:CC:00:11:22",
                    "IS_MAIN": "0",
                    "ENTRANCE_UID": "entrance-2",
                    "OPENER": {"relay_id": 11, "relay_num": 2},
                },
            ]),
        )
        .mount(&server)
        .await;

        let catalog = catalog_with_session(&server).await;
        let records = catalog.refresh().await.unwrap();
        assert_eq!(records.len(), 2);
        // Main entrance first regardless of address order.
        assert_eq!(records[0].address, "Lenina 1");
        assert_eq!(records[1].address, "Kirova 5");
        assert_eq!(records[1].door_id, 2);
    }

    #[tokio::test]
    async fn refresh_orders_main_first_then_address() {
        let server = MockServer::start().await;
        relays_mock(
            "0",
            json!([
                {"ADDRESS": "Zarechnaya 9", "MAC_ADDR": "AA:00:00:00:00:01", "IS_MAIN": "0", "ENTRANCE_UID": "e1"},
                {"ADDRESS": "Berezovaya 3", "MAC_ADDR": "AA:00:00:00:00:02", "IS_MAIN": "0", "ENTRANCE_UID": "e2"},
                {"ADDRESS": "Mira 40", "MAC_ADDR": "AA:00:00:00:00:03", "IS_MAIN": "1", "ENTRANCE_UID": "e3"},
            ]),
        )
        .mount(&server)
        .await;
        relays_mock("1", json!([])).mount(&server).await;

        let catalog = catalog_with_session(&server).await;
        let records = catalog.refresh().await.unwrap();
        let addresses: Vec<&str> = records.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(addresses, ["Mira 40", "Berezovaya 3", "Zarechnaya 9"]);
    }

    #[tokio::test]
    async fn one_failed_category_still_yields_partial_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/domofon/relays"))
            .and(query_param("isShared", "0"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;
        relays_mock("1", json!([raw_relay("Kirova 5", "AABBCC001122", "0")]))
            .mount(&server)
            .await;

        let catalog = catalog_with_session(&server).await;
        let records = catalog.refresh().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].address, "Kirova 5");
    }

    #[tokio::test]
    async fn total_failure_keeps_previous_cache() {
        let server = MockServer::start().await;
        let catalog = catalog_with_session(&server).await;

        // Seed the cache with a successful refresh.
        relays_mock("0", json!([raw_relay("Lenina 1", "0813CD000D7F", "1")]))
            .mount(&server)
            .await;
        relays_mock("1", json!([])).mount(&server).await;
        catalog.refresh().await.unwrap();

        // Now both categories fail.
        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/domofon/relays"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        assert!(catalog.refresh().await.is_err());
        // Previous listing still available for fallback.
        let cached = catalog.snapshot();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].address, "Lenina 1");
        assert!(catalog.find(&cached[0].uid).is_some());
    }

    #[tokio::test]
    async fn uid_is_stable_across_refreshes() {
        let server = MockServer::start().await;
        relays_mock("0", json!([raw_relay("Lenina 1", "0813CD000D7F", "1")]))
            .mount(&server)
            .await;
        relays_mock("1", json!([])).mount(&server).await;

        let catalog = catalog_with_session(&server).await;
        let first = catalog.refresh().await.unwrap();
        let second = catalog.refresh().await.unwrap();
        assert_eq!(first[0].uid, second[0].uid);
    }
}
