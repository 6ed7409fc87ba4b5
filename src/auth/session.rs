//! Authenticated session against the mobile API and the CRM.
//!
//! One `AuthSession` owns the HTTP client and the [`TokenStore`] for a
//! single account. It is passed around by `Arc` — there is no ambient
//! registry of sessions.
//!
//! Credential lifecycle:
//! - The **mobile token** is issued by the phone-confirmation flow
//!   (`request_confirmation` → `check_confirmation` → `obtain_mobile_token`)
//!   and cannot be refreshed without user interaction; `ensure_mobile_token`
//!   is purely a guard.
//! - The **CRM token** is derived from the mobile token on demand.
//!   `ensure_crm_token` reauthorizes transparently when the cached token is
//!   absent or inside its expiry margin; concurrent callers share a single
//!   in-flight refresh.
//!
//! CRM authorization sends the mobile token both in the payload and as a
//! bearer header — the remote checks both surfaces independently.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::ClientConfig;
use crate::error::{ApiError, AuthError};
use crate::masking;

use super::token::{int_value, str_value, CrmToken, MobileToken, TokenStore};

const SEND_PHONE_ENDPOINT: &str = "/mobile/auth/get-confirm";
const CHECK_CONFIRM_ENDPOINT: &str = "/mobile/auth/check-confirm";
const GET_TOKEN_ENDPOINT: &str = "/mobile/auth/get-token";
const USER_INFO_ENDPOINT: &str = "/mobile/user/info";
const BALANCE_ENDPOINT: &str = "/mobile/user/balance";
const RELAYS_ENDPOINT: &str = "/domofon/relays";
const CRM_AUTH_ENDPOINT: &str = "/api/auth-lk";

/// Instructions returned by the confirmation request (how the user will
/// receive the code, operator message, timeout hints).
#[derive(Debug, Clone)]
pub struct ConfirmContext {
    pub auth_id: Option<String>,
    pub message: Option<String>,
    pub confirm_type: Option<i64>,
    pub timeout_mins: Option<i64>,
    pub timeout_default: Option<i64>,
}

/// One contract address offered after code confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmAddress {
    pub user_id: String,
    pub address: String,
}

/// Result of submitting the confirmation code.
#[derive(Debug, Clone)]
pub struct CheckConfirmResult {
    pub auth_id: Option<String>,
    pub addresses: Vec<ConfirmAddress>,
    pub message: Option<String>,
}

/// Combined profile/balance view for host-side status entities.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub user: Value,
    pub balance: Value,
    pub mobile_token: Option<Value>,
    pub crm_token: Option<Value>,
}

/// Dual-credential session for one account.
pub struct AuthSession {
    http: reqwest::Client,
    config: ClientConfig,
    api_base: String,
    crm_base: String,
    tokens: Mutex<TokenStore>,
    /// Single-flight guard: concurrent callers needing a CRM refresh share
    /// one authorization round-trip instead of racing to reauthorize twice.
    crm_refresh: tokio::sync::Mutex<()>,
}

impl AuthSession {
    pub fn new(config: ClientConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let api_base = config.api_base_url.trim_end_matches('/').to_string();
        let crm_base = config.crm_base_url.trim_end_matches('/').to_string();
        tracing::debug!(
            api_base = %api_base,
            crm_base = %crm_base,
            device_id = %masking::mask_partial(&config.device_id),
            "created intercom session"
        );
        Ok(Self {
            http,
            config,
            api_base,
            crm_base,
            tokens: Mutex::new(TokenStore::default()),
            crm_refresh: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn crm_base_url(&self) -> &str {
        &self.crm_base
    }

    fn margin(&self) -> std::time::Duration {
        self.config.token_expiry_margin
    }

    // ── Phone-confirmation login ────────────────────────────────────

    /// Submit the phone number and receive confirmation instructions.
    pub async fn request_confirmation(&self, phone: &str) -> Result<ConfirmContext, AuthError> {
        let payload = json!({
            "deviceId": self.config.device_id,
            "phone": phone,
            "checkSkipAuth": 1,
        });
        tracing::info!(phone = %masking::mask_partial(phone), "requesting login confirmation");
        let response = self.post_mobile(SEND_PHONE_ENDPOINT, &payload, None).await?;
        Ok(ConfirmContext {
            auth_id: str_value(&response, "authId"),
            message: str_value(&response, "message"),
            confirm_type: int_value(&response, "confirmType"),
            timeout_mins: int_value(&response, "timeoutMins"),
            timeout_default: int_value(&response, "timeoutMinsDefault"),
        })
    }

    /// Submit the confirmation code; on success the response lists the
    /// contract addresses available to this phone number.
    pub async fn check_confirmation(
        &self,
        phone: &str,
        confirm_code: &str,
    ) -> Result<CheckConfirmResult, AuthError> {
        let payload = json!({"phone": phone, "confirmCode": confirm_code});
        tracing::info!(phone = %masking::mask_partial(phone), "submitting confirmation code");
        let response = self
            .post_mobile(CHECK_CONFIRM_ENDPOINT, &payload, None)
            .await?;

        let addresses = response
            .get("addresses")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        Some(ConfirmAddress {
                            user_id: str_value(item, "USER_ID")?,
                            address: str_value(item, "ADDRESS")?,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(CheckConfirmResult {
            auth_id: str_value(&response, "authId"),
            addresses,
            message: str_value(&response, "message"),
        })
    }

    /// Exchange the confirmed auth id and chosen contract for a mobile
    /// token, installing it as the session identity.
    pub async fn obtain_mobile_token(
        &self,
        auth_id: &str,
        user_id: &str,
    ) -> Result<MobileToken, AuthError> {
        let payload = json!({"authId": auth_id, "userId": user_id});
        let response = self.post_mobile(GET_TOKEN_ENDPOINT, &payload, None).await?;
        let token = MobileToken::from_payload(&response).map_err(AuthError::Api)?;
        tracing::info!(
            user_id = token.user_id,
            profile_id = token.profile_id,
            "mobile token issued"
        );
        self.tokens.lock().set_mobile(token.clone());
        Ok(token)
    }

    // ── Token guards and CRM (re)authorization ──────────────────────

    /// Guard: the current mobile token, or why it cannot be used. Never
    /// refreshes — a new mobile token requires interactive login.
    pub fn ensure_mobile_token(&self) -> Result<MobileToken, AuthError> {
        self.tokens.lock().mobile_valid(self.margin()).cloned()
    }

    /// A valid CRM token, reauthorizing transparently when the cached one
    /// is absent or inside its expiry margin.
    pub async fn ensure_crm_token(&self) -> Result<CrmToken, AuthError> {
        if let Some(token) = self.tokens.lock().crm_fresh(self.margin()) {
            return Ok(token);
        }
        let _refresh = self.crm_refresh.lock().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some(token) = self.tokens.lock().crm_fresh(self.margin()) {
            return Ok(token);
        }
        tracing::debug!("CRM token absent or expiring, reauthorizing");
        self.authenticate_crm(None).await
    }

    /// Drop the cached CRM token and reauthorize. Used by the command
    /// dispatcher when the CRM rejects a token it just vouched for.
    pub async fn force_crm_reauth(&self) -> Result<CrmToken, AuthError> {
        let _refresh = self.crm_refresh.lock().await;
        self.tokens.lock().clear_crm();
        self.authenticate_crm(None).await
    }

    /// Authorize against the CRM with the current mobile token. The mobile
    /// token travels both in the payload and as the bearer header.
    pub async fn authenticate_crm(&self, buyer_id: Option<u32>) -> Result<CrmToken, AuthError> {
        let mobile = self.ensure_mobile_token()?;
        let buyer = buyer_id.unwrap_or(self.config.buyer_id);
        let payload = json!({"token": mobile.token, "buyerId": buyer});
        tracing::info!(buyer_id = buyer, "authorizing against CRM");

        let response = self
            .post_crm(CRM_AUTH_ENDPOINT, &payload, &mobile.token)
            .await
            .map_err(|err| match err {
                ApiError::Status { status, body } => AuthError::Rejected { status, body },
                other => AuthError::Api(other),
            })?;

        let token = CrmToken::from_payload(&response).map_err(AuthError::Api)?;
        tracing::info!(user_id = ?token.user_id, "CRM token issued");
        self.tokens.lock().set_crm(token.clone());
        Ok(token)
    }

    // ── Token restore and accessors ─────────────────────────────────

    /// Install a mobile token from a payload the host persisted earlier.
    pub fn restore_mobile_token(&self, payload: &Value) -> Result<MobileToken, AuthError> {
        let token = MobileToken::from_payload(payload).map_err(AuthError::Api)?;
        tracing::debug!(user_id = token.user_id, "mobile token restored");
        self.tokens.lock().set_mobile(token.clone());
        Ok(token)
    }

    /// Install a CRM token from a payload the host persisted earlier.
    pub fn restore_crm_token(&self, payload: &Value) -> Result<CrmToken, AuthError> {
        let token = CrmToken::from_payload(payload).map_err(AuthError::Api)?;
        tracing::debug!("CRM token restored");
        self.tokens.lock().set_crm(token.clone());
        Ok(token)
    }

    pub fn mobile_token(&self) -> Option<MobileToken> {
        self.tokens.lock().mobile().cloned()
    }

    pub fn crm_token(&self) -> Option<CrmToken> {
        self.tokens.lock().crm().cloned()
    }

    // ── Account data ────────────────────────────────────────────────

    /// Profile data for the authenticated user.
    pub async fn user_info(&self) -> Result<Value, AuthError> {
        let mobile = self.ensure_mobile_token()?;
        Ok(self
            .get_mobile(USER_INFO_ENDPOINT, "v3", &[], &mobile, false)
            .await?)
    }

    /// Contract balance for the authenticated user.
    pub async fn balance(&self) -> Result<Value, AuthError> {
        let mobile = self.ensure_mobile_token()?;
        Ok(self
            .get_mobile(BALANCE_ENDPOINT, "v2", &[], &mobile, true)
            .await?)
    }

    /// Profile and balance fetched concurrently, plus the raw token
    /// payloads, for coordinating host entities.
    pub async fn account_snapshot(&self) -> Result<AccountSnapshot, AuthError> {
        let (user, balance) = tokio::try_join!(self.user_info(), self.balance())?;
        let tokens = self.tokens.lock();
        Ok(AccountSnapshot {
            user,
            balance,
            mobile_token: tokens.mobile().map(|t| t.raw.clone()),
            crm_token: tokens.crm().map(|t| t.raw.clone()),
        })
    }

    // ── Relay listing ───────────────────────────────────────────────

    /// Fetch one category page of the relay listing (`isShared` 0 or 1).
    /// A non-array response is a format error for this category only.
    pub async fn fetch_relays_page(&self, shared: bool) -> Result<Vec<Value>, AuthError> {
        let mobile = self.ensure_mobile_token()?;
        let query = [
            ("pagination", "1".to_string()),
            ("pageSize", "30".to_string()),
            ("mainFirst", "1".to_string()),
            ("isShared", if shared { "1" } else { "0" }.to_string()),
        ];
        let response = self
            .get_mobile(RELAYS_ENDPOINT, "v2", &query, &mobile, true)
            .await?;
        match response {
            Value::Array(items) => Ok(items),
            other => Err(AuthError::Api(ApiError::Format(format!(
                "relay list is not an array: {other}"
            )))),
        }
    }

    // ── HTTP plumbing ───────────────────────────────────────────────

    fn mobile_headers(&self, accept_version: &str) -> Vec<(&'static str, String)> {
        let cfg = &self.config;
        let mut headers = vec![
            (
                "Accept",
                format!("application/json; version={accept_version}"),
            ),
            ("App-Version", cfg.app_version.clone()),
            ("X-App-Version", cfg.app_version.clone()),
            ("X-Api-Source", cfg.api_source.clone()),
            ("X-Source", cfg.api_source.clone()),
            ("Platform", cfg.platform.clone()),
            ("User-Agent", cfg.user_agent.clone()),
            ("X-Device-Id", cfg.device_id.clone()),
            ("Accept-Language", cfg.accept_language.clone()),
            ("Content-Type", "application/json".to_string()),
        ];
        if let Some(user_id) = self.tokens.lock().mobile().map(|t| t.user_id) {
            headers.push(("X-Api-User-Id", user_id.to_string()));
        }
        headers
    }

    fn crm_headers(&self) -> Vec<(&'static str, String)> {
        let cfg = &self.config;
        let profile_id = self
            .tokens
            .lock()
            .mobile()
            .map(|t| t.profile_id.to_string())
            .unwrap_or_default();
        vec![
            ("Accept", "application/json".to_string()),
            ("App-Version", cfg.app_version.clone()),
            ("X-App-Version", cfg.app_version.clone()),
            ("X-Api-Source", cfg.api_source.clone()),
            ("X-Source", cfg.api_source.clone()),
            ("Platform", cfg.platform.clone()),
            ("X-api-profile-id", profile_id),
            ("User-Agent", cfg.user_agent.clone()),
            ("X-Device-Id", cfg.device_id.clone()),
            ("Accept-Language", cfg.accept_language.clone()),
            ("Content-Type", "application/json".to_string()),
        ]
    }

    async fn post_mobile(
        &self,
        endpoint: &str,
        payload: &Value,
        bearer: Option<&str>,
    ) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.api_base, endpoint);
        let mut headers = self.mobile_headers("v2");
        if let Some(token) = bearer {
            headers.push(("Authorization", format!("Bearer {token}")));
        }
        let context = request_context("POST", &url, &headers, Some(payload), &[]);
        let mut request = self.http.post(&url).json(payload);
        for (name, value) in &headers {
            request = request.header(*name, value.as_str());
        }
        self.send_request(request, context).await
    }

    async fn get_mobile(
        &self,
        endpoint: &str,
        accept_version: &str,
        query: &[(&str, String)],
        mobile: &MobileToken,
        include_profile: bool,
    ) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.api_base, endpoint);
        let mut headers = self.mobile_headers(accept_version);
        headers.push(("Authorization", format!("Bearer {}", mobile.token)));
        if include_profile {
            headers.push(("X-api-profile-id", mobile.profile_id.to_string()));
        }
        let context = request_context("GET", &url, &headers, None, query);
        let mut request = self.http.get(&url).query(query);
        for (name, value) in &headers {
            request = request.header(*name, value.as_str());
        }
        self.send_request(request, context).await
    }

    async fn post_crm(
        &self,
        endpoint: &str,
        payload: &Value,
        mobile_bearer: &str,
    ) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.crm_base, endpoint);
        let mut headers = self.crm_headers();
        headers.push(("Authorization", format!("Bearer {mobile_bearer}")));
        let context = request_context("POST", &url, &headers, Some(payload), &[]);
        let mut request = self.http.post(&url).json(payload);
        for (name, value) in &headers {
            request = request.header(*name, value.as_str());
        }
        self.send_request(request, context).await
    }

    /// Bare CRM GET used by the command dispatcher (door-open endpoints
    /// return an empty 204 body on success).
    pub(crate) async fn execute_crm_get(
        &self,
        url: &str,
        crm_bearer: &str,
    ) -> Result<(), ApiError> {
        let mut headers = self.crm_headers();
        headers.push(("Authorization", format!("Bearer {crm_bearer}")));
        let context = request_context("GET", url, &headers, None, &[]);
        let mut request = self.http.get(url);
        for (name, value) in &headers {
            request = request.header(*name, value.as_str());
        }
        self.send_request(request, context).await?;
        Ok(())
    }

    async fn send_request(
        &self,
        request: reqwest::RequestBuilder,
        context: Value,
    ) -> Result<Value, ApiError> {
        tracing::debug!(request = %masking::sanitize_json(&context), "dispatching API request");
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            tracing::error!(
                status = status.as_u16(),
                body = %text,
                request = %masking::sanitize_json(&context),
                "API request failed"
            );
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&text)
            .map_err(|err| ApiError::Format(format!("response body is not valid JSON: {err}")))
    }
}

fn request_context(
    method: &str,
    url: &str,
    headers: &[(&'static str, String)],
    body: Option<&Value>,
    query: &[(&str, String)],
) -> Value {
    let headers: serde_json::Map<String, Value> = headers
        .iter()
        .map(|(name, value)| ((*name).to_string(), Value::String(value.clone())))
        .collect();
    let params: serde_json::Map<String, Value> = query
        .iter()
        .map(|(name, value)| ((*name).to_string(), Value::String(value.clone())))
        .collect();
    json!({
        "method": method,
        "url": url,
        "headers": headers,
        "json": body.cloned().unwrap_or(Value::Null),
        "params": params,
    })
}
