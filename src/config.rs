//! Client configuration and synthetic device identity.
//!
//! The remote APIs fingerprint the official mobile app through a fixed set
//! of headers (device id, app version, platform, locale). Those values are
//! static configuration, not protocol logic; everything here has a working
//! default so `ClientConfig::default()` produces a usable client.

use std::time::Duration;

/// Base URL of the mobile API.
pub const DEFAULT_API_BASE_URL: &str = "https://api.is74.ru";

/// Base URL of the CRM that accepts door-open commands.
pub const DEFAULT_CRM_BASE_URL: &str = "https://crm.is74.ru";

/// Fixed timeout applied to every outbound HTTP request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Safety margin subtracted from token expiry to absorb clock and network
/// skew: a token within this window of `access_end` counts as expired.
pub const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// The CRM is observed to reject any buyer id other than this default.
pub const DEFAULT_BUYER_ID: u32 = 1;

/// Generate a pseudo-unique device identifier in the format the mobile
/// app uses: an uppercase, hyphenated UUID4.
pub fn generate_device_id() -> String {
    uuid::Uuid::new_v4().to_string().to_uppercase()
}

/// Connection settings and device header material for one account session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Mobile API base URL (trailing slashes are trimmed on use).
    pub api_base_url: String,
    /// CRM base URL.
    pub crm_base_url: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Synthetic device id sent as `X-Device-Id`.
    pub device_id: String,
    /// Mobile app version advertised in `App-Version` / `X-App-Version`.
    pub app_version: String,
    /// Platform tag (`ios` mimics the official client).
    pub platform: String,
    /// API source tag sent as `X-Api-Source` / `X-Source`.
    pub api_source: String,
    /// User-Agent string (the app sends a build timestamp here).
    pub user_agent: String,
    /// `Accept-Language` header value.
    pub accept_language: String,
    /// Default buyer id for CRM authorization.
    pub buyer_id: u32,
    /// Expiry margin for both token kinds.
    pub token_expiry_margin: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            crm_base_url: DEFAULT_CRM_BASE_URL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            device_id: generate_device_id(),
            app_version: "6.5.1".to_string(),
            platform: "ios".to_string(),
            api_source: "mobile".to_string(),
            user_agent: "20250909164306".to_string(),
            accept_language: "ru-RU".to_string(),
            buyer_id: DEFAULT_BUYER_ID,
            token_expiry_margin: TOKEN_EXPIRY_MARGIN,
        }
    }
}

impl ClientConfig {
    /// Point the client at custom base URLs (mock servers, regional hosts).
    pub fn with_base_urls(mut self, api: impl Into<String>, crm: impl Into<String>) -> Self {
        self.api_base_url = api.into();
        self.crm_base_url = crm.into();
        self
    }

    /// Override the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Use a previously persisted device id instead of generating one.
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    /// Override the default buyer id.
    pub fn with_buyer_id(mut self, buyer_id: u32) -> Self {
        self.buyer_id = buyer_id;
        self
    }

    /// Override the token expiry margin.
    pub fn with_token_expiry_margin(mut self, margin: Duration) -> Self {
        self.token_expiry_margin = margin;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_device_id_is_uppercase_uuid() {
        let id = generate_device_id();
        assert_eq!(id.len(), 36);
        assert_eq!(id, id.to_uppercase());
        assert_eq!(id.matches('-').count(), 4);
    }

    #[test]
    fn generated_device_ids_differ() {
        assert_ne!(generate_device_id(), generate_device_id());
    }

    #[test]
    fn default_config_is_complete() {
        let config = ClientConfig::default();
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.buyer_id, DEFAULT_BUYER_ID);
        assert_eq!(config.token_expiry_margin, TOKEN_EXPIRY_MARGIN);
        assert!(!config.device_id.is_empty());
    }

    #[test]
    fn builder_overrides_apply() {
        let config = ClientConfig::default()
            .with_base_urls("http://localhost:1", "http://localhost:2")
            .with_device_id("FIXED-DEVICE")
            .with_buyer_id(9)
            .with_request_timeout(Duration::from_secs(5));
        assert_eq!(config.api_base_url, "http://localhost:1");
        assert_eq!(config.crm_base_url, "http://localhost:2");
        assert_eq!(config.device_id, "FIXED-DEVICE");
        assert_eq!(config.buyer_id, 9);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }
}
