//! Door-open command dispatch.
//!
//! Opening a door is the one physical side effect in this crate, so the
//! retry policy is deliberately narrow: `ensure_crm_token` may already
//! reauthorize once for an expired token, and a 401/403 on the open call
//! itself triggers exactly one forced reauthorization followed by one
//! retry. A second consecutive rejection is surfaced to the caller —
//! retrying further against a misconfigured buyer id would loop forever.

use async_trait::async_trait;
use std::sync::Arc;

use crate::auth::session::AuthSession;
use crate::catalog::RelayRecord;
use crate::error::{ApiError, CommandError};

/// Capability of opening a relay; implemented by [`CommandDispatcher`] and
/// by test stubs in the background loop.
#[async_trait]
pub trait DoorOpener: Send + Sync {
    async fn open(&self, relay: &RelayRecord) -> Result<(), CommandError>;
}

/// Issues authenticated door-open commands through the CRM.
pub struct CommandDispatcher {
    session: Arc<AuthSession>,
}

impl CommandDispatcher {
    pub fn new(session: Arc<AuthSession>) -> Self {
        Self { session }
    }

    /// Open the door behind `mac`/`door_id`, preferring the relay-supplied
    /// `open_link` when the listing carries one.
    pub async fn open_door(
        &self,
        mac: &str,
        door_id: u32,
        open_link: Option<&str>,
    ) -> Result<(), CommandError> {
        let crm = self.session.ensure_crm_token().await?;
        tracing::info!(mac = %mac, door_id, "sending door-open command");

        match self.attempt_open(mac, door_id, open_link, &crm.token).await {
            Err(CommandError::Rejected { status, .. }) if status == 401 || status == 403 => {
                tracing::warn!(
                    status,
                    "door-open rejected as unauthorized, forcing CRM reauthorization"
                );
                let fresh = self.session.force_crm_reauth().await?;
                self.attempt_open(mac, door_id, open_link, &fresh.token).await
            }
            other => other,
        }
    }

    /// Open a relay resolved from the catalog.
    pub async fn open_relay(&self, relay: &RelayRecord) -> Result<(), CommandError> {
        self.open_door(&relay.mac, relay.door_id, relay.open_link.as_deref())
            .await
    }

    async fn attempt_open(
        &self,
        mac: &str,
        door_id: u32,
        open_link: Option<&str>,
        bearer: &str,
    ) -> Result<(), CommandError> {
        let url = match open_link {
            Some(link) if link.starts_with("http://") || link.starts_with("https://") => {
                link.to_string()
            }
            Some(link) => format!("{}{}", self.session.crm_base_url(), link),
            None => format!(
                "{}/api/open/{}/{}",
                self.session.crm_base_url(),
                mac,
                door_id
            ),
        };
        match self.session.execute_crm_get(&url, bearer).await {
            Ok(()) => {
                tracing::info!(mac = %mac, door_id, "door-open confirmed");
                Ok(())
            }
            Err(ApiError::Status { status, body }) => {
                tracing::error!(mac = %mac, door_id, status, body = %body, "door-open rejected");
                Err(CommandError::Rejected { status, body })
            }
            Err(other) => Err(CommandError::Api(other)),
        }
    }
}

#[async_trait]
impl DoorOpener for CommandDispatcher {
    async fn open(&self, relay: &RelayRecord) -> Result<(), CommandError> {
        self.open_relay(relay).await
    }
}
