//! `domofon` — cloud intercom client.
//!
//! Talks to the provider's mobile API and CRM to manage a resident account
//! and its door relays:
//!
//! - **Auth** ([`auth`]): phone-confirmation login issuing the mobile
//!   identity token, and the derived CRM command token with transparent,
//!   single-flight reauthorization.
//! - **Relay catalog** ([`catalog`]): discovery of the door relays visible
//!   to the account, merged and deduplicated across the "own" and "shared"
//!   listings, with stable ordering and identity.
//! - **Commands** ([`command`]): authenticated door-open with a single
//!   forced reauthorization on an unauthorized rejection.
//! - **Face matching** ([`face`]): a registry of named reference vectors
//!   matched against camera frames through a pluggable encoder.
//! - **Background loop** ([`background`]): periodic face-gated auto-open
//!   with single-flight cycles, request coalescing and per-door cooldowns.
//!
//! The crate is a library only; the host wires the pieces together:
//!
//! ```no_run
//! use std::sync::Arc;
//! use domofon::{
//!     AuthSession, BackgroundCycle, ClientConfig, CommandDispatcher, CycleOptions,
//!     FaceMatcher, HttpFrameSource, NullEncoder, RelayCatalog,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Arc::new(AuthSession::new(ClientConfig::default())?);
//! let confirm = session.request_confirmation("9001112233").await?;
//! let result = session.check_confirmation("9001112233", "1234").await?;
//! let auth_id = confirm.auth_id.or(result.auth_id).ok_or("no auth id")?;
//! session.obtain_mobile_token(&auth_id, &result.addresses[0].user_id).await?;
//!
//! let catalog = Arc::new(RelayCatalog::new(session.clone(), "main-account"));
//! let doors = catalog.refresh().await?;
//!
//! let dispatcher = Arc::new(CommandDispatcher::new(session.clone()));
//! dispatcher.open_relay(&doors[0]).await?;
//!
//! let matcher = Arc::new(FaceMatcher::new(Arc::new(NullEncoder)));
//! let frames = Arc::new(HttpFrameSource::new(std::time::Duration::from_secs(30))?);
//! let cycle = BackgroundCycle::new(catalog, dispatcher, matcher, frames, CycleOptions::default());
//! cycle.start();
//! cycle.set_selection(domofon::default_selection(&doors));
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod background;
pub mod catalog;
pub mod command;
pub mod config;
pub mod error;
pub mod face;
pub mod masking;

pub use auth::session::{
    AccountSnapshot, AuthSession, CheckConfirmResult, ConfirmAddress, ConfirmContext,
};
pub use auth::token::{CrmToken, MobileToken, TokenStore};
pub use background::{
    default_selection, BackgroundCycle, CycleOptions, CycleReport, DoorDirectory, FrameSource,
    HttpFrameSource, DEFAULT_CYCLE_INTERVAL, DEFAULT_OPEN_COOLDOWN,
};
pub use catalog::{coerce_buyer_id, RelayCatalog, RelayOpener, RelayRecord};
pub use command::{CommandDispatcher, DoorOpener};
pub use config::{generate_device_id, ClientConfig, DEFAULT_BUYER_ID, TOKEN_EXPIRY_MARGIN};
pub use error::{ApiError, AuthError, CommandError, FaceError};
pub use face::{
    euclidean_distance, FaceEncoder, FaceMatcher, FaceVector, KnownFace, NullEncoder,
    DEFAULT_MATCH_THRESHOLD,
};
