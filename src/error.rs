//! Error taxonomy for the intercom client.
//!
//! Each component surfaces its own tagged error type; transport failures
//! (`ApiError`) convert into the component errors via `#[from]` so `?`
//! propagation stays clean. Session-level failures (`NoToken`, `Expired`)
//! are unrecoverable locally — the host has to restart interactive login.

use thiserror::Error;

/// Transport- and shape-level failures shared by every remote call.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Connection failure or request timeout. Never retried silently.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("API returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body did not have the expected shape.
    #[error("unexpected API response: {0}")]
    Format(String),
}

/// Authentication and session errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No mobile token has ever been installed on this session.
    #[error("not authenticated: no mobile token")]
    NoToken,

    /// The mobile token is past its expiry margin; a fresh interactive
    /// login is required.
    #[error("mobile token expired, interactive login required")]
    Expired,

    /// The remote side refused the authorization exchange.
    #[error("authorization rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Door-open command errors.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// CRM rejected the open command. Surfaced verbatim, never retried
    /// beyond the single reauthorize-and-retry the dispatcher performs.
    #[error("door open rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error(transparent)]
    Api(ApiError),
}

/// Face registry and matching errors.
#[derive(Debug, Error)]
pub enum FaceError {
    /// No face-recognition backend was supplied; matching is disabled.
    #[error("face recognition backend unavailable")]
    LibraryUnavailable,

    /// The submitted image contains no detectable face.
    #[error("no face found in image")]
    NoFaceFound,

    /// Removal was requested for a name that is not registered.
    #[error("face '{0}' is not registered")]
    UnknownFace(String),

    /// The image bytes could not be decoded by the backend.
    #[error("failed to decode image: {0}")]
    InvalidImage(String),
}
