//! Dual-credential session management.
//!
//! The mobile API and the CRM use separate, causally-dependent tokens:
//! phone-confirmation login yields the mobile identity token, and the CRM
//! command token is derived from it on demand. [`token`] holds the pure
//! data model (records, expiry predicates, store); [`session`] owns the
//! network side (login flow, CRM reauthorization, ensure-valid guards).

pub mod session;
pub mod token;

pub use session::{
    AccountSnapshot, AuthSession, CheckConfirmResult, ConfirmAddress, ConfirmContext,
};
pub use token::{CrmToken, MobileToken, TokenStore};
