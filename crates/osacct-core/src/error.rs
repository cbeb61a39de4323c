use crate::model::{RealmId, RealmScope};
use thiserror::Error;

/// Rejections raised before any storage I/O happens.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("an address or a login name is required")]
    MissingIdentifier,
    #[error("a realm is required to resolve an account")]
    MissingRealm,
    #[error("a realm address or name is required")]
    MissingRealmIdentifier,
    #[error("a referring host is required for {scope} realm resolution")]
    MissingHost { scope: RealmScope },
    #[error("realm {realm_id} is no longer active")]
    InactiveRealm { realm_id: RealmId },
    #[error("invalid windows SID {sid}: {reason}")]
    InvalidSid { sid: String, reason: &'static str },
    #[error("{sid} does not identify an individual user")]
    NotAUserIdentity { sid: String },
}

impl ContractError {
    pub fn is_not_a_user_identity(&self) -> bool {
        matches!(self, Self::NotAUserIdentity { .. })
    }
}
