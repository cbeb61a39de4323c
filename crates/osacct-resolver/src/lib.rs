//! Resolution, deduplication and merging of OS accounts and their realms.
//!
//! Every mutating call runs inside a caller-owned [`CaseTransaction`]. Events
//! and instance cache updates queued by a call become visible only when that
//! transaction commits.

pub mod account;
pub mod config;
pub mod instance;
pub mod merge;
pub mod realm;

use osacct_core::{ContractError, ObjectId, RealmId};
use osacct_storage::StorageError;
use thiserror::Error;

pub use account::AccountResolver;
pub use config::{ConfigError, ReferenceColumn, ResolverConfig};
pub use instance::{InstanceCache, InstanceRegistrar};
pub use merge::MergeEngine;
pub use osacct_storage::{CaseStore, CaseTransaction};
pub use realm::{RealmResolution, RealmResolver};

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),
    #[error("merge conflict during {operation} ({source_id} -> {destination_id}): {cause}")]
    MergeConflict {
        operation: &'static str,
        source_id: i64,
        destination_id: i64,
        #[source]
        cause: StorageError,
    },
    #[error("{entity} {key} was rejected as a duplicate but no match could be loaded")]
    ConflictUnresolved { entity: &'static str, key: String },
    #[error("signature {signature} in realm {realm_id} is held by account {account_id}")]
    SignatureTaken {
        realm_id: RealmId,
        signature: String,
        account_id: ObjectId,
    },
    #[error("account {account_id} is not active")]
    InactiveAccount { account_id: ObjectId },
}

impl ResolverError {
    /// True when the input named a group or other non-user principal. Callers
    /// skip the evidence item instead of failing the ingest.
    pub fn is_not_a_user_identity(&self) -> bool {
        matches!(self, Self::Contract(err) if err.is_not_a_user_identity())
    }
}
