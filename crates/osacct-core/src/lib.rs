pub mod error;
pub mod events;
pub mod model;
pub mod well_known;

pub use error::ContractError;
pub use events::{AccountEvent, EventSink, NoopEventSink, RecordingEventSink};
pub use model::{
    account_signature, normalize_identifier, normalize_names, realm_signature, AccountAttribute,
    AccountUpdate, AttributeValue, DataSourceId, DbStatus, Host, HostId, InstanceType, ObjectId,
    OsAccount, OsAccountInstance, OsAccountStatus, OsAccountType, Realm, RealmId, RealmScope,
    ScopeConfidence,
};
