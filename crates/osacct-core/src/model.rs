use crate::error::ContractError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub type ObjectId = i64;
pub type RealmId = i64;
pub type HostId = i64;
pub type DataSourceId = i64;

/// Host placeholder used in place of a scope host id for domain scoped realms.
pub const DOMAIN_SCOPE_TOKEN: &str = "DOMAIN";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub name: String,
}

impl Host {
    pub fn new(id: HostId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Scope a caller asks for when resolving a realm.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RealmScope {
    Unknown,
    Local,
    Domain,
}

impl Default for RealmScope {
    fn default() -> Self {
        Self::Unknown
    }
}

impl RealmScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Local => "local",
            Self::Domain => "domain",
        }
    }
}

impl std::fmt::Display for RealmScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScopeConfidence {
    Known,
    Inferred,
}

impl ScopeConfidence {
    pub fn id(self) -> i64 {
        match self {
            Self::Known => 0,
            Self::Inferred => 1,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            0 => Some(Self::Known),
            1 => Some(Self::Inferred),
            _ => None,
        }
    }
}

/// Lifecycle of a stored row. Merged and deleted rows are kept as tombstones.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DbStatus {
    Active,
    Merged,
    Deleted,
}

impl DbStatus {
    pub fn id(self) -> i64 {
        match self {
            Self::Active => 0,
            Self::Merged => 1,
            Self::Deleted => 2,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            0 => Some(Self::Active),
            1 => Some(Self::Merged),
            2 => Some(Self::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OsAccountStatus {
    Unknown,
    Active,
    Disabled,
    Deleted,
    NonExistent,
}

impl OsAccountStatus {
    pub fn id(self) -> i64 {
        match self {
            Self::Unknown => 0,
            Self::Active => 1,
            Self::Disabled => 2,
            Self::Deleted => 3,
            Self::NonExistent => 4,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            0 => Some(Self::Unknown),
            1 => Some(Self::Active),
            2 => Some(Self::Disabled),
            3 => Some(Self::Deleted),
            4 => Some(Self::NonExistent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OsAccountType {
    Unknown,
    Service,
    Interactive,
}

impl OsAccountType {
    pub fn id(self) -> i64 {
        match self {
            Self::Unknown => 0,
            Self::Service => 1,
            Self::Interactive => 2,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            0 => Some(Self::Unknown),
            1 => Some(Self::Service),
            2 => Some(Self::Interactive),
            _ => None,
        }
    }
}

/// How an account was observed on a data source, most significant first.
///
/// The derived ordering follows declaration order, so `Launched < Accessed`
/// means "launched is more significant than accessed".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum InstanceType {
    Launched,
    Accessed,
    Referenced,
}

impl InstanceType {
    pub fn id(self) -> i64 {
        match self {
            Self::Launched => 0,
            Self::Accessed => 1,
            Self::Referenced => 2,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            0 => Some(Self::Launched),
            1 => Some(Self::Accessed),
            2 => Some(Self::Referenced),
            _ => None,
        }
    }

    pub fn is_more_significant_than(self, other: Self) -> bool {
        self < other
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Realm {
    pub id: RealmId,
    pub names: Vec<String>,
    pub address: Option<String>,
    pub scope_host_id: Option<HostId>,
    pub scope_confidence: ScopeConfidence,
    pub signature: String,
    pub db_status: DbStatus,
    pub merged_into: Option<RealmId>,
}

impl Realm {
    pub fn primary_name(&self) -> Option<&str> {
        self.names.first().map(String::as_str)
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.names.iter().any(|known| eq_ignore_case(known, name))
    }

    pub fn is_active(&self) -> bool {
        self.db_status == DbStatus::Active
    }

    pub fn is_domain_scoped(&self) -> bool {
        self.scope_host_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsAccount {
    pub id: ObjectId,
    pub realm_id: RealmId,
    pub address: Option<String>,
    pub login_name: Option<String>,
    pub full_name: Option<String>,
    pub account_type: Option<OsAccountType>,
    pub status: Option<OsAccountStatus>,
    pub created: Option<DateTime<Utc>>,
    pub signature: String,
    pub db_status: DbStatus,
    pub merged_into: Option<ObjectId>,
}

impl OsAccount {
    pub fn is_active(&self) -> bool {
        self.db_status == DbStatus::Active
    }

    /// Login name for log fields, falling back to the address.
    pub fn display_name(&self) -> &str {
        self.login_name
            .as_deref()
            .or(self.address.as_deref())
            .unwrap_or("<unnamed>")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OsAccountInstance {
    pub id: i64,
    pub account_id: ObjectId,
    pub data_source_id: DataSourceId,
    pub instance_type: InstanceType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    Text(String),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Bytes(Vec<u8>),
    /// Seconds since the unix epoch.
    DateTime(i64),
    Json(serde_json::Value),
}

impl AttributeValue {
    pub fn value_type_id(&self) -> i64 {
        match self {
            Self::Text(_) => 0,
            Self::Int32(_) => 1,
            Self::Int64(_) => 2,
            Self::Double(_) => 3,
            Self::Bytes(_) => 4,
            Self::DateTime(_) => 5,
            Self::Json(_) => 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountAttribute {
    pub account_id: ObjectId,
    pub host_id: Option<HostId>,
    pub source_obj_id: Option<ObjectId>,
    pub attribute_type_id: i64,
    pub value: AttributeValue,
}

/// Fields a caller may set on an existing account. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUpdate {
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub account_type: Option<OsAccountType>,
    #[serde(default)]
    pub status: Option<OsAccountStatus>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
}

impl AccountUpdate {
    pub fn is_empty(&self) -> bool {
        self.full_name.is_none()
            && self.account_type.is_none()
            && self.status.is_none()
            && self.created.is_none()
    }
}

/// Trims an identifier and treats empty strings as absent.
pub fn normalize_identifier(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

pub fn normalize_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::new();
    for name in names {
        let Some(name) = normalize_identifier(Some(name)) else {
            continue;
        };
        if !normalized.iter().any(|known| eq_ignore_case(known, &name)) {
            normalized.push(name);
        }
    }
    normalized
}

pub fn eq_ignore_case(left: &str, right: &str) -> bool {
    left == right || left.to_lowercase() == right.to_lowercase()
}

pub fn realm_signature(
    address: Option<&str>,
    names: &[String],
    scope_host_id: Option<HostId>,
) -> Result<String, ContractError> {
    let identity = address
        .filter(|value| !value.is_empty())
        .or_else(|| names.first().map(String::as_str))
        .ok_or(ContractError::MissingRealmIdentifier)?;
    let scope = scope_host_id
        .map(|host_id| host_id.to_string())
        .unwrap_or_else(|| DOMAIN_SCOPE_TOKEN.to_string());
    Ok(format!("{identity}_{scope}").to_lowercase())
}

pub fn account_signature(
    address: Option<&str>,
    login_name: Option<&str>,
) -> Result<String, ContractError> {
    address
        .filter(|value| !value.is_empty())
        .or(login_name.filter(|value| !value.is_empty()))
        .map(str::to_lowercase)
        .ok_or(ContractError::MissingIdentifier)
}

pub fn epoch_seconds(value: DateTime<Utc>) -> i64 {
    value.timestamp()
}

pub fn from_epoch_seconds(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}
