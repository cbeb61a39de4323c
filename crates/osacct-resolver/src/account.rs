use crate::config::ResolverConfig;
use crate::instance::{InstanceCache, InstanceRegistrar};
use crate::merge::MergeEngine;
use crate::realm::RealmResolver;
use crate::ResolverError;
use osacct_core::model::eq_ignore_case;
use osacct_core::well_known::{self, SPECIAL_WINDOWS_REALM_ADDR};
use osacct_core::{
    account_signature, normalize_identifier, AccountAttribute, AccountEvent, AccountUpdate,
    ContractError, DataSourceId, Host, InstanceType, ObjectId, OsAccount, Realm, RealmId,
    RealmScope,
};
use osacct_storage::accounts::{self, NewAccount};
use osacct_storage::{
    attributes, CaseTransaction, Connection, InsertOutcome, ObjectIdAllocator, StorageError,
    TskObjectAllocator,
};
use std::sync::Arc;
use tracing::{debug, info};

const MAX_MERGE_CHAIN: usize = 64;

/// Normalized identifiers for one account request.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AccountIdentity {
    address: Option<String>,
    login_name: Option<String>,
    full_name: Option<&'static str>,
}

impl AccountIdentity {
    fn signature(&self) -> Result<String, ContractError> {
        account_signature(self.address.as_deref(), self.login_name.as_deref())
    }
}

pub struct AccountResolver {
    allocator: Arc<dyn ObjectIdAllocator>,
    realms: RealmResolver,
    merges: MergeEngine,
    instances: InstanceRegistrar,
}

impl AccountResolver {
    pub fn new(config: &ResolverConfig, cache: Arc<InstanceCache>) -> Self {
        Self {
            allocator: Arc::new(TskObjectAllocator),
            realms: RealmResolver::new(),
            merges: MergeEngine::new(config.reference_columns.clone(), Arc::clone(&cache)),
            instances: InstanceRegistrar::new(cache),
        }
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn ObjectIdAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn realms(&self) -> &RealmResolver {
        &self.realms
    }

    pub fn merges(&self) -> &MergeEngine {
        &self.merges
    }

    pub fn instances(&self) -> &InstanceRegistrar {
        &self.instances
    }

    /// Returns the active account of `realm` identified by `address` or
    /// `login_name`, creating it when none exists.
    ///
    /// Concurrent callers racing on the same identity all get the same row:
    /// the loser of the insert race re-reads the winner's account.
    pub fn get_or_create_account(
        &self,
        tx: &CaseTransaction<'_>,
        realm: Option<&Realm>,
        address: Option<&str>,
        login_name: Option<&str>,
    ) -> Result<OsAccount, ResolverError> {
        let realm = realm.ok_or(ContractError::MissingRealm)?;
        if !realm.is_active() {
            return Err(ContractError::InactiveRealm { realm_id: realm.id }.into());
        }
        let identity = normalize_account_identity(realm, address, login_name)?;

        if let Some(existing) = find_account(tx, realm.id, &identity)? {
            return self.fill_missing(tx, existing, &identity);
        }

        let signature = identity.signature()?;
        let new_account = NewAccount {
            realm_id: realm.id,
            address: identity.address.as_deref(),
            login_name: identity.login_name.as_deref(),
            full_name: identity.full_name,
            signature: &signature,
        };
        match accounts::try_insert_account(tx, self.allocator.as_ref(), &new_account)? {
            InsertOutcome::Inserted(account) => {
                info!(
                    event = "account_created",
                    account_id = account.id,
                    realm_id = realm.id,
                    signature = %account.signature,
                );
                tx.publish(AccountEvent::AccountsAdded {
                    accounts: vec![account.clone()],
                });
                Ok(account)
            }
            InsertOutcome::AlreadyExists => {
                let Some(winner) = find_account(tx, realm.id, &identity)? else {
                    // An address and a login can lower-case to the same signature.
                    return Err(match accounts::account_by_signature(tx, realm.id, &signature)? {
                        Some(holder) => ResolverError::SignatureTaken {
                            realm_id: realm.id,
                            signature,
                            account_id: holder.id,
                        },
                        None => ResolverError::ConflictUnresolved {
                            entity: "account",
                            key: signature,
                        },
                    });
                };
                debug!(
                    event = "account_insert_lost_race",
                    account_id = winner.id,
                    realm_id = realm.id,
                );
                self.fill_missing(tx, winner, &identity)
            }
        }
    }

    /// Resolves a Windows account from whatever the evidence names: realm
    /// first (merging realms the update reveals as duplicates), then the
    /// account inside it.
    pub fn resolve_windows_account(
        &self,
        tx: &CaseTransaction<'_>,
        sid: Option<&str>,
        login_name: Option<&str>,
        realm_name: Option<&str>,
        referring_host: &Host,
        scope: RealmScope,
    ) -> Result<OsAccount, ResolverError> {
        let mut sid = normalize_identifier(sid);
        let login_name = normalize_identifier(login_name);
        let realm_name = normalize_identifier(realm_name);
        if sid.is_none() && login_name.is_none() {
            return Err(ContractError::MissingIdentifier.into());
        }
        if let Some(sid) = sid.as_deref() {
            well_known::check_user_sid(sid)?;
        }
        if sid.is_none() {
            if let (Some(realm), Some(login)) = (realm_name.as_deref(), login_name.as_deref()) {
                sid = well_known::well_known_account_for(Some(realm), login)
                    .map(|known| known.sid.to_string());
            }
        }
        if sid.is_none() && realm_name.is_none() {
            return Err(ContractError::MissingRealmIdentifier.into());
        }

        let resolution = self.realms.get_or_create_windows_realm(
            tx,
            sid.as_deref(),
            realm_name.as_deref(),
            referring_host,
            scope,
        )?;
        let mut realm = resolution.realm;
        for duplicate in &resolution.merge_required {
            realm = self.merges.merge_realms(tx, duplicate, &realm)?;
        }

        self.get_or_create_account(tx, Some(&realm), sid.as_deref(), login_name.as_deref())
    }

    /// Entry point for file-system ingest: resolves the owner of a file and
    /// records that it was referenced on `data_source_id`.
    ///
    /// Returns `None` for SIDs that do not name a user.
    pub fn ensure_owner_account(
        &self,
        tx: &CaseTransaction<'_>,
        owner_sid: &str,
        referring_host: &Host,
        data_source_id: DataSourceId,
    ) -> Result<Option<OsAccount>, ResolverError> {
        let account = match self.resolve_windows_account(
            tx,
            Some(owner_sid),
            None,
            None,
            referring_host,
            RealmScope::Unknown,
        ) {
            Ok(account) => account,
            Err(err) if err.is_not_a_user_identity() => {
                debug!(event = "owner_sid_skipped", sid = owner_sid);
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        self.instances
            .record_instance(tx, &account, data_source_id, InstanceType::Referenced)?;
        Ok(Some(account))
    }

    /// Overwrites the fields set in `update` on the canonical account for `account_id`.
    pub fn update_account(
        &self,
        tx: &CaseTransaction<'_>,
        account_id: ObjectId,
        update: &AccountUpdate,
    ) -> Result<OsAccount, ResolverError> {
        let mut account = self
            .canonical_account(tx, account_id)?
            .ok_or(StorageError::NotFound {
                entity: "account",
                id: account_id,
            })?;
        if update.is_empty() {
            return Ok(account);
        }

        if let Some(full_name) = normalize_identifier(update.full_name.as_deref()) {
            account.full_name = Some(full_name);
        }
        if let Some(account_type) = update.account_type {
            account.account_type = Some(account_type);
        }
        if let Some(status) = update.status {
            account.status = Some(status);
        }
        if let Some(created) = update.created {
            account.created = Some(created);
        }
        accounts::update_account(tx, &account)?;
        tx.publish(AccountEvent::AccountsUpdated {
            accounts: vec![account.clone()],
        });
        Ok(account)
    }

    pub fn add_attributes(
        &self,
        tx: &CaseTransaction<'_>,
        account: &OsAccount,
        values: Vec<AccountAttribute>,
    ) -> Result<(), ResolverError> {
        if values.is_empty() {
            return Ok(());
        }
        for mut attribute in values {
            attribute.account_id = account.id;
            attributes::insert_attribute(tx, &attribute)?;
        }
        tx.publish(AccountEvent::AccountsUpdated {
            accounts: vec![account.clone()],
        });
        Ok(())
    }

    pub fn attributes(
        &self,
        conn: &Connection,
        account_id: ObjectId,
    ) -> Result<Vec<AccountAttribute>, ResolverError> {
        Ok(attributes::attributes_for_account(conn, account_id)?)
    }

    pub fn get_account(
        &self,
        conn: &Connection,
        account_id: ObjectId,
    ) -> Result<Option<OsAccount>, ResolverError> {
        Ok(accounts::account_by_id(conn, account_id)?)
    }

    /// Follows `merged_into` links to the surviving account.
    pub fn canonical_account(
        &self,
        conn: &Connection,
        account_id: ObjectId,
    ) -> Result<Option<OsAccount>, ResolverError> {
        let mut current = match accounts::account_by_id(conn, account_id)? {
            Some(account) => account,
            None => return Ok(None),
        };
        for _ in 0..MAX_MERGE_CHAIN {
            let Some(next_id) = current.merged_into else {
                return Ok(Some(current));
            };
            current = accounts::account_by_id(conn, next_id)?.ok_or(StorageError::NotFound {
                entity: "account",
                id: next_id,
            })?;
        }
        Err(ResolverError::InactiveAccount { account_id })
    }

    pub fn account_by_address(
        &self,
        conn: &Connection,
        realm_id: RealmId,
        address: &str,
    ) -> Result<Option<OsAccount>, ResolverError> {
        let Some(address) = normalize_identifier(Some(address)) else {
            return Ok(None);
        };
        Ok(accounts::account_by_address(conn, realm_id, &address)?)
    }

    pub fn account_by_login(
        &self,
        conn: &Connection,
        realm_id: RealmId,
        login_name: &str,
    ) -> Result<Option<OsAccount>, ResolverError> {
        let Some(login_name) = normalize_identifier(Some(login_name)) else {
            return Ok(None);
        };
        Ok(accounts::accounts_by_login(conn, realm_id, &login_name)?
            .into_iter()
            .next())
    }

    pub fn accounts_in_realm(
        &self,
        conn: &Connection,
        realm_id: RealmId,
    ) -> Result<Vec<OsAccount>, ResolverError> {
        Ok(accounts::accounts_in_realm(conn, realm_id)?)
    }

    pub fn active_accounts(&self, conn: &Connection) -> Result<Vec<OsAccount>, ResolverError> {
        Ok(accounts::active_accounts(conn)?)
    }

    /// Copies identifiers the stored account lacks from the request. A login
    /// added to an address-bearing account absorbs any login-only duplicate.
    fn fill_missing(
        &self,
        tx: &CaseTransaction<'_>,
        mut account: OsAccount,
        identity: &AccountIdentity,
    ) -> Result<OsAccount, ResolverError> {
        let mut changed = false;
        let mut login_added = false;

        if account.address.is_none() && identity.address.is_some() {
            account.address = identity.address.clone();
            account.signature =
                account_signature(account.address.as_deref(), account.login_name.as_deref())?;
            changed = true;
        }
        if account.login_name.is_none() && identity.login_name.is_some() {
            account.login_name = identity.login_name.clone();
            login_added = true;
            changed = true;
        }
        if account.full_name.is_none() {
            if let Some(full_name) = identity.full_name {
                account.full_name = Some(full_name.to_string());
                changed = true;
            }
        }

        if !changed {
            return Ok(account);
        }
        accounts::update_account(tx, &account)?;
        debug!(
            event = "account_filled",
            account_id = account.id,
            login_added = login_added,
        );
        tx.publish(AccountEvent::AccountsUpdated {
            accounts: vec![account.clone()],
        });

        if login_added && account.address.is_some() {
            if let Some(login_name) = account.login_name.clone() {
                for duplicate in accounts::accounts_by_login(tx, account.realm_id, &login_name)? {
                    if duplicate.id != account.id && duplicate.address.is_none() {
                        account = self.merges.merge_accounts(tx, &duplicate, &account)?;
                    }
                }
            }
        }
        Ok(account)
    }
}

/// Address match first; a login match only counts when one side has no address.
fn find_account(
    conn: &Connection,
    realm_id: RealmId,
    identity: &AccountIdentity,
) -> Result<Option<OsAccount>, ResolverError> {
    if let Some(address) = identity.address.as_deref() {
        if let Some(account) = accounts::account_by_address(conn, realm_id, address)? {
            return Ok(Some(account));
        }
    }
    if let Some(login_name) = identity.login_name.as_deref() {
        let candidate = accounts::accounts_by_login(conn, realm_id, login_name)?
            .into_iter()
            .find(|candidate| candidate.address.is_none() || identity.address.is_none());
        return Ok(candidate);
    }
    Ok(None)
}

fn normalize_account_identity(
    realm: &Realm,
    address: Option<&str>,
    login_name: Option<&str>,
) -> Result<AccountIdentity, ContractError> {
    let mut address = normalize_identifier(address);
    let mut login_name = normalize_identifier(login_name);
    if address.is_none() && login_name.is_none() {
        return Err(ContractError::MissingIdentifier);
    }

    if let Some(sid) = address.as_deref() {
        if well_known::is_sid_shaped(sid) && !well_known::is_windows_user_sid(sid) {
            return Err(ContractError::NotAUserIdentity {
                sid: sid.to_string(),
            });
        }
    }

    let builtin_realm = realm
        .address
        .as_deref()
        .is_some_and(|address| eq_ignore_case(address, SPECIAL_WINDOWS_REALM_ADDR))
        || realm.names.iter().any(|name| well_known::is_nt_authority(name));
    if address.is_none() && builtin_realm {
        if let Some(login) = login_name.as_deref() {
            address = well_known::well_known_account_for(None, login)
                .map(|known| known.sid.to_string());
        }
    }
    if login_name.is_none() {
        if let Some(sid) = address.as_deref() {
            login_name = well_known::well_known_account_by_sid(sid)
                .map(|known| known.login_name.to_string());
        }
    }

    let full_name = address.as_deref().and_then(well_known::well_known_full_name);
    Ok(AccountIdentity {
        address,
        login_name,
        full_name,
    })
}
