use crate::config::ReferenceColumn;
use crate::instance::InstanceCache;
use crate::ResolverError;
use osacct_core::{
    account_signature, realm_signature, AccountEvent, ObjectId, OsAccount, Realm,
};
use osacct_storage::{accounts, attributes, instances, realms, CaseTransaction, StorageError};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Folds duplicate accounts and realms into a surviving record.
///
/// Merges run inside the caller's transaction and never commit on their own;
/// a failed merge leaves the transaction for the caller to roll back.
#[derive(Debug, Clone)]
pub struct MergeEngine {
    reference_columns: Vec<ReferenceColumn>,
    cache: Arc<InstanceCache>,
}

impl MergeEngine {
    pub fn new(reference_columns: Vec<ReferenceColumn>, cache: Arc<InstanceCache>) -> Self {
        Self {
            reference_columns,
            cache,
        }
    }

    /// Retires `source` into `destination` and returns the updated destination.
    pub fn merge_accounts(
        &self,
        tx: &CaseTransaction<'_>,
        source: &OsAccount,
        destination: &OsAccount,
    ) -> Result<OsAccount, ResolverError> {
        let source = load_active_account(tx, source.id)?;
        let mut destination = load_active_account(tx, destination.id)?;
        if source.id == destination.id {
            return Ok(destination);
        }
        let conflict = merge_conflict("merge accounts", source.id, destination.id);

        let dropped = instances::delete_duplicate_instances(tx, source.id, destination.id)?;
        instances::repoint_instances(tx, source.id, destination.id).map_err(&conflict)?;
        attributes::repoint_attributes(tx, source.id, destination.id)?;
        for reference in &self.reference_columns {
            let repointed = accounts::repoint_account_column(
                tx,
                &reference.table,
                &reference.column,
                source.id,
                destination.id,
            )
            .map_err(&conflict)?;
            if repointed.is_none() {
                debug!(
                    event = "reference_table_absent",
                    table = %reference.table,
                );
            }
        }

        accounts::mark_account_merged(tx, source.id, destination.id, &tombstone())?;

        let mut changed = fill(&mut destination.address, &source.address);
        changed |= fill(&mut destination.login_name, &source.login_name);
        changed |= fill(&mut destination.full_name, &source.full_name);
        changed |= fill(&mut destination.created, &source.created);
        changed |= fill(&mut destination.account_type, &source.account_type);
        changed |= fill(&mut destination.status, &source.status);
        if changed {
            destination.signature = account_signature(
                destination.address.as_deref(),
                destination.login_name.as_deref(),
            )?;
            accounts::update_account(tx, &destination).map_err(&conflict)?;
        }

        self.flush_instance_cache(tx);
        info!(
            event = "accounts_merged",
            source_id = source.id,
            destination_id = destination.id,
            dropped_instances = dropped,
        );
        tx.publish(AccountEvent::AccountsMerged {
            source_id: source.id,
            destination: destination.clone(),
        });
        Ok(destination)
    }

    /// Moves every active account of `source` into `destination`, merging the
    /// ones the destination already knows.
    pub fn merge_accounts_for_realms(
        &self,
        tx: &CaseTransaction<'_>,
        source: &Realm,
        destination: &Realm,
    ) -> Result<(), ResolverError> {
        for account in accounts::accounts_in_realm(tx, source.id)? {
            let by_address = match account.address.as_deref() {
                Some(address) => accounts::account_by_address(tx, destination.id, address)?,
                None => None,
            };
            let by_login = match account.login_name.as_deref() {
                Some(login) => accounts::accounts_by_login(tx, destination.id, login)?
                    .into_iter()
                    .find(|candidate| {
                        candidate.address.is_none() || account.address.is_none()
                    }),
                None => None,
            };

            let target = match (by_address, by_login) {
                (Some(by_address), Some(by_login)) if by_address.id != by_login.id => {
                    // Same identity split across two destination rows.
                    Some(self.merge_accounts(tx, &by_login, &by_address)?)
                }
                (Some(by_address), _) => Some(by_address),
                (None, by_login) => by_login,
            };

            match target {
                Some(target) => {
                    self.merge_accounts(tx, &account, &target)?;
                }
                None => {
                    let mut moved = account;
                    moved.realm_id = destination.id;
                    accounts::update_account(tx, &moved).map_err(merge_conflict(
                        "move account",
                        moved.id,
                        destination.id,
                    ))?;
                    debug!(
                        event = "account_moved",
                        account_id = moved.id,
                        realm_id = destination.id,
                    );
                    tx.publish(AccountEvent::AccountsUpdated {
                        accounts: vec![moved],
                    });
                }
            }
        }
        Ok(())
    }

    /// Retires `source` into `destination` and returns the updated destination.
    pub fn merge_realms(
        &self,
        tx: &CaseTransaction<'_>,
        source: &Realm,
        destination: &Realm,
    ) -> Result<Realm, ResolverError> {
        let source = load_realm(tx, source.id)?;
        let mut destination = load_realm(tx, destination.id)?;
        if source.id == destination.id || !source.is_active() {
            return Ok(destination);
        }

        self.merge_accounts_for_realms(tx, &source, &destination)?;
        realms::mark_realm_merged(tx, source.id, destination.id, &tombstone())?;

        if destination.address.is_none() {
            destination.address = source.address.clone();
        }
        for name in &source.names {
            if !destination.has_name(name) {
                destination.names.push(name.clone());
            }
        }
        destination.signature = realm_signature(
            destination.address.as_deref(),
            &destination.names,
            destination.scope_host_id,
        )?;
        realms::update_realm(tx, &destination).map_err(merge_conflict(
            "merge realms",
            source.id,
            destination.id,
        ))?;

        self.flush_instance_cache(tx);
        info!(
            event = "realms_merged",
            source_id = source.id,
            destination_id = destination.id,
            signature = %destination.signature,
        );
        tx.publish(AccountEvent::RealmsMerged {
            source_id: source.id,
            destination: destination.clone(),
        });
        Ok(destination)
    }

    fn flush_instance_cache(&self, tx: &CaseTransaction<'_>) {
        self.cache.clear();
        let cache = Arc::clone(&self.cache);
        tx.on_commit(move || cache.clear());
    }
}

fn fill<T: Clone>(target: &mut Option<T>, source: &Option<T>) -> bool {
    if target.is_none() && source.is_some() {
        *target = source.clone();
        true
    } else {
        false
    }
}

fn tombstone() -> String {
    Uuid::new_v4().to_string()
}

fn merge_conflict(
    operation: &'static str,
    source_id: i64,
    destination_id: i64,
) -> impl Fn(StorageError) -> ResolverError {
    move |err| {
        if err.is_unique_violation() {
            ResolverError::MergeConflict {
                operation,
                source_id,
                destination_id,
                cause: err,
            }
        } else {
            ResolverError::Storage(err)
        }
    }
}

fn load_active_account(
    tx: &CaseTransaction<'_>,
    account_id: ObjectId,
) -> Result<OsAccount, ResolverError> {
    let account = accounts::account_by_id(tx, account_id)?.ok_or(StorageError::NotFound {
        entity: "account",
        id: account_id,
    })?;
    if !account.is_active() {
        return Err(ResolverError::InactiveAccount { account_id });
    }
    Ok(account)
}

fn load_realm(tx: &CaseTransaction<'_>, realm_id: i64) -> Result<Realm, ResolverError> {
    Ok(realms::realm_by_id(tx, realm_id)?.ok_or(StorageError::NotFound {
        entity: "realm",
        id: realm_id,
    })?)
}
