use crate::ResolverError;
use osacct_core::model::eq_ignore_case;
use osacct_core::well_known::{self, SPECIAL_WINDOWS_REALM_ADDR};
use osacct_core::{
    normalize_identifier, normalize_names, realm_signature, AccountEvent, ContractError, Host,
    HostId, OsAccount, Realm, RealmId, RealmScope, ScopeConfidence,
};
use osacct_storage::realms::{self, NewRealm};
use osacct_storage::{accounts, CaseTransaction, Connection, InsertOutcome};
use tracing::info;

/// Outcome of [`RealmResolver::get_or_create_realm`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealmResolution {
    pub realm: Realm,
    pub created: bool,
    /// Active realms that now describe the same realm as `realm`. The caller
    /// merges each of them into `realm` in the same transaction.
    pub merge_required: Vec<Realm>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RealmResolver;

impl RealmResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn get_or_create_realm(
        &self,
        tx: &CaseTransaction<'_>,
        address: Option<&str>,
        names: &[&str],
        referring_host: Option<&Host>,
        scope: RealmScope,
    ) -> Result<RealmResolution, ResolverError> {
        let address = normalize_identifier(address);
        let names = normalize_names(names.iter().copied());
        if address.is_none() && names.is_empty() {
            return Err(ContractError::MissingRealmIdentifier.into());
        }
        let host_id = referring_host.map(|host| host.id);
        let (scope_host_id, scope_confidence) = resolve_scope(tx, scope, host_id)?;

        if let Some(existing) = find_realm_in(tx, address.as_deref(), &names, host_id)? {
            return self.fill_missing(tx, existing, address, names, host_id);
        }

        let signature = realm_signature(address.as_deref(), &names, scope_host_id)?;
        let new_realm = NewRealm {
            names: &names,
            address: address.as_deref(),
            scope_host_id,
            scope_confidence,
            signature: &signature,
        };
        match realms::try_insert_realm(tx, &new_realm)? {
            InsertOutcome::Inserted(realm) => {
                info!(
                    event = "realm_created",
                    realm_id = realm.id,
                    signature = %realm.signature,
                    scope = %scope,
                );
                tx.publish(AccountEvent::RealmsAdded {
                    realms: vec![realm.clone()],
                });
                Ok(RealmResolution {
                    realm,
                    created: true,
                    merge_required: Vec::new(),
                })
            }
            InsertOutcome::AlreadyExists => {
                let winner = find_realm_in(tx, address.as_deref(), &names, host_id)?
                    .ok_or(ResolverError::ConflictUnresolved {
                        entity: "realm",
                        key: signature,
                    })?;
                self.fill_missing(tx, winner, address, names, host_id)
            }
        }
    }

    /// Resolves the realm that issued `account_sid`, or the realm called
    /// `realm_name` when no SID is known.
    pub fn get_or_create_windows_realm(
        &self,
        tx: &CaseTransaction<'_>,
        account_sid: Option<&str>,
        realm_name: Option<&str>,
        referring_host: &Host,
        scope: RealmScope,
    ) -> Result<RealmResolution, ResolverError> {
        let address = windows_realm_address(account_sid)?;
        let scope = if address.as_deref() == Some(SPECIAL_WINDOWS_REALM_ADDR) {
            RealmScope::Local
        } else {
            scope
        };
        let names: Vec<&str> = realm_name.into_iter().collect();
        self.get_or_create_realm(
            tx,
            address.as_deref(),
            &names,
            Some(referring_host),
            scope,
        )
    }

    pub fn find_realm(
        &self,
        conn: &Connection,
        address: Option<&str>,
        names: &[&str],
        referring_host: Option<&Host>,
    ) -> Result<Option<Realm>, ResolverError> {
        let address = normalize_identifier(address);
        let names = normalize_names(names.iter().copied());
        find_realm_in(
            conn,
            address.as_deref(),
            &names,
            referring_host.map(|host| host.id),
        )
    }

    pub fn find_windows_realm(
        &self,
        conn: &Connection,
        account_sid: Option<&str>,
        realm_name: Option<&str>,
        referring_host: &Host,
    ) -> Result<Option<Realm>, ResolverError> {
        let address = windows_realm_address(account_sid)?;
        let names: Vec<&str> = realm_name.into_iter().collect();
        self.find_realm(conn, address.as_deref(), &names, Some(referring_host))
    }

    pub fn get_realm(
        &self,
        conn: &Connection,
        realm_id: RealmId,
    ) -> Result<Option<Realm>, ResolverError> {
        Ok(realms::realm_by_id(conn, realm_id)?)
    }

    pub fn active_realms(&self, conn: &Connection) -> Result<Vec<Realm>, ResolverError> {
        Ok(realms::active_realms(conn)?)
    }

    pub fn realm_accounts(
        &self,
        conn: &Connection,
        realm: &Realm,
    ) -> Result<Vec<OsAccount>, ResolverError> {
        Ok(accounts::accounts_in_realm(conn, realm.id)?)
    }

    /// Adds an address or names the stored realm lacks, then reports realms
    /// that independently carry the added value.
    fn fill_missing(
        &self,
        tx: &CaseTransaction<'_>,
        mut realm: Realm,
        address: Option<String>,
        names: Vec<String>,
        host_id: Option<HostId>,
    ) -> Result<RealmResolution, ResolverError> {
        let mut merge_required: Vec<Realm> = Vec::new();
        let mut changed = false;

        if realm.address.is_none() {
            if let Some(address) = address {
                for other in realms::realms_by_address(tx, &address, host_id)? {
                    push_candidate(&mut merge_required, &realm, other);
                }
                realm.address = Some(address);
                changed = true;
            }
        }

        for name in names {
            if realm.has_name(&name) {
                continue;
            }
            for other in realms::realms_by_name(tx, &name, host_id)? {
                if other.address.is_none() {
                    push_candidate(&mut merge_required, &realm, other);
                }
            }
            realm.names.push(name);
            changed = true;
        }

        if !changed {
            return Ok(RealmResolution {
                realm,
                created: false,
                merge_required,
            });
        }

        if merge_required.is_empty() {
            realm.signature =
                realm_signature(realm.address.as_deref(), &realm.names, realm.scope_host_id)?;
        }
        realms::update_realm(tx, &realm)?;
        info!(
            event = "realm_updated",
            realm_id = realm.id,
            pending_merges = merge_required.len(),
        );
        tx.publish(AccountEvent::RealmsUpdated {
            realms: vec![realm.clone()],
        });

        Ok(RealmResolution {
            realm,
            created: false,
            merge_required,
        })
    }
}

fn push_candidate(candidates: &mut Vec<Realm>, realm: &Realm, other: Realm) {
    if other.id != realm.id && !candidates.iter().any(|known| known.id == other.id) {
        candidates.push(other);
    }
}

/// Address match first, then a name match whose realm has no conflicting address.
fn find_realm_in(
    conn: &Connection,
    address: Option<&str>,
    names: &[String],
    host_id: Option<HostId>,
) -> Result<Option<Realm>, ResolverError> {
    if let Some(address) = address {
        if let Some(realm) = realms::realm_by_address(conn, address, host_id)? {
            return Ok(Some(realm));
        }
    }

    for name in names {
        let candidate = realms::realms_by_name(conn, name, host_id)?
            .into_iter()
            .find(|realm| match (&realm.address, address) {
                (Some(known), Some(requested)) => eq_ignore_case(known, requested),
                _ => true,
            });
        if candidate.is_some() {
            return Ok(candidate);
        }
    }
    Ok(None)
}

fn resolve_scope(
    conn: &Connection,
    scope: RealmScope,
    host_id: Option<HostId>,
) -> Result<(Option<HostId>, ScopeConfidence), ResolverError> {
    match (scope, host_id) {
        (RealmScope::Domain, _) => Ok((None, ScopeConfidence::Known)),
        (RealmScope::Local, Some(host_id)) => Ok((Some(host_id), ScopeConfidence::Known)),
        (RealmScope::Unknown, Some(host_id)) => {
            // A host with a known local realm of its own is referring to a domain realm.
            if realms::host_has_known_realm(conn, host_id, SPECIAL_WINDOWS_REALM_ADDR)? {
                Ok((None, ScopeConfidence::Known))
            } else {
                Ok((Some(host_id), ScopeConfidence::Inferred))
            }
        }
        (scope, None) => Err(ContractError::MissingHost { scope }.into()),
    }
}

fn windows_realm_address(account_sid: Option<&str>) -> Result<Option<String>, ResolverError> {
    Ok(normalize_identifier(account_sid)
        .map(|sid| well_known::windows_realm_address(&sid))
        .transpose()?)
}
