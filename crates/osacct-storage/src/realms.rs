use crate::{try_insert, InsertOutcome, SqlContext, StorageError};
use osacct_core::{DbStatus, HostId, Realm, RealmId, ScopeConfidence};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

const REALM_COLUMNS: &str = "
    id,
    realm_names_json,
    realm_addr,
    realm_signature,
    scope_host_id,
    scope_confidence,
    db_status,
    merged_into
";

// ?2 is the referring host. A host sees its own realms and domain realms,
// its own first; no host sees domain realms only.
const HOST_SCOPE_FILTER: &str = "
    ((?2 IS NULL AND scope_host_id IS NULL)
        OR (?2 IS NOT NULL AND (scope_host_id = ?2 OR scope_host_id IS NULL)))
";
const HOST_SCOPE_ORDER: &str = "ORDER BY scope_host_id IS NULL, id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRealm<'a> {
    pub names: &'a [String],
    pub address: Option<&'a str>,
    pub scope_host_id: Option<HostId>,
    pub scope_confidence: ScopeConfidence,
    pub signature: &'a str,
}

pub fn try_insert_realm(
    conn: &Connection,
    realm: &NewRealm<'_>,
) -> Result<InsertOutcome<Realm>, StorageError> {
    let names_json = names_to_json(realm.names)?;
    try_insert(conn, "insert realm", |conn| {
        conn.execute(
            "
            INSERT INTO os_account_realms (
                realm_names_json,
                realm_addr,
                realm_signature,
                scope_host_id,
                scope_confidence,
                db_status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                names_json,
                realm.address,
                realm.signature,
                realm.scope_host_id,
                realm.scope_confidence.id(),
                DbStatus::Active.id(),
            ],
        )?;
        Ok(Realm {
            id: conn.last_insert_rowid(),
            names: realm.names.to_vec(),
            address: realm.address.map(ToString::to_string),
            scope_host_id: realm.scope_host_id,
            scope_confidence: realm.scope_confidence,
            signature: realm.signature.to_string(),
            db_status: DbStatus::Active,
            merged_into: None,
        })
    })
}

pub fn realm_by_id(conn: &Connection, realm_id: RealmId) -> Result<Option<Realm>, StorageError> {
    conn.query_row(
        &format!("SELECT {REALM_COLUMNS} FROM os_account_realms WHERE id = ?1"),
        [realm_id],
        realm_from_row,
    )
    .optional()
    .context(|| format!("load realm {realm_id}"))
}

/// Active realms carrying `address` that the referring host can see, best match first.
pub fn realms_by_address(
    conn: &Connection,
    address: &str,
    host_id: Option<HostId>,
) -> Result<Vec<Realm>, StorageError> {
    let sql = format!(
        "
        SELECT {REALM_COLUMNS}
        FROM os_account_realms
        WHERE db_status = 0
          AND realm_addr = ?1 COLLATE NOCASE
          AND {HOST_SCOPE_FILTER}
        {HOST_SCOPE_ORDER}
        "
    );
    query_realms(conn, &sql, params![address, host_id])
        .context(|| format!("find realms by address {address}"))
}

pub fn realm_by_address(
    conn: &Connection,
    address: &str,
    host_id: Option<HostId>,
) -> Result<Option<Realm>, StorageError> {
    Ok(realms_by_address(conn, address, host_id)?
        .into_iter()
        .next())
}

/// Active realms listing `name` that the referring host can see, best match first.
pub fn realms_by_name(
    conn: &Connection,
    name: &str,
    host_id: Option<HostId>,
) -> Result<Vec<Realm>, StorageError> {
    let sql = format!(
        "
        SELECT {REALM_COLUMNS}
        FROM os_account_realms
        WHERE db_status = 0
          AND EXISTS (
              SELECT 1
              FROM json_each(os_account_realms.realm_names_json) AS realm_name
              WHERE realm_name.value = ?1 COLLATE NOCASE
          )
          AND {HOST_SCOPE_FILTER}
        {HOST_SCOPE_ORDER}
        "
    );
    query_realms(conn, &sql, params![name, host_id])
        .context(|| format!("find realms by name {name}"))
}

/// True when the host already owns a realm whose scope was stated rather than inferred.
pub fn host_has_known_realm(
    conn: &Connection,
    host_id: HostId,
    excluded_address: &str,
) -> Result<bool, StorageError> {
    let found = conn
        .query_row(
            "
            SELECT 1
            FROM os_account_realms
            WHERE db_status = 0
              AND scope_host_id = ?1
              AND scope_confidence = ?2
              AND (realm_addr IS NULL OR realm_addr != ?3)
            LIMIT 1
            ",
            params![host_id, ScopeConfidence::Known.id(), excluded_address],
            |_| Ok(()),
        )
        .optional()
        .context(|| format!("check known realms of host {host_id}"))?;
    Ok(found.is_some())
}

pub fn active_realms(conn: &Connection) -> Result<Vec<Realm>, StorageError> {
    let sql = format!("SELECT {REALM_COLUMNS} FROM os_account_realms WHERE db_status = 0 ORDER BY id");
    query_realms(conn, &sql, []).context(|| "list active realms".to_string())
}

/// Writes the identity and scope columns of an existing realm.
pub fn update_realm(conn: &Connection, realm: &Realm) -> Result<(), StorageError> {
    let names_json = names_to_json(&realm.names)?;
    let changed = conn
        .execute(
            "
            UPDATE os_account_realms
            SET realm_names_json = ?2,
                realm_addr = ?3,
                realm_signature = ?4,
                scope_host_id = ?5,
                scope_confidence = ?6
            WHERE id = ?1
            ",
            params![
                realm.id,
                names_json,
                realm.address,
                realm.signature,
                realm.scope_host_id,
                realm.scope_confidence.id(),
            ],
        )
        .context(|| format!("update realm {}", realm.id))?;
    if changed == 0 {
        return Err(StorageError::NotFound {
            entity: "realm",
            id: realm.id,
        });
    }
    Ok(())
}

pub fn mark_realm_merged(
    conn: &Connection,
    source_id: RealmId,
    destination_id: RealmId,
    tombstone_signature: &str,
) -> Result<(), StorageError> {
    let changed = conn
        .execute(
            "
            UPDATE os_account_realms
            SET db_status = ?3,
                merged_into = ?2,
                realm_signature = ?4
            WHERE id = ?1
            ",
            params![
                source_id,
                destination_id,
                DbStatus::Merged.id(),
                tombstone_signature
            ],
        )
        .context(|| format!("retire realm {source_id} into {destination_id}"))?;
    if changed == 0 {
        return Err(StorageError::NotFound {
            entity: "realm",
            id: source_id,
        });
    }
    Ok(())
}

fn query_realms(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Realm>, rusqlite::Error> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, realm_from_row)?;
    rows.collect()
}

fn names_to_json(names: &[String]) -> Result<String, StorageError> {
    serde_json::to_string(names).map_err(|err| StorageError::Serialization(err.to_string()))
}

fn realm_from_row(row: &Row<'_>) -> rusqlite::Result<Realm> {
    let names_json: String = row.get(1)?;
    let names: Vec<String> = serde_json::from_str(&names_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(err))
    })?;
    let scope_confidence: i64 = row.get(5)?;
    let db_status: i64 = row.get(6)?;

    Ok(Realm {
        id: row.get(0)?,
        names,
        address: row.get(2)?,
        signature: row.get(3)?,
        scope_host_id: row.get(4)?,
        scope_confidence: ScopeConfidence::from_id(scope_confidence)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(5, scope_confidence))?,
        db_status: DbStatus::from_id(db_status)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(6, db_status))?,
        merged_into: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CaseStore;

    fn insert(
        conn: &Connection,
        names: &[&str],
        address: Option<&str>,
        host: Option<HostId>,
        signature: &str,
    ) -> Realm {
        let names: Vec<String> = names.iter().map(|name| name.to_string()).collect();
        try_insert_realm(
            conn,
            &NewRealm {
                names: &names,
                address,
                scope_host_id: host,
                scope_confidence: ScopeConfidence::Known,
                signature,
            },
        )
        .expect("insert realm")
        .inserted()
        .expect("new realm")
    }

    #[test]
    fn name_lookup_is_case_insensitive_and_prefers_host_scope() {
        let db = CaseStore::open_in_memory().expect("open db");
        let domain = insert(db.connection(), &["CORP"], None, None, "corp_domain");
        let local = insert(db.connection(), &["Corp"], None, Some(1), "corp_1");

        let found = realms_by_name(db.connection(), "corp", Some(1)).expect("lookup");
        assert_eq!(
            found.iter().map(|realm| realm.id).collect::<Vec<_>>(),
            vec![local.id, domain.id]
        );

        let unscoped = realms_by_name(db.connection(), "CORP", None).expect("lookup");
        assert_eq!(unscoped.len(), 1);
        assert_eq!(unscoped[0].id, domain.id);

        let other_host = realms_by_name(db.connection(), "CORP", Some(2)).expect("lookup");
        assert_eq!(other_host.len(), 1);
        assert_eq!(other_host[0].id, domain.id);
    }

    #[test]
    fn duplicate_signature_reports_already_exists() {
        let db = CaseStore::open_in_memory().expect("open db");
        insert(db.connection(), &["CORP"], None, None, "corp_domain");
        let names = vec!["corp".to_string()];
        let outcome = try_insert_realm(
            db.connection(),
            &NewRealm {
                names: &names,
                address: None,
                scope_host_id: None,
                scope_confidence: ScopeConfidence::Known,
                signature: "corp_domain",
            },
        )
        .expect("insert outcome");
        assert_eq!(outcome, InsertOutcome::AlreadyExists);
    }

    #[test]
    fn merged_realms_drop_out_of_lookups() {
        let db = CaseStore::open_in_memory().expect("open db");
        let source = insert(
            db.connection(),
            &[],
            Some("S-1-5-21-1-2-3"),
            None,
            "s-1-5-21-1-2-3_domain",
        );
        let destination = insert(db.connection(), &["CORP"], None, None, "corp_domain");
        mark_realm_merged(db.connection(), source.id, destination.id, "tombstone")
            .expect("merge realm");

        assert!(realm_by_address(db.connection(), "s-1-5-21-1-2-3", None)
            .expect("lookup")
            .is_none());
        let retired = realm_by_id(db.connection(), source.id)
            .expect("load")
            .expect("row kept");
        assert_eq!(retired.db_status, DbStatus::Merged);
        assert_eq!(retired.merged_into, Some(destination.id));
        assert_eq!(
            active_realms(db.connection()).expect("active").len(),
            1
        );
    }

    #[test]
    fn known_host_realm_check_ignores_excluded_address() {
        let db = CaseStore::open_in_memory().expect("open db");
        insert(
            db.connection(),
            &[],
            Some("SPECIAL_WINDOWS_ACCOUNTS"),
            Some(4),
            "special_windows_accounts_4",
        );
        assert!(!host_has_known_realm(db.connection(), 4, "SPECIAL_WINDOWS_ACCOUNTS")
            .expect("check"));
        insert(db.connection(), &["WS01"], None, Some(4), "ws01_4");
        assert!(host_has_known_realm(db.connection(), 4, "SPECIAL_WINDOWS_ACCOUNTS")
            .expect("check"));
    }
}
