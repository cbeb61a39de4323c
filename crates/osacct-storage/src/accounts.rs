use crate::objects::{ObjectIdAllocator, ObjectType};
use crate::{checked_identifier, table_exists, try_insert, InsertOutcome, SqlContext, StorageError};
use osacct_core::model::{epoch_seconds, from_epoch_seconds};
use osacct_core::{DbStatus, ObjectId, OsAccount, OsAccountStatus, OsAccountType, RealmId};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

const ACCOUNT_COLUMNS: &str = "
    os_account_obj_id,
    realm_id,
    addr,
    login_name,
    full_name,
    type,
    status,
    created_date,
    signature,
    db_status,
    merged_into
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount<'a> {
    pub realm_id: RealmId,
    pub address: Option<&'a str>,
    pub login_name: Option<&'a str>,
    pub full_name: Option<&'a str>,
    pub signature: &'a str,
}

/// Inserts an account row, allocating its object id inside the same savepoint.
pub fn try_insert_account(
    conn: &Connection,
    allocator: &dyn ObjectIdAllocator,
    account: &NewAccount<'_>,
) -> Result<InsertOutcome<OsAccount>, StorageError> {
    try_insert(conn, "insert account", |conn| {
        let id = allocator.allocate(conn, None, ObjectType::OsAccount)?;
        conn.execute(
            "
            INSERT INTO os_accounts (
                os_account_obj_id,
                realm_id,
                addr,
                login_name,
                full_name,
                signature,
                db_status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                id,
                account.realm_id,
                account.address,
                account.login_name,
                account.full_name,
                account.signature,
                DbStatus::Active.id(),
            ],
        )?;
        Ok(OsAccount {
            id,
            realm_id: account.realm_id,
            address: account.address.map(ToString::to_string),
            login_name: account.login_name.map(ToString::to_string),
            full_name: account.full_name.map(ToString::to_string),
            account_type: None,
            status: None,
            created: None,
            signature: account.signature.to_string(),
            db_status: DbStatus::Active,
            merged_into: None,
        })
    })
}

pub fn account_by_id(
    conn: &Connection,
    account_id: ObjectId,
) -> Result<Option<OsAccount>, StorageError> {
    conn.query_row(
        &format!("SELECT {ACCOUNT_COLUMNS} FROM os_accounts WHERE os_account_obj_id = ?1"),
        [account_id],
        account_from_row,
    )
    .optional()
    .context(|| format!("load account {account_id}"))
}

pub fn account_by_address(
    conn: &Connection,
    realm_id: RealmId,
    address: &str,
) -> Result<Option<OsAccount>, StorageError> {
    conn.query_row(
        &format!(
            "
            SELECT {ACCOUNT_COLUMNS}
            FROM os_accounts
            WHERE realm_id = ?1
              AND addr = ?2 COLLATE NOCASE
              AND db_status = 0
            ORDER BY os_account_obj_id
            LIMIT 1
            "
        ),
        params![realm_id, address],
        account_from_row,
    )
    .optional()
    .context(|| format!("find account {address} in realm {realm_id}"))
}

/// The active account holding `signature` in the realm, whatever identifier produced it.
pub fn account_by_signature(
    conn: &Connection,
    realm_id: RealmId,
    signature: &str,
) -> Result<Option<OsAccount>, StorageError> {
    conn.query_row(
        &format!(
            "SELECT {ACCOUNT_COLUMNS} FROM os_accounts WHERE realm_id = ?1 AND signature = ?2"
        ),
        params![realm_id, signature],
        account_from_row,
    )
    .optional()
    .context(|| format!("find signature {signature} in realm {realm_id}"))
}

/// Active accounts in the realm with this login, those without an address last.
pub fn accounts_by_login(
    conn: &Connection,
    realm_id: RealmId,
    login_name: &str,
) -> Result<Vec<OsAccount>, StorageError> {
    let sql = format!(
        "
        SELECT {ACCOUNT_COLUMNS}
        FROM os_accounts
        WHERE realm_id = ?1
          AND login_name = ?2 COLLATE NOCASE
          AND db_status = 0
        ORDER BY addr IS NULL, os_account_obj_id
        "
    );
    query_accounts(conn, &sql, params![realm_id, login_name])
        .context(|| format!("find login {login_name} in realm {realm_id}"))
}

pub fn accounts_in_realm(
    conn: &Connection,
    realm_id: RealmId,
) -> Result<Vec<OsAccount>, StorageError> {
    let sql = format!(
        "
        SELECT {ACCOUNT_COLUMNS}
        FROM os_accounts
        WHERE realm_id = ?1 AND db_status = 0
        ORDER BY os_account_obj_id
        "
    );
    query_accounts(conn, &sql, [realm_id])
        .context(|| format!("list accounts of realm {realm_id}"))
}

pub fn active_accounts(conn: &Connection) -> Result<Vec<OsAccount>, StorageError> {
    let sql = format!(
        "SELECT {ACCOUNT_COLUMNS} FROM os_accounts WHERE db_status = 0 ORDER BY os_account_obj_id"
    );
    query_accounts(conn, &sql, []).context(|| "list active accounts".to_string())
}

/// Writes every mutable column of an account row.
pub fn update_account(conn: &Connection, account: &OsAccount) -> Result<(), StorageError> {
    let changed = conn
        .execute(
            "
            UPDATE os_accounts
            SET realm_id = ?2,
                addr = ?3,
                login_name = ?4,
                full_name = ?5,
                type = ?6,
                status = ?7,
                created_date = ?8,
                signature = ?9
            WHERE os_account_obj_id = ?1
            ",
            params![
                account.id,
                account.realm_id,
                account.address,
                account.login_name,
                account.full_name,
                account.account_type.map(OsAccountType::id),
                account.status.map(OsAccountStatus::id),
                account.created.map(epoch_seconds),
                account.signature,
            ],
        )
        .context(|| format!("update account {}", account.id))?;
    if changed == 0 {
        return Err(StorageError::NotFound {
            entity: "account",
            id: account.id,
        });
    }
    Ok(())
}

pub fn mark_account_merged(
    conn: &Connection,
    source_id: ObjectId,
    destination_id: ObjectId,
    tombstone_signature: &str,
) -> Result<(), StorageError> {
    let changed = conn
        .execute(
            "
            UPDATE os_accounts
            SET db_status = ?3,
                merged_into = ?2,
                signature = ?4
            WHERE os_account_obj_id = ?1
            ",
            params![
                source_id,
                destination_id,
                DbStatus::Merged.id(),
                tombstone_signature
            ],
        )
        .context(|| format!("retire account {source_id} into {destination_id}"))?;
    if changed == 0 {
        return Err(StorageError::NotFound {
            entity: "account",
            id: source_id,
        });
    }
    Ok(())
}

/// Points `table.column` rows at the destination account. Returns `None`
/// when the table is not part of this case database.
pub fn repoint_account_column(
    conn: &Connection,
    table: &str,
    column: &str,
    source_id: ObjectId,
    destination_id: ObjectId,
) -> Result<Option<usize>, StorageError> {
    let table = checked_identifier(table)?;
    let column = checked_identifier(column)?;
    if !table_exists(conn, table)? {
        return Ok(None);
    }
    let changed = conn
        .execute(
            &format!("UPDATE {table} SET {column} = ?2 WHERE {column} = ?1"),
            params![source_id, destination_id],
        )
        .context(|| format!("repoint {table}.{column} from {source_id} to {destination_id}"))?;
    Ok(Some(changed))
}

fn query_accounts(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<OsAccount>, rusqlite::Error> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, account_from_row)?;
    rows.collect()
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<OsAccount> {
    let account_type: Option<i64> = row.get(5)?;
    let status: Option<i64> = row.get(6)?;
    let created: Option<i64> = row.get(7)?;
    let db_status: i64 = row.get(9)?;

    Ok(OsAccount {
        id: row.get(0)?,
        realm_id: row.get(1)?,
        address: row.get(2)?,
        login_name: row.get(3)?,
        full_name: row.get(4)?,
        account_type: account_type
            .map(|value| {
                OsAccountType::from_id(value)
                    .ok_or(rusqlite::Error::IntegralValueOutOfRange(5, value))
            })
            .transpose()?,
        status: status
            .map(|value| {
                OsAccountStatus::from_id(value)
                    .ok_or(rusqlite::Error::IntegralValueOutOfRange(6, value))
            })
            .transpose()?,
        created: created
            .map(|value| {
                from_epoch_seconds(value).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        7,
                        Type::Integer,
                        format!("creation time {value} out of range").into(),
                    )
                })
            })
            .transpose()?,
        signature: row.get(8)?,
        db_status: DbStatus::from_id(db_status)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(9, db_status))?,
        merged_into: row.get(10)?,
    })
}
