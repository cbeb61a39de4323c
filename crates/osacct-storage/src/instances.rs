use crate::{SqlContext, StorageError};
use osacct_core::{DataSourceId, InstanceType, ObjectId, OsAccountInstance};
use rusqlite::{params, Connection, OptionalExtension, Row};

const INSTANCE_COLUMNS: &str = "id, os_account_obj_id, data_source_obj_id, instance_type";

/// Idempotent insert. Returns the stored row and whether this call created it.
pub fn insert_instance_if_absent(
    conn: &Connection,
    account_id: ObjectId,
    data_source_id: DataSourceId,
    instance_type: InstanceType,
) -> Result<(OsAccountInstance, bool), StorageError> {
    let changed = conn
        .execute(
            "
            INSERT OR IGNORE INTO os_account_instances (
                os_account_obj_id,
                data_source_obj_id,
                instance_type
            ) VALUES (?1, ?2, ?3)
            ",
            params![account_id, data_source_id, instance_type.id()],
        )
        .context(|| {
            format!("record {instance_type:?} instance of account {account_id} on {data_source_id}")
        })?;

    let instance = conn
        .query_row(
            &format!(
                "
                SELECT {INSTANCE_COLUMNS}
                FROM os_account_instances
                WHERE os_account_obj_id = ?1
                  AND data_source_obj_id = ?2
                  AND instance_type = ?3
                "
            ),
            params![account_id, data_source_id, instance_type.id()],
            instance_from_row,
        )
        .context(|| format!("read back instance of account {account_id} on {data_source_id}"))?;

    Ok((instance, changed > 0))
}

pub fn most_significant_instance(
    conn: &Connection,
    account_id: ObjectId,
    data_source_id: DataSourceId,
) -> Result<Option<OsAccountInstance>, StorageError> {
    conn.query_row(
        &format!(
            "
            SELECT {INSTANCE_COLUMNS}
            FROM os_account_instances
            WHERE os_account_obj_id = ?1 AND data_source_obj_id = ?2
            ORDER BY instance_type
            LIMIT 1
            "
        ),
        params![account_id, data_source_id],
        instance_from_row,
    )
    .optional()
    .context(|| format!("load best instance of account {account_id} on {data_source_id}"))
}

pub fn instances_for_account(
    conn: &Connection,
    account_id: ObjectId,
) -> Result<Vec<OsAccountInstance>, StorageError> {
    let load = || -> Result<Vec<OsAccountInstance>, rusqlite::Error> {
        let mut stmt = conn.prepare(&format!(
            "
            SELECT {INSTANCE_COLUMNS}
            FROM os_account_instances
            WHERE os_account_obj_id = ?1
            ORDER BY data_source_obj_id, instance_type
            "
        ))?;
        let rows = stmt.query_map([account_id], instance_from_row)?;
        rows.collect()
    };
    load().context(|| format!("list instances of account {account_id}"))
}

/// Deletes source rows that would duplicate a destination row once repointed.
pub fn delete_duplicate_instances(
    conn: &Connection,
    source_id: ObjectId,
    destination_id: ObjectId,
) -> Result<usize, StorageError> {
    conn.execute(
        "
        DELETE FROM os_account_instances
        WHERE os_account_obj_id = ?1
          AND EXISTS (
              SELECT 1
              FROM os_account_instances AS destination
              WHERE destination.os_account_obj_id = ?2
                AND destination.data_source_obj_id = os_account_instances.data_source_obj_id
                AND destination.instance_type = os_account_instances.instance_type
          )
        ",
        params![source_id, destination_id],
    )
    .context(|| format!("drop duplicate instances of account {source_id}"))
}

pub fn repoint_instances(
    conn: &Connection,
    source_id: ObjectId,
    destination_id: ObjectId,
) -> Result<usize, StorageError> {
    conn.execute(
        "UPDATE os_account_instances SET os_account_obj_id = ?2 WHERE os_account_obj_id = ?1",
        params![source_id, destination_id],
    )
    .context(|| format!("repoint instances from {source_id} to {destination_id}"))
}

fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<OsAccountInstance> {
    let instance_type: i64 = row.get(3)?;
    Ok(OsAccountInstance {
        id: row.get(0)?,
        account_id: row.get(1)?,
        data_source_id: row.get(2)?,
        instance_type: InstanceType::from_id(instance_type)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(3, instance_type))?,
    })
}
