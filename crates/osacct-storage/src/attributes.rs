use crate::{SqlContext, StorageError};
use osacct_core::{AccountAttribute, AttributeValue, ObjectId};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};

pub fn insert_attribute(
    conn: &Connection,
    attribute: &AccountAttribute,
) -> Result<i64, StorageError> {
    let mut value_byte: Option<&[u8]> = None;
    let mut value_text: Option<String> = None;
    let mut value_int32: Option<i32> = None;
    let mut value_int64: Option<i64> = None;
    let mut value_double: Option<f64> = None;
    match &attribute.value {
        AttributeValue::Text(text) => value_text = Some(text.clone()),
        AttributeValue::Json(json) => value_text = Some(json.to_string()),
        AttributeValue::Int32(value) => value_int32 = Some(*value),
        AttributeValue::Int64(value) | AttributeValue::DateTime(value) => {
            value_int64 = Some(*value)
        }
        AttributeValue::Double(value) => value_double = Some(*value),
        AttributeValue::Bytes(bytes) => value_byte = Some(bytes.as_slice()),
    }

    conn.execute(
        "
        INSERT INTO os_account_attributes (
            os_account_obj_id,
            host_id,
            source_obj_id,
            attribute_type_id,
            value_type,
            value_byte,
            value_text,
            value_int32,
            value_int64,
            value_double
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ",
        params![
            attribute.account_id,
            attribute.host_id,
            attribute.source_obj_id,
            attribute.attribute_type_id,
            attribute.value.value_type_id(),
            value_byte,
            value_text,
            value_int32,
            value_int64,
            value_double,
        ],
    )
    .context(|| {
        format!(
            "add attribute {} to account {}",
            attribute.attribute_type_id, attribute.account_id
        )
    })?;
    Ok(conn.last_insert_rowid())
}

pub fn attributes_for_account(
    conn: &Connection,
    account_id: ObjectId,
) -> Result<Vec<AccountAttribute>, StorageError> {
    let load = || -> Result<Vec<AccountAttribute>, rusqlite::Error> {
        let mut stmt = conn.prepare(
            "
            SELECT
                os_account_obj_id,
                host_id,
                source_obj_id,
                attribute_type_id,
                value_type,
                value_byte,
                value_text,
                value_int32,
                value_int64,
                value_double
            FROM os_account_attributes
            WHERE os_account_obj_id = ?1
            ORDER BY id
            ",
        )?;
        let rows = stmt.query_map([account_id], attribute_from_row)?;
        rows.collect()
    };
    load().context(|| format!("list attributes of account {account_id}"))
}

pub fn repoint_attributes(
    conn: &Connection,
    source_id: ObjectId,
    destination_id: ObjectId,
) -> Result<usize, StorageError> {
    conn.execute(
        "UPDATE os_account_attributes SET os_account_obj_id = ?2 WHERE os_account_obj_id = ?1",
        params![source_id, destination_id],
    )
    .context(|| format!("repoint attributes from {source_id} to {destination_id}"))
}

fn attribute_from_row(row: &Row<'_>) -> rusqlite::Result<AccountAttribute> {
    let value_type: i64 = row.get(4)?;
    let value = match value_type {
        0 => AttributeValue::Text(row.get(6)?),
        1 => AttributeValue::Int32(row.get(7)?),
        2 => AttributeValue::Int64(row.get(8)?),
        3 => AttributeValue::Double(row.get(9)?),
        4 => AttributeValue::Bytes(row.get(5)?),
        5 => AttributeValue::DateTime(row.get(8)?),
        6 => {
            let text: String = row.get(6)?;
            AttributeValue::Json(serde_json::from_str(&text).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(err))
            })?)
        }
        other => return Err(rusqlite::Error::IntegralValueOutOfRange(4, other)),
    };

    Ok(AccountAttribute {
        account_id: row.get(0)?,
        host_id: row.get(1)?,
        source_obj_id: row.get(2)?,
        attribute_type_id: row.get(3)?,
        value,
    })
}
