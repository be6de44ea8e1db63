use crate::error::{FixtureError, Result};
use crate::fixture::Fixture;
use crate::value::{Record, Value};
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::Connection;
use std::path::Path;

/// Handles inserting or updating database records.
///
/// Writers must respect table aliases (consult
/// [`Config::table_alias`](crate::Config::table_alias)) and mutate `record`
/// in place with any backend-assigned field values, so deferred callbacks
/// can read them. The record being written is passed separately and is not
/// visible through `fixture` during the call.
pub trait Writer {
    fn insert(&mut self, fixture: &Fixture, table: &str, key: &str, record: &mut Record)
        -> Result<()>;
    fn update(&mut self, fixture: &Fixture, table: &str, key: &str, record: &mut Record)
        -> Result<()>;
}

/// A relational writer backed by SQLite.
///
/// Inserts use `RETURNING *` so backend-assigned columns (autoincrement
/// primary keys, column defaults) flow back into the record.
pub struct SqliteWriter {
    conn: Connection,
}

impl SqliteWriter {
    pub fn new(conn: Connection) -> SqliteWriter {
        SqliteWriter { conn }
    }

    pub fn open(path: &Path) -> Result<SqliteWriter> {
        Ok(SqliteWriter {
            conn: Connection::open(path)?,
        })
    }

    pub fn open_in_memory() -> Result<SqliteWriter> {
        Ok(SqliteWriter {
            conn: Connection::open_in_memory()?,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn write_returning(
        &mut self,
        sql: &str,
        params: Vec<Value>,
        table: &str,
        key: &str,
        record: &mut Record,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let row = rows
            .next()?
            .ok_or_else(|| FixtureError::Other(format!("no rows returned for {table}/{key}")))?;

        for (i, column) in columns.iter().enumerate() {
            record.insert(column.clone(), column_value(row.get_ref(i)?));
        }

        Ok(())
    }
}

impl Writer for SqliteWriter {
    fn insert(
        &mut self,
        fixture: &Fixture,
        table: &str,
        key: &str,
        record: &mut Record,
    ) -> Result<()> {
        let table_name = fixture.config.table_alias(table).unwrap_or(table).to_string();

        let sql;
        let params: Vec<Value>;

        if record.is_empty() {
            sql = format!("INSERT INTO {table_name} DEFAULT VALUES RETURNING *");
            params = Vec::new();
        } else {
            let columns: Vec<&str> = record.keys().map(String::as_str).collect();
            let placeholders: Vec<String> =
                (1..=columns.len()).map(|i| format!("?{i}")).collect();
            sql = format!(
                "INSERT INTO {table_name} ({}) VALUES ({}) RETURNING *",
                columns.join(", "),
                placeholders.join(", ")
            );
            params = record.values().cloned().collect();
        }

        log::debug!("inserting {table}/{key}: {sql}");

        self.write_returning(&sql, params, table, key, record)
    }

    fn update(
        &mut self,
        fixture: &Fixture,
        table: &str,
        key: &str,
        record: &mut Record,
    ) -> Result<()> {
        let table_name = fixture.config.table_alias(table).unwrap_or(table).to_string();
        let primary_key = fixture.config.primary_key_name(table)?.to_string();

        let pk_value = record
            .get(&primary_key)
            .cloned()
            .ok_or_else(|| FixtureError::FieldNotFound {
                table: table.to_string(),
                key: key.to_string(),
                field: primary_key.clone(),
            })?;

        let columns: Vec<String> = record
            .keys()
            .filter(|column| **column != primary_key)
            .cloned()
            .collect();
        if columns.is_empty() {
            return Ok(());
        }

        let assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{column} = ?{}", i + 1))
            .collect();
        let sql = format!(
            "UPDATE {table_name} SET {} WHERE {primary_key} = ?{} RETURNING *",
            assignments.join(", "),
            columns.len() + 1
        );

        log::debug!("updating {table}/{key}: {sql}");

        let mut params: Vec<Value> = Vec::with_capacity(columns.len() + 1);
        for column in &columns {
            if let Some(value) = record.get(column) {
                params.push(value.clone());
            }
        }
        params.push(pk_value);

        self.write_returning(&sql, params, table, key, record)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(*b as i64)),
            Value::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::String(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            Value::Timestamp(ts) => ToSqlOutput::Owned(SqlValue::Text(ts.to_rfc3339())),
            Value::Array(_) | Value::Map(_) => {
                let json = serde_json::to_string(&self.to_json())
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                ToSqlOutput::Owned(SqlValue::Text(json))
            }
            Value::Computed(_) => {
                return Err(rusqlite::Error::ToSqlConversionFailure(
                    "computed value was not resolved before writing".into(),
                ))
            }
        })
    }
}

fn column_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(blob) => Value::Bytes(blob.to_vec()),
    }
}
