//! Read-only view of the database layout.
//!
//! # Responsibility
//! - List user tables and their columns.
//! - Check whether a value exists in a named table column.
//!
//! # Invariants
//! - The layout is read once per `Storage` and cached; tables and columns
//!   are not expected to change while the process runs.
//! - Caller-supplied table/column names reach SQL only after they matched
//!   the cached layout.

use super::session::Session;
use super::{Storage, TableColumns};
use crate::error::{StorageError, StorageResult};
use crate::schema::quote_ident;
use log::debug;
use rusqlite::{OptionalExtension, ToSql};
use std::collections::BTreeMap;

const LAYOUT_SQL: &str = "SELECT m.name, p.name
FROM sqlite_master AS m
JOIN pragma_table_info(m.name) AS p
WHERE m.type = 'table'
  AND m.name NOT LIKE 'sqlite\\_%' ESCAPE '\\'
ORDER BY m.name, p.cid";

pub struct MetadataStore {
    storage: Storage,
    session: Session,
}

impl MetadataStore {
    pub(crate) fn new(storage: Storage, session: Session) -> Self {
        Self { storage, session }
    }

    /// Every user table mapped to its columns in declaration order.
    pub fn list_tables_and_columns(&self) -> StorageResult<&TableColumns> {
        self.storage
            .shared
            .table_columns
            .get_or_try_init(|| self.load_layout())
    }

    pub fn list_tables(&self) -> StorageResult<Vec<String>> {
        Ok(self.list_tables_and_columns()?.keys().cloned().collect())
    }

    /// # Errors
    /// - `InvalidArgument` when `table` does not exist.
    pub fn list_columns(&self, table: &str) -> StorageResult<Vec<String>> {
        self.list_tables_and_columns()?
            .get(table)
            .cloned()
            .ok_or_else(|| unknown_table(table))
    }

    /// True when at least one row of `table` has `column` equal to `value`.
    ///
    /// # Errors
    /// - `InvalidArgument` when the table or column does not exist.
    pub fn record_by_value_exists(
        &self,
        table: &str,
        column: &str,
        value: impl ToSql,
    ) -> StorageResult<bool> {
        let columns = self
            .list_tables_and_columns()?
            .get(table)
            .ok_or_else(|| unknown_table(table))?;
        if !columns.iter().any(|known| known == column) {
            return Err(StorageError::invalid_argument(format!(
                "column '{column}' does not exist in table '{table}'"
            )));
        }

        let sql = format!(
            "SELECT 1 FROM {} WHERE {} = ?1 LIMIT 1",
            quote_ident(table),
            quote_ident(column)
        );
        let found = self
            .session
            .read(|conn| Ok(conn.query_row(&sql, [&value], |_| Ok(())).optional()?))
            .map_err(|err| err.wrap(format!("failed to look up {table}.{column}")))?;
        Ok(found.is_some())
    }

    fn load_layout(&self) -> StorageResult<TableColumns> {
        let layout = self
            .session
            .read(|conn| {
                let mut stmt = conn.prepare(LAYOUT_SQL)?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;

                let mut layout = BTreeMap::<String, Vec<String>>::new();
                for row in rows {
                    let (table, column) = row?;
                    layout.entry(table).or_default().push(column);
                }
                Ok(layout)
            })
            .map_err(|err| err.wrap("failed to read database layout"))?;

        debug!(
            "event=metadata_load module=metadata status=ok tables={}",
            layout.len()
        );
        Ok(layout)
    }
}

fn unknown_table(table: &str) -> StorageError {
    StorageError::invalid_argument(format!("table '{table}' does not exist"))
}
