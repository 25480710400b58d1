//! Entity declarations and schema introspection.
//!
//! # Responsibility
//! - Define the `Record`/`Entity` contracts that stores are generic over.
//! - Derive table name, ordered columns and the external-name → column map
//!   from an entity's declared fields.
//! - Cache derived schemas per entity type for the process lifetime.
//!
//! # Invariants
//! - A cached `Schema` is never mutated or evicted.
//! - Field lookups fail closed: unknown names resolve to `None`.
//! - Table and column names match `[A-Za-z_][A-Za-z0-9_]*`, so they can be
//!   quoted into SQL without escaping surprises.

use crate::error::{StorageError, StorageResult};
use crate::storage::Storage;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::Value;
use rusqlite::Row;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Name of the identity column every entity carries.
pub const ID_COLUMN: &str = "id";

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid"));

static SCHEMA_CACHE: Lazy<RwLock<HashMap<TypeId, Arc<Schema>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// One persisted field: its column and, optionally, the name callers use
/// for it (usually the serialized name).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub column: &'static str,
    pub external: Option<&'static str>,
}

impl FieldSpec {
    /// Field known to callers only by its column name.
    pub const fn column(column: &'static str) -> Self {
        Self {
            column,
            external: None,
        }
    }

    /// Field whose external name differs from the column name.
    pub const fn renamed(column: &'static str, external: &'static str) -> Self {
        Self {
            column,
            external: Some(external),
        }
    }
}

/// Row-shaped value with declared columns.
///
/// Implemented by entities and by projections used for narrow batch updates.
pub trait Record: Sized + 'static {
    fn fields() -> &'static [FieldSpec];

    /// Column values, in `fields()` order.
    fn values(&self) -> Vec<Value>;
}

/// Persistent record stored in its own table.
pub trait Entity: Record {
    fn table_name() -> &'static str;

    fn id(&self) -> i64;

    fn set_id(&mut self, id: i64);

    /// Decodes a row selected with the schema's column list.
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

    /// Persists related records owned by this entity.
    ///
    /// Called after the entity itself is saved by a full save that asked
    /// for associations; `storage` is bound to the same session.
    fn save_associations(&self, storage: &Storage) -> StorageResult<()> {
        let _ = storage;
        Ok(())
    }
}

/// Derived table metadata for one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    table: String,
    columns: Vec<String>,
    field_map: HashMap<String, String>,
}

impl Schema {
    /// Derives a schema from a table name and field declarations.
    ///
    /// Both the external name and the column name of every field resolve to
    /// the column, so callers may use either.
    pub fn derive(table: &str, fields: &[FieldSpec]) -> StorageResult<Self> {
        if table.is_empty() {
            return Err(StorageError::internal("entity declares no table name"));
        }
        if !IDENTIFIER.is_match(table) {
            return Err(StorageError::internal(format!(
                "table name `{table}` is not a plain identifier"
            )));
        }
        if fields.is_empty() {
            return Err(StorageError::internal(format!(
                "entity for table `{table}` declares no fields"
            )));
        }

        let mut columns = Vec::with_capacity(fields.len());
        let mut field_map = HashMap::with_capacity(fields.len() * 2);
        for field in fields {
            if !IDENTIFIER.is_match(field.column) {
                return Err(StorageError::internal(format!(
                    "column name `{}` in table `{table}` is not a plain identifier",
                    field.column
                )));
            }
            if columns.iter().any(|existing| existing == field.column) {
                return Err(StorageError::internal(format!(
                    "column `{}` is declared twice in table `{table}`",
                    field.column
                )));
            }
            columns.push(field.column.to_string());
            if let Some(external) = field.external {
                field_map.insert(external.to_string(), field.column.to_string());
            }
            field_map.insert(field.column.to_string(), field.column.to_string());
        }

        if !columns.iter().any(|column| column == ID_COLUMN) {
            return Err(StorageError::internal(format!(
                "entity for table `{table}` declares no `{ID_COLUMN}` column"
            )));
        }

        Ok(Self {
            table: table.to_string(),
            columns,
            field_map,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|existing| existing == column)
    }

    /// Resolves an external field name (or a column name) to its column.
    pub fn column_for(&self, field_name: &str) -> Option<&str> {
        self.field_map.get(field_name).map(String::as_str)
    }

    /// Position of the `id` column within `columns()`.
    pub fn id_index(&self) -> usize {
        self.columns
            .iter()
            .position(|column| column == ID_COLUMN)
            .unwrap_or_default()
    }

    /// Singular, human-facing name of one row, e.g. `users` -> `user`.
    pub fn entry_name(&self) -> String {
        singularize(&self.table)
    }
}

/// Returns the cached schema of `M`, deriving it on first use.
///
/// # Panics
/// Panics when `M` declares no usable table or fields; that is a
/// declaration bug surfaced the first time the entity is used.
pub fn schema_for<M: Entity>() -> Arc<Schema> {
    let key = TypeId::of::<M>();
    if let Some(schema) = read_cache().get(&key) {
        return Arc::clone(schema);
    }

    let derived = match Schema::derive(M::table_name(), M::fields()) {
        Ok(schema) => Arc::new(schema),
        Err(err) => panic!(
            "invalid entity declaration {}: {err}",
            std::any::type_name::<M>()
        ),
    };

    let mut cache = SCHEMA_CACHE
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    Arc::clone(cache.entry(key).or_insert(derived))
}

/// Double-quotes an identifier for SQL.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn read_cache() -> std::sync::RwLockReadGuard<'static, HashMap<TypeId, Arc<Schema>>> {
    SCHEMA_CACHE
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn singularize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies") {
        if !stem.is_empty() {
            return format!("{stem}y");
        }
    }
    for suffix in ["sses", "shes", "ches", "xes"] {
        if word.ends_with(suffix) {
            return word[..word.len() - 2].to_string();
        }
    }
    if word.ends_with("ss") || word.ends_with("us") {
        return word.to_string();
    }
    word.strip_suffix('s').unwrap_or(word).to_string()
}
