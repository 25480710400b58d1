//! Generic record store over one entity table.
//!
//! # Responsibility
//! - Create, read, update and delete rows of `M` through one session.
//! - Run filtered, paginated searches built from query scopes.
//! - Apply narrow batch updates from projection records.
//!
//! # Invariants
//! - Every value reaches SQL as a bound parameter; identifiers come from
//!   the cached schema only.
//! - Batch writes apply all rows or none.
//! - Delete hooks run for each loaded row before the row is removed.

use super::session::Session;
use super::{DeletedRecord, Storage};
use crate::context::Context;
use crate::error::{StorageError, StorageResult};
use crate::model::search::{PageInfo, Paging, SearchPage, SearchParams, SortOrder};
use crate::query::{apply_pagination, apply_search_filters, SelectQuery};
use crate::schema::{quote_ident, schema_for, Entity, Record, Schema, ID_COLUMN};
use log::debug;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::any::TypeId;
use std::marker::PhantomData;
use std::sync::Arc;

/// Record store for entity `M`, bound to one session.
pub struct CrudStore<M: Entity> {
    storage: Storage,
    session: Session,
    schema: Arc<Schema>,
    _entity: PhantomData<fn() -> M>,
}

impl<M: Entity> CrudStore<M> {
    pub(crate) fn new(storage: Storage, session: Session) -> Self {
        Self {
            storage,
            session,
            schema: schema_for::<M>(),
            _entity: PhantomData,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Inserts `model`; a zero id is replaced by the generated one.
    pub fn create_one(&self, model: &mut M) -> StorageResult<()> {
        let values = self.checked_values(model)?;
        let id = self
            .session
            .write(|conn| insert_row(conn, &self.schema, values))
            .map_err(|err| err.wrap(format!("failed to create {}", self.schema.table())))?;
        if model.id() == 0 {
            model.set_id(id);
        }
        debug!(
            "event=record_create module=crud status=ok table={} id={id}",
            self.schema.table()
        );
        Ok(())
    }

    /// Inserts every model, all or nothing.
    pub fn create_many(&self, models: &mut [M]) -> StorageResult<()> {
        if models.is_empty() {
            return Ok(());
        }
        let rows = models
            .iter()
            .map(|model| self.checked_values(model))
            .collect::<StorageResult<Vec<_>>>()?;

        let ids = self
            .session
            .write_batch(|conn| {
                rows.into_iter()
                    .map(|values| insert_row(conn, &self.schema, values))
                    .collect::<StorageResult<Vec<_>>>()
            })
            .map_err(|err| err.wrap(format!("failed to create {}", self.schema.table())))?;

        for (model, id) in models.iter_mut().zip(ids) {
            if model.id() == 0 {
                model.set_id(id);
            }
        }
        debug!(
            "event=record_create module=crud status=ok table={} count={}",
            self.schema.table(),
            models.len()
        );
        Ok(())
    }

    /// Loads the row with `id`.
    ///
    /// # Errors
    /// - `NotFound` naming the entry and id when no row matches.
    pub fn find_by_id(&self, id: i64) -> StorageResult<M> {
        let mut query = SelectQuery::from_schema(&self.schema);
        query.push_predicate(
            format!("{} = ?", query.column_ref(ID_COLUMN)),
            [Value::Integer(id)],
        );

        match self.fetch(&query)?.into_iter().next() {
            Some(model) => Ok(model),
            None => Err(StorageError::not_found(&self.schema.entry_name(), id)),
        }
    }

    /// Loads the rows with the given ids, ordered by id. Missing ids are
    /// skipped.
    pub fn list_by_ids(&self, ids: &[i64]) -> StorageResult<Vec<M>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = SelectQuery::from_schema(&self.schema);
        query.push_predicate(
            format!("{} IN ({})", query.column_ref(ID_COLUMN), placeholders(ids.len())),
            ids.iter().copied().map(Value::Integer),
        );
        self.fetch(&query.ordered_by(ID_COLUMN, SortOrder::Asc))
    }

    pub fn list_all(&self) -> StorageResult<Vec<M>> {
        let query = SelectQuery::from_schema(&self.schema).ordered_by(ID_COLUMN, SortOrder::Asc);
        self.fetch(&query)
    }

    pub fn exists_by_id(&self, id: i64) -> StorageResult<bool> {
        match self.find_by_id(id) {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn count(&self) -> StorageResult<i64> {
        self.count_matching(&SelectQuery::from_schema(&self.schema))
    }

    /// Saves every column of `model`, inserting or replacing by id.
    ///
    /// With `save_associations`, the row and `Entity::save_associations`
    /// run in one transaction on this store's session.
    pub fn update_one(&self, model: &mut M, save_associations: bool) -> StorageResult<()> {
        if !save_associations {
            return self.save_row(model);
        }

        self.storage.atomic(|scoped| {
            let store = scoped.crud::<M>(&Context::background())?;
            store.save_row(model)?;
            model.save_associations(scoped)
        })
    }

    /// Full save of each model, all or nothing.
    pub fn update_many(&self, models: &mut [M]) -> StorageResult<()> {
        if models.is_empty() {
            return Ok(());
        }
        let rows = models
            .iter()
            .map(|model| self.checked_values(model))
            .collect::<StorageResult<Vec<_>>>()?;

        let ids = self
            .session
            .write_batch(|conn| {
                rows.into_iter()
                    .map(|values| upsert_row(conn, &self.schema, values))
                    .collect::<StorageResult<Vec<_>>>()
            })
            .map_err(|err| err.wrap(format!("failed to update {}", self.schema.table())))?;

        for (model, id) in models.iter_mut().zip(ids) {
            if model.id() == 0 {
                model.set_id(id);
            }
        }
        Ok(())
    }

    /// Updates only the columns of `model` holding non-default values.
    ///
    /// With `return_updated`, `model` is replaced by the stored row.
    ///
    /// # Errors
    /// - `InvalidArgument` when `model` has no id.
    /// - `NotFound` when no row has that id.
    pub fn update_partial(&self, model: &mut M, return_updated: bool) -> StorageResult<()> {
        let id = model.id();
        if id == 0 {
            return Err(StorageError::invalid_argument(format!(
                "partial update of {} requires an id",
                self.schema.entry_name()
            )));
        }

        let (columns, mut params): (Vec<&String>, Vec<Value>) = self
            .schema
            .columns()
            .iter()
            .zip(self.checked_values(model)?)
            .filter(|(column, value)| column.as_str() != ID_COLUMN && !is_default_value(value))
            .unzip();

        if columns.is_empty() {
            if return_updated {
                *model = self.find_by_id(id)?;
            } else if !self.exists_by_id(id)? {
                return Err(StorageError::not_found(&self.schema.entry_name(), id));
            }
            return Ok(());
        }

        let assignments = columns
            .iter()
            .map(|column| format!("{} = ?", quote_ident(column)))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "UPDATE {} SET {assignments} WHERE {} = ?",
            quote_ident(self.schema.table()),
            quote_ident(ID_COLUMN)
        );
        params.push(Value::Integer(id));

        if return_updated {
            sql.push_str(&format!(" RETURNING {}", self.column_list()));
            let updated = self.session.write(|conn| {
                Ok(conn
                    .query_row(&sql, params_from_iter(params), |row| M::from_row(row))
                    .optional()?)
            })?;
            match updated {
                Some(updated) => *model = updated,
                None => return Err(StorageError::not_found(&self.schema.entry_name(), id)),
            }
        } else {
            let changed = self
                .session
                .write(|conn| Ok(conn.execute(&sql, params_from_iter(params))?))?;
            if changed == 0 {
                return Err(StorageError::not_found(&self.schema.entry_name(), id));
            }
        }

        debug!(
            "event=record_update module=crud status=ok table={} id={id} columns={}",
            self.schema.table(),
            columns.len()
        );
        Ok(())
    }

    /// Deletes the row with `id` after running delete hooks on it.
    ///
    /// Hook writes and the delete apply together.
    ///
    /// # Errors
    /// - `NotFound` when no row has that id.
    pub fn delete_by_id(&self, id: i64) -> StorageResult<()> {
        let changed = self.delete_with_hooks(&[id])?;
        if changed == 0 {
            return Err(StorageError::not_found(&self.schema.entry_name(), id));
        }
        debug!(
            "event=record_delete module=crud status=ok table={} id={id}",
            self.schema.table()
        );
        Ok(())
    }

    /// Deletes every row whose id is listed. Missing ids are ignored.
    pub fn delete_by_ids(&self, ids: &[i64]) -> StorageResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let changed = self.delete_with_hooks(ids)?;
        debug!(
            "event=record_delete module=crud status=ok table={} requested={} deleted={changed}",
            self.schema.table(),
            ids.len()
        );
        Ok(())
    }

    /// Rows matching every filter, optionally paginated.
    ///
    /// Paginated searches count matching rows before ordering and limiting;
    /// `Paging::Internal` skips both and returns no page metadata.
    pub fn search(&self, params: &SearchParams) -> StorageResult<SearchPage<M>> {
        let mut query = SelectQuery::from_schema(&self.schema);
        apply_search_filters(&mut query, &self.schema, &params.filters)?;

        let Paging::Paged(pagination) = &params.paging else {
            return Ok(SearchPage {
                items: self.fetch(&query)?,
                page: None,
            });
        };

        let counted = query.clone();
        apply_pagination(&mut query, &self.schema, &params.paging)?;
        let total_count = self.count_matching(&counted)?;
        let items = self.fetch(&query)?;
        let page = PageInfo::new(pagination, total_count, items.len());

        debug!(
            "event=record_search module=crud status=ok table={} filters={} total={} returned={}",
            self.schema.table(),
            params.filters.len(),
            total_count,
            items.len()
        );
        Ok(SearchPage {
            items,
            page: Some(page),
        })
    }

    /// Saves records of `P`, which is either `M` itself or a projection.
    ///
    /// `M` records get a full save. A projection updates only its own
    /// columns, keyed by id, and must declare `id` plus columns `M` has.
    ///
    /// # Errors
    /// - `InvalidArgument` for an invalid projection, before any SQL runs.
    /// - `NotFound` when a projected id has no row; nothing is updated.
    pub fn update_elements<P: Record>(&self, elements: &[P]) -> StorageResult<()> {
        if elements.is_empty() {
            return Ok(());
        }

        if TypeId::of::<P>() == TypeId::of::<M>() {
            let rows = elements.iter().map(Record::values).collect::<Vec<_>>();
            return self
                .session
                .write_batch(|conn| {
                    rows.into_iter()
                        .try_for_each(|values| upsert_row(conn, &self.schema, values).map(drop))
                })
                .map_err(|err| err.wrap(format!("failed to update {}", self.schema.table())));
        }

        let columns = projection_columns::<P>(&self.schema)?;
        let Some(id_index) = columns.iter().position(|column| *column == ID_COLUMN) else {
            return Err(StorageError::internal("projection lost its id column"));
        };
        let assignments = columns
            .iter()
            .filter(|column| **column != ID_COLUMN)
            .map(|column| format!("{} = ?", quote_ident(column)))
            .collect::<Vec<_>>();
        if assignments.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            quote_ident(self.schema.table()),
            assignments.join(", "),
            quote_ident(ID_COLUMN)
        );
        let entry_name = self.schema.entry_name();

        self.session.write_batch(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            for element in elements {
                let mut values = element.values();
                if values.len() != columns.len() {
                    return Err(StorageError::internal(format!(
                        "projection for \"{}\" produced {} values for {} columns",
                        self.schema.table(),
                        values.len(),
                        columns.len()
                    )));
                }
                let id = values.remove(id_index);
                values.push(id.clone());
                if stmt.execute(params_from_iter(values))? == 0 {
                    let id = match id {
                        Value::Integer(id) => id,
                        _ => 0,
                    };
                    return Err(StorageError::not_found(&entry_name, id));
                }
            }
            Ok(())
        })?;

        debug!(
            "event=record_update module=crud status=ok table={} projected_columns={} count={}",
            self.schema.table(),
            columns.len(),
            elements.len()
        );
        Ok(())
    }

    /// First row whose `field` equals `value`, by id order.
    pub(crate) fn find_first_by(&self, field: &str, value: Value) -> StorageResult<Option<M>> {
        let column = self
            .schema
            .column_for(field)
            .ok_or_else(|| StorageError::invalid_search_field(field))?;
        let mut query = SelectQuery::from_schema(&self.schema);
        query.push_predicate(format!("{} = ?", query.column_ref(column)), [value]);
        let query = query.ordered_by(ID_COLUMN, SortOrder::Asc).with_limit(1);
        Ok(self.fetch(&query)?.into_iter().next())
    }

    fn save_row(&self, model: &mut M) -> StorageResult<()> {
        let values = self.checked_values(model)?;
        let id = self
            .session
            .write(|conn| upsert_row(conn, &self.schema, values))
            .map_err(|err| err.wrap(format!("failed to update {}", self.schema.table())))?;
        if model.id() == 0 {
            model.set_id(id);
        }
        debug!(
            "event=record_save module=crud status=ok table={} id={id}",
            self.schema.table()
        );
        Ok(())
    }

    fn fetch(&self, query: &SelectQuery) -> StorageResult<Vec<M>> {
        let sql = query.select_sql();
        self.session
            .read(|conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(query.params()), |row| M::from_row(row))?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .map_err(|err| err.wrap(format!("failed to get {}", self.schema.table())))
    }

    fn count_matching(&self, query: &SelectQuery) -> StorageResult<i64> {
        let sql = query.count_sql();
        self.session
            .read(|conn| {
                Ok(conn.query_row(&sql, params_from_iter(query.params()), |row| row.get(0))?)
            })
            .map_err(|err| err.wrap(format!("failed to count {}", self.schema.table())))
    }

    /// Runs delete hooks and the delete in one transaction when hooks are
    /// registered; a zero-row delete is not an error here.
    fn delete_with_hooks(&self, ids: &[i64]) -> StorageResult<usize> {
        if !self.storage.has_delete_hooks() {
            return self.delete_rows(ids);
        }
        self.storage.atomic(|scoped| {
            let store = scoped.crud::<M>(&Context::background())?;
            for entity in store.list_by_ids(ids)? {
                scoped.run_delete_hooks(&DeletedRecord::new(store.schema.table(), &entity))?;
            }
            store.delete_rows(ids)
        })
    }

    fn delete_rows(&self, ids: &[i64]) -> StorageResult<usize> {
        let sql = format!(
            "DELETE FROM {} WHERE {} IN ({})",
            quote_ident(self.schema.table()),
            quote_ident(ID_COLUMN),
            placeholders(ids.len())
        );
        self.session
            .write(|conn| Ok(conn.execute(&sql, params_from_iter(ids))?))
            .map_err(|err| err.wrap(format!("failed to delete {}", self.schema.table())))
    }

    fn checked_values(&self, model: &M) -> StorageResult<Vec<Value>> {
        let values = model.values();
        if values.len() != self.schema.columns().len() {
            return Err(StorageError::internal(format!(
                "{} produced {} values for {} columns",
                std::any::type_name::<M>(),
                values.len(),
                self.schema.columns().len()
            )));
        }
        Ok(values)
    }

    fn column_list(&self) -> String {
        self.schema
            .columns()
            .iter()
            .map(|column| quote_ident(column))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Columns of projection `P`, checked against `schema`.
fn projection_columns<P: Record>(schema: &Schema) -> StorageResult<Vec<&'static str>> {
    let columns = P::fields()
        .iter()
        .map(|field| field.column)
        .collect::<Vec<_>>();
    if columns.is_empty() {
        return Err(StorageError::invalid_argument(format!(
            "could not find any column to query from \"{}\" table",
            schema.table()
        )));
    }
    if !columns.contains(&ID_COLUMN) {
        return Err(StorageError::invalid_argument(format!(
            "cannot perform batch update on table \"{}\" without \"{ID_COLUMN}\" column",
            schema.table()
        )));
    }
    let unknown = columns
        .iter()
        .filter(|column| !schema.has_column(column))
        .copied()
        .collect::<Vec<_>>();
    if !unknown.is_empty() {
        return Err(StorageError::invalid_argument(format!(
            "cannot perform batch update on table \"{}\" because of invalid columns: \"{}\"",
            schema.table(),
            unknown.join(", ")
        )));
    }
    Ok(columns)
}

/// Inserts one row and returns its id. A zero or null id lets SQLite
/// assign one.
fn insert_row(conn: &Connection, schema: &Schema, values: Vec<Value>) -> StorageResult<i64> {
    let (columns, params) = insert_columns(schema, values);
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(schema.table()),
        columns.join(", "),
        placeholders(params.len())
    );
    conn.prepare_cached(&sql)?
        .execute(params_from_iter(params))?;
    Ok(conn.last_insert_rowid())
}

/// Inserts one row or, when its id exists, overwrites every other column.
fn upsert_row(conn: &Connection, schema: &Schema, values: Vec<Value>) -> StorageResult<i64> {
    if is_unassigned_id(values.get(schema.id_index())) {
        return insert_row(conn, schema, values);
    }
    let id = match values.get(schema.id_index()) {
        Some(Value::Integer(id)) => *id,
        _ => {
            return Err(StorageError::invalid_argument(format!(
                "{} id must be an integer",
                schema.entry_name()
            )))
        }
    };

    let updates = schema
        .columns()
        .iter()
        .filter(|column| column.as_str() != ID_COLUMN)
        .map(|column| format!("{0} = excluded.{0}", quote_ident(column)))
        .collect::<Vec<_>>();
    let conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    let columns = schema
        .columns()
        .iter()
        .map(|column| quote_ident(column))
        .collect::<Vec<_>>();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {conflict}",
        quote_ident(schema.table()),
        columns.join(", "),
        placeholders(values.len()),
        quote_ident(ID_COLUMN)
    );
    conn.prepare_cached(&sql)?
        .execute(params_from_iter(values))?;
    Ok(id)
}

fn insert_columns(schema: &Schema, values: Vec<Value>) -> (Vec<String>, Vec<Value>) {
    let skip_id = is_unassigned_id(values.get(schema.id_index()));
    schema
        .columns()
        .iter()
        .zip(values)
        .filter(|(column, _)| !(skip_id && column.as_str() == ID_COLUMN))
        .map(|(column, value)| (quote_ident(column), value))
        .unzip()
}

fn is_unassigned_id(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null) | Some(Value::Integer(0)))
}

/// Zero values a partial update leaves untouched.
fn is_default_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Integer(value) => *value == 0,
        Value::Real(value) => *value == 0.0,
        Value::Text(value) => value.is_empty(),
        Value::Blob(value) => value.is_empty(),
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}
