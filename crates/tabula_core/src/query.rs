//! Composable query scopes for filtered, paginated selects.
//!
//! # Responsibility
//! - Hold one select under construction (`SelectQuery`) and render it.
//! - Turn `FieldFilter`s and `Paging` into predicates, ordering, limit and
//!   offset on that select.
//!
//! # Invariants
//! - Filter values are always bound parameters.
//! - Column identifiers come only from the entity schema and are quoted.
//! - `count_sql` shares predicates and parameters with `select_sql` but
//!   never its ordering, limit or offset.
//! - A scope that fails leaves the query untouched.

use crate::error::{StorageError, StorageResult};
use crate::model::search::{FieldFilter, Paging, SearchCondition, SortOrder};
use crate::schema::{quote_ident, Schema};
use rusqlite::types::Value;

/// Marker that makes a column compare as a formatted display date.
pub const DATE_COLUMN_MARKER: &str = "_date";

const LIKE_ESCAPE: char = '\\';

/// Select statement under construction for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    table: String,
    alias: Option<String>,
    columns: Vec<String>,
    predicates: Vec<String>,
    params: Vec<Value>,
    order_by: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

impl SelectQuery {
    /// Selects every schema column from the schema's table.
    pub fn from_schema(schema: &Schema) -> Self {
        Self {
            table: schema.table().to_string(),
            alias: None,
            columns: schema.columns().to_vec(),
            predicates: Vec::new(),
            params: Vec::new(),
            order_by: None,
            limit: None,
            offset: None,
        }
    }

    /// Prefixes every column reference with `alias`.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Qualified, quoted reference to `column`.
    pub fn column_ref(&self, column: &str) -> String {
        match &self.alias {
            Some(alias) => format!("{}.{}", quote_ident(alias), quote_ident(column)),
            None => quote_ident(column),
        }
    }

    /// Orders by a schema column.
    pub fn ordered_by(mut self, column: &str, order: SortOrder) -> Self {
        self.order_by = Some(format!("{} {}", self.column_ref(column), order.as_sql()));
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Adds one predicate; `?` placeholders bind `params` in order.
    pub fn push_predicate(&mut self, sql: String, params: impl IntoIterator<Item = Value>) {
        self.predicates.push(sql);
        self.params.extend(params);
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn order_by(&self) -> Option<&str> {
        self.order_by.as_deref()
    }

    pub fn limit(&self) -> Option<i64> {
        self.limit
    }

    pub fn offset(&self) -> Option<i64> {
        self.offset
    }

    pub fn select_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|column| self.column_ref(column))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!("SELECT {columns} FROM {}", self.from_clause());
        self.push_where(&mut sql);
        if let Some(order_by) = &self.order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order_by);
        }
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }
        sql
    }

    pub fn count_sql(&self) -> String {
        let mut sql = format!("SELECT COUNT(*) FROM {}", self.from_clause());
        self.push_where(&mut sql);
        sql
    }

    fn from_clause(&self) -> String {
        match &self.alias {
            Some(alias) => format!("{} AS {}", quote_ident(&self.table), quote_ident(alias)),
            None => quote_ident(&self.table),
        }
    }

    fn push_where(&self, sql: &mut String) {
        if self.predicates.is_empty() {
            return;
        }
        sql.push_str(" WHERE ");
        sql.push_str(&self.predicates.join(" AND "));
    }
}

/// Adds one AND-ed predicate per filter.
///
/// # Errors
/// - `InvalidArgument` naming the first field the schema cannot resolve.
pub fn apply_search_filters(
    query: &mut SelectQuery,
    schema: &Schema,
    filters: &[FieldFilter],
) -> StorageResult<()> {
    let mut predicates = Vec::with_capacity(filters.len());
    for filter in filters {
        let column = schema
            .column_for(&filter.field_name)
            .ok_or_else(|| StorageError::invalid_search_field(&filter.field_name))?;
        let expr = comparable_expr(&query.column_ref(column), column);
        predicates.push(filter_predicate(&expr, filter.condition, &filter.value));
    }

    for (sql, value) in predicates {
        query.push_predicate(sql, [value]);
    }
    Ok(())
}

/// Applies ordering, limit and offset for `paging`.
///
/// `Paging::Internal` leaves the query as is. Counting is not done here:
/// callers count with a copy of the query taken before this scope runs.
///
/// # Errors
/// - `InvalidArgument` when `order_by` is not a known field or the page
///   size is out of range.
pub fn apply_pagination(
    query: &mut SelectQuery,
    schema: &Schema,
    paging: &Paging,
) -> StorageResult<()> {
    let Paging::Paged(pagination) = paging else {
        return Ok(());
    };
    pagination.validate()?;

    let order_by = match pagination.order_by.as_deref().filter(|field| !field.is_empty()) {
        Some(field) => {
            let column = schema
                .column_for(field)
                .ok_or_else(|| StorageError::invalid_search_field(field))?;
            Some(format!(
                "{} {}",
                query.column_ref(column),
                pagination.order.as_sql()
            ))
        }
        None => None,
    };

    if let Some(order_by) = order_by {
        query.order_by = Some(order_by);
    }
    query.limit = Some(i64::from(pagination.page_size));
    if pagination.page != 0 {
        query.offset = Some(pagination.offset());
    }
    Ok(())
}

/// Text expression a filter value is compared against.
///
/// Date-marked columns hold epoch seconds and compare as `DD Mon, YYYY`.
fn comparable_expr(column_ref: &str, column: &str) -> String {
    if column.contains(DATE_COLUMN_MARKER) {
        date_display_expr(column_ref)
    } else {
        format!("CAST({column_ref} AS TEXT)")
    }
}

/// Formats an epoch-seconds column as `DD Mon, YYYY` in UTC, e.g. `05 Mar, 2024`.
pub fn date_display_expr(column_ref: &str) -> String {
    format!(
        "(strftime('%d', {column_ref}, 'unixepoch') || ' ' || \
         substr('JanFebMarAprMayJunJulAugSepOctNovDec', \
         (CAST(strftime('%m', {column_ref}, 'unixepoch') AS INTEGER) - 1) * 3 + 1, 3) || \
         ', ' || strftime('%Y', {column_ref}, 'unixepoch'))"
    )
}

fn filter_predicate(expr: &str, condition: SearchCondition, value: &str) -> (String, Value) {
    match condition {
        SearchCondition::Contains => (
            format!("lower({expr}) LIKE lower(?) ESCAPE '{LIKE_ESCAPE}'"),
            Value::Text(format!("%{}%", escape_like(value))),
        ),
        SearchCondition::Eq => (format!("{expr} = ?"), Value::Text(value.to_string())),
        SearchCondition::Neq => (format!("NOT ({expr} = ?)"), Value::Text(value.to_string())),
    }
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | LIKE_ESCAPE) {
            escaped.push(LIKE_ESCAPE);
        }
        escaped.push(ch);
    }
    escaped
}
