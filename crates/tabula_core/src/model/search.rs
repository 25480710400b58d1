//! Search request and page result models.
//!
//! # Responsibility
//! - Describe filters and pagination as callers send them (camelCase JSON).
//! - Describe the page metadata returned next to search results.
//!
//! # Invariants
//! - `Paging::Internal` is a distinct variant; no `Pagination` value, not
//!   even one with every field zeroed, disables pagination.
//! - `page_size` never exceeds `MAX_PAGE_SIZE` once validated.

use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Sort direction applied to `Pagination::order_by`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE", try_from = "String")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

impl FromStr for SortOrder {
    type Err = StorageError;

    /// Accepts `asc`/`desc` in any case; an empty string means the default.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(StorageError::invalid_argument(format!(
                "unsupported sort order \"{other}\"; expected asc|desc"
            ))),
        }
    }
}

impl TryFrom<String> for SortOrder {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Page request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Pagination {
    /// Must be in `0..=1000`.
    pub page_size: u32,
    /// Zero-based page index.
    pub page: u32,
    /// External field name to sort by; `None` keeps storage order.
    pub order_by: Option<String>,
    pub order: SortOrder,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            page: 0,
            order_by: None,
            order: SortOrder::Asc,
        }
    }
}

impl Pagination {
    pub fn new(order_by: impl Into<String>, order: SortOrder) -> Self {
        Self {
            order_by: Some(order_by.into()),
            order,
            ..Self::default()
        }
    }

    pub fn page(page: u32, page_size: u32) -> Self {
        Self {
            page,
            page_size,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.page_size > MAX_PAGE_SIZE {
            return Err(StorageError::invalid_argument(format!(
                "pageSize must be in 0..={MAX_PAGE_SIZE}, got {}",
                self.page_size
            )));
        }
        Ok(())
    }

    /// Rows skipped before this page.
    pub fn offset(&self) -> i64 {
        i64::from(self.page) * i64::from(self.page_size)
    }
}

/// Whether a search is paginated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Paging {
    /// Trusted internal callers: every row, no count, no limit.
    Internal,
    Paged(Pagination),
}

impl Default for Paging {
    fn default() -> Self {
        Self::Paged(Pagination::default())
    }
}

impl From<Pagination> for Paging {
    fn from(value: Pagination) -> Self {
        Self::Paged(value)
    }
}

impl<'de> Deserialize<'de> for Paging {
    /// Requests coming from outside are always paginated.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Pagination::deserialize(deserializer).map(Self::Paged)
    }
}

/// Comparison applied by one `FieldFilter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum SearchCondition {
    /// Case-insensitive substring match.
    Contains,
    Eq,
    Neq,
}

impl FromStr for SearchCondition {
    type Err = StorageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "contains" => Ok(Self::Contains),
            "eq" => Ok(Self::Eq),
            "neq" => Ok(Self::Neq),
            other => Err(StorageError::invalid_argument(format!(
                "unsupported search operation \"{other}\""
            ))),
        }
    }
}

impl TryFrom<String> for SearchCondition {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldFilter {
    /// External field name, resolved through the entity schema.
    pub field_name: String,
    pub condition: SearchCondition,
    #[serde(default)]
    pub value: String,
}

impl FieldFilter {
    pub fn new(
        field_name: impl Into<String>,
        condition: SearchCondition,
        value: impl Into<String>,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            condition,
            value: value.into(),
        }
    }

    /// Builds a filter from an untyped condition name.
    pub fn parse(
        field_name: impl Into<String>,
        condition: &str,
        value: impl Into<String>,
    ) -> StorageResult<Self> {
        let field_name = field_name.into();
        let condition = condition.parse::<SearchCondition>().map_err(|_| {
            StorageError::invalid_argument(format!(
                "unsupported search operation \"{condition}\" for field \"{field_name}\""
            ))
        })?;
        Ok(Self::new(field_name, condition, value))
    }
}

/// Filters plus pagination for one search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub filters: Vec<FieldFilter>,
    #[serde(flatten)]
    pub paging: Paging,
}

impl SearchParams {
    /// Every row matching `filters`, unpaginated.
    pub fn internal(filters: Vec<FieldFilter>) -> Self {
        Self {
            filters,
            paging: Paging::Internal,
        }
    }

    pub fn paged(filters: Vec<FieldFilter>, pagination: Pagination) -> Self {
        Self {
            filters,
            paging: Paging::Paged(pagination),
        }
    }
}

/// Page metadata computed after a paginated search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub page: u32,
    pub page_size: u32,
    pub total_count: i64,
    pub elements_count: usize,
    pub has_more: bool,
    pub is_empty: bool,
}

impl PageInfo {
    pub fn new(pagination: &Pagination, total_count: i64, elements_count: usize) -> Self {
        let seen = pagination.offset() + elements_count as i64;
        Self {
            page: pagination.page,
            page_size: pagination.page_size,
            total_count,
            elements_count,
            has_more: seen < total_count,
            is_empty: elements_count == 0,
        }
    }
}

/// Search results with optional page metadata (absent for `Paging::Internal`).
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage<M> {
    pub items: Vec<M>,
    pub page: Option<PageInfo>,
}
