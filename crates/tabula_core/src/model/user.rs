//! User entity.
//!
//! # Responsibility
//! - Declare the `users` table shape for the generic record store.
//!
//! # Invariants
//! - `email` is unique across rows.
//! - `created_date` is unix epoch seconds; its `_date` suffix makes filters
//!   compare it as a display date.

use crate::schema::{Entity, FieldSpec, Record};
use rusqlite::types::Value;
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

const USER_FIELDS: &[FieldSpec] = &[
    FieldSpec::column("id"),
    FieldSpec::column("email"),
    FieldSpec::renamed("password_hash", "passwordHash"),
    FieldSpec::renamed("created_date", "createdDate"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Zero until the row is inserted.
    pub id: i64,
    pub email: String,
    /// Opaque to storage; hashing belongs to the caller.
    pub password_hash: String,
    pub created_date: i64,
}

impl User {
    /// Creates an unsaved user stamped with the current time.
    pub fn new(email: impl Into<String>, password_hash: impl Into<String>) -> Self {
        let created_date = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or_default();
        Self {
            id: 0,
            email: email.into(),
            password_hash: password_hash.into(),
            created_date,
        }
    }
}

impl Record for User {
    fn fields() -> &'static [FieldSpec] {
        USER_FIELDS
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.id),
            Value::Text(self.email.clone()),
            Value::Text(self.password_hash.clone()),
            Value::Integer(self.created_date),
        ]
    }
}

impl Entity for User {
    fn table_name() -> &'static str {
        "users"
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            email: row.get("email")?,
            password_hash: row.get("password_hash")?,
            created_date: row.get("created_date")?,
        })
    }
}
