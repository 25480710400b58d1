//! User store: generic record access plus lookups by email.

use super::crud::CrudStore;
use crate::error::StorageResult;
use crate::model::user::User;
use rusqlite::types::Value;
use std::ops::Deref;

pub struct UserStore {
    users: CrudStore<User>,
}

impl UserStore {
    pub(crate) fn new(users: CrudStore<User>) -> Self {
        Self { users }
    }

    /// Returns the user registered with `email`, or `None`.
    pub fn find_by_email(&self, email: &str) -> StorageResult<Option<User>> {
        self.users
            .find_first_by("email", Value::Text(email.to_string()))
            .map_err(|err| err.wrap("failed to find user by email"))
    }
}

impl Deref for UserStore {
    type Target = CrudStore<User>;

    fn deref(&self) -> &Self::Target {
        &self.users
    }
}
