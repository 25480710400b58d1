//! Entity and request models shared by the storage layer.
//!
//! # Responsibility
//! - Declare concrete entities stored by this crate.
//! - Define the filter/pagination request shapes and page results.

pub mod search;
pub mod user;
