//! Durable record store contract for Fareline.
//!
//! The pipeline persists business records (processed messages,
//! conversation turns, review flags) through the generic [`Store`]
//! contract. [`SqliteStore`] is the local durable backend;
//! [`MemoryStore`] backs tests and development.

mod error;
mod memory;
mod sqlite;
mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{Filter, SortOrder, Store, StoredRecord};
