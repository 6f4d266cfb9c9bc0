//! Loop store contract.

use crate::domain::Loop;
use crate::error::Result;

/// CRUD access to persisted loop records. Updates replace the whole record;
/// last writer wins, with no built-in optimistic locking.
pub trait LoopStore: Send + Sync {
    /// Persist a new record. Fails when the id already exists.
    fn create(&self, record: &Loop) -> Result<()>;

    /// Fetch a record by id.
    fn get(&self, id: &str) -> Result<Option<Loop>>;

    /// All records, in insertion order.
    fn list(&self) -> Result<Vec<Loop>>;

    /// Replace an existing record. Fails when the id is unknown.
    fn update(&self, record: &Loop) -> Result<()>;

    /// Remove a record. Removing an unknown id is not an error.
    fn delete(&self, id: &str) -> Result<()>;
}
