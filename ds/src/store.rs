//! The Store trait

use crate::error::StoreError;
use crate::filter::Filter;
use crate::record::Record;

/// Uniform persistence interface over record collections
///
/// Implementations must be safe to share across threads; all methods take
/// `&self`. Writes are last-writer-wins on record id.
pub trait Store: Send + Sync {
    /// Insert or replace a record
    fn put<R: Record>(&self, record: &R) -> Result<(), StoreError>;

    /// Fetch a record by id
    fn get<R: Record>(&self, id: &str) -> Result<Option<R>, StoreError>;

    /// Remove a record; returns whether it existed
    fn delete<R: Record>(&self, id: &str) -> Result<bool, StoreError>;

    /// All records in the collection matching every filter
    fn query<R: Record>(&self, filters: &[Filter]) -> Result<Vec<R>, StoreError>;

    /// All records in the collection
    fn all<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        self.query(&[])
    }

    /// Number of records in the collection
    fn count<R: Record>(&self) -> Result<usize, StoreError> {
        Ok(self.all::<R>()?.len())
    }
}
