//! Persistence seam.

use crate::cancel::CancelFlag;
use crate::entry::Entry;
use crate::error::TrackerResult;
use std::future::Future;
use std::pin::Pin;

/// Future returned by [`DataStore::save_changes_async`].
pub type SaveFuture<'a> = Pin<Box<dyn Future<Output = TrackerResult<usize>> + Send + 'a>>;

/// Persists dirty entries.
///
/// Each entry handed over has a non-null primary key and, where the store
/// may compute values, a StoreGeneratedValues sidecar. Stores report
/// computed values through [`Entry::set_store_generated`].
pub trait DataStore: Send + Sync {
    /// Persists `entries` and returns the number of affected rows.
    fn save_changes(&self, entries: &mut [&mut Entry]) -> TrackerResult<usize>;

    /// Persists `entries` without blocking.
    ///
    /// The default checks `cancel` and then calls
    /// [`save_changes`](Self::save_changes).
    fn save_changes_async<'a, 'e: 'a>(
        &'a self,
        entries: &'a mut [&'e mut Entry],
        cancel: &'a CancelFlag,
    ) -> SaveFuture<'a> {
        Box::pin(async move {
            cancel.check()?;
            self.save_changes(entries)
        })
    }
}
