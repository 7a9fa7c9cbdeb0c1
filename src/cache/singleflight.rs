//! Single-flight coordinator: at most one in-flight computation per key,
//! with concurrent callers sharing the owner's outcome.
//!
//! The flight table lock is held only while installing or removing a cell,
//! never across the computation. The owner's work runs on its own task, so a
//! caller that cancels (drops its future) never abandons the waiters: the
//! computation completes and its outcome is still broadcast.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::trace;
use tracing::warn;

use crate::metrics::SINGLEFLIGHT_READS;
use crate::Result;
use crate::StorageError;

struct Flight<V> {
    outcome: watch::Receiver<Option<Result<V>>>,
}

/// A space of keyed computations with duplicate suppression.
pub(crate) struct Group<K, V> {
    flights: Arc<DashMap<K, Flight<V>>>,
}

impl<K, V> Clone for Group<K, V>
where
    K: Eq + Hash,
{
    fn clone(&self) -> Self {
        Self {
            flights: Arc::clone(&self.flights),
        }
    }
}

impl<K, V> Group<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
        }
    }

    /// Runs `compute` for `key`, unless a computation for the same key is
    /// already in flight, in which case the caller waits for its outcome
    /// instead. Returns the shared result and whether it was shared.
    ///
    /// `compute` must not recursively call `run` for the same key.
    pub(crate) async fn run<F>(
        &self,
        key: K,
        compute: F,
    ) -> (Result<V>, bool)
    where
        F: Future<Output = Result<V>> + Send + 'static,
    {
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let owner_rx = outcome_rx.clone();

        let existing = match self.flights.entry(key.clone()) {
            Entry::Occupied(flight) => Some(flight.get().outcome.clone()),
            Entry::Vacant(slot) => {
                slot.insert(Flight { outcome: outcome_rx });
                None
            }
        };

        if let Some(outcome) = existing {
            SINGLEFLIGHT_READS.with_label_values(&["shared"]).inc();
            return (self.wait(&key, outcome).await, true);
        }

        SINGLEFLIGHT_READS.with_label_values(&["owned"]).inc();

        // The owner's work is detached so cancelling this caller cannot
        // strand followers already waiting on the flight.
        let flights = Arc::clone(&self.flights);
        let flight_key = key.clone();
        let owner = tokio::spawn(async move {
            let result = compute.await;
            flights.remove(&flight_key);
            let _ = outcome_tx.send(Some(result.clone()));
            result
        });

        match owner.await {
            Ok(result) => (result, false),
            Err(join_error) => {
                warn!(%join_error, "single-flight computation aborted");
                self.flights
                    .remove_if(&key, |_, flight| flight.outcome.same_channel(&owner_rx));
                (
                    Err(StorageError::Unavailable(format!("cache fill failed: {join_error}")).into()),
                    false,
                )
            }
        }
    }

    async fn wait(
        &self,
        key: &K,
        mut outcome: watch::Receiver<Option<Result<V>>>,
    ) -> Result<V> {
        loop {
            if let Some(result) = outcome.borrow_and_update().clone() {
                return result;
            }
            if outcome.changed().await.is_err() {
                // The owner vanished without publishing (panicked or was
                // aborted before the send). Clear the dead cell so the next
                // caller can own a fresh flight.
                trace!("single-flight owner disappeared; reporting cancellation");
                self.flights
                    .remove_if(key, |_, flight| flight.outcome.same_channel(&outcome));
                return Err(StorageError::Cancelled.into());
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.flights.len()
    }
}
