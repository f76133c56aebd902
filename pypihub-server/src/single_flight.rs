//! Per-key request coalescing.
//!
//! The first caller for a key becomes the leader: its work is spawned onto the
//! runtime and registered under the key. Callers arriving while it runs join
//! the registered flight instead of starting their own. The spawned task
//! outlives any individual caller, so a dropped waiter never cancels work
//! that others depend on. The registration is removed by the task itself
//! before its result becomes observable, so a caller that has seen a result
//! always starts a fresh flight.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::error::{AppError, AppResult};

type Flight<T> = Shared<BoxFuture<'static, Result<T, Arc<AppError>>>>;

pub struct SingleFlight<K, T> {
    flights: Arc<DashMap<K, Flight<T>>>,
}

impl<K, T> Clone for SingleFlight<K, T> {
    fn clone(&self) -> Self {
        Self {
            flights: Arc::clone(&self.flights),
        }
    }
}

/// Deregisters a flight when its task finishes, panics included.
struct Landing<K: Eq + Hash, T> {
    flights: Arc<DashMap<K, Flight<T>>>,
    key: K,
}

impl<K: Eq + Hash, T> Drop for Landing<K, T> {
    fn drop(&mut self) {
        self.flights.remove(&self.key);
    }
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
        }
    }

    /// Run `work` for `key`, or join the flight already running for it.
    ///
    /// When joining, `work` is dropped unpolled. Every caller gets its own
    /// copy of the outcome.
    pub async fn run<F>(&self, key: K, work: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>> + Send + 'static,
    {
        let flight = match self.flights.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                debug!(key = ?key, "Joining in-flight operation");
                occupied.get().clone()
            }
            Entry::Vacant(vacant) => {
                let landing = Landing {
                    flights: Arc::clone(&self.flights),
                    key,
                };
                let handle = tokio::spawn(async move {
                    let result = work.await.map_err(Arc::new);
                    drop(landing);
                    result
                });
                let flight = async move {
                    handle.await.unwrap_or_else(|e| {
                        Err(Arc::new(AppError::InternalError(format!(
                            "In-flight operation did not complete: {e}"
                        ))))
                    })
                }
                .boxed()
                .shared();
                vacant.insert(flight.clone());
                flight
            }
        };

        flight.await.map_err(|e| AppError::from_shared(&e))
    }

    /// Number of keys with work currently running.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}
