//! Process-local caching primitives: TTL-bounded value cells and the
//! in-flight map that collapses concurrent identical reads.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::Result;

/// A single cached value with a fixed time-to-live.
///
/// Entries do not survive process restart and are invalidated explicitly
/// by writes and deletes; the TTL only bounds staleness against writers
/// in other processes.
pub(crate) struct TtlCell<T> {
    ttl: Duration,
    slot: parking_lot::RwLock<Option<(T, Instant)>>,
}

impl<T: Clone> TtlCell<T> {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: parking_lot::RwLock::new(None),
        }
    }

    /// The cached value, unless absent or older than the TTL.
    pub(crate) fn get(&self) -> Option<T> {
        match &*self.slot.read() {
            Some((value, captured_at)) if captured_at.elapsed() < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    pub(crate) fn put(&self, value: T) {
        *self.slot.write() = Some((value, Instant::now()));
    }

    pub(crate) fn invalidate(&self) {
        *self.slot.write() = None;
    }
}

type SharedRead<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Collapses concurrent identical reads into one underlying operation.
///
/// The first caller for a key becomes the leader and runs the supplied
/// future; later callers attach to the same shared future and observe the
/// leader's result. The leader removes the entry once it settles, so a
/// subsequent request starts a fresh operation.
pub(crate) struct ReadCoalescer<T: Clone> {
    inflight: DashMap<String, SharedRead<T>>,
}

impl<T> ReadCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }

    /// Runs `make()` under the key, or attaches to an operation already in
    /// flight. Returns the result and whether this caller led.
    pub(crate) async fn run(
        &self,
        key: &str,
        make: impl FnOnce() -> BoxFuture<'static, Result<T>>,
    ) -> (Result<T>, bool) {
        let (fut, leads) = self.join_or_lead(key, make);
        let result = fut.await;
        if leads {
            self.inflight.remove(key);
        }
        (result, leads)
    }

    // Separate fn so the map guard drops before anything is awaited.
    fn join_or_lead(
        &self,
        key: &str,
        make: impl FnOnce() -> BoxFuture<'static, Result<T>>,
    ) -> (SharedRead<T>, bool) {
        match self.inflight.entry(key.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let shared = make().shared();
                entry.insert(shared.clone());
                (shared, true)
            }
        }
    }
}
