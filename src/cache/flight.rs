//! Keyed request coalescing.
//!
//! Concurrent callers asking for the same key share one in-flight computation.
//! The registry holds only a weak handle to it: a caller that gives up does not
//! abort the work for the others, and once the last caller is gone the work is
//! dropped and the next caller starts over.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};

type Flight<V> = Shared<BoxFuture<'static, V>>;

pub struct SingleFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    calls: DashMap<String, (u64, WeakShared<BoxFuture<'static, V>>)>,
    next_id: AtomicU64,
}

impl<V> Default for SingleFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            calls: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<V> SingleFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make()` for `key` unless an equal call is already in flight, in
    /// which case its result is shared. The flag is `true` when this caller
    /// started the computation.
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> (V, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (id, flight, fresh) = self.join_or_start(key, make);
        let value = flight.await;
        self.calls.remove_if(key, |_, (current, _)| *current == id);
        (value, fresh)
    }

    /// Number of keys with a registered computation.
    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }

    fn join_or_start<F, Fut>(&self, key: &str, make: F) -> (u64, Flight<V>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        match self.calls.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let (id, weak) = occupied.get();
                if let Some(flight) = weak.upgrade() {
                    return (*id, flight, false);
                }
                let (id, flight) = self.start(make);
                match flight.downgrade() {
                    Some(weak) => {
                        occupied.insert((id, weak));
                    }
                    None => {
                        occupied.remove();
                    }
                }
                (id, flight, true)
            }
            Entry::Vacant(vacant) => {
                let (id, flight) = self.start(make);
                if let Some(weak) = flight.downgrade() {
                    vacant.insert((id, weak));
                }
                (id, flight, true)
            }
        }
    }

    fn start<F, Fut>(&self, make: F) -> (u64, Flight<V>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        (id, make().boxed().shared())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::sync::Barrier;

    use super::*;

    #[tokio::test]
    async fn concurrent_callers_share_one_computation() {
        let flights = Arc::new(SingleFlight::<u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flights = Arc::clone(&flights);
            let calls = Arc::clone(&calls);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                flights
                    .run("k", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        42
                    })
                    .await
            }));
        }

        let mut fresh = 0;
        for handle in handles {
            let (value, started) = handle.await.expect("join");
            assert_eq!(value, 42);
            fresh += usize::from(started);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fresh, 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn sequential_calls_run_again() {
        let flights = SingleFlight::<usize>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for expected in 1..=2 {
            let calls = Arc::clone(&calls);
            let (value, fresh) = flights
                .run("k", move || async move { calls.fetch_add(1, Ordering::SeqCst) + 1 })
                .await;
            assert_eq!(value, expected);
            assert!(fresh);
        }
    }

    #[tokio::test]
    async fn different_keys_do_not_coalesce() {
        let flights = SingleFlight::<&'static str>::new();
        let (a, b) = tokio::join!(
            flights.run("a", || async { "a" }),
            flights.run("b", || async { "b" }),
        );
        assert_eq!((a.0, b.0), ("a", "b"));
        assert!(a.1 && b.1);
    }

    #[tokio::test]
    async fn abandoned_flight_is_restarted() {
        let flights = SingleFlight::<u8>::new();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            flights.run("k", || std::future::pending()),
        )
        .await;
        assert!(abandoned.is_err());

        let (value, fresh) = flights.run("k", || async { 9 }).await;
        assert_eq!(value, 9);
        assert!(fresh);
    }
}
