//! Lazily validated data caches.
//!
//! A [`DataCache`] holds a value fetched from a remote peer. Consumers call
//! [`DataCache::validate`] with a waiter closure: if the value is already
//! valid the call returns `true` and the consumer reads it immediately; if
//! not, the cache starts (or joins) a fetch and parks the waiter to be run
//! when the fetch completes. Any number of concurrent validations share one
//! in-flight fetch.
//!
//! State machine: `Invalid -> Fetching -> Valid`, with [`DataCache::reset`]
//! sending any state back to `Invalid`. Resets are generation-counted so a
//! completion racing a reset is detected as stale and discarded instead of
//! resurrecting old data.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

enum CacheState<T> {
    Invalid,
    Fetching,
    Valid(T),
}

type Waiter = Box<dyn FnOnce() + Send>;
type FetchFn<T> = Box<dyn FnMut(CacheUpdate<T>) + Send>;

struct CacheInner<T> {
    state: CacheState<T>,
    waiters: Vec<Waiter>,
    /// Bumped on every reset and every fetch start; completions carrying an
    /// older generation are stale.
    generation: u64,
    /// Taken out while being invoked so the fetch fn can itself touch the
    /// cache without deadlocking.
    fetch: Option<FetchFn<T>>,
    /// A fetch was requested while the fetch fn was mid-call; the running
    /// invocation owes one more round on return.
    refetch_pending: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A cached value with on-demand, coalesced fetching.
pub struct DataCache<T> {
    inner: Arc<Mutex<CacheInner<T>>>,
}

impl<T> Clone for DataCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> DataCache<T> {
    /// Create an invalid cache whose data is produced by `fetch`.
    ///
    /// `fetch` typically sends a command over a channel and completes the
    /// [`CacheUpdate`] from the command's done handler.
    pub fn new(fetch: impl FnMut(CacheUpdate<T>) + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                state: CacheState::Invalid,
                waiters: Vec::new(),
                generation: 0,
                fetch: Some(Box::new(fetch)),
                refetch_pending: false,
            })),
        }
    }

    /// If the cache is valid, return `true` without running `waiter`.
    /// Otherwise park `waiter` to run when the in-flight (possibly newly
    /// started) fetch completes, and return `false`.
    pub fn validate(&self, waiter: impl FnOnce() + Send + 'static) -> bool {
        let mut inner = lock(&self.inner);
        match inner.state {
            CacheState::Valid(_) => true,
            CacheState::Fetching => {
                inner.waiters.push(Box::new(waiter));
                false
            }
            CacheState::Invalid => {
                inner.state = CacheState::Fetching;
                inner.generation += 1;
                inner.waiters.push(Box::new(waiter));
                start_fetch(&self.inner, inner);
                false
            }
        }
    }

    /// Whether a value is currently available.
    pub fn is_valid(&self) -> bool {
        matches!(lock(&self.inner).state, CacheState::Valid(_))
    }

    /// Invalidate the cache. Parked waiters stay parked: they will be run
    /// by the fresh fetch the next completion or validation triggers.
    pub fn reset(&self) {
        let mut inner = lock(&self.inner);
        inner.generation += 1;
        inner.state = CacheState::Invalid;
        // A fetch may still be in flight; its completion will see the stale
        // generation and, finding waiters parked, start over.
    }
}

impl<T: Clone + Send + 'static> DataCache<T> {
    /// The cached value, if valid.
    pub fn get(&self) -> Option<T> {
        match &lock(&self.inner).state {
            CacheState::Valid(value) => Some(value.clone()),
            _ => None,
        }
    }
}

/// Takes the fetch fn out of the cache, invokes it without the lock held,
/// and puts it back. The caller must have already moved the state to
/// `Fetching` and bumped the generation.
///
/// When the fetch fn is already mid-call on this stack (a reset plus a
/// synchronous stale completion inside the fetch body), the new round is
/// flagged and run by the outer invocation once the current call returns,
/// so the parked waiters always have a live fetch working for them.
fn start_fetch<'a, T: Send + 'static>(
    cache: &'a Arc<Mutex<CacheInner<T>>>,
    mut guard: MutexGuard<'a, CacheInner<T>>,
) {
    let Some(mut fetch) = guard.fetch.take() else {
        guard.refetch_pending = true;
        return;
    };
    loop {
        let generation = guard.generation;
        drop(guard);

        fetch(CacheUpdate {
            cache: Arc::downgrade(cache),
            generation,
        });

        guard = lock(cache);
        if guard.refetch_pending {
            guard.refetch_pending = false;
            continue;
        }
        guard.fetch = Some(fetch);
        return;
    }
}

/// Completion handle for one generation of a [`DataCache`] fetch.
pub struct CacheUpdate<T> {
    cache: Weak<Mutex<CacheInner<T>>>,
    generation: u64,
}

impl<T: Send + 'static> CacheUpdate<T> {
    /// Deliver the fetched value and run the parked waiters.
    ///
    /// If the cache was reset while this fetch was in flight the value is
    /// discarded; when waiters are still parked, a fresh fetch is started
    /// on their behalf.
    pub fn done(self, value: T) {
        let Some(cache) = self.cache.upgrade() else {
            return;
        };
        let mut inner = lock(&cache);

        if inner.generation != self.generation {
            // Stale completion. Parked waiters still need data from the
            // current generation.
            if matches!(inner.state, CacheState::Invalid) && !inner.waiters.is_empty() {
                inner.state = CacheState::Fetching;
                inner.generation += 1;
                start_fetch(&cache, inner);
            }
            return;
        }

        debug_assert!(matches!(inner.state, CacheState::Fetching));
        inner.state = CacheState::Valid(value);
        let waiters = std::mem::take(&mut inner.waiters);
        drop(inner);

        for waiter in waiters {
            waiter();
        }
    }
}
