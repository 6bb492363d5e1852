//! A hash map whose every operation runs under a chain-reentrant
//! read-write lock.
//!
//! [`LockingMap`] pairs an admission [`RwLock`] with private storage. The
//! lock carries no data; storage lives in a separate cell that is only
//! touched while an admission guard is held, and never across a suspension
//! point or a user callback. Read operations share the lock, mutations take
//! it exclusively, and reentrant use on one call chain (a value factory
//! calling back into the map, say) is admitted rather than deadlocked.
//!
//! Every operation comes in two forms: an `async` form that suspends while
//! waiting for admission and observes [`Cx`] cancellation on every poll, and
//! a `blocking_` form that parks the calling thread. Both forms share one
//! waiter queue and one fairness policy.
//!
//! # Removal order
//!
//! The map remembers arrival order. [`try_take`](LockingMap::try_take)
//! removes the oldest key still present: updating a value keeps its
//! position, while removing and re-adding a key sends it to the back.
//! Enumeration yields pairs in the same order.
//!
//! # Values move by clone
//!
//! Lookups return owned clones rather than references: a reference would
//! pin the admission guard for as long as the caller kept it, turning every
//! `get` into a long-lived read hold. Keep values cheap to clone or wrap
//! them in `Arc`.

use parking_lot::RwLock as PlRwLock;
use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::iter::FusedIterator;

use crate::cx::Cx;
use crate::rwlock::{LockError, LockStats, ReadGuard, RwLock, TryReadError};

/// Error returned by [`LockingMap::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddError {
    /// The key is already present; the existing value was left untouched.
    DuplicateKey,
    /// Cancelled while waiting for admission.
    Cancelled,
    /// The map has been disposed.
    Disposed,
    /// The underlying lock was poisoned.
    Poisoned,
    /// The calling chain holds a read slot; see [`LockError::WouldDeadlock`].
    WouldDeadlock,
}

impl fmt::Display for AddError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateKey => write!(f, "key already present"),
            Self::Cancelled => write!(f, "add cancelled"),
            Self::Disposed => write!(f, "map disposed"),
            Self::Poisoned => write!(f, "map lock poisoned"),
            Self::WouldDeadlock => {
                write!(f, "add requested while the same chain holds a read")
            }
        }
    }
}

impl std::error::Error for AddError {}

impl From<LockError> for AddError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Cancelled => Self::Cancelled,
            LockError::Disposed => Self::Disposed,
            LockError::Poisoned => Self::Poisoned,
            LockError::WouldDeadlock => Self::WouldDeadlock,
        }
    }
}

// Stale order entries accumulate on remove; compact once the queue holds
// mostly dead weight.
const COMPACT_MIN_ORDER: usize = 64;

#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    seq: u64,
}

// Storage: the entry table plus an arrival-order queue of (seq, key). A
// queue entry is live only while the table maps its key to the same seq;
// removal leaves the queue entry behind as a stale marker.
#[derive(Debug)]
struct MapCore<K, V, S> {
    entries: HashMap<K, Slot<V>, S>,
    order: VecDeque<(u64, K)>,
    next_seq: u64,
}

impl<K, V, S> MapCore<K, V, S> {
    fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        Self {
            entries: HashMap::with_capacity_and_hasher(capacity, hasher),
            order: VecDeque::with_capacity(capacity),
            next_seq: 0,
        }
    }
}

impl<K: Eq + Hash, V, S: BuildHasher> MapCore<K, V, S> {
    fn get_value<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.entries.get(key).map(|slot| slot.value.clone())
    }

    fn insert_fresh(&mut self, key: K, value: V)
    where
        K: Clone,
    {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.push_back((seq, key.clone()));
        self.entries.insert(key, Slot { value, seq });
    }

    // Updates keep their arrival position; only fresh keys get a new seq.
    fn upsert(&mut self, key: K, value: V) -> Option<V>
    where
        K: Clone,
    {
        if let Some(slot) = self.entries.get_mut(&key) {
            return Some(std::mem::replace(&mut slot.value, value));
        }
        self.insert_fresh(key, value);
        None
    }

    fn insert_if_absent(&mut self, key: K, value: V) -> bool
    where
        K: Clone,
    {
        if self.entries.contains_key(&key) {
            return false;
        }
        self.insert_fresh(key, value);
        true
    }

    fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let removed = self.entries.remove(key).map(|slot| slot.value);
        if removed.is_some() {
            self.maybe_compact();
        }
        removed
    }

    fn remove_exact<Q>(&mut self, key: &Q, value: &V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        if self.entries.get(key).is_some_and(|slot| slot.value == *value) {
            self.remove(key);
            true
        } else {
            false
        }
    }

    fn take_oldest(&mut self) -> Option<(K, V)> {
        while let Some((seq, key)) = self.order.pop_front() {
            let live = self.entries.get(&key).is_some_and(|slot| slot.seq == seq);
            if live {
                if let Some((key, slot)) = self.entries.remove_entry(&key) {
                    return Some((key, slot.value));
                }
            }
        }
        None
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    // Live pairs in arrival order.
    fn pairs(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.order.iter().filter_map(|(seq, key)| {
            self.entries
                .get(key)
                .and_then(|slot| (slot.seq == *seq).then_some((key, &slot.value)))
        })
    }

    fn maybe_compact(&mut self) {
        if self.order.len() > COMPACT_MIN_ORDER
            && self.order.len() >= self.entries.len().saturating_mul(2)
        {
            let entries = &self.entries;
            self.order
                .retain(|(seq, key)| entries.get(key).is_some_and(|slot| slot.seq == *seq));
        }
    }
}

/// A hash map guarded by a chain-reentrant read-write lock.
///
/// See the [module docs](self) for the admission, ordering, and
/// cancellation contracts. Operation docs call out which slot (read or
/// write) they take.
pub struct LockingMap<K, V, S = RandomState> {
    lock: RwLock,
    core: PlRwLock<MapCore<K, V, S>>,
}

impl<K, V> LockingMap<K, V, RandomState> {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }

    /// Creates an empty map with at least the given capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K, V, S> LockingMap<K, V, S> {
    /// Creates an empty map using the given hash builder.
    #[must_use]
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(0, hasher)
    }

    /// Creates an empty map with at least the given capacity, using the
    /// given hash builder.
    #[must_use]
    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        Self {
            lock: RwLock::new(),
            core: PlRwLock::new(MapCore::with_capacity_and_hasher(capacity, hasher)),
        }
    }

    /// The admission lock itself, for callers that need to hold a guard
    /// across several operations or observe disposal directly.
    #[must_use]
    pub fn lock(&self) -> &RwLock {
        &self.lock
    }

    /// Snapshot of the admission lock's acquisition counters.
    #[must_use]
    pub fn lock_stats(&self) -> LockStats {
        self.lock.stats()
    }

    /// Returns true once [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.lock.is_disposed()
    }
}

impl<K, V, S: Default> Default for LockingMap<K, V, S> {
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K: Eq + Hash, V, S: BuildHasher> LockingMap<K, V, S> {
    /// Looks up `key` and returns a clone of its value. Takes a read slot.
    pub async fn get<Q>(&self, cx: &Cx, key: &Q) -> Result<Option<V>, LockError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let _admission = self.lock.read(cx).await?;
        Ok(self.core.read().get_value(key))
    }

    /// Blocking form of [`get`](Self::get).
    pub fn blocking_get<Q>(&self, cx: &Cx, key: &Q) -> Result<Option<V>, LockError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let _admission = self.lock.blocking_read(cx)?;
        Ok(self.core.read().get_value(key))
    }

    /// Stores `value` under `key`, replacing any existing value.
    ///
    /// If the current value already compares equal, the store is skipped
    /// under the read slot alone, leaving [`LockStats::write_grants`]
    /// untouched. Between that check and the store the write slot has to be
    /// won, so a racing chain may commit first; the later store wins.
    pub async fn set(&self, cx: &Cx, key: K, value: V) -> Result<(), LockError>
    where
        K: Clone,
        V: PartialEq,
    {
        {
            let _admission = self.lock.read(cx).await?;
            if self.value_equals(&key, &value) {
                return Ok(());
            }
        }
        let _admission = self.lock.write(cx).await?;
        self.core.write().upsert(key, value);
        Ok(())
    }

    /// Blocking form of [`set`](Self::set).
    pub fn blocking_set(&self, cx: &Cx, key: K, value: V) -> Result<(), LockError>
    where
        K: Clone,
        V: PartialEq,
    {
        {
            let _admission = self.lock.blocking_read(cx)?;
            if self.value_equals(&key, &value) {
                return Ok(());
            }
        }
        let _admission = self.lock.blocking_write(cx)?;
        self.core.write().upsert(key, value);
        Ok(())
    }

    fn value_equals(&self, key: &K, value: &V) -> bool
    where
        V: PartialEq,
    {
        self.core
            .read()
            .entries
            .get(key)
            .is_some_and(|slot| slot.value == *value)
    }

    /// Inserts `key` if absent. Returns whether the insert happened; an
    /// existing value is left untouched. Takes the write slot.
    pub async fn try_add(&self, cx: &Cx, key: K, value: V) -> Result<bool, LockError>
    where
        K: Clone,
    {
        let _admission = self.lock.write(cx).await?;
        Ok(self.core.write().insert_if_absent(key, value))
    }

    /// Blocking form of [`try_add`](Self::try_add).
    pub fn blocking_try_add(&self, cx: &Cx, key: K, value: V) -> Result<bool, LockError>
    where
        K: Clone,
    {
        let _admission = self.lock.blocking_write(cx)?;
        Ok(self.core.write().insert_if_absent(key, value))
    }

    /// Inserts `key`, failing with [`AddError::DuplicateKey`] if present.
    pub async fn add(&self, cx: &Cx, key: K, value: V) -> Result<(), AddError>
    where
        K: Clone,
    {
        let _admission = self.lock.write(cx).await?;
        if self.core.write().insert_if_absent(key, value) {
            Ok(())
        } else {
            Err(AddError::DuplicateKey)
        }
    }

    /// Blocking form of [`add`](Self::add).
    pub fn blocking_add(&self, cx: &Cx, key: K, value: V) -> Result<(), AddError>
    where
        K: Clone,
    {
        let _admission = self.lock.blocking_write(cx)?;
        if self.core.write().insert_if_absent(key, value) {
            Ok(())
        } else {
            Err(AddError::DuplicateKey)
        }
    }

    /// Removes `key`. Returns whether it was present.
    pub async fn remove<Q>(&self, cx: &Cx, key: &Q) -> Result<bool, LockError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let _admission = self.lock.write(cx).await?;
        Ok(self.core.write().remove(key).is_some())
    }

    /// Blocking form of [`remove`](Self::remove).
    pub fn blocking_remove<Q>(&self, cx: &Cx, key: &Q) -> Result<bool, LockError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let _admission = self.lock.blocking_write(cx)?;
        Ok(self.core.write().remove(key).is_some())
    }

    /// Removes `key` and returns its value, if present.
    pub async fn try_remove<Q>(&self, cx: &Cx, key: &Q) -> Result<Option<V>, LockError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let _admission = self.lock.write(cx).await?;
        Ok(self.core.write().remove(key))
    }

    /// Blocking form of [`try_remove`](Self::try_remove).
    pub fn blocking_try_remove<Q>(&self, cx: &Cx, key: &Q) -> Result<Option<V>, LockError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let _admission = self.lock.blocking_write(cx)?;
        Ok(self.core.write().remove(key))
    }

    /// Removes `key` only if it currently maps to a value equal to `value`.
    /// Returns whether the removal happened.
    pub async fn remove_exact<Q>(&self, cx: &Cx, key: &Q, value: &V) -> Result<bool, LockError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        let _admission = self.lock.write(cx).await?;
        Ok(self.core.write().remove_exact(key, value))
    }

    /// Blocking form of [`remove_exact`](Self::remove_exact).
    pub fn blocking_remove_exact<Q>(&self, cx: &Cx, key: &Q, value: &V) -> Result<bool, LockError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        let _admission = self.lock.blocking_write(cx)?;
        Ok(self.core.write().remove_exact(key, value))
    }

    /// Removes and returns the oldest pair still present, or `None` if the
    /// map is empty. Arrival order: updates keep a key's position, a
    /// remove-then-add sends it to the back.
    pub async fn try_take(&self, cx: &Cx) -> Result<Option<(K, V)>, LockError> {
        let _admission = self.lock.write(cx).await?;
        Ok(self.core.write().take_oldest())
    }

    /// Blocking form of [`try_take`](Self::try_take).
    pub fn blocking_try_take(&self, cx: &Cx) -> Result<Option<(K, V)>, LockError> {
        let _admission = self.lock.blocking_write(cx)?;
        Ok(self.core.write().take_oldest())
    }

    /// Inserts `add_value` if `key` is absent, otherwise stores
    /// `update(&key, &current)`. Returns the value that was committed.
    ///
    /// The candidate is computed under a read slot so concurrent readers
    /// proceed, then committed under the write slot. Another chain may
    /// commit between the two; the later commit wins. The factory runs with
    /// no storage borrow held and may call back into the map on the same
    /// chain.
    pub async fn add_or_update<F>(
        &self,
        cx: &Cx,
        key: K,
        add_value: V,
        update: F,
    ) -> Result<V, LockError>
    where
        K: Clone,
        V: Clone,
        F: FnOnce(&K, &V) -> V,
    {
        let candidate = {
            let _admission = self.lock.read(cx).await?;
            self.compute_candidate(&key, |_| add_value, update)
        };
        let _admission = self.lock.write(cx).await?;
        self.core.write().upsert(key, candidate.clone());
        Ok(candidate)
    }

    /// Blocking form of [`add_or_update`](Self::add_or_update).
    pub fn blocking_add_or_update<F>(
        &self,
        cx: &Cx,
        key: K,
        add_value: V,
        update: F,
    ) -> Result<V, LockError>
    where
        K: Clone,
        V: Clone,
        F: FnOnce(&K, &V) -> V,
    {
        let candidate = {
            let _admission = self.lock.blocking_read(cx)?;
            self.compute_candidate(&key, |_| add_value, update)
        };
        let _admission = self.lock.blocking_write(cx)?;
        self.core.write().upsert(key, candidate.clone());
        Ok(candidate)
    }

    /// [`add_or_update`](Self::add_or_update) with the absent-side value
    /// produced by a factory as well.
    pub async fn add_or_update_with<A, F>(
        &self,
        cx: &Cx,
        key: K,
        add: A,
        update: F,
    ) -> Result<V, LockError>
    where
        K: Clone,
        V: Clone,
        A: FnOnce(&K) -> V,
        F: FnOnce(&K, &V) -> V,
    {
        let candidate = {
            let _admission = self.lock.read(cx).await?;
            self.compute_candidate(&key, add, update)
        };
        let _admission = self.lock.write(cx).await?;
        self.core.write().upsert(key, candidate.clone());
        Ok(candidate)
    }

    /// Blocking form of [`add_or_update_with`](Self::add_or_update_with).
    pub fn blocking_add_or_update_with<A, F>(
        &self,
        cx: &Cx,
        key: K,
        add: A,
        update: F,
    ) -> Result<V, LockError>
    where
        K: Clone,
        V: Clone,
        A: FnOnce(&K) -> V,
        F: FnOnce(&K, &V) -> V,
    {
        let candidate = {
            let _admission = self.lock.blocking_read(cx)?;
            self.compute_candidate(&key, add, update)
        };
        let _admission = self.lock.blocking_write(cx)?;
        self.core.write().upsert(key, candidate.clone());
        Ok(candidate)
    }

    // Caller holds a read admission. The current value is cloned out so the
    // factory runs without any storage borrow.
    fn compute_candidate<A, F>(&self, key: &K, add: A, update: F) -> V
    where
        V: Clone,
        A: FnOnce(&K) -> V,
        F: FnOnce(&K, &V) -> V,
    {
        let current = self.core.read().get_value(key);
        match current {
            Some(value) => update(key, &value),
            None => add(key),
        }
    }

    /// Whether `key` is present. Takes a read slot.
    pub async fn contains_key<Q>(&self, cx: &Cx, key: &Q) -> Result<bool, LockError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let _admission = self.lock.read(cx).await?;
        Ok(self.core.read().entries.contains_key(key))
    }

    /// Blocking form of [`contains_key`](Self::contains_key).
    pub fn blocking_contains_key<Q>(&self, cx: &Cx, key: &Q) -> Result<bool, LockError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let _admission = self.lock.blocking_read(cx)?;
        Ok(self.core.read().entries.contains_key(key))
    }

    /// Whether `key` currently maps to a value equal to `value`.
    pub async fn contains_pair<Q>(&self, cx: &Cx, key: &Q, value: &V) -> Result<bool, LockError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        let _admission = self.lock.read(cx).await?;
        Ok(self
            .core
            .read()
            .entries
            .get(key)
            .is_some_and(|slot| slot.value == *value))
    }

    /// Blocking form of [`contains_pair`](Self::contains_pair).
    pub fn blocking_contains_pair<Q>(&self, cx: &Cx, key: &Q, value: &V) -> Result<bool, LockError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        let _admission = self.lock.blocking_read(cx)?;
        Ok(self
            .core
            .read()
            .entries
            .get(key)
            .is_some_and(|slot| slot.value == *value))
    }

    /// Number of live pairs. Takes a read slot.
    pub async fn len(&self, cx: &Cx) -> Result<usize, LockError> {
        let _admission = self.lock.read(cx).await?;
        Ok(self.core.read().entries.len())
    }

    /// Blocking form of [`len`](Self::len).
    pub fn blocking_len(&self, cx: &Cx) -> Result<usize, LockError> {
        let _admission = self.lock.blocking_read(cx)?;
        Ok(self.core.read().entries.len())
    }

    /// Whether the map holds no pairs.
    pub async fn is_empty(&self, cx: &Cx) -> Result<bool, LockError> {
        Ok(self.len(cx).await? == 0)
    }

    /// Blocking form of [`is_empty`](Self::is_empty).
    pub fn blocking_is_empty(&self, cx: &Cx) -> Result<bool, LockError> {
        Ok(self.blocking_len(cx)? == 0)
    }

    /// Removes every pair. Takes the write slot.
    pub async fn clear(&self, cx: &Cx) -> Result<(), LockError> {
        let _admission = self.lock.write(cx).await?;
        self.core.write().clear();
        Ok(())
    }

    /// Blocking form of [`clear`](Self::clear).
    pub fn blocking_clear(&self, cx: &Cx) -> Result<(), LockError> {
        let _admission = self.lock.blocking_write(cx)?;
        self.core.write().clear();
        Ok(())
    }

    /// Clones every pair into a `Vec`, in arrival order, under a single
    /// read slot.
    pub async fn to_vec(&self, cx: &Cx) -> Result<Vec<(K, V)>, LockError>
    where
        K: Clone,
        V: Clone,
    {
        let _admission = self.lock.read(cx).await?;
        Ok(self.snapshot_pairs())
    }

    /// Blocking form of [`to_vec`](Self::to_vec).
    pub fn blocking_to_vec(&self, cx: &Cx) -> Result<Vec<(K, V)>, LockError>
    where
        K: Clone,
        V: Clone,
    {
        let _admission = self.lock.blocking_read(cx)?;
        Ok(self.snapshot_pairs())
    }

    fn snapshot_pairs(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        self.core
            .read()
            .pairs()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Clones every key into a `Vec`, in arrival order.
    pub async fn keys(&self, cx: &Cx) -> Result<Vec<K>, LockError>
    where
        K: Clone,
    {
        let _admission = self.lock.read(cx).await?;
        Ok(self.core.read().pairs().map(|(key, _)| key.clone()).collect())
    }

    /// Blocking form of [`keys`](Self::keys).
    pub fn blocking_keys(&self, cx: &Cx) -> Result<Vec<K>, LockError>
    where
        K: Clone,
    {
        let _admission = self.lock.blocking_read(cx)?;
        Ok(self.core.read().pairs().map(|(key, _)| key.clone()).collect())
    }

    /// Clones every value into a `Vec`, in arrival order.
    pub async fn values(&self, cx: &Cx) -> Result<Vec<V>, LockError>
    where
        V: Clone,
    {
        let _admission = self.lock.read(cx).await?;
        Ok(self
            .core
            .read()
            .pairs()
            .map(|(_, value)| value.clone())
            .collect())
    }

    /// Blocking form of [`values`](Self::values).
    pub fn blocking_values(&self, cx: &Cx) -> Result<Vec<V>, LockError>
    where
        V: Clone,
    {
        let _admission = self.lock.blocking_read(cx)?;
        Ok(self
            .core
            .read()
            .pairs()
            .map(|(_, value)| value.clone())
            .collect())
    }

    /// Iterates pairs in arrival order, holding a read slot for the
    /// iterator's whole lifetime. The pairs are cloned out when the
    /// iterator is created, so the sequence it yields is fixed from the
    /// start.
    ///
    /// Foreign mutations wait until the iterator is dropped. On the
    /// iterator's own chain a mutation fails with
    /// [`LockError::WouldDeadlock`], unless the chain also holds the write
    /// slot: then it commits immediately without disturbing the sequence.
    pub async fn iter(&self, cx: &Cx) -> Result<LockingIter<'_, K, V>, LockError>
    where
        K: Clone,
        V: Clone,
    {
        let admission = self.lock.read(cx).await?;
        let pairs = self.snapshot_pairs();
        Ok(LockingIter {
            _admission: admission,
            pairs: pairs.into_iter(),
        })
    }

    /// Blocking form of [`iter`](Self::iter).
    pub fn blocking_iter(&self, cx: &Cx) -> Result<LockingIter<'_, K, V>, LockError>
    where
        K: Clone,
        V: Clone,
    {
        let admission = self.lock.blocking_read(cx)?;
        let pairs = self.snapshot_pairs();
        Ok(LockingIter {
            _admission: admission,
            pairs: pairs.into_iter(),
        })
    }

    /// Disposes the map: waits for the write slot so in-flight operations
    /// finish, then marks the lock terminal. Idempotent; concurrent and
    /// repeated calls all return `Ok`. Every later operation fails with
    /// `Disposed`.
    ///
    /// Storage is kept: [`into_inner`](Self::into_inner) can still recover
    /// the pairs afterwards.
    pub async fn dispose(&self, cx: &Cx) -> Result<(), LockError> {
        let admission = match self.lock.write(cx).await {
            Ok(guard) => guard,
            Err(LockError::Disposed) => return Ok(()),
            Err(err) => return Err(err),
        };
        self.lock.dispose_quiet();
        drop(admission);
        tracing::trace!("locking map disposed");
        Ok(())
    }

    /// Blocking form of [`dispose`](Self::dispose).
    pub fn blocking_dispose(&self, cx: &Cx) -> Result<(), LockError> {
        let admission = match self.lock.blocking_write(cx) {
            Ok(guard) => guard,
            Err(LockError::Disposed) => return Ok(()),
            Err(err) => return Err(err),
        };
        self.lock.dispose_quiet();
        drop(admission);
        tracing::trace!("locking map disposed");
        Ok(())
    }

    /// Consumes the map and returns a plain `HashMap` of the live pairs.
    ///
    /// Exclusive access: no admission is taken and disposal does not
    /// prevent recovery.
    #[must_use]
    pub fn into_inner(self) -> HashMap<K, V, S>
    where
        S: Clone,
    {
        let core = self.core.into_inner();
        let hasher = core.entries.hasher().clone();
        let mut out = HashMap::with_capacity_and_hasher(core.entries.len(), hasher);
        out.extend(core.entries.into_iter().map(|(key, slot)| (key, slot.value)));
        out
    }
}

impl<K: Eq + Hash + Clone, V, S: BuildHasher> From<HashMap<K, V, S>> for LockingMap<K, V, S>
where
    S: Clone,
{
    fn from(map: HashMap<K, V, S>) -> Self {
        let hasher = map.hasher().clone();
        let mut core = MapCore::with_capacity_and_hasher(map.len(), hasher);
        for (key, value) in map {
            core.insert_fresh(key, value);
        }
        Self {
            lock: RwLock::new(),
            core: PlRwLock::new(core),
        }
    }
}

impl<K: Eq + Hash + Clone, V, S: BuildHasher + Default> FromIterator<(K, V)>
    for LockingMap<K, V, S>
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut core = MapCore::with_capacity_and_hasher(0, S::default());
        for (key, value) in iter {
            core.upsert(key, value);
        }
        Self {
            lock: RwLock::new(),
            core: PlRwLock::new(core),
        }
    }
}

impl<K: Eq + Hash + Clone, V, S: BuildHasher> Extend<(K, V)> for LockingMap<K, V, S> {
    // Exclusive access: no admission is taken.
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        let core = self.core.get_mut();
        for (key, value) in iter {
            core.upsert(key, value);
        }
    }
}

impl<K, V, S> fmt::Debug for LockingMap<K, V, S>
where
    K: fmt::Debug + Eq + Hash,
    V: fmt::Debug,
    S: BuildHasher,
{
    // Best effort: a fresh chain tries for a read slot and falls back to an
    // opaque form rather than blocking inside Debug.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.lock.try_read(&Cx::new()) {
            Ok(_admission) => f.debug_map().entries(self.core.read().pairs()).finish(),
            Err(TryReadError::Locked) => f.debug_struct("LockingMap").finish_non_exhaustive(),
            Err(TryReadError::Disposed) => {
                f.debug_struct("LockingMap").field("disposed", &true).finish()
            }
            Err(TryReadError::Poisoned) => {
                f.debug_struct("LockingMap").field("poisoned", &true).finish()
            }
        }
    }
}

/// Iterator returned by [`LockingMap::iter`]. Holds a read slot until
/// dropped; yields the pairs cloned at creation, in arrival order.
pub struct LockingIter<'a, K, V> {
    _admission: ReadGuard<'a>,
    pairs: std::vec::IntoIter<(K, V)>,
}

impl<K, V> Iterator for LockingIter<'_, K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        self.pairs.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.pairs.size_hint()
    }
}

impl<K, V> ExactSizeIterator for LockingIter<'_, K, V> {}

impl<K, V> FusedIterator for LockingIter<'_, K, V> {}

#[cfg(feature = "serde")]
impl<K, V, S> serde::Serialize for LockingMap<K, V, S>
where
    K: serde::Serialize + Eq + Hash,
    V: serde::Serialize,
    S: BuildHasher,
{
    // Arrival order, under a fresh-chain try-read: a held or queued writer
    // (including one on the serializing thread) surfaces as a serializer
    // error instead of a parked thread.
    fn serialize<Ser>(&self, serializer: Ser) -> Result<Ser::Ok, Ser::Error>
    where
        Ser: serde::Serializer,
    {
        use serde::ser::{Error as _, SerializeMap as _};

        let _admission = self
            .lock
            .try_read(&Cx::new())
            .map_err(Ser::Error::custom)?;
        let core = self.core.read();
        let mut map = serializer.serialize_map(Some(core.entries.len()))?;
        for (key, value) in core.pairs() {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

#[cfg(feature = "serde")]
impl<'de, K, V, S> serde::Deserialize<'de> for LockingMap<K, V, S>
where
    K: serde::Deserialize<'de> + Eq + Hash + Clone,
    V: serde::Deserialize<'de>,
    S: BuildHasher + Default,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use std::marker::PhantomData;

        struct MapVisitor<K, V, S>(PhantomData<(K, V, S)>);

        impl<'de, K, V, S> serde::de::Visitor<'de> for MapVisitor<K, V, S>
        where
            K: serde::Deserialize<'de> + Eq + Hash + Clone,
            V: serde::Deserialize<'de>,
            S: BuildHasher + Default,
        {
            type Value = LockingMap<K, V, S>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of key-value pairs")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let capacity = access.size_hint().unwrap_or(0);
                let mut core = MapCore::with_capacity_and_hasher(capacity, S::default());
                while let Some((key, value)) = access.next_entry()? {
                    core.upsert(key, value);
                }
                Ok(LockingMap {
                    lock: RwLock::new(),
                    core: PlRwLock::new(core),
                })
            }
        }

        deserializer.deserialize_map(MapVisitor(PhantomData))
    }
}


#[cfg(all(test, feature = "serde"))]
mod serde_tests {
    use super::*;

    #[test]
    fn serde_roundtrip_preserves_pairs_and_order() {
        crate::test_utils::init_test_logging();
        crate::test_phase!("serde_roundtrip_preserves_pairs_and_order");
        let map: LockingMap<String, i32> = LockingMap::new();
        let cx = Cx::new();
        map.blocking_set(&cx, "b".to_string(), 2).expect("set");
        map.blocking_set(&cx, "a".to_string(), 1).expect("set");

        let json = serde_json::to_string(&map).expect("serialize");
        crate::assert_with_log!(
            json == r#"{"b":2,"a":1}"#,
            "arrival order serialized",
            r#"{"b":2,"a":1}"#,
            json
        );

        let back: LockingMap<String, i32> = serde_json::from_str(&json).expect("deserialize");
        let pairs = back.blocking_to_vec(&cx).expect("to_vec");
        crate::assert_with_log!(
            pairs == vec![("b".to_string(), 2), ("a".to_string(), 1)],
            "pairs roundtrip",
            "[b=2, a=1]",
            pairs
        );
        crate::test_complete!("serde_roundtrip_preserves_pairs_and_order");
    }

    #[test]
    fn serialize_fails_fast_while_write_guard_held() {
        crate::test_utils::init_test_logging();
        crate::test_phase!("serialize_fails_fast_while_write_guard_held");
        let map: LockingMap<String, i32> = LockingMap::new();
        let cx = Cx::new();
        map.blocking_set(&cx, "a".to_string(), 1).expect("set");

        // Serializing from the thread that holds the write guard must
        // error, not park behind its own guard.
        let guard = map.lock().blocking_write(&cx).expect("write");
        let held = serde_json::to_string(&map);
        crate::assert_with_log!(held.is_err(), "refused while write-held", "error", held);
        drop(guard);

        let json = serde_json::to_string(&map).expect("serialize after release");
        crate::assert_with_log!(json == r#"{"a":1}"#, "serializes once free", r#"{"a":1}"#, json);
        crate::test_complete!("serialize_fails_fast_while_write_guard_held");
    }
}
