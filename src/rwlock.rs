//! Chain-reentrant, cancel-aware read-write lock with blocking and
//! suspension-based acquisition.
//!
//! The lock admits multiple readers or a single writer, with write-preferring
//! fairness. It carries no data of its own: guards are pure admission tokens,
//! and whatever the lock protects lives with the caller (the map in this crate
//! keeps its storage in a separate cell touched only under these guards).
//!
//! # Fairness
//!
//! | Scenario                  | Behavior                                      |
//! |---------------------------|-----------------------------------------------|
//! | No writers waiting        | Readers acquire immediately                   |
//! | Writer waiting            | New readers blocked until the writer finishes |
//! | Existing readers + writer | Writer waits for all reader chains to release |
//! | Multiple writers          | Writers queue in arrival order (FIFO)         |
//!
//! Writer starvation is prevented: a waiting writer blocks new readers.
//! Readers can starve under continuous write pressure; under bounded
//! contention every waiter is eventually admitted.
//!
//! # Reentrancy
//!
//! Acquisitions are keyed by the [`ChainId`] in the caller's [`Cx`]. On the
//! same chain:
//!
//! - read-under-read grants immediately, bypassing writer preference (waiting
//!   would deadlock against the chain's own held read);
//! - read-under-write and write-under-write grant immediately (depth-counted);
//! - **write-under-read fails with [`LockError::WouldDeadlock`]**: the held
//!   read can never release while its chain waits, so the lock reports the
//!   ordering violation instead of hanging. Escalation is release-read, then
//!   acquire-write. Downgrade is the reverse composition; see
//!   [`WriteGuard::downgrade`].
//!
//! # Cancellation
//!
//! Suspension-based acquisition re-checks the [`Cx`] on every poll; a
//! cancelled waiter is unregistered without disturbing queue order and no
//! lock is granted. Blocking acquisition checks cancellation at entry and on
//! handoff wakeups only; a parked thread is otherwise woken by lock handoff
//! or disposal.
//!
//! # Disposal
//!
//! [`RwLock::dispose`] is idempotent and terminal. Queued waiters wake with
//! [`LockError::Disposed`], as does every later acquisition. Disposing while
//! guards are outstanding is a usage error and is logged; the outstanding
//! guards still release without corrupting state.

use parking_lot::{Condvar, Mutex as ParkingMutex};
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use crate::cx::{ChainId, Cx};

/// Error returned when acquiring a read or write guard fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// Cancelled while waiting.
    Cancelled,
    /// The lock has been disposed.
    Disposed,
    /// The lock was poisoned (a panic occurred while holding a write guard).
    Poisoned,
    /// The acquiring chain already holds a read slot and requested a write;
    /// waiting would deadlock against its own read.
    WouldDeadlock,
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "lock acquisition cancelled"),
            Self::Disposed => write!(f, "lock disposed"),
            Self::Poisoned => write!(f, "lock poisoned"),
            Self::WouldDeadlock => {
                write!(f, "write requested while the same chain holds a read")
            }
        }
    }
}

impl std::error::Error for LockError {}

/// Error returned when trying to read without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryReadError {
    /// The lock is write-held by another chain or a writer is waiting.
    Locked,
    /// The lock has been disposed.
    Disposed,
    /// The lock was poisoned.
    Poisoned,
}

impl std::fmt::Display for TryReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Locked => write!(f, "lock is write-held"),
            Self::Disposed => write!(f, "lock disposed"),
            Self::Poisoned => write!(f, "lock poisoned"),
        }
    }
}

impl std::error::Error for TryReadError {}

/// Error returned when trying to write without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryWriteError {
    /// The lock is held by readers or another writer, or writers are queued.
    Locked,
    /// The lock has been disposed.
    Disposed,
    /// The lock was poisoned.
    Poisoned,
    /// The calling chain holds a read slot; see [`LockError::WouldDeadlock`].
    WouldDeadlock,
}

impl std::fmt::Display for TryWriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Locked => write!(f, "lock is held"),
            Self::Disposed => write!(f, "lock disposed"),
            Self::Poisoned => write!(f, "lock poisoned"),
            Self::WouldDeadlock => {
                write!(f, "write requested while the same chain holds a read")
            }
        }
    }
}

impl std::error::Error for TryWriteError {}

/// Point-in-time copy of the lock's acquisition counters.
///
/// Counters are relaxed atomics: cheap to maintain, eventually consistent
/// across threads, exact once the operations being counted have completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockStats {
    /// Fresh (non-reentrant) read grants.
    pub read_grants: u64,
    /// Fresh (non-reentrant) write grants.
    pub write_grants: u64,
    /// Grants satisfied by reentrancy on the holder's own chain.
    pub reentrant_grants: u64,
    /// Acquisitions that went pending at least once before being granted.
    pub contended_waits: u64,
    /// Waits abandoned by cancellation.
    pub cancelled_waits: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    read_grants: AtomicU64,
    write_grants: AtomicU64,
    reentrant_grants: AtomicU64,
    contended_waits: AtomicU64,
    cancelled_waits: AtomicU64,
}

#[derive(Debug, Clone)]
struct Waiter {
    waker: Waker,
    id: u64,
}

#[derive(Debug, Clone)]
struct WriterHold {
    chain: ChainId,
    depth: usize,
    nested_reads: usize,
}

#[derive(Debug, Default, Clone)]
struct State {
    // Chains holding real read slots, with per-chain reentrancy depth.
    // Invariant: non-empty implies `writer` is None.
    read_chains: HashMap<ChainId, usize>,
    writer: Option<WriterHold>,
    writer_waiters: usize,
    reader_waiters: VecDeque<Waiter>,
    writer_queue: VecDeque<Waiter>,
    next_waiter_id: u64,
}

enum ReadGrant {
    Fresh,
    Reentrant,
    Nested,
}

impl State {
    fn try_grant_read(&mut self, chain: ChainId) -> Option<ReadGrant> {
        match self.writer.as_mut() {
            Some(writer) if writer.chain == chain => {
                writer.nested_reads += 1;
                Some(ReadGrant::Nested)
            }
            Some(_) => None,
            None => {
                if let Some(depth) = self.read_chains.get_mut(&chain) {
                    // Same chain already reads: waiting on writer preference
                    // here would deadlock against our own held slot.
                    *depth += 1;
                    Some(ReadGrant::Reentrant)
                } else if self.writer_waiters == 0 {
                    self.read_chains.insert(chain, 1);
                    Some(ReadGrant::Fresh)
                } else {
                    None
                }
            }
        }
    }
}

/// A chain-reentrant, cancel-aware read-write lock.
///
/// Guards are admission tokens: the lock holds no data. See the module docs
/// for the fairness, reentrancy, cancellation, and disposal contracts.
#[derive(Debug)]
pub struct RwLock {
    state: ParkingMutex<State>,
    poisoned: AtomicBool,
    disposed: AtomicBool,
    stats: StatCounters,
}

impl RwLock {
    /// Creates an open, unheld lock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ParkingMutex::new(State::default()),
            poisoned: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            stats: StatCounters::default(),
        }
    }

    /// Returns true if a panic occurred while a write guard was held.
    #[inline]
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Returns true once [`dispose`](Self::dispose) has run.
    #[inline]
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Snapshot of the acquisition counters.
    #[must_use]
    pub fn stats(&self) -> LockStats {
        LockStats {
            read_grants: self.stats.read_grants.load(Ordering::Relaxed),
            write_grants: self.stats.write_grants.load(Ordering::Relaxed),
            reentrant_grants: self.stats.reentrant_grants.load(Ordering::Relaxed),
            contended_waits: self.stats.contended_waits.load(Ordering::Relaxed),
            cancelled_waits: self.stats.cancelled_waits.load(Ordering::Relaxed),
        }
    }

    /// Acquires a read guard asynchronously, waiting if necessary.
    ///
    /// Cancel-safe: cancellation while waiting returns
    /// [`LockError::Cancelled`] without acquiring the lock.
    pub fn read<'a, 'b>(&'a self, cx: &'b Cx) -> ReadFuture<'a, 'b> {
        ReadFuture {
            lock: self,
            cx,
            waiter_id: None,
        }
    }

    /// Acquires a write guard asynchronously, waiting if necessary.
    ///
    /// Cancel-safe: cancellation while waiting returns
    /// [`LockError::Cancelled`] without acquiring the lock.
    pub fn write<'a, 'b>(&'a self, cx: &'b Cx) -> WriteFuture<'a, 'b> {
        WriteFuture {
            lock: self,
            cx,
            waiter_id: None,
            counted: false,
        }
    }

    /// Acquires a read guard, blocking the calling thread.
    ///
    /// Cancellation is checked at entry and on handoff wakeups; a parked
    /// thread otherwise waits until the lock hands over or is disposed.
    pub fn blocking_read(&self, cx: &Cx) -> Result<ReadGuard<'_>, LockError> {
        block_on(self.read(cx))
    }

    /// Acquires a write guard, blocking the calling thread.
    ///
    /// Cancellation is checked at entry and on handoff wakeups; a parked
    /// thread otherwise waits until the lock hands over or is disposed.
    pub fn blocking_write(&self, cx: &Cx) -> Result<WriteGuard<'_>, LockError> {
        block_on(self.write(cx))
    }

    /// Tries to acquire a read guard without waiting.
    ///
    /// Reentrant grants on `cx`'s chain succeed even while that chain holds
    /// the write slot.
    pub fn try_read(&self, cx: &Cx) -> Result<ReadGuard<'_>, TryReadError> {
        if self.is_poisoned() {
            return Err(TryReadError::Poisoned);
        }

        let chain = cx.chain();
        let grant = {
            let mut state = self.state.lock();
            if self.is_disposed() {
                return Err(TryReadError::Disposed);
            }
            state.try_grant_read(chain)
        };

        match grant {
            Some(ReadGrant::Fresh) => {
                self.stats.read_grants.fetch_add(1, Ordering::Relaxed);
                Ok(ReadGuard {
                    lock: self,
                    chain,
                    kind: ReadKind::Shared,
                })
            }
            Some(ReadGrant::Reentrant) => {
                self.stats.reentrant_grants.fetch_add(1, Ordering::Relaxed);
                Ok(ReadGuard {
                    lock: self,
                    chain,
                    kind: ReadKind::Shared,
                })
            }
            Some(ReadGrant::Nested) => {
                self.stats.reentrant_grants.fetch_add(1, Ordering::Relaxed);
                Ok(ReadGuard {
                    lock: self,
                    chain,
                    kind: ReadKind::Nested,
                })
            }
            None => Err(TryReadError::Locked),
        }
    }

    /// Tries to acquire a write guard without waiting.
    ///
    /// Queued async writers are not bypassed: if writers are waiting, this
    /// reports `Locked` to preserve FIFO order. Reentrant grants on `cx`'s
    /// own write-holding chain succeed.
    pub fn try_write(&self, cx: &Cx) -> Result<WriteGuard<'_>, TryWriteError> {
        if self.is_poisoned() {
            return Err(TryWriteError::Poisoned);
        }

        let chain = cx.chain();
        let mut state = self.state.lock();
        if self.is_disposed() {
            return Err(TryWriteError::Disposed);
        }

        if let Some(writer) = state.writer.as_mut() {
            if writer.chain == chain {
                writer.depth += 1;
                drop(state);
                self.stats.reentrant_grants.fetch_add(1, Ordering::Relaxed);
                return Ok(WriteGuard { lock: self, chain });
            }
            return Err(TryWriteError::Locked);
        }

        if state.read_chains.contains_key(&chain) {
            return Err(TryWriteError::WouldDeadlock);
        }
        if !state.read_chains.is_empty() || state.writer_waiters > 0 {
            return Err(TryWriteError::Locked);
        }

        state.writer = Some(WriterHold {
            chain,
            depth: 1,
            nested_reads: 0,
        });
        drop(state);
        self.stats.write_grants.fetch_add(1, Ordering::Relaxed);
        Ok(WriteGuard { lock: self, chain })
    }

    /// Disposes the lock: idempotent and terminal.
    ///
    /// All queued waiters wake with [`LockError::Disposed`]; every later
    /// acquisition fails the same way. Outstanding guards at disposal time
    /// are a usage error and are logged; they still release cleanly.
    pub fn dispose(&self) {
        self.dispose_inner(true);
    }

    /// Disposal for a caller that holds the write guard itself, so the
    /// outstanding-guard warning stays meaningful.
    pub(crate) fn dispose_quiet(&self) {
        self.dispose_inner(false);
    }

    fn dispose_inner(&self, warn_outstanding: bool) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut wakers: SmallVec<[Waker; 4]> = SmallVec::new();
        {
            let mut state = self.state.lock();
            if warn_outstanding && (state.writer.is_some() || !state.read_chains.is_empty()) {
                tracing::warn!(
                    reader_chains = state.read_chains.len(),
                    writer_held = state.writer.is_some(),
                    "rwlock disposed with outstanding guards"
                );
            }
            wakers.extend(state.reader_waiters.drain(..).map(|w| w.waker));
            wakers.extend(state.writer_queue.drain(..).map(|w| w.waker));
        }

        tracing::trace!("rwlock disposed");
        for waker in wakers {
            waker.wake();
        }
    }

    #[inline]
    fn pop_writer_waiter(state: &mut State) -> Option<Waker> {
        state.writer_queue.pop_front().map(|w| w.waker)
    }

    #[inline]
    fn drain_reader_waiters(state: &mut State) -> SmallVec<[Waker; 4]> {
        state.reader_waiters.drain(..).map(|w| w.waker).collect()
    }

    // Removes one read level for `chain`; pops the next writer once the last
    // reader chain is gone.
    fn release_read_chain(state: &mut State, chain: ChainId) -> Option<Waker> {
        if let Some(depth) = state.read_chains.get_mut(&chain) {
            *depth = depth.saturating_sub(1);
            if *depth == 0 {
                state.read_chains.remove(&chain);
            }
        }
        if state.read_chains.is_empty() && state.writer.is_none() && state.writer_waiters > 0 {
            Self::pop_writer_waiter(state)
        } else {
            None
        }
    }

    fn release_read(&self, chain: ChainId, kind: ReadKind) {
        let waker = {
            let mut state = self.state.lock();
            let under_own_writer = matches!(kind, ReadKind::Nested)
                && state.writer.as_ref().is_some_and(|w| w.chain == chain);
            if under_own_writer {
                if let Some(writer) = state.writer.as_mut() {
                    writer.nested_reads = writer.nested_reads.saturating_sub(1);
                }
                None
            } else {
                // Shared slot, or a nested guard that outlived its write and
                // was converted to a real read slot on the write's release.
                Self::release_read_chain(&mut state, chain)
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn release_write(&self, chain: ChainId) {
        let mut writer_waker = None;
        let mut reader_wakers: SmallVec<[Waker; 4]> = SmallVec::new();
        {
            let mut state = self.state.lock();
            let finished = match state.writer.as_mut() {
                Some(writer) if writer.chain == chain => {
                    writer.depth = writer.depth.saturating_sub(1);
                    writer.depth == 0
                }
                _ => false,
            };

            if finished {
                let nested = state.writer.take().map_or(0, |w| w.nested_reads);
                if nested > 0 {
                    // Nested reads survive the write: the chain downgrades to
                    // a real reader. Queued writers keep waiting for it.
                    state.read_chains.insert(chain, nested);
                    if state.writer_waiters == 0 {
                        reader_wakers = Self::drain_reader_waiters(&mut state);
                    }
                } else if state.writer_waiters > 0 {
                    writer_waker = Self::pop_writer_waiter(&mut state);
                } else {
                    reader_wakers = Self::drain_reader_waiters(&mut state);
                }
            }
        }

        if let Some(waker) = writer_waker {
            waker.wake();
        }
        for waker in reader_wakers {
            waker.wake();
        }
    }

    #[cfg(test)]
    fn debug_state(&self) -> State {
        self.state.lock().clone()
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
enum ReadKind {
    // A real read slot counted in `read_chains`.
    Shared,
    // Granted under the chain's own held write; rides its exclusivity.
    Nested,
}

/// Guard for a held read slot. Releases exactly once, on drop.
#[must_use = "guard will be immediately released if not held"]
#[derive(Debug)]
pub struct ReadGuard<'a> {
    lock: &'a RwLock,
    chain: ChainId,
    kind: ReadKind,
}

impl ReadGuard<'_> {
    /// The chain this guard was granted to.
    #[inline]
    #[must_use]
    pub fn chain(&self) -> ChainId {
        self.chain
    }
}

impl Drop for ReadGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.release_read(self.chain, self.kind);
    }
}

/// Guard for the held write slot. Releases exactly once, on drop.
///
/// Dropping during a panic poisons the lock.
#[must_use = "guard will be immediately released if not held"]
#[derive(Debug)]
pub struct WriteGuard<'a> {
    lock: &'a RwLock,
    chain: ChainId,
}

impl<'a> WriteGuard<'a> {
    /// The chain this guard was granted to.
    #[inline]
    #[must_use]
    pub fn chain(&self) -> ChainId {
        self.chain
    }

    /// Atomically downgrades this write guard to a read guard.
    ///
    /// No other writer can slip in between: the nested read is registered
    /// before the write releases, and the write's release converts it to a
    /// real read slot. Queued writers wait until that read drops; other
    /// readers may be admitted alongside it.
    pub fn downgrade(self) -> ReadGuard<'a> {
        let lock = self.lock;
        let chain = self.chain;
        {
            let mut state = lock.state.lock();
            if let Some(writer) = state.writer.as_mut() {
                if writer.chain == chain {
                    writer.nested_reads += 1;
                }
            }
        }
        lock.stats.reentrant_grants.fetch_add(1, Ordering::Relaxed);
        drop(self);
        ReadGuard {
            lock,
            chain,
            kind: ReadKind::Nested,
        }
    }
}

impl Drop for WriteGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.lock.poisoned.store(true, Ordering::Release);
            tracing::warn!(chain = %self.chain, "rwlock poisoned: write guard dropped during panic");
        }
        self.lock.release_write(self.chain);
    }
}

/// Future returned by [`RwLock::read`].
pub struct ReadFuture<'a, 'b> {
    lock: &'a RwLock,
    cx: &'b Cx,
    waiter_id: Option<u64>,
}

impl<'a> Future for ReadFuture<'a, '_> {
    type Output = Result<ReadGuard<'a>, LockError>;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        if self.lock.is_poisoned() {
            return Poll::Ready(Err(LockError::Poisoned));
        }
        if self.lock.is_disposed() {
            return Poll::Ready(Err(LockError::Disposed));
        }
        if self.cx.checkpoint().is_err() {
            if self.waiter_id.is_some() {
                self.lock.stats.cancelled_waits.fetch_add(1, Ordering::Relaxed);
            }
            return Poll::Ready(Err(LockError::Cancelled));
        }

        let chain = self.cx.chain();
        let mut state = self.lock.state.lock();

        // Disposal drains the queues before waking; registering after the
        // drain would wait forever, so re-check under the state lock.
        if self.lock.is_disposed() {
            drop(state);
            return Poll::Ready(Err(LockError::Disposed));
        }

        if let Some(grant) = state.try_grant_read(chain) {
            drop(state);
            let (counter, kind) = match grant {
                ReadGrant::Fresh => (&self.lock.stats.read_grants, ReadKind::Shared),
                ReadGrant::Reentrant => (&self.lock.stats.reentrant_grants, ReadKind::Shared),
                ReadGrant::Nested => (&self.lock.stats.reentrant_grants, ReadKind::Nested),
            };
            counter.fetch_add(1, Ordering::Relaxed);
            return Poll::Ready(Ok(ReadGuard {
                lock: self.lock,
                chain,
                kind,
            }));
        }

        if let Some(waiter_id) = self.waiter_id {
            if let Some(existing) = state.reader_waiters.iter_mut().find(|w| w.id == waiter_id) {
                if !existing.waker.will_wake(context.waker()) {
                    existing.waker.clone_from(context.waker());
                }
            } else {
                // Dequeued by a release but not grantable yet: re-register
                // at the front so the handoff is not lost.
                let new_id = state.next_waiter_id;
                state.next_waiter_id += 1;
                state.reader_waiters.push_front(Waiter {
                    waker: context.waker().clone(),
                    id: new_id,
                });
                drop(state);
                self.waiter_id = Some(new_id);
                return Poll::Pending;
            }
        } else {
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.reader_waiters.push_back(Waiter {
                waker: context.waker().clone(),
                id,
            });
            drop(state);
            self.waiter_id = Some(id);
            self.lock.stats.contended_waits.fetch_add(1, Ordering::Relaxed);
            return Poll::Pending;
        }
        drop(state);

        Poll::Pending
    }
}

impl Drop for ReadFuture<'_, '_> {
    fn drop(&mut self) {
        let mut writer_waker = None;
        if let Some(waiter_id) = self.waiter_id {
            let mut state = self.lock.state.lock();
            let initial_len = state.reader_waiters.len();
            state.reader_waiters.retain(|w| w.id != waiter_id);
            let removed = initial_len != state.reader_waiters.len();

            // Already popped by a releaser: forward the handoff we absorbed.
            if !removed
                && state.read_chains.is_empty()
                && state.writer.is_none()
                && state.writer_waiters > 0
            {
                writer_waker = RwLock::pop_writer_waiter(&mut state);
            }
        }

        if let Some(waker) = writer_waker {
            waker.wake();
        }
    }
}

/// Future returned by [`RwLock::write`].
pub struct WriteFuture<'a, 'b> {
    lock: &'a RwLock,
    cx: &'b Cx,
    waiter_id: Option<u64>,
    counted: bool,
}

impl<'a> Future for WriteFuture<'a, '_> {
    type Output = Result<WriteGuard<'a>, LockError>;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        if self.lock.is_poisoned() {
            return Poll::Ready(Err(LockError::Poisoned));
        }
        if self.lock.is_disposed() {
            return Poll::Ready(Err(LockError::Disposed));
        }
        if self.cx.checkpoint().is_err() {
            if self.waiter_id.is_some() {
                self.lock.stats.cancelled_waits.fetch_add(1, Ordering::Relaxed);
            }
            return Poll::Ready(Err(LockError::Cancelled));
        }

        let chain = self.cx.chain();
        let mut state = self.lock.state.lock();

        if self.lock.is_disposed() {
            drop(state);
            return Poll::Ready(Err(LockError::Disposed));
        }

        // Reentrant write on the holding chain never queues.
        if let Some(writer) = state.writer.as_mut() {
            if writer.chain == chain {
                writer.depth += 1;
                drop(state);
                self.lock.stats.reentrant_grants.fetch_add(1, Ordering::Relaxed);
                return Poll::Ready(Ok(WriteGuard {
                    lock: self.lock,
                    chain,
                }));
            }
        }

        if state.read_chains.contains_key(&chain) {
            drop(state);
            return Poll::Ready(Err(LockError::WouldDeadlock));
        }

        if !self.counted {
            state.writer_waiters += 1;
            self.counted = true;
        }

        // Detect if we were dequeued by a releaser (our id left the queue).
        let dequeued = self
            .waiter_id
            .is_some_and(|id| !state.writer_queue.iter().any(|w| w.id == id));
        let can_acquire = state.writer.is_none()
            && state.read_chains.is_empty()
            && (dequeued || state.writer_waiters == 1);

        if can_acquire {
            state.writer = Some(WriterHold {
                chain,
                depth: 1,
                nested_reads: 0,
            });
            state.writer_waiters = state.writer_waiters.saturating_sub(1);
            self.counted = false;
            drop(state);
            self.lock.stats.write_grants.fetch_add(1, Ordering::Relaxed);
            return Poll::Ready(Ok(WriteGuard {
                lock: self.lock,
                chain,
            }));
        }

        if let Some(waiter_id) = self.waiter_id {
            if let Some(existing) = state.writer_queue.iter_mut().find(|w| w.id == waiter_id) {
                if !existing.waker.will_wake(context.waker()) {
                    existing.waker.clone_from(context.waker());
                }
            } else {
                // Dequeued but can't acquire: re-register at the front.
                let new_id = state.next_waiter_id;
                state.next_waiter_id += 1;
                state.writer_queue.push_front(Waiter {
                    waker: context.waker().clone(),
                    id: new_id,
                });
                drop(state);
                self.waiter_id = Some(new_id);
                return Poll::Pending;
            }
        } else {
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.writer_queue.push_back(Waiter {
                waker: context.waker().clone(),
                id,
            });
            drop(state);
            self.waiter_id = Some(id);
            self.lock.stats.contended_waits.fetch_add(1, Ordering::Relaxed);
            return Poll::Pending;
        }
        drop(state);

        Poll::Pending
    }
}

impl Drop for WriteFuture<'_, '_> {
    fn drop(&mut self) {
        if !self.counted {
            return;
        }

        let mut writer_waker = None;
        let mut reader_wakers: SmallVec<[Waker; 4]> = SmallVec::new();
        let mut state = self.lock.state.lock();

        if let Some(waiter_id) = self.waiter_id {
            let initial_len = state.writer_queue.len();
            state.writer_queue.retain(|w| w.id != waiter_id);
            let removed = initial_len != state.writer_queue.len();

            state.writer_waiters = state.writer_waiters.saturating_sub(1);

            // Popped-but-never-granted: forward the handoff to the next writer.
            if !removed
                && state.writer.is_none()
                && state.read_chains.is_empty()
                && state.writer_waiters > 0
            {
                writer_waker = RwLock::pop_writer_waiter(&mut state);
            }
        } else {
            state.writer_waiters = state.writer_waiters.saturating_sub(1);
        }

        // Last waiting writer gone: readers are admissible again.
        if state.writer_waiters == 0 && state.writer.is_none() {
            reader_wakers = RwLock::drain_reader_waiters(&mut state);
        }
        drop(state);

        if let Some(waker) = writer_waker {
            waker.wake();
        }
        for waker in reader_wakers {
            waker.wake();
        }
    }
}

// Thread-parking waker for the blocking acquisition path. Permit model: an
// unpark before park is not lost.
#[derive(Clone)]
struct Parker {
    inner: Arc<ParkerInner>,
}

struct ParkerInner {
    notified: ParkingMutex<bool>,
    condvar: Condvar,
}

impl Parker {
    fn new() -> Self {
        Self {
            inner: Arc::new(ParkerInner {
                notified: ParkingMutex::new(false),
                condvar: Condvar::new(),
            }),
        }
    }

    fn park(&self) {
        let mut notified = self.inner.notified.lock();
        while !*notified {
            self.inner.condvar.wait(&mut notified);
        }
        *notified = false;
    }

    fn unpark(&self) {
        let mut notified = self.inner.notified.lock();
        *notified = true;
        drop(notified);
        self.inner.condvar.notify_one();
    }
}

struct ParkWaker(Parker);

impl Wake for ParkWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

// Drives an acquisition future to completion on the current thread. Blocking
// and async acquisition share one waiter queue and one fairness policy.
pub(crate) fn block_on<F: Future>(future: F) -> F::Output {
    let parker = Parker::new();
    let waker = Waker::from(Arc::new(ParkWaker(parker.clone())));
    let mut context = Context::from_waker(&waker);
    let mut future = std::pin::pin!(future);
    loop {
        match future.as_mut().poll(&mut context) {
            Poll::Ready(value) => return value,
            Poll::Pending => parker.park(),
        }
    }
}
