//! Capability context threaded through every cancellable operation.
//!
//! A [`Cx`] carries two things the lock layer needs from its caller:
//!
//! - a **cancellation flag**, checked at every wait point via
//!   [`Cx::checkpoint`], and
//! - a **chain identity** ([`ChainId`]), the correlation identifier the lock
//!   compares to decide reentrancy. Thread identity is useless for this: a
//!   suspended operation may resume on a different worker, but it is still the
//!   same logical call chain.
//!
//! Cloning a `Cx` stays on the same chain and shares the same cancellation
//! flag; [`Cx::child`] starts a new chain that still observes the parent's
//! cancellation. Two tasks that genuinely run concurrently must not share a
//! chain, or the lock will treat them as one reentrant holder.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CHAIN_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a logical call chain, used by the lock for reentrancy.
///
/// Allocated once per [`Cx::new`]/[`Cx::child`] from a process-wide counter;
/// never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainId(u64);

impl ChainId {
    #[inline]
    fn fresh() -> Self {
        Self(NEXT_CHAIN_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric identity, for logging.
    #[inline]
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chain-{}", self.0)
    }
}

/// Error returned by [`Cx::checkpoint`] once cancellation has been requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Cancellation signal and chain identity for one logical operation chain.
///
/// Cheap to clone (one `Arc` bump). Cancellation is one-way: once
/// [`cancel`](Cx::cancel) has been called, every [`checkpoint`](Cx::checkpoint)
/// on this context (and on clones and children) fails.
#[derive(Debug, Clone)]
pub struct Cx {
    chain: ChainId,
    cancel_requested: Arc<AtomicBool>,
}

impl Cx {
    /// Creates a context on a fresh chain with cancellation unset.
    #[must_use]
    pub fn new() -> Self {
        Self {
            chain: ChainId::fresh(),
            cancel_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates a context on a **new** chain that shares this context's
    /// cancellation flag.
    ///
    /// Use this when handing work to a task that runs concurrently with the
    /// current chain: it inherits cancellation but is a distinct lock holder.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            chain: ChainId::fresh(),
            cancel_requested: Arc::clone(&self.cancel_requested),
        }
    }

    /// The chain identity the lock keys reentrancy on.
    #[inline]
    #[must_use]
    pub fn chain(&self) -> ChainId {
        self.chain
    }

    /// Requests cancellation. Irrevocable.
    #[inline]
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    /// Returns true if cancellation has been requested.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Fails once cancellation has been requested; otherwise a no-op.
    ///
    /// Wait points call this on every poll so a pending acquisition observes
    /// cancellation promptly.
    #[inline]
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for Cx {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn fresh_contexts_have_distinct_chains() {
        init_test("fresh_contexts_have_distinct_chains");
        let a = Cx::new();
        let b = Cx::new();
        crate::assert_with_log!(a.chain() != b.chain(), "distinct chains", a.chain(), b.chain());
        crate::test_complete!("fresh_contexts_have_distinct_chains");
    }

    #[test]
    fn clone_shares_chain_and_cancellation() {
        init_test("clone_shares_chain_and_cancellation");
        let cx = Cx::new();
        let clone = cx.clone();
        crate::assert_with_log!(
            cx.chain() == clone.chain(),
            "clone stays on chain",
            cx.chain(),
            clone.chain()
        );

        cx.cancel();
        crate::assert_with_log!(clone.is_cancelled(), "clone observes cancel", true, clone.is_cancelled());
        crate::assert_with_log!(
            clone.checkpoint().is_err(),
            "checkpoint fails after cancel",
            "Err(Cancelled)",
            clone.checkpoint()
        );
        crate::test_complete!("clone_shares_chain_and_cancellation");
    }

    #[test]
    fn child_forks_chain_but_inherits_cancellation() {
        init_test("child_forks_chain_but_inherits_cancellation");
        let parent = Cx::new();
        let child = parent.child();
        crate::assert_with_log!(
            parent.chain() != child.chain(),
            "child is a new chain",
            parent.chain(),
            child.chain()
        );

        parent.cancel();
        crate::assert_with_log!(child.is_cancelled(), "child observes cancel", true, child.is_cancelled());
        crate::test_complete!("child_forks_chain_but_inherits_cancellation");
    }

    #[test]
    fn checkpoint_passes_before_cancel() {
        init_test("checkpoint_passes_before_cancel");
        let cx = Cx::new();
        crate::assert_with_log!(
            cx.checkpoint().is_ok(),
            "checkpoint before cancel",
            "Ok(())",
            cx.checkpoint()
        );
        crate::assert_with_log!(!cx.is_cancelled(), "not cancelled", false, cx.is_cancelled());
        crate::test_complete!("checkpoint_passes_before_cancel");
    }

    #[test]
    fn cancelled_error_displays() {
        init_test("cancelled_error_displays");
        let msg = Cancelled.to_string();
        crate::assert_with_log!(msg == "operation cancelled", "display text", "operation cancelled", msg);
        crate::test_complete!("cancelled_error_displays");
    }
}
