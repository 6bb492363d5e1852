//! Shared helpers for the integration tests.
//!
//! Each test binary compiles its own copy; not every binary uses every
//! helper.
#![allow(dead_code, unused_imports, unused_macros)]

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};

static INIT: Once = Once::new();

/// Installs a verbose test subscriber once per process.
pub fn init_test_logging() {
    INIT.call_once(|| {
        use tracing_subscriber::fmt::format::FmtSpan;

        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = $name, "=== TEST PHASE ===");
    };
}
pub(crate) use test_phase;

macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST COMPLETE ===");
    };
}
pub(crate) use test_complete;

macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        if !($cond) {
            tracing::error!(
                expected = ?$expected,
                actual = ?$actual,
                "ASSERTION FAILED: {}",
                $msg
            );
            panic!("assertion failed: {}", $msg);
        }
        tracing::debug!(check = $msg, "assertion passed");
    };
}
pub(crate) use assert_with_log;

struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }
}

/// Drives a future on the current thread; wakeups unpark it. `park` may
/// return spuriously, so Pending simply re-polls.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
    let mut context = Context::from_waker(&waker);
    let mut future = std::pin::pin!(future);
    loop {
        match future.as_mut().poll(&mut context) {
            Poll::Ready(value) => return value,
            Poll::Pending => thread::park(),
        }
    }
}

/// Hands out process-unique values for building distinct test keys.
pub fn unique_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed)
}
