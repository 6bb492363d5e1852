//! Test logging and assertion helpers for the unit-test modules.
//!
//! Call [`init_test_logging`] at the top of every test, then mark progress
//! with [`test_phase!`](crate::test_phase) and [`test_complete!`](crate::test_complete)
//! so interleaved multi-thread output stays attributable.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a verbose test subscriber once per process. Later calls are
/// no-ops, so every test can call it unconditionally.
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

/// Marks the start of a test (or a named phase within one).
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = $name, "=== TEST PHASE ===");
    };
}

/// Marks a smaller step inside a phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::info!(section = $name, "--- section ---");
    };
}

/// Marks a test as finished; absence in captured output means the test
/// stopped early.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST COMPLETE ===");
    };
}

/// Asserts with the expected and actual values logged on failure, so a
/// failing run under `--nocapture` explains itself.
#[macro_export]
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
