//! Test support. Timing-sensitive tests run `ProdRuntime` against tokio's
//! paused clock (`#[tokio::test(start_paused = true)]`) so waits complete in
//! virtual time.

use crate::prod::ProdRuntime;

pub type TestRuntime = ProdRuntime;

/// Adopt the test's tokio runtime.
pub fn test_runtime() -> TestRuntime {
    ProdRuntime::current()
}
