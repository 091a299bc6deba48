//! Shared test configuration for property-based testing.
//!
//! Centralizes the proptest case count so that runs under Miri stay fast
//! while normal runs keep thorough coverage.

/// Returns the number of cases to run for property-based tests.
///
/// Under Miri this returns a reduced count (5); otherwise the standard
/// count (256).
#[must_use]
pub const fn miri_case_count() -> u32 {
    if cfg!(miri) {
        5
    } else {
        256
    }
}
