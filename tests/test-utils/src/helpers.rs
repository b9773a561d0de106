//! Test helper functions and utilities

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing_subscriber::EnvFilter;

/// Initialize test logging with environment-based configuration.
///
/// Safe to call multiple times - subsequent calls are ignored.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic RNG so stress traffic replays identically across runs.
///
/// Give each worker thread its own seed to keep their schedules independent
/// but reproducible.
#[must_use]
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Index of the first byte in `buf` that differs from `expected`.
///
/// `None` means the whole buffer carries the expected fill value.
#[must_use]
pub fn first_mismatch(buf: &[u8], expected: u8) -> Option<usize> {
    buf.iter().position(|&byte| byte != expected)
}

/// Poll `condition` until it holds or `timeout` expires.
///
/// Sleeps `poll_interval` between checks. Useful for waiting on another
/// thread's progress without hand-rolled sleep loops in every test.
///
/// # Returns
///
/// Ok(()) once the condition holds, Err if the timeout expires first
pub fn wait_until(
    mut condition: impl FnMut() -> bool,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("timeout after {timeout:?} waiting for condition");
        }
        thread::sleep(poll_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn seeded_rng_is_reproducible() {
        let mut a = seeded_rng(42);
        let mut b = seeded_rng(42);
        assert_eq!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn first_mismatch_finds_the_odd_byte() {
        assert_eq!(first_mismatch(&[7, 7, 7], 7), None);
        assert_eq!(first_mismatch(&[7, 7, 3], 7), Some(2));
        assert_eq!(first_mismatch(&[], 7), None);
    }

    #[test]
    fn wait_until_sees_an_immediate_condition() {
        wait_until(|| true, Duration::from_millis(10), Duration::from_millis(1))
            .expect("condition already holds");
        let err = wait_until(|| false, Duration::from_millis(5), Duration::from_millis(1));
        assert!(err.is_err());
    }
}
