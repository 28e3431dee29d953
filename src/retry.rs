//! Bounded retry with a fixed delay between attempts.

use std::time::Duration;

use crate::session::CancelToken;

/// Run `op` up to `attempts` times, sleeping `delay` between failures.
///
/// Returns the first `Ok`, or the last `Err` once attempts are exhausted.
/// `attempts` is clamped to at least 1. Cancellation interrupts the delay
/// and surfaces the last `Err` without further attempts.
pub fn retry_with_delay<T, E, F>(
    attempts: u32,
    delay: Duration,
    cancel: &CancelToken,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
{
    let attempts = attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                last_err = Some(err);
                if attempt < attempts && !cancel.sleep(delay) {
                    break;
                }
            }
        }
    }

    // attempts >= 1, so at least one Err was recorded
    Err(last_err.unwrap())
}
