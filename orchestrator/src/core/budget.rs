//! Time budget helpers for planner and tool calls.
//!
//! The caller reads the clock and passes `now` in.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

/// Return the time left at `now` until the provided deadline.
pub fn remaining_budget(deadline: Instant, now: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(now)
        .unwrap_or(Duration::ZERO);
    if remaining.is_zero() {
        return Err(anyhow!("invocation deadline passed"));
    }
    Ok(remaining)
}

/// Timeout for one external call: the per-call limit, capped by what is left
/// of the invocation deadline.
pub fn call_timeout(deadline: Instant, now: Instant, per_call: Duration) -> Result<Duration> {
    Ok(remaining_budget(deadline, now)?.min(per_call))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_call_limit_applies_when_deadline_is_far() {
        let now = Instant::now();
        let deadline = now + Duration::from_secs(3600);
        let timeout = call_timeout(deadline, now, Duration::from_secs(5)).expect("budget");
        assert_eq!(timeout, Duration::from_secs(5));
    }

    #[test]
    fn deadline_caps_the_per_call_limit() {
        let now = Instant::now();
        let deadline = now + Duration::from_millis(200);
        let timeout = call_timeout(deadline, now, Duration::from_secs(60)).expect("budget");
        assert_eq!(timeout, Duration::from_millis(200));
    }

    #[test]
    fn passed_deadline_is_an_error() {
        let deadline = Instant::now();
        assert!(call_timeout(deadline, deadline, Duration::from_secs(1)).is_err());
        let later = deadline + Duration::from_millis(2);
        assert!(remaining_budget(deadline, later).is_err());
    }
}
