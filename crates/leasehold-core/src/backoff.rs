use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{LeaseholdError, Result};

/// Delay policy applied between a failed attempt and the next eligible retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Always wait the same amount.
    Fixed { delay_ms: u64 },

    /// `base × 2^(attempt-1)`, capped at `max`, optionally jittered into
    /// `[d/2, d)`.
    Exponential {
        base_ms: u64,
        max_ms: u64,
        #[serde(default)]
        jitter: bool,
    },
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Backoff::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Build an exponential policy. `base` must be non-zero and `max >= base`.
    pub fn exponential(base: Duration, max: Duration, jitter: bool) -> Result<Self> {
        let backoff = Backoff::Exponential {
            base_ms: base.as_millis() as u64,
            max_ms: max.as_millis() as u64,
            jitter,
        };
        backoff.validate()?;
        Ok(backoff)
    }

    /// Check the invariants that deserialized policies can't enforce by type.
    pub fn validate(&self) -> Result<()> {
        match *self {
            Backoff::Fixed { .. } => Ok(()),
            Backoff::Exponential { base_ms, max_ms, .. } => {
                if base_ms == 0 {
                    return Err(LeaseholdError::InvalidBackoff(
                        "base must be greater than zero".to_string(),
                    ));
                }
                if max_ms < base_ms {
                    return Err(LeaseholdError::InvalidBackoff(format!(
                        "max ({max_ms}ms) must be >= base ({base_ms}ms)"
                    )));
                }
                Ok(())
            }
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn next_delay(&self, attempt: u32) -> Result<Duration> {
        if attempt < 1 {
            return Err(LeaseholdError::InvalidBackoff(format!(
                "attempt must be >= 1, got {attempt}"
            )));
        }
        match *self {
            Backoff::Fixed { delay_ms } => Ok(Duration::from_millis(delay_ms)),
            Backoff::Exponential {
                base_ms,
                max_ms,
                jitter,
            } => {
                self.validate()?;
                let capped = exponential_ms(base_ms, max_ms, attempt);
                if jitter && capped > 1 {
                    let mut rng = rand::thread_rng();
                    Ok(Duration::from_millis(rng.gen_range(capped / 2..capped)))
                } else {
                    Ok(Duration::from_millis(capped))
                }
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            base_ms: 1_000,
            max_ms: 300_000,
            jitter: true,
        }
    }
}

/// `min(base × 2^(attempt-1), max)` without overflowing for large attempts.
fn exponential_ms(base_ms: u64, max_ms: u64, attempt: u32) -> u64 {
    let shift = attempt.saturating_sub(1);
    if shift >= 64 {
        return max_ms;
    }
    base_ms
        .checked_mul(1u64 << shift)
        .map_or(max_ms, |d| d.min(max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn fixed_always_returns_delay() {
        let b = Backoff::fixed(ms(250));
        for attempt in 1..20 {
            assert_eq!(b.next_delay(attempt).unwrap(), ms(250));
        }
    }

    #[test]
    fn attempt_zero_is_rejected() {
        assert!(Backoff::fixed(ms(1)).next_delay(0).is_err());
        let b = Backoff::exponential(ms(10), ms(100), false).unwrap();
        assert!(b.next_delay(0).is_err());
    }

    #[test]
    fn exponential_doubles_until_cap() {
        let b = Backoff::exponential(ms(100), ms(1_000), false).unwrap();
        assert_eq!(b.next_delay(1).unwrap(), ms(100));
        assert_eq!(b.next_delay(2).unwrap(), ms(200));
        assert_eq!(b.next_delay(3).unwrap(), ms(400));
        assert_eq!(b.next_delay(4).unwrap(), ms(800));
        assert_eq!(b.next_delay(5).unwrap(), ms(1_000));
        assert_eq!(b.next_delay(500).unwrap(), ms(1_000));
    }

    #[test]
    fn exponential_without_jitter_is_monotonic_and_bounded() {
        let b = Backoff::exponential(ms(3), ms(60_000), false).unwrap();
        let mut prev = Duration::ZERO;
        for attempt in 1..=200 {
            let d = b.next_delay(attempt).unwrap();
            assert!(d >= prev, "attempt {attempt}: {d:?} < {prev:?}");
            assert!(d <= ms(60_000));
            prev = d;
        }
    }

    #[test]
    fn jitter_stays_in_lower_half_open_range() {
        let b = Backoff::exponential(ms(100), ms(10_000), true).unwrap();
        for _ in 0..500 {
            let d = b.next_delay(3).unwrap();
            assert!(d >= ms(200) && d < ms(400), "{d:?} out of range");
        }
    }

    #[test]
    fn jitter_skipped_for_one_millisecond() {
        let b = Backoff::exponential(ms(1), ms(1), true).unwrap();
        assert_eq!(b.next_delay(1).unwrap(), ms(1));
    }

    #[test]
    fn invalid_parameters_rejected() {
        assert!(Backoff::exponential(ms(0), ms(10), false).is_err());
        assert!(Backoff::exponential(ms(10), ms(5), false).is_err());
    }
}
