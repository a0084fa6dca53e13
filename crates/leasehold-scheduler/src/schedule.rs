use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::warn;

use crate::types::Schedule;

/// Delay from `now` until the next trigger of `schedule`.
///
/// Cron schedules are evaluated against `now` on every call so wall-clock
/// changes are picked up. Returns `None` when a cron expression has no
/// further fire time (e.g. it pins a year that has passed).
pub fn next_delay(schedule: &Schedule, now: DateTime<Utc>) -> Option<Duration> {
    match schedule {
        Schedule::FixedRate { every } => Some(*every),

        Schedule::Cron { expression, parsed } => {
            let Some(next) = parsed.after(&now).next() else {
                warn!(%expression, "cron schedule has no upcoming fire time");
                return None;
            };
            // `after` is strictly later than `now`, so this never goes negative.
            Some((next - now).to_std().unwrap_or(Duration::ZERO))
        }
    }
}

/// Deadline of the trigger that follows the one due at `last`.
///
/// Fixed-rate triggers stay on the `last + n * every` grid, so time spent
/// firing (a slow lease acquire, say) never pushes the cadence back. Grid
/// points that already passed are skipped rather than fired in a burst.
/// Cron triggers are re-evaluated against the wall clock `wall`.
pub fn next_deadline(
    schedule: &Schedule,
    last: Instant,
    now: Instant,
    wall: DateTime<Utc>,
) -> Option<Instant> {
    match schedule {
        Schedule::FixedRate { every } => {
            let next = last + *every;
            if next > now {
                return Some(next);
            }
            let every_ns = every.as_nanos();
            let periods = now.duration_since(next).as_nanos() / every_ns + 1;
            let skip = u64::try_from(periods * every_ns).unwrap_or(u64::MAX);
            Some(next + Duration::from_nanos(skip))
        }
        Schedule::Cron { .. } => next_delay(schedule, wall).map(|delay| now + delay),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fixed_rate_is_constant() {
        let s = Schedule::fixed_rate(Duration::from_millis(50)).unwrap();
        let now = Utc::now();
        assert_eq!(next_delay(&s, now), Some(Duration::from_millis(50)));
        assert_eq!(
            next_delay(&s, now + chrono::Duration::hours(3)),
            Some(Duration::from_millis(50))
        );
    }

    #[test]
    fn cron_is_relative_to_now() {
        let s = Schedule::cron("0 */5 * * * *").unwrap();

        let at = Utc.with_ymd_and_hms(2026, 3, 1, 10, 2, 30).unwrap();
        assert_eq!(next_delay(&s, at), Some(Duration::from_secs(150)));

        let later = Utc.with_ymd_and_hms(2026, 3, 1, 10, 4, 59).unwrap();
        assert_eq!(next_delay(&s, later), Some(Duration::from_secs(1)));
    }

    #[test]
    fn cron_on_the_boundary_waits_a_full_period() {
        let s = Schedule::cron("0 0 * * * *").unwrap();
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(next_delay(&s, at), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn exhausted_cron_yields_none() {
        let s = Schedule::cron("0 0 0 1 1 * 2020").unwrap();
        assert_eq!(next_delay(&s, Utc::now()), None);
    }

    #[test]
    fn fixed_rate_deadline_ignores_firing_latency() {
        let s = Schedule::fixed_rate(Duration::from_millis(100)).unwrap();
        let last = Instant::now();
        let wall = Utc::now();

        // Firing took 40ms: the next trigger is still 100ms after the last.
        let late = last + Duration::from_millis(40);
        assert_eq!(
            next_deadline(&s, last, late, wall),
            Some(last + Duration::from_millis(100))
        );

        // Firing overran two and a half periods: missed points are skipped.
        let overran = last + Duration::from_millis(250);
        assert_eq!(
            next_deadline(&s, last, overran, wall),
            Some(last + Duration::from_millis(300))
        );

        // Landing exactly on a grid point moves on to the following one.
        let exact = last + Duration::from_millis(100);
        assert_eq!(
            next_deadline(&s, last, exact, wall),
            Some(last + Duration::from_millis(200))
        );
    }

    #[test]
    fn cron_deadline_follows_wall_clock() {
        let s = Schedule::cron("0 */5 * * * *").unwrap();
        let now = Instant::now();
        let wall = Utc.with_ymd_and_hms(2026, 3, 1, 10, 2, 30).unwrap();
        assert_eq!(
            next_deadline(&s, now, now, wall),
            Some(now + Duration::from_secs(150))
        );
    }

    #[test]
    fn invalid_schedules_rejected() {
        assert!(Schedule::cron("not a cron").is_err());
        assert!(Schedule::fixed_rate(Duration::ZERO).is_err());
    }
}
