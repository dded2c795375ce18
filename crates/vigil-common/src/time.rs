use std::time::Duration;

use chrono::{DateTime, Utc};

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Time left until the next wall-clock multiple of `period`.
///
/// Returns `period` itself when `at` sits exactly on a boundary.
pub fn until_next_boundary(at: &DateTime<Utc>, period: Duration) -> Duration {
    let period_ms = period.as_millis().max(1) as i64;
    let offset = at.timestamp_millis().rem_euclid(period_ms);
    Duration::from_millis((period_ms - offset) as u64)
}

/// Signed elapsed time from `earlier` to `later`, clamped at zero.
pub fn elapsed_between(earlier: &DateTime<Utc>, later: &DateTime<Utc>) -> Duration {
    (*later - *earlier).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn boundary_is_aligned_to_wall_clock() {
        let at = Utc.timestamp_millis_opt(1_700_000_012_500).unwrap();
        assert_eq!(
            until_next_boundary(&at, Duration::from_secs(10)),
            Duration::from_millis(7_500)
        );

        let on_boundary = Utc.timestamp_millis_opt(1_700_000_010_000).unwrap();
        assert_eq!(
            until_next_boundary(&on_boundary, Duration::from_secs(10)),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn elapsed_never_goes_negative() {
        let earlier = Utc.timestamp_opt(100, 0).unwrap();
        let later = Utc.timestamp_opt(160, 0).unwrap();
        assert_eq!(elapsed_between(&earlier, &later), Duration::from_secs(60));
        assert_eq!(elapsed_between(&later, &earlier), Duration::ZERO);
    }
}
