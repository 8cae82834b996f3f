use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use std::fmt::{self, Display, Formatter};

/// An object that returns some perception of the current wall-clock time.
/// The scheduler only ever consults an injected Clock so that tests can run
/// against a deterministic time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// A Clock that returns the current time according to `chrono::Utc::now`.
#[derive(Clone, Debug, Default)]
pub struct RealClock {}

impl Clock for RealClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A half-open interval of time: inclusive begin, exclusive end.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Interval {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Interval {
    pub fn new(begin: DateTime<Utc>, end: DateTime<Utc>) -> Interval {
        Interval { begin, end }
    }

    pub fn contains(&self, time: &DateTime<Utc>) -> bool {
        &self.begin <= time && time < &self.end
    }
}

impl Display for Interval {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", rfc3339(&self.begin), rfc3339(&self.end))
    }
}

/// Formats a timestamp as RFC 3339 with second precision in UTC, the format
/// used in task marker names.
pub fn rfc3339(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// The interval in which we look for new batches to intake. Extends 24 hours
/// into the future to account for ingestion servers with skewed clocks.
pub fn intake_interval(now: DateTime<Utc>, max_age: Duration) -> Interval {
    Interval::new(now - max_age, now + Duration::hours(24))
}

/// The most recent fully elapsed aggregation window, offset by the grace
/// period: with `t = now - grace` and `n = floor(t / period)`, the window is
/// `[n * period, (n + 1) * period)`. Windows are aligned to the Unix epoch so
/// that independent processes with roughly synchronized clocks compute
/// identical windows, and hence identical task marker names.
pub fn prev_aligned_window(now: DateTime<Utc>, period: Duration, grace: Duration) -> Interval {
    let period_seconds = period.num_seconds();
    let n = (now - grace).timestamp().div_euclid(period_seconds);
    let begin = Utc.timestamp(n * period_seconds, 0);
    Interval::new(begin, begin + period)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_contains() {
        let interval = Interval::new(
            Utc.ymd(2020, 10, 31).and_hms(18, 0, 0),
            Utc.ymd(2020, 10, 31).and_hms(21, 0, 0),
        );
        // Begin is inclusive, end is exclusive
        assert!(interval.contains(&Utc.ymd(2020, 10, 31).and_hms(18, 0, 0)));
        assert!(interval.contains(&Utc.ymd(2020, 10, 31).and_hms(20, 59, 0)));
        assert!(!interval.contains(&Utc.ymd(2020, 10, 31).and_hms(21, 0, 0)));
        assert!(!interval.contains(&Utc.ymd(2020, 10, 31).and_hms(17, 59, 0)));
    }

    #[test]
    fn interval_display() {
        let interval = Interval::new(
            Utc.ymd(2020, 10, 31).and_hms(18, 0, 0),
            Utc.ymd(2020, 10, 31).and_hms(21, 0, 0),
        );
        assert_eq!(
            interval.to_string(),
            "[2020-10-31T18:00:00Z, 2020-10-31T21:00:00Z)"
        );
    }

    #[test]
    fn intake_interval_bounds() {
        let now = Utc.ymd(2020, 10, 31).and_hms(20, 45, 0);
        let interval = intake_interval(now, Duration::hours(1));
        assert_eq!(interval.begin, Utc.ymd(2020, 10, 31).and_hms(19, 45, 0));
        assert_eq!(interval.end, Utc.ymd(2020, 11, 1).and_hms(20, 45, 0));
    }

    #[test]
    fn aligned_window() {
        let now = Utc.ymd(2020, 10, 31).and_hms(20, 45, 0);
        // With a 3h period and 30m grace, t = 20:15, so the window containing
        // t is [18:00, 21:00)
        let window = prev_aligned_window(now, Duration::hours(3), Duration::minutes(30));
        assert_eq!(window.begin, Utc.ymd(2020, 10, 31).and_hms(18, 0, 0));
        assert_eq!(window.end, Utc.ymd(2020, 10, 31).and_hms(21, 0, 0));

        // A grace period long enough to cross the window boundary selects the
        // previous window
        let window = prev_aligned_window(now, Duration::hours(3), Duration::hours(2));
        assert_eq!(window.begin, Utc.ymd(2020, 10, 31).and_hms(18, 0, 0));
        let window = prev_aligned_window(now, Duration::hours(3), Duration::hours(3));
        assert_eq!(window.begin, Utc.ymd(2020, 10, 31).and_hms(15, 0, 0));
    }

    #[test]
    fn aligned_window_is_stable_across_processes() {
        // Two processes whose clocks disagree by a few minutes must compute
        // the same window, or they would write different aggregate markers.
        let period = Duration::hours(8);
        let grace = Duration::hours(4);
        let first = prev_aligned_window(Utc.ymd(2020, 10, 31).and_hms(20, 40, 0), period, grace);
        let second = prev_aligned_window(Utc.ymd(2020, 10, 31).and_hms(20, 51, 0), period, grace);
        assert_eq!(first, second);
    }
}
