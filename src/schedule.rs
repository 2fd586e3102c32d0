use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// The daily automatic backup as recorded in state.
///
/// Nothing here triggers a run; an external scheduler reads `next_run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub time: NaiveTime,
    pub next_run: DateTime<Utc>,
}

impl Schedule {
    /// Install a daily schedule at `time` in the timezone of `now`
    pub fn daily<Tz: TimeZone>(time: NaiveTime, now: &DateTime<Tz>) -> Self {
        Schedule {
            time,
            next_run: next_run(time, now).with_timezone(&Utc),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_run
    }

    /// Move `next_run` past `now`, keeping the time of day
    pub fn advance<Tz: TimeZone>(&mut self, now: &DateTime<Tz>) {
        self.next_run = next_run(self.time, now).with_timezone(&Utc);
    }
}

/// Today at `time` if that is still ahead of `now`, otherwise tomorrow
pub fn next_run<Tz: TimeZone>(time: NaiveTime, now: &DateTime<Tz>) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive().and_time(time);

    match localize(&tz, today) {
        Some(candidate) if candidate > *now => candidate,
        _ => localize(&tz, today + Duration::days(1))
            .unwrap_or_else(|| now.clone() + Duration::days(1)),
    }
}

/// Map a wall-clock time to an instant; a time skipped by a DST jump moves
/// forward an hour
fn localize<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => Some(t),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn utc(day: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, day, h, m, 0).unwrap()
    }

    #[test]
    fn test_next_run_later_today() {
        assert_eq!(next_run(time(23, 0), &utc(15, 9, 30)), utc(15, 23, 0));
    }

    #[test]
    fn test_next_run_tomorrow_when_passed() {
        assert_eq!(next_run(time(23, 0), &utc(15, 23, 30)), utc(16, 23, 0));
        assert_eq!(next_run(time(23, 0), &utc(15, 23, 0)), utc(16, 23, 0));
    }

    #[test]
    fn test_next_run_month_rollover() {
        assert_eq!(
            next_run(time(1, 0), &utc(31, 2, 0)),
            Utc.with_ymd_and_hms(2026, 11, 1, 1, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_next_run_respects_offset() {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2026, 10, 15, 22, 0, 0).unwrap();
        let next = next_run(time(23, 0), &now);
        assert_eq!(next.with_timezone(&Utc), utc(15, 21, 0));
    }

    #[test]
    fn test_schedule_due_and_advance() {
        let mut schedule = Schedule::daily(time(23, 0), &utc(15, 12, 0));
        assert!(!schedule.is_due(utc(15, 22, 59)));
        assert!(schedule.is_due(utc(15, 23, 0)));

        schedule.advance(&utc(15, 23, 5));
        assert_eq!(schedule.next_run, utc(16, 23, 0));
        assert_eq!(schedule.time, time(23, 0));
    }
}
