use chrono::*;
use std::cmp::Ordering;
use core::cmp::Ord;

/// A point in time expressed the GTFS way: a service day plus a number of
/// seconds since that day's "noon minus 12 hours". The seconds may be
/// negative or exceed 24 hours, which is how overnight trips keep their
/// logical service day.
#[derive(Eq, Clone, Copy, Hash, Debug)]
pub struct GtfsDateTime {
    service_day: Date<Local>,
    time: i32,
}

impl GtfsDateTime {
    pub fn new(service_day: Date<Local>, time: i32) -> Self {
        Self { service_day, time }
    }

    /// The logical date, which may differ from the calendar date of the
    /// actual instant for times beyond 24:00:00.
    pub fn service_day(&self) -> Date<Local> {
        self.service_day
    }

    pub fn date_time(&self) -> DateTime<Local> {
        // see https://developers.google.com/transit/gtfs/reference#field_types for this quirky thing:
        self.service_day.and_hms(12, 0, 0) + (Duration::seconds(self.time as i64) - Duration::hours(12))
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.time as i64)
    }

    pub fn seconds(&self) -> i32 {
        self.time
    }

    pub fn date(&self) -> Date<Local> {
        self.date_time().date()
    }
}

impl Ord for GtfsDateTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.date_time().cmp(&other.date_time())
    }
}

impl PartialOrd for GtfsDateTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for GtfsDateTime {
    fn eq(&self, other: &Self) -> bool {
        self.date_time() == other.date_time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overnight_time_rolls_into_next_day() {
        let day = Local.ymd(2024, 3, 4);
        let just_past_one = GtfsDateTime::new(day, 25 * 3600);
        assert_eq!(just_past_one.service_day(), day);
        assert_eq!(just_past_one.date(), Local.ymd(2024, 3, 5));
        assert_eq!(just_past_one.date_time().time(), NaiveTime::from_hms(1, 0, 0));
    }

    #[test]
    fn test_ordering_is_by_instant() {
        let day = Local.ymd(2024, 3, 4);
        let next_day = Local.ymd(2024, 3, 5);
        let late = GtfsDateTime::new(day, 25 * 3600);
        let early = GtfsDateTime::new(next_day, 1800);
        assert!(early < late);
    }
}
