use chrono::{Date, DateTime, Duration, Local, NaiveDate};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::FnResult;
use crate::read_dir_simple;
use crate::types::GtfsDateTime;
use super::{local_date, ScheduleData, Trip};

/// How the index treats time: the live pipeline keeps a small sliding
/// window around today and refreshes it, batch jobs build the full span of
/// all feeds once and never look again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IndexMode {
    Interactive,
    Batch,
}

const REFRESH_INTERVAL_HOURS: i64 = 1;

/// What a route lookup yields for one date: the feed the route lives in and
/// the absolute window in which any of its trips run on that date.
#[derive(Clone)]
pub struct RouteInfo {
    pub schedule: Arc<ScheduleData>,
    pub route_id: String,
    pub window_start: DateTime<Local>,
    pub window_end: DateTime<Local>,
}

/// Per-date lookup from route short names to routes, over all loaded feeds.
/// For every date the newest feed whose validity covers it wins.
pub struct ScheduleIndex {
    schedule_dir: Option<String>,
    mode: IndexMode,
    feeds: Vec<Arc<ScheduleData>>,
    route_by_date: HashMap<NaiveDate, HashMap<String, RouteInfo>>,
    next_update_time: DateTime<Local>,
}

impl ScheduleIndex {
    pub fn new(schedule_dir: &str, mode: IndexMode) -> FnResult<ScheduleIndex> {
        let feeds = Self::load_feeds(schedule_dir)?;
        let mut index = ScheduleIndex {
            schedule_dir: Some(String::from(schedule_dir)),
            mode,
            feeds,
            route_by_date: HashMap::new(),
            next_update_time: Local::now(),
        };
        if mode == IndexMode::Batch {
            index.prepare();
        }
        Ok(index)
    }

    /// Builds an index over already-loaded feeds. Used by tests and by
    /// callers that manage feed loading themselves.
    pub fn from_feeds(feeds: Vec<Arc<ScheduleData>>, mode: IndexMode) -> ScheduleIndex {
        let mut index = ScheduleIndex {
            schedule_dir: None,
            mode,
            feeds,
            route_by_date: HashMap::new(),
            next_update_time: Local::now(),
        };
        index.prepare();
        index
    }

    fn load_feeds(schedule_dir: &str) -> FnResult<Vec<Arc<ScheduleData>>> {
        let mut feeds = Vec::new();
        for filename in read_dir_simple(schedule_dir)? {
            if !filename.ends_with(".zip") {
                continue;
            }
            match ScheduleData::load_or_build(&filename) {
                Ok(data) => feeds.push(Arc::new(data)),
                Err(e) => eprintln!("Skipping schedule {}: {}", filename, e),
            }
        }
        feeds.sort_by_key(|feed| feed.feed_start_date);
        Ok(feeds)
    }

    fn prepare(&mut self) {
        self.route_by_date = match self.mode {
            IndexMode::Interactive => {
                let today = Local::today().naive_local();
                self.prepare_between(today - Duration::days(2), today + Duration::days(1))
            }
            IndexMode::Batch => {
                let start = self.feeds.iter().map(|feed| feed.feed_start_date).min();
                let end = self.feeds.iter().map(|feed| feed.feed_end_date).max();
                match (start, end) {
                    (Some(start), Some(end)) => self.prepare_between(start, end),
                    _ => HashMap::new(),
                }
            }
        };
    }

    fn prepare_between(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> HashMap<NaiveDate, HashMap<String, RouteInfo>> {
        let mut route_by_date = HashMap::new();
        let mut date = start_date;
        while date <= end_date {
            if let Some(feed) = self.feed_for_date(date) {
                route_by_date.insert(date, Self::routes_on_date(&feed, date));
            }
            date += Duration::days(1);
        }
        route_by_date
    }

    fn routes_on_date(feed: &Arc<ScheduleData>, date: NaiveDate) -> HashMap<String, RouteInfo> {
        let day = local_date(date);
        let mut routes = HashMap::new();
        for route in feed.routes.values() {
            let mut window: Option<(i32, i32)> = None;
            for trip_id in &route.trip_ids {
                let trip = match feed.trips.get(trip_id) {
                    Some(trip) => trip,
                    None => continue,
                };
                if !trip.active_on(date) {
                    continue;
                }
                window = Some(match window {
                    None => (trip.start_time, trip.end_time),
                    Some((start, end)) => (start.min(trip.start_time), end.max(trip.end_time)),
                });
            }
            if let Some((start, end)) = window {
                routes.insert(
                    route.short_name.clone(),
                    RouteInfo {
                        schedule: Arc::clone(feed),
                        route_id: route.id.clone(),
                        window_start: GtfsDateTime::new(day, start).date_time(),
                        window_end: GtfsDateTime::new(day, end).date_time(),
                    },
                );
            }
        }
        routes
    }

    /// The newest feed whose validity interval covers the date.
    fn feed_for_date(&self, date: NaiveDate) -> Option<Arc<ScheduleData>> {
        self.feeds
            .iter()
            .filter(|feed| feed.feed_start_date <= date && date <= feed.feed_end_date)
            .max_by_key(|feed| feed.feed_start_date)
            .map(Arc::clone)
    }

    pub fn route_info(&self, short_name: &str, date: Date<Local>) -> Option<RouteInfo> {
        self.route_by_date
            .get(&date.naive_local())
            .and_then(|routes| routes.get(short_name))
            .cloned()
    }

    /// Finds the trip in the feed responsible for the given service day.
    /// Used to resurrect cached vehicle states after a restart.
    pub fn find_trip(&self, trip_id: &str, service_day: NaiveDate) -> Option<(Arc<ScheduleData>, Arc<Trip>)> {
        if let Some(feed) = self.feed_for_date(service_day) {
            if let Some(trip) = feed.trips.get(trip_id) {
                return Some((Arc::clone(&feed), Arc::clone(trip)));
            }
        }
        // fall back to any feed that knows the trip
        for feed in self.feeds.iter().rev() {
            if let Some(trip) = feed.trips.get(trip_id) {
                return Some((Arc::clone(feed), Arc::clone(trip)));
            }
        }
        None
    }

    fn refresh_due(&self) -> bool {
        self.mode == IndexMode::Interactive && Local::now() >= self.next_update_time
    }

    fn refresh(&mut self) {
        self.next_update_time = Local::now() + Duration::hours(REFRESH_INTERVAL_HOURS);
        if let Some(dir) = self.schedule_dir.clone() {
            match Self::load_feeds(&dir) {
                Ok(feeds) => self.feeds = feeds,
                Err(e) => eprintln!("Could not re-scan schedule directory {}: {}", dir, e),
            }
        }
        self.prepare();
    }
}

/// The index as shared with the worker threads: reads are concurrent, the
/// hourly interactive refresh takes the write lock.
#[derive(Clone)]
pub struct SharedScheduleIndex {
    inner: Arc<RwLock<ScheduleIndex>>,
}

impl SharedScheduleIndex {
    pub fn new(index: ScheduleIndex) -> SharedScheduleIndex {
        SharedScheduleIndex {
            inner: Arc::new(RwLock::new(index)),
        }
    }

    pub fn route_info(&self, short_name: &str, date: Date<Local>) -> Option<RouteInfo> {
        self.maybe_refresh();
        self.inner.read().unwrap().route_info(short_name, date)
    }

    pub fn find_trip(&self, trip_id: &str, service_day: NaiveDate) -> Option<(Arc<ScheduleData>, Arc<Trip>)> {
        self.inner.read().unwrap().find_trip(trip_id, service_day)
    }

    fn maybe_refresh(&self) {
        let due = self.inner.read().unwrap().refresh_due();
        if due {
            let mut index = self.inner.write().unwrap();
            // another thread may have refreshed while we waited for the lock
            if index.refresh_due() {
                index.refresh();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::testing::*;

    #[test]
    fn test_route_window_covers_active_trips_only() {
        let day = NaiveDate::from_ymd(2024, 3, 4);
        let other_day = NaiveDate::from_ymd(2024, 3, 6);
        let morning = straight_trip(
            "trip_1",
            "route-33",
            1,
            1000.0,
            vec![
                stop(1, "A", 6 * 3600, 6 * 3600, 100.0),
                stop(2, "B", 7 * 3600, 7 * 3600, 900.0),
            ],
            vec![day],
        );
        let evening = straight_trip(
            "trip_2",
            "route-33",
            2,
            1000.0,
            vec![
                stop(1, "A", 20 * 3600, 20 * 3600, 100.0),
                stop(2, "B", 21 * 3600, 21 * 3600, 900.0),
            ],
            vec![day, other_day],
        );
        let schedule = schedule_with_trips("33", "route-33", vec![morning, evening]);
        let index = ScheduleIndex::from_feeds(vec![schedule], IndexMode::Batch);

        let info = index.route_info("33", local_date(day)).unwrap();
        assert_eq!(info.window_start, local_date(day).and_hms(6, 0, 0));
        assert_eq!(info.window_end, local_date(day).and_hms(21, 0, 0));

        // on the other day only the evening trip runs
        let info = index.route_info("33", local_date(other_day)).unwrap();
        assert_eq!(info.window_start, local_date(other_day).and_hms(20, 0, 0));

        assert!(index.route_info("44", local_date(day)).is_none());
        assert!(index
            .route_info("33", local_date(NaiveDate::from_ymd(2024, 3, 5)))
            .is_none());
    }
}
