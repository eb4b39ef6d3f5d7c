mod preprocessing;
mod route_by_date;

pub use route_by_date::{IndexMode, RouteInfo, ScheduleIndex, SharedScheduleIndex};

use chrono::{Date, DateTime, Duration, Local, NaiveDate};
use chrono::offset::TimeZone;
use geo::Point;
use serde::{Serialize, Deserialize};
use simple_error::bail;
use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::io::prelude::*;
use std::sync::Arc;

use crate::FnResult;
use crate::geometry::{LocalProjection, ShapeLine};
use crate::types::RawVehicleData;

pub const SECONDS_PER_DAY: i64 = 24 * 60 * 60;
const CACHE_SUFFIX: &str = ".cache";

/// A route as the matcher sees it: the key is the short name that vehicles
/// report, the value is the set of trips that may serve it.
#[derive(Debug, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub short_name: String,
    pub trip_ids: Vec<String>,
}

/// One scheduled stop visit of a trip, with everything precomputed that the
/// matcher needs: times in seconds since service-day midnight (which exceed
/// 86 400 on overnight trips) and the stop's arclength along the shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripStopTime {
    pub stop_sequence: u16,
    pub stop_id: String,
    pub stop_code: String,
    pub stop_name: String,
    pub arrival_time: i32,
    pub departure_time: i32,
    pub shape_dist: f64,
    pub position: Point<f64>,
    pub latitude: f64,
    pub longitude: f64,
}

/// A trip with its projected shape and service window. Immutable within a
/// feed version.
#[derive(Debug, Serialize, Deserialize)]
pub struct Trip {
    pub id: String,
    pub route_id: String,
    pub brigade_id: Option<i32>,
    pub headsign: Option<String>,
    pub shape: ShapeLine,
    pub stop_times: Vec<TripStopTime>,
    /// scheduled departure at the first stop, seconds since service-day midnight
    pub start_time: i32,
    /// scheduled arrival at the last stop, may exceed 86 400
    pub end_time: i32,
    /// sorted
    pub service_days: Vec<NaiveDate>,
}

impl Trip {
    pub fn active_on(&self, date: NaiveDate) -> bool {
        self.service_days.binary_search(&date).is_ok()
    }

    pub fn stop_index_of(&self, stop_sequence: u16) -> Option<usize> {
        self.stop_times.iter().position(|stop_time| stop_time.stop_sequence == stop_sequence)
    }

    /// The service day under which this trip covers the given instant, if
    /// any: either the instant's own date, or the previous date for
    /// overnight trips whose times run past 24:00:00.
    pub fn service_day_for(&self, timestamp: DateTime<Local>) -> Option<Date<Local>> {
        let date = timestamp.date();
        let seconds = seconds_since_midnight(timestamp);
        if self.active_on(date.naive_local())
            && self.start_time as i64 <= seconds
            && seconds <= self.end_time as i64
        {
            return Some(date);
        }
        let previous = date - Duration::days(1);
        let wrapped = seconds + SECONDS_PER_DAY;
        if self.active_on(previous.naive_local())
            && self.start_time as i64 <= wrapped
            && wrapped <= self.end_time as i64
        {
            return Some(previous);
        }
        None
    }
}

/// A stop of the schedule, kept around for the read-only views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopInfo {
    pub id: String,
    pub code: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// The processed form of one GTFS feed: shapes projected into the local
/// metre plane, stop times resolved and made monotone, brigades parsed.
/// Everything in here is immutable once built; it is cached on disk next to
/// the feed zip so that later runs skip the preprocessing.
#[derive(Debug, Serialize, Deserialize)]
pub struct ScheduleData {
    pub feed_start_date: NaiveDate,
    pub feed_end_date: NaiveDate,
    pub projection: LocalProjection,
    pub routes: HashMap<String, Route>,
    pub routes_by_short_name: HashMap<String, String>,
    pub trips: HashMap<String, Arc<Trip>>,
    pub stops_by_code: HashMap<String, StopInfo>,
}

impl ScheduleData {
    /// Loads the processed schedule for a GTFS zip, using the serialized
    /// cache file next to it when that is newer than the zip.
    pub fn load_or_build(filename: &str) -> FnResult<ScheduleData> {
        let cache_filename = format!("{}{}", filename, CACHE_SUFFIX);
        if let Ok(data) = Self::load_cache_if_fresh(filename, &cache_filename) {
            return Ok(data);
        }

        let gtfs = gtfs_structures::Gtfs::new(filename)?;
        let data = preprocessing::build_schedule_data(&gtfs)?;
        if let Err(e) = data.write_cache(&cache_filename) {
            eprintln!("Could not write schedule cache {}: {}", cache_filename, e);
        }
        Ok(data)
    }

    fn load_cache_if_fresh(filename: &str, cache_filename: &str) -> FnResult<ScheduleData> {
        let zip_modified = fs::metadata(filename)?.modified()?;
        let cache_metadata = fs::metadata(cache_filename)?;
        if cache_metadata.modified()? < zip_modified {
            bail!("Schedule cache is older than the feed itself.");
        }
        let mut buffer = Vec::<u8>::new();
        File::open(cache_filename)?.read_to_end(&mut buffer)?;
        let parsed = rmp_serde::from_read_ref::<_, Self>(&buffer)?;
        Ok(parsed)
    }

    fn write_cache(&self, cache_filename: &str) -> FnResult<()> {
        let buffer = rmp_serde::to_vec(self)?;
        File::create(cache_filename)?.write_all(&buffer)?;
        Ok(())
    }

    pub fn route_by_short_name(&self, short_name: &str) -> Option<&Route> {
        self.routes_by_short_name
            .get(short_name)
            .and_then(|route_id| self.routes.get(route_id))
    }

    /// The trip candidate oracle: all trips of the route that match the
    /// fix's brigade and whose service window (with overnight wraparound)
    /// covers the fix's timestamp, except those already eliminated.
    pub fn active_trips(
        &self,
        route: &Route,
        fix: &RawVehicleData,
        exclude_trips: &[String],
    ) -> Vec<(Arc<Trip>, Date<Local>)> {
        route
            .trip_ids
            .iter()
            .filter(|trip_id| !exclude_trips.contains(*trip_id))
            .filter_map(|trip_id| self.trips.get(trip_id))
            .filter(|trip| trip.brigade_id == Some(fix.brigade_id))
            .filter_map(|trip| trip.service_day_for(fix.timestamp).map(|day| (Arc::clone(trip), day)))
            .collect()
    }
}

pub fn seconds_since_midnight(timestamp: DateTime<Local>) -> i64 {
    (timestamp - timestamp.date().and_hms(0, 0, 0)).num_seconds()
}

pub fn local_date(date: NaiveDate) -> Date<Local> {
    Local.from_local_date(&date).unwrap() // local dates coming from the schedule are always representable
}

#[cfg(test)]
pub mod testing {
    //! Builders for small in-memory schedules used across the test modules.

    use super::*;

    pub fn stop(sequence: u16, code: &str, arrival: i32, departure: i32, shape_dist: f64) -> TripStopTime {
        let projection = LocalProjection::new(0.0, 0.0);
        let position = Point::new(shape_dist, 0.0);
        let (latitude, longitude) = projection.unproject(&position);
        TripStopTime {
            stop_sequence: sequence,
            stop_id: format!("stop-{}", code),
            stop_code: String::from(code),
            stop_name: format!("Stop {}", code),
            arrival_time: arrival,
            departure_time: departure,
            shape_dist,
            position,
            latitude,
            longitude,
        }
    }

    pub fn straight_trip(
        id: &str,
        route_id: &str,
        brigade_id: i32,
        length: f64,
        stop_times: Vec<TripStopTime>,
        service_days: Vec<NaiveDate>,
    ) -> Trip {
        let shape = ShapeLine::new(vec![Point::new(0.0, 0.0), Point::new(length, 0.0)]);
        let start_time = stop_times.first().map(|st| st.departure_time).unwrap_or(0);
        let end_time = stop_times.last().map(|st| st.arrival_time).unwrap_or(0);
        Trip {
            id: String::from(id),
            route_id: String::from(route_id),
            brigade_id: Some(brigade_id),
            headsign: None,
            shape,
            stop_times,
            start_time,
            end_time,
            service_days,
        }
    }

    pub fn schedule_with_trips(short_name: &str, route_id: &str, trips: Vec<Trip>) -> Arc<ScheduleData> {
        let mut all_days: Vec<NaiveDate> = trips.iter().flat_map(|t| t.service_days.clone()).collect();
        all_days.sort();
        let feed_start_date = *all_days.first().unwrap();
        let feed_end_date = *all_days.last().unwrap();

        let mut trip_map = HashMap::new();
        let mut trip_ids = Vec::new();
        let mut stops_by_code = HashMap::new();
        for trip in trips {
            trip_ids.push(trip.id.clone());
            for stop_time in &trip.stop_times {
                stops_by_code.insert(
                    stop_time.stop_code.clone(),
                    StopInfo {
                        id: stop_time.stop_id.clone(),
                        code: stop_time.stop_code.clone(),
                        name: stop_time.stop_name.clone(),
                        latitude: stop_time.latitude,
                        longitude: stop_time.longitude,
                    },
                );
            }
            trip_map.insert(trip.id.clone(), Arc::new(trip));
        }

        let mut routes = HashMap::new();
        routes.insert(
            String::from(route_id),
            Route {
                id: String::from(route_id),
                short_name: String::from(short_name),
                trip_ids,
            },
        );
        let mut routes_by_short_name = HashMap::new();
        routes_by_short_name.insert(String::from(short_name), String::from(route_id));

        Arc::new(ScheduleData {
            feed_start_date,
            feed_end_date,
            projection: LocalProjection::new(0.0, 0.0),
            routes,
            routes_by_short_name,
            trips: trip_map,
            stops_by_code,
        })
    }

    /// A fix whose position corresponds to the given point in the test
    /// schedule's projected plane.
    pub fn fix_at(
        schedule: &ScheduleData,
        vehicle_id: i32,
        route_name: &str,
        brigade_id: i32,
        point: Point<f64>,
        timestamp: DateTime<Local>,
    ) -> RawVehicleData {
        let (latitude, longitude) = schedule.projection.unproject(&point);
        RawVehicleData {
            id: None,
            vehicle_id,
            route_name: String::from(route_name),
            brigade_id,
            latitude,
            longitude,
            timestamp,
            processed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::testing::*;

    #[test]
    fn test_overnight_trip_covers_early_morning_fix() {
        let day = NaiveDate::from_ymd(2024, 3, 4);
        let trip = straight_trip(
            "night_1",
            "route-n",
            1,
            1000.0,
            vec![
                stop(1, "A", 24 * 3600, 24 * 3600, 100.0),
                stop(2, "B", 25 * 3600, 25 * 3600, 900.0),
            ],
            vec![day],
        );
        // 00:30 on the next calendar day falls into the previous service day
        let fix_time = local_date(NaiveDate::from_ymd(2024, 3, 5)).and_hms(0, 30, 0);
        assert_eq!(trip.service_day_for(fix_time), Some(local_date(day)));
        // 00:30 two days later does not
        let fix_time = local_date(NaiveDate::from_ymd(2024, 3, 6)).and_hms(0, 30, 0);
        assert_eq!(trip.service_day_for(fix_time), None);
    }

    #[test]
    fn test_active_trips_matches_brigade_and_window() {
        let day = NaiveDate::from_ymd(2024, 3, 4);
        let trip_a = straight_trip(
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
        let trip_b = straight_trip(
            "trip_2",
            "route-33",
            2,
            1000.0,
            vec![
                stop(1, "A", 6 * 3600, 6 * 3600, 100.0),
                stop(2, "B", 7 * 3600, 7 * 3600, 900.0),
            ],
            vec![day],
        );
        let schedule = schedule_with_trips("33", "route-33", vec![trip_a, trip_b]);
        let route = schedule.route_by_short_name("33").unwrap();
        let fix = fix_at(
            &schedule,
            7001,
            "33",
            1,
            geo::Point::new(300.0, 0.0),
            local_date(day).and_hms(6, 15, 0),
        );

        let candidates = schedule.active_trips(route, &fix, &[]);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0.id, "trip_1");

        let excluded = schedule.active_trips(route, &fix, &[String::from("trip_1")]);
        assert!(excluded.is_empty());
    }
}
