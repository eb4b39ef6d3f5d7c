use chrono::{Date, Duration, Local};
use geo::Point;
use std::sync::Arc;

use crate::schedule::{seconds_since_midnight, Route, RouteInfo, ScheduleData, SharedScheduleIndex, Trip, SECONDS_PER_DAY};
use crate::types::{RawVehicleData, TripInstance, VehicleState};

use super::{ANCHOR_SLACK, MAP_MATCH_RADIUS, NEXT_STOP_SLACK};

/// Finds the route a fix belongs to, trying the fix's own date first and
/// then the previous date, so that fixes of 25+-hour trips still find the
/// route under yesterday's service day. The entry whose absolute window
/// contains the timestamp wins.
pub fn guess_route(index: &SharedScheduleIndex, fix: &RawVehicleData) -> Option<RouteInfo> {
    if fix.route_name.is_empty() {
        return None;
    }
    for date in &[fix.timestamp.date(), fix.timestamp.date() - Duration::days(1)] {
        if let Some(info) = index.route_info(&fix.route_name, *date) {
            if info.window_start <= fix.timestamp && fix.timestamp <= info.window_end {
                return Some(info);
            }
        }
    }
    None
}

/// Elects the trip for a fix: a single candidate wins outright, otherwise
/// the candidate with the smallest absolute delay wins. No candidate with a
/// computable delay means no trip.
pub fn guess_trip(
    schedule: &ScheduleData,
    route: &Route,
    fix: &RawVehicleData,
    exclude_trips: &[String],
) -> Option<(Arc<Trip>, Date<Local>)> {
    let candidates = schedule.active_trips(route, fix, exclude_trips);
    if candidates.is_empty() {
        return None;
    }
    if candidates.len() == 1 {
        return candidates.into_iter().next();
    }

    candidates
        .into_iter()
        .filter_map(|(trip, day)| {
            guess_delay(schedule, &trip, fix).map(|delay| (trip, day, delay))
        })
        .min_by_key(|(_, _, delay)| delay.num_seconds().abs())
        .map(|(trip, day, _)| (trip, day))
}

/// Delay of a (trip, fix) pair: scheduled departure at the next stop minus
/// the fix's offset into the day, normalised for overnight wrap so the
/// result lies near zero rather than near ±24 h.
pub fn guess_delay(schedule: &ScheduleData, trip: &Trip, fix: &RawVehicleData) -> Option<Duration> {
    let position = schedule.projection.project(fix.latitude, fix.longitude);
    let shape_dist = shape_dist_with_anchor(trip, &position, None)?;
    let next_index = next_stop_index(trip, shape_dist)?;
    let departure = trip.stop_times[next_index].departure_time as i64;
    let since_midnight = Duration::seconds(seconds_since_midnight(fix.timestamp));

    if departure < SECONDS_PER_DAY {
        Some(Duration::seconds(departure) - since_midnight)
    } else {
        Some(Duration::seconds(departure) - since_midnight - Duration::days(1))
    }
}

/// Map-matches a position onto the trip's shape. All distinct projections
/// are enumerated; with an anchor (warm update) candidates may not fall
/// behind it by more than the slack, and the one closest to the anchor
/// wins. A cold guess takes the lowest arclength.
pub fn shape_dist_with_anchor(trip: &Trip, position: &Point<f64>, anchor: Option<f64>) -> Option<f64> {
    let candidates = trip
        .shape
        .candidate_shape_distances(position, MAP_MATCH_RADIUS, MAP_MATCH_RADIUS);
    match anchor {
        None => candidates.into_iter().min_by(|a, b| a.partial_cmp(b).unwrap()), // arclengths are finite
        Some(anchor) => candidates
            .into_iter()
            .filter(|shape_dist| *shape_dist >= anchor - ANCHOR_SLACK)
            .min_by(|a, b| (a - anchor).partial_cmp(&(b - anchor)).unwrap()), // arclengths are finite
    }
}

/// The next stop for a position on the trip: the lowest-sequence stop whose
/// shape-distance lies at least the lookahead slack ahead.
pub fn next_stop_index(trip: &Trip, shape_dist: f64) -> Option<usize> {
    trip.stop_times
        .iter()
        .position(|stop_time| stop_time.shape_dist >= shape_dist + NEXT_STOP_SLACK)
}

/// Cold inference: route → trip → shape-distance → next stop, with a fresh
/// trip instance that stays unpersisted until the coordinator accepts it.
pub fn guess_vehicle_data(
    index: &SharedScheduleIndex,
    fix: &RawVehicleData,
    exclude_trips: &[String],
) -> Option<VehicleState> {
    let info = guess_route(index, fix)?;
    let route = info.schedule.routes.get(&info.route_id)?;
    let (trip, service_day) = guess_trip(&info.schedule, route, fix, exclude_trips)?;
    guess_vehicle_data_with_trip(&info.schedule, &trip, service_day, fix)
}

pub fn guess_vehicle_data_with_trip(
    schedule: &Arc<ScheduleData>,
    trip: &Arc<Trip>,
    service_day: Date<Local>,
    fix: &RawVehicleData,
) -> Option<VehicleState> {
    let position = schedule.projection.project(fix.latitude, fix.longitude);
    let shape_dist = shape_dist_with_anchor(trip, &position, None)?;
    let next_stop_index = next_stop_index(trip, shape_dist)?;

    Some(VehicleState {
        vehicle_id: fix.vehicle_id,
        schedule: Arc::clone(schedule),
        route_id: trip.route_id.clone(),
        trip: Arc::clone(trip),
        trip_instance: TripInstance::new(&trip.id, service_day, fix.timestamp),
        next_stop_index,
        position,
        timestamp: fix.timestamp,
        shape_dist,
        current_stop: None,
        raw: fix.clone(),
    })
}

/// When a vehicle runs off the end of its trip, the trip whose id differs
/// only in the numeric suffix `_N → _{N+1}` is its natural successor,
/// provided that successor starts no earlier than the current trip ends.
pub fn guess_next_trip(state: &VehicleState) -> Option<Arc<Trip>> {
    let parts: Vec<&str> = state.trip.id.split('_').collect();
    if parts.len() != 2 {
        return None;
    }
    let number: u64 = parts[1].parse().ok()?;
    let next_trip_id = format!("{}_{}", parts[0], number + 1);

    let next_trip = state.schedule.trips.get(&next_trip_id)?;
    if next_trip.start_time < state.trip.end_time {
        return None;
    }
    Some(Arc::clone(next_trip))
}

pub fn guess_vehicle_data_after_end_of_trip(
    index: &SharedScheduleIndex,
    fix: &RawVehicleData,
    state: &VehicleState,
) -> Option<VehicleState> {
    match guess_next_trip(state) {
        None => guess_vehicle_data(index, fix, &[]),
        Some(next_trip) => {
            let service_day = next_trip
                .service_day_for(fix.timestamp)
                .unwrap_or(state.trip_instance.service_day);
            guess_vehicle_data_with_trip(&state.schedule, &next_trip, service_day, fix)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use crate::schedule::{local_date, IndexMode, ScheduleIndex};
    use crate::schedule::testing::*;

    fn test_day() -> NaiveDate {
        NaiveDate::from_ymd(2024, 3, 4)
    }

    fn single_trip_schedule() -> Arc<crate::schedule::ScheduleData> {
        let trip = straight_trip(
            "trip_1",
            "route-33",
            1,
            1000.0,
            vec![
                stop(1, "A", 6 * 3600, 6 * 3600, 100.0),
                stop(2, "B", 6 * 3600 + 1800, 6 * 3600 + 1800, 400.0),
                stop(3, "C", 7 * 3600, 7 * 3600, 900.0),
            ],
            vec![test_day()],
        );
        schedule_with_trips("33", "route-33", vec![trip])
    }

    fn index_for(schedule: Arc<crate::schedule::ScheduleData>) -> SharedScheduleIndex {
        SharedScheduleIndex::new(ScheduleIndex::from_feeds(vec![schedule], IndexMode::Batch))
    }

    #[test]
    fn test_cold_guess_on_unique_candidate() {
        let schedule = single_trip_schedule();
        let index = index_for(Arc::clone(&schedule));
        let fix = fix_at(
            &schedule,
            7001,
            "33",
            1,
            geo::Point::new(300.0, 5.0),
            local_date(test_day()).and_hms(6, 15, 0),
        );

        let state = guess_vehicle_data(&index, &fix, &[]).unwrap();
        assert_eq!(state.trip.id, "trip_1");
        assert!((state.shape_dist - 300.0).abs() < 1.0);
        // next stop is the lowest-sequence stop at least 20 m ahead
        assert_eq!(state.next_stop_time().stop_code, "B");
        assert!(state.trip_instance.id.is_none());
        assert_eq!(state.trip_instance.started_at, fix.timestamp);
        assert_eq!(state.trip_instance.service_day, local_date(test_day()));
    }

    #[test]
    fn test_guess_fails_without_route_or_brigade() {
        let schedule = single_trip_schedule();
        let index = index_for(Arc::clone(&schedule));

        let wrong_route = fix_at(
            &schedule,
            7001,
            "99",
            1,
            geo::Point::new(300.0, 0.0),
            local_date(test_day()).and_hms(6, 15, 0),
        );
        assert!(guess_vehicle_data(&index, &wrong_route, &[]).is_none());

        let wrong_brigade = fix_at(
            &schedule,
            7001,
            "33",
            9,
            geo::Point::new(300.0, 0.0),
            local_date(test_day()).and_hms(6, 15, 0),
        );
        assert!(guess_vehicle_data(&index, &wrong_brigade, &[]).is_none());
    }

    #[test]
    fn test_guess_trip_prefers_smallest_absolute_delay() {
        // two trips of the same brigade running the same shape, one on
        // time for a 6:15 fix at 300 m, the other an hour later
        let on_time = straight_trip(
            "trip_1",
            "route-33",
            1,
            1000.0,
            vec![
                stop(1, "A", 6 * 3600, 6 * 3600, 100.0),
                stop(2, "B", 6 * 3600 + 16 * 60, 6 * 3600 + 16 * 60, 400.0),
                stop(3, "C", 7 * 3600, 7 * 3600, 900.0),
            ],
            vec![test_day()],
        );
        let later = straight_trip(
            "trip_2",
            "route-33",
            1,
            1000.0,
            vec![
                stop(1, "A", 5 * 3600, 5 * 3600, 100.0),
                stop(2, "B", 7 * 3600 + 16 * 60, 7 * 3600 + 16 * 60, 400.0),
                stop(3, "C", 8 * 3600, 8 * 3600, 900.0),
            ],
            vec![test_day()],
        );
        let schedule = schedule_with_trips("33", "route-33", vec![on_time, later]);
        let route = schedule.route_by_short_name("33").unwrap();
        let fix = fix_at(
            &schedule,
            7001,
            "33",
            1,
            geo::Point::new(300.0, 0.0),
            local_date(test_day()).and_hms(6, 15, 0),
        );

        let (trip, _) = guess_trip(&schedule, route, &fix, &[]).unwrap();
        assert_eq!(trip.id, "trip_1");

        // excluding the winner elects the other candidate
        let (trip, _) = guess_trip(&schedule, route, &fix, &[String::from("trip_1")]).unwrap();
        assert_eq!(trip.id, "trip_2");
    }

    #[test]
    fn test_delay_normalisation_across_midnight() {
        let trip = straight_trip(
            "night_1",
            "route-n",
            1,
            1000.0,
            vec![
                stop(1, "A", 25 * 3600, 25 * 3600, 100.0),
                stop(2, "B", 25 * 3600 + 600, 25 * 3600 + 600, 900.0),
            ],
            vec![test_day()],
        );
        let schedule = schedule_with_trips("N", "route-n", vec![trip]);
        let trip = schedule.trips.get("night_1").unwrap();
        // 00:55 next day; the next stop departs at 25:00, so the vehicle
        // is 5 minutes early -- not 24 hours off
        let fix = fix_at(
            &schedule,
            7001,
            "N",
            1,
            geo::Point::new(50.0, 0.0),
            local_date(NaiveDate::from_ymd(2024, 3, 5)).and_hms(0, 55, 0),
        );
        let delay = guess_delay(&schedule, trip, &fix).unwrap();
        assert_eq!(delay.num_minutes(), 5);
    }

    #[test]
    fn test_overnight_guess_binds_previous_service_day() {
        let trip = straight_trip(
            "night_1",
            "route-n",
            1,
            1000.0,
            vec![
                stop(1, "A", 24 * 3600 + 1200, 24 * 3600 + 1200, 100.0),
                stop(2, "B", 25 * 3600, 25 * 3600, 900.0),
            ],
            vec![test_day()],
        );
        let schedule = schedule_with_trips("N", "route-n", vec![trip]);
        let index = index_for(Arc::clone(&schedule));
        let fix = fix_at(
            &schedule,
            7001,
            "N",
            1,
            geo::Point::new(50.0, 0.0),
            local_date(NaiveDate::from_ymd(2024, 3, 5)).and_hms(0, 30, 0),
        );

        let state = guess_vehicle_data(&index, &fix, &[]).unwrap();
        assert_eq!(state.trip.id, "night_1");
        assert_eq!(state.trip_instance.service_day, local_date(test_day()));
    }

    #[test]
    fn test_guess_next_trip_requires_compatible_times() {
        let schedule = {
            let five = straight_trip(
                "circuit_5",
                "route-33",
                1,
                1000.0,
                vec![
                    stop(1, "A", 6 * 3600, 6 * 3600, 100.0),
                    stop(2, "B", 7 * 3600, 7 * 3600, 900.0),
                ],
                vec![test_day()],
            );
            let six = straight_trip(
                "circuit_6",
                "route-33",
                1,
                1000.0,
                vec![
                    stop(1, "A", 7 * 3600 + 600, 7 * 3600 + 600, 100.0),
                    stop(2, "B", 8 * 3600, 8 * 3600, 900.0),
                ],
                vec![test_day()],
            );
            schedule_with_trips("33", "route-33", vec![five, six])
        };
        let trip = Arc::clone(schedule.trips.get("circuit_5").unwrap());
        // the vehicle has looped back to the start of the circuit
        let fix = fix_at(
            &schedule,
            7001,
            "33",
            1,
            geo::Point::new(50.0, 0.0),
            local_date(test_day()).and_hms(7, 2, 0),
        );
        let state = guess_vehicle_data_with_trip(
            &schedule,
            &trip,
            local_date(test_day()),
            &fix_at(
                &schedule,
                7001,
                "33",
                1,
                geo::Point::new(300.0, 0.0),
                local_date(test_day()).and_hms(6, 15, 0),
            ),
        )
        .unwrap();

        let next = guess_next_trip(&state).unwrap();
        assert_eq!(next.id, "circuit_6");

        let rebound = guess_vehicle_data_after_end_of_trip(
            &index_for(Arc::clone(&schedule)),
            &fix,
            &state,
        )
        .unwrap();
        assert_eq!(rebound.trip.id, "circuit_6");
    }

    #[test]
    fn test_update_anchor_picks_candidate_near_prior_distance() {
        // a shape that doubles back: positions between the legs project twice
        let shape_points = vec![
            geo::Point::new(0.0, 0.0),
            geo::Point::new(500.0, 0.0),
            geo::Point::new(500.0, 20.0),
            geo::Point::new(0.0, 20.0),
        ];
        let shape = crate::geometry::ShapeLine::new(shape_points);
        let trip = crate::schedule::Trip {
            id: String::from("loop_1"),
            route_id: String::from("route-l"),
            brigade_id: Some(1),
            headsign: None,
            shape,
            stop_times: vec![
                stop(1, "A", 6 * 3600, 6 * 3600, 50.0),
                stop(2, "B", 7 * 3600, 7 * 3600, 1000.0),
            ],
            start_time: 6 * 3600,
            end_time: 7 * 3600,
            service_days: vec![test_day()],
        };

        let position = geo::Point::new(250.0, 10.0);
        // cold guess picks the lowest candidate
        let cold = shape_dist_with_anchor(&trip, &position, None).unwrap();
        assert!((cold - 250.0).abs() < 1.0);
        // a warm update anchored on the return leg stays there
        let warm = shape_dist_with_anchor(&trip, &position, Some(760.0)).unwrap();
        assert!((warm - 770.0).abs() < 1.0);
    }

    #[test]
    fn test_route_window_rejects_fix_outside_service() {
        let schedule = single_trip_schedule();
        let index = index_for(Arc::clone(&schedule));
        let fix = fix_at(
            &schedule,
            7001,
            "33",
            1,
            geo::Point::new(300.0, 0.0),
            local_date(test_day()).and_hms(12, 0, 0),
        );
        assert!(guess_route(&index, &fix).is_none());
    }
}
