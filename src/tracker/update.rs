use crate::schedule::SharedScheduleIndex;
use crate::types::{RawVehicleData, VehicleState};

use super::guess;
use super::NEXT_STOP_SLACK;

/// Warm inference: extends a known vehicle state forward along the same
/// trip. Falls back to a cold guess when the fix no longer projects onto
/// the trip's shape, and to the successor trip (or a cold guess) when the
/// vehicle runs off the end.
pub fn update_vehicle_data(
    index: &SharedScheduleIndex,
    fix: &RawVehicleData,
    old: &VehicleState,
) -> Option<VehicleState> {
    let position = old.schedule.projection.project(fix.latitude, fix.longitude);

    let shape_dist = match guess::shape_dist_with_anchor(&old.trip, &position, Some(old.shape_dist)) {
        Some(shape_dist) => shape_dist,
        None => return guess::guess_vehicle_data(index, fix, &[]),
    };

    // only advance the next stop once the vehicle has come within the
    // lookahead slack of it; otherwise keep the current target
    let next_stop_index = if shape_dist <= old.next_stop_time().shape_dist - NEXT_STOP_SLACK {
        Some(old.next_stop_index)
    } else {
        guess::next_stop_index(&old.trip, shape_dist)
    };

    let next_stop_index = match next_stop_index {
        Some(index) => index,
        None => return guess::guess_vehicle_data_after_end_of_trip(index, fix, old),
    };

    Some(VehicleState {
        vehicle_id: fix.vehicle_id,
        schedule: old.schedule.clone(),
        route_id: old.route_id.clone(),
        trip: old.trip.clone(),
        trip_instance: old.trip_instance.clone(),
        next_stop_index,
        position,
        timestamp: fix.timestamp,
        shape_dist,
        current_stop: old.current_stop.clone(),
        raw: fix.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::Arc;
    use crate::schedule::{local_date, IndexMode, ScheduleIndex};
    use crate::schedule::testing::*;

    fn test_day() -> NaiveDate {
        NaiveDate::from_ymd(2024, 3, 4)
    }

    fn schedule() -> Arc<crate::schedule::ScheduleData> {
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

    fn state_at(schedule: &Arc<crate::schedule::ScheduleData>, x: f64, hour: u32, minute: u32) -> VehicleState {
        let trip = Arc::clone(schedule.trips.get("trip_1").unwrap());
        let fix = fix_at(
            schedule,
            7001,
            "33",
            1,
            geo::Point::new(x, 0.0),
            local_date(test_day()).and_hms(hour, minute, 0),
        );
        guess::guess_vehicle_data_with_trip(schedule, &trip, local_date(test_day()), &fix).unwrap()
    }

    #[test]
    fn test_update_advances_along_trip() {
        let schedule = schedule();
        let index = index_for(Arc::clone(&schedule));
        let old = state_at(&schedule, 300.0, 6, 15);

        let fix = fix_at(
            &schedule,
            7001,
            "33",
            1,
            geo::Point::new(500.0, 0.0),
            local_date(test_day()).and_hms(6, 16, 0),
        );
        let updated = update_vehicle_data(&index, &fix, &old).unwrap();
        assert_eq!(updated.trip.id, "trip_1");
        assert!((updated.shape_dist - 500.0).abs() < 1.0);
        // crossed stop B, now heading for C
        assert_eq!(updated.next_stop_time().stop_code, "C");
        // the trip instance is carried over, not re-minted
        assert_eq!(updated.trip_instance.started_at, old.trip_instance.started_at);
    }

    #[test]
    fn test_update_keeps_next_stop_short_of_slack() {
        let schedule = schedule();
        let index = index_for(Arc::clone(&schedule));
        let old = state_at(&schedule, 300.0, 6, 15);

        // 370 m is still more than 20 m short of stop B at 400 m
        let fix = fix_at(
            &schedule,
            7001,
            "33",
            1,
            geo::Point::new(370.0, 0.0),
            local_date(test_day()).and_hms(6, 16, 0),
        );
        let updated = update_vehicle_data(&index, &fix, &old).unwrap();
        assert_eq!(updated.next_stop_time().stop_code, "B");

        // at 385 m the vehicle is within the slack and the target advances
        let fix = fix_at(
            &schedule,
            7001,
            "33",
            1,
            geo::Point::new(385.0, 0.0),
            local_date(test_day()).and_hms(6, 17, 0),
        );
        let updated = update_vehicle_data(&index, &fix, &updated).unwrap();
        assert_eq!(updated.next_stop_time().stop_code, "C");
    }

    #[test]
    fn test_update_falls_back_to_guess_off_shape() {
        let schedule = schedule();
        let index = index_for(Arc::clone(&schedule));
        let old = state_at(&schedule, 300.0, 6, 15);

        // 300 m off the shape: no projection survives the 200 m radius,
        // and the cold-guess fallback cannot match the fix either
        let fix = fix_at(
            &schedule,
            7001,
            "33",
            1,
            geo::Point::new(350.0, 300.0),
            local_date(test_day()).and_hms(6, 16, 0),
        );
        let updated = update_vehicle_data(&index, &fix, &old);
        assert!(updated.is_none());
    }
}
