use crate::types::VehicleState;

use super::guess;

/// Outcome of comparing two vehicles that both claim the same trip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConflictWinner {
    NewState,
    OtherState,
    Undecided,
}

/// Decides which of two claimants keeps a contested trip: the one whose raw
/// fix yields the smaller absolute delay against that trip. When a delay
/// cannot be computed for either, nothing can be decided and both bindings
/// are left alone. Staleness is handled by the caller before this runs.
pub fn resolve_conflict(new_state: &VehicleState, other: &VehicleState) -> ConflictWinner {
    let new_delay = guess::guess_delay(&new_state.schedule, &new_state.trip, &new_state.raw);
    let other_delay = guess::guess_delay(&new_state.schedule, &new_state.trip, &other.raw);

    match (new_delay, other_delay) {
        (Some(new_delay), Some(other_delay)) => {
            if new_delay.num_seconds().abs() < other_delay.num_seconds().abs() {
                ConflictWinner::NewState
            } else {
                ConflictWinner::OtherState
            }
        }
        _ => ConflictWinner::Undecided,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::Arc;
    use crate::schedule::local_date;
    use crate::schedule::testing::*;
    use crate::tracker::guess::guess_vehicle_data_with_trip;

    #[test]
    fn test_smaller_absolute_delay_wins() {
        let day = NaiveDate::from_ymd(2024, 3, 4);
        let trip = straight_trip(
            "trip_1",
            "route-33",
            1,
            1000.0,
            vec![
                stop(1, "A", 6 * 3600, 6 * 3600, 100.0),
                stop(2, "B", 6 * 3600 + 900, 6 * 3600 + 900, 400.0),
                stop(3, "C", 7 * 3600, 7 * 3600, 900.0),
            ],
            vec![day],
        );
        let schedule = schedule_with_trips("33", "route-33", vec![trip]);
        let trip = Arc::clone(schedule.trips.get("trip_1").unwrap());

        // vehicle 1 reports 15 s before stop B's departure, vehicle 2
        // 90 s before it: vehicle 1 has the smaller |delay|
        let fix_close = fix_at(
            &schedule,
            1,
            "33",
            1,
            geo::Point::new(300.0, 0.0),
            local_date(day).and_hms(6, 14, 45),
        );
        let fix_far = fix_at(
            &schedule,
            2,
            "33",
            1,
            geo::Point::new(300.0, 0.0),
            local_date(day).and_hms(6, 13, 30),
        );

        let close_state =
            guess_vehicle_data_with_trip(&schedule, &trip, local_date(day), &fix_close).unwrap();
        let far_state =
            guess_vehicle_data_with_trip(&schedule, &trip, local_date(day), &fix_far).unwrap();

        assert_eq!(resolve_conflict(&close_state, &far_state), ConflictWinner::NewState);
        assert_eq!(resolve_conflict(&far_state, &close_state), ConflictWinner::OtherState);
    }
}
