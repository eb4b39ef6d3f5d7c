use chrono::{DateTime, Duration, Local};

use crate::types::VehicleState;

use super::{DIRECT_ARRIVAL_TOLERANCE, NEXT_STOP_SLACK, STALE_MINUTES};

/// What comparing two consecutive states of the same vehicle revealed.
/// Arrivals reference a stop of the *old* state's trip by index; `dwell`
/// tells the coordinator whether the vehicle is now standing at that stop
/// (direct arrival) or already past it (interpolated crossing), and thereby
/// which trip instance the visit belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum StopTransition {
    Departure {
        vehicle_stop_time_id: u64,
        departure_time: DateTime<Local>,
    },
    Arrival {
        stop_index: usize,
        arrival_time: DateTime<Local>,
        departure_time: Option<DateTime<Local>>,
        dwell: bool,
    },
}

/// Compares the previous and the current state of a vehicle and derives
/// stop events. Only runs for 0 < Δt ≤ 5 min; anything else is either a
/// duplicate fix or a gap too large to interpolate across.
pub fn detect_transitions(old: &VehicleState, new: &VehicleState) -> Vec<StopTransition> {
    let mut transitions = Vec::new();

    let elapsed = new.timestamp - old.timestamp;
    if elapsed <= Duration::zero() || elapsed > Duration::minutes(STALE_MINUTES) {
        return transitions;
    }

    // departure: the vehicle was dwelling at a stop and has now moved past it
    if let Some(dwelling) = &old.current_stop {
        let stop_time = &old.trip.stop_times[dwelling.stop_index];
        if stop_time.shape_dist + NEXT_STOP_SLACK < new.shape_dist {
            transitions.push(StopTransition::Departure {
                vehicle_stop_time_id: dwelling.vehicle_stop_time_id,
                departure_time: old.timestamp,
            });
        }
    }

    // arrival: exactly one stop was crossed between the two fixes
    if old.next_stop_time().stop_sequence + 1 != new.next_stop_time().stop_sequence {
        return transitions;
    }
    let crossed = old.next_stop_time();

    if (crossed.shape_dist - new.shape_dist).abs() < DIRECT_ARRIVAL_TOLERANCE {
        // the new fix *is* the arrival; the vehicle dwells at the stop
        transitions.push(StopTransition::Arrival {
            stop_index: old.next_stop_index,
            arrival_time: new.timestamp,
            departure_time: None,
            dwell: true,
        });
    } else if old.shape_dist < crossed.shape_dist && crossed.shape_dist < new.shape_dist {
        // the stop was passed somewhere between the two fixes; interpolate
        // the crossing time proportionally to distance
        let total_dist = new.shape_dist - old.shape_dist;
        let dist_part = (crossed.shape_dist - old.shape_dist) / total_dist;
        let elapsed_millis = elapsed.num_milliseconds() as f64;
        let crossing_time = old.timestamp + Duration::milliseconds((elapsed_millis * dist_part) as i64);
        transitions.push(StopTransition::Arrival {
            stop_index: old.next_stop_index,
            arrival_time: crossing_time,
            departure_time: Some(crossing_time),
            dwell: false,
        });
    }

    transitions
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::Arc;
    use crate::schedule::local_date;
    use crate::schedule::testing::*;
    use crate::tracker::guess;
    use crate::types::DwellingStop;

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

    fn state_at(
        schedule: &Arc<crate::schedule::ScheduleData>,
        x: f64,
        timestamp: chrono::DateTime<Local>,
    ) -> VehicleState {
        let trip = Arc::clone(schedule.trips.get("trip_1").unwrap());
        let fix = fix_at(schedule, 7001, "33", 1, geo::Point::new(x, 0.0), timestamp);
        guess::guess_vehicle_data_with_trip(schedule, &trip, local_date(test_day()), &fix).unwrap()
    }

    #[test]
    fn test_interpolated_arrival() {
        let schedule = schedule();
        // 300 m at 06:15:00, 500 m at 06:15:40; stop B at 400 m was
        // crossed halfway: 06:15:20
        let old = state_at(&schedule, 300.0, local_date(test_day()).and_hms(6, 15, 0));
        let new = state_at(&schedule, 500.0, local_date(test_day()).and_hms(6, 15, 40));
        assert_eq!(old.next_stop_time().stop_code, "B");
        assert_eq!(new.next_stop_time().stop_code, "C");

        let transitions = detect_transitions(&old, &new);
        assert_eq!(transitions.len(), 1);
        match &transitions[0] {
            StopTransition::Arrival { arrival_time, departure_time, dwell, stop_index } => {
                let expected = local_date(test_day()).and_hms(6, 15, 20);
                assert_eq!(*arrival_time, expected);
                assert_eq!(*departure_time, Some(expected));
                assert!(!*dwell);
                assert_eq!(old.trip.stop_times[*stop_index].stop_code, "B");
            }
            other => panic!("expected an arrival, got {:?}", other),
        }
    }

    #[test]
    fn test_direct_arrival_opens_dwell() {
        let schedule = schedule();
        let old = state_at(&schedule, 300.0, local_date(test_day()).and_hms(6, 15, 0));
        // the new fix lands 15 m short of stop B, within the 30 m
        // tolerance, but already targeting stop C
        let new = state_at(&schedule, 385.0, local_date(test_day()).and_hms(6, 15, 30));
        assert_eq!(new.next_stop_time().stop_code, "C");

        let transitions = detect_transitions(&old, &new);
        assert_eq!(transitions.len(), 1);
        match &transitions[0] {
            StopTransition::Arrival { arrival_time, departure_time, dwell, .. } => {
                assert_eq!(*arrival_time, new.timestamp);
                assert_eq!(*departure_time, None);
                assert!(*dwell);
            }
            other => panic!("expected an arrival, got {:?}", other),
        }
    }

    #[test]
    fn test_departure_stamped_when_leaving_dwell() {
        let schedule = schedule();
        let mut old = state_at(&schedule, 395.0, local_date(test_day()).and_hms(6, 30, 0));
        // dwelling at stop B (index 1), bound to the visit row 42
        old.current_stop = Some(DwellingStop { vehicle_stop_time_id: 42, stop_index: 1 });
        let new = state_at(&schedule, 450.0, local_date(test_day()).and_hms(6, 30, 30));

        let transitions = detect_transitions(&old, &new);
        assert!(transitions.contains(&StopTransition::Departure {
            vehicle_stop_time_id: 42,
            departure_time: old.timestamp,
        }));
    }

    #[test]
    fn test_no_departure_within_slack() {
        let schedule = schedule();
        let mut old = state_at(&schedule, 395.0, local_date(test_day()).and_hms(6, 30, 0));
        old.current_stop = Some(DwellingStop { vehicle_stop_time_id: 42, stop_index: 1 });
        // 415 m is within 20 m of stop B at 400 m, so the vehicle has not left
        let new = state_at(&schedule, 415.0, local_date(test_day()).and_hms(6, 30, 30));

        let transitions = detect_transitions(&old, &new);
        assert!(transitions.is_empty());
    }

    #[test]
    fn test_zero_elapsed_time_is_a_no_op() {
        let schedule = schedule();
        let timestamp = local_date(test_day()).and_hms(6, 15, 0);
        let old = state_at(&schedule, 300.0, timestamp);
        let new = state_at(&schedule, 500.0, timestamp);
        assert!(detect_transitions(&old, &new).is_empty());
    }

    #[test]
    fn test_stale_gap_is_ignored() {
        let schedule = schedule();
        let old = state_at(&schedule, 300.0, local_date(test_day()).and_hms(6, 15, 0));
        let new = state_at(&schedule, 500.0, local_date(test_day()).and_hms(6, 21, 0));
        assert!(detect_transitions(&old, &new).is_empty());
    }

    #[test]
    fn test_no_arrival_when_two_stops_crossed() {
        let schedule = schedule();
        let old = state_at(&schedule, 70.0, local_date(test_day()).and_hms(6, 15, 0));
        assert_eq!(old.next_stop_time().stop_code, "A");
        let new = state_at(&schedule, 500.0, local_date(test_day()).and_hms(6, 16, 0));
        assert_eq!(new.next_stop_time().stop_code, "C");
        // sequence jumped from 1 to 3: no event can be derived
        assert!(detect_transitions(&old, &new).is_empty());
    }
}
