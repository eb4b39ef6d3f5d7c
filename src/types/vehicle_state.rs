use chrono::{Date, DateTime, Local};
use geo::Point;
use std::sync::Arc;

use crate::schedule::{ScheduleData, Trip, TripStopTime};
use crate::types::RawVehicleData;

/// A concrete execution of a trip: created the first time a vehicle is
/// bound to the trip, persisted on commit, destroyed when the binding loses
/// a conflict. The id stays `None` until the commit happened.
#[derive(Debug, Clone)]
pub struct TripInstance {
    pub id: Option<u64>,
    pub trip_id: String,
    pub service_day: Date<Local>,
    pub started_at: DateTime<Local>,
}

impl TripInstance {
    pub fn new(trip_id: &str, service_day: Date<Local>, started_at: DateTime<Local>) -> TripInstance {
        TripInstance {
            id: None,
            trip_id: String::from(trip_id),
            service_day,
            started_at,
        }
    }
}

/// The stop a vehicle is currently dwelling at, pointing at the stop visit
/// row that was opened when it arrived there.
#[derive(Debug, Clone)]
pub struct DwellingStop {
    pub vehicle_stop_time_id: u64,
    pub stop_index: usize,
}

/// Everything the pipeline knows about a live vehicle, derived from its
/// most recent fix. The map of these states (keyed by vehicle id) is the
/// single source of truth for "what is happening now"; entries go stale
/// after five minutes of silence.
#[derive(Debug, Clone)]
pub struct VehicleState {
    pub vehicle_id: i32,
    pub schedule: Arc<ScheduleData>,
    pub route_id: String,
    pub trip: Arc<Trip>,
    pub trip_instance: TripInstance,
    pub next_stop_index: usize,
    pub position: Point<f64>,
    pub timestamp: DateTime<Local>,
    pub shape_dist: f64,
    pub current_stop: Option<DwellingStop>,
    pub raw: RawVehicleData,
}

impl VehicleState {
    pub fn next_stop_time(&self) -> &TripStopTime {
        &self.trip.stop_times[self.next_stop_index]
    }
}
