use chrono::{DateTime, Local};

/// The prediction container for one downstream stop of a trip instance.
/// `made_at_vehicle_stop_time_id` records the arrival event that produced
/// it; the whole set for a trip instance is replaced on the next event.
#[derive(Debug, Clone)]
pub struct StopPrediction {
    pub trip_instance_id: u64,
    pub stop_sequence: u16,
    pub stop_code: String,
    pub made_at_vehicle_stop_time_id: u64,
}

/// One surviving entry of a stop's arrival-minute distribution.
#[derive(Debug, Clone)]
pub struct StopTimePrediction {
    pub probability: f64,
    pub time: DateTime<Local>,
}
