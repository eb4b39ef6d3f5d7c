mod average_travel_time;
mod gtfs_time;
mod predictions;
mod raw_vehicle_data;
mod vehicle_state;
mod vehicle_stop_time;

pub use average_travel_time::AverageTravelTime;
pub use gtfs_time::GtfsDateTime;
pub use predictions::{StopPrediction, StopTimePrediction};
pub use raw_vehicle_data::RawVehicleData;
pub use vehicle_state::{DwellingStop, TripInstance, VehicleState};
pub use vehicle_stop_time::VehicleStopTime;
