use chrono::{DateTime, Local, NaiveDateTime};
use chrono::offset::TimeZone;
use mysql::*;
use mysql::prelude::*;

/// An observed stop visit: when a vehicle actually arrived at (and later
/// left) a scheduled stop of its trip instance. Either time may be missing;
/// an interpolated crossing has both set to the same instant.
#[derive(Debug, Clone)]
pub struct VehicleStopTime {
    pub id: u64,
    pub trip_instance_id: u64,
    pub stop_sequence: u16,
    pub stop_code: String,
    pub arrival_time: Option<DateTime<Local>>,
    pub departure_time: Option<DateTime<Local>>,
}

impl FromRow for VehicleStopTime {
    fn from_row_opt(row: Row) -> std::result::Result<Self, FromRowError> {
        Ok(VehicleStopTime {
            id: row.get::<u64, _>(0).unwrap(),
            trip_instance_id: row.get::<u64, _>(1).unwrap(),
            stop_sequence: row.get::<u16, _>(2).unwrap(),
            stop_code: row.get::<String, _>(3).unwrap(),
            arrival_time: row
                .get_opt::<NaiveDateTime, _>(4)
                .unwrap()
                .ok()
                .map(|naive| Local.from_local_datetime(&naive).unwrap()),
            departure_time: row
                .get_opt::<NaiveDateTime, _>(5)
                .unwrap()
                .ok()
                .map(|naive| Local.from_local_datetime(&naive).unwrap()),
        })
    }
}
