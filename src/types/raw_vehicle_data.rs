use chrono::{DateTime, Local, NaiveDateTime};
use chrono::offset::TimeZone;
use mysql::*;
use mysql::prelude::*;

/// A single position report from the vehicle feed: who, where and when.
/// Records arrive once per vehicle per polling tick and are persisted with
/// a `processed` flag so that history can be replayed in batch.
#[derive(Debug, Clone)]
pub struct RawVehicleData {
    pub id: Option<u64>,
    pub vehicle_id: i32,
    pub route_name: String,
    pub brigade_id: i32,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Local>,
    pub processed: bool,
}

impl RawVehicleData {
    /// Records with an empty route name or out-of-range coordinates are
    /// discarded without error.
    pub fn is_valid(&self) -> bool {
        !self.route_name.is_empty()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

impl FromRow for RawVehicleData {
    fn from_row_opt(row: Row) -> std::result::Result<Self, FromRowError> {
        Ok(RawVehicleData {
            id: Some(row.get::<u64, _>(0).unwrap()),
            vehicle_id: row.get::<i32, _>(1).unwrap(),
            route_name: row.get::<String, _>(2).unwrap(),
            brigade_id: row.get::<i32, _>(3).unwrap(),
            latitude: row.get::<f64, _>(4).unwrap(),
            longitude: row.get::<f64, _>(5).unwrap(),
            timestamp: Local.from_local_datetime(&row.get::<NaiveDateTime, _>(6).unwrap()).unwrap(),
            processed: row.get::<bool, _>(7).unwrap(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(route_name: &str, latitude: f64, longitude: f64) -> RawVehicleData {
        RawVehicleData {
            id: None,
            vehicle_id: 7001,
            route_name: String::from(route_name),
            brigade_id: 1,
            latitude,
            longitude,
            timestamp: Local::now(),
            processed: false,
        }
    }

    #[test]
    fn test_validity() {
        assert!(fix("33", 51.1, 17.0).is_valid());
        assert!(!fix("", 51.1, 17.0).is_valid());
        assert!(!fix("33", 91.0, 17.0).is_valid());
        assert!(!fix("33", 51.1, -181.0).is_valid());
    }
}
