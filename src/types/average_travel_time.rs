use mysql::*;
use mysql::prelude::*;

/// One bin of the empirical travel-time distribution for a hop between two
/// stops at a given hour of day: the mean duration of the samples that fell
/// into the bin, and how many there were.
#[derive(Debug, Clone)]
pub struct AverageTravelTime {
    pub from_stop_code: String,
    pub to_stop_code: String,
    pub hour: u32,
    pub bin: i32,
    /// seconds
    pub average_travel_time: i64,
    pub count: i64,
}

impl AverageTravelTime {
    /// The synthetic sample that represents the schedule itself: one
    /// observation of the scheduled duration. It is appended to every hop
    /// distribution so that hops without history still get an estimate.
    pub fn schedule_sample(from_stop_code: &str, to_stop_code: &str, hour: u32, seconds: i64) -> AverageTravelTime {
        AverageTravelTime {
            from_stop_code: String::from(from_stop_code),
            to_stop_code: String::from(to_stop_code),
            hour,
            bin: 0,
            average_travel_time: seconds,
            count: 1,
        }
    }
}

impl FromRow for AverageTravelTime {
    fn from_row_opt(row: Row) -> std::result::Result<Self, FromRowError> {
        Ok(AverageTravelTime {
            from_stop_code: row.get::<String, _>(0).unwrap(),
            to_stop_code: row.get::<String, _>(1).unwrap(),
            hour: row.get::<u32, _>(2).unwrap(),
            bin: row.get::<i32, _>(3).unwrap(),
            average_travel_time: row.get::<i64, _>(4).unwrap(),
            count: row.get::<i64, _>(5).unwrap(),
        })
    }
}
