use chrono::{Duration, NaiveDate, NaiveDateTime};
use mysql::*;
use mysql::prelude::*;

use crate::{FnResult, Main};

/// The half-open time window a rebuild covers, measured on the arrival
/// times of the *from* side of each pair.
pub struct Window {
    pub after: Option<NaiveDateTime>,
    pub before: Option<NaiveDateTime>,
}

impl Window {
    pub fn for_day(day: Option<NaiveDate>) -> Window {
        match day {
            Some(day) => Window {
                after: Some(day.and_hms(0, 0, 0)),
                before: Some((day + Duration::days(1)).and_hms(0, 0, 0)),
            },
            None => Window { after: None, before: None },
        }
    }

    pub fn until(before: NaiveDateTime) -> Window {
        Window { after: None, before: Some(before) }
    }

    fn bounds(&self) -> (NaiveDateTime, NaiveDateTime) {
        (
            self.after.unwrap_or_else(|| NaiveDate::from_ymd(1000, 1, 1).and_hms(0, 0, 0)),
            self.before.unwrap_or_else(|| NaiveDate::from_ymd(9999, 12, 31).and_hms(0, 0, 0)),
        )
    }
}

/// Rebuilds `travel_time` and `average_travel_time` from the recorded stop
/// visits. Both rebuilds are plain delete-and-reinsert and therefore
/// idempotent. A `horizon` of `Some(n)` keeps only pairs at most `n` stops
/// apart; `None` keeps all ordered pairs within a trip instance.
pub fn calculate_travel_times(
    main: &Main,
    window: &Window,
    horizon: Option<u32>,
    bin_width_seconds: i64,
) -> FnResult<()> {
    rebuild_travel_times(main, window, horizon)?;
    rebuild_average_travel_times(main, bin_width_seconds)?;
    Ok(())
}

/// Every ordered pair of stop visits of the same trip instance with both
/// arrivals present becomes one observed hop duration.
fn rebuild_travel_times(main: &Main, window: &Window, horizon: Option<u32>) -> FnResult<()> {
    if main.verbose {
        println!("Rebuilding travel_time (horizon: {:?})…", horizon);
    }
    let mut conn = main.pool.get_conn()?;
    let (after, before) = window.bounds();

    conn.query_drop("DELETE FROM `travel_time`;")?;

    let horizon_condition = if horizon.is_some() {
        "AND vst2.stop_sequence - :horizon <= vst1.stop_sequence"
    } else {
        ""
    };
    let statement = format!(
        r"INSERT INTO `travel_time` (
            `from_vehicle_stop_time_id`,
            `to_vehicle_stop_time_id`,
            `from_stop_code`,
            `to_stop_code`,
            `travel_time`
        )
        SELECT
            vst1.id,
            vst2.id,
            vst1.stop_code,
            vst2.stop_code,
            TIMESTAMPDIFF(SECOND, vst1.arrival_time, vst2.arrival_time)
        FROM `vehicle_stop_time` vst1
        JOIN `vehicle_stop_time` vst2 ON vst1.trip_instance_id = vst2.trip_instance_id
        WHERE
            vst1.id <> vst2.id
            AND vst1.stop_sequence < vst2.stop_sequence
            {}
            AND vst1.arrival_time IS NOT NULL
            AND vst2.arrival_time IS NOT NULL
            AND vst1.arrival_time >= :after
            AND vst1.arrival_time <= :before;",
        horizon_condition
    );

    match horizon {
        Some(horizon) => conn.exec_drop(statement, params! { after, before, horizon })?,
        None => conn.exec_drop(statement, params! { after, before })?,
    }
    Ok(())
}

/// Groups the observed durations by hop, hour of day and duration bin. The
/// bin index is the duration's offset from the smallest non-negative
/// duration seen for that hop, divided by the bin width. Negative
/// durations are bad data and are discarded.
fn rebuild_average_travel_times(main: &Main, bin_width_seconds: i64) -> FnResult<()> {
    if main.verbose {
        println!("Rebuilding average_travel_time (bin width: {} s)…", bin_width_seconds);
    }
    let mut conn = main.pool.get_conn()?;

    conn.query_drop("DELETE FROM `average_travel_time`;")?;

    conn.exec_drop(
        r"INSERT INTO `average_travel_time` (
            `from_stop_code`,
            `to_stop_code`,
            `hour`,
            `bin`,
            `average_travel_time`,
            `count`
        )
        SELECT
            tt.from_stop_code,
            tt.to_stop_code,
            HOUR(vst.arrival_time) AS `hour`,
            FLOOR((tt.travel_time - minima.min_travel_time) / :bin_width) AS `bin`,
            ROUND(AVG(tt.travel_time)),
            COUNT(*)
        FROM `travel_time` tt
        JOIN `vehicle_stop_time` vst ON vst.id = tt.from_vehicle_stop_time_id
        JOIN (
            SELECT `from_stop_code`, `to_stop_code`, MIN(`travel_time`) AS `min_travel_time`
            FROM `travel_time`
            WHERE `travel_time` >= 0
            GROUP BY `from_stop_code`, `to_stop_code`
        ) minima
            ON minima.from_stop_code = tt.from_stop_code
            AND minima.to_stop_code = tt.to_stop_code
        WHERE tt.travel_time >= 0
        GROUP BY tt.from_stop_code, tt.to_stop_code, `hour`, `bin`;",
        params! { "bin_width" => bin_width_seconds },
    )?;
    Ok(())
}
