use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime};
use chrono::offset::TimeZone;
use mysql::*;
use mysql::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::FnResult;
use crate::types::{RawVehicleData, TripInstance, VehicleState};

/// All tracker-side persistence: raw fixes, trip instances, observed stop
/// visits and the vehicle cache. Everything here is written from the
/// dispatcher thread only.
pub struct TrackerStore {
    pool: Arc<Pool>,
}

/// The persisted form of a live vehicle state, resolved back into a full
/// `VehicleState` against the schedule index at startup.
pub struct VehicleCacheRow {
    pub vehicle_id: i32,
    pub route_id: String,
    pub trip_id: String,
    pub trip_instance_id: u64,
    pub service_day: NaiveDate,
    pub started_at: DateTime<Local>,
    pub next_stop_sequence: u16,
    pub shape_dist: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Local>,
    pub route_name: String,
    pub brigade_id: i32,
    pub current_vehicle_stop_time_id: Option<u64>,
    pub current_stop_sequence: Option<u16>,
}

impl FromRow for VehicleCacheRow {
    fn from_row_opt(row: Row) -> std::result::Result<Self, FromRowError> {
        Ok(VehicleCacheRow {
            vehicle_id: row.get::<i32, _>(0).unwrap(),
            route_id: row.get::<String, _>(1).unwrap(),
            trip_id: row.get::<String, _>(2).unwrap(),
            trip_instance_id: row.get::<u64, _>(3).unwrap(),
            service_day: row.get::<NaiveDate, _>(4).unwrap(),
            started_at: Local.from_local_datetime(&row.get::<NaiveDateTime, _>(5).unwrap()).unwrap(),
            next_stop_sequence: row.get::<u16, _>(6).unwrap(),
            shape_dist: row.get::<f64, _>(7).unwrap(),
            latitude: row.get::<f64, _>(8).unwrap(),
            longitude: row.get::<f64, _>(9).unwrap(),
            timestamp: Local.from_local_datetime(&row.get::<NaiveDateTime, _>(10).unwrap()).unwrap(),
            route_name: row.get::<String, _>(11).unwrap(),
            brigade_id: row.get::<i32, _>(12).unwrap(),
            current_vehicle_stop_time_id: row.get_opt::<u64, _>(13).unwrap().ok(),
            current_stop_sequence: row.get_opt::<u16, _>(14).unwrap().ok(),
        })
    }
}

impl TrackerStore {
    pub fn new(pool: Arc<Pool>) -> TrackerStore {
        TrackerStore { pool }
    }

    /// Inserts a batch of raw fixes. `INSERT IGNORE` swallows duplicates;
    /// if the batch fails for another reason it is re-applied row by row so
    /// that one broken record cannot sink the rest.
    pub fn insert_raw_data(&self, records: &[RawVehicleData], processed: bool) -> FnResult<()> {
        let mut conn = self.pool.get_conn()?;
        let statement = conn.prep(
            r"INSERT IGNORE INTO `raw_vehicle_data` (
                `vehicle_id`,
                `route_name`,
                `brigade_id`,
                `latitude`,
                `longitude`,
                `timestamp`,
                `processed`
            ) VALUES (
                :vehicle_id,
                :route_name,
                :brigade_id,
                :latitude,
                :longitude,
                :timestamp,
                :processed
            );",
        ).expect("Could not prepare insert statement"); // Should never happen because of hard-coded statement string

        let make_params = |record: &RawVehicleData| {
            params! {
                "vehicle_id" => record.vehicle_id,
                "route_name" => &record.route_name,
                "brigade_id" => record.brigade_id,
                "latitude" => record.latitude,
                "longitude" => record.longitude,
                "timestamp" => record.timestamp.naive_local(),
                processed
            }
        };

        if let Err(batch_error) = conn.exec_batch(&statement, records.iter().map(make_params)) {
            eprintln!("Raw data batch failed ({}), retrying row by row.", batch_error);
            for record in records.iter() {
                if let Err(e) = conn.exec_drop(&statement, make_params(record)) {
                    eprintln!("Skipping raw record for vehicle {}: {}", record.vehicle_id, e);
                }
            }
        }
        Ok(())
    }

    /// The most recent fix per vehicle within the stale TTL, used to seed
    /// the poller's duplicate filter after a restart.
    pub fn load_recent_raw_data(&self, since: DateTime<Local>) -> FnResult<HashMap<i32, RawVehicleData>> {
        let mut conn = self.pool.get_conn()?;
        let rows: Vec<RawVehicleData> = conn.exec(
            r"SELECT
                `id`, `vehicle_id`, `route_name`, `brigade_id`,
                `latitude`, `longitude`, `timestamp`, `processed`
            FROM `raw_vehicle_data`
            WHERE `timestamp` >= :since
            ORDER BY `timestamp`;",
            params! { "since" => since.naive_local() },
        )?;

        let mut latest = HashMap::new();
        for record in rows {
            latest.insert(record.vehicle_id, record); // ascending order, last one wins
        }
        Ok(latest)
    }

    pub fn count_unprocessed(&self) -> FnResult<u64> {
        let mut conn = self.pool.get_conn()?;
        let count: Option<u64> = conn.query_first(
            "SELECT COUNT(*) FROM `raw_vehicle_data` WHERE `processed` = 0 AND `route_name` <> '';",
        )?;
        Ok(count.unwrap_or(0))
    }

    /// The next batch of unprocessed fixes, oldest first. Marking them
    /// processed afterwards moves the window forward.
    pub fn load_unprocessed_batch(&self, batch_size: usize) -> FnResult<Vec<RawVehicleData>> {
        let mut conn = self.pool.get_conn()?;
        let rows = conn.exec(
            r"SELECT
                `id`, `vehicle_id`, `route_name`, `brigade_id`,
                `latitude`, `longitude`, `timestamp`, `processed`
            FROM `raw_vehicle_data`
            WHERE `processed` = 0 AND `route_name` <> ''
            ORDER BY `timestamp`
            LIMIT :batch_size;",
            params! { "batch_size" => batch_size as u64 },
        )?;
        Ok(rows)
    }

    pub fn mark_processed(&self, records: &[RawVehicleData]) -> FnResult<()> {
        let mut conn = self.pool.get_conn()?;
        conn.exec_batch(
            "UPDATE `raw_vehicle_data` SET `processed` = 1 WHERE `id` = :id;",
            records
                .iter()
                .filter_map(|record| record.id)
                .map(|id| params! { id }),
        )?;
        Ok(())
    }

    pub fn insert_trip_instance(&self, instance: &TripInstance) -> FnResult<u64> {
        let mut conn = self.pool.get_conn()?;
        conn.exec_drop(
            r"INSERT INTO `trip_instance` (`trip_id`, `service_day`, `started_at`)
            VALUES (:trip_id, :service_day, :started_at);",
            params! {
                "trip_id" => &instance.trip_id,
                "service_day" => instance.service_day.naive_local(),
                "started_at" => instance.started_at.naive_local()
            },
        )?;
        let id: Option<u64> = conn.exec_first("SELECT LAST_INSERT_ID();", ())?;
        Ok(id.unwrap_or(0))
    }

    /// Removes a trip instance and everything hanging off it. Used when a
    /// binding loses a conflict and its recorded history becomes invalid.
    pub fn delete_trip_instance(&self, trip_instance_id: u64) -> FnResult<()> {
        let mut conn = self.pool.get_conn()?;
        let mut tx = conn.start_transaction(TxOpts::default())?;
        tx.exec_drop(
            r"DELETE FROM `stop_time_prediction`
            WHERE `stop_prediction_id` IN (
                SELECT `id` FROM `stop_prediction` WHERE `trip_instance_id` = :trip_instance_id
            );",
            params! { trip_instance_id },
        )?;
        tx.exec_drop(
            "DELETE FROM `stop_prediction` WHERE `trip_instance_id` = :trip_instance_id;",
            params! { trip_instance_id },
        )?;
        tx.exec_drop(
            "DELETE FROM `vehicle_stop_time` WHERE `trip_instance_id` = :trip_instance_id;",
            params! { trip_instance_id },
        )?;
        tx.exec_drop(
            "DELETE FROM `trip_instance` WHERE `id` = :trip_instance_id;",
            params! { trip_instance_id },
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn insert_vehicle_stop_time(
        &self,
        trip_instance_id: u64,
        stop_sequence: u16,
        stop_code: &str,
        arrival_time: DateTime<Local>,
        departure_time: Option<DateTime<Local>>,
    ) -> FnResult<u64> {
        let mut conn = self.pool.get_conn()?;
        conn.exec_drop(
            r"INSERT INTO `vehicle_stop_time` (
                `trip_instance_id`, `stop_sequence`, `stop_code`, `arrival_time`, `departure_time`
            ) VALUES (
                :trip_instance_id, :stop_sequence, :stop_code, :arrival_time, :departure_time
            );",
            params! {
                trip_instance_id,
                stop_sequence,
                stop_code,
                "arrival_time" => arrival_time.naive_local(),
                "departure_time" => departure_time.map(|time| time.naive_local())
            },
        )?;
        let id: Option<u64> = conn.exec_first("SELECT LAST_INSERT_ID();", ())?;
        Ok(id.unwrap_or(0))
    }

    pub fn set_departure_time(&self, vehicle_stop_time_id: u64, departure_time: DateTime<Local>) -> FnResult<()> {
        let mut conn = self.pool.get_conn()?;
        conn.exec_drop(
            "UPDATE `vehicle_stop_time` SET `departure_time` = :departure_time WHERE `id` = :id;",
            params! {
                "departure_time" => departure_time.naive_local(),
                "id" => vehicle_stop_time_id
            },
        )?;
        Ok(())
    }

    /// Rewrites the whole vehicle cache table from the live state map, in
    /// one transaction. The table only ever mirrors the map.
    pub fn replace_vehicle_cache<'a>(
        &self,
        states: impl Iterator<Item = &'a VehicleState>,
    ) -> FnResult<()> {
        let mut conn = self.pool.get_conn()?;
        let statement = conn.prep(
            r"INSERT INTO `vehicle_cache` (
                `vehicle_id`, `route_id`, `trip_id`, `trip_instance_id`, `service_day`,
                `started_at`, `next_stop_sequence`, `shape_dist`, `latitude`, `longitude`,
                `timestamp`, `route_name`, `brigade_id`,
                `current_vehicle_stop_time_id`, `current_stop_sequence`
            ) VALUES (
                :vehicle_id, :route_id, :trip_id, :trip_instance_id, :service_day,
                :started_at, :next_stop_sequence, :shape_dist, :latitude, :longitude,
                :timestamp, :route_name, :brigade_id,
                :current_vehicle_stop_time_id, :current_stop_sequence
            );",
        ).expect("Could not prepare insert statement"); // Should never happen because of hard-coded statement string

        let mut tx = conn.start_transaction(TxOpts::default())?;
        tx.query_drop("DELETE FROM `vehicle_cache`;")?;
        for state in states {
            // states whose instance never got committed are not persisted
            let trip_instance_id = match state.trip_instance.id {
                Some(id) => id,
                None => continue,
            };
            tx.exec_drop(
                &statement,
                params! {
                    "vehicle_id" => state.vehicle_id,
                    "route_id" => &state.route_id,
                    "trip_id" => &state.trip.id,
                    trip_instance_id,
                    "service_day" => state.trip_instance.service_day.naive_local(),
                    "started_at" => state.trip_instance.started_at.naive_local(),
                    "next_stop_sequence" => state.next_stop_time().stop_sequence,
                    "shape_dist" => state.shape_dist,
                    "latitude" => state.raw.latitude,
                    "longitude" => state.raw.longitude,
                    "timestamp" => state.timestamp.naive_local(),
                    "route_name" => &state.raw.route_name,
                    "brigade_id" => state.raw.brigade_id,
                    "current_vehicle_stop_time_id" => state.current_stop.as_ref().map(|dwell| dwell.vehicle_stop_time_id),
                    "current_stop_sequence" => state.current_stop.as_ref().map(|dwell| state.trip.stop_times[dwell.stop_index].stop_sequence)
                },
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_vehicle_cache(&self) -> FnResult<Vec<VehicleCacheRow>> {
        let mut conn = self.pool.get_conn()?;
        let rows = conn.query(
            r"SELECT
                `vehicle_id`, `route_id`, `trip_id`, `trip_instance_id`, `service_day`,
                `started_at`, `next_stop_sequence`, `shape_dist`, `latitude`, `longitude`,
                `timestamp`, `route_name`, `brigade_id`,
                `current_vehicle_stop_time_id`, `current_stop_sequence`
            FROM `vehicle_cache`;",
        )?;
        Ok(rows)
    }

    /// Rebuilds a live state from its cached row, re-resolving the trip in
    /// the schedule index. Rows whose trip no longer exists are dropped.
    pub fn resolve_cache_row(
        row: VehicleCacheRow,
        index: &crate::schedule::SharedScheduleIndex,
    ) -> Option<VehicleState> {
        let (schedule, trip) = index.find_trip(&row.trip_id, row.service_day)?;
        let next_stop_index = trip.stop_index_of(row.next_stop_sequence)?;
        let current_stop = match (row.current_vehicle_stop_time_id, row.current_stop_sequence) {
            (Some(vehicle_stop_time_id), Some(stop_sequence)) => {
                trip.stop_index_of(stop_sequence).map(|stop_index| crate::types::DwellingStop {
                    vehicle_stop_time_id,
                    stop_index,
                })
            }
            _ => None,
        };
        let position = schedule.projection.project(row.latitude, row.longitude);

        Some(VehicleState {
            vehicle_id: row.vehicle_id,
            schedule,
            route_id: row.route_id,
            trip,
            trip_instance: TripInstance {
                id: Some(row.trip_instance_id),
                trip_id: row.trip_id,
                service_day: Local.from_local_date(&row.service_day).unwrap(),
                started_at: row.started_at,
            },
            next_stop_index,
            position,
            timestamp: row.timestamp,
            shape_dist: row.shape_dist,
            current_stop,
            raw: RawVehicleData {
                id: None,
                vehicle_id: row.vehicle_id,
                route_name: row.route_name,
                brigade_id: row.brigade_id,
                latitude: row.latitude,
                longitude: row.longitude,
                timestamp: row.timestamp,
                processed: true,
            },
        })
    }

    /// Deletes cache rows that have gone silent; the in-memory map is
    /// evicted separately by the coordinator.
    pub fn delete_stale_cache_rows(&self, ttl_minutes: i64) -> FnResult<()> {
        let mut conn = self.pool.get_conn()?;
        let cutoff = Local::now() - Duration::minutes(ttl_minutes);
        conn.exec_drop(
            "DELETE FROM `vehicle_cache` WHERE `timestamp` < :cutoff;",
            params! { "cutoff" => cutoff.naive_local() },
        )?;
        Ok(())
    }
}
