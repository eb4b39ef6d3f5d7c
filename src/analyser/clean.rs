use mysql::*;
use mysql::prelude::*;
use std::collections::{HashMap, HashSet};

use crate::{FnResult, Main};
use crate::schedule::{IndexMode, ScheduleIndex};
use crate::types::VehicleStopTime;

/// The four integrity passes over the recorded data. Invoked manually, not
/// on the hot path; each pass is independent and idempotent.
pub fn remove_incorrect_data(main: &Main) -> FnResult<()> {
    remove_stop_times_shadowed_by_later_instances(main)?;
    remove_unmonotone_trip_instances(main)?;
    remove_thin_trip_instances(main)?;
    remove_trip_instances_with_incorrect_stops(main)?;
    Ok(())
}

/// When a trip was re-bound later the same day, the earlier instance's
/// visits of the same stops are leftovers of a broken binding.
fn remove_stop_times_shadowed_by_later_instances(main: &Main) -> FnResult<()> {
    if main.verbose {
        println!("Removing stop visits shadowed by later trip instances…");
    }
    let mut conn = main.pool.get_conn()?;
    conn.query_drop(
        r"DELETE vst FROM `vehicle_stop_time` vst
        JOIN `trip_instance` ti ON ti.id = vst.trip_instance_id
        JOIN `trip_instance` ti2
            ON ti2.trip_id = ti.trip_id
            AND DATE(ti2.started_at) = DATE(ti.started_at)
            AND ti2.started_at > ti.started_at
        JOIN `vehicle_stop_time` vst2
            ON vst2.trip_instance_id = ti2.id
            AND vst2.stop_sequence = vst.stop_sequence;",
    )?;
    Ok(())
}

/// Arrivals read in stop-sequence order have to be in time order too;
/// instances violating that recorded a vehicle that never drove this trip.
fn remove_unmonotone_trip_instances(main: &Main) -> FnResult<()> {
    if main.verbose {
        println!("Removing trip instances with unordered arrivals…");
    }
    let mut conn = main.pool.get_conn()?;
    let rows: Vec<VehicleStopTime> = conn.query(
        r"SELECT `id`, `trip_instance_id`, `stop_sequence`, `stop_code`, `arrival_time`, `departure_time`
        FROM `vehicle_stop_time`
        ORDER BY `trip_instance_id`, `stop_sequence`;",
    )?;

    let mut by_instance: HashMap<u64, Vec<VehicleStopTime>> = HashMap::new();
    for row in rows {
        by_instance.entry(row.trip_instance_id).or_insert_with(Vec::new).push(row);
    }

    let broken: Vec<u64> = by_instance
        .into_iter()
        .filter(|(_, visits)| {
            let arrivals: Vec<_> = visits.iter().filter_map(|visit| visit.arrival_time).collect();
            arrivals.windows(2).any(|pair| pair[0] > pair[1])
        })
        .map(|(trip_instance_id, _)| trip_instance_id)
        .collect();

    delete_trip_instances(&mut conn, &broken)
}

/// Instances with one recorded visit or none carry no usable information.
fn remove_thin_trip_instances(main: &Main) -> FnResult<()> {
    if main.verbose {
        println!("Removing trip instances with at most one stop visit…");
    }
    let mut conn = main.pool.get_conn()?;
    let thin: Vec<u64> = conn.query(
        r"SELECT ti.id
        FROM `trip_instance` ti
        LEFT JOIN `vehicle_stop_time` vst ON vst.trip_instance_id = ti.id
        GROUP BY ti.id
        HAVING COUNT(vst.id) <= 1;",
    )?;
    delete_trip_instances(&mut conn, &thin)
}

/// Visits that reference stops the trip does not have point at a binding
/// made against the wrong trip; the whole instance is unusable.
fn remove_trip_instances_with_incorrect_stops(main: &Main) -> FnResult<()> {
    if main.verbose {
        println!("Removing trip instances referencing stops outside their trip…");
    }
    let index = ScheduleIndex::new(&format!("{}/schedule", main.dir), IndexMode::Batch)?;

    let mut conn = main.pool.get_conn()?;
    let rows: Vec<(u64, String, chrono::NaiveDate, u16, String)> = conn.query(
        r"SELECT ti.id, ti.trip_id, ti.service_day, vst.stop_sequence, vst.stop_code
        FROM `trip_instance` ti
        JOIN `vehicle_stop_time` vst ON vst.trip_instance_id = ti.id;",
    )?;

    let mut broken = HashSet::new();
    for (trip_instance_id, trip_id, service_day, stop_sequence, stop_code) in rows {
        let trip = match index.find_trip(&trip_id, service_day) {
            Some((_, trip)) => trip,
            None => continue, // trip from a feed we no longer have; leave it alone
        };
        let matches = trip
            .stop_index_of(stop_sequence)
            .map(|stop_index| trip.stop_times[stop_index].stop_code == stop_code)
            .unwrap_or(false);
        if !matches {
            broken.insert(trip_instance_id);
        }
    }

    let broken: Vec<u64> = broken.into_iter().collect();
    delete_trip_instances(&mut conn, &broken)
}

fn delete_trip_instances(conn: &mut PooledConn, trip_instance_ids: &[u64]) -> FnResult<()> {
    if trip_instance_ids.is_empty() {
        return Ok(());
    }
    let mut tx = conn.start_transaction(TxOpts::default())?;
    for &trip_instance_id in trip_instance_ids {
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
    }
    tx.commit()?;
    Ok(())
}
