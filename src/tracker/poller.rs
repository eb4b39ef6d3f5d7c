use chrono::{DateTime, Duration, Local};
use serde::Deserialize;
use simple_error::bail;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::{FnResult, Main};
use crate::types::RawVehicleData;

use super::{Pipeline, STALE_MINUTES};
use super::store::TrackerStore;

/// Fixed polling cadence. The deadline is tracked on a monotonic clock so
/// that slow iterations shorten the following sleep instead of drifting.
const POLL_INTERVAL_SECONDS: u64 = 5;
const HTTP_TIMEOUT_MILLIS: u64 = 10_000;

/// One record of the position feed, as served by the upstream API.
#[derive(Debug, Deserialize)]
struct WireRecord {
    vehicle_id: i32,
    route_short_name: String,
    brigade_id: i32,
    lat: f64,
    lon: f64,
    timestamp: String,
}

/// The live poller: fetches the feed every five seconds, keeps only fixes
/// that are new and recent, stores them and runs them through the
/// inference pipeline. No failure ever terminates the loop.
pub struct Poller<'a> {
    #[allow(dead_code)]
    main: &'a Main,
    url: String,
    pipeline: Pipeline,
    store: TrackerStore,
}

impl<'a> Poller<'a> {
    pub fn new(main: &'a Main, url: String, pipeline: Pipeline) -> Poller<'a> {
        Poller {
            main,
            url,
            pipeline,
            store: TrackerStore::new(Arc::clone(&main.pool)),
        }
    }

    pub fn run(mut self) -> FnResult<()> {
        let mut last_raw_data = self
            .store
            .load_recent_raw_data(Local::now() - Duration::minutes(STALE_MINUTES))?;

        loop {
            let deadline = Instant::now() + std::time::Duration::from_secs(POLL_INTERVAL_SECONDS);
            if let Err(e) = self.tick(&mut last_raw_data) {
                eprintln!("Polling iteration failed: {}", e);
            }
            sleep_until(deadline);
        }
    }

    fn tick(&mut self, last_raw_data: &mut HashMap<i32, RawVehicleData>) -> FnResult<()> {
        let raw_data = self.fetch_raw_data()?;
        let updated = updated_records(last_raw_data, &raw_data);
        if self.pipeline.coordinator.verbose() {
            println!("{} fixes fetched, {} updated.", raw_data.len(), updated.len());
        }

        // live fixes are processed right away, so they are stored already marked
        self.store.insert_raw_data(&updated, true)?;
        self.pipeline.process_batch(updated)?;
        self.pipeline.coordinator.evict_stale()?;

        *last_raw_data = raw_data;
        Ok(())
    }

    fn fetch_raw_data(&self) -> FnResult<HashMap<i32, RawVehicleData>> {
        let response = ureq::get(&self.url)
            .timeout_connect(HTTP_TIMEOUT_MILLIS)
            .call();
        if !response.ok() {
            bail!("Feed returned status {}.", response.status());
        }
        let body = response.into_string()?;
        let records: Vec<WireRecord> = serde_json::from_str(&body)?;

        let mut parsed = HashMap::new();
        for record in records {
            if let Some(raw) = parse_record(record) {
                parsed.insert(raw.vehicle_id, raw);
            }
        }
        Ok(parsed)
    }
}

/// Records worth processing: vehicles we have not seen at all, or whose
/// report is newer than the last one and no older than the stale TTL.
fn updated_records(
    old_data: &HashMap<i32, RawVehicleData>,
    new_data: &HashMap<i32, RawVehicleData>,
) -> Vec<RawVehicleData> {
    let now = Local::now();
    new_data
        .values()
        .filter(|record| match old_data.get(&record.vehicle_id) {
            None => true,
            Some(old) => {
                old.timestamp < record.timestamp
                    && now - record.timestamp <= Duration::minutes(STALE_MINUTES)
            }
        })
        .cloned()
        .collect()
}

/// Records with an unparsable timestamp are dropped, like every other
/// malformed input on this path.
fn parse_record(record: WireRecord) -> Option<RawVehicleData> {
    let timestamp = DateTime::parse_from_rfc3339(&record.timestamp)
        .ok()?
        .with_timezone(&Local);
    Some(RawVehicleData {
        id: None,
        vehicle_id: record.vehicle_id,
        route_name: record.route_short_name,
        brigade_id: record.brigade_id,
        latitude: record.lat,
        longitude: record.lon,
        timestamp,
        processed: false,
    })
}

fn sleep_until(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        thread::sleep(deadline - now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::offset::TimeZone;

    fn fix(vehicle_id: i32, timestamp: DateTime<Local>) -> RawVehicleData {
        RawVehicleData {
            id: None,
            vehicle_id,
            route_name: String::from("33"),
            brigade_id: 1,
            latitude: 51.1,
            longitude: 17.0,
            timestamp,
            processed: false,
        }
    }

    #[test]
    fn test_updated_records_filters_old_and_known() {
        let now = Local::now();
        let mut old = HashMap::new();
        old.insert(1, fix(1, now - Duration::seconds(10)));
        old.insert(2, fix(2, now - Duration::seconds(10)));

        let mut new = HashMap::new();
        new.insert(1, fix(1, now - Duration::seconds(10))); // unchanged
        new.insert(2, fix(2, now - Duration::seconds(5)));  // newer
        new.insert(3, fix(3, now - Duration::minutes(30))); // unknown, kept despite age

        let mut updated = updated_records(&old, &new);
        updated.sort_by_key(|record| record.vehicle_id);
        let ids: Vec<i32> = updated.iter().map(|record| record.vehicle_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_parse_record_honours_timezone() {
        let record = WireRecord {
            vehicle_id: 7,
            route_short_name: String::from("33"),
            brigade_id: 1,
            lat: 51.1,
            lon: 17.0,
            timestamp: String::from("2024-03-04T06:15:00+02:00"),
        };
        let raw = parse_record(record).unwrap();
        assert_eq!(raw.timestamp, Local.timestamp(1709525700, 0));

        let record = WireRecord {
            vehicle_id: 7,
            route_short_name: String::from("33"),
            brigade_id: 1,
            lat: 51.1,
            lon: 17.0,
            timestamp: String::from("yesterday-ish"),
        };
        assert!(parse_record(record).is_none());
    }
}
