use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, Timelike};
use chrono::offset::TimeZone;
use clap::ArgMatches;
use mysql::*;
use mysql::prelude::*;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs::File;
use std::io::prelude::*;
use std::sync::Arc;

use crate::{FnResult, Main};
use crate::predictor::{predictions_for_event, DbTravelTimes, PredictionWriter};
use crate::predictor::strategy::{DirectStrategy, EstimationStrategy, NullStrategy, SingleStopStrategy};
use crate::schedule::{local_date, IndexMode, ScheduleIndex};
use crate::types::{StopPrediction, StopTimePrediction, VehicleStopTime};

use super::parse_day;
use super::travel_times;

const ROUND_SECONDS_EVALUATION: i64 = 20;
const BIN_WIDTH_SECONDS: i64 = 20;

/// Replays a day's recorded arrivals through an estimation strategy and
/// scores the published probabilities against what actually happened: for
/// each probability bucket, how often the predicted minute was the real
/// arrival minute.
pub struct AccuracyEvaluator<'a> {
    main: &'a Main,
    args: &'a ArgMatches,
}

/// One recorded stop visit joined with its trip instance, which is all the
/// context needed to re-run the estimator for it.
struct EvaluationItem {
    visit: VehicleStopTime,
    trip_id: String,
    service_day: NaiveDate,
}

impl FromRow for EvaluationItem {
    fn from_row_opt(row: Row) -> std::result::Result<Self, FromRowError> {
        Ok(EvaluationItem {
            visit: VehicleStopTime {
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
            },
            trip_id: row.get::<String, _>(6).unwrap(),
            service_day: row.get::<NaiveDate, _>(7).unwrap(),
        })
    }
}

impl<'a> AccuracyEvaluator<'a> {
    pub fn new(main: &'a Main, args: &'a ArgMatches) -> AccuracyEvaluator<'a> {
        AccuracyEvaluator { main, args }
    }

    pub fn run(&self) -> FnResult<()> {
        let day = parse_day(self.args.value_of("day").unwrap())?; // required by clap
        let strategy = make_strategy(self.args.value_of("strategy").unwrap()); // has a default value

        if !self.args.is_present("skip-preprocessing") {
            // the estimator must only know what was known before that day
            travel_times::calculate_travel_times(
                self.main,
                &travel_times::Window::until(day.and_hms(0, 0, 0)),
                strategy.travel_time_horizon(),
                BIN_WIDTH_SECONDS,
            )?;
        }

        let items = self.load_items(day)?;
        if self.main.verbose {
            println!("Evaluating {} stop visits of {}.", items.len(), day);
        }

        let index = ScheduleIndex::new(&format!("{}/schedule", self.main.dir), IndexMode::Batch)?;
        let source = DbTravelTimes::new(Arc::clone(&self.main.pool));

        let predictions: Vec<(StopPrediction, Vec<StopTimePrediction>)> = items
            .par_iter()
            .filter_map(|item| {
                let (_, trip) = index.find_trip(&item.trip_id, item.service_day)?;
                predictions_for_event(
                    strategy.as_ref(),
                    &source,
                    &trip,
                    local_date(item.service_day),
                    &item.visit,
                )
                .ok()
            })
            .flatten()
            .collect();

        let writer = PredictionWriter::new(Arc::clone(&self.main.pool));
        writer.delete_all()?;
        writer.insert(&predictions)?;

        let results = score_predictions(&items, &predictions);
        self.write_results(&results)
    }

    fn load_items(&self, day: NaiveDate) -> FnResult<Vec<EvaluationItem>> {
        let mut conn = self.main.pool.get_conn()?;
        let items = conn.exec(
            r"SELECT
                vst.id, vst.trip_instance_id, vst.stop_sequence, vst.stop_code,
                vst.arrival_time, vst.departure_time,
                ti.trip_id, ti.service_day
            FROM `vehicle_stop_time` vst
            JOIN `trip_instance` ti ON ti.id = vst.trip_instance_id
            WHERE DATE(vst.arrival_time) = :day;",
            params! { "day" => day },
        )?;
        Ok(items)
    }

    fn write_results(&self, results: &[(u32, f64)]) -> FnResult<()> {
        let mut body = String::from("probability,score\n");
        for (probability, score) in results {
            body.push_str(&format!("{},{}\n", probability, score * 100.0));
        }
        match self.args.value_of("output") {
            Some(filename) => {
                File::create(filename)?.write_all(body.as_bytes())?;
                if self.main.verbose {
                    println!("Wrote results to {}.", filename);
                }
            }
            None => print!("{}", body),
        }
        Ok(())
    }
}

fn make_strategy(name: &str) -> Box<dyn EstimationStrategy + Sync> {
    match name {
        "direct" => Box::new(DirectStrategy { round_to_seconds: ROUND_SECONDS_EVALUATION }),
        "null" => Box::new(NullStrategy),
        _ => Box::new(SingleStopStrategy {
            round_to_seconds: ROUND_SECONDS_EVALUATION,
            wait_for_departure: false,
        }),
    }
}

/// Buckets every published probability by percentage and marks it a hit
/// when the predicted minute equals the actually recorded arrival minute
/// of the same trip instance and stop.
fn score_predictions(
    items: &[EvaluationItem],
    predictions: &[(StopPrediction, Vec<StopTimePrediction>)],
) -> Vec<(u32, f64)> {
    let actual_minutes: HashMap<(u64, u16), DateTime<Local>> = items
        .iter()
        .filter_map(|item| {
            item.visit.arrival_time.map(|arrival| {
                (
                    (item.visit.trip_instance_id, item.visit.stop_sequence),
                    arrival.with_second(0).unwrap().with_nanosecond(0).unwrap(), // always valid
                )
            })
        })
        .collect();

    let mut buckets: HashMap<u32, (u64, u64)> = HashMap::new();
    for (stop_prediction, times) in predictions {
        let actual = match actual_minutes.get(&(stop_prediction.trip_instance_id, stop_prediction.stop_sequence)) {
            Some(actual) => actual,
            None => continue, // the vehicle never demonstrably reached this stop
        };
        for time_prediction in times {
            let bucket = (time_prediction.probability * 100.0) as u32;
            let entry = buckets.entry(bucket).or_insert((0, 0));
            entry.1 += 1;
            if time_prediction.time == *actual {
                entry.0 += 1;
            }
        }
    }

    let mut results: Vec<(u32, f64)> = buckets
        .into_iter()
        .map(|(bucket, (hits, total))| (bucket, hits as f64 / total as f64))
        .collect();
    results.sort_by_key(|(bucket, _)| *bucket);
    results
}
