pub mod strategy;

use chrono::{Date, DateTime, Local, Timelike};
use mysql::*;
use mysql::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::FnResult;
use crate::schedule::Trip;
use crate::types::{AverageTravelTime, StopPrediction, StopTimePrediction, VehicleStopTime};

use strategy::{EstimationStrategy, TravelTimeSource, WeightedArrivals};

/// Entries with less probability mass than this are dropped from the
/// published distributions.
pub const PROBABILITY_THRESHOLD: f64 = 0.05;

/// Collapses the weighted arrival instants of each stop to whole minutes,
/// normalises them to probabilities and drops entries below the threshold.
pub fn collapse_to_minutes(
    estimates: WeightedArrivals,
) -> HashMap<u16, Vec<(DateTime<Local>, f64)>> {
    let mut collapsed = HashMap::new();
    for (stop_sequence, arrivals) in estimates {
        let mut by_minute: HashMap<DateTime<Local>, i64> = HashMap::new();
        let mut total = 0i64;
        for (arrival, count) in arrivals {
            let minute = arrival.with_second(0).unwrap().with_nanosecond(0).unwrap(); // always valid
            *by_minute.entry(minute).or_insert(0) += count;
            total += count;
        }
        if total == 0 {
            continue;
        }
        let mut entries: Vec<(DateTime<Local>, f64)> = by_minute
            .into_iter()
            .map(|(minute, count)| (minute, count as f64 / total as f64))
            .filter(|(_, probability)| *probability >= PROBABILITY_THRESHOLD)
            .collect();
        entries.sort_by_key(|(minute, _)| *minute);
        collapsed.insert(stop_sequence, entries);
    }
    collapsed
}

/// Runs a strategy for one observed arrival and shapes the result into
/// prediction rows, one `StopPrediction` per downstream stop.
pub fn predictions_for_event(
    strategy: &dyn EstimationStrategy,
    source: &dyn TravelTimeSource,
    trip: &Trip,
    service_day: Date<Local>,
    event: &VehicleStopTime,
) -> FnResult<Vec<(StopPrediction, Vec<StopTimePrediction>)>> {
    let estimates = strategy.estimate(source, trip, service_day, event)?;
    let collapsed = collapse_to_minutes(estimates);

    let mut predictions = Vec::new();
    for (stop_sequence, entries) in collapsed {
        let stop_code = match trip.stop_index_of(stop_sequence) {
            Some(index) => trip.stop_times[index].stop_code.clone(),
            None => continue,
        };
        let stop_prediction = StopPrediction {
            trip_instance_id: event.trip_instance_id,
            stop_sequence,
            stop_code,
            made_at_vehicle_stop_time_id: event.id,
        };
        let times = entries
            .into_iter()
            .map(|(time, probability)| StopTimePrediction { probability, time })
            .collect();
        predictions.push((stop_prediction, times));
    }
    Ok(predictions)
}

/// Reads hop distributions from the `average_travel_time` table.
pub struct DbTravelTimes {
    pool: Arc<Pool>,
}

impl DbTravelTimes {
    pub fn new(pool: Arc<Pool>) -> DbTravelTimes {
        DbTravelTimes { pool }
    }
}

impl TravelTimeSource for DbTravelTimes {
    fn hop_travel_times(
        &self,
        from_stop_code: &str,
        to_stop_code: &str,
        hour: u32,
    ) -> FnResult<Vec<AverageTravelTime>> {
        let mut conn = self.pool.get_conn()?;
        let rows = conn.exec_map(
            r"SELECT
                `from_stop_code`,
                `to_stop_code`,
                `hour`,
                `bin`,
                `average_travel_time`,
                `count`
            FROM `average_travel_time`
            WHERE
                `from_stop_code` = :from_stop_code AND
                `to_stop_code` = :to_stop_code AND
                `hour` = :hour;",
            params! {
                "from_stop_code" => from_stop_code,
                "to_stop_code" => to_stop_code,
                hour
            },
            |row: Row| from_row::<AverageTravelTime>(row),
        )?;
        Ok(rows)
    }
}

/// Persists predictions: the set for a trip instance is replaced wholesale
/// every time a new arrival event produces one.
pub struct PredictionWriter {
    pool: Arc<Pool>,
}

impl PredictionWriter {
    pub fn new(pool: Arc<Pool>) -> PredictionWriter {
        PredictionWriter { pool }
    }

    /// Clears all predictions. The accuracy evaluation starts from a clean
    /// slate and keeps every generation it produces.
    pub fn delete_all(&self) -> FnResult<()> {
        let mut conn = self.pool.get_conn()?;
        conn.query_drop("DELETE FROM `stop_time_prediction`;")?;
        conn.query_drop("DELETE FROM `stop_prediction`;")?;
        Ok(())
    }

    pub fn insert(&self, predictions: &[(StopPrediction, Vec<StopTimePrediction>)]) -> FnResult<()> {
        let mut conn = self.pool.get_conn()?;
        let mut tx = conn.start_transaction(TxOpts::default())?;
        Self::insert_in_transaction(&mut tx, predictions)?;
        tx.commit()?;
        Ok(())
    }

    fn insert_in_transaction(
        tx: &mut Transaction,
        predictions: &[(StopPrediction, Vec<StopTimePrediction>)],
    ) -> FnResult<()> {
        for (stop_prediction, times) in predictions {
            tx.exec_drop(
                r"INSERT INTO `stop_prediction` (
                    `trip_instance_id`,
                    `stop_sequence`,
                    `stop_code`,
                    `made_at_vehicle_stop_time_id`
                ) VALUES (
                    :trip_instance_id,
                    :stop_sequence,
                    :stop_code,
                    :made_at_vehicle_stop_time_id
                );",
                params! {
                    "trip_instance_id" => stop_prediction.trip_instance_id,
                    "stop_sequence" => stop_prediction.stop_sequence,
                    "stop_code" => &stop_prediction.stop_code,
                    "made_at_vehicle_stop_time_id" => stop_prediction.made_at_vehicle_stop_time_id
                },
            )?;
            let stop_prediction_id: u64 = tx
                .exec_first("SELECT LAST_INSERT_ID();", ())?
                .unwrap_or(0);
            tx.exec_batch(
                r"INSERT INTO `stop_time_prediction` (
                    `stop_prediction_id`,
                    `probability`,
                    `time`
                ) VALUES (
                    :stop_prediction_id,
                    :probability,
                    :time
                );",
                times.iter().map(|time_prediction| {
                    params! {
                        stop_prediction_id,
                        "probability" => time_prediction.probability,
                        "time" => time_prediction.time.naive_local()
                    }
                }),
            )?;
        }
        Ok(())
    }

    pub fn replace_for_trip_instance(
        &self,
        trip_instance_id: u64,
        predictions: &[(StopPrediction, Vec<StopTimePrediction>)],
    ) -> FnResult<()> {
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
            r"DELETE FROM `stop_prediction` WHERE `trip_instance_id` = :trip_instance_id;",
            params! { trip_instance_id },
        )?;

        Self::insert_in_transaction(&mut tx, predictions)?;

        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use crate::schedule::local_date;
    use crate::schedule::testing::*;
    use strategy::SingleStopStrategy;
    use strategy::tests::FixedTravelTimes;

    fn test_day() -> NaiveDate {
        NaiveDate::from_ymd(2024, 3, 4)
    }

    fn convolution_trip() -> crate::schedule::Trip {
        straight_trip(
            "trip_1",
            "route-33",
            1,
            1000.0,
            vec![
                stop(1, "A", 12 * 3600, 12 * 3600, 100.0),
                stop(2, "B", 12 * 3600 + 60, 12 * 3600 + 60, 400.0),
                stop(3, "C", 12 * 3600 + 150, 12 * 3600 + 150, 900.0),
            ],
            vec![test_day()],
        )
    }

    fn arrival_at_a() -> VehicleStopTime {
        VehicleStopTime {
            id: 1,
            trip_instance_id: 10,
            stop_sequence: 1,
            stop_code: String::from("A"),
            arrival_time: Some(local_date(test_day()).and_hms(12, 0, 0)),
            departure_time: None,
        }
    }

    #[test]
    fn test_estimation_collapses_to_certainty() {
        // distributions that agree with the schedule put all mass on one
        // minute per stop: P(arr(B) = 12:01) = 1, P(arr(C) = 12:02) = 1
        let source = FixedTravelTimes::new()
            .with_hop("A", "B", 12, &[(60, 2)])
            .with_hop("B", "C", 12, &[(90, 3)]);
        let strategy = SingleStopStrategy { round_to_seconds: 15, wait_for_departure: false };
        let trip = convolution_trip();

        let predictions = predictions_for_event(
            &strategy,
            &source,
            &trip,
            local_date(test_day()),
            &arrival_at_a(),
        )
        .unwrap();

        assert_eq!(predictions.len(), 2);
        for (stop_prediction, times) in &predictions {
            assert_eq!(stop_prediction.trip_instance_id, 10);
            assert_eq!(stop_prediction.made_at_vehicle_stop_time_id, 1);
            assert_eq!(times.len(), 1);
            assert!((times[0].probability - 1.0).abs() < 1e-12);
            let expected_minute = match stop_prediction.stop_code.as_str() {
                "B" => local_date(test_day()).and_hms(12, 1, 0),
                "C" => local_date(test_day()).and_hms(12, 2, 0),
                other => panic!("unexpected stop {}", other),
            };
            assert_eq!(times[0].time, expected_minute);
        }
    }

    #[test]
    fn test_threshold_drops_unlikely_minutes() {
        // 1 sample of 60 s (schedule) against 30 samples of 180 s: the
        // schedule minute has probability 1/31 < 0.05 and is dropped
        let source = FixedTravelTimes::new().with_hop("A", "B", 12, &[(180, 30)]);
        let strategy = SingleStopStrategy { round_to_seconds: 15, wait_for_departure: false };
        let trip = convolution_trip();

        let predictions = predictions_for_event(
            &strategy,
            &source,
            &trip,
            local_date(test_day()),
            &arrival_at_a(),
        )
        .unwrap();

        let (_, times) = predictions
            .iter()
            .find(|(stop_prediction, _)| stop_prediction.stop_code == "B")
            .unwrap();
        assert_eq!(times.len(), 1);
        assert_eq!(times[0].time, local_date(test_day()).and_hms(12, 3, 0));
        assert!(times[0].probability > 0.9);

        // probabilities always sum to at most one
        let total: f64 = times.iter().map(|t| t.probability).sum();
        assert!(total <= 1.0 + 1e-12);
    }

    #[test]
    fn test_event_without_arrival_yields_nothing() {
        let source = FixedTravelTimes::new();
        let strategy = SingleStopStrategy { round_to_seconds: 15, wait_for_departure: false };
        let trip = convolution_trip();
        let mut event = arrival_at_a();
        event.arrival_time = None;

        let predictions =
            predictions_for_event(&strategy, &source, &trip, local_date(test_day()), &event)
                .unwrap();
        assert!(predictions.is_empty());
    }
}
