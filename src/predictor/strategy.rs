use chrono::{Date, DateTime, Duration, Local, Timelike};
use std::collections::HashMap;

use crate::FnResult;
use crate::schedule::Trip;
use crate::types::{AverageTravelTime, GtfsDateTime, VehicleStopTime};

/// Where a strategy gets its empirical hop distributions from. The live
/// pipeline reads the `average_travel_time` table; tests supply an
/// in-memory map.
pub trait TravelTimeSource {
    fn hop_travel_times(
        &self,
        from_stop_code: &str,
        to_stop_code: &str,
        hour: u32,
    ) -> FnResult<Vec<AverageTravelTime>>;
}

/// Weighted arrival instants per downstream stop, keyed by stop sequence.
pub type WeightedArrivals = HashMap<u16, HashMap<DateTime<Local>, i64>>;

/// A way of turning one observed arrival into weighted arrival times for
/// all remaining stops of the trip. Each strategy also knows the horizon
/// its travel-time table has to be precomputed with.
pub trait EstimationStrategy {
    fn name(&self) -> &'static str;

    /// The pair horizon the `travel_time` rebuild needs: `Some(1)` for
    /// consecutive hops, `None` for all ordered pairs.
    fn travel_time_horizon(&self) -> Option<u32>;

    fn estimate(
        &self,
        source: &dyn TravelTimeSource,
        trip: &Trip,
        service_day: Date<Local>,
        from: &VehicleStopTime,
    ) -> FnResult<WeightedArrivals>;
}

/// Convolves per-hop distributions stop by stop. Every hop contributes its
/// empirical bins plus one synthetic sample of the scheduled duration, so
/// hops without history degrade to the schedule. With `wait_for_departure`
/// an estimate that runs more than a minute ahead of the schedule is held
/// back, which models vehicles waiting out their layover.
pub struct SingleStopStrategy {
    pub round_to_seconds: i64,
    pub wait_for_departure: bool,
}

impl EstimationStrategy for SingleStopStrategy {
    fn name(&self) -> &'static str {
        "single-stop"
    }

    fn travel_time_horizon(&self) -> Option<u32> {
        Some(1)
    }

    fn estimate(
        &self,
        source: &dyn TravelTimeSource,
        trip: &Trip,
        service_day: Date<Local>,
        from: &VehicleStopTime,
    ) -> FnResult<WeightedArrivals> {
        let mut estimates = WeightedArrivals::new();
        let arrival_time = match from.arrival_time {
            Some(arrival_time) => arrival_time,
            None => return Ok(estimates),
        };
        let from_index = match trip.stop_index_of(from.stop_sequence) {
            Some(index) => index,
            None => return Ok(estimates),
        };
        let hour = arrival_time.hour();

        let mut previous_arrivals: HashMap<DateTime<Local>, i64> = HashMap::new();
        previous_arrivals.insert(arrival_time, 1);

        for window in trip.stop_times[from_index..].windows(2) {
            let (previous_stop, stop) = (&window[0], &window[1]);

            let mut travel_times =
                source.hop_travel_times(&previous_stop.stop_code, &stop.stop_code, hour)?;
            travel_times.push(AverageTravelTime::schedule_sample(
                &previous_stop.stop_code,
                &stop.stop_code,
                hour,
                (stop.arrival_time - previous_stop.arrival_time) as i64,
            ));

            let scheduled_previous = GtfsDateTime::new(service_day, previous_stop.arrival_time).date_time();
            let mut arrivals: HashMap<DateTime<Local>, i64> = HashMap::new();
            for (estimated_arrival, count) in &previous_arrivals {
                let mut estimated_arrival = *estimated_arrival;
                if self.wait_for_departure
                    && estimated_arrival < scheduled_previous - Duration::minutes(1)
                {
                    estimated_arrival = scheduled_previous - Duration::minutes(1);
                }
                for travel_time in &travel_times {
                    let estimated_next = round_to_seconds(
                        estimated_arrival + Duration::seconds(travel_time.average_travel_time),
                        self.round_to_seconds,
                    );
                    *arrivals.entry(estimated_next).or_insert(0) += travel_time.count * count;
                }
            }

            estimates.insert(stop.stop_sequence, arrivals.clone());
            previous_arrivals = arrivals;
        }

        Ok(estimates)
    }
}

/// Estimates every downstream stop from a single hop straight from the
/// triggering stop, without convolution. Needs the travel-time table built
/// with unlimited horizon.
pub struct DirectStrategy {
    pub round_to_seconds: i64,
}

impl EstimationStrategy for DirectStrategy {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn travel_time_horizon(&self) -> Option<u32> {
        None
    }

    fn estimate(
        &self,
        source: &dyn TravelTimeSource,
        trip: &Trip,
        _service_day: Date<Local>,
        from: &VehicleStopTime,
    ) -> FnResult<WeightedArrivals> {
        let mut estimates = WeightedArrivals::new();
        let arrival_time = match from.arrival_time {
            Some(arrival_time) => arrival_time,
            None => return Ok(estimates),
        };
        let from_index = match trip.stop_index_of(from.stop_sequence) {
            Some(index) => index,
            None => return Ok(estimates),
        };
        let from_stop = &trip.stop_times[from_index];
        let hour = arrival_time.hour();

        for stop in &trip.stop_times[from_index + 1..] {
            let travel_times = source.hop_travel_times(&from_stop.stop_code, &stop.stop_code, hour)?;
            let arrivals = estimates.entry(stop.stop_sequence).or_insert_with(HashMap::new);
            for travel_time in &travel_times {
                let estimated = round_to_seconds(
                    arrival_time + Duration::seconds(travel_time.average_travel_time),
                    self.round_to_seconds,
                );
                *arrivals.entry(estimated).or_insert(0) += travel_time.count;
            }
        }

        Ok(estimates)
    }
}

/// Predicts nothing. Used when replaying history, where predictions would
/// only be overwritten anyway.
pub struct NullStrategy;

impl EstimationStrategy for NullStrategy {
    fn name(&self) -> &'static str {
        "null"
    }

    fn travel_time_horizon(&self) -> Option<u32> {
        Some(1)
    }

    fn estimate(
        &self,
        _source: &dyn TravelTimeSource,
        _trip: &Trip,
        _service_day: Date<Local>,
        _from: &VehicleStopTime,
    ) -> FnResult<WeightedArrivals> {
        Ok(WeightedArrivals::new())
    }
}

/// Rounds to the nearest multiple of `n` seconds and zeroes the
/// sub-second part.
pub fn round_to_seconds(instant: DateTime<Local>, n: i64) -> DateTime<Local> {
    let rounded = instant + Duration::seconds(n / 2)
        - Duration::seconds((instant.second() as i64 + n / 2) % n);
    rounded.with_nanosecond(0).unwrap() // zero nanoseconds are always valid
}
