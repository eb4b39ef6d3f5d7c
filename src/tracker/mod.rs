mod conflicts;
mod dispatcher;
mod guess;
mod poller;
mod store;
mod transitions;
mod update;

use chrono::{Duration, Local};
use clap::{App, Arg, ArgMatches};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use crate::{FnResult, Main};
use crate::predictor::{predictions_for_event, DbTravelTimes, PredictionWriter};
use crate::predictor::strategy::{EstimationStrategy, SingleStopStrategy};
use crate::schedule::{IndexMode, ScheduleIndex, SharedScheduleIndex, Trip};
use crate::types::{DwellingStop, RawVehicleData, VehicleState, VehicleStopTime};

use conflicts::ConflictWinner;
use dispatcher::{Job, WorkerPool};
use store::TrackerStore;
use transitions::StopTransition;

/// A stop counts as the next stop only while it is at least this far ahead
/// of the vehicle (metres).
pub const NEXT_STOP_SLACK: f64 = 20.0;
/// A fix this close (metres) to the crossed stop *is* the arrival.
pub const DIRECT_ARRIVAL_TOLERANCE: f64 = 30.0;
/// Fixes farther than this (metres) from a trip's shape do not match it.
pub const MAP_MATCH_RADIUS: f64 = 200.0;
/// A warm re-projection may fall behind its anchor by at most this much.
pub const ANCHOR_SLACK: f64 = 10.0;
/// States older than this are stale: not updated, evicted, outvoted.
pub const STALE_MINUTES: i64 = 5;

const PROCESSING_BATCH_SIZE: usize = 5000;
const ROUND_SECONDS_LIVE: i64 = 15;

/// The live inference commands: the indefinitely-running poller and the
/// batch replay of unprocessed history.
pub struct Tracker<'a> {
    main: &'a Main,
    args: &'a ArgMatches,
}

impl<'a> Tracker<'a> {
    pub fn get_subcommands() -> Vec<App<'a>> {
        vec![
            App::new("fetch-vehicles")
                .about("Runs forever, polling the vehicle position feed and matching every fix against the schedule.")
                .arg(Arg::new("url")
                    .short('u')
                    .long("url")
                    .env("VEHICLE_POSITIONS_URL")
                    .takes_value(true)
                    .required_unless("help")
                    .about("The URL of the vehicle position feed, which has to return a JSON array of fixes.")
                ).arg(Arg::new("workers")
                    .short('w')
                    .long("workers")
                    .takes_value(true)
                    .default_value("2")
                    .about("Number of parallel inference workers.")
                ),
            App::new("process-raw-data")
                .about("Re-processes all unprocessed historical fixes in batches, without making predictions.")
                .arg(Arg::new("workers")
                    .short('w')
                    .long("workers")
                    .takes_value(true)
                    .default_value("2")
                    .about("Number of parallel inference workers.")
                ),
        ]
    }

    pub fn new(main: &'a Main, args: &'a ArgMatches) -> Tracker<'a> {
        Tracker { main, args }
    }

    pub fn run(&mut self, command: &str) -> FnResult<()> {
        match command {
            "fetch-vehicles" => self.run_fetch_vehicles(),
            "process-raw-data" => self.run_process_raw_data(),
            _ => panic!("Invalid arguments."),
        }
    }

    fn worker_count(&self) -> usize {
        self.args
            .value_of("workers")
            .unwrap() // has a default value
            .parse()
            .unwrap_or(2)
    }

    fn schedule_dir(&self) -> String {
        format!("{}/schedule", self.main.dir)
    }

    fn run_fetch_vehicles(&self) -> FnResult<()> {
        let index = SharedScheduleIndex::new(ScheduleIndex::new(&self.schedule_dir(), IndexMode::Interactive)?);
        let estimation = Some(Estimation {
            strategy: Box::new(SingleStopStrategy {
                round_to_seconds: ROUND_SECONDS_LIVE,
                wait_for_departure: true,
            }),
            source: DbTravelTimes::new(Arc::clone(&self.main.pool)),
            writer: PredictionWriter::new(Arc::clone(&self.main.pool)),
        });
        let mut coordinator = Coordinator::new(
            index,
            TrackerStore::new(Arc::clone(&self.main.pool)),
            estimation,
            self.main.verbose,
        );
        coordinator.load_cached_states()?;
        let pipeline = Pipeline::new(coordinator, self.worker_count());

        let url = String::from(self.args.value_of("url").unwrap()); // already validated by clap
        poller::Poller::new(self.main, url, pipeline).run()
    }

    fn run_process_raw_data(&self) -> FnResult<()> {
        let index = SharedScheduleIndex::new(ScheduleIndex::new(&self.schedule_dir(), IndexMode::Batch)?);
        // predictions over historical data would only be overwritten; the
        // replay records stop times and nothing else
        let coordinator = Coordinator::new(
            index,
            TrackerStore::new(Arc::clone(&self.main.pool)),
            None,
            self.main.verbose,
        );
        let mut pipeline = Pipeline::new(coordinator, self.worker_count());

        let store = TrackerStore::new(Arc::clone(&self.main.pool));
        let total = store.count_unprocessed()?;
        let mut processed: u64 = 0;
        let started = Instant::now();

        loop {
            let batch = store.load_unprocessed_batch(PROCESSING_BATCH_SIZE)?;
            if batch.is_empty() {
                break;
            }
            let results = pipeline.process_batch(batch.clone())?;
            store.mark_processed(&batch)?;
            processed += batch.len() as u64;

            let elapsed = started.elapsed().as_secs_f64();
            let rate = processed as f64 / elapsed.max(1e-6);
            let remaining_seconds = (total.saturating_sub(processed)) as f64 / rate.max(1e-6);
            eprintln!(
                "{}/{}  {:.2}/s  ETA: {:.0}s  ({} matched in this batch)",
                processed, total, rate, remaining_seconds, results
            );
        }

        if self.main.verbose {
            println!("Finished, processed {} of {} raw records.", processed, total);
        }
        Ok(())
    }
}

/// The strategy and its plumbing used for live predictions.
pub struct Estimation {
    pub strategy: Box<dyn EstimationStrategy>,
    pub source: DbTravelTimes,
    pub writer: PredictionWriter,
}

/// Owns the live vehicle-state map and its trip-indexed inverse, and runs
/// every commit: trip-instance persistence, conflict resolution, stop
/// transitions, prediction triggers. Only the dispatcher thread touches it.
pub struct Coordinator {
    index: SharedScheduleIndex,
    store: TrackerStore,
    states: HashMap<i32, VehicleState>,
    vehicle_by_trip: HashMap<String, i32>,
    estimation: Option<Estimation>,
    verbose: bool,
}

impl Coordinator {
    pub fn new(
        index: SharedScheduleIndex,
        store: TrackerStore,
        estimation: Option<Estimation>,
        verbose: bool,
    ) -> Coordinator {
        Coordinator {
            index,
            store,
            states: HashMap::new(),
            vehicle_by_trip: HashMap::new(),
            estimation,
            verbose,
        }
    }

    /// Restores the live state map from the persisted vehicle cache, so
    /// that a restart continues trips instead of re-guessing everything.
    pub fn load_cached_states(&mut self) -> FnResult<()> {
        let rows = self.store.load_vehicle_cache()?;
        let mut restored = 0;
        for row in rows {
            if let Some(state) = TrackerStore::resolve_cache_row(row, &self.index) {
                self.vehicle_by_trip.insert(state.trip.id.clone(), state.vehicle_id);
                self.states.insert(state.vehicle_id, state);
                restored += 1;
            }
        }
        if self.verbose {
            println!("Restored {} vehicle states from the cache.", restored);
        }
        Ok(())
    }

    /// Commits one inference result: persists the fresh trip instance,
    /// resolves trip conflicts, derives stop transitions against the prior
    /// state and finally upserts the state maps.
    pub fn save(&mut self, invalid: &mut HashSet<i32>, mut state: VehicleState) -> FnResult<()> {
        if state.trip_instance.id.is_none() {
            state.trip_instance.id = Some(self.store.insert_trip_instance(&state.trip_instance)?);
        }

        if let Some(&other_vehicle) = self.vehicle_by_trip.get(&state.trip.id) {
            if other_vehicle != state.vehicle_id {
                return self.resolve_double_trip(invalid, state, Vec::new());
            }
        }
        self.commit(state)
    }

    fn commit(&mut self, mut state: VehicleState) -> FnResult<()> {
        if let Some(old) = self.states.get(&state.vehicle_id).cloned() {
            self.process_stop_transitions(&old, &mut state)?;
            if old.trip.id != state.trip.id
                && self.vehicle_by_trip.get(&old.trip.id) == Some(&state.vehicle_id)
            {
                self.vehicle_by_trip.remove(&old.trip.id);
            }
        }
        self.vehicle_by_trip.insert(state.trip.id.clone(), state.vehicle_id);
        self.states.insert(state.vehicle_id, state);
        Ok(())
    }

    /// At most one vehicle may be bound to a trip. A stale counterpart is
    /// simply evicted; otherwise the smaller absolute delay keeps the trip
    /// and the loser is re-guessed with the contested trip (and everything
    /// lost earlier in this chain) excluded. The growing exclusion set
    /// bounds the recursion.
    fn resolve_double_trip(
        &mut self,
        invalid: &mut HashSet<i32>,
        state: VehicleState,
        mut exclude_trips: Vec<String>,
    ) -> FnResult<()> {
        let other = match self
            .vehicle_by_trip
            .get(&state.trip.id)
            .and_then(|vehicle_id| self.states.get(vehicle_id))
        {
            Some(other) if other.vehicle_id != state.vehicle_id => other.clone(),
            _ => return self.commit(state),
        };

        if (state.timestamp - other.timestamp).num_seconds().abs() > STALE_MINUTES * 60 {
            invalid.insert(other.vehicle_id);
            self.delete_state(&other)?;
            return self.commit(state);
        }

        match conflicts::resolve_conflict(&state, &other) {
            ConflictWinner::Undecided => Ok(()),
            ConflictWinner::NewState => {
                invalid.insert(other.vehicle_id);
                exclude_trips.push(state.trip.id.clone());
                let reguessed = guess::guess_vehicle_data(&self.index, &other.raw, &exclude_trips);
                self.delete_state(&other)?;
                self.commit(state)?;
                self.continue_resolution(invalid, reguessed, exclude_trips)
            }
            ConflictWinner::OtherState => {
                invalid.insert(state.vehicle_id);
                exclude_trips.push(state.trip.id.clone());
                self.delete_state(&state)?;
                let reguessed = guess::guess_vehicle_data(&self.index, &state.raw, &exclude_trips);
                self.continue_resolution(invalid, reguessed, exclude_trips)
            }
        }
    }

    fn continue_resolution(
        &mut self,
        invalid: &mut HashSet<i32>,
        reguessed: Option<VehicleState>,
        exclude_trips: Vec<String>,
    ) -> FnResult<()> {
        let mut state = match reguessed {
            Some(state) => state,
            None => return Ok(()),
        };
        if state.trip_instance.id.is_none() {
            state.trip_instance.id = Some(self.store.insert_trip_instance(&state.trip_instance)?);
        }
        match self.vehicle_by_trip.get(&state.trip.id) {
            Some(other_vehicle) if *other_vehicle != state.vehicle_id => {
                self.resolve_double_trip(invalid, state, exclude_trips)
            }
            _ => self.commit(state),
        }
    }

    /// Applies the detected departure and arrival events: writes the stop
    /// visit rows, keeps the dwell marker in sync and hands fresh arrivals
    /// to the future estimator.
    fn process_stop_transitions(&mut self, old: &VehicleState, new: &mut VehicleState) -> FnResult<()> {
        for transition in transitions::detect_transitions(old, new) {
            match transition {
                StopTransition::Departure { vehicle_stop_time_id, departure_time } => {
                    self.store.set_departure_time(vehicle_stop_time_id, departure_time)?;
                    new.current_stop = None;
                }
                StopTransition::Arrival { stop_index, arrival_time, departure_time, dwell } => {
                    let instance = if dwell { &new.trip_instance } else { &old.trip_instance };
                    let trip_instance_id = match instance.id {
                        Some(id) => id,
                        None => continue, // instance was never committed; nothing to attach to
                    };
                    let stop_time = &old.trip.stop_times[stop_index];
                    let id = self.store.insert_vehicle_stop_time(
                        trip_instance_id,
                        stop_time.stop_sequence,
                        &stop_time.stop_code,
                        arrival_time,
                        departure_time,
                    )?;
                    if dwell {
                        new.current_stop = Some(DwellingStop {
                            vehicle_stop_time_id: id,
                            stop_index,
                        });
                    }
                    let event = VehicleStopTime {
                        id,
                        trip_instance_id,
                        stop_sequence: stop_time.stop_sequence,
                        stop_code: stop_time.stop_code.clone(),
                        arrival_time: Some(arrival_time),
                        departure_time,
                    };
                    self.publish_predictions(&old.trip, instance.service_day, &event);
                }
            }
        }
        Ok(())
    }

    /// Prediction failures never stall the pipeline; they are logged and
    /// the commit goes on.
    fn publish_predictions(
        &self,
        trip: &Trip,
        service_day: chrono::Date<Local>,
        event: &VehicleStopTime,
    ) {
        let estimation = match &self.estimation {
            Some(estimation) => estimation,
            None => return,
        };
        match predictions_for_event(
            estimation.strategy.as_ref(),
            &estimation.source,
            trip,
            service_day,
            event,
        ) {
            Ok(predictions) => {
                if let Err(e) = estimation
                    .writer
                    .replace_for_trip_instance(event.trip_instance_id, &predictions)
                {
                    eprintln!("Could not write predictions: {}", e);
                }
            }
            Err(e) => eprintln!("Prediction failed: {}", e),
        }
    }

    /// Drops states that have gone silent for longer than the TTL, both
    /// from the live map and from the persisted cache.
    pub fn evict_stale(&mut self) -> FnResult<()> {
        let cutoff = Local::now() - Duration::minutes(STALE_MINUTES);
        let stale: Vec<i32> = self
            .states
            .values()
            .filter(|state| state.timestamp < cutoff)
            .map(|state| state.vehicle_id)
            .collect();
        for vehicle_id in stale {
            if let Some(state) = self.states.remove(&vehicle_id) {
                if self.vehicle_by_trip.get(&state.trip.id) == Some(&vehicle_id) {
                    self.vehicle_by_trip.remove(&state.trip.id);
                }
            }
        }
        self.store.delete_stale_cache_rows(STALE_MINUTES)
    }

    fn delete_state(&mut self, state: &VehicleState) -> FnResult<()> {
        self.states.remove(&state.vehicle_id);
        if self.vehicle_by_trip.get(&state.trip.id) == Some(&state.vehicle_id) {
            self.vehicle_by_trip.remove(&state.trip.id);
        }
        if let Some(trip_instance_id) = state.trip_instance.id {
            self.store.delete_trip_instance(trip_instance_id)?;
        }
        Ok(())
    }

    pub fn persist_cache(&self) -> FnResult<()> {
        self.store.replace_vehicle_cache(self.states.values())
    }

    fn prior_state(&self, vehicle_id: i32) -> Option<VehicleState> {
        self.states.get(&vehicle_id).cloned()
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }
}

/// Drives fixes through the worker pool while preserving per-vehicle
/// causality: a vehicle is never enqueued while an earlier fix of the same
/// vehicle is still in flight, and within each drain commits happen in
/// timestamp order.
pub struct Pipeline {
    pub coordinator: Coordinator,
    pool: WorkerPool,
    waiting: HashSet<i32>,
    invalid: HashSet<i32>,
}

impl Pipeline {
    pub fn new(coordinator: Coordinator, worker_count: usize) -> Pipeline {
        let pool = WorkerPool::new(worker_count, coordinator.index.clone());
        Pipeline {
            coordinator,
            pool,
            waiting: HashSet::new(),
            invalid: HashSet::new(),
        }
    }

    /// Processes one batch of fixes and persists the resulting cache.
    /// Returns how many fixes produced a state.
    pub fn process_batch(&mut self, records: Vec<RawVehicleData>) -> FnResult<usize> {
        let mut matched = 0;
        for raw in records {
            // drain whatever has finished, so the bounded queues never
            // fill up with uncollected results
            self.drain_available(&mut matched)?;
            self.wait_for(Some(raw.vehicle_id), &mut matched)?;
            self.enqueue(raw)?;
        }
        self.wait_for(None, &mut matched)?;
        self.coordinator.persist_cache()?;
        Ok(matched)
    }

    fn drain_available(&mut self, matched: &mut usize) -> FnResult<()> {
        let mut unsaved = Vec::new();
        while let Some((id, result)) = self.pool.try_recv() {
            self.waiting.remove(&id);
            if let Some(state) = result {
                *matched += 1;
                unsaved.push(state);
            }
        }
        self.commit_drained(unsaved)
    }

    fn enqueue(&mut self, raw: RawVehicleData) -> FnResult<()> {
        let prior = self.coordinator.prior_state(raw.vehicle_id);
        self.waiting.insert(raw.vehicle_id);
        self.pool.send(Job { raw, prior })
    }

    /// Drains outstanding results. With a vehicle id, blocks until that
    /// vehicle's in-flight fix has completed (no-op when none is); with
    /// `None`, drains everything. Collected states are committed sorted by
    /// timestamp; vehicles invalidated by conflict resolution in the
    /// meantime are skipped once.
    fn wait_for(&mut self, vehicle_id: Option<i32>, matched: &mut usize) -> FnResult<()> {
        if let Some(id) = vehicle_id {
            if !self.waiting.contains(&id) {
                return Ok(());
            }
        }

        let mut unsaved = Vec::new();
        while !self.waiting.is_empty() {
            let (id, result) = self.pool.recv()?;
            self.waiting.remove(&id);
            if let Some(state) = result {
                *matched += 1;
                unsaved.push(state);
            }
            if vehicle_id == Some(id) {
                break;
            }
        }
        self.commit_drained(unsaved)
    }

    /// Commits collected results in timestamp order. Vehicles invalidated
    /// by conflict resolution in the meantime are skipped once.
    fn commit_drained(&mut self, mut unsaved: Vec<VehicleState>) -> FnResult<()> {
        unsaved.sort_by_key(|state| state.timestamp);
        for state in unsaved {
            if self.invalid.remove(&state.vehicle_id) {
                continue;
            }
            self.coordinator.save(&mut self.invalid, state)?;
        }
        Ok(())
    }
}
