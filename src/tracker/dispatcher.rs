use chrono::Duration;
use std::sync::{Arc, Mutex};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread;
use std::thread::JoinHandle;

use crate::FnResult;
use crate::schedule::SharedScheduleIndex;
use crate::types::{RawVehicleData, VehicleState};
use simple_error::bail;

use super::{guess, update};
use super::STALE_MINUTES;

/// Bound of the dispatcher's input and output queues. Enqueueing past it
/// blocks, which is the backpressure that keeps the dispatcher from racing
/// ahead of the workers.
const QUEUE_BOUND: usize = 1000;

/// One unit of work for a worker: a raw fix plus a snapshot of the
/// vehicle's state as of dispatch time. The dispatcher never enqueues a
/// vehicle while an earlier fix of the same vehicle is still in flight, so
/// the snapshot is always current.
pub struct Job {
    pub raw: RawVehicleData,
    pub prior: Option<VehicleState>,
}

/// A pool of stateless inference workers. They read the schedule index and
/// nothing else; every result goes back to the dispatcher, which owns all
/// mutation.
pub struct WorkerPool {
    input: Option<SyncSender<Job>>,
    output: Receiver<(i32, Option<VehicleState>)>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(worker_count: usize, index: SharedScheduleIndex) -> WorkerPool {
        let (input, job_receiver) = sync_channel::<Job>(QUEUE_BOUND);
        let (result_sender, output) = sync_channel::<(i32, Option<VehicleState>)>(QUEUE_BOUND);
        let job_receiver = Arc::new(Mutex::new(job_receiver));

        let workers = (0..worker_count)
            .map(|_| {
                let jobs = Arc::clone(&job_receiver);
                let results = result_sender.clone();
                let index = index.clone();
                thread::spawn(move || loop {
                    let job = {
                        let receiver = jobs.lock().unwrap();
                        receiver.recv()
                    };
                    let job = match job {
                        Ok(job) => job,
                        Err(_) => break, // dispatcher hung up
                    };
                    let vehicle_id = job.raw.vehicle_id;
                    let result = process_raw_data(&index, job);
                    if results.send((vehicle_id, result)).is_err() {
                        break;
                    }
                })
            })
            .collect();

        WorkerPool {
            input: Some(input),
            output,
            workers,
        }
    }

    pub fn send(&self, job: Job) -> FnResult<()> {
        match &self.input {
            Some(input) => {
                input.send(job)?;
                Ok(())
            }
            None => bail!("Worker pool is already shut down."),
        }
    }

    pub fn recv(&self) -> FnResult<(i32, Option<VehicleState>)> {
        Ok(self.output.recv()?)
    }

    /// A result if one is already waiting; never blocks.
    pub fn try_recv(&self) -> Option<(i32, Option<VehicleState>)> {
        self.output.try_recv().ok()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.input = None; // closes the queue, the workers drain and exit
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// The per-fix inference a worker runs: a warm update when the prior state
/// is fresh, nothing new for a duplicate timestamp, a cold guess otherwise.
/// Invalid fixes produce no state but are still acknowledged so the
/// dispatcher can mark them processed.
fn process_raw_data(index: &SharedScheduleIndex, job: Job) -> Option<VehicleState> {
    let raw = job.raw;
    if !raw.is_valid() {
        return None;
    }

    match job.prior {
        Some(old) => {
            let elapsed = raw.timestamp - old.timestamp;
            if elapsed == Duration::zero() {
                Some(old)
            } else if elapsed > Duration::zero() && elapsed < Duration::minutes(STALE_MINUTES) {
                let mut updated = update::update_vehicle_data(index, &raw, &old);
                // when the fallback guess re-elected the same trip, the
                // existing instance continues instead of a fresh one
                if let Some(state) = &mut updated {
                    if state.trip_instance.id.is_none() && state.trip.id == old.trip.id {
                        state.trip_instance = old.trip_instance.clone();
                    }
                }
                updated
            } else {
                // stale or out-of-order: infer from scratch
                guess::guess_vehicle_data(index, &raw, &[])
            }
        }
        None => guess::guess_vehicle_data(index, &raw, &[]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use crate::schedule::{local_date, IndexMode, ScheduleIndex};
    use crate::schedule::testing::*;

    fn test_day() -> NaiveDate {
        NaiveDate::from_ymd(2024, 3, 4)
    }

    fn schedule() -> Arc<crate::schedule::ScheduleData> {
        let trip = straight_trip(
            "trip_1",
            "route-33",
            1,
            1000.0,
            vec![
                stop(1, "A", 6 * 3600, 6 * 3600, 100.0),
                stop(2, "B", 6 * 3600 + 1800, 6 * 3600 + 1800, 400.0),
                stop(3, "C", 7 * 3600, 7 * 3600, 900.0),
            ],
            vec![test_day()],
        );
        schedule_with_trips("33", "route-33", vec![trip])
    }

    #[test]
    fn test_pool_processes_fixes() {
        let schedule = schedule();
        let index = SharedScheduleIndex::new(ScheduleIndex::from_feeds(
            vec![Arc::clone(&schedule)],
            IndexMode::Batch,
        ));
        let pool = WorkerPool::new(2, index);

        let fix = fix_at(
            &schedule,
            7001,
            "33",
            1,
            geo::Point::new(300.0, 0.0),
            local_date(test_day()).and_hms(6, 15, 0),
        );
        pool.send(Job { raw: fix, prior: None }).unwrap();
        let (vehicle_id, state) = pool.recv().unwrap();
        assert_eq!(vehicle_id, 7001);
        let state = state.unwrap();
        assert_eq!(state.trip.id, "trip_1");
    }

    #[test]
    fn test_invalid_fix_yields_no_state_but_a_result() {
        let schedule = schedule();
        let index = SharedScheduleIndex::new(ScheduleIndex::from_feeds(
            vec![Arc::clone(&schedule)],
            IndexMode::Batch,
        ));
        let pool = WorkerPool::new(1, index);

        let mut fix = fix_at(
            &schedule,
            7001,
            "33",
            1,
            geo::Point::new(300.0, 0.0),
            local_date(test_day()).and_hms(6, 15, 0),
        );
        fix.route_name = String::new();
        pool.send(Job { raw: fix, prior: None }).unwrap();
        let (vehicle_id, state) = pool.recv().unwrap();
        assert_eq!(vehicle_id, 7001);
        assert!(state.is_none());
    }

    #[test]
    fn test_stale_prior_state_falls_through_to_guess() {
        let schedule = schedule();
        let index = SharedScheduleIndex::new(ScheduleIndex::from_feeds(
            vec![Arc::clone(&schedule)],
            IndexMode::Batch,
        ));

        let trip = Arc::clone(schedule.trips.get("trip_1").unwrap());
        let old_fix = fix_at(
            &schedule,
            7001,
            "33",
            1,
            geo::Point::new(300.0, 0.0),
            local_date(test_day()).and_hms(6, 9, 0),
        );
        let mut old = guess::guess_vehicle_data_with_trip(
            &schedule,
            &trip,
            local_date(test_day()),
            &old_fix,
        )
        .unwrap();
        old.trip_instance.id = Some(77);

        // six minutes later: the prior state is ignored and a fresh guess
        // mints a new, uncommitted trip instance
        let fix = fix_at(
            &schedule,
            7001,
            "33",
            1,
            geo::Point::new(600.0, 0.0),
            local_date(test_day()).and_hms(6, 15, 0),
        );
        let pool = WorkerPool::new(1, index);
        pool.send(Job { raw: fix, prior: Some(old) }).unwrap();
        let (_, state) = pool.recv().unwrap();
        let state = state.unwrap();
        assert!(state.trip_instance.id.is_none());
        assert_eq!(state.trip.id, "trip_1");
    }
}
