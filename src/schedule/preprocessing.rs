use chrono::{Datelike, Duration, NaiveDate, Weekday};
use geo::Point;
use gtfs_structures::{Exception, Gtfs};
use rayon::prelude::*;
use simple_error::bail;
use std::collections::HashMap;
use std::sync::Arc;

use crate::FnResult;
use crate::geometry::{LocalProjection, ShapeLine};
use super::{Route, ScheduleData, StopInfo, Trip, TripStopTime};

/// Stops may sit up to this far (metres) from the shape and still receive a
/// shape-distance during preprocessing; beyond it the threshold scales with
/// the actual distance.
const STOP_MATCH_TOLERANCE: f64 = 50.0;

/// Builds the processed schedule from a parsed GTFS feed: projects shapes
/// into the local metre plane, resolves stop times, parses brigades from
/// block ids and assigns monotone shape-distances to all stops.
pub fn build_schedule_data(gtfs: &Gtfs) -> FnResult<ScheduleData> {
    let projection = make_projection(gtfs)?;
    let shapes = project_shapes(gtfs, &projection);
    let service_days = collect_service_days(gtfs);

    let trips: HashMap<String, Arc<Trip>> = gtfs
        .trips
        .par_iter()
        .filter_map(|(trip_id, trip)| {
            build_trip(trip, &shapes, &service_days, &projection)
                .map(|built| (trip_id.clone(), Arc::new(built)))
        })
        .collect();

    let mut routes = HashMap::new();
    let mut routes_by_short_name = HashMap::new();
    for (route_id, route) in &gtfs.routes {
        let trip_ids: Vec<String> = trips
            .values()
            .filter(|trip| &trip.route_id == route_id)
            .map(|trip| trip.id.clone())
            .collect();
        routes_by_short_name.insert(route.short_name.clone(), route_id.clone());
        routes.insert(
            route_id.clone(),
            Route {
                id: route_id.clone(),
                short_name: route.short_name.clone(),
                trip_ids,
            },
        );
    }

    let mut stops_by_code = HashMap::new();
    for stop in gtfs.stops.values() {
        if let (Some(latitude), Some(longitude)) = (stop.latitude, stop.longitude) {
            let code = stop.code.clone().unwrap_or_else(|| stop.id.clone());
            stops_by_code.insert(
                code.clone(),
                StopInfo {
                    id: stop.id.clone(),
                    code,
                    name: stop.name.clone(),
                    latitude,
                    longitude,
                },
            );
        }
    }

    let (feed_start_date, feed_end_date) = feed_dates(gtfs, &service_days)?;

    Ok(ScheduleData {
        feed_start_date,
        feed_end_date,
        projection,
        routes,
        routes_by_short_name,
        trips,
        stops_by_code,
    })
}

/// The projection origin is the centroid of all stops, which keeps the
/// planar approximation accurate over the feed's coverage area.
fn make_projection(gtfs: &Gtfs) -> FnResult<LocalProjection> {
    let mut latitude_sum = 0.0;
    let mut longitude_sum = 0.0;
    let mut count = 0;
    for stop in gtfs.stops.values() {
        if let (Some(latitude), Some(longitude)) = (stop.latitude, stop.longitude) {
            latitude_sum += latitude;
            longitude_sum += longitude;
            count += 1;
        }
    }
    if count == 0 {
        bail!("Schedule contains no stops with coordinates.");
    }
    Ok(LocalProjection::new(latitude_sum / count as f64, longitude_sum / count as f64))
}

fn project_shapes(gtfs: &Gtfs, projection: &LocalProjection) -> HashMap<String, ShapeLine> {
    gtfs.shapes
        .iter()
        .map(|(shape_id, points)| {
            let mut ordered: Vec<_> = points.iter().collect();
            ordered.sort_by_key(|point| point.sequence);
            let projected: Vec<Point<f64>> = ordered
                .iter()
                .map(|point| projection.project(point.latitude, point.longitude))
                .collect();
            (shape_id.clone(), ShapeLine::new(projected))
        })
        .collect()
}

fn weekday_enabled(calendar: &gtfs_structures::Calendar, weekday: Weekday) -> bool {
    match weekday {
        Weekday::Mon => calendar.monday,
        Weekday::Tue => calendar.tuesday,
        Weekday::Wed => calendar.wednesday,
        Weekday::Thu => calendar.thursday,
        Weekday::Fri => calendar.friday,
        Weekday::Sat => calendar.saturday,
        Weekday::Sun => calendar.sunday,
    }
}

fn collect_service_days(gtfs: &Gtfs) -> HashMap<String, Vec<NaiveDate>> {
    let mut days: HashMap<String, Vec<NaiveDate>> = HashMap::new();

    for (service_id, calendar) in &gtfs.calendar {
        let mut date = calendar.start_date;
        let service = days.entry(service_id.clone()).or_insert_with(Vec::new);
        while date <= calendar.end_date {
            if weekday_enabled(calendar, date.weekday()) {
                service.push(date);
            }
            date += Duration::days(1);
        }
    }

    for (service_id, exceptions) in &gtfs.calendar_dates {
        let service = days.entry(service_id.clone()).or_insert_with(Vec::new);
        for exception in exceptions {
            match exception.exception_type {
                Exception::Added => service.push(exception.date),
                Exception::Deleted => service.retain(|day| *day != exception.date),
            }
        }
    }

    for service in days.values_mut() {
        service.sort();
        service.dedup();
    }
    days
}

fn build_trip(
    trip: &gtfs_structures::Trip,
    shapes: &HashMap<String, ShapeLine>,
    service_days: &HashMap<String, Vec<NaiveDate>>,
    projection: &LocalProjection,
) -> Option<Trip> {
    let shape = shapes.get(trip.shape_id.as_ref()?)?;
    if shape.is_empty() {
        return None;
    }

    let mut stop_times: Vec<TripStopTime> = Vec::with_capacity(trip.stop_times.len());
    for stop_time in &trip.stop_times {
        let latitude = stop_time.stop.latitude?;
        let longitude = stop_time.stop.longitude?;
        let arrival = stop_time.arrival_time.or(stop_time.departure_time)? as i32;
        let departure = stop_time.departure_time.or(stop_time.arrival_time)? as i32;
        stop_times.push(TripStopTime {
            stop_sequence: stop_time.stop_sequence,
            stop_id: stop_time.stop.id.clone(),
            stop_code: stop_time.stop.code.clone().unwrap_or_else(|| stop_time.stop.id.clone()),
            stop_name: stop_time.stop.name.clone(),
            arrival_time: arrival,
            departure_time: departure,
            shape_dist: 0.0,
            position: projection.project(latitude, longitude),
            latitude,
            longitude,
        });
    }
    if stop_times.len() < 2 {
        return None;
    }
    stop_times.sort_by_key(|stop_time| stop_time.stop_sequence);

    let positions: Vec<Point<f64>> = stop_times.iter().map(|stop_time| stop_time.position).collect();
    let assigned = assign_monotone_shape_dists(shape, &positions);
    for (stop_time, shape_dist) in stop_times.iter_mut().zip(assigned) {
        stop_time.shape_dist = shape_dist;
    }

    let days = service_days.get(&trip.service_id).cloned().unwrap_or_default();
    let start_time = stop_times[0].departure_time;
    let end_time = stop_times[stop_times.len() - 1].arrival_time;

    Some(Trip {
        id: trip.id.clone(),
        route_id: trip.route_id.clone(),
        brigade_id: parse_brigade(trip.block_id.as_deref()),
        headsign: trip.trip_headsign.clone(),
        shape: shape.clone(),
        stop_times,
        start_time,
        end_time,
        service_days: days,
    })
}

/// The brigade (duty) code comes from the GTFS block id; only the digits
/// count, which tolerates formats like "012" and "brigade-12".
fn parse_brigade(block_id: Option<&str>) -> Option<i32> {
    let digits: String = block_id?.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Assigns a shape-distance to every stop such that the distances are
/// monotonically non-decreasing in stop sequence. Each stop contributes the
/// set of all its distinct projections onto the shape; a backtracking
/// search picks one candidate per stop. Shapes that double back would
/// otherwise produce flipped distances.
pub fn assign_monotone_shape_dists(shape: &ShapeLine, stop_positions: &[Point<f64>]) -> Vec<f64> {
    let candidates: Vec<Vec<f64>> = stop_positions
        .iter()
        .map(|position| {
            let threshold = match shape.project(position) {
                Some(projection) => (projection.distance_away * 4.0).max(STOP_MATCH_TOLERANCE),
                None => return Vec::new(),
            };
            // discovery order: the closest projection of each remainder
            // comes first, so backtracking prefers the leg the stop is
            // actually on
            shape.candidate_shape_distances(position, 0.0, threshold)
        })
        .collect();

    let mut chosen = Vec::with_capacity(stop_positions.len());
    if pick_monotone(&candidates, 0, 0.0, &mut chosen) {
        return chosen;
    }

    // No monotone assignment exists, e.g. because a stop is too far from
    // the shape. Fall back to plain projections forced monotone.
    let mut running_max: f64 = 0.0;
    stop_positions
        .iter()
        .map(|position| {
            let dist = shape
                .project(position)
                .map(|projection| projection.distance_along)
                .unwrap_or(running_max);
            running_max = running_max.max(dist);
            running_max
        })
        .collect()
}

fn pick_monotone(candidates: &[Vec<f64>], index: usize, previous: f64, chosen: &mut Vec<f64>) -> bool {
    if index == candidates.len() {
        return true;
    }
    for &shape_dist in &candidates[index] {
        if shape_dist < previous {
            continue;
        }
        chosen.push(shape_dist);
        if pick_monotone(candidates, index + 1, shape_dist, chosen) {
            return true;
        }
        chosen.pop();
    }
    false
}

fn feed_dates(gtfs: &Gtfs, service_days: &HashMap<String, Vec<NaiveDate>>) -> FnResult<(NaiveDate, NaiveDate)> {
    if let Some(info) = gtfs.feed_info.first() {
        if let (Some(start), Some(end)) = (info.start_date, info.end_date) {
            return Ok((start, end));
        }
    }
    let mut all_days = service_days.values().flatten();
    let first = all_days.next();
    match first {
        Some(first) => {
            let mut min = *first;
            let mut max = *first;
            for day in service_days.values().flatten() {
                min = min.min(*day);
                max = max.max(*day);
            }
            Ok((min, max))
        }
        None => bail!("Schedule has neither feed_info dates nor any service days."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotone_assignment_on_doubled_back_shape() {
        // Shape goes out 500 m and comes back 20 m to the north. Stops lie
        // along the way out and the way back, each projecting onto both
        // legs.
        let shape = ShapeLine::new(vec![
            Point::new(0.0, 0.0),
            Point::new(500.0, 0.0),
            Point::new(500.0, 20.0),
            Point::new(0.0, 20.0),
        ]);
        let stops = vec![
            Point::new(100.0, -2.0),  // outbound
            Point::new(400.0, -2.0),  // outbound
            Point::new(400.0, 22.0),  // return leg
            Point::new(100.0, 22.0),  // return leg
        ];
        let dists = assign_monotone_shape_dists(&shape, &stops);
        assert_eq!(dists.len(), 4);
        for pair in dists.windows(2) {
            assert!(pair[0] <= pair[1], "distances must be monotone: {:?}", dists);
        }
        // the two return-leg stops must land on the return leg
        assert!(dists[2] > 520.0);
        assert!(dists[3] > dists[2]);
    }

    #[test]
    fn test_parse_brigade() {
        assert_eq!(parse_brigade(Some("012")), Some(12));
        assert_eq!(parse_brigade(Some("brigade-7")), Some(7));
        assert_eq!(parse_brigade(Some("")), None);
        assert_eq!(parse_brigade(None), None);
    }
}
