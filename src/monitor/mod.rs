use crate::{FnResult, Main};
use crate::schedule::{seconds_since_midnight, ScheduleData};
use crate::types::GtfsDateTime;
use chrono::{DateTime, Duration, Local, NaiveDateTime};
use chrono::offset::TimeZone;
use clap::{App, ArgMatches};
use mysql::*;
use mysql::prelude::*;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::{Body, Request, Response, Server, StatusCode};
use hyper::header::HeaderValue;
use hyper::service::{make_service_fn, service_fn};
use percent_encoding::percent_decode_str;

const PORT: u16 = 3000;
const HISTORY_WINDOW_MINUTES: i64 = 15;
const STOP_BOARD_LOOKAHEAD_SECONDS: i64 = 3600;

/// Serves the read-only JSON queries against the live tables and the
/// newest schedule: current vehicles, recent history, per-stop departure
/// boards with predictions and per-vehicle trip details.
#[derive(Clone)]
pub struct Monitor {
    pub schedule: Arc<ScheduleData>,
    pub pool: Arc<Pool>,
}

impl Monitor {
    pub fn get_subcommand() -> App<'static> {
        App::new("monitor").about("Starts a web server that exposes the live state as JSON.")
    }

    /// Runs the actions that are selected via the command line args
    pub fn run(main: &Main, _sub_args: &ArgMatches) -> FnResult<()> {
        let monitor = Monitor {
            schedule: main.get_schedule()?,
            pool: main.pool.clone(),
        };

        let mut rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            serve_monitor(Arc::new(monitor)).await
        });

        Ok(())
    }
}

async fn serve_monitor(monitor: Arc<Monitor>) {
    let addr = SocketAddr::from(([0, 0, 0, 0], PORT));
    let monitor = monitor.clone();

    // A `Service` is needed for every connection, so this
    // creates one from our `handle_request` function.
    let make_svc = make_service_fn(move |_conn| {
        let monitor = monitor.clone();
        async move {
            let monitor = monitor.clone();
            Ok::<_, Infallible>(service_fn(move |request: Request<Body>| {
                let monitor = monitor.clone();
                async move {
                    handle_request(request, monitor.clone()).await
                }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);

    println!("Waiting for connections on {}…", addr);
    if let Err(e) = server.await {
        eprintln!("server error: {}", e);
    }
}

async fn handle_request(req: Request<Body>, monitor: Arc<Monitor>) -> std::result::Result<Response<Body>, Infallible> {
    let mut response = Response::new(Body::empty());
    let query = query_params(&req);

    let path_parts: Vec<String> = req
        .uri()
        .path()
        .split('/')
        .map(|part| percent_decode_str(part).decode_utf8_lossy().into_owned())
        .filter(|part| !part.is_empty())
        .collect();
    let path_parts_str: Vec<&str> = path_parts.iter().map(|part| part.as_str()).collect();

    let result = match &path_parts_str[..] {
        ["vehicles"] => vehicles_json(&monitor, &query),
        ["history"] => history_json(&monitor, &query),
        ["stop", stop_code] => stop_json(&monitor, stop_code),
        ["vehicle", vehicle_id] => vehicle_json(&monitor, vehicle_id),
        _ => {
            *response.status_mut() = StatusCode::NOT_FOUND;
            *response.body_mut() = Body::from("{}");
            set_json_header(&mut response);
            return Ok(response);
        }
    };

    match result {
        Ok(value) => {
            *response.body_mut() = Body::from(value.to_string());
        }
        Err(e) => {
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            *response.body_mut() = Body::from(json!({ "error": e.to_string() }).to_string());
        }
    }
    set_json_header(&mut response);
    Ok(response)
}

fn set_json_header(response: &mut Response<Body>) {
    response.headers_mut().append(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
}

/// Query parameters, with `lines` collected from repeated keys and
/// comma-separated values alike.
struct QueryParams {
    values: HashMap<String, String>,
    lines: Vec<String>,
}

fn query_params(req: &Request<Body>) -> QueryParams {
    let mut values = HashMap::new();
    let mut lines = Vec::new();
    if let Some(query) = req.uri().query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if key == "lines" {
                for line in value.split(',').filter(|line| !line.is_empty()) {
                    lines.push(String::from(line));
                }
            } else {
                values.insert(key.into_owned(), value.into_owned());
            }
        }
    }
    QueryParams { values, lines }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn format_time(time: &DateTime<Local>) -> JsonValue {
    json!(time.to_rfc3339())
}

/// Current vehicles on the selected routes, straight from the persisted
/// vehicle cache. Positions come as [latitude, longitude] pairs.
fn vehicles_json(monitor: &Monitor, query: &QueryParams) -> FnResult<JsonValue> {
    if query.lines.is_empty() {
        return Ok(json!([]));
    }
    let mut conn = monitor.pool.get_conn()?;
    let statement = format!(
        r"SELECT
            `vehicle_id`, `route_name`, `trip_id`, `trip_instance_id`,
            `latitude`, `longitude`, `timestamp`, `shape_dist`, `next_stop_sequence`
        FROM `vehicle_cache`
        WHERE `route_name` IN ({});",
        placeholders(query.lines.len())
    );
    let rows: Vec<(i32, String, String, u64, f64, f64, NaiveDateTime, f64, u16)> =
        conn.exec(statement, query.lines.clone())?;

    let vehicles: Vec<JsonValue> = rows
        .into_iter()
        .map(|(vehicle_id, route_name, trip_id, trip_instance_id, latitude, longitude, timestamp, shape_dist, next_stop_sequence)| {
            json!({
                "vehicle_id": vehicle_id,
                "route_name": route_name,
                "trip_id": trip_id,
                "trip_instance_id": trip_instance_id,
                "position": [latitude, longitude],
                "timestamp": format_time(&Local.from_local_datetime(&timestamp).unwrap()),
                "shape_dist": shape_dist,
                "next_stop_sequence": next_stop_sequence,
            })
        })
        .collect();
    Ok(json!(vehicles))
}

/// Raw fixes of the selected routes within a 15-minute window after the
/// given start time.
fn history_json(monitor: &Monitor, query: &QueryParams) -> FnResult<JsonValue> {
    let start_time = match query.values.get("start_time") {
        Some(text) => DateTime::parse_from_rfc3339(text)?.with_timezone(&Local),
        None => return Ok(json!({})),
    };
    if query.lines.is_empty() {
        return Ok(json!({}));
    }

    let mut conn = monitor.pool.get_conn()?;
    let statement = format!(
        r"SELECT `vehicle_id`, `route_name`, `latitude`, `longitude`, `timestamp`
        FROM `raw_vehicle_data`
        WHERE `timestamp` >= ? AND `timestamp` <= ? AND `route_name` IN ({})
        ORDER BY `timestamp`;",
        placeholders(query.lines.len())
    );
    let mut parameters: Vec<Value> = vec![
        Value::from(start_time.naive_local()),
        Value::from((start_time + Duration::minutes(HISTORY_WINDOW_MINUTES)).naive_local()),
    ];
    parameters.extend(query.lines.iter().map(Value::from));
    let rows: Vec<(i32, String, f64, f64, NaiveDateTime)> = conn.exec(statement, parameters)?;

    let fixes: Vec<JsonValue> = rows
        .into_iter()
        .map(|(vehicle_id, route_name, latitude, longitude, timestamp)| {
            json!({
                "vehicle_id": vehicle_id,
                "route_name": route_name,
                "position": [latitude, longitude],
                "timestamp": format_time(&Local.from_local_datetime(&timestamp).unwrap()),
            })
        })
        .collect();
    Ok(json!(fixes))
}

/// The departure board of one stop: every scheduled visit within the next
/// hour, overlaid with the newest prediction per live trip instance.
fn stop_json(monitor: &Monitor, stop_code: &str) -> FnResult<JsonValue> {
    let stop_code = String::from(stop_code);
    let stop = monitor.schedule.stops_by_code.get(&stop_code);

    let now = Local::now();
    let today = now.date();
    let since_day_start = seconds_since_midnight(now);

    // scheduled visits within the next hour, including 24+-hour times of
    // today's overnight trips
    let mut board: HashMap<String, JsonValue> = HashMap::new();
    for trip in monitor.schedule.trips.values() {
        if !trip.active_on(today.naive_local()) {
            continue;
        }
        for stop_time in &trip.stop_times {
            if stop_time.stop_code != stop_code {
                continue;
            }
            let arrival = stop_time.arrival_time as i64;
            let in_first_window = arrival >= since_day_start
                && arrival <= since_day_start + STOP_BOARD_LOOKAHEAD_SECONDS;
            let in_wrapped_window = arrival >= since_day_start + crate::schedule::SECONDS_PER_DAY
                && arrival <= since_day_start + crate::schedule::SECONDS_PER_DAY + STOP_BOARD_LOOKAHEAD_SECONDS;
            if in_first_window || in_wrapped_window {
                board.insert(
                    trip.id.clone(),
                    json!({
                        "route_name": monitor.schedule.routes.get(&trip.route_id).map(|route| route.short_name.clone()),
                        "headsign": trip.headsign,
                        "probability": JsonValue::Null,
                        "time": format_time(&GtfsDateTime::new(today, stop_time.arrival_time).date_time()),
                        "vehicle_id": JsonValue::Null,
                    }),
                );
            }
        }
    }

    // newest prediction per trip instance, with its most likely minute
    let mut conn = monitor.pool.get_conn()?;
    let rows: Vec<(u64, u64, String, f64, NaiveDateTime)> = conn.exec(
        r"SELECT sp.id, sp.trip_instance_id, ti.trip_id, stp.probability, stp.time
        FROM `stop_prediction` sp
        JOIN `trip_instance` ti ON ti.id = sp.trip_instance_id
        JOIN `stop_time_prediction` stp ON stp.stop_prediction_id = sp.id
        WHERE sp.stop_code = :stop_code AND stp.time >= :now
        ORDER BY sp.trip_instance_id, sp.id DESC;",
        params! { "stop_code" => &stop_code, "now" => now.naive_local() },
    )?;

    let vehicle_by_instance: HashMap<u64, i32> = conn
        .query::<(u64, i32), _>("SELECT `trip_instance_id`, `vehicle_id` FROM `vehicle_cache`;")?
        .into_iter()
        .collect();

    let mut newest_prediction: HashMap<u64, u64> = HashMap::new();
    let mut most_likely: HashMap<u64, (String, f64, NaiveDateTime)> = HashMap::new();
    for (prediction_id, trip_instance_id, trip_id, probability, time) in rows {
        let newest = *newest_prediction.entry(trip_instance_id).or_insert(prediction_id);
        if prediction_id != newest {
            continue;
        }
        let entry = most_likely
            .entry(trip_instance_id)
            .or_insert((trip_id, probability, time));
        if probability > entry.1 {
            entry.1 = probability;
            entry.2 = time;
        }
    }

    for (trip_instance_id, (trip_id, probability, time)) in most_likely {
        let (route_name, headsign) = match monitor.schedule.trips.get(&trip_id) {
            Some(trip) => (
                monitor.schedule.routes.get(&trip.route_id).map(|route| route.short_name.clone()),
                trip.headsign.clone(),
            ),
            None => (None, None),
        };
        board.insert(
            trip_id,
            json!({
                "route_name": route_name,
                "headsign": headsign,
                "probability": format!("{:.0}%", probability * 100.0),
                "time": format_time(&Local.from_local_datetime(&time).unwrap()),
                "vehicle_id": vehicle_by_instance.get(&trip_instance_id),
            }),
        );
    }

    let mut entries: Vec<JsonValue> = board.into_iter().map(|(_, entry)| entry).collect();
    entries.sort_by_key(|entry| entry["time"].as_str().map(String::from));

    Ok(json!({
        "stop_code": stop_code,
        "stop_name": stop.map(|stop| stop.name.clone()),
        "departures": entries,
    }))
}

/// Everything about one live vehicle: its trip's shape split at the
/// vehicle position, all stops with scheduled, observed and predicted
/// times, and where along the shape each stop sits.
fn vehicle_json(monitor: &Monitor, vehicle_id: &str) -> FnResult<JsonValue> {
    let vehicle_id: i32 = match vehicle_id.parse() {
        Ok(vehicle_id) => vehicle_id,
        Err(_) => return Ok(json!({})),
    };

    let mut conn = monitor.pool.get_conn()?;
    let row: Option<(String, u64, chrono::NaiveDate, f64, f64, f64, u16)> = conn.exec_first(
        r"SELECT `trip_id`, `trip_instance_id`, `service_day`, `shape_dist`,
            `latitude`, `longitude`, `next_stop_sequence`
        FROM `vehicle_cache` WHERE `vehicle_id` = :vehicle_id;",
        params! { vehicle_id },
    )?;
    let (trip_id, trip_instance_id, service_day, shape_dist, latitude, longitude, next_stop_sequence) =
        match row {
            Some(row) => row,
            None => return Ok(json!({})),
        };

    let trip = match monitor.schedule.trips.get(&trip_id) {
        Some(trip) => trip,
        None => return Ok(json!({})),
    };
    let service_day = Local.from_local_date(&service_day).unwrap();
    let projection = &monitor.schedule.projection;

    let (shape_prev, shape_next) = trip.shape.cut(shape_dist);
    let unproject_line = |line: &crate::geometry::ShapeLine| -> Vec<JsonValue> {
        line.points()
            .iter()
            .map(|point| {
                let (latitude, longitude) = projection.unproject(point);
                json!([latitude, longitude])
            })
            .collect()
    };

    // observed stop visits of this trip instance
    let visits: HashMap<u16, (Option<NaiveDateTime>, Option<NaiveDateTime>)> = conn
        .exec::<(u16, Option<NaiveDateTime>, Option<NaiveDateTime>), _, _>(
            r"SELECT `stop_sequence`, `arrival_time`, `departure_time`
            FROM `vehicle_stop_time` WHERE `trip_instance_id` = :trip_instance_id;",
            params! { trip_instance_id },
        )?
        .into_iter()
        .map(|(stop_sequence, arrival, departure)| (stop_sequence, (arrival, departure)))
        .collect();

    // newest predictions for this trip instance, grouped by stop
    let prediction_rows: Vec<(u64, u16, f64, NaiveDateTime)> = conn.exec(
        r"SELECT sp.made_at_vehicle_stop_time_id, sp.stop_sequence, stp.probability, stp.time
        FROM `stop_prediction` sp
        JOIN `stop_time_prediction` stp ON stp.stop_prediction_id = sp.id
        WHERE sp.trip_instance_id = :trip_instance_id
        ORDER BY sp.made_at_vehicle_stop_time_id DESC;",
        params! { trip_instance_id },
    )?;
    let newest_event = prediction_rows.first().map(|row| row.0);
    let mut predictions: HashMap<u16, Vec<JsonValue>> = HashMap::new();
    for (event_id, stop_sequence, probability, time) in prediction_rows {
        if Some(event_id) != newest_event {
            continue;
        }
        predictions.entry(stop_sequence).or_insert_with(Vec::new).push(json!({
            "probability": probability,
            "time": format_time(&Local.from_local_datetime(&time).unwrap()),
        }));
    }

    let stops: Vec<JsonValue> = trip
        .stop_times
        .iter()
        .map(|stop_time| {
            let (observed_arrival, observed_departure) = visits
                .get(&stop_time.stop_sequence)
                .cloned()
                .unwrap_or((None, None));
            let projected = trip
                .shape
                .interpolate(stop_time.shape_dist)
                .map(|point| {
                    let (latitude, longitude) = projection.unproject(&point);
                    json!([latitude, longitude])
                });
            json!({
                "stop_sequence": stop_time.stop_sequence,
                "stop_code": stop_time.stop_code,
                "stop_name": stop_time.stop_name,
                "position": [stop_time.latitude, stop_time.longitude],
                "projected": projected,
                "scheduled_arrival": format_time(&GtfsDateTime::new(service_day, stop_time.arrival_time).date_time()),
                "observed_arrival": observed_arrival.map(|naive| format_time(&Local.from_local_datetime(&naive).unwrap())),
                "observed_departure": observed_departure.map(|naive| format_time(&Local.from_local_datetime(&naive).unwrap())),
                "estimated_times": predictions.get(&stop_time.stop_sequence).cloned().unwrap_or_default(),
            })
        })
        .collect();

    Ok(json!({
        "vehicle_id": vehicle_id,
        "route_name": monitor.schedule.routes.get(&trip.route_id).map(|route| route.short_name.clone()),
        "headsign": trip.headsign,
        "trip_id": trip.id,
        "position": [latitude, longitude],
        "shape_prev": unproject_line(&shape_prev),
        "shape_next": unproject_line(&shape_next),
        "next_stop_sequence": next_stop_sequence,
        "stops": stops,
    }))
}
