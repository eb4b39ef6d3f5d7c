#![recursion_limit="1024"]

mod analyser;
mod feeds;
mod geometry;
mod predictor;
mod schedule;
mod tracker;
mod types;

#[cfg(feature = "monitor")]
mod monitor;

use std::error::Error;
#[macro_use]
extern crate lazy_static;

use clap::{App, Arg, ArgMatches};
use mysql::*;
use retry::delay::Fibonacci;
use retry::retry;
use simple_error::{SimpleError, bail};
use chrono::NaiveDate;
use regex::Regex;
use std::fs;
use std::sync::{Arc, Mutex};

use analyser::Analyser;
use feeds::FeedUpdater;
use schedule::ScheduleData;
use tracker::Tracker;

#[cfg(feature = "monitor")]
use monitor::Monitor;

use std::fmt::Debug;

// This is handy, because mysql defines its own Result type and we don't
// want to repeat std::result::Result
type FnResult<R> = std::result::Result<R, Box<dyn Error>>;

pub struct Main {
    verbose: bool,
    pool: Arc<Pool>,
    args: ArgMatches,
    dir: String,
    // file cache using a Mutex so main doesn't have to be mutable:
    schedule_cache: Mutex<FileCache<ScheduleData>>,
}

fn main() -> FnResult<()> {
    let mut instance = Main::new()?;
    instance.run()?;
    Ok(())
}

trait OrError<T> {
    fn or_error(self, message: &str) -> FnResult<T>;
}

impl<T> OrError<T> for Option<T> {
    fn or_error(self, message: &str) -> FnResult<T> {
        if self.is_none() {
            bail!(message);
        }
        Ok(self.unwrap())
    }
}

impl<T, E> OrError<T> for std::result::Result<T, E>
where E: Debug
{
    fn or_error(self, message: &str) -> FnResult<T> {
        match self {
            Err(e) => bail!(format!("{}\nInner error message: {:?}", message, e)),
            Ok(t) => Ok(t)
        }
    }
}

/// Reads contents of the given directory and returns an alphabetically sorted list of included files / subdirectories as Vector of Strings.
pub fn read_dir_simple(path: &str) -> FnResult<Vec<String>> {
    let mut path_list: Vec<String> = fs::read_dir(path)?
        .filter_map(|r| r.ok()) // unwraps Options and ignores any None values
        .map(|d| {
            String::from(d.path().to_str().expect(&format!(
                "Found file with invalid UTF8 in file name in directory {}.",
                &path
            )))
        })
        .collect();
    path_list.sort();
    Ok(path_list)
}

pub fn date_from_filename(filename: &str) -> FnResult<NaiveDate> {
    lazy_static! {
        static ref FIND_DATE: Regex = Regex::new(r"(\d{4})-(\d{2})-(\d{2})").unwrap(); // can't fail because our hard-coded regex is known to be ok
    }
    let date_element_captures =
        FIND_DATE
            .captures(&filename)
            .or_error(&format!(
            "File name does not contain a valid date (does not match format YYYY-MM-DD): {}",
            filename
        ))?;
    let date_option = NaiveDate::from_ymd_opt(
        date_element_captures[1].parse().unwrap(), // can't fail because input string is known to be a bunch of decimal digits
        date_element_captures[2].parse().unwrap(), // can't fail because input string is known to be a bunch of decimal digits
        date_element_captures[3].parse().unwrap(), // can't fail because input string is known to be a bunch of decimal digits
    );
    Ok(date_option.ok_or(SimpleError::new(format!("File name does not contain a valid date (format looks ok, but values are out of bounds): {}", filename)))?)
}

fn parse_args() -> ArgMatches {
    #[allow(unused_mut)]
    let mut app = App::new("transit-prediction")
        .subcommand(FeedUpdater::get_subcommand())
        .arg(Arg::new("verbose")
            .short('v')
            .long("verbose")
            .about("Output status messages during run.")
        ).arg(Arg::new("password")
            .short('p')
            .long("password")
            .env("DB_PASSWORD")
            .takes_value(true)
            .about("Password used to connect to the database.")
            .required_unless("help")
        ).arg(Arg::new("user")
            .short('u')
            .long("user")
            .env("DB_USER")
            .takes_value(true)
            .about("User on the database.")
            .default_value("transit")
        ).arg(Arg::new("host")
            .long("host")
            .env("DB_HOST")
            .takes_value(true)
            .about("Host on which the database can be connected.")
            .default_value("localhost")
        ).arg(Arg::new("port")
            .long("port")
            .env("DB_PORT")
            .takes_value(true)
            .about("Port on which the database can be connected.")
            .default_value("3306")
        ).arg(Arg::new("database")
            .short('d')
            .long("database")
            .env("DB_DATABASE")
            .takes_value(true)
            .about("Database name which will be selected.")
            .default_value("transit")
        ).arg(Arg::new("dir")
            .long("dir")
            .env("TRANSIT_DATA_DIR")
            .value_name("DIRECTORY")
            .required_unless("help")
            .about("The directory which contains schedules.")
            .long_about(
                "The directory that contains the GTFS schedules (located in a subdirectory named 'schedule', \
                one dated zip per feed version) along with their preprocessed caches."
            )
        ).arg(Arg::new("schedule")
            .long("schedule")
            .about("The path of the GTFS schedule that is used to look up any static GTFS data.")
            .takes_value(true)
            .value_name("GTFS_SCHEDULE")
        );

    for subcommand in Tracker::get_subcommands() {
        app = app.subcommand(subcommand);
    }
    for subcommand in Analyser::get_subcommands() {
        app = app.subcommand(subcommand);
    }

    #[cfg(feature = "monitor")]
    {
        app = app.subcommand(Monitor::get_subcommand());
    }

    let matches = app.get_matches();
    return matches;
}

impl Main {
    /// Constructs a new instance of Main, with parsed arguments and a ready-to-use pool of database connections.
    fn new() -> FnResult<Main> {
        let args = parse_args();
        let verbose = args.is_present("verbose");
        let dir = String::from(args.value_of("dir").unwrap()); // already validated by clap

        if verbose {
            println!("Connecting to database…");
        }
        let pool = retry(Fibonacci::from_millis(1000), || {
            Main::open_db(&args, verbose)
        })
        .expect("DB connections should succeed eventually.");
        Ok(Main {
            args,
            verbose,
            pool: Arc::new(pool),
            dir,
            schedule_cache: Mutex::new(FileCache::<ScheduleData>::new()),
        })
    }

    /// Runs the actions that are selected via the command line args
    fn run(&mut self) -> FnResult<()> {
        match self.args.clone().subcommand() {
            ("update-feeds", Some(sub_args)) => {
                let mut updater = FeedUpdater::new(&self, sub_args);
                updater.run()
            },
            ("fetch-vehicles", Some(sub_args)) => {
                let mut tracker = Tracker::new(&self, sub_args);
                tracker.run("fetch-vehicles")
            },
            ("process-raw-data", Some(sub_args)) => {
                let mut tracker = Tracker::new(&self, sub_args);
                tracker.run("process-raw-data")
            },
            ("calculate-travel-times", Some(sub_args)) => {
                let mut analyser = Analyser::new(&self, sub_args);
                analyser.run("calculate-travel-times")
            },
            ("clean", Some(sub_args)) => {
                let mut analyser = Analyser::new(&self, sub_args);
                analyser.run("clean")
            },
            ("accuracy", Some(sub_args)) => {
                let mut analyser = Analyser::new(&self, sub_args);
                analyser.run("accuracy")
            },
            #[cfg(feature = "monitor")]
            ("monitor", Some(sub_args)) => {
                Monitor::run(&self, sub_args)
            },
            _ => panic!("Invalid arguments."),
        }
    }

    /// Opens a connection to a database and returns the resulting connection pool.
    /// Takes configuration values from DB_PASSWORD, DB_USER, DB_HOST, DB_PORT and DB_DATABASE
    /// environment variables. For all values except DB_PASSWORD a default is provided.
    fn open_db(args: &ArgMatches, verbose: bool) -> FnResult<Pool> {
        if verbose {
            println!("Trying to connect to the database.");
        }
        let url = format!(
            "mysql://{}:{}@{}:{}/{}",
            args.value_of("user").unwrap(), // already validated by clap
            args.value_of("password").unwrap(), // already validated by clap
            args.value_of("host").unwrap(), // already validated by clap
            args.value_of("port").unwrap(), // already validated by clap
            args.value_of("database").unwrap()  // already validated by clap
        );
        let pool = Pool::new(url)?;
        Ok(pool)
    }

    // returns the processed schedule (from args or auto-lookup)
    pub fn get_schedule(&self) -> FnResult<Arc<ScheduleData>> {
        let filename = self.get_schedule_filename()?;
        FileCache::get_cached_simple(&self.schedule_cache, &filename)
    }

    fn get_schedule_filename(&self) -> FnResult<String> {
        // find out if schedule arg is given:
        let schedule_filename: String =
        if let Some(filename) = self.args.value_of("schedule") {
            filename.to_string()
        } else {
            // if the arg is not given, look up the newest schedule file:
            println!("No schedule file name given, looking up the most recent schedule file…");
            let schedule_dir = format!("{}/schedule", self.dir);
            let schedule_filenames: Vec<String> = read_dir_simple(&schedule_dir)?
                .into_iter()
                .filter(|filename| filename.ends_with(".zip"))
                .collect();
            schedule_filenames.last().or_error("No schedule found when trying to find the newest schedule file.")?.clone() //return the newest file (last filename)
        };
        println!("Using schedule '{}'", schedule_filename);
        Ok(schedule_filename)
    }
}

pub struct FileCache<T> {
    object: Option<Arc<T>>,
    filename: Option<String>,
    modification_time: Option<std::time::SystemTime>,
}

impl<T> FileCache<T> where T: Loadable<T> {

    //creates a new, empty file cache
    pub fn new() -> FileCache<T> {
        return FileCache::<T> {
            object: None,
            filename: None,
            modification_time: None
        }
    }

    // wrapper around get_cached so the mutex stuff does not have to be repeated
    pub fn get_cached_simple(cache: &Mutex<Self>, filename: &str) -> FnResult<Arc<T>> {
        let mut cache_lock = cache.lock().unwrap();
        cache_lock.get_cached(filename)
    }

    // Returns the cached object.
    // If possible, use get_cached_simple instead to avoid dealing with mutex stuff directly.
    pub fn get_cached(&mut self, filename: &str) -> FnResult<Arc<T>> {

        let mut filename_changed = true;
        let mut modtime_changed = true;

        let metadata = fs::metadata(filename)?;
        let mod_time = metadata.modified()?;

        //compare filenames:
        if let Some(f) = &self.filename {
            if &f == &filename {
                filename_changed = false;

                //compare modification times:
                if let Some(mt) = self.modification_time {
                    if mt == mod_time {
                        modtime_changed = false;
                    } else {
                        self.modification_time = Some(mod_time);
                    }
                } else {
                    self.modification_time = Some(mod_time);
                }
            } else {
                self.filename = Some(filename.to_string());
                self.modification_time = Some(mod_time);
            }
        } else {
            self.filename = Some(filename.to_string());
            self.modification_time = Some(mod_time);
        }

        //reload file if anything changed:
        if filename_changed || modtime_changed {
            self.object = None;
            let obj = <T>::load(filename)?;
            self.object = Some(Arc::new(obj));
        }

        match &self.object {
            Some(o) => Ok(o.clone()),
            None => bail!("Object {} could not be returned from cache. Loading probably failed in a previous iteration.", filename)
        }
    }
}

pub trait Loadable<T> {
    fn load(filename: &str) -> FnResult<T>;
}

impl Loadable<ScheduleData> for ScheduleData {
    fn load(filename: &str) -> FnResult<ScheduleData> {
        let data = ScheduleData::load_or_build(filename)?;
        return Ok(data);
    }
}
