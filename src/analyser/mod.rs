mod accuracy;
mod clean;
mod travel_times;

use chrono::NaiveDate;
use clap::{App, Arg, ArgMatches};
use simple_error::bail;

use crate::{FnResult, Main};

/// The offline jobs: rebuilding the empirical travel-time tables, the
/// integrity cleanup passes and the prediction accuracy evaluation. None
/// of these ever runs concurrently with the live pipeline.
pub struct Analyser<'a> {
    main: &'a Main,
    args: &'a ArgMatches,
}

impl<'a> Analyser<'a> {
    pub fn get_subcommands() -> Vec<App<'a>> {
        vec![
            App::new("calculate-travel-times")
                .about("Rebuilds the travel_time and average_travel_time tables from the recorded stop visits.")
                .arg(Arg::new("day")
                    .short('d')
                    .long("day")
                    .takes_value(true)
                    .value_name("YYYY-MM-DD")
                    .about("Restricts the rebuild to stop visits of a single day.")
                ).arg(Arg::new("horizon")
                    .short('n')
                    .long("horizon")
                    .takes_value(true)
                    .default_value("1")
                    .about("How many stops ahead hops may span. Used by the single-stop strategy with its default of 1.")
                    .conflicts_with("all-pairs")
                ).arg(Arg::new("all-pairs")
                    .short('a')
                    .long("all-pairs")
                    .about("Considers all ordered stop pairs within a trip instance, as the direct strategy needs.")
                ).arg(Arg::new("bin-width")
                    .short('b')
                    .long("bin-width")
                    .takes_value(true)
                    .default_value("20s")
                    .about("Width of the duration bins. The value will be parsed by the `parse_duration` crate.")
                ),
            App::new("clean")
                .about("Applies the four integrity passes to the recorded trip instances and stop visits."),
            App::new("accuracy")
                .about("Re-predicts a day's recorded arrivals with a chosen strategy and reports per-probability hit ratios.")
                .arg(Arg::new("day")
                    .short('d')
                    .long("day")
                    .takes_value(true)
                    .required(true)
                    .value_name("YYYY-MM-DD")
                    .about("The day whose stop visits are evaluated.")
                ).arg(Arg::new("strategy")
                    .short('s')
                    .long("strategy")
                    .takes_value(true)
                    .default_value("single-stop")
                    .possible_values(&["single-stop", "direct", "null"])
                    .about("The estimation strategy to evaluate.")
                ).arg(Arg::new("skip-preprocessing")
                    .long("skip-preprocessing")
                    .about("Reuses the existing travel-time tables instead of rebuilding them for the evaluation window.")
                ).arg(Arg::new("output")
                    .short('o')
                    .long("output")
                    .takes_value(true)
                    .value_name("FILE")
                    .about("Writes the probability/score table as CSV to this file instead of stdout.")
                ),
        ]
    }

    pub fn new(main: &'a Main, args: &'a ArgMatches) -> Analyser<'a> {
        Analyser { main, args }
    }

    pub fn run(&mut self, command: &str) -> FnResult<()> {
        match command {
            "calculate-travel-times" => self.run_calculate_travel_times(),
            "clean" => clean::remove_incorrect_data(self.main),
            "accuracy" => accuracy::AccuracyEvaluator::new(self.main, self.args).run(),
            _ => panic!("Invalid arguments."),
        }
    }

    fn run_calculate_travel_times(&self) -> FnResult<()> {
        let day = match self.args.value_of("day") {
            Some(text) => Some(parse_day(text)?),
            None => None,
        };
        let horizon = if self.args.is_present("all-pairs") {
            None
        } else {
            Some(self.args.value_of("horizon").unwrap().parse()?) // has a default value
        };
        let bin_width = parse_duration::parse(self.args.value_of("bin-width").unwrap())?; // has a default value
        let window = travel_times::Window::for_day(day);

        travel_times::calculate_travel_times(
            self.main,
            &window,
            horizon,
            bin_width.as_secs() as i64,
        )
    }
}

pub fn parse_day(text: &str) -> FnResult<NaiveDate> {
    match NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        Ok(day) => Ok(day),
        Err(e) => bail!("Invalid date '{}': {}", text, e),
    }
}
