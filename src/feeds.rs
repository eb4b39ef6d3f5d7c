use chrono::{Local, NaiveDate};
use clap::{App, Arg, ArgMatches};
use regex::Regex;
use simple_error::bail;
use std::fs;
use std::fs::{DirBuilder, File};
use std::io::prelude::*;
use std::path::Path;

use crate::{date_from_filename, read_dir_simple, FnResult, Main};

const HTTP_TIMEOUT_MILLIS: u64 = 30_000;

/// `update-feeds`: scrapes the schedule archive page for GTFS zips,
/// downloads the ones we do not have yet and files them under
/// `{dir}/schedule/{feed_start_date}.zip`, where the schedule index picks
/// them up by date.
pub struct FeedUpdater<'a> {
    main: &'a Main,
    args: &'a ArgMatches,
}

impl<'a> FeedUpdater<'a> {
    pub fn get_subcommand() -> App<'a> {
        App::new("update-feeds")
            .about("Fetches the schedule archive and imports feeds that are not present yet.")
            .arg(Arg::new("archive-url")
                .short('u')
                .long("archive-url")
                .env("SCHEDULE_ARCHIVE_URL")
                .takes_value(true)
                .required_unless("help")
                .about("The page listing downloadable GTFS zip archives.")
            ).arg(Arg::new("all")
                .short('a')
                .long("all")
                .about("Downloads every missing feed instead of stopping at the first one that is already known.")
            )
    }

    pub fn new(main: &'a Main, args: &'a ArgMatches) -> FeedUpdater<'a> {
        FeedUpdater { main, args }
    }

    pub fn run(&mut self) -> FnResult<()> {
        let schedule_dir = format!("{}/schedule", self.main.dir);
        let mut builder = DirBuilder::new();
        builder.recursive(true);
        builder.create(&schedule_dir)?; // without the schedule dir there is nowhere to import to

        let latest_known = self.latest_known_feed_date(&schedule_dir)?;
        let feed_urls = self.get_feed_urls()?;
        if self.main.verbose {
            println!("Found {} feed archives, latest known feed starts {:?}.", feed_urls.len(), latest_known);
        }

        for feed_url in feed_urls {
            let download_path = format!("{}/download.zip.part", schedule_dir);
            if let Err(e) = self.download_feed(&feed_url, &download_path) {
                eprintln!("Could not download {}: {}", feed_url, e);
                continue;
            }

            let feed_start_date = match read_feed_start_date(&download_path) {
                Ok(date) => date,
                Err(e) => {
                    eprintln!("Could not read feed info from {}: {}", feed_url, e);
                    fs::remove_file(&download_path)?;
                    continue;
                }
            };

            let target_path = format!("{}/{}.zip", schedule_dir, feed_start_date.format("%Y-%m-%d"));
            if Path::new(&target_path).exists() {
                if self.main.verbose {
                    println!("Feed starting {} is already imported.", feed_start_date);
                }
                fs::remove_file(&download_path)?;
            } else {
                fs::rename(&download_path, &target_path)?;
                println!("Imported feed starting {}.", feed_start_date);
            }

            // the archive lists newest feeds first; once we are past
            // everything new there is nothing left to do
            if !self.args.is_present("all") {
                if let Some(latest) = latest_known {
                    if feed_start_date <= latest {
                        break;
                    }
                }
            }
            if feed_start_date <= Local::today().naive_local() {
                break;
            }
        }
        Ok(())
    }

    fn latest_known_feed_date(&self, schedule_dir: &str) -> FnResult<Option<NaiveDate>> {
        let dates: Vec<NaiveDate> = read_dir_simple(schedule_dir)?
            .iter()
            .filter(|filename| filename.ends_with(".zip"))
            .filter_map(|filename| date_from_filename(filename).ok())
            .collect();
        Ok(dates.into_iter().max())
    }

    fn get_feed_urls(&self) -> FnResult<Vec<String>> {
        lazy_static! {
            static ref FIND_ZIP_URL: Regex = Regex::new(r#"https?://[^"' ]+\.zip"#).unwrap(); // can't fail because our hard-coded regex is known to be ok
        }
        let archive_url = self.args.value_of("archive-url").unwrap(); // already validated by clap
        let response = ureq::get(archive_url).timeout_connect(HTTP_TIMEOUT_MILLIS).call();
        if !response.ok() {
            bail!("Archive page returned status {}.", response.status());
        }
        let body = response.into_string()?;

        let mut urls: Vec<String> = Vec::new();
        for capture in FIND_ZIP_URL.find_iter(&body) {
            let url = String::from(capture.as_str());
            // archive pages tend to repeat each link; keep the first occurrence
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        Ok(urls)
    }

    fn download_feed(&self, url: &str, target_path: &str) -> FnResult<()> {
        if self.main.verbose {
            println!("Downloading {}…", url);
        }
        let response = ureq::get(url).timeout_connect(HTTP_TIMEOUT_MILLIS).call();
        if !response.ok() {
            bail!("Download returned status {}.", response.status());
        }
        let mut body = Vec::new();
        response.into_reader().read_to_end(&mut body)?;
        File::create(target_path)?.write_all(&body)?;
        Ok(())
    }
}

/// The date a feed becomes active, taken from `feed_info.feed_start_date`.
fn read_feed_start_date(path: &str) -> FnResult<NaiveDate> {
    let gtfs = gtfs_structures::Gtfs::new(path)?;
    match gtfs.feed_info.first().and_then(|info| info.start_date) {
        Some(date) => Ok(date),
        None => bail!("Feed has no feed_info.feed_start_date."),
    }
}
