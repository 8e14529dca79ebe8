//! Command-Line Interface (CLI) argument parsing.
//!
//! Arguments are parsed with `clap` and then merged, as the highest-priority
//! layer, over the configuration file and environment variables.

use clap::Parser;
use figment::{
    value::{Dict, Map, Value},
    Error, Metadata, Profile, Provider,
};
use std::path::PathBuf;

/// Reports per-service I/O rates and resource usage from kernel taskstats.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Collector endpoint reports are POSTed to.
    #[arg(long, value_name = "URL")]
    pub collector_url: Option<String>,

    /// Seconds between sampling passes.
    #[arg(long, value_name = "SECONDS")]
    pub sample_interval: Option<u64>,

    /// Seconds between process list re-scans.
    #[arg(long, value_name = "SECONDS")]
    pub refresh_interval: Option<u64>,

    /// Host name to label reports with.
    #[arg(long, value_name = "NAME")]
    pub host: Option<String>,

    /// Process names to monitor; replaces `monitor.process_names`.
    #[arg(value_name = "NAME")]
    pub names: Vec<String>,
}

/// Inserts `value` at a dotted `path`, creating intermediate dictionaries.
fn insert_path(dict: &mut Dict, path: &str, value: Value) {
    match path.split_once('.') {
        Some((head, rest)) => {
            let entry = dict
                .entry(head.to_string())
                .or_insert_with(|| Value::from(Dict::new()));
            if let Value::Dict(_, inner) = entry {
                insert_path(inner, rest, value);
            }
        }
        None => {
            dict.insert(path.to_string(), value);
        }
    }
}

impl Provider for Cli {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command-Line Arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let mut dict = Dict::new();

        if let Some(url) = &self.collector_url {
            insert_path(&mut dict, "report.collector_url", Value::from(url.clone()));
        }
        if let Some(seconds) = self.sample_interval {
            insert_path(&mut dict, "monitor.sample_interval_seconds", Value::from(seconds));
        }
        if let Some(seconds) = self.refresh_interval {
            insert_path(&mut dict, "monitor.refresh_interval_seconds", Value::from(seconds));
        }
        if let Some(host) = &self.host {
            insert_path(&mut dict, "host", Value::from(host.clone()));
        }
        if !self.names.is_empty() {
            insert_path(&mut dict, "monitor.process_names", Value::from(self.names.clone()));
        }

        let mut map = Map::new();
        map.insert(Profile::Default, dict);
        Ok(map)
    }
}
