//! Configuration management for procmon
//!
//! This module defines the main `Config` struct and its sections. It uses the
//! `figment` crate to layer built-in defaults, a `procmon.toml` file,
//! `PROCMON_`-prefixed environment variables and command-line arguments.

use crate::cli::Cli;
use crate::monitor::DurationAveraging;
use anyhow::{bail, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Path tried when no `--config` is given. A missing file is not an error.
pub const DEFAULT_CONFIG_PATH: &str = "procmon.toml";

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    /// The logging level (an `EnvFilter` directive); `RUST_LOG` wins.
    pub log_level: String,
    /// Host name reports are labelled with. Defaults to the system host name.
    pub host: Option<String>,
    pub monitor: MonitorConfig,
    pub taskstats: TaskstatsConfig,
    pub report: ReportConfig,
    pub metrics: MetricsConfig,
}

/// How processes are discovered.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ListerKind {
    /// `ps -ef`, matching against the whole listing line.
    #[default]
    Ps,
    /// `/proc/<pid>/cmdline`, matching against the command line only.
    Procfs,
}

/// Configuration for process discovery and sampling.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Substrings identifying the monitored services, in priority order.
    pub process_names: Vec<String>,
    /// Seconds between re-scans of the process list.
    pub refresh_interval_seconds: u64,
    /// Seconds between sampling passes (and reports).
    pub sample_interval_seconds: u64,
    /// Reports buffered for the reporter before new ones are dropped.
    pub queue_capacity: usize,
    /// How per-process intervals are combined into one per name.
    pub duration_averaging: DurationAveraging,
    pub lister: ListerKind,
    /// Mount point of procfs.
    pub proc_root: PathBuf,
    /// Bytes per RSS page. Defaults to the system page size.
    pub page_size_bytes: Option<u64>,
}

/// Configuration for the netlink accounting session.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TaskstatsConfig {
    /// How long to wait for a kernel reply before treating a task as having
    /// no data this pass.
    pub receive_timeout_ms: u64,
}

/// Wire format of the collector request body.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReportEncoding {
    /// `application/json` body.
    #[default]
    Json,
    /// `application/x-www-form-urlencoded` body with the JSON in field `json`.
    Form,
}

/// Configuration for report delivery.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ReportConfig {
    /// Collector endpoint. Reports are printed to stdout when unset.
    pub collector_url: Option<String>,
    pub timeout_ms: u64,
    pub encoding: ReportEncoding,
}

/// Configuration for the agent's own metrics.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MetricsConfig {
    /// Expose a Prometheus `/metrics` endpoint.
    pub enabled: bool,
    pub listen_address: SocketAddr,
    /// Also publish the agent's own CPU and memory usage.
    pub system_metrics_enabled: bool,
}

impl Config {
    /// Loads the configuration, layering defaults, the TOML file named by
    /// `--config` (or `procmon.toml`), environment variables such as
    /// `PROCMON_MONITOR__SAMPLE_INTERVAL_SECONDS` and finally `cli`.
    pub fn load(cli: &Cli) -> Result<Self> {
        let path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("PROCMON_").split("__"))
            .merge(cli.clone())
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the monitor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.monitor.process_names.is_empty() {
            bail!("no process names configured; set monitor.process_names or pass names as arguments");
        }
        if self.monitor.process_names.iter().any(|n| n.is_empty()) {
            bail!("monitor.process_names must not contain empty names");
        }
        if self.monitor.sample_interval_seconds == 0 || self.monitor.refresh_interval_seconds == 0 {
            bail!("monitor intervals must be at least one second");
        }
        if self.monitor.queue_capacity == 0 {
            bail!("monitor.queue_capacity must be at least 1");
        }
        if self.monitor.page_size_bytes == Some(0) {
            bail!("monitor.page_size_bytes must be positive");
        }
        Ok(())
    }
}

impl MonitorConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_seconds)
    }
}

impl TaskstatsConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

impl ReportConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            host: None,
            monitor: MonitorConfig {
                process_names: vec![],
                refresh_interval_seconds: 600,
                sample_interval_seconds: 10,
                queue_capacity: 1000,
                duration_averaging: DurationAveraging::default(),
                lister: ListerKind::default(),
                proc_root: PathBuf::from("/proc"),
                page_size_bytes: None,
            },
            taskstats: TaskstatsConfig {
                receive_timeout_ms: 1000,
            },
            report: ReportConfig {
                collector_url: None,
                timeout_ms: 5000,
                encoding: ReportEncoding::default(),
            },
            metrics: MetricsConfig {
                enabled: false,
                listen_address: SocketAddr::from(([127, 0, 0, 1], 9102)),
                system_metrics_enabled: true,
            },
        }
    }
}
