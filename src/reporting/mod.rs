//! Report delivery.
//!
//! - **`HttpReporter`**: POSTs each report to the collector.
//! - **`StdoutReporter`**: prints each report as one JSON line, used when no
//!   collector is configured.

pub mod http;
pub mod stdout;

pub use http::HttpReporter;
pub use stdout::StdoutReporter;

use crate::config::ReportConfig;
use crate::core::Reporter;
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// Builds the reporter the configuration asks for.
pub fn from_config(config: &ReportConfig) -> Result<Arc<dyn Reporter>> {
    match &config.collector_url {
        Some(url) => {
            info!(url = %url, encoding = ?config.encoding, "Reporting to collector.");
            Ok(Arc::new(HttpReporter::new(url.clone(), config.encoding, config.timeout())?))
        }
        None => {
            info!("No collector configured; reporting to stdout.");
            Ok(Arc::new(StdoutReporter::new()))
        }
    }
}
