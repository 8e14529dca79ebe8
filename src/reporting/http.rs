//! A reporter that POSTs reports to an HTTP collector.

use crate::config::ReportEncoding;
use crate::core::{Report, Reporter};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, instrument};

/// Name of the form field carrying the JSON document in `Form` encoding.
pub const FORM_FIELD: &str = "json";

pub struct HttpReporter {
    client: reqwest::Client,
    url: String,
    encoding: ReportEncoding,
}

impl HttpReporter {
    pub fn new(url: String, encoding: ReportEncoding, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url,
            encoding,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Reporter for HttpReporter {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip(self, report), fields(url = %self.url, services = report.list.len()))]
    async fn report(&self, report: &Report) -> Result<()> {
        let request = self.client.post(&self.url);
        let request = match self.encoding {
            ReportEncoding::Json => request.json(report),
            ReportEncoding::Form => {
                let payload = serde_json::to_string(report)?;
                request.form(&[(FORM_FIELD, payload)])
            }
        };

        let response = request.send().await.context("HTTP request to collector failed")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("collector rejected report: status {}, body: {}", status, text);
        }
        debug!(%status, "Collector accepted report.");
        Ok(())
    }
}
