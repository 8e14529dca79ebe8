use crate::core::{Report, Reporter};
use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

/// Writes each report as a single JSON line to stdout.
pub struct StdoutReporter {
    out: Mutex<Stdout>,
}

impl Default for StdoutReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StdoutReporter {
    pub fn new() -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
        }
    }
}

/// The line written for `report`, newline included.
pub fn render_line(report: &Report) -> Result<String> {
    let mut line = serde_json::to_string(report)?;
    line.push('\n');
    Ok(line)
}

#[async_trait]
impl Reporter for StdoutReporter {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn report(&self, report: &Report) -> Result<()> {
        let line = render_line(report)?;
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes()).await?;
        out.flush().await?;
        Ok(())
    }
}
