use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use http_loadgen::check::CheckSpec;
use http_loadgen::scenario::{Method, RequestTemplate, ScenarioConfig, StageConfig};
use http_loadgen::scheduler::Scheduler;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "http-loadgen")]
#[command(about = "HTTP load generation engine", long_about = None)]
struct Cli {
    /// Scenario JSON file; when set, the request/stage flags below are ignored
    #[arg(long, env = "SCENARIO_FILE")]
    scenario: Option<PathBuf>,

    /// Target URL
    #[arg(long, env = "TARGET_URL", default_value = "http://localhost:8080/api/users")]
    url: String,

    /// HTTP method
    #[arg(long, env = "HTTP_METHOD", default_value = "GET")]
    method: String,

    /// Extra request header, repeatable ("Name: value")
    #[arg(long = "header", value_name = "NAME:VALUE")]
    headers: Vec<String>,

    /// Authorization header value (e.g. "Basic <encoded credentials>")
    #[arg(long, env = "AUTH_HEADER")]
    auth: Option<String>,

    /// Expected status code for the default check
    #[arg(long, env = "EXPECT_STATUS", default_value = "200")]
    expect_status: u16,

    /// Target number of virtual users
    #[arg(long, env = "NUM_VUS", default_value = "50")]
    vus: usize,

    /// Duration to ramp up to the target in seconds
    #[arg(long, env = "RAMP_DURATION", default_value = "0")]
    ramp_duration: u64,

    /// Duration to hold at the target in seconds
    #[arg(long, env = "HOLD_DURATION", default_value = "30")]
    hold_duration: u64,

    /// Duration to ramp down in seconds
    #[arg(long, env = "RAMP_DOWN_DURATION", default_value = "0")]
    ramp_down_duration: u64,

    /// Delay between iterations of one virtual user in milliseconds
    #[arg(long, env = "PACING_MS", default_value = "1000")]
    pacing_ms: u64,

    /// Fraction of the pacing delay used as random jitter (0..=1)
    #[arg(long, env = "PACING_JITTER", default_value = "0.0")]
    pacing_jitter: f64,

    /// Request timeout in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "5000")]
    timeout_ms: u64,

    /// Write the run summary to this file as JSON
    #[arg(long, env = "SUMMARY_FILE")]
    summary_file: Option<PathBuf>,
}

impl Cli {
    fn into_scenario(self) -> Result<ScenarioConfig> {
        if let Some(path) = &self.scenario {
            return ScenarioConfig::load_from_file(path);
        }

        let mut headers = HashMap::new();
        if let Some(auth) = &self.auth {
            headers.insert("Authorization".to_string(), auth.clone());
        }
        for raw in &self.headers {
            let (name, value) = raw
                .split_once(':')
                .context(format!("invalid header {raw:?}, expected NAME:VALUE"))?;
            headers.insert(name.trim().to_string(), value.trim().to_string());
        }

        let method: Method = self.method.parse().map_err(anyhow::Error::msg)?;

        let mut stages = Vec::new();
        if self.ramp_duration > 0 {
            stages.push(StageConfig::ramp(
                self.vus,
                Duration::from_secs(self.ramp_duration),
            ));
        }
        if self.hold_duration > 0 {
            stages.push(StageConfig::steady(
                self.vus,
                Duration::from_secs(self.hold_duration),
            ));
        }
        if self.ramp_down_duration > 0 {
            stages.push(StageConfig::ramp(
                0,
                Duration::from_secs(self.ramp_down_duration),
            ));
        }

        Ok(ScenarioConfig {
            name: "cli".to_string(),
            request: RequestTemplate {
                method,
                url: self.url,
                headers,
                body: None,
            },
            checks: vec![CheckSpec::StatusIs(self.expect_status)],
            stages,
            pacing_ms: self.pacing_ms,
            pacing_jitter: self.pacing_jitter,
            timeout_ms: self.timeout_ms,
        })
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let summary_file = cli.summary_file.clone();
    let scenario = cli.into_scenario()?;

    info!("════════════════════════════════════════════════════════════");
    info!("                HTTP LOAD GENERATION");
    info!("════════════════════════════════════════════════════════════");
    info!("Scenario: {}", scenario.name);
    info!(
        "Target: {:?} {}",
        scenario.request.method, scenario.request.url
    );
    for (index, stage) in scenario.stages.iter().enumerate() {
        info!(
            "Stage {}: {} to {} virtual users over {}ms",
            index + 1,
            if stage.ramp { "ramp" } else { "hold" },
            stage.target,
            stage.duration_ms
        );
    }
    info!(
        "Pacing: {}ms (jitter {:.0}%)",
        scenario.pacing_ms,
        scenario.pacing_jitter * 100.0
    );
    info!("Request timeout: {}ms", scenario.timeout_ms);
    info!("════════════════════════════════════════════════════════════");

    let scheduler = Scheduler::new(scenario)?;

    let handle = scheduler.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping run");
            handle.stop();
        }
    });

    let summary = scheduler.run().await;
    summary.log();

    if let Some(path) = summary_file {
        let json =
            sonic_rs::to_string_pretty(&summary).context("Failed to serialize run summary")?;
        std::fs::write(&path, json).context(format!("Failed to write summary file: {:?}", path))?;
        info!("Summary written to {:?}", path);
    }

    Ok(())
}
