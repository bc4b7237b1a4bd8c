//! Scenario configuration: the request template, checks, stage profile and
//! pacing for a run. Scenarios are built from CLI flags or loaded from a
//! JSON file, and validated before any virtual user is spawned.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::check::CheckSpec;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("stage list must not be empty")]
    EmptyStages,
    #[error("stage {0} has zero duration")]
    ZeroDuration(usize),
    #[error("invalid target url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("pacing jitter must be within 0..=1, got {0}")]
    InvalidJitter(f64),
    #[error("failed to build http client: {0}")]
    Client(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    GET,
    POST,
    PUT,
    DELETE,
    PATCH,
    HEAD,
    OPTIONS,
}

impl Method {
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            Method::GET => reqwest::Method::GET,
            Method::POST => reqwest::Method::POST,
            Method::PUT => reqwest::Method::PUT,
            Method::DELETE => reqwest::Method::DELETE,
            Method::PATCH => reqwest::Method::PATCH,
            Method::HEAD => reqwest::Method::HEAD,
            Method::OPTIONS => reqwest::Method::OPTIONS,
        }
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GET" => Ok(Method::GET),
            "POST" => Ok(Method::POST),
            "PUT" => Ok(Method::PUT),
            "DELETE" => Ok(Method::DELETE),
            "PATCH" => Ok(Method::PATCH),
            "HEAD" => Ok(Method::HEAD),
            "OPTIONS" => Ok(Method::OPTIONS),
            other => Err(format!("unsupported http method {other:?}")),
        }
    }
}

/// One concrete request, built from a [`RequestTemplate`] for a single
/// iteration. Immutable once built.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Request template shared by all virtual users. URL and header values may
/// contain `{user}` and `{iteration}` placeholders, expanded per iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTemplate {
    pub method: Method,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl RequestTemplate {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn build(&self, user: usize, iteration: u64) -> RequestSpec {
        let headers = self
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), expand(value, user, iteration)))
            .collect();

        RequestSpec {
            method: self.method.as_reqwest(),
            url: expand(&self.url, user, iteration),
            headers,
            body: self.body.clone(),
        }
    }
}

fn expand(input: &str, user: usize, iteration: u64) -> String {
    if !input.contains('{') {
        return input.to_string();
    }
    input
        .replace("{user}", &user.to_string())
        .replace("{iteration}", &iteration.to_string())
}

/// One window of the load profile. A ramp stage interpolates the virtual
/// user count linearly from the previous stage's target to its own; a
/// steady stage holds its target for the whole duration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageConfig {
    pub target: usize,
    pub duration_ms: u64,
    #[serde(default)]
    pub ramp: bool,
}

impl StageConfig {
    pub fn steady(target: usize, duration: Duration) -> Self {
        Self {
            target,
            duration_ms: duration.as_millis() as u64,
            ramp: false,
        }
    }

    pub fn ramp(target: usize, duration: Duration) -> Self {
        Self {
            target,
            duration_ms: duration.as_millis() as u64,
            ramp: true,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub name: String,
    pub request: RequestTemplate,
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
    pub stages: Vec<StageConfig>,
    /// Delay between successive iterations of one virtual user.
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
    /// Fraction of the pacing delay used as random jitter, 0..=1.
    #[serde(default)]
    pub pacing_jitter: f64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_pacing_ms() -> u64 {
    1000
}

fn default_timeout_ms() -> u64 {
    5000
}

impl ScenarioConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read scenario file: {:?}", path))?;

        let scenario: Self =
            sonic_rs::from_str(&content).context("Failed to parse scenario JSON")?;

        info!("Loaded scenario {:?} from {:?}", scenario.name, path);

        Ok(scenario)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::EmptyStages);
        }
        for (index, stage) in self.stages.iter().enumerate() {
            if stage.duration_ms == 0 {
                return Err(ConfigError::ZeroDuration(index));
            }
        }
        Url::parse(&self.request.url).map_err(|e| ConfigError::InvalidUrl {
            url: self.request.url.clone(),
            reason: e.to_string(),
        })?;
        if !(0.0..=1.0).contains(&self.pacing_jitter) {
            return Err(ConfigError::InvalidJitter(self.pacing_jitter));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
