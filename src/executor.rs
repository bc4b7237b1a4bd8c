//! Issues one logical request and reports what happened. Transport failures
//! are data, not control flow: `execute` always returns an [`Outcome`].

use reqwest::Client;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::scenario::RequestSpec;

/// The result of one executed request. Created once per invocation and
/// read-only afterward.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub status: Option<u16>,
    pub latency: Duration,
    pub error: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl Outcome {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Clone)]
pub struct RequestExecutor {
    client: Client,
}

impl RequestExecutor {
    /// Builds an executor whose requests are bounded by `timeout`. The
    /// underlying client is shared by every clone, so virtual users reuse
    /// one connection pool.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub async fn execute(&self, spec: &RequestSpec) -> Outcome {
        let start = Instant::now();

        let mut request = self.client.request(spec.method.clone(), spec.url.as_str());
        for (name, value) in &spec.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &spec.body {
            request = request.body(body.clone());
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let headers = response
                    .headers()
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.to_string(),
                            String::from_utf8_lossy(value.as_bytes()).into_owned(),
                        )
                    })
                    .collect();

                // Latency covers the full response, body included.
                match response.text().await {
                    Ok(body) => Outcome {
                        status: Some(status),
                        latency: start.elapsed(),
                        error: None,
                        headers,
                        body: Some(body),
                    },
                    Err(e) => Outcome {
                        status: Some(status),
                        latency: start.elapsed(),
                        error: Some(classify(&e)),
                        headers,
                        body: None,
                    },
                }
            }
            Err(e) => Outcome {
                status: None,
                latency: start.elapsed(),
                error: Some(classify(&e)),
                headers: HashMap::new(),
                body: None,
            },
        }
    }
}

fn classify(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "request timed out".to_string()
    } else if error.is_connect() {
        "connection refused or host unreachable".to_string()
    } else {
        error.to_string()
    }
}
