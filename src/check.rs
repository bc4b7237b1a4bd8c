//! Named boolean assertions evaluated against a completed [`Outcome`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::executor::Outcome;

/// A named predicate over a completed request outcome.
#[derive(Clone)]
pub struct Check {
    name: String,
    predicate: Arc<dyn Fn(&Outcome) -> bool + Send + Sync>,
}

impl Check {
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&Outcome) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Check").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
}

/// Runs every check against `outcome`, in declaration order. A predicate
/// that panics is recorded as a failed check rather than aborting the run.
pub fn evaluate(outcome: &Outcome, checks: &[Check]) -> Vec<CheckResult> {
    checks
        .iter()
        .map(|check| {
            let passed = panic::catch_unwind(AssertUnwindSafe(|| (check.predicate)(outcome)))
                .unwrap_or(false);
            CheckResult {
                name: check.name.clone(),
                passed,
            }
        })
        .collect()
}

/// Declarative check forms accepted in scenario files, compiled to
/// predicates before the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CheckSpec {
    StatusIs(u16),
    StatusSuccess,
    MaxLatencyMs(u64),
    BodyContains(String),
}

impl CheckSpec {
    pub fn compile(&self) -> Check {
        match self {
            CheckSpec::StatusIs(code) => {
                let code = *code;
                Check::new(format!("status is {code}"), move |outcome| {
                    outcome.status == Some(code)
                })
            }
            CheckSpec::StatusSuccess => Check::new("status is 2xx", |outcome| {
                outcome.status.is_some_and(|s| (200..300).contains(&s))
            }),
            CheckSpec::MaxLatencyMs(ms) => {
                let limit = Duration::from_millis(*ms);
                Check::new(format!("latency under {ms}ms"), move |outcome| {
                    outcome.latency <= limit
                })
            }
            CheckSpec::BodyContains(needle) => {
                let needle = needle.clone();
                Check::new(format!("body contains {needle:?}"), move |outcome| {
                    outcome
                        .body
                        .as_deref()
                        .is_some_and(|body| body.contains(&needle))
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn outcome(status: Option<u16>, latency_ms: u64, body: Option<&str>) -> Outcome {
        Outcome {
            status,
            latency: Duration::from_millis(latency_ms),
            error: if status.is_none() {
                Some("connection refused or host unreachable".to_string())
            } else {
                None
            },
            headers: HashMap::new(),
            body: body.map(|b| b.to_string()),
        }
    }

    #[test]
    fn results_follow_declaration_order() {
        let checks = vec![
            Check::new("b", |_| true),
            Check::new("a", |_| false),
            Check::new("c", |_| true),
        ];
        let results = evaluate(&outcome(Some(200), 10, None), &checks);
        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert_eq!(
            results.iter().map(|r| r.passed).collect::<Vec<_>>(),
            vec![true, false, true]
        );
    }

    #[test]
    fn evaluation_is_idempotent() {
        let checks = vec![
            CheckSpec::StatusIs(200).compile(),
            CheckSpec::MaxLatencyMs(50).compile(),
        ];
        let outcome = outcome(Some(200), 10, Some("ok"));
        let first = evaluate(&outcome, &checks);
        let second = evaluate(&outcome, &checks);
        assert_eq!(first, second);
    }

    #[test]
    fn panicking_predicate_is_a_failed_check() {
        let checks = vec![
            Check::new("explodes", |_| panic!("bad assertion")),
            Check::new("still runs", |_| true),
        ];
        let results = evaluate(&outcome(Some(200), 10, None), &checks);
        assert!(!results[0].passed);
        assert!(results[1].passed);
    }

    #[test]
    fn status_is_matches_exact_code() {
        let check = CheckSpec::StatusIs(200).compile();
        assert_eq!(check.name(), "status is 200");
        assert!(evaluate(&outcome(Some(200), 5, None), &[check.clone()])[0].passed);
        assert!(!evaluate(&outcome(Some(503), 5, None), &[check.clone()])[0].passed);
        assert!(!evaluate(&outcome(None, 5, None), &[check])[0].passed);
    }

    #[test]
    fn status_success_accepts_any_2xx() {
        let check = CheckSpec::StatusSuccess.compile();
        assert!(evaluate(&outcome(Some(204), 5, None), &[check.clone()])[0].passed);
        assert!(!evaluate(&outcome(Some(301), 5, None), &[check])[0].passed);
    }

    #[test]
    fn latency_and_body_checks() {
        let latency = CheckSpec::MaxLatencyMs(20).compile();
        assert!(evaluate(&outcome(Some(200), 20, None), &[latency.clone()])[0].passed);
        assert!(!evaluate(&outcome(Some(200), 21, None), &[latency])[0].passed);

        let body = CheckSpec::BodyContains("users".to_string()).compile();
        assert!(evaluate(&outcome(Some(200), 5, Some("{\"users\":[]}")), &[body.clone()])[0].passed);
        assert!(!evaluate(&outcome(Some(200), 5, None), &[body])[0].passed);
    }
}
