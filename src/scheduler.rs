//! Drives the population of virtual users through the configured stage
//! profile, then stops every user and folds their iteration counts into
//! the final summary.

use futures_util::future::join_all;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::check::{Check, CheckSpec};
use crate::executor::RequestExecutor;
use crate::metrics::{MetricsAggregator, RunSummary};
use crate::scenario::{ConfigError, ScenarioConfig};
use crate::user::{Pacing, VirtualUser};

const TICK: Duration = Duration::from_millis(100);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);
const STOP_GRACE: Duration = Duration::from_secs(30);

/// Cloneable handle that requests a graceful stop of the whole run.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(());
    }
}

struct Member {
    retire: watch::Sender<bool>,
    handle: JoinHandle<u64>,
}

pub struct Scheduler {
    scenario: ScenarioConfig,
    checks: Vec<Check>,
    pacing: Pacing,
    executor: RequestExecutor,
    metrics: MetricsAggregator,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    /// Validates the scenario and prepares the shared executor and metrics.
    /// No virtual user is spawned until [`Scheduler::run`].
    pub fn new(scenario: ScenarioConfig) -> Result<Self, ConfigError> {
        scenario.validate()?;

        let executor = RequestExecutor::new(scenario.timeout())
            .map_err(|e| ConfigError::Client(e.to_string()))?;
        let checks: Vec<Check> = scenario.checks.iter().map(CheckSpec::compile).collect();
        let pacing = Pacing::new(
            Duration::from_millis(scenario.pacing_ms),
            scenario.pacing_jitter,
        );
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            scenario,
            checks,
            pacing,
            executor,
            metrics: MetricsAggregator::new(),
            shutdown_tx,
        })
    }

    pub fn metrics(&self) -> MetricsAggregator {
        self.metrics.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Runs every stage to completion (or until the shutdown handle fires),
    /// then signals all virtual users, waits for them to stop, and returns
    /// the frozen summary.
    pub async fn run(self) -> RunSummary {
        let Scheduler {
            scenario,
            checks,
            pacing,
            executor,
            metrics,
            shutdown_tx,
        } = self;

        let mut stop_rx = shutdown_tx.subscribe();
        let mut live: Vec<Member> = Vec::new();
        let mut retired: Vec<JoinHandle<u64>> = Vec::new();
        let mut spawned: usize = 0;
        let mut previous: usize = 0;
        let run_start = Instant::now();
        let mut last_progress = Instant::now();

        info!(
            scenario = %scenario.name,
            stages = scenario.stages.len(),
            "starting run"
        );

        'stages: for (index, stage) in scenario.stages.iter().enumerate() {
            let stage_start = Instant::now();
            info!(
                stage = index + 1,
                target = stage.target,
                duration_ms = stage.duration_ms,
                ramp = stage.ramp,
                "entering stage"
            );

            loop {
                let elapsed = stage_start.elapsed();
                let done = elapsed >= stage.duration();
                // Snap to the stage target at the boundary so endpoint
                // counts are met regardless of tick cadence.
                let target = if done || !stage.ramp {
                    stage.target
                } else {
                    interpolated_target(previous, stage.target, elapsed, stage.duration())
                };

                while live.len() < target {
                    let (retire_tx, retire_rx) = watch::channel(false);
                    let user = VirtualUser::new(
                        spawned,
                        scenario.request.clone(),
                        checks.clone(),
                        pacing,
                        executor.clone(),
                        metrics.clone(),
                    );
                    let handle = tokio::spawn(user.run(shutdown_tx.subscribe(), retire_rx));
                    live.push(Member {
                        retire: retire_tx,
                        handle,
                    });
                    spawned += 1;
                }
                // Retire newest first; long-lived users stay across a ramp-down.
                while live.len() > target {
                    if let Some(member) = live.pop() {
                        let _ = member.retire.send(true);
                        retired.push(member.handle);
                    }
                }

                if done {
                    break;
                }

                if last_progress.elapsed() >= PROGRESS_INTERVAL {
                    let snapshot = metrics.snapshot();
                    info!(
                        stage = index + 1,
                        active = live.len(),
                        spawned,
                        requests = snapshot.total_requests,
                        errors = snapshot.error_count,
                        "progress"
                    );
                    last_progress = Instant::now();
                }

                tokio::select! {
                    _ = sleep(TICK) => {}
                    _ = stop_rx.recv() => {
                        info!("stop signal received");
                        break 'stages;
                    }
                }
            }

            previous = stage.target;
        }

        let _ = shutdown_tx.send(());
        retired.extend(live.drain(..).map(|member| member.handle));
        info!(
            users = retired.len(),
            elapsed_s = run_start.elapsed().as_secs(),
            "run window complete, waiting for virtual users to stop"
        );

        let mut iterations: u64 = 0;
        let aborts: Vec<_> = retired.iter().map(|handle| handle.abort_handle()).collect();
        match timeout(STOP_GRACE, join_all(retired)).await {
            Ok(results) => {
                for result in results {
                    match result {
                        Ok(count) => iterations += count,
                        Err(e) => warn!("virtual user task failed: {e}"),
                    }
                }
            }
            Err(_) => {
                warn!("grace period elapsed before all virtual users stopped, aborting the rest");
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        metrics.snapshot().with_iterations(iterations)
    }
}

/// Instantaneous virtual-user target for a ramp stage, `elapsed` into a
/// window that moves linearly from `from` to `to`. Floored, so the actual
/// population never exceeds the interpolated line.
pub fn interpolated_target(from: usize, to: usize, elapsed: Duration, total: Duration) -> usize {
    if total.is_zero() {
        return to;
    }
    let fraction = (elapsed.as_secs_f64() / total.as_secs_f64()).clamp(0.0, 1.0);
    (from as f64 + (to as f64 - from as f64) * fraction).floor() as usize
}
