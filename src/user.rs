//! The virtual-user loop: build request, execute, evaluate checks, record,
//! pace, repeat. Stop signals are observed only between iterations, so an
//! in-flight request always completes and is counted exactly once.

use rand::Rng;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;
use tracing::debug;

use crate::check::{evaluate, Check};
use crate::executor::RequestExecutor;
use crate::metrics::MetricsAggregator;
use crate::scenario::RequestTemplate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VuState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Delay between successive iterations of one virtual user, optionally
/// spread by a random jitter fraction.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    delay: Duration,
    jitter: f64,
}

impl Pacing {
    pub fn new(delay: Duration, jitter: f64) -> Self {
        Self { delay, jitter }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, 0.0)
    }

    pub fn next_delay(&self) -> Duration {
        if self.jitter <= 0.0 {
            return self.delay;
        }
        let spread = self.jitter.min(1.0);
        let factor = 1.0 + rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64(self.delay.as_secs_f64() * factor)
    }
}

pub struct VirtualUser {
    id: usize,
    template: RequestTemplate,
    checks: Vec<Check>,
    pacing: Pacing,
    executor: RequestExecutor,
    metrics: MetricsAggregator,
    state: VuState,
}

impl VirtualUser {
    pub fn new(
        id: usize,
        template: RequestTemplate,
        checks: Vec<Check>,
        pacing: Pacing,
        executor: RequestExecutor,
        metrics: MetricsAggregator,
    ) -> Self {
        Self {
            id,
            template,
            checks,
            pacing,
            executor,
            metrics,
            state: VuState::Idle,
        }
    }

    pub fn state(&self) -> VuState {
        self.state
    }

    /// Runs the iteration loop until the global shutdown broadcast fires or
    /// this user is retired. Returns the number of completed iterations.
    pub async fn run(
        mut self,
        mut shutdown: broadcast::Receiver<()>,
        mut retire: watch::Receiver<bool>,
    ) -> u64 {
        self.state = VuState::Running;
        debug!(user = self.id, "virtual user started");

        let mut iterations: u64 = 0;
        loop {
            if stop_requested(&mut shutdown, &retire) {
                self.state = VuState::Stopping;
                break;
            }

            let spec = self.template.build(self.id, iterations);
            let outcome = self.executor.execute(&spec).await;
            let results = evaluate(&outcome, &self.checks);
            self.metrics.record(&outcome, &results);
            iterations += 1;

            // The iteration above is already recorded, so the pacing sleep
            // may be cut short by either stop signal.
            tokio::select! {
                _ = sleep(self.pacing.next_delay()) => {}
                _ = shutdown.recv() => {
                    self.state = VuState::Stopping;
                    break;
                }
                _ = retire.changed() => {
                    self.state = VuState::Stopping;
                    break;
                }
            }
        }

        self.state = VuState::Stopped;
        debug!(user = self.id, iterations, "virtual user stopped");
        iterations
    }
}

fn stop_requested(shutdown: &mut broadcast::Receiver<()>, retire: &watch::Receiver<bool>) -> bool {
    if *retire.borrow() {
        return true;
    }
    // Anything other than an empty channel (a signal, a lag, or a closed
    // sender) means the run is over.
    !matches!(
        shutdown.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    )
}
