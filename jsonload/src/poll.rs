use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use tokio::sync::watch;
use tracing::{debug, error, trace};

use crate::error::PipelineError;
use crate::retry::PauseSignal;

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Ran,
    /// The pause signal was held, nothing was done.
    Paused,
    /// The previous run for this key was still in flight.
    Busy,
}

/// One persistent loop per (stage, key): run the work, sleep, repeat.
///
/// At most one run of the work is in flight per loop, including its clones.
#[derive(Clone)]
pub struct PollLoop {
    stage: &'static str,
    key: String,
    interval: Duration,
    in_flight: Arc<AtomicBool>,
    pause: Option<PauseSignal>,
    liveness: Option<HealthHandle>,
    stop: Option<watch::Receiver<bool>>,
}

struct FlightGuard(Arc<AtomicBool>);

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl PollLoop {
    pub fn new(stage: &'static str, key: impl Into<String>, interval: Duration) -> Self {
        Self {
            stage,
            key: key.into(),
            interval,
            in_flight: Arc::new(AtomicBool::new(false)),
            pause: None,
            liveness: None,
            stop: None,
        }
    }

    /// Skip ticks while the signal is held.
    pub fn with_pause(mut self, pause: PauseSignal) -> Self {
        self.pause = Some(pause);
        self
    }

    /// Report healthy on every tick, including skipped ones.
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Return from `run` at the next tick boundary once the flag turns true.
    /// Work already in flight finishes first.
    pub fn with_stop(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    fn stopping(&self) -> bool {
        self.stop.as_ref().is_some_and(|stop| *stop.borrow())
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn run_once<F, Fut>(&self, work: F) -> Result<Tick, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), PipelineError>>,
    {
        if self.pause.as_ref().is_some_and(PauseSignal::is_paused) {
            trace!(stage = self.stage, key = %self.key, "paused");
            return Ok(Tick::Paused);
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!(stage = self.stage, key = %self.key, "previous run still in flight");
            return Ok(Tick::Busy);
        }
        let _guard = FlightGuard(self.in_flight.clone());

        work().await?;
        Ok(Tick::Ran)
    }

    /// Tick until stopped. Non-fatal errors are logged and the loop goes on;
    /// a fatal error ends the loop and is returned.
    pub async fn run<F, Fut>(mut self, mut work: F) -> Result<(), PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), PipelineError>>,
    {
        loop {
            if self.stopping() {
                debug!(stage = self.stage, key = %self.key, "stopped");
                return Ok(());
            }
            if let Some(liveness) = &self.liveness {
                liveness.report_healthy();
            }
            match self.run_once(&mut work).await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!(stage = self.stage, key = %self.key, error = %e, "fatal error, stopping");
                    return Err(e);
                }
                Err(e) => error!(stage = self.stage, key = %self.key, error = %e, "tick failed"),
            }
            match self.stop.as_mut() {
                Some(stop) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.interval) => {},
                        Ok(()) = stop.changed() => {},
                    }
                }
                None => tokio::time::sleep(self.interval).await,
            }
        }
    }
}
