//! Generic worker loop: run one unit, check the stop flag, repeat.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::status::{ServiceRegistry, ServiceState};

use super::backoff::ExponentialBackoff;
use super::shutdown::{StopSignal, WorkerPhase};

/// What a single unit of work accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Did this many items of work; run the next unit right away.
    Worked(usize),
    /// Nothing to do; wait one poll interval.
    Idle,
}

/// One role's unit of work (a claimed batch, a sync pass, a supervisor sweep).
///
/// A unit runs to completion once started. It is never cancelled mid-way.
#[async_trait]
pub trait WorkUnit: Send {
    fn name(&self) -> &str;

    async fn run_once(&mut self) -> Result<UnitOutcome>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub units: u64,
    pub items: u64,
}

pub struct Worker<U: WorkUnit> {
    unit: U,
    stop: StopSignal,
    poll_interval: Duration,
    backoff: ExponentialBackoff,
    status: Option<ServiceRegistry>,
    phase: WorkerPhase,
}

impl<U: WorkUnit> Worker<U> {
    pub fn new(unit: U, stop: StopSignal, poll_interval: Duration) -> Self {
        Self {
            unit,
            stop,
            poll_interval,
            backoff: ExponentialBackoff::new(poll_interval.max(Duration::from_millis(50)), Duration::from_secs(60)),
            status: None,
            phase: WorkerPhase::Running,
        }
    }

    /// Record state and heartbeats in the service status file.
    pub fn with_status(mut self, registry: ServiceRegistry) -> Self {
        self.status = Some(registry);
        self
    }

    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    pub fn unit(&self) -> &U {
        &self.unit
    }

    fn report(&self, state: ServiceState) {
        if let Some(reg) = &self.status {
            if let Err(e) = reg.set_state(self.unit.name(), state) {
                log::warn!("⚠️  Could not record {:?} for {}: {}", state, self.unit.name(), e);
            }
        }
    }

    fn heartbeat(&self) {
        if let Some(reg) = &self.status {
            if let Err(e) = reg.heartbeat(self.unit.name()) {
                log::warn!("⚠️  Heartbeat failed for {}: {}", self.unit.name(), e);
            }
        }
    }

    /// Run until a stop is requested or a fatal error occurs.
    ///
    /// The stop flag is only consulted between units, so whatever unit is in
    /// flight when the signal arrives finishes and commits first.
    pub async fn run(mut self) -> Result<WorkerExit> {
        let name = self.unit.name().to_string();
        if let Some(reg) = &self.status {
            if let Err(e) = reg.register(&name) {
                log::warn!("⚠️  Could not register {}: {}", name, e);
            }
        }
        log::info!("🚀 Worker {} running (poll every {:?})", name, self.poll_interval);

        let mut exit = WorkerExit { units: 0, items: 0 };

        while !self.stop.is_stopping() {
            let outcome = self.unit.run_once().await;
            exit.units += 1;
            self.heartbeat();

            match outcome {
                Ok(UnitOutcome::Worked(n)) => {
                    exit.items += n as u64;
                    self.backoff.reset();
                }
                Ok(UnitOutcome::Idle) => {
                    self.backoff.reset();
                    self.stop.sleep(self.poll_interval).await;
                }
                Err(e) if e.is_fatal() => {
                    log::error!("❌ Worker {} stopping on fatal error: {}", name, e);
                    self.phase = WorkerPhase::Stopped;
                    self.report(ServiceState::Failed);
                    return Err(e);
                }
                Err(e) if e.is_transient() => {
                    log::warn!("⚠️  {}: {}", name, e);
                    let delay = self.backoff.next_delay();
                    self.stop.sleep(delay).await;
                }
                Err(e) => {
                    log::error!("❌ {}: {}", name, e);
                    self.stop.sleep(self.poll_interval).await;
                }
            }
        }

        self.phase = WorkerPhase::Stopping;
        self.report(ServiceState::Stopping);
        log::info!("🛑 Worker {} stopping after {} units", name, exit.units);

        self.phase = WorkerPhase::Stopped;
        self.report(ServiceState::Stopped);
        log::info!("✅ Worker {} stopped cleanly", name);
        Ok(exit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CoordError, StateKind};
    use crate::worker::ShutdownController;
    use std::collections::VecDeque;
    use std::path::PathBuf;

    struct Scripted {
        script: VecDeque<Result<UnitOutcome>>,
        stop_after: Option<ShutdownController>,
        runs: usize,
    }

    #[async_trait]
    impl WorkUnit for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn run_once(&mut self) -> Result<UnitOutcome> {
            self.runs += 1;
            let next = self.script.pop_front();
            if self.script.is_empty() {
                if let Some(c) = &self.stop_after {
                    c.trigger();
                }
            }
            next.unwrap_or(Ok(UnitOutcome::Idle))
        }
    }

    #[tokio::test]
    async fn test_runs_until_stop_then_reports_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::new(dir.path().join("status.json"), Duration::from_secs(2));
        let controller = ShutdownController::new();
        let unit = Scripted {
            script: VecDeque::from(vec![Ok(UnitOutcome::Worked(2)), Ok(UnitOutcome::Worked(3))]),
            stop_after: Some(controller.clone()),
            runs: 0,
        };

        let exit = Worker::new(unit, controller.signal(), Duration::from_millis(10))
            .with_status(registry.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(exit.units, 2);
        assert_eq!(exit.items, 5);
        assert_eq!(registry.all().unwrap()["scripted"].state, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_fatal_error_ends_worker() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::new(dir.path().join("status.json"), Duration::from_secs(2));
        let controller = ShutdownController::new();
        let unit = Scripted {
            script: VecDeque::from(vec![Err(CoordError::CorruptState {
                kind: StateKind::Manifest,
                path: PathBuf::from("m.json"),
                reason: "bad".into(),
            })]),
            stop_after: None,
            runs: 0,
        };

        let res = Worker::new(unit, controller.signal(), Duration::from_millis(10))
            .with_status(registry.clone())
            .run()
            .await;

        assert!(matches!(res, Err(CoordError::CorruptState { .. })));
        assert_eq!(registry.all().unwrap()["scripted"].state, ServiceState::Failed);
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let controller = ShutdownController::new();
        let unit = Scripted {
            script: VecDeque::from(vec![
                Err(CoordError::LockTimeout {
                    path: PathBuf::from("m.json"),
                    waited: Duration::from_millis(1),
                }),
                Ok(UnitOutcome::Worked(1)),
            ]),
            stop_after: Some(controller.clone()),
            runs: 0,
        };

        let exit = Worker::new(unit, controller.signal(), Duration::from_millis(10))
            .run()
            .await
            .unwrap();
        assert_eq!(exit.units, 2);
        assert_eq!(exit.items, 1);
    }

    #[tokio::test]
    async fn test_corrupt_side_file_does_not_end_worker() {
        let controller = ShutdownController::new();
        let unit = Scripted {
            script: VecDeque::from(vec![
                Err(CoordError::CorruptState {
                    kind: StateKind::Ledger,
                    path: PathBuf::from("results.jsonl"),
                    reason: "line 3: EOF while parsing".into(),
                }),
                Err(CoordError::CorruptState {
                    kind: StateKind::Status,
                    path: PathBuf::from("pipeline_status.json"),
                    reason: "expected value".into(),
                }),
                Ok(UnitOutcome::Worked(4)),
            ]),
            stop_after: Some(controller.clone()),
            runs: 0,
        };

        let exit = Worker::new(unit, controller.signal(), Duration::from_millis(10))
            .run()
            .await
            .unwrap();
        assert_eq!(exit.units, 3);
        assert_eq!(exit.items, 4);
    }

    #[tokio::test]
    async fn test_stop_before_start_runs_nothing() {
        let controller = ShutdownController::new();
        controller.trigger();
        let unit = Scripted {
            script: VecDeque::new(),
            stop_after: None,
            runs: 0,
        };
        let exit = Worker::new(unit, controller.signal(), Duration::from_millis(10))
            .run()
            .await
            .unwrap();
        assert_eq!(exit.units, 0);
    }
}
