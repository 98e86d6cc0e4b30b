//! One task per plant. The task owns its `EvaluationEngine` outright, so
//! evaluations, manual waterings and signals for a plant are processed one
//! at a time in arrival order while other plants run independently.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capability::{ConfigProvider, NotificationSink, PumpCapability, SensorCapability, Signal};
use crate::clock::Clock;
use crate::db::Db;
use crate::engine::{EvaluationEngine, EvaluationResult, PlantDiagnostics, Status};
use crate::state::SharedState;

/// Queue depth per plant. Timer ticks and signals beyond this are dropped.
const QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Timer,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Timer => "timer",
            Trigger::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub result: EvaluationResult,
    pub status: Status,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

pub enum PlantCommand {
    Signal(Signal),
    Evaluate {
        trigger: Trigger,
        reply: Option<oneshot::Sender<EvaluationReport>>,
    },
    WaterNow {
        reply: oneshot::Sender<EvaluationReport>,
    },
    Diagnostics {
        reply: oneshot::Sender<PlantDiagnostics>,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("plant worker '{0}' is not running")]
pub struct WorkerGone(pub String);

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PlantHandle {
    plant_id: Arc<str>,
    tx: mpsc::Sender<PlantCommand>,
}

impl PlantHandle {
    pub fn plant_id(&self) -> &str {
        &self.plant_id
    }

    /// Fire-and-forget; never blocks the MQTT loop.
    pub fn signal(&self, signal: Signal) {
        self.offer(PlantCommand::Signal(signal));
    }

    /// Fire-and-forget timer evaluation.
    pub fn tick(&self) {
        self.offer(PlantCommand::Evaluate {
            trigger: Trigger::Timer,
            reply: None,
        });
    }

    /// Evaluate Now: waits for its turn and for the result.
    pub async fn evaluate(&self) -> Result<EvaluationReport, WorkerGone> {
        self.request(|reply| PlantCommand::Evaluate {
            trigger: Trigger::Manual,
            reply: Some(reply),
        })
        .await
    }

    pub async fn water_now(&self) -> Result<EvaluationReport, WorkerGone> {
        self.request(|reply| PlantCommand::WaterNow { reply }).await
    }

    pub async fn diagnostics(&self) -> Result<PlantDiagnostics, WorkerGone> {
        self.request(|reply| PlantCommand::Diagnostics { reply })
            .await
    }

    fn offer(&self, cmd: PlantCommand) {
        match self.tx.try_send(cmd) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(plant = %self.plant_id, "worker: queue full, dropping command");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!(plant = %self.plant_id, "worker: not running, dropping command");
            }
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> PlantCommand,
    ) -> Result<T, WorkerGone> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| WorkerGone(self.plant_id.to_string()))?;
        rx.await.map_err(|_| WorkerGone(self.plant_id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct PlantWorker<S, P, N, C> {
    engine: EvaluationEngine<S, P, N, C>,
    clock: Arc<dyn Clock>,
    db: Option<Db>,
    shared: SharedState,
}

impl<S, P, N, C> PlantWorker<S, P, N, C>
where
    S: SensorCapability + 'static,
    P: PumpCapability + 'static,
    N: NotificationSink + 'static,
    C: ConfigProvider + 'static,
{
    pub fn new(
        engine: EvaluationEngine<S, P, N, C>,
        clock: Arc<dyn Clock>,
        db: Option<Db>,
        shared: SharedState,
    ) -> Self {
        Self {
            engine,
            clock,
            db,
            shared,
        }
    }

    /// Start the task. It runs until every handle is dropped.
    pub fn spawn(self) -> (PlantHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let handle = PlantHandle {
            plant_id: Arc::from(self.engine.plant_id()),
            tx,
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<PlantCommand>) {
        info!(plant = %self.engine.plant_id(), "worker: started");

        while let Some(cmd) = rx.recv().await {
            match cmd {
                PlantCommand::Signal(signal) => {
                    self.engine.record_signal(signal);
                }
                PlantCommand::Evaluate { trigger, reply } => {
                    let now = self.clock.now();
                    let result = self.engine.evaluate(now, None).await;
                    let report = self.finish(trigger, result, now).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(report);
                    }
                }
                PlantCommand::WaterNow { reply } => {
                    let now = self.clock.now();
                    let result = self.engine.water_now(now).await;
                    let report = self.finish(Trigger::Manual, result, now).await;
                    let _ = reply.send(report);
                }
                PlantCommand::Diagnostics { reply } => {
                    let _ = reply.send(self.engine.diagnostics(self.clock.now()));
                }
            }
        }

        debug!(plant = %self.engine.plant_id(), "worker: all handles dropped, stopping");
    }

    /// Publish the outcome: shared state, history row, snapshot.
    async fn finish(
        &mut self,
        trigger: Trigger,
        result: EvaluationResult,
        now: OffsetDateTime,
    ) -> EvaluationReport {
        let status = self.engine.status();
        let plant_id = self.engine.plant_id().to_string();

        self.shared
            .write()
            .await
            .record_evaluation(&plant_id, result, status, now);

        if let Some(db) = &self.db {
            let snapshot = self.engine.snapshot();
            let moisture = snapshot.last_moisture.map(|m| m.percent);
            if let Err(e) = db
                .insert_evaluation(
                    now.unix_timestamp(),
                    &plant_id,
                    trigger.as_str(),
                    result,
                    status,
                    moisture,
                )
                .await
            {
                error!(plant = %plant_id, error = %e, "worker: history write failed");
            }
            if let Err(e) = db.save_snapshot(&snapshot).await {
                error!(plant = %plant_id, error = %e, "worker: snapshot write failed");
            }
        }

        EvaluationReport {
            result,
            status,
            at: now,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
