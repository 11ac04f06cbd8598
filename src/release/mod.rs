//! Release manager - blue-green rollout of the production slot
//!
//! The manager is the only writer of the production [`DeploymentSlot`]. A
//! release walks `NoProduction | Live(old) -> Staging -> HealthChecking`, then
//! either swaps to `Live(new)` or goes through `RollingBack` back to where it
//! started. The incoming version runs next to the old one until it is proven
//! healthy, so a live slot is never left without a running version.

use crate::core::error::PipelineError;
use crate::core::slot::{
    ArtifactHandle, Deployment, DeploymentSlot, HealthStatus, ReleasePhase, ReleaseRecord,
    ReleaseResult, ReleaseStrategy, Transition,
};
use crate::core::context::AbortSignal;
use crate::external::ContainerRuntime;
use crate::health::{self, PollSettings, ReadinessProbe};
use crate::persistence::SlotStateStore;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Why a release did not go live
#[derive(Debug, Error)]
pub enum ReleaseError {
    /// Another release holds the slot
    #[error("a release is already in progress on slot '{slot}'")]
    InProgress { slot: String },

    /// The artifact was not verified in the test slot; production untouched
    #[error("release precondition failed: {0}")]
    Precondition(PipelineError),

    /// The state machine ran and restored the previous state
    #[error("release of {} rolled back: {cause}", .record.version)]
    RolledBack {
        record: Box<ReleaseRecord>,
        cause: PipelineError,
    },
}

impl ReleaseError {
    /// Release record produced by the attempt, if the state machine ran
    pub fn record(&self) -> Option<&ReleaseRecord> {
        match self {
            ReleaseError::RolledBack { record, .. } => Some(&**record),
            _ => None,
        }
    }

    pub fn into_pipeline_error(self) -> PipelineError {
        match self {
            ReleaseError::InProgress { .. } => PipelineError::step("release", self.to_string()),
            ReleaseError::Precondition(cause) | ReleaseError::RolledBack { cause, .. } => cause,
        }
    }
}

/// Phase bookkeeping for one attempt
struct Tracker {
    phase: ReleasePhase,
    transitions: Vec<Transition>,
}

impl Tracker {
    fn new(phase: ReleasePhase) -> Self {
        Self {
            phase,
            transitions: Vec::new(),
        }
    }

    fn go(&mut self, to: ReleasePhase, note: Option<String>) {
        debug!(from = %self.phase, %to, "release transition");
        self.transitions.push(Transition {
            from: self.phase.clone(),
            to: to.clone(),
            at: Utc::now(),
            note,
        });
        self.phase = to;
    }
}

/// Owner of the production slot
pub struct ReleaseManager {
    slot_name: String,
    slot: Mutex<DeploymentSlot>,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn ReadinessProbe>,
    health: PollSettings,
    state: Option<SlotStateStore>,
    history: Mutex<Vec<ReleaseRecord>>,
}

impl ReleaseManager {
    pub fn new(
        slot: DeploymentSlot,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn ReadinessProbe>,
        health: PollSettings,
    ) -> Self {
        Self {
            slot_name: slot.name.clone(),
            slot: Mutex::new(slot),
            runtime,
            probe,
            health,
            state: None,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Persist the slot after every attempt
    pub fn with_state_store(mut self, store: SlotStateStore) -> Self {
        self.state = Some(store);
        self
    }

    /// Snapshot of the slot
    pub async fn slot(&self) -> DeploymentSlot {
        self.slot.lock().await.clone()
    }

    /// Version currently live, if any
    pub async fn current_version(&self) -> Option<String> {
        self.slot.lock().await.current_version().map(str::to_string)
    }

    /// Readiness URL of the live version, if any
    pub async fn current_health_url(&self) -> Option<String> {
        self.slot.lock().await.current_health_url()
    }

    /// Every attempt this manager made, oldest first
    pub async fn history(&self) -> Vec<ReleaseRecord> {
        self.history.lock().await.clone()
    }

    pub async fn phase(&self) -> ReleasePhase {
        phase_of(&*self.slot.lock().await)
    }

    /// Release `artifact` to production.
    ///
    /// `test_slot` must hold the same version and answer healthy, otherwise
    /// production is not touched. Only one release runs at a time; a second
    /// caller gets [`ReleaseError::InProgress`].
    pub async fn release(
        &self,
        artifact: &ArtifactHandle,
        test_slot: Option<&DeploymentSlot>,
        env: &[(String, String)],
        abort: &AbortSignal,
    ) -> Result<ReleaseRecord, ReleaseError> {
        let mut slot = self.slot.try_lock().map_err(|_| ReleaseError::InProgress {
            slot: self.slot_name.clone(),
        })?;

        // Held until the attempt is persisted; other processes share the state file
        let _writer = match &self.state {
            Some(store) => {
                let lock = store.try_lock().map_err(|e| {
                    ReleaseError::Precondition(PipelineError::step("release", format!("{:#}", e)))
                })?;
                let Some(lock) = lock else {
                    warn!(lock = %store.lock_path().display(), "slot locked by another process");
                    return Err(ReleaseError::InProgress {
                        slot: self.slot_name.clone(),
                    });
                };
                store.refresh(&mut slot).map_err(|e| {
                    ReleaseError::Precondition(PipelineError::step("release", format!("{:#}", e)))
                })?;
                Some(lock)
            }
            None => None,
        };

        self.check_precondition(artifact, test_slot).await?;

        let version = artifact.version.clone();
        let previous = slot.current().cloned();
        let strategy = match previous {
            Some(_) => ReleaseStrategy::BlueGreen,
            None => ReleaseStrategy::FirstDeployment,
        };
        info!(
            %version,
            %strategy,
            previous = previous.as_ref().map(|d| d.version.as_str()).unwrap_or("-"),
            "starting release"
        );

        let mut tracker = Tracker::new(phase_of(&slot));
        tracker.go(ReleasePhase::Staging { version: version.clone() }, None);

        let port = slot.next_port();
        let binding = slot.binding(port);
        let started = tokio::select! {
            biased;
            _ = abort.cancelled() => Err(PipelineError::Aborted(format!(
                "release of {} interrupted while starting", version
            ))),
            started = self.runtime.start(artifact, &binding, env) => {
                started.map_err(|e| e.for_tool("container runtime"))
            }
        };

        let instance = match started {
            Ok(instance) => instance,
            Err(cause) => {
                warn!(%version, error = %cause, "could not start incoming version");
                tracker.go(
                    ReleasePhase::RollingBack { version: version.clone() },
                    Some(cause.to_string()),
                );
                tracker.go(phase_of(&slot), Some("slot unchanged".to_string()));
                let record = self
                    .finish(&slot, tracker, &version, strategy, HealthStatus::Unknown, previous.as_ref())
                    .await;
                return Err(ReleaseError::RolledBack {
                    record: Box::new(record),
                    cause,
                });
            }
        };
        slot.stage_incoming(Deployment::new(artifact.clone(), instance));

        tracker.go(ReleasePhase::HealthChecking { version: version.clone() }, None);
        let url = slot.health_url_for(port);
        let outcome = health::poll(self.probe.as_ref(), &url, &self.health, abort).await;

        match outcome.into_result(&url) {
            Ok(attempts) => {
                let displaced = slot.promote_incoming();
                tracker.go(
                    ReleasePhase::Live { version: version.clone() },
                    Some(format!("healthy after {} attempt(s)", attempts)),
                );

                if let Some(old) = displaced {
                    if let Err(e) = self.runtime.stop(&old.instance).await {
                        warn!(version = %old.version, error = %e, "failed to stop previous version");
                        if let Some(last) = tracker.transitions.last_mut() {
                            last.note = Some(format!("previous version {} not stopped: {}", old.version, e));
                        }
                    }
                }

                info!(%version, %strategy, "release is live");
                let record = self
                    .finish(&slot, tracker, &version, strategy, HealthStatus::Healthy, previous.as_ref())
                    .await;
                Ok(record)
            }
            Err(cause) => {
                warn!(%version, error = %cause, "incoming version unhealthy, rolling back");
                tracker.go(
                    ReleasePhase::RollingBack { version: version.clone() },
                    Some(cause.to_string()),
                );

                if let Some(incoming) = slot.discard_incoming() {
                    if let Err(e) = self.runtime.stop(&incoming.instance).await {
                        warn!(%version, error = %e, "failed to stop incoming version");
                    }
                }

                let note = match &previous {
                    Some(prev) => Some(self.restore_previous(&mut slot, prev, env).await),
                    None => Some("first deployment abandoned".to_string()),
                };
                tracker.go(phase_of(&slot), note);

                let record = self
                    .finish(&slot, tracker, &version, strategy, HealthStatus::Unhealthy, previous.as_ref())
                    .await;
                Err(ReleaseError::RolledBack {
                    record: Box::new(record),
                    cause,
                })
            }
        }
    }

    async fn check_precondition(
        &self,
        artifact: &ArtifactHandle,
        test_slot: Option<&DeploymentSlot>,
    ) -> Result<(), ReleaseError> {
        let (test_slot, deployment) = test_slot
            .and_then(|slot| slot.current().map(|deployment| (slot, deployment)))
            .ok_or_else(|| {
                ReleaseError::Precondition(PipelineError::step(
                    "release",
                    "no test-slot deployment for this run",
                ))
            })?;

        if deployment.version != artifact.version {
            return Err(ReleaseError::Precondition(PipelineError::step(
                "release",
                format!(
                    "test slot runs {}, refusing to release {}",
                    deployment.version, artifact.version
                ),
            )));
        }

        let url = test_slot.health_url_for(deployment.port());
        health::check(self.probe.as_ref(), &url, self.health.probe_timeout)
            .await
            .map_err(|e| {
                ReleaseError::Precondition(PipelineError::HealthCheckTimeout {
                    url: url.clone(),
                    attempts: 1,
                    last_error: e.to_string(),
                })
            })
    }

    /// Make sure the previous version is still serving. Returns a note for
    /// the transition into `Live(previous)`.
    async fn restore_previous(
        &self,
        slot: &mut DeploymentSlot,
        previous: &Deployment,
        env: &[(String, String)],
    ) -> String {
        let url = slot.health_url_for(previous.port());
        if health::check(self.probe.as_ref(), &url, self.health.probe_timeout)
            .await
            .is_ok()
        {
            return format!("{} still serving", previous.version);
        }

        warn!(version = %previous.version, "previous version not answering, restarting it");
        if let Err(e) = self.runtime.stop(&previous.instance).await {
            debug!(error = %e, "stopping unresponsive previous instance failed");
        }

        let binding = slot.binding(previous.port());
        let instance = match self.runtime.start(&previous.artifact, &binding, env).await {
            Ok(instance) => instance,
            Err(e) => {
                warn!(version = %previous.version, error = %e, "restart of previous version failed");
                return format!("{} restart failed: {}", previous.version, e);
            }
        };
        slot.replace_current(Deployment::new(previous.artifact.clone(), instance));

        // The run may already be aborting; the restart has to be attempted regardless
        let outcome = health::poll(self.probe.as_ref(), &url, &self.health, &AbortSignal::never()).await;
        if outcome.is_healthy() {
            format!("{} restarted", previous.version)
        } else {
            format!("{} restarted but not healthy", previous.version)
        }
    }

    async fn finish(
        &self,
        slot: &DeploymentSlot,
        tracker: Tracker,
        version: &str,
        strategy: ReleaseStrategy,
        health: HealthStatus,
        previous: Option<&Deployment>,
    ) -> ReleaseRecord {
        let result = match &tracker.phase {
            ReleasePhase::Live { version: live } if live == version => ReleaseResult::Live,
            _ => ReleaseResult::RolledBack,
        };
        let note = tracker.transitions.last().and_then(|t| t.note.clone());

        let mut record = ReleaseRecord {
            version: version.to_string(),
            strategy,
            timestamp: Utc::now(),
            health,
            result,
            previous_version: previous.map(|d| d.version.clone()),
            transitions: tracker.transitions,
            note,
        };

        if let Some(store) = &self.state {
            if let Err(e) = store.save(slot) {
                warn!(path = %store.path().display(), error = %e, "failed to persist slot state");
                record.note = Some(format!("slot state not persisted: {}", e));
            }
        }

        self.history.lock().await.push(record.clone());
        record
    }

}

fn phase_of(slot: &DeploymentSlot) -> ReleasePhase {
    match slot.current_version() {
        Some(version) => ReleasePhase::Live {
            version: version.to_string(),
        },
        None => ReleasePhase::NoProduction,
    }
}
