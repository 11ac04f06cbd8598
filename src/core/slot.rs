//! Deployment slots and release history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle to a built artifact, tagged with the run's version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub id: String,
    pub version: String,
}

/// Handle to a running instance started by the container runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHandle {
    pub id: String,
    pub slot: String,
    pub port: u16,
}

/// Where the runtime should start an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotBinding {
    pub slot: String,
    pub kind: SlotKind,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    Test,
    Production,
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotKind::Test => f.write_str("test"),
            SlotKind::Production => f.write_str("production"),
        }
    }
}

/// A version running in a slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub version: String,
    pub artifact: ArtifactHandle,
    pub instance: InstanceHandle,
    pub deployed_at: DateTime<Utc>,
}

impl Deployment {
    pub fn new(artifact: ArtifactHandle, instance: InstanceHandle) -> Self {
        Self {
            version: artifact.version.clone(),
            artifact,
            instance,
            deployed_at: Utc::now(),
        }
    }

    pub fn port(&self) -> u16 {
        self.instance.port
    }
}

/// A logical deployment target holding at most one current version.
///
/// During a blue-green window the slot additionally tracks the incoming
/// deployment, which only becomes current through [`DeploymentSlot::promote_incoming`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSlot {
    pub name: String,
    pub kind: SlotKind,
    /// Readiness URL; `{port}` is replaced with the instance port
    pub health_url: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standby_port: Option<u16>,
    #[serde(default)]
    current: Option<Deployment>,
    #[serde(default)]
    incoming: Option<Deployment>,
}

impl DeploymentSlot {
    pub fn new(name: impl Into<String>, kind: SlotKind, health_url: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            kind,
            health_url: health_url.into(),
            port,
            standby_port: None,
            current: None,
            incoming: None,
        }
    }

    pub fn with_standby_port(mut self, port: u16) -> Self {
        self.standby_port = Some(port);
        self
    }

    pub fn current(&self) -> Option<&Deployment> {
        self.current.as_ref()
    }

    pub fn incoming(&self) -> Option<&Deployment> {
        self.incoming.as_ref()
    }

    pub fn current_version(&self) -> Option<&str> {
        self.current.as_ref().map(|d| d.version.as_str())
    }

    /// Health URL for an instance listening on `port`
    pub fn health_url_for(&self, port: u16) -> String {
        self.health_url.replace("{port}", &port.to_string())
    }

    /// Health URL of the current deployment, if any
    pub fn current_health_url(&self) -> Option<String> {
        self.current.as_ref().map(|d| self.health_url_for(d.port()))
    }

    /// Port for the next incoming deployment: whichever of the two ports the
    /// current deployment is not using
    pub fn next_port(&self) -> u16 {
        let standby = self.standby_port.unwrap_or_else(|| self.port.wrapping_add(1));
        match &self.current {
            Some(current) if current.port() == self.port => standby,
            _ => self.port,
        }
    }

    pub fn binding(&self, port: u16) -> SlotBinding {
        SlotBinding {
            slot: self.name.clone(),
            kind: self.kind,
            port,
        }
    }

    pub(crate) fn stage_incoming(&mut self, deployment: Deployment) {
        self.incoming = Some(deployment);
    }

    /// Swap the incoming deployment in. Returns the displaced deployment.
    pub(crate) fn promote_incoming(&mut self) -> Option<Deployment> {
        match self.incoming.take() {
            Some(incoming) => self.current.replace(incoming),
            None => None,
        }
    }

    pub(crate) fn discard_incoming(&mut self) -> Option<Deployment> {
        self.incoming.take()
    }

    pub(crate) fn replace_current(&mut self, deployment: Deployment) -> Option<Deployment> {
        self.current.replace(deployment)
    }

    pub(crate) fn take_current(&mut self) -> Option<Deployment> {
        self.current.take()
    }

    /// Drop runtime-only state (an interrupted incoming deployment) after loading
    pub(crate) fn without_incoming(mut self) -> Self {
        self.incoming = None;
        self
    }
}

/// Release state machine phases
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ReleasePhase {
    NoProduction,
    Staging { version: String },
    HealthChecking { version: String },
    Live { version: String },
    RollingBack { version: String },
}

impl fmt::Display for ReleasePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleasePhase::NoProduction => f.write_str("NoProduction"),
            ReleasePhase::Staging { version } => write!(f, "Staging({})", version),
            ReleasePhase::HealthChecking { version } => write!(f, "HealthChecking({})", version),
            ReleasePhase::Live { version } => write!(f, "Live({})", version),
            ReleasePhase::RollingBack { version } => write!(f, "RollingBack({})", version),
        }
    }
}

/// One state-machine transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: ReleasePhase,
    pub to: ReleasePhase,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStrategy {
    FirstDeployment,
    BlueGreen,
}

impl fmt::Display for ReleaseStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseStrategy::FirstDeployment => f.write_str("first-deployment"),
            ReleaseStrategy::BlueGreen => f.write_str("blue-green"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseResult {
    Live,
    RolledBack,
}

/// Append-only release history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub version: String,
    pub strategy: ReleaseStrategy,
    pub timestamp: DateTime<Utc>,
    pub health: HealthStatus,
    pub result: ReleaseResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}
