//! Control bus contract and data model
//!
//! [`ControlBus`] is the narrow set of primitives the lifecycle engine needs
//! from the init daemon's control bus: a liveness check, job submission,
//! property lookup and a change stream. [`SystemdBus`] speaks to systemd over
//! D-Bus; [`MemoryBus`] is a scripted stand-in for tests.

pub mod memory;
pub mod systemd;

pub use memory::{JobScript, MemoryBus, MemoryCall};
pub use systemd::{SystemdBus, UnitFileChange, unit_object_path};

use crate::error::BusError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};

/// Result token systemd reports for a job that completed successfully.
pub const JOB_DONE: &str = "done";

/// Snapshot of a unit's state at the moment a change was observed.
///
/// Only `active_state` is interpreted by the engine; the rest passes through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub name: String,
    pub description: String,
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
    pub followed: String,
    pub path: String,
    pub job_id: u32,
    pub job_type: String,
    pub job_path: String,
}

impl UnitStatus {
    /// Minimal snapshot with the given active state, mostly for tests.
    pub fn new(name: impl Into<String>, active_state: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            load_state: "loaded".to_string(),
            active_state: active_state.into(),
            sub_state: String::new(),
            followed: String::new(),
            path: String::new(),
            job_id: 0,
            job_type: String::new(),
            job_path: "/".to_string(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_state == "active"
    }
}

/// A change for one unit. `None` means the unit is no longer loaded, which
/// is what systemd reports once a stopped unit is garbage-collected.
pub type UnitUpdate = Option<UnitStatus>;

/// Units that changed together at one notification tick.
pub type ChangeBatch = HashMap<String, UnitUpdate>;

/// Operation requested by a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobVerb {
    Start,
    Stop,
    Restart,
    Reload,
}

impl JobVerb {
    pub fn as_str(self) -> &'static str {
        match self {
            JobVerb::Start => "start",
            JobVerb::Stop => "stop",
            JobVerb::Restart => "restart",
            JobVerb::Reload => "reload",
        }
    }
}

impl fmt::Display for JobVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a new job interacts with jobs already queued for the unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobMode {
    /// Replace conflicting queued jobs. Used by every lifecycle operation.
    #[default]
    Replace,
    Fail,
    Isolate,
    IgnoreDependencies,
    IgnoreRequirements,
}

impl JobMode {
    pub fn as_str(self) -> &'static str {
        match self {
            JobMode::Replace => "replace",
            JobMode::Fail => "fail",
            JobMode::Isolate => "isolate",
            JobMode::IgnoreDependencies => "ignore-dependencies",
            JobMode::IgnoreRequirements => "ignore-requirements",
        }
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single-slot sender for a job's terminal result token.
pub type JobResultSender = oneshot::Sender<String>;

/// Live subscription to the bus-wide change stream.
///
/// Dropping it ends the producer side.
#[derive(Debug)]
pub struct ChangeSubscription {
    batches: mpsc::Receiver<ChangeBatch>,
    _guard: DropGuard,
}

impl ChangeSubscription {
    /// Pair a batch receiver with the token that stops its producer.
    pub fn new(batches: mpsc::Receiver<ChangeBatch>, stop: CancellationToken) -> Self {
        Self {
            batches,
            _guard: stop.drop_guard(),
        }
    }

    /// Next batch, or `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<ChangeBatch> {
        self.batches.recv().await
    }
}

/// Primitives required from the init daemon's control bus.
///
/// Implementations must be safe for concurrent use: several operations may
/// submit jobs and open subscriptions through the same handle at once.
///
/// Uses RPITIT (Return Position Impl Trait in Traits) with explicit Send bounds.
pub trait ControlBus: Send + Sync + 'static {
    /// Non-blocking liveness check.
    fn is_connected(&self) -> bool;

    /// Submit a job for `unit`. The terminal result token is delivered on
    /// `result` once the daemon reports the job finished. Returns the bus
    /// path of the job.
    fn submit_job(
        &self,
        unit: &str,
        verb: JobVerb,
        mode: JobMode,
        result: JobResultSender,
    ) -> impl Future<Output = Result<String, BusError>> + Send;

    /// Submit a reload job whose result nobody waits for.
    fn reload_job(
        &self,
        unit: &str,
        mode: JobMode,
    ) -> impl Future<Output = Result<String, BusError>> + Send {
        let (tx, _rx) = oneshot::channel();
        self.submit_job(unit, JobVerb::Reload, mode, tx)
    }

    /// Look up a service property. The value may carry a GVariant type tag
    /// (`@t ...`); an absent property is an empty string.
    fn get_property(
        &self,
        unit: &str,
        property: &str,
    ) -> impl Future<Output = Result<String, BusError>> + Send;

    /// Open a change stream restricted to `units`.
    fn subscribe_changes(
        &self,
        units: &[String],
    ) -> impl Future<Output = Result<ChangeSubscription, BusError>> + Send;

    /// Release the connection. Must be idempotent.
    fn close(&self) -> impl Future<Output = ()> + Send;
}
