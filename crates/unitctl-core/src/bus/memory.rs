//! In-memory control bus for testing
//!
//! Models a handful of installed units with a coarse active/inactive state,
//! completes jobs the way systemd would, and broadcasts change batches to
//! every open subscription. Individual jobs can be scripted to fail, be
//! rejected, or be held until the test completes them.

use super::{
    ChangeBatch, ChangeSubscription, ControlBus, JOB_DONE, JobMode, JobResultSender, JobVerb,
    UnitStatus, UnitUpdate,
};
use crate::error::BusError;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const BROADCAST_CAPACITY: usize = 64;
const SUBSCRIPTION_BUFFER: usize = 16;

/// Record of bus calls for test assertions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryCall {
    SubmitJob {
        unit: String,
        verb: JobVerb,
        mode: JobMode,
    },
    GetProperty {
        unit: String,
        property: String,
    },
    Subscribe {
        units: Vec<String>,
    },
    Close,
}

/// Scripted outcome for the next job of a given unit and verb
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobScript {
    /// Complete immediately with this result token.
    Result(String),
    /// Reject the submission itself with this message.
    Reject(String),
    /// Accept the job and hold its result until
    /// [`MemoryBus::complete_pending`] is called.
    Hold,
}

struct PendingJob {
    path: String,
    unit: String,
    result: JobResultSender,
}

#[derive(Default)]
struct MemoryState {
    calls: Vec<MemoryCall>,
    units: HashMap<String, UnitStatus>,
    properties: HashMap<(String, String), String>,
    scripts: HashMap<(String, JobVerb), JobScript>,
    pending: Vec<PendingJob>,
    next_job_id: u32,
}

/// Scripted in-memory implementation of [`ControlBus`].
pub struct MemoryBus {
    state: Mutex<MemoryState>,
    connected: AtomicBool,
    unfiltered: AtomicBool,
    closed: CancellationToken,
    close_count: AtomicUsize,
    changes: broadcast::Sender<ChangeBatch>,
}

impl MemoryBus {
    /// Create a connected bus with no installed units.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            state: Mutex::new(MemoryState::default()),
            connected: AtomicBool::new(true),
            unfiltered: AtomicBool::new(false),
            closed: CancellationToken::new(),
            close_count: AtomicUsize::new(0),
            changes,
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install an inactive unit.
    pub fn install_unit(&self, unit: &str) {
        self.state()
            .units
            .insert(unit.to_string(), UnitStatus::new(unit, "inactive"));
    }

    /// Install a unit that is already running.
    pub fn install_active_unit(&self, unit: &str) {
        self.state()
            .units
            .insert(unit.to_string(), UnitStatus::new(unit, "active"));
    }

    /// Current active state of an installed unit.
    pub fn active_state(&self, unit: &str) -> Option<String> {
        self.state().units.get(unit).map(|s| s.active_state.clone())
    }

    /// Flip the liveness flag without closing subscriptions.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Deliver whole batches to subscribers, ignoring their unit set, like
    /// daemon versions that batch unrelated units together.
    pub fn deliver_unfiltered(&self, unfiltered: bool) {
        self.unfiltered.store(unfiltered, Ordering::SeqCst);
    }

    /// Set a service property value as the bus would render it.
    pub fn set_property(&self, unit: &str, property: &str, value: impl Into<String>) {
        self.state()
            .properties
            .insert((unit.to_string(), property.to_string()), value.into());
    }

    /// Script the outcome of every subsequent `verb` job for `unit`.
    pub fn script_job(&self, unit: &str, verb: JobVerb, script: JobScript) {
        self.state().scripts.insert((unit.to_string(), verb), script);
    }

    /// Deliver `token` to the oldest held job for `unit`.
    ///
    /// Returns `false` if no job for `unit` is being held.
    pub fn complete_pending(&self, unit: &str, token: &str) -> bool {
        let job = {
            let mut state = self.state();
            let Some(index) = state.pending.iter().position(|job| job.unit == unit) else {
                return false;
            };
            state.pending.remove(index)
        };
        debug!("Completing held job {} for {} with {:?}", job.path, unit, token);
        // The caller may have given up already; the result is simply dropped then.
        let _ = job.result.send(token.to_string());
        true
    }

    /// Number of jobs currently held.
    pub fn pending_jobs(&self) -> usize {
        self.state().pending.len()
    }

    /// Broadcast a raw batch to every open subscription.
    pub fn publish(&self, batch: ChangeBatch) {
        // No subscribers is not an error for a broadcast bus.
        let _ = self.changes.send(batch);
    }

    /// Number of open change subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }

    /// Wait until at least `count` subscriptions are open.
    pub async fn wait_for_subscribers(&self, count: usize) {
        while self.subscriber_count() < count {
            tokio::task::yield_now().await;
        }
    }

    /// Get a copy of the call log
    pub fn calls(&self) -> Vec<MemoryCall> {
        self.state().calls.clone()
    }

    /// How many times `close` has been called.
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    fn log_call(&self, call: MemoryCall) {
        self.state().calls.push(call);
    }

    /// Apply a successful job to the unit model, returning the change to
    /// publish, if any.
    fn transition(state: &mut MemoryState, unit: &str, verb: JobVerb) -> Option<UnitUpdate> {
        let status = state.units.get_mut(unit)?;
        match verb {
            JobVerb::Start | JobVerb::Restart if !status.is_active() => {
                status.active_state = "active".to_string();
                status.sub_state = "running".to_string();
                Some(Some(status.clone()))
            }
            JobVerb::Stop if status.is_active() => {
                status.active_state = "inactive".to_string();
                status.sub_state = "dead".to_string();
                // systemd unloads a stopped unit nobody references.
                Some(None)
            }
            _ => None,
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBus")
            .field("connected", &self.is_connected())
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl ControlBus for MemoryBus {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn submit_job(
        &self,
        unit: &str,
        verb: JobVerb,
        mode: JobMode,
        result: JobResultSender,
    ) -> Result<String, BusError> {
        self.log_call(MemoryCall::SubmitJob {
            unit: unit.to_string(),
            verb,
            mode,
        });

        let (path, change) = {
            let mut state = self.state();
            state.next_job_id += 1;
            let path = format!("/org/freedesktop/systemd1/job/{}", state.next_job_id);

            match state.scripts.get(&(unit.to_string(), verb)).cloned() {
                Some(JobScript::Reject(message)) => return Err(message.into()),
                Some(JobScript::Hold) => {
                    state.pending.push(PendingJob {
                        path: path.clone(),
                        unit: unit.to_string(),
                        result,
                    });
                    return Ok(path);
                }
                Some(JobScript::Result(token)) => {
                    let _ = result.send(token);
                    return Ok(path);
                }
                None => {}
            }

            let Some(status) = state.units.get(unit) else {
                return Err(format!("Unit {unit} not found.").into());
            };
            if verb == JobVerb::Reload && !status.is_active() {
                return Err(format!(
                    "Job type reload is not applicable for unit {unit}."
                )
                .into());
            }

            let change = Self::transition(&mut state, unit, verb);
            (path, change)
        };

        if let Some(update) = change {
            self.publish(ChangeBatch::from([(unit.to_string(), update)]));
        }
        let _ = result.send(JOB_DONE.to_string());
        Ok(path)
    }

    async fn get_property(&self, unit: &str, property: &str) -> Result<String, BusError> {
        self.log_call(MemoryCall::GetProperty {
            unit: unit.to_string(),
            property: property.to_string(),
        });
        Ok(self
            .state()
            .properties
            .get(&(unit.to_string(), property.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn subscribe_changes(&self, units: &[String]) -> Result<ChangeSubscription, BusError> {
        self.log_call(MemoryCall::Subscribe {
            units: units.to_vec(),
        });
        if self.closed.is_cancelled() {
            return Err("connection closed".into());
        }

        let filter: HashSet<String> = if self.unfiltered.load(Ordering::SeqCst) {
            HashSet::new()
        } else {
            units.iter().cloned().collect()
        };
        let mut source = self.changes.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let stop = CancellationToken::new();
        let task_stop = stop.clone();
        let closed = self.closed.clone();

        tokio::spawn(async move {
            loop {
                let batch = tokio::select! {
                    _ = task_stop.cancelled() => break,
                    _ = closed.cancelled() => break,
                    received = source.recv() => match received {
                        Ok(batch) => batch,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Memory bus subscriber lagged, {} batch(es) skipped", skipped);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                let batch: ChangeBatch = batch
                    .into_iter()
                    .filter(|(name, _)| filter.is_empty() || filter.contains(name))
                    .collect();
                if batch.is_empty() {
                    continue;
                }

                tokio::select! {
                    _ = task_stop.cancelled() => break,
                    sent = tx.send(batch) => if sent.is_err() { break },
                }
            }
        });

        Ok(ChangeSubscription::new(rx, stop))
    }

    async fn close(&self) {
        self.log_call(MemoryCall::Close);
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.closed.cancel();
        // Held results can no longer arrive once the connection is gone.
        self.state().pending.clear();
    }
}
