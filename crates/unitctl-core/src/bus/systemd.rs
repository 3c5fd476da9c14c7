//! systemd control bus over D-Bus
//!
//! Job results arrive asynchronously as `JobRemoved` signals. A listener task
//! owns the signal stream and routes each result to the single-slot sender
//! registered for that job path. The sender can only be registered once the
//! submission call has returned the path, so a result for a job nobody has
//! claimed yet is parked for a bounded number of jobs and handed over at
//! registration. No lock is held across a bus call; concurrent submissions
//! do not wait on each other.
//!
//! The change stream is produced by re-listing units at a fixed interval and
//! diffing against the previous listing, one producer task per subscription.

use super::{
    ChangeBatch, ChangeSubscription, ControlBus, JobMode, JobResultSender, JobVerb, UnitStatus,
};
use crate::config::{BusConfig, BusKind};
use crate::error::{BusError, UnitError};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zbus::fdo::PropertiesProxy;
use zbus::names::InterfaceName;
use zbus::zvariant::{OwnedObjectPath, Value};
use zbus::{Connection, proxy};

const SERVICE_INTERFACE: &str = "org.freedesktop.systemd1.Service";
const SUBSCRIPTION_BUFFER: usize = 16;
/// Results kept for jobs whose waiter has not registered yet. Every job on
/// the system reports here, not only ours.
const UNCLAIMED_RESULTS: usize = 256;

/// Row returned by `ListUnits`.
type UnitListing = (
    String,
    String,
    String,
    String,
    String,
    String,
    OwnedObjectPath,
    u32,
    String,
    OwnedObjectPath,
);

#[proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait SystemdManager {
    fn subscribe(&self) -> zbus::Result<()>;

    fn start_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn restart_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn reload_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn list_units(&self) -> zbus::Result<Vec<UnitListing>>;

    fn link_unit_files(
        &self,
        files: &[&str],
        runtime: bool,
        force: bool,
    ) -> zbus::Result<Vec<(String, String, String)>>;

    fn disable_unit_files(
        &self,
        files: &[&str],
        runtime: bool,
    ) -> zbus::Result<Vec<(String, String, String)>>;

    #[zbus(signal)]
    fn job_removed(
        &self,
        id: u32,
        job: zbus::zvariant::ObjectPath<'_>,
        unit: &str,
        result: &str,
    ) -> zbus::Result<()>;
}

/// One change reported by `LinkUnitFiles` / `DisableUnitFiles`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFileChange {
    /// `symlink` or `unlink`
    pub change_type: String,
    pub filename: String,
    pub destination: String,
}

impl From<(String, String, String)> for UnitFileChange {
    fn from((change_type, filename, destination): (String, String, String)) -> Self {
        Self {
            change_type,
            filename,
            destination,
        }
    }
}

/// Pairs `JobRemoved` results with the senders of the jobs that wait on them.
#[derive(Default)]
struct JobRouter {
    waiting: HashMap<String, JobResultSender>,
    unclaimed: HashMap<String, String>,
    unclaimed_order: VecDeque<String>,
}

impl JobRouter {
    /// Register the waiter for `job`, delivering at once if its result
    /// already arrived.
    fn register(&mut self, job: String, result: JobResultSender) {
        match self.unclaimed.remove(&job) {
            Some(token) => {
                debug!("Job {} finished before registration with {:?}", job, token);
                let _ = result.send(token);
            }
            None => {
                self.waiting.insert(job, result);
            }
        }
    }

    /// Route a finished job's result. Returns `false` if nobody was waiting
    /// and the result was parked instead.
    fn complete(&mut self, job: String, token: String) -> bool {
        if let Some(sender) = self.waiting.remove(&job) {
            // The waiter may have been cancelled already.
            let _ = sender.send(token);
            return true;
        }
        while self.unclaimed_order.len() >= UNCLAIMED_RESULTS {
            if let Some(oldest) = self.unclaimed_order.pop_front() {
                self.unclaimed.remove(&oldest);
            }
        }
        self.unclaimed_order.push_back(job.clone());
        self.unclaimed.insert(job, token);
        false
    }

    /// Drop every waiter so they observe the lost connection.
    fn clear(&mut self) {
        self.waiting.clear();
        self.unclaimed.clear();
        self.unclaimed_order.clear();
    }
}

type PendingJobs = Arc<Mutex<JobRouter>>;

fn lock_jobs(pending: &PendingJobs) -> MutexGuard<'_, JobRouter> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`ControlBus`] backed by a D-Bus connection to systemd.
pub struct SystemdBus {
    conn: Connection,
    manager: SystemdManagerProxy<'static>,
    pending: PendingJobs,
    connected: Arc<AtomicBool>,
    closed: CancellationToken,
    poll_interval: Duration,
}

impl SystemdBus {
    /// Connect to the configured bus and start routing job results.
    pub async fn connect(config: &BusConfig) -> Result<Self, UnitError> {
        let conn = open_connection(config)
            .await
            .map_err(|e| UnitError::Connect { source: e })?;
        let manager = SystemdManagerProxy::new(&conn)
            .await
            .map_err(|e| UnitError::Connect { source: e.into() })?;

        // Register the match rule before asking systemd to emit signals.
        let job_removed = manager
            .receive_job_removed()
            .await
            .map_err(|e| UnitError::Connect { source: e.into() })?;
        manager
            .subscribe()
            .await
            .map_err(|e| UnitError::Connect { source: e.into() })?;

        let pending: PendingJobs = Arc::new(Mutex::new(JobRouter::default()));
        let connected = Arc::new(AtomicBool::new(true));
        let closed = CancellationToken::new();

        tokio::spawn(route_job_results(
            job_removed,
            pending.clone(),
            connected.clone(),
            closed.clone(),
        ));

        info!("Connected to systemd D-Bus API ({:?} bus)", config.kind);

        Ok(Self {
            conn,
            manager,
            pending,
            connected,
            closed,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        })
    }

    /// Link unit files into the unit search path.
    pub async fn link_unit_files(
        &self,
        files: &[&str],
        runtime: bool,
        force: bool,
    ) -> Result<Vec<UnitFileChange>, BusError> {
        let changes = self.manager.link_unit_files(files, runtime, force).await?;
        Ok(changes.into_iter().map(UnitFileChange::from).collect())
    }

    /// Remove unit file links (the inverse of enable/link).
    pub async fn disable_unit_files(
        &self,
        files: &[&str],
        runtime: bool,
    ) -> Result<Vec<UnitFileChange>, BusError> {
        let changes = self.manager.disable_unit_files(files, runtime).await?;
        Ok(changes.into_iter().map(UnitFileChange::from).collect())
    }

    async fn list_filtered(
        manager: &SystemdManagerProxy<'static>,
        filter: &HashSet<String>,
    ) -> Result<HashMap<String, UnitStatus>, BusError> {
        let units = manager.list_units().await?;
        Ok(units
            .into_iter()
            .map(status_from_listing)
            .filter(|status| filter.is_empty() || filter.contains(&status.name))
            .map(|status| (status.name.clone(), status))
            .collect())
    }
}

async fn open_connection(config: &BusConfig) -> Result<Connection, BusError> {
    let conn = match config.kind {
        BusKind::System => Connection::system().await?,
        BusKind::Session => Connection::session().await?,
        BusKind::Address => {
            let address = config
                .address
                .as_deref()
                .ok_or("bus.kind is \"address\" but bus.address is not set")?;
            zbus::connection::Builder::address(address)?.build().await?
        }
    };
    Ok(conn)
}

/// Route `JobRemoved` signals to the waiting jobs until the connection
/// closes. Pending senders are dropped on exit so waiters observe the loss.
async fn route_job_results(
    mut job_removed: JobRemovedStream<'static>,
    pending: PendingJobs,
    connected: Arc<AtomicBool>,
    closed: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            _ = closed.cancelled() => break,
            next = job_removed.next() => match next {
                Some(signal) => signal,
                None => {
                    error!("JobRemoved signal stream ended, marking bus disconnected");
                    break;
                }
            },
        };

        let (job, unit, result) = match signal.args() {
            Ok(args) => (
                args.job().to_string(),
                args.unit().to_string(),
                args.result().to_string(),
            ),
            Err(e) => {
                warn!("Ignoring malformed JobRemoved signal: {}", e);
                continue;
            }
        };

        debug!("Job {} for {} finished with {:?}", job, unit, result);
        lock_jobs(&pending).complete(job, result);
    }

    connected.store(false, Ordering::SeqCst);
    lock_jobs(&pending).clear();
}

/// Emit the units whose listing changed, and `None` for units that vanished.
fn diff_units(
    previous: &HashMap<String, UnitStatus>,
    current: &HashMap<String, UnitStatus>,
) -> ChangeBatch {
    let mut batch = ChangeBatch::new();
    for (name, status) in current {
        if previous.get(name) != Some(status) {
            batch.insert(name.clone(), Some(status.clone()));
        }
    }
    for name in previous.keys() {
        if !current.contains_key(name) {
            batch.insert(name.clone(), None);
        }
    }
    batch
}

fn status_from_listing(row: UnitListing) -> UnitStatus {
    let (
        name,
        description,
        load_state,
        active_state,
        sub_state,
        followed,
        path,
        job_id,
        job_type,
        job_path,
    ) = row;
    UnitStatus {
        name,
        description,
        load_state,
        active_state,
        sub_state,
        followed,
        path: path.to_string(),
        job_id,
        job_type,
        job_path: job_path.to_string(),
    }
}

/// Escape a unit name into its object path below
/// `/org/freedesktop/systemd1/unit/`, the way `sd_bus_path_encode` does.
pub fn unit_object_path(unit: &str) -> String {
    let mut path = String::from("/org/freedesktop/systemd1/unit/");
    if unit.is_empty() {
        path.push('_');
        return path;
    }
    for (i, byte) in unit.bytes().enumerate() {
        if byte.is_ascii_alphabetic() || (byte.is_ascii_digit() && i != 0) {
            path.push(byte as char);
        } else {
            path.push_str(&format!("_{byte:02x}"));
        }
    }
    path
}

/// Render a property value the way GVariant text format does for the types
/// systemd exposes, including the `@<type> ` marker on non-default integers.
fn render_value(value: &Value<'_>) -> String {
    match value {
        Value::U8(v) => format!("@y {v}"),
        Value::I16(v) => format!("@n {v}"),
        Value::U16(v) => format!("@q {v}"),
        Value::U32(v) => format!("@u {v}"),
        Value::I64(v) => format!("@x {v}"),
        Value::U64(v) => format!("@t {v}"),
        Value::I32(v) => v.to_string(),
        Value::Bool(v) => v.to_string(),
        Value::F64(v) => v.to_string(),
        Value::Str(v) => v.to_string(),
        Value::ObjectPath(v) => v.to_string(),
        Value::Value(inner) => render_value(inner),
        other => format!("{other:?}"),
    }
}

impl ControlBus for SystemdBus {
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
        let mode = mode.as_str();
        let job = match verb {
            JobVerb::Start => self.manager.start_unit(unit, mode).await?,
            JobVerb::Stop => self.manager.stop_unit(unit, mode).await?,
            JobVerb::Restart => self.manager.restart_unit(unit, mode).await?,
            JobVerb::Reload => self.manager.reload_unit(unit, mode).await?,
        };
        let job = job.to_string();
        debug!("Submitted {} job {} for {}", verb, job, unit);
        lock_jobs(&self.pending).register(job.clone(), result);
        Ok(job)
    }

    async fn reload_job(&self, unit: &str, mode: JobMode) -> Result<String, BusError> {
        let job = self.manager.reload_unit(unit, mode.as_str()).await?;
        Ok(job.to_string())
    }

    async fn get_property(&self, unit: &str, property: &str) -> Result<String, BusError> {
        let properties = PropertiesProxy::builder(&self.conn)
            .destination("org.freedesktop.systemd1")?
            .path(unit_object_path(unit))?
            .build()
            .await?;
        let interface = InterfaceName::try_from(SERVICE_INTERFACE)?;
        let value = properties.get(interface, property).await?;
        Ok(render_value(&value))
    }

    async fn subscribe_changes(&self, units: &[String]) -> Result<ChangeSubscription, BusError> {
        let filter: HashSet<String> = units.iter().cloned().collect();

        // Baseline taken before returning so no transition after subscribing
        // is missed, and nothing already true is reported as a change.
        let baseline = Self::list_filtered(&self.manager, &filter).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let stop = CancellationToken::new();
        tokio::spawn(poll_changes(
            self.manager.clone(),
            filter,
            baseline,
            self.poll_interval,
            tx,
            stop.clone(),
            self.closed.clone(),
        ));

        Ok(ChangeSubscription::new(rx, stop))
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.connected.store(false, Ordering::SeqCst);
        if let Err(e) = self.conn.clone().close().await {
            warn!("Error closing systemd D-Bus connection: {}", e);
        }
        info!("Closed systemd D-Bus connection");
    }
}

async fn poll_changes(
    manager: SystemdManagerProxy<'static>,
    filter: HashSet<String>,
    mut previous: HashMap<String, UnitStatus>,
    interval: Duration,
    tx: mpsc::Sender<ChangeBatch>,
    stop: CancellationToken,
    closed: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately and the baseline is already known.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = closed.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let current = match SystemdBus::list_filtered(&manager, &filter).await {
            Ok(current) => current,
            Err(e) => {
                warn!("Failed to list units for change subscription: {}", e);
                continue;
            }
        };
        let batch = diff_units(&previous, &current);
        previous = current;
        if batch.is_empty() {
            continue;
        }

        debug!("Unit changes: {:?}", batch.keys().collect::<Vec<_>>());
        tokio::select! {
            _ = stop.cancelled() => break,
            sent = tx.send(batch) => if sent.is_err() { break },
        }
    }
}
