//! Unit lifecycle manager
//!
//! [`UnitManager`] owns the bus handle for its whole life and exposes
//! start/stop/restart/uptime/watch on top of it. Clones share the handle;
//! no state is kept between calls, so any number of operations may run
//! concurrently against the same or different units. The daemon's own
//! `replace` job mode is the only thing serialising jobs for one unit.

use crate::bus::{ControlBus, JobVerb, SystemdBus, UnitUpdate};
use crate::config::BusConfig;
use crate::context::Context;
use crate::error::UnitError;
use crate::job::run_job;
use crate::timestamp::{decode_usec_timestamp, strip_type_tag};
use crate::watch::watch_unit;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Service property holding the main process start time, in microseconds.
pub const START_TIMESTAMP_PROPERTY: &str = "ExecMainStartTimestamp";

/// Lifecycle operations on a single named unit.
///
/// Orchestrators can depend on this instead of a concrete manager to swap
/// in their own fakes.
///
/// Uses RPITIT (Return Position Impl Trait in Traits) with explicit Send bounds.
pub trait UnitManagerApi: Send + Sync {
    /// Start `unit` and wait for the job to finish.
    fn start(&self, ctx: &Context, unit: &str) -> impl Future<Output = Result<(), UnitError>> + Send;

    /// Stop `unit` and wait for the job to finish.
    fn stop(&self, ctx: &Context, unit: &str) -> impl Future<Output = Result<(), UnitError>> + Send;

    /// Reload then restart `unit` and wait for the restart job to finish.
    fn restart(
        &self,
        ctx: &Context,
        unit: &str,
    ) -> impl Future<Output = Result<(), UnitError>> + Send;

    /// Time since the unit's main process started.
    fn uptime(
        &self,
        ctx: &Context,
        unit: &str,
    ) -> impl Future<Output = Result<Duration, UnitError>> + Send;

    /// Forward status changes of `unit` to `updates` until `ctx` ends.
    fn watch(
        &self,
        ctx: &Context,
        unit: &str,
        updates: Option<&mpsc::Sender<UnitUpdate>>,
    ) -> impl Future<Output = Result<(), UnitError>> + Send;
}

/// Drives systemd units through a [`ControlBus`].
pub struct UnitManager<B: ControlBus> {
    bus: Arc<B>,
}

impl<B: ControlBus> Clone for UnitManager<B> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
        }
    }
}

impl<B: ControlBus> std::fmt::Debug for UnitManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitManager")
            .field("connected", &self.bus.is_connected())
            .finish()
    }
}

impl UnitManager<SystemdBus> {
    /// Connect to systemd and build a manager whose connection is closed
    /// once `ctx` ends.
    pub async fn connect(ctx: &Context, config: &BusConfig) -> Result<Self, UnitError> {
        let bus = tokio::select! {
            biased;
            reason = ctx.done() => return Err(reason.into()),
            bus = SystemdBus::connect(config) => bus?,
        };
        Ok(Self::new(ctx, bus))
    }
}

impl<B: ControlBus> UnitManager<B> {
    /// Take ownership of `bus`.
    ///
    /// A detached task closes the bus exactly once when `ctx` ends; this
    /// constructor does not wait for that. Must be called inside a Tokio
    /// runtime.
    pub fn new(ctx: &Context, bus: B) -> Self {
        let bus = Arc::new(bus);

        let teardown_bus = bus.clone();
        let teardown_ctx = ctx.clone();
        tokio::spawn(async move {
            let reason = teardown_ctx.done().await;
            info!("Closing control bus connection: {}", reason);
            teardown_bus.close().await;
        });

        Self { bus }
    }

    /// The underlying bus handle.
    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn is_connected(&self) -> bool {
        self.bus.is_connected()
    }

    pub async fn start(&self, ctx: &Context, unit: &str) -> Result<(), UnitError> {
        debug!("Starting unit {:?}", unit);
        run_job(&*self.bus, ctx, unit, JobVerb::Start).await
    }

    pub async fn stop(&self, ctx: &Context, unit: &str) -> Result<(), UnitError> {
        debug!("Stopping unit {:?}", unit);
        run_job(&*self.bus, ctx, unit, JobVerb::Stop).await
    }

    /// Reload the unit (outcome ignored) to pick up unit-file changes, then
    /// restart it.
    pub async fn restart(&self, ctx: &Context, unit: &str) -> Result<(), UnitError> {
        debug!("Restarting unit {:?}", unit);
        run_job(&*self.bus, ctx, unit, JobVerb::Restart).await
    }

    /// Time elapsed since the unit's main process started, from
    /// `ExecMainStartTimestamp`.
    ///
    /// An absent property decodes as an error, never as a zero uptime. If
    /// the clock reads earlier than the start time the uptime is zero.
    pub async fn uptime(&self, ctx: &Context, unit: &str) -> Result<Duration, UnitError> {
        if !self.bus.is_connected() {
            warn!("Cannot read uptime of unit {:?}: systemd D-Bus API unreachable", unit);
            return Err(UnitError::Disconnected {
                unit: unit.to_string(),
            });
        }

        let raw = tokio::select! {
            biased;
            reason = ctx.done() => return Err(reason.into()),
            value = self.bus.get_property(unit, START_TIMESTAMP_PROPERTY) => {
                value.map_err(|source| UnitError::Property {
                    unit: unit.to_string(),
                    property: START_TIMESTAMP_PROPERTY.to_string(),
                    source,
                })?
            }
        };

        let started = decode_usec_timestamp(strip_type_tag(&raw)).map_err(|e| {
            let err = UnitError::MalformedTimestamp {
                unit: unit.to_string(),
                value: e.value,
                reason: e.reason,
            };
            warn!("Failed to read uptime: {}", err);
            err
        })?;
        let uptime = Utc::now()
            .signed_duration_since(started)
            .to_std()
            .unwrap_or(Duration::ZERO);
        debug!("Unit {:?} up for {:?}", unit, uptime);
        Ok(uptime)
    }

    /// Forward status changes of `unit` to `updates`. Blocks until `ctx`
    /// ends; see [`watch_unit`].
    pub async fn watch(
        &self,
        ctx: &Context,
        unit: &str,
        updates: Option<&mpsc::Sender<UnitUpdate>>,
    ) -> Result<(), UnitError> {
        watch_unit(&*self.bus, ctx, unit, updates).await
    }
}

impl<B: ControlBus> UnitManagerApi for UnitManager<B> {
    async fn start(&self, ctx: &Context, unit: &str) -> Result<(), UnitError> {
        UnitManager::start(self, ctx, unit).await
    }

    async fn stop(&self, ctx: &Context, unit: &str) -> Result<(), UnitError> {
        UnitManager::stop(self, ctx, unit).await
    }

    async fn restart(&self, ctx: &Context, unit: &str) -> Result<(), UnitError> {
        UnitManager::restart(self, ctx, unit).await
    }

    async fn uptime(&self, ctx: &Context, unit: &str) -> Result<Duration, UnitError> {
        UnitManager::uptime(self, ctx, unit).await
    }

    async fn watch(
        &self,
        ctx: &Context,
        unit: &str,
        updates: Option<&mpsc::Sender<UnitUpdate>>,
    ) -> Result<(), UnitError> {
        UnitManager::watch(self, ctx, unit, updates).await
    }
}
