//! Core library for unitctl
//!
//! Drives systemd units over the D-Bus control API without polling from the
//! caller's side:
//! - start/stop/restart become synchronous, cancellable calls by correlating
//!   each submitted job with its `JobRemoved` result
//! - a bus-wide stream of unit changes is narrowed to one unit and forwarded
//!   to a caller-owned channel
//! - `ExecMainStartTimestamp` is decoded into an uptime
//!
//! [`UnitManager`] is the entry point. It is generic over [`ControlBus`] so
//! the same engine runs against [`SystemdBus`] in production and
//! [`MemoryBus`] in tests.

pub mod bus;
pub mod config;
pub mod context;
pub mod error;
pub mod install;
pub mod job;
pub mod logging;
pub mod manager;
pub mod timestamp;
pub mod watch;

pub use bus::{
    ChangeBatch, ChangeSubscription, ControlBus, JOB_DONE, JobMode, JobResultSender, JobScript,
    JobVerb, MemoryBus, MemoryCall, SystemdBus, UnitStatus, UnitUpdate,
};
pub use config::{BusConfig, BusKind, Config, ConfigOverrides, OutputFormat, resolve_config};
pub use context::{Context, ContextError};
pub use error::{BusError, UnitError};
pub use manager::{UnitManager, UnitManagerApi};
