//! Job correlation: turn an asynchronously completed job into a
//! synchronous, cancellable call
//!
//! Each call creates a single-slot result channel before submitting, so the
//! daemon's completion is never lost, then races that channel against the
//! caller's context. When the context wins the job keeps running on the
//! daemon side; no cancel-job call is made.

use crate::bus::{ControlBus, JOB_DONE, JobMode, JobVerb};
use crate::context::Context;
use crate::error::UnitError;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Drive one start/stop/restart job for `unit` to completion.
///
/// # Errors
///
/// - [`UnitError::Disconnected`] before any bus call if the bus is down
/// - [`UnitError::JobSubmission`] if the bus rejects the job request
/// - [`UnitError::JobFailed`] if the job finishes with a result other than `done`
/// - [`UnitError::JobAbandoned`] if the result signal is dropped unanswered
/// - [`UnitError::Cancelled`] / [`UnitError::DeadlineExceeded`] from `ctx`
pub async fn run_job<B: ControlBus>(
    bus: &B,
    ctx: &Context,
    unit: &str,
    verb: JobVerb,
) -> Result<(), UnitError> {
    if !bus.is_connected() {
        warn!("Cannot {} unit {:?}: systemd D-Bus API unreachable", verb, unit);
        return Err(UnitError::Disconnected {
            unit: unit.to_string(),
        });
    }

    if verb == JobVerb::Restart {
        // Picks up on-disk unit-file changes. Reloading a unit that is not
        // running fails, which is expected and never reported.
        if let Err(e) = bus.reload_job(unit, JobMode::Replace).await {
            debug!("Ignoring reload failure for {:?} before restart: {}", unit, e);
        }
    }

    let (result_tx, result_rx) = oneshot::channel();
    let job = bus
        .submit_job(unit, verb, JobMode::Replace, result_tx)
        .await
        .map_err(|source| {
            let err = UnitError::JobSubmission {
                unit: unit.to_string(),
                verb,
                source,
            };
            warn!("{}", err);
            err
        })?;
    debug!("Waiting on {} job {} for {:?}", verb, job, unit);

    tokio::select! {
        biased;
        reason = ctx.done() => {
            let err = UnitError::from(reason);
            warn!("Stopped waiting on {} job {} for {:?}: {}", verb, job, unit, err);
            Err(err)
        }
        result = result_rx => match result {
            Ok(token) if token == JOB_DONE => {
                info!("Successfully {} unit {:?}", past_tense(verb), unit);
                Ok(())
            }
            Ok(token) => {
                let err = UnitError::JobFailed {
                    unit: unit.to_string(),
                    verb,
                    result: token,
                };
                warn!("{}", err);
                Err(err)
            }
            Err(_) => {
                let err = UnitError::JobAbandoned {
                    unit: unit.to_string(),
                    verb,
                };
                warn!("{}", err);
                Err(err)
            }
        },
    }
}

fn past_tense(verb: JobVerb) -> &'static str {
    match verb {
        JobVerb::Start => "started",
        JobVerb::Stop => "stopped",
        JobVerb::Restart => "restarted",
        JobVerb::Reload => "reloaded",
    }
}
