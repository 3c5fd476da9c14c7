//! Status dispatch: narrow the bus-wide change stream to one unit
//!
//! Every call opens its own subscription. The bus already filters by unit,
//! but some systemd versions put unrelated units in the same batch, so each
//! batch is filtered again here before anything is forwarded.
//!
//! Delivery to the caller's channel is a blocking send: a slow consumer
//! stalls the subscription rather than losing updates.

use crate::bus::{ControlBus, UnitUpdate};
use crate::context::Context;
use crate::error::UnitError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Forward status changes of `unit` to `updates` until `ctx` ends.
///
/// This never returns `Ok`: the normal exit is the context's error. A unit
/// that does not exist and a unit that never changes look the same here;
/// both block until the context ends.
///
/// # Errors
///
/// - [`UnitError::MissingChannel`] if `updates` is `None`; the bus is not touched
/// - [`UnitError::Disconnected`] if the bus is down, or goes away mid-watch
/// - [`UnitError::Subscription`] if the change stream cannot be opened
/// - [`UnitError::ReceiverClosed`] if the receiving side of `updates` is dropped
/// - [`UnitError::Cancelled`] / [`UnitError::DeadlineExceeded`] from `ctx`
pub async fn watch_unit<B: ControlBus>(
    bus: &B,
    ctx: &Context,
    unit: &str,
    updates: Option<&mpsc::Sender<UnitUpdate>>,
) -> Result<(), UnitError> {
    let Some(updates) = updates else {
        let err = UnitError::MissingChannel {
            unit: unit.to_string(),
        };
        warn!("{}", err);
        return Err(err);
    };

    if !bus.is_connected() {
        warn!("Cannot watch unit {:?}: systemd D-Bus API unreachable", unit);
        return Err(UnitError::Disconnected {
            unit: unit.to_string(),
        });
    }

    let mut subscription = bus
        .subscribe_changes(&[unit.to_string()])
        .await
        .map_err(|source| UnitError::Subscription {
            unit: unit.to_string(),
            source,
        })?;
    info!("Watching unit {:?} for status changes", unit);

    loop {
        let batch = tokio::select! {
            biased;
            reason = ctx.done() => {
                info!("Stopped watching unit {:?}: {}", unit, reason);
                return Err(reason.into());
            }
            batch = subscription.next() => match batch {
                Some(batch) => batch,
                None => {
                    warn!("Change stream for unit {:?} ended: bus connection closed", unit);
                    return Err(UnitError::Disconnected {
                        unit: unit.to_string(),
                    });
                }
            },
        };

        let Some(update) = batch.get(unit) else {
            debug!("Dropping batch without {:?}: {:?}", unit, batch.keys().collect::<Vec<_>>());
            continue;
        };

        debug!(
            "Unit {:?} changed: {}",
            unit,
            update.as_ref().map_or("unloaded", |s| s.active_state.as_str())
        );

        tokio::select! {
            biased;
            reason = ctx.done() => {
                info!("Stopped watching unit {:?}: {}", unit, reason);
                return Err(reason.into());
            }
            sent = updates.send(update.clone()) => {
                if sent.is_err() {
                    warn!("Receiver for unit {:?} status changes dropped", unit);
                    return Err(UnitError::ReceiverClosed {
                        unit: unit.to_string(),
                    });
                }
            }
        }
    }
}
