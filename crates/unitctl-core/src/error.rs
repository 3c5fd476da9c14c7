//! Error taxonomy for unit operations

use crate::bus::JobVerb;
use crate::context::ContextError;
use thiserror::Error;

/// Opaque failure reported by a [`ControlBus`](crate::bus::ControlBus)
/// implementation.
pub type BusError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned by [`UnitManager`](crate::UnitManager) operations.
///
/// None of these are retried internally; retry policy belongs to the caller.
#[derive(Debug, Error)]
pub enum UnitError {
    /// The bus handle is not connected. Checked before any bus call.
    #[error("cannot reach unit {unit:?}: systemd D-Bus API client is disconnected")]
    Disconnected { unit: String },

    /// `watch` was called without an output channel.
    #[error("a channel is required to watch unit {unit:?} status changes")]
    MissingChannel { unit: String },

    /// The bus rejected the job request itself.
    #[error("failed to {verb} unit {unit:?}: {source}")]
    JobSubmission {
        unit: String,
        verb: JobVerb,
        #[source]
        source: BusError,
    },

    /// The job completed with a result other than `done`.
    #[error("failed to {verb} unit {unit:?} with result {result:?}")]
    JobFailed {
        unit: String,
        verb: JobVerb,
        result: String,
    },

    /// The bus dropped the job's result signal without delivering a token,
    /// which only happens when the connection goes away mid-job.
    #[error("{verb} job for unit {unit:?} ended without a result")]
    JobAbandoned { unit: String, verb: JobVerb },

    /// A unit's timestamp property was not a base-10 microsecond count.
    #[error("malformed timestamp {value:?} for unit {unit:?}: {reason}")]
    MalformedTimestamp {
        unit: String,
        value: String,
        reason: String,
    },

    /// The bus rejected a property lookup.
    #[error("failed to retrieve property {property:?} for unit {unit:?}: {source}")]
    Property {
        unit: String,
        property: String,
        #[source]
        source: BusError,
    },

    /// The change stream could not be opened.
    #[error("failed to subscribe to status changes of unit {unit:?}: {source}")]
    Subscription {
        unit: String,
        #[source]
        source: BusError,
    },

    /// The receiving side of a watch channel was dropped.
    #[error("receiver for unit {unit:?} status changes was dropped")]
    ReceiverClosed { unit: String },

    /// Propagated from the caller's context.
    #[error("context canceled")]
    Cancelled,

    /// Propagated from the caller's context.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// Opening the bus connection failed.
    #[error("failed to set up systemd D-Bus connection: {source}")]
    Connect {
        #[source]
        source: BusError,
    },

    /// Linking or unlinking a unit file failed.
    #[error("failed to {action} unit file {target:?}: {message}")]
    UnitFile {
        action: &'static str,
        target: String,
        message: String,
        #[source]
        source: Option<BusError>,
    },
}

impl UnitError {
    /// Whether this error came from the caller's context rather than the bus.
    pub fn is_context(&self) -> bool {
        matches!(self, UnitError::Cancelled | UnitError::DeadlineExceeded)
    }

    /// Unit name carried by the error, if any.
    pub fn unit(&self) -> Option<&str> {
        match self {
            UnitError::Disconnected { unit }
            | UnitError::MissingChannel { unit }
            | UnitError::MalformedTimestamp { unit, .. }
            | UnitError::JobSubmission { unit, .. }
            | UnitError::JobFailed { unit, .. }
            | UnitError::JobAbandoned { unit, .. }
            | UnitError::Property { unit, .. }
            | UnitError::Subscription { unit, .. }
            | UnitError::ReceiverClosed { unit } => Some(unit),
            UnitError::UnitFile { target, .. } => Some(target),
            _ => None,
        }
    }
}

impl From<ContextError> for UnitError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => UnitError::Cancelled,
            ContextError::DeadlineExceeded => UnitError::DeadlineExceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_failed_carries_unit_and_result() {
        let err = UnitError::JobFailed {
            unit: "dummy.service".to_string(),
            verb: JobVerb::Start,
            result: "dependency".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to start unit \"dummy.service\" with result \"dependency\""
        );
        assert_eq!(err.unit(), Some("dummy.service"));
        assert!(!err.is_context());
    }

    #[test]
    fn test_context_errors_convert() {
        assert!(matches!(
            UnitError::from(ContextError::Cancelled),
            UnitError::Cancelled
        ));
        assert!(UnitError::from(ContextError::DeadlineExceeded).is_context());
    }

    #[test]
    fn test_disconnected_and_timestamp_errors_name_the_unit() {
        let err = UnitError::Disconnected {
            unit: "dummy.service".to_string(),
        };
        assert_eq!(err.unit(), Some("dummy.service"));
        assert!(err.to_string().contains("dummy.service"));

        let err = UnitError::MalformedTimestamp {
            unit: "dummy.service".to_string(),
            value: "soon".to_string(),
            reason: "invalid digit found in string".to_string(),
        };
        assert_eq!(err.unit(), Some("dummy.service"));
        assert_eq!(
            err.to_string(),
            "malformed timestamp \"soon\" for unit \"dummy.service\": invalid digit found in string"
        );
    }
}
