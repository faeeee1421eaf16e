use thiserror::Error;

/// Why a single raw interval could not be turned into an attendance record.
#[derive(Debug, Error)]
pub enum IntervalError {
    #[error("{origin}: missing required field `{field}`")]
    MissingField { origin: String, field: &'static str },

    #[error("{origin}: invalid timestamp `{value}` in `{field}`")]
    InvalidTimestamp {
        origin: String,
        field: &'static str,
        value: String,
    },

    #[error("{origin}: meeting {external_id} is unknown and has no schedule to create it from")]
    MissingSchedule { origin: String, external_id: String },

    #[error("{origin}: {action} failed: {source}")]
    Store {
        origin: String,
        action: &'static str,
        #[source]
        source: anyhow::Error,
    },
}
