// 🚨 Intake Errors - typed failure categories
// Raised through anyhow::Result and recovered with downcast_ref where callers care

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("could not determine target schema for batch {batch_id}: {detail}")]
    SchemaInference { batch_id: String, detail: String },

    #[error("batch {0} not found in any validation area")]
    BatchNotFound(String),

    #[error("invalid transition for batch {batch_id}: already {status}")]
    InvalidTransition { batch_id: String, status: String },

    #[error("a non-empty reason is required to {0} a batch")]
    MissingReason(String),

    #[error("unknown source profile: {0}")]
    UnknownSource(String),

    #[error("could not decode a reporting period from '{0}'")]
    UnrecognizedPeriod(String),

    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("all extraction strategies failed for {source_name}: {diagnostic}")]
    AllStrategiesFailed {
        source_name: String,
        diagnostic: String,
    },

    #[error("configuration error: {0}")]
    Config(String),
}
