use relay_common::record::{FieldType, Record};
use thiserror::Error;

/// Enumeration of errors that prevent a pipeline from starting.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("no webhook URL found in the configuration source or in the pipeline settings")]
    NoDestination,
    #[error("error parsing webhook url")]
    InvalidUrl(#[source] url::ParseError),
    #[error("webhook url must use http or https, got {0}")]
    UnsupportedScheme(String),
    #[error("record schema has no fields")]
    EmptySchema,
    #[error("no record field provides the message text")]
    NoTextField,
    #[error("field {field:?} mapped to {key:?} is not part of the record schema")]
    UnknownField { key: &'static str, field: String },
    #[error("field {field:?} mapped to {key:?} is of type {found}, expected string")]
    FieldNotText {
        key: &'static str,
        field: String,
        found: FieldType,
    },
    #[error("failed to construct http client")]
    HttpClient(#[from] reqwest::Error),
}

/// Enumeration of reasons a record cannot be turned into a webhook payload.
/// Any of these makes the record undeliverable, so it is dropped.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("record has no value for field {field:?} mapped to {key:?}")]
    MissingValue { key: &'static str, field: String },
    #[error("record value for field {field:?} mapped to {key:?} is not a string")]
    NotText { key: &'static str, field: String },
    #[error("record does not hold a JSON object")]
    InvalidJson(#[source] serde_json::Error),
    #[error("failed to serialize webhook payload")]
    Serialize(#[source] serde_json::Error),
}

/// Enumeration of reasons a record is refused by the delivery queue.
/// The record is handed back so the producer can decide what to do with it.
#[derive(Error, Debug)]
pub enum EnqueueError {
    #[error("delivery queue is full ({capacity} items)")]
    QueueFull { capacity: usize, record: Record },
    #[error("pipeline is stopped")]
    Stopped(Record),
}

impl EnqueueError {
    pub fn into_record(self) -> Record {
        match self {
            EnqueueError::QueueFull { record, .. } | EnqueueError::Stopped(record) => record,
        }
    }
}

/// Enumeration of errors that end the relay-worker process.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid environment configuration")]
    Environment(#[from] envconfig::Error),
    #[error("pipeline failed to start")]
    Configuration(#[from] ConfigurationError),
    #[error("failed to install metrics recorder")]
    Metrics(#[from] relay_common::metrics::BuildError),
    #[error("failed to read records")]
    Input(#[from] std::io::Error),
}
