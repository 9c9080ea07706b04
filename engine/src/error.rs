//! Errors that halt processing. Recoverable per-call failures are not errors at this level: they
//! are recorded into the [crate::report::ExecutionReport] instead.

use crate::{
    metadata::MetadataError,
    model::{CanonicalKey, ConfigurationId, PackVersionId},
    sandbox::CallFailure,
    store::StoreError,
};

/// A configuration's bindings could not be resolved into runnable packs. Fatal for the table run.
#[derive(Debug, thiserror::Error)]
pub enum PackLoadError {
    #[error("ordinal {ordinal} is used by both {first} and {second}")]
    DuplicateOrdinal {
        ordinal: u32,
        first: CanonicalKey,
        second: CanonicalKey,
    },
    #[error("canonical key {key} is bound more than once")]
    DuplicateKey { key: CanonicalKey },
    #[error("pack version {id} bound to {key} could not be read")]
    Store {
        key: CanonicalKey,
        id: PackVersionId,
        #[source]
        source: StoreError,
    },
    #[error(
        "pack version {id} bound to {key} belongs to configuration {actual}, not {expected}"
    )]
    ForeignConfiguration {
        key: CanonicalKey,
        id: PackVersionId,
        expected: ConfigurationId,
        actual: ConfigurationId,
    },
    #[error("pack version {id} is for canonical key {actual} but is bound to {key}")]
    KeyMismatch {
        key: CanonicalKey,
        id: PackVersionId,
        actual: CanonicalKey,
    },
    #[error("pack version {id} bound to {key} has not been validated")]
    NotValidated { key: CanonicalKey, id: PackVersionId },
    #[error("pack version {id} bound to {key} failed validation: {}", errors.join("; "))]
    ValidationFailed {
        key: CanonicalKey,
        id: PackVersionId,
        errors: Vec<String>,
    },
    #[error("pack version {id} bound to {key} has invalid metadata")]
    Metadata {
        key: CanonicalKey,
        id: PackVersionId,
        #[source]
        source: MetadataError,
    },
    #[error("pack version {id} declares name {declared:?} but is bound to {key}")]
    NameMismatch {
        key: CanonicalKey,
        id: PackVersionId,
        declared: String,
    },
    #[error("pack version {id} bound to {key} does not match its digest")]
    DigestMismatch { key: CanonicalKey, id: PackVersionId },
    #[error("pack version {id} bound to {key} failed to load")]
    Compile {
        key: CanonicalKey,
        id: PackVersionId,
        #[source]
        source: CallFailure,
    },
    #[error("pack version {id} bound to {key} exports no detect_* function")]
    NoDetectors { key: CanonicalKey, id: PackVersionId },
    #[error("could not start the sandbox to load packs: {0:#}")]
    Sandbox(anyhow::Error),
}

/// Errors that abort a table run.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    PackLoad(#[from] PackLoadError),
    /// Systemic failure of the pack execution environment, distinct from per-call failures.
    #[error("pack execution environment failed: {0:#}")]
    Fatal(anyhow::Error),
    #[error("table run was cancelled")]
    Cancelled,
    #[error("invalid input table: {0}")]
    InvalidTable(String),
}

impl EngineError {
    pub(crate) fn fatal<S: Into<String>>(message: S) -> Self {
        EngineError::Fatal(anyhow::anyhow!(message.into()))
    }
}
