//! Column pack execution and merge engine.
//!
//! Physical table columns are mapped onto a configuration's canonical columns by running the
//! detectors of small versioned JavaScript "packs", after which the winning packs normalise each
//! cell and may propose fill-if-empty writes into other canonical columns of the same row.
//!
//! The typical flow is:
//!
//! 1. [registry::validate_pack_version] once per uploaded pack version.
//! 2. [loader::load_packs] to resolve a configuration's column bindings into a [loader::PackSet].
//! 3. [run::Engine::run_table] for every physical table, producing the normalised table and an
//!    [report::ExecutionReport].

pub mod cancel;
pub mod clock;
pub mod config;
pub mod detection;
pub mod digest;
pub mod error;
pub mod loader;
pub mod metadata;
pub mod model;
pub mod registry;
pub mod report;
pub mod run;
pub mod sandbox;
pub mod store;
pub mod table;
pub mod transform;

#[cfg(test)]
mod testutil;

pub use cancel::CancelToken;
pub use config::EngineConfig;
pub use error::{EngineError, PackLoadError};
pub use loader::{LoadedPack, PackSet, load_packs};
pub use model::{CanonicalKey, ColumnBinding, ConfigurationId, PackVersion, PackVersionId};
pub use report::ExecutionReport;
pub use run::{Engine, RunOutput};
pub use table::{OutputTable, PhysicalTable};
