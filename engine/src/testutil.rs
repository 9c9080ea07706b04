use std::sync::Arc;

use anyhow::{Result, anyhow};
use hashbrown::HashMap;
use serde_json::Value;

use crate::{
    clock::{Clock, FixedClock},
    loader::{CanonicalColumn, LoadedPack},
    model::{CanonicalKey, ConfigurationId, PackVersion, PackVersionId},
    sandbox::{CallOutcome, EntryPoint, PackInvoker, PackManifest, pool::PackSource},
    store::{MemoryPackStore, PackRegistry, PackStore},
};

pub fn key(s: &str) -> CanonicalKey {
    CanonicalKey::try_from(s).expect("valid canonical key")
}

/// A [LoadedPack] without code, for use with [ScriptedInvoker].
pub fn loaded_pack(canonical_key: &str, detectors: &[&str], has_transform: bool) -> LoadedPack {
    LoadedPack {
        canonical_key: key(canonical_key),
        version_id: PackVersionId::from(format!("test/{canonical_key}@1")),
        label: None,
        params: Value::Null,
        source: PackSource {
            resource_name: format!("{canonical_key}.js"),
            code: Arc::from(""),
            manifest: PackManifest {
                has_setup: false,
                detectors: detectors.iter().map(|name| name.to_string()).collect(),
                has_transform,
            },
        },
    }
}

pub fn canonical_column(canonical_key: &str, pack: Option<usize>) -> CanonicalColumn {
    CanonicalColumn {
        canonical_key: key(canonical_key),
        label: None,
        pack,
    }
}

/// Uploads `code` and records it as validated without running the validator.
pub fn validated_version(
    store: &mut MemoryPackStore,
    configuration_id: &ConfigurationId,
    canonical_key: &str,
    code: &str,
) -> Result<PackVersion> {
    let clock = FixedClock::at_unix_seconds(1_700_000_000);
    let version = store.upload(configuration_id, &key(canonical_key), code.to_string())?;
    store.record_validation(&version.id, Some(clock.now()), Vec::new())?;
    Ok(store.get(&version.id)?)
}

type Script = Box<dyn FnMut(&Value) -> CallOutcome + Send>;

/// Fake [PackInvoker] answering each `(pack, entry point)` with a closure, and logging every call.
#[derive(Default)]
pub struct ScriptedInvoker {
    scripts: HashMap<(usize, EntryPoint), Script>,
    calls: Vec<(usize, EntryPoint, Value)>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, pack: usize, entry: EntryPoint, script: F) -> Self
    where
        F: FnMut(&Value) -> CallOutcome + Send + 'static,
    {
        self.scripts.insert((pack, entry), Box::new(script));
        self
    }

    pub fn calls(&self) -> &[(usize, EntryPoint, Value)] {
        &self.calls
    }
}

impl PackInvoker for ScriptedInvoker {
    fn invoke(&mut self, pack: usize, entry: EntryPoint, input: &Value) -> Result<CallOutcome> {
        self.calls.push((pack, entry, input.clone()));
        let script = self
            .scripts
            .get_mut(&(pack, entry))
            .ok_or_else(|| anyhow!("no script for {entry:?} of pack {pack}"))?;
        Ok(script(input))
    }
}
