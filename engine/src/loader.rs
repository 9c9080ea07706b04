//! Resolution of a configuration's column bindings into runnable packs.

use std::{collections::BTreeMap, sync::Arc};

use serde_json::Value;

use crate::{
    digest,
    error::PackLoadError,
    metadata,
    model::{CanonicalKey, ColumnBinding, ConfigurationId, PackVersion, PackVersionId},
    sandbox::{PackManifest, SandboxSettings, pool::PackSource, pool::with_scratch_sandbox},
    store::PackStore,
};

/// An enabled canonical column of the configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CanonicalColumn {
    pub canonical_key: CanonicalKey,
    pub label: Option<String>,
    /// Index into [PackSet::packs] of the column's pack, if it has one.
    pub pack: Option<usize>,
}

/// A pack version that passed every load check and whose entry points are known.
#[derive(Clone, Debug)]
pub struct LoadedPack {
    pub canonical_key: CanonicalKey,
    pub version_id: PackVersionId,
    pub label: Option<String>,
    /// The binding's parameters, passed to every call.
    pub params: Value,
    pub source: PackSource,
}

impl LoadedPack {
    pub fn manifest(&self) -> &PackManifest {
        &self.source.manifest
    }
}

/// The packs of one configuration, ready to run against any number of tables.
#[derive(Clone, Debug)]
pub struct PackSet {
    pub configuration_id: ConfigurationId,
    /// Enabled bindings in ordinal order. These are the output columns.
    pub columns: Vec<CanonicalColumn>,
    /// In the same order as the columns that reference them.
    pub packs: Vec<LoadedPack>,
}

impl PackSet {
    /// Labels of the keys that own a loaded pack. Only these keys can win a physical column.
    pub fn selectable_keys(&self) -> BTreeMap<CanonicalKey, Option<String>> {
        self.packs
            .iter()
            .map(|pack| (pack.canonical_key.clone(), pack.label.clone()))
            .collect()
    }

    pub fn sources(&self) -> Vec<PackSource> {
        self.packs.iter().map(|pack| pack.source.clone()).collect()
    }
}

/// Resolves `bindings` of `configuration_id` into a [PackSet].
///
/// Disabled bindings and bindings without a pack version are skipped without reading the store.
/// Every bound version must belong to the configuration and the binding's key, have passed
/// validation, match its digest and declare the key as its name. Each pack's top level code is
/// then run once in a scratch sandbox to discover its entry points.
pub fn load_packs(
    store: &dyn PackStore,
    configuration_id: &ConfigurationId,
    bindings: &[ColumnBinding],
    settings: &SandboxSettings,
) -> Result<PackSet, PackLoadError> {
    check_bindings(bindings)?;

    let mut enabled: Vec<&ColumnBinding> = bindings.iter().filter(|b| b.enabled).collect();
    enabled.sort_by_key(|binding| binding.ordinal);

    let mut columns = Vec::with_capacity(enabled.len());
    let mut versions: Vec<(&ColumnBinding, PackVersion)> = Vec::new();
    for binding in enabled {
        let pack = match &binding.script_version_id {
            Some(id) => {
                let version = fetch_checked(store, configuration_id, binding, id)?;
                versions.push((binding, version));
                Some(versions.len() - 1)
            }
            None => None,
        };
        columns.push(CanonicalColumn {
            canonical_key: binding.canonical_key.clone(),
            label: binding.label.clone(),
            pack,
        });
    }

    let manifests = compile_all(&versions, settings)?;

    let packs = versions
        .into_iter()
        .zip(manifests)
        .map(|((binding, version), manifest)| LoadedPack {
            canonical_key: binding.canonical_key.clone(),
            label: binding.label.clone(),
            params: binding.params.clone(),
            source: PackSource {
                resource_name: version.id.to_string(),
                code: Arc::from(version.code),
                manifest,
            },
            version_id: version.id,
        })
        .collect::<Vec<_>>();

    log::info!(
        "Loaded {} packs for {} canonical columns of configuration {configuration_id}.",
        packs.len(),
        columns.len(),
    );
    Ok(PackSet {
        configuration_id: configuration_id.clone(),
        columns,
        packs,
    })
}

/// Ordinals and canonical keys must be unique across all bindings, enabled or not.
fn check_bindings(bindings: &[ColumnBinding]) -> Result<(), PackLoadError> {
    let mut ordinals: BTreeMap<u32, &CanonicalKey> = BTreeMap::new();
    let mut keys: Vec<&CanonicalKey> = Vec::with_capacity(bindings.len());
    for binding in bindings {
        if let Some(first) = ordinals.insert(binding.ordinal, &binding.canonical_key) {
            return Err(PackLoadError::DuplicateOrdinal {
                ordinal: binding.ordinal,
                first: first.clone(),
                second: binding.canonical_key.clone(),
            });
        }
        if keys.contains(&&binding.canonical_key) {
            return Err(PackLoadError::DuplicateKey {
                key: binding.canonical_key.clone(),
            });
        }
        keys.push(&binding.canonical_key);
    }
    Ok(())
}

fn fetch_checked(
    store: &dyn PackStore,
    configuration_id: &ConfigurationId,
    binding: &ColumnBinding,
    id: &PackVersionId,
) -> Result<PackVersion, PackLoadError> {
    let key = &binding.canonical_key;
    let version = store.get(id).map_err(|source| PackLoadError::Store {
        key: key.clone(),
        id: id.clone(),
        source,
    })?;

    if &version.configuration_id != configuration_id {
        return Err(PackLoadError::ForeignConfiguration {
            key: key.clone(),
            id: id.clone(),
            expected: configuration_id.clone(),
            actual: version.configuration_id,
        });
    }
    if &version.canonical_key != key {
        return Err(PackLoadError::KeyMismatch {
            key: key.clone(),
            id: id.clone(),
            actual: version.canonical_key,
        });
    }
    if !version.validation_errors.is_empty() {
        return Err(PackLoadError::ValidationFailed {
            key: key.clone(),
            id: id.clone(),
            errors: version.validation_errors,
        });
    }
    if version.validated_at.is_none() {
        return Err(PackLoadError::NotValidated {
            key: key.clone(),
            id: id.clone(),
        });
    }
    if !digest::digest_matches(&version.code, &version.digest).unwrap_or(false) {
        return Err(PackLoadError::DigestMismatch {
            key: key.clone(),
            id: id.clone(),
        });
    }

    let metadata =
        metadata::parse_metadata(&version.code).map_err(|source| PackLoadError::Metadata {
            key: key.clone(),
            id: id.clone(),
            source,
        })?;
    if metadata.name != key.as_str() {
        return Err(PackLoadError::NameMismatch {
            key: key.clone(),
            id: id.clone(),
            declared: metadata.name,
        });
    }

    Ok(version)
}

fn compile_all(
    versions: &[(&ColumnBinding, PackVersion)],
    settings: &SandboxSettings,
) -> Result<Vec<PackManifest>, PackLoadError> {
    if versions.is_empty() {
        return Ok(Vec::new());
    }

    let outcomes = with_scratch_sandbox(settings, |sandbox| {
        versions
            .iter()
            .map(|(_, version)| sandbox.load(version.id.as_str(), &version.code))
            .collect::<anyhow::Result<Vec<_>>>()
    })
    .map_err(PackLoadError::Sandbox)?;

    versions
        .iter()
        .zip(outcomes)
        .map(|((binding, version), outcome)| {
            let manifest = outcome.map_err(|source| PackLoadError::Compile {
                key: binding.canonical_key.clone(),
                id: version.id.clone(),
                source,
            })?;
            if manifest.detectors.is_empty() {
                return Err(PackLoadError::NoDetectors {
                    key: binding.canonical_key.clone(),
                    id: version.id.clone(),
                });
            }
            log::debug!("Pack {} exports {manifest:?}.", version.id);
            Ok(manifest)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::{
        clock::{Clock, FixedClock},
        store::{MemoryPackStore, MockPackStore, PackRegistry, StoreError},
        testutil::{key, validated_version},
    };

    const NAME_PACK: &str = concat!(
        "/**\n * @name full_name\n * @version 1\n */\n",
        "function setup() { return {}; }\n",
        "function detect_b() { return null; }\n",
        "function detect_a() { return null; }\n",
    );

    fn config() -> ConfigurationId {
        ConfigurationId::try_from("contacts").expect("valid id")
    }

    fn binding(k: &str, ordinal: u32) -> ColumnBinding {
        ColumnBinding::new(key(k), ordinal)
    }

    #[gtest]
    fn test_loads_enabled_bindings_in_ordinal_order() -> anyhow::Result<()> {
        v8wrapper::init_v8_for_testing();
        let mut store = MemoryPackStore::new();
        let version = validated_version(&mut store, &config(), "full_name", NAME_PACK)?;

        let mut disabled = binding("phone", 0).with_pack(PackVersionId::from("never/read@1"));
        disabled.enabled = false;
        let bindings = vec![
            binding("full_name", 2)
                .with_label("Name")
                .with_pack(version.id.clone())
                .with_params(json!({"locale": "en"})),
            binding("email", 1),
            disabled,
        ];

        let pack_set = load_packs(&store, &config(), &bindings, &SandboxSettings::default())?;

        expect_that!(
            pack_set.columns,
            elements_are![
                eq(&CanonicalColumn {
                    canonical_key: key("email"),
                    label: None,
                    pack: None,
                }),
                eq(&CanonicalColumn {
                    canonical_key: key("full_name"),
                    label: Some("Name".to_string()),
                    pack: Some(0),
                }),
            ]
        );
        expect_that!(pack_set.packs.len(), eq(1));
        let pack = &pack_set.packs[0];
        expect_that!(
            pack.manifest().detectors,
            elements_are![eq("detect_a"), eq("detect_b")]
        );
        expect_that!(pack.manifest().has_setup, eq(true));
        expect_that!(pack.params, eq(&json!({"locale": "en"})));
        expect_that!(
            pack_set.selectable_keys(),
            eq(&BTreeMap::from([(key("full_name"), Some("Name".to_string()))]))
        );
        Ok(())
    }

    #[gtest]
    fn test_rejects_duplicate_ordinals_and_keys() {
        let store = MockPackStore::new();

        expect_that!(
            load_packs(
                &store,
                &config(),
                &[binding("email", 1), binding("phone", 1)],
                &SandboxSettings::default(),
            ),
            err(matches_pattern!(PackLoadError::DuplicateOrdinal { ordinal: eq(&1), .. }))
        );
        expect_that!(
            load_packs(
                &store,
                &config(),
                &[binding("email", 1), binding("email", 2)],
                &SandboxSettings::default(),
            ),
            err(matches_pattern!(PackLoadError::DuplicateKey { .. }))
        );
    }

    #[gtest]
    fn test_store_failure_is_a_load_error() {
        let mut store = MockPackStore::new();
        store
            .expect_get()
            .returning(|id| Err(StoreError::UnknownVersion(id.clone())));

        expect_that!(
            load_packs(
                &store,
                &config(),
                &[binding("email", 1).with_pack(PackVersionId::from("contacts/email@9"))],
                &SandboxSettings::default(),
            ),
            err(matches_pattern!(PackLoadError::Store { .. }))
        );
    }

    #[gtest]
    fn test_rejects_versions_that_fail_checks() -> anyhow::Result<()> {
        let clock = FixedClock::at_unix_seconds(1_700_000_000);
        let mut store = MemoryPackStore::new();
        let other_config = ConfigurationId::try_from("other")?;

        let unvalidated = store.upload(&config(), &key("full_name"), NAME_PACK.to_string())?;
        let failed = store.upload(&config(), &key("full_name"), NAME_PACK.to_string())?;
        store.record_validation(&failed.id, None, vec!["no detector".to_string()])?;
        let foreign = validated_version(&mut store, &other_config, "full_name", NAME_PACK)?;
        let misnamed = validated_version(&mut store, &config(), "email", NAME_PACK)?;
        let tampered = validated_version(&mut store, &config(), "full_name", NAME_PACK)?;
        let mut tampered = store.get(&tampered.id)?;
        tampered.code.push_str("\nfunction detect_c() {}");
        tampered.id = PackVersionId::from("contacts/full_name@99");
        store.insert(tampered.clone())?;
        store.record_validation(&tampered.id, Some(clock.now()), Vec::new())?;

        let load = |k: &str, id: &PackVersionId| {
            load_packs(
                &store,
                &config(),
                &[binding(k, 1).with_pack(id.clone())],
                &SandboxSettings::default(),
            )
        };

        expect_that!(
            load("full_name", &unvalidated.id),
            err(matches_pattern!(PackLoadError::NotValidated { .. }))
        );
        expect_that!(
            load("full_name", &failed.id),
            err(matches_pattern!(PackLoadError::ValidationFailed { .. }))
        );
        expect_that!(
            load("full_name", &foreign.id),
            err(matches_pattern!(PackLoadError::ForeignConfiguration { .. }))
        );
        expect_that!(
            load("full_name", &misnamed.id),
            err(matches_pattern!(PackLoadError::KeyMismatch { .. }))
        );
        expect_that!(
            load("email", &misnamed.id),
            err(matches_pattern!(PackLoadError::NameMismatch { .. }))
        );
        expect_that!(
            load("full_name", &tampered.id),
            err(matches_pattern!(PackLoadError::DigestMismatch { .. }))
        );
        Ok(())
    }

    #[gtest]
    fn test_code_that_fails_to_load() -> anyhow::Result<()> {
        v8wrapper::init_v8_for_testing();
        let mut store = MemoryPackStore::new();
        let broken = validated_version(
            &mut store,
            &config(),
            "full_name",
            "/**\n * @name full_name\n * @version 1\n */\nfunction detect_a( {",
        )?;
        let no_detectors = validated_version(
            &mut store,
            &config(),
            "full_name",
            "/**\n * @name full_name\n * @version 1\n */\nvar detect_a = 1;",
        )?;

        expect_that!(
            load_packs(
                &store,
                &config(),
                &[binding("full_name", 1).with_pack(broken.id)],
                &SandboxSettings::default(),
            ),
            err(matches_pattern!(PackLoadError::Compile { .. }))
        );
        expect_that!(
            load_packs(
                &store,
                &config(),
                &[binding("full_name", 1).with_pack(no_detectors.id)],
                &SandboxSettings::default(),
            ),
            err(matches_pattern!(PackLoadError::NoDetectors { .. }))
        );
        Ok(())
    }
}
