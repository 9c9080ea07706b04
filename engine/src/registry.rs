//! One-time validation of uploaded pack versions.
//!
//! Validation is the only way a version gains `validated_at`, which the loader requires.

use anyhow::Result;
use serde::Serialize;
use serde_json::{Value, json};

use crate::{
    clock::{Clock, Timestamp},
    detection::{detector_input, parse_detector_return},
    digest,
    metadata,
    model::{PackVersion, PackVersionId},
    sandbox::{EntryPoint, PackInvoker, PackManifest, SandboxSettings, pool::with_scratch_sandbox},
    store::PackRegistry,
    table::PhysicalTable,
    transform::{cell_input, parse_transform_return},
};

/// Result of validating one pack version.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ValidationOutcome {
    /// Set only when there are no errors.
    pub validated_at: Option<Timestamp>,
    pub errors: Vec<String>,
    /// Entry points, if the code loaded.
    pub manifest: Option<PackManifest>,
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A small table that every detector and transform must cope with.
fn dry_run_table() -> PhysicalTable {
    PhysicalTable::new(
        "Validation",
        ["Sample"],
        [["Smith, John"], ["42"], [""]],
    )
}

fn declares_detector(code: &str) -> bool {
    lazy_regex::regex_is_match!(
        r"(?m)^\s*(?:async\s+)?(?:function\s*\*?\s*detect_\w+\s*\(|(?:var|let|const)\s+detect_\w+\s*=)",
        code
    )
}

/// Validates `version`: its metadata, the declaration of at least one detector and a dry run of
/// `setup`, the first detector and `transform_cell` in a scratch sandbox.
///
/// Problems with the pack are collected into the outcome. Only failures of the execution
/// environment are errors.
pub fn validate_pack_version(
    version: &PackVersion,
    settings: &SandboxSettings,
    clock: &dyn Clock,
) -> Result<ValidationOutcome> {
    let mut errors = Vec::new();

    match metadata::parse_metadata(&version.code) {
        Ok(metadata) if metadata.name != version.canonical_key.as_str() => errors.push(format!(
            "declared name {:?} does not match canonical key {}",
            metadata.name, version.canonical_key,
        )),
        Ok(_) => {}
        Err(err) => errors.push(err.to_string()),
    }
    if !digest::digest_matches(&version.code, &version.digest)? {
        errors.push("code does not match its digest".to_string());
    }
    if !declares_detector(&version.code) {
        errors.push("no detect_* function is declared".to_string());
    }

    let (manifest, dry_run_errors) = with_scratch_sandbox(settings, |sandbox| {
        dry_run(sandbox, version)
    })?;
    errors.extend(dry_run_errors);

    let validated_at = errors.is_empty().then(|| clock.now());
    if errors.is_empty() {
        log::info!("Pack version {} is valid.", version.id);
    } else {
        log::warn!(
            "Pack version {} failed validation: {}",
            version.id,
            errors.join("; ")
        );
    }
    Ok(ValidationOutcome {
        validated_at,
        errors,
        manifest,
    })
}

fn dry_run(
    sandbox: &mut crate::sandbox::PackSandbox,
    version: &PackVersion,
) -> Result<(Option<PackManifest>, Vec<String>)> {
    let mut errors = Vec::new();
    let manifest = match sandbox.load(version.id.as_str(), &version.code)? {
        Ok(manifest) => manifest,
        Err(failure) => {
            errors.push(format!("loading failed: {failure}"));
            return Ok((None, errors));
        }
    };
    if manifest.detectors.is_empty() {
        errors.push("no detect_* function is exported".to_string());
    }

    let pack = 0;
    let params = json!({});
    let context = json!({});
    let state = if manifest.has_setup {
        match sandbox.invoke(pack, EntryPoint::Setup, &json!({"params": params, "context": context}))? {
            Ok(state) => state,
            Err(failure) => {
                errors.push(format!("setup failed: {failure}"));
                return Ok((Some(manifest), errors));
            }
        }
    } else {
        Value::Null
    };

    let table = dry_run_table();
    if let Some(name) = manifest.detectors.first() {
        let values = table.column_values(0, None);
        let input = detector_input(&table, 0, &values, &state, &params, &context);
        let outcome = sandbox
            .invoke(pack, EntryPoint::Detector(0), &input)?
            .map_err(|failure| failure.to_string())
            .and_then(|value| parse_detector_return(value, &version.canonical_key));
        if let Err(message) = outcome {
            errors.push(format!("{name} failed the dry run: {message}"));
        }
    }

    if manifest.has_transform {
        for row in 0..table.rows.len() {
            let input = cell_input(&table, row, 0, &state, &params, &context);
            let outcome = sandbox
                .invoke(pack, EntryPoint::Transform, &input)?
                .map_err(|failure| failure.to_string())
                .and_then(|value| parse_transform_return(value, &version.canonical_key));
            if let Err(message) = outcome {
                errors.push(format!("transform_cell failed the dry run on row {row}: {message}"));
                break;
            }
        }
    }

    Ok((Some(manifest), errors))
}

/// Validates the stored version `id` and records the outcome in `registry`.
pub fn validate_and_record(
    registry: &mut dyn PackRegistry,
    id: &PackVersionId,
    settings: &SandboxSettings,
    clock: &dyn Clock,
) -> Result<ValidationOutcome> {
    let version = registry.get(id)?;
    let outcome = validate_pack_version(&version, settings, clock)?;
    registry.record_validation(id, outcome.validated_at, outcome.errors.clone())?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;

    use testutils::anyhow_downcasts_to;

    use super::*;
    use crate::{
        clock::FixedClock,
        model::ConfigurationId,
        store::{MemoryPackStore, PackStore, StoreError},
        testutil::key,
    };

    const VALID: &str = r#"/**
 * @name full_name
 * @version 2.1
 * @description Joins "Last, First" names.
 */
function setup(input) {
  return { separator: ", " };
}

function detect_comma(input) {
  return { self: input.values.filter((v) => v.includes(input.state.separator)).length };
}

function transform_cell(input) {
  const parts = input.value.split(input.state.separator);
  if (parts.length !== 2) {
    return {};
  }
  return { self: parts[1] + " " + parts[0], first_name: parts[1], last_name: parts[0] };
}
"#;

    fn upload(store: &mut MemoryPackStore, k: &str, code: &str) -> anyhow::Result<PackVersionId> {
        Ok(store
            .upload(&ConfigurationId::try_from("contacts")?, &key(k), code.to_string())?
            .id)
    }

    #[gtest]
    fn test_valid_pack_is_recorded() -> anyhow::Result<()> {
        v8wrapper::init_v8_for_testing();
        let clock = FixedClock::at_unix_seconds(1_700_000_000);
        let mut store = MemoryPackStore::new();
        let id = upload(&mut store, "full_name", VALID)?;

        let outcome = validate_and_record(&mut store, &id, &SandboxSettings::default(), &clock)?;

        expect_that!(outcome.errors, is_empty());
        expect_that!(outcome.validated_at, some(eq(clock.now())));
        expect_that!(
            outcome.manifest,
            some(field!(PackManifest.detectors, elements_are![eq("detect_comma")]))
        );
        expect_that!(store.get(&id)?.is_validated(), eq(true));
        Ok(())
    }

    #[gtest]
    fn test_name_mismatch_and_missing_detector() -> anyhow::Result<()> {
        v8wrapper::init_v8_for_testing();
        let clock = FixedClock::at_unix_seconds(1_700_000_000);
        let mut store = MemoryPackStore::new();
        let id = upload(
            &mut store,
            "email",
            "/**\n * @name full_name\n * @version 1\n */\nfunction transform_cell() { return {}; }\n",
        )?;

        let outcome = validate_and_record(&mut store, &id, &SandboxSettings::default(), &clock)?;

        expect_that!(
            outcome.errors,
            elements_are![
                contains_substring("does not match canonical key email"),
                contains_substring("no detect_* function is declared"),
                contains_substring("no detect_* function is exported"),
            ]
        );
        expect_that!(outcome.validated_at, none());
        let stored = store.get(&id)?;
        expect_that!(stored.is_validated(), eq(false));
        expect_that!(stored.validation_errors.len(), eq(3));
        Ok(())
    }

    #[gtest]
    fn test_dry_run_catches_bad_return_shapes() -> anyhow::Result<()> {
        v8wrapper::init_v8_for_testing();
        let clock = FixedClock::at_unix_seconds(1_700_000_000);
        let mut store = MemoryPackStore::new();
        let id = upload(
            &mut store,
            "amount",
            concat!(
                "/**\n * @name amount\n * @version 1\n */\n",
                "function detect_number(input) { return { self: 'lots' }; }\n",
                "function transform_cell(input) { return input.value.trim(); }\n",
            ),
        )?;

        let outcome = validate_and_record(&mut store, &id, &SandboxSettings::default(), &clock)?;

        expect_that!(
            outcome.errors,
            elements_are![
                contains_substring("detect_number failed the dry run"),
                contains_substring("transform_cell failed the dry run on row 0"),
            ]
        );
        Ok(())
    }

    #[gtest]
    fn test_failing_setup_is_reported() -> anyhow::Result<()> {
        v8wrapper::init_v8_for_testing();
        let clock = FixedClock::at_unix_seconds(1_700_000_000);
        let mut store = MemoryPackStore::new();
        let id = upload(
            &mut store,
            "amount",
            concat!(
                "/**\n * @name amount\n * @version 1\n */\n",
                "function setup() { throw new Error('no config'); }\n",
                "function detect_number() { return null; }\n",
            ),
        )?;

        let outcome = validate_and_record(&mut store, &id, &SandboxSettings::default(), &clock)?;

        expect_that!(
            outcome.errors,
            elements_are![contains_substring("setup failed")]
        );
        Ok(())
    }

    #[gtest]
    fn test_unknown_version_is_an_error() {
        let clock = FixedClock::at_unix_seconds(1_700_000_000);
        let mut store = MemoryPackStore::new();
        let id = PackVersionId::from("contacts/email@1".to_string());

        expect_that!(
            validate_and_record(&mut store, &id, &SandboxSettings::default(), &clock),
            err(anyhow_downcasts_to::<StoreError, _>(matches_pattern!(
                StoreError::UnknownVersion(eq(&id))
            )))
        );
    }

    #[gtest]
    fn test_declares_detector() {
        expect_that!(declares_detector("function detect_a(input) {}"), eq(true));
        expect_that!(declares_detector("  var detect_b = function () {};"), eq(true));
        expect_that!(declares_detector("// detect_a(x)\nfunction other() {}"), eq(false));
        expect_that!(declares_detector("function detect_(x) {}"), eq(false));
    }
}
