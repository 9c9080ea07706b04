//! Persistence boundary for pack versions.
//!
//! The engine only ever reads pack versions through [PackStore]. Authoring tools add versions and
//! record validation results through [PackRegistry].

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::{
    clock::Timestamp,
    digest,
    metadata,
    model::{CanonicalKey, ConfigurationId, PackVersion, PackVersionId},
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown pack version {0}")]
    UnknownVersion(PackVersionId),
    #[error("pack version {0} already exists")]
    DuplicateVersion(PackVersionId),
    #[error("storage failure: {0:#}")]
    Backend(anyhow::Error),
}

/// Read-only lookups of pack versions.
#[cfg_attr(test, mockall::automock)]
pub trait PackStore {
    fn get(&self, id: &PackVersionId) -> Result<PackVersion, StoreError>;
}

/// Adds pack versions and records their validation.
pub trait PackRegistry: PackStore {
    /// Stores `code` as the next version of the pack for `canonical_key` in `configuration_id`.
    fn upload(
        &mut self,
        configuration_id: &ConfigurationId,
        canonical_key: &CanonicalKey,
        code: String,
    ) -> Result<PackVersion, StoreError>;

    /// Records the outcome of validating a version. This is the only mutation a stored version
    /// permits.
    fn record_validation(
        &mut self,
        id: &PackVersionId,
        validated_at: Option<Timestamp>,
        validation_errors: Vec<String>,
    ) -> Result<(), StoreError>;
}

/// Creates an unvalidated [PackVersion] for `code`.
pub fn new_pack_version(
    configuration_id: &ConfigurationId,
    canonical_key: &CanonicalKey,
    version: u32,
    code: String,
) -> Result<PackVersion, StoreError> {
    let digest = digest::code_digest(&code).map_err(StoreError::Backend)?;
    Ok(PackVersion {
        id: PackVersionId::derive(configuration_id, canonical_key, version),
        configuration_id: configuration_id.clone(),
        canonical_key: canonical_key.clone(),
        version,
        metadata: metadata::parse_metadata(&code).ok(),
        code,
        digest,
        validated_at: None,
        validation_errors: Vec::new(),
    })
}

/// In-memory [PackRegistry] with monotonic versions per `(configuration, canonical key)`.
#[derive(Debug, Default)]
pub struct MemoryPackStore {
    versions: HashMap<PackVersionId, PackVersion>,
    latest: BTreeMap<(ConfigurationId, CanonicalKey), u32>,
}

impl MemoryPackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an existing version as-is, for example one read back from storage.
    pub fn insert(&mut self, version: PackVersion) -> Result<(), StoreError> {
        if self.versions.contains_key(&version.id) {
            return Err(StoreError::DuplicateVersion(version.id));
        }
        let latest = self
            .latest
            .entry((
                version.configuration_id.clone(),
                version.canonical_key.clone(),
            ))
            .or_default();
        *latest = (*latest).max(version.version);
        self.versions.insert(version.id.clone(), version);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

impl PackStore for MemoryPackStore {
    fn get(&self, id: &PackVersionId) -> Result<PackVersion, StoreError> {
        self.versions
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownVersion(id.clone()))
    }
}

impl PackRegistry for MemoryPackStore {
    fn upload(
        &mut self,
        configuration_id: &ConfigurationId,
        canonical_key: &CanonicalKey,
        code: String,
    ) -> Result<PackVersion, StoreError> {
        let next = self
            .latest
            .get(&(configuration_id.clone(), canonical_key.clone()))
            .copied()
            .unwrap_or(0)
            + 1;
        let version = new_pack_version(configuration_id, canonical_key, next, code)?;
        self.insert(version.clone())?;
        log::debug!("Stored pack version {}.", version.id);
        Ok(version)
    }

    fn record_validation(
        &mut self,
        id: &PackVersionId,
        validated_at: Option<Timestamp>,
        validation_errors: Vec<String>,
    ) -> Result<(), StoreError> {
        let version = self
            .versions
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownVersion(id.clone()))?;
        version.validated_at = validated_at;
        version.validation_errors = validation_errors;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;

    use super::*;
    use crate::clock::{Clock, FixedClock};

    const CODE: &str = "/**\n * @name email\n * @version 1\n */\nfunction detect_at() {}\n";

    #[gtest]
    fn test_upload_assigns_monotonic_versions() -> anyhow::Result<()> {
        let mut store = MemoryPackStore::new();
        let config = ConfigurationId::try_from("contacts")?;
        let email = CanonicalKey::try_from("email")?;
        let phone = CanonicalKey::try_from("phone")?;

        let v1 = store.upload(&config, &email, CODE.to_string())?;
        let v2 = store.upload(&config, &email, format!("{CODE}// edited\n"))?;
        let other = store.upload(&config, &phone, CODE.to_string())?;

        expect_that!(v1.version, eq(1));
        expect_that!(v2.version, eq(2));
        expect_that!(other.version, eq(1));
        expect_that!(v1.id.as_str(), eq("contacts/email@1"));
        expect_that!(v1.digest, eq(&digest::code_digest(CODE)?));
        expect_that!(v1.metadata.as_ref().map(|m| m.name.as_str()), some(eq("email")));
        expect_that!(v1.is_validated(), eq(false));
        expect_that!(store.len(), eq(3));
        Ok(())
    }

    #[gtest]
    fn test_record_validation() -> anyhow::Result<()> {
        let mut store = MemoryPackStore::new();
        let clock = FixedClock::at_unix_seconds(1_700_000_000);
        let version = store.upload(
            &ConfigurationId::try_from("contacts")?,
            &CanonicalKey::try_from("email")?,
            CODE.to_string(),
        )?;

        store.record_validation(&version.id, Some(clock.now()), Vec::new())?;
        expect_that!(store.get(&version.id)?.is_validated(), eq(true));

        store.record_validation(&version.id, Some(clock.now()), vec!["bad".to_string()])?;
        expect_that!(store.get(&version.id)?.is_validated(), eq(false));

        expect_that!(
            store.record_validation(&PackVersionId::from("nope"), None, Vec::new()),
            err(anything())
        );
        Ok(())
    }

    #[gtest]
    fn test_insert_rejects_duplicates() -> anyhow::Result<()> {
        let mut store = MemoryPackStore::new();
        let version = new_pack_version(
            &ConfigurationId::try_from("contacts")?,
            &CanonicalKey::try_from("email")?,
            7,
            CODE.to_string(),
        )?;

        store.insert(version.clone())?;
        expect_that!(store.insert(version), err(anything()));

        let next = store.upload(
            &ConfigurationId::try_from("contacts")?,
            &CanonicalKey::try_from("email")?,
            CODE.to_string(),
        )?;
        expect_that!(next.version, eq(8));
        Ok(())
    }
}
