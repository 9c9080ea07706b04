//! Persisted inputs to the engine: pack versions and the column bindings that reference them.
//!
//! Identifier types have value validation, so their inner value is private.

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};

use crate::{clock::Timestamp, metadata::PackMetadata};

/// Key that a pack uses in returned mappings to refer to its own canonical column. It is never a
/// valid [CanonicalKey].
pub const SELF_KEY: &str = "self";

#[derive(Debug, thiserror::Error)]
#[error("got {value:?} which is not {expected}")]
pub struct ValueError<V> {
    pub value: V,
    pub expected: &'static str,
}

/// Identifies a configuration: the set of canonical columns and their bindings.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConfigurationId(String);

impl ConfigurationId {
    const EXPECTED: &str = "a non-empty configuration ID without whitespace or '/'";

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ConfigurationId {
    type Error = ValueError<String>;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() || value.contains(|c: char| c.is_whitespace() || c == '/') {
            Err(ValueError {
                value,
                expected: Self::EXPECTED,
            })
        } else {
            Ok(Self(value))
        }
    }
}

impl TryFrom<&str> for ConfigurationId {
    type Error = ValueError<String>;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.to_string().try_into()
    }
}

impl From<ConfigurationId> for String {
    fn from(value: ConfigurationId) -> Self {
        value.0
    }
}

impl std::fmt::Display for ConfigurationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identifier of one output column.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanonicalKey(String);

impl CanonicalKey {
    const EXPECTED: &str = r#"a canonical key matching ^[a-z][a-z0-9_]*$ other than "self""#;

    fn valid_regex() -> &'static lazy_regex::Regex {
        lazy_regex::regex!(r#"^[a-z][a-z0-9_]*$"#)
    }

    fn try_from_string<S>(value: S) -> std::result::Result<Self, S>
    where
        S: Into<String> + AsRef<str>,
    {
        let s = value.as_ref();
        if s != SELF_KEY && Self::valid_regex().is_match(s) {
            Ok(Self(value.into()))
        } else {
            Err(value)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for CanonicalKey {
    type Error = ValueError<String>;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from_string(value).map_err(|value| ValueError {
            value: value.to_string(),
            expected: Self::EXPECTED,
        })
    }
}

impl TryFrom<String> for CanonicalKey {
    type Error = ValueError<String>;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from_string(value).map_err(|value| ValueError {
            value,
            expected: Self::EXPECTED,
        })
    }
}

impl From<CanonicalKey> for String {
    fn from(value: CanonicalKey) -> Self {
        value.0
    }
}

impl AsRef<str> for CanonicalKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one immutable version of a pack.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct PackVersionId(String);

impl PackVersionId {
    /// Derives the identifier of `version` of the pack for `canonical_key` in `configuration_id`.
    pub fn derive(
        configuration_id: &ConfigurationId,
        canonical_key: &CanonicalKey,
        version: u32,
    ) -> Self {
        Self(format!("{configuration_id}/{canonical_key}@{version}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PackVersionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PackVersionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for PackVersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An immutable, versioned unit of pack code bound to one canonical key within one configuration.
///
/// Only the validation fields change after creation, and only through
/// [crate::store::PackRegistry::record_validation].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PackVersion {
    pub id: PackVersionId,
    pub configuration_id: ConfigurationId,
    pub canonical_key: CanonicalKey,
    /// Monotonic per `(configuration_id, canonical_key)`.
    pub version: u32,
    pub code: String,
    /// Lowercase hex SHA-256 of `code`.
    pub digest: String,
    /// Metadata parsed from the code's docstring, if it parsed.
    pub metadata: Option<PackMetadata>,
    pub validated_at: Option<Timestamp>,
    #[serde(default)]
    pub validation_errors: Vec<String>,
}

impl PackVersion {
    /// True if validation has completed without errors.
    pub fn is_validated(&self) -> bool {
        self.validated_at.is_some() && self.validation_errors.is_empty()
    }
}

/// Associates a canonical column of a configuration with at most one pack version.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ColumnBinding {
    pub canonical_key: CanonicalKey,
    /// Display label. Also used to break detection ties on exact header matches.
    #[serde(default)]
    pub label: Option<String>,
    pub ordinal: u32,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub script_version_id: Option<PackVersionId>,
    /// Passed to the pack as `params` in every call.
    #[serde(default)]
    pub params: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

impl ColumnBinding {
    /// Creates an enabled binding without a pack.
    pub fn new(canonical_key: CanonicalKey, ordinal: u32) -> Self {
        Self {
            canonical_key,
            label: None,
            ordinal,
            width: None,
            required: false,
            enabled: true,
            script_version_id: None,
            params: serde_json::Value::Null,
        }
    }

    pub fn with_label<S: Into<String>>(mut self, label: S) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_pack(mut self, script_version_id: PackVersionId) -> Self {
        self.script_version_id = Some(script_version_id);
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}
