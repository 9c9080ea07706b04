//! Project files: a YAML configuration naming the canonical columns and the pack file bound to
//! each, plus a validation record stored next to every pack file.

use std::{
    ffi::OsString,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use atomic_write_file::AtomicWriteFile;
use engine::{
    CanonicalKey, ColumnBinding, ConfigurationId, EngineConfig, PackVersion, PackVersionId,
    clock::Timestamp,
    store::{MemoryPackStore, PackRegistry, new_pack_version},
};
use serde::{Deserialize, Serialize};

/// Top level of a project configuration file.
#[derive(Debug, Deserialize)]
pub struct ProjectConfig {
    pub configuration_id: ConfigurationId,
    pub columns: Vec<ColumnConfig>,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// One canonical column and the pack bound to it, if any.
#[derive(Debug, Deserialize)]
pub struct ColumnConfig {
    pub canonical_key: CanonicalKey,
    #[serde(default)]
    pub label: Option<String>,
    pub ordinal: u32,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Path of the pack's code, relative to the configuration file.
    #[serde(default)]
    pub pack: Option<PathBuf>,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub params: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

fn default_version() -> u32 {
    1
}

/// Outcome of validating one pack file, as stored in `<pack>.validation.yaml`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ValidationRecord {
    pub pack_version_id: PackVersionId,
    /// Digest of the code that was validated. A record for different code is ignored.
    pub digest: String,
    pub validated_at: Option<Timestamp>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// A pack file that has been read into the store.
#[derive(Debug)]
pub struct StoredPack {
    pub id: PackVersionId,
    pub path: PathBuf,
}

/// A loaded project configuration.
#[derive(Debug)]
pub struct Project {
    dir: PathBuf,
    pub config: ProjectConfig,
}

impl Project {
    /// Loads the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let rdr = File::open(path)
            .with_context(|| format!("opening configuration file {:?}", path))?;
        let config: ProjectConfig = serde_yaml_ng::from_reader(rdr)
            .with_context(|| format!("parsing configuration file {:?}", path))?;

        Ok(Self {
            dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
            config,
        })
    }

    /// Reads every bound pack file into a new store, along with any validation record that still
    /// matches its code, and returns the store and the column bindings.
    pub fn read_packs(&self) -> Result<(MemoryPackStore, Vec<ColumnBinding>, Vec<StoredPack>)> {
        let mut store = MemoryPackStore::new();
        let mut bindings = Vec::with_capacity(self.config.columns.len());
        let mut stored = Vec::new();

        for column in &self.config.columns {
            let mut binding = ColumnBinding::new(column.canonical_key.clone(), column.ordinal)
                .with_params(column.params.clone());
            binding.label = column.label.clone();
            binding.width = column.width;
            binding.required = column.required;
            binding.enabled = column.enabled;

            if let Some(pack) = &column.pack {
                let path = self.dir.join(pack);
                let version = self.read_pack(column, &path)?;
                let id = version.id.clone();
                store
                    .insert(version.clone())
                    .with_context(|| format!("storing pack {:?}", path))?;
                if let Some(record) = read_record(&path, &version)? {
                    store.record_validation(&id, record.validated_at, record.errors)?;
                }
                binding = binding.with_pack(id.clone());
                stored.push(StoredPack { id, path });
            }
            bindings.push(binding);
        }

        Ok((store, bindings, stored))
    }

    fn read_pack(&self, column: &ColumnConfig, path: &Path) -> Result<PackVersion> {
        let code = std::fs::read_to_string(path)
            .with_context(|| format!("reading pack {:?}", path))?;
        Ok(new_pack_version(
            &self.config.configuration_id,
            &column.canonical_key,
            column.version,
            code,
        )?)
    }
}

/// Path of the validation record for the pack at `pack_path`.
pub fn record_path(pack_path: &Path) -> PathBuf {
    let mut name = OsString::from(pack_path.as_os_str());
    name.push(".validation.yaml");
    PathBuf::from(name)
}

/// Reads the validation record for `version`, ignoring one recorded for other code.
fn read_record(pack_path: &Path, version: &PackVersion) -> Result<Option<ValidationRecord>> {
    let path = record_path(pack_path);
    if !path.exists() {
        return Ok(None);
    }
    let rdr = File::open(&path).with_context(|| format!("opening {:?}", path))?;
    let record: ValidationRecord =
        serde_yaml_ng::from_reader(rdr).with_context(|| format!("parsing {:?}", path))?;

    if record.digest != version.digest || record.pack_version_id != version.id {
        log::warn!(
            "Ignoring validation record {:?}: it was made for different code.",
            path
        );
        return Ok(None);
    }
    Ok(Some(record))
}

/// Replaces the validation record for the pack at `pack_path`.
pub fn write_record(pack_path: &Path, record: &ValidationRecord) -> Result<()> {
    let path = record_path(pack_path);
    let mut file = AtomicWriteFile::open(&path).with_context(|| format!("opening {:?}", path))?;
    serde_yaml_ng::to_writer(&mut file, record)
        .with_context(|| format!("serialising {:?}", path))?;
    file.flush()?;
    file.commit()
        .with_context(|| format!("committing {:?}", path))?;
    Ok(())
}
