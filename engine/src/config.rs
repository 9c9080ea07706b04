//! Engine configuration. Every field has a default, so an empty document is a valid
//! configuration.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::sandbox::{SandboxSettings, acl::NetworkAcl, host::HostPolicy};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub limits: SandboxLimits,
    pub network: NetworkConfig,
    pub filesystem: FilesystemConfig,
    /// Minimum summed score for a canonical key to win a physical column. Unset means any
    /// score greater than zero.
    pub min_score: Option<f64>,
    /// Number of sandbox worker threads. Unset means the available parallelism.
    pub workers: Option<usize>,
    /// Caps the number of column values passed to detectors. Unset means all rows.
    pub detection_sample_rows: Option<usize>,
    /// Appends unassigned physical columns (raw values) after the canonical columns.
    pub append_unmapped: bool,
    /// Caps the number of recoverable errors kept in the report. Counts remain exact.
    pub max_recorded_errors: usize,
    /// Rows per transform job.
    pub transform_chunk_rows: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: SandboxLimits::default(),
            network: NetworkConfig::default(),
            filesystem: FilesystemConfig::default(),
            min_score: None,
            workers: None,
            detection_sample_rows: None,
            append_unmapped: false,
            max_recorded_errors: 1000,
            transform_chunk_rows: 64,
        }
    }
}

impl EngineConfig {
    /// Settings for the sandboxes that run packs under this configuration.
    pub fn sandbox_settings(&self) -> SandboxSettings {
        SandboxSettings {
            limits: self.limits.clone(),
            host: HostPolicy {
                acl: NetworkAcl::new(&self.network.allowed_hosts),
                read_roots: self.filesystem.read_roots.clone(),
                max_read_bytes: self.limits.max_fetch_bytes,
            },
        }
    }

    /// Number of sandbox workers to start for `work_items` independent units of work.
    pub fn worker_count(&self, work_items: usize) -> usize {
        let available = self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1)
        });
        available.min(work_items).max(1)
    }
}

/// Per-call resource limits enforced by the sandbox.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct SandboxLimits {
    pub setup_timeout_ms: u64,
    /// Applies to each `detect_*` and `transform_cell` call.
    pub call_timeout_ms: u64,
    /// Applies to running a pack's top level code when it is loaded.
    pub load_timeout_ms: u64,
    pub max_heap_bytes: usize,
    /// Caps the size of bodies returned by `host.fetchText` and `host.readText`.
    pub max_fetch_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            setup_timeout_ms: 10_000,
            call_timeout_ms: 250,
            load_timeout_ms: 1_000,
            max_heap_bytes: 128 * 1024 * 1024,
            max_fetch_bytes: 1024 * 1024,
        }
    }
}

impl SandboxLimits {
    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Hosts that `setup` may fetch from: `*`, an exact host name, or `*.suffix`. Empty allows
    /// every host.
    pub allowed_hosts: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct FilesystemConfig {
    /// Directories below which `setup` may read files. Empty denies all reads.
    pub read_roots: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;

    use super::*;

    #[gtest]
    fn test_empty_document_is_default() -> anyhow::Result<()> {
        let config: EngineConfig = serde_yaml_ng::from_str("{}")?;
        expect_that!(config, eq(&EngineConfig::default()));
        expect_that!(config.limits.call_timeout(), eq(Duration::from_millis(250)));
        expect_that!(config.min_score, none());
        Ok(())
    }

    #[gtest]
    fn test_partial_document() -> anyhow::Result<()> {
        let config: EngineConfig = serde_yaml_ng::from_str(concat!(
            "limits:\n",
            "  call_timeout_ms: 50\n",
            "network:\n",
            "  allowed_hosts: [\"*.example.com\"]\n",
            "min_score: 0.5\n",
        ))?;

        expect_that!(config.limits.call_timeout_ms, eq(50));
        expect_that!(config.limits.setup_timeout_ms, eq(10_000));
        expect_that!(config.network.allowed_hosts, elements_are![eq("*.example.com")]);
        expect_that!(config.min_score, some(eq(0.5)));
        Ok(())
    }

    #[gtest]
    fn test_worker_count() {
        let config = EngineConfig {
            workers: Some(4),
            ..Default::default()
        };

        expect_that!(config.worker_count(10), eq(4));
        expect_that!(config.worker_count(2), eq(2));
        expect_that!(config.worker_count(0), eq(1));
    }
}
