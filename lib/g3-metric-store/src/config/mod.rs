/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, anyhow};
use yaml_rust::{Yaml, YamlLoader};

mod mirror;
pub use mirror::{MirrorConfig, SqliteMirrorConfig};

mod yaml;

const DEFAULT_SNAPSHOT_PATH: &str = "./storage.json";
const DEFAULT_STORE_INTERVAL: Duration = Duration::from_secs(300);

const ENV_FILE_STORAGE_PATH: &str = "FILE_STORAGE_PATH";
const ENV_STORE_INTERVAL: &str = "STORE_INTERVAL";
const ENV_RESTORE: &str = "RESTORE";
const ENV_DATABASE_DSN: &str = "DATABASE_DSN";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotConfig {
    /// snapshot file, `None` to keep metrics in memory only
    pub path: Option<PathBuf>,
    /// zero means write the snapshot on every successful update
    pub interval: Duration,
    /// load the snapshot file at start
    pub restore: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            path: Some(PathBuf::from(DEFAULT_SNAPSHOT_PATH)),
            interval: DEFAULT_STORE_INTERVAL,
            restore: true,
        }
    }
}

/// Which store is authoritative for batch updates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BatchMode {
    /// merge into the memory store, then write the merged states to the mirror
    #[default]
    Merge,
    /// write the batch to the mirror only, the memory store is not changed
    MirrorOnly,
}

impl FromStr for BatchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match yaml::normalize_key(s).as_str() {
            "merge" => Ok(BatchMode::Merge),
            "mirror_only" | "mirror" => Ok(BatchMode::MirrorOnly),
            _ => Err(anyhow!("unsupported batch mode {s}")),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageConfig {
    pub snapshot: SnapshotConfig,
    pub mirror: MirrorConfig,
    pub batch_mode: BatchMode,
}

impl StorageConfig {
    /// Load from a yaml file, multiple docs are merged in order.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read config file {}: {e}", path.display()))?;
        let docs = YamlLoader::load_from_str(&content)
            .map_err(|e| anyhow!("invalid yaml file {}: {e}", path.display()))?;

        let mut config = StorageConfig::default();
        for (i, doc) in docs.iter().enumerate() {
            match doc {
                Yaml::Hash(map) => config
                    .set_by_map(map)
                    .context(format!("invalid doc #{i} in file {}", path.display()))?,
                _ => return Err(anyhow!("yaml doc root should be hash")),
            }
        }
        Ok(config)
    }

    pub fn parse_yaml(v: &Yaml) -> anyhow::Result<Self> {
        if let Yaml::Hash(map) = v {
            let mut config = StorageConfig::default();
            config.set_by_map(map)?;
            Ok(config)
        } else {
            Err(anyhow!(
                "yaml value type for 'storage config' should be 'map'"
            ))
        }
    }

    fn set_by_map(&mut self, map: &yaml_rust::yaml::Hash) -> anyhow::Result<()> {
        yaml::foreach_kv(map, |k, v| self.set(k, v))
    }

    fn set(&mut self, k: &str, v: &Yaml) -> anyhow::Result<()> {
        match yaml::normalize_key(k).as_str() {
            "file_storage_path" | "snapshot_path" => {
                self.snapshot.path = yaml::as_optional_path(v)
                    .context(format!("invalid path value for key {k}"))?;
            }
            "store_interval" => {
                self.snapshot.interval = yaml::as_duration(v)
                    .context(format!("invalid humanize duration value for key {k}"))?;
            }
            "restore" => {
                self.snapshot.restore =
                    yaml::as_bool(v).context(format!("invalid bool value for key {k}"))?;
            }
            "database" | "mirror" => {
                self.mirror = MirrorConfig::parse_yaml(v)
                    .context(format!("invalid database config for key {k}"))?;
            }
            "batch_mode" => {
                let s = yaml::as_string(v).context(format!("invalid string value for key {k}"))?;
                self.batch_mode = BatchMode::from_str(&s)?;
            }
            _ => return Err(anyhow!("invalid key {k}")),
        }
        Ok(())
    }

    /// Let the process environment override the loaded values.
    ///
    /// Values that can not be parsed are ignored and the previous value is kept.
    /// The returned list contains the names of the ignored variables.
    pub fn apply_env(&mut self) -> Vec<&'static str> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    fn apply_env_with<F>(&mut self, get: F) -> Vec<&'static str>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut ignored = Vec::new();

        if let Some(v) = get(ENV_FILE_STORAGE_PATH) {
            self.snapshot.path = if v.is_empty() {
                None
            } else {
                Some(PathBuf::from(v))
            };
        }
        if let Some(v) = get(ENV_STORE_INTERVAL) {
            match u64::from_str(v.trim()) {
                Ok(secs) => self.snapshot.interval = Duration::from_secs(secs),
                Err(_) => ignored.push(ENV_STORE_INTERVAL),
            }
        }
        if let Some(v) = get(ENV_RESTORE) {
            match yaml::parse_bool(v.trim()) {
                Ok(b) => self.snapshot.restore = b,
                Err(_) => ignored.push(ENV_RESTORE),
            }
        }
        if let Some(v) = get(ENV_DATABASE_DSN)
            && !v.is_empty()
        {
            match MirrorConfig::from_dsn(&v) {
                Ok(mirror) => self.mirror = mirror,
                Err(_) => ignored.push(ENV_DATABASE_DSN),
            }
        }

        ignored
    }
}
