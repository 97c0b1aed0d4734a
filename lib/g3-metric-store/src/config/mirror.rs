/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::time::Duration;

use anyhow::{Context, anyhow};
use yaml_rust::Yaml;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum MirrorConfig {
    #[default]
    Discard,
    Sqlite(SqliteMirrorConfig),
}

impl MirrorConfig {
    pub fn mirror_type(&self) -> &'static str {
        match self {
            MirrorConfig::Discard => "discard",
            MirrorConfig::Sqlite(_) => "sqlite",
        }
    }

    /// Build from a connection string, an empty one disables the mirror.
    pub fn from_dsn(dsn: &str) -> anyhow::Result<Self> {
        let dsn = dsn.trim();
        if dsn.is_empty() {
            return Ok(MirrorConfig::Discard);
        }
        let config = SqliteMirrorConfig::from_dsn(dsn)?;
        Ok(MirrorConfig::Sqlite(config))
    }

    pub(crate) fn parse_yaml(v: &Yaml) -> anyhow::Result<Self> {
        match v {
            Yaml::String(s) => MirrorConfig::from_dsn(s),
            Yaml::Null => Ok(MirrorConfig::Discard),
            Yaml::Hash(map) => {
                let mut config = SqliteMirrorConfig::default();
                let mut path_set = false;
                super::yaml::foreach_kv(map, |k, v| match super::yaml::normalize_key(k).as_str() {
                    "path" | "dsn" => {
                        let dsn = super::yaml::as_string(v)?;
                        config.path = SqliteMirrorConfig::from_dsn(&dsn)?.path;
                        path_set = true;
                        Ok(())
                    }
                    "timeout" => {
                        config.timeout = super::yaml::as_duration(v)
                            .context(format!("invalid humanize duration value for key {k}"))?;
                        Ok(())
                    }
                    "health_timeout" | "ping_timeout" => {
                        config.health_timeout = super::yaml::as_duration(v)
                            .context(format!("invalid humanize duration value for key {k}"))?;
                        Ok(())
                    }
                    _ => Err(anyhow!("invalid key {k}")),
                })?;
                if !path_set {
                    return Err(anyhow!("no database path has been set"));
                }
                config.check()?;
                Ok(MirrorConfig::Sqlite(config))
            }
            _ => Err(anyhow!(
                "yaml value type for 'database' should be 'string' or 'map'"
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SqliteMirrorConfig {
    /// database file path, or `:memory:`
    pub path: String,
    pub timeout: Duration,
    pub health_timeout: Duration,
}

impl Default for SqliteMirrorConfig {
    fn default() -> Self {
        SqliteMirrorConfig {
            path: ":memory:".to_string(),
            timeout: DEFAULT_TIMEOUT,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }
}

impl SqliteMirrorConfig {
    pub fn with_path(path: &str) -> Self {
        SqliteMirrorConfig {
            path: path.to_string(),
            ..Default::default()
        }
    }

    /// Accepts `sqlite://<path>`, `sqlite:<path>` or a plain path.
    fn from_dsn(dsn: &str) -> anyhow::Result<Self> {
        let path = if let Some(p) = dsn.strip_prefix("sqlite://") {
            p
        } else if let Some(p) = dsn.strip_prefix("sqlite:") {
            p
        } else if let Some((scheme, _)) = dsn.split_once("://") {
            return Err(anyhow!("unsupported database scheme {scheme}"));
        } else {
            dsn
        };
        if path.is_empty() {
            return Err(anyhow!("empty database path in {dsn}"));
        }
        Ok(SqliteMirrorConfig::with_path(path))
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.timeout.is_zero() {
            return Err(anyhow!("timeout should not be zero"));
        }
        if self.health_timeout.is_zero() {
            return Err(anyhow!("health timeout should not be zero"));
        }
        Ok(())
    }
}
