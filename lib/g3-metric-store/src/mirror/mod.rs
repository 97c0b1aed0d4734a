/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use slog::Logger;

use crate::config::MirrorConfig;
use crate::error::MirrorError;
use crate::types::Metric;

mod discard;
pub use discard::DiscardMirror;

mod sqlite;
pub use sqlite::SqliteMirror;

/// Durable copy of the metric states.
///
/// Writes are upserts keyed by metric id, the mirror never merges values itself.
#[async_trait]
pub trait MetricMirror: Send + Sync {
    fn r#type(&self) -> &'static str;

    async fn upsert(&self, metric: &Metric) -> Result<(), MirrorError>;

    /// Write all metrics in one transaction, nothing is kept on failure.
    async fn upsert_batch(&self, metrics: &[Metric]) -> Result<(), MirrorError>;

    async fn health_check(&self) -> bool;

    async fn close(&self) {}
}

pub type ArcMetricMirror = Arc<dyn MetricMirror>;

pub fn build(config: &MirrorConfig, logger: &Logger) -> anyhow::Result<ArcMetricMirror> {
    match config {
        MirrorConfig::Discard => Ok(Arc::new(DiscardMirror)),
        MirrorConfig::Sqlite(c) => {
            let mirror = SqliteMirror::open(c.clone(), logger.clone())
                .context(format!("failed to open sqlite mirror at {}", c.path))?;
            Ok(Arc::new(mirror))
        }
    }
}
