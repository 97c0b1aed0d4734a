/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use async_trait::async_trait;

use super::MetricMirror;
use crate::error::MirrorError;
use crate::types::Metric;

/// Used when no database is configured.
pub struct DiscardMirror;

#[async_trait]
impl MetricMirror for DiscardMirror {
    #[inline]
    fn r#type(&self) -> &'static str {
        "discard"
    }

    async fn upsert(&self, _metric: &Metric) -> Result<(), MirrorError> {
        Ok(())
    }

    async fn upsert_batch(&self, _metrics: &[Metric]) -> Result<(), MirrorError> {
        Ok(())
    }

    async fn health_check(&self) -> bool {
        false
    }
}
