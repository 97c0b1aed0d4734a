/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use slog::{Logger, error, info, warn};
use tokio::runtime::Handle;

use crate::config::{BatchMode, SnapshotConfig, StorageConfig};
use crate::error::{MetricError, MirrorError, PersistError, StorageError};
use crate::memory::{MemoryStore, SnapshotTask};
use crate::mirror::{self, ArcMetricMirror};
use crate::types::{Metric, MetricRecord, MetricValue};

const WRITE_THROUGH_TIMEOUT: Duration = Duration::from_secs(5);

/// The store used by the metric service handlers.
///
/// Reads are served from memory only. Single updates are mirrored on a best
/// effort basis, batch updates follow the configured [`BatchMode`].
pub struct MetricStorage {
    memory: Arc<MemoryStore>,
    mirror: ArcMetricMirror,
    batch_mode: BatchMode,
    snapshot_task: Mutex<Option<SnapshotTask>>,
    logger: Logger,
}

impl MetricStorage {
    /// Create the store and start the periodic snapshot task if needed.
    ///
    /// A tokio runtime is required when a periodic snapshot is configured.
    pub fn new(
        snapshot: SnapshotConfig,
        batch_mode: BatchMode,
        mirror: ArcMetricMirror,
        logger: Logger,
    ) -> anyhow::Result<Self> {
        if !snapshot.interval.is_zero() && snapshot.path.is_some() {
            Handle::try_current().context("no tokio runtime to run the snapshot task")?;
        }

        let memory = Arc::new(MemoryStore::new(snapshot, logger.clone()));
        let snapshot_task = memory.spawn_snapshot_task();
        info!(logger, "metric storage started";
            "mirror" => mirror.r#type(),
            "batch_mode" => ?batch_mode,
            "metrics" => memory.len(),
        );

        Ok(MetricStorage {
            memory,
            mirror,
            batch_mode,
            snapshot_task: Mutex::new(snapshot_task),
            logger,
        })
    }

    pub fn build(config: &StorageConfig, logger: &Logger) -> anyhow::Result<Self> {
        let mirror = mirror::build(&config.mirror, logger)?;
        MetricStorage::new(
            config.snapshot.clone(),
            config.batch_mode,
            mirror,
            logger.clone(),
        )
    }

    #[inline]
    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    #[inline]
    pub fn batch_mode(&self) -> BatchMode {
        self.batch_mode
    }

    pub async fn update(&self, r#type: &str, id: &str, value: &str) -> Result<Metric, MetricError> {
        let metric = Metric::parse(r#type, id, value)?;
        let merged = self.memory.apply(metric)?;
        self.write_through().await;
        self.mirror_one(&merged).await;
        Ok(merged)
    }

    pub async fn update_structured(&self, record: MetricRecord) -> Result<Metric, MetricError> {
        let metric = Metric::try_from(record)?;
        let merged = self.memory.apply(metric)?;
        self.write_through().await;
        self.mirror_one(&merged).await;
        Ok(merged)
    }

    async fn mirror_one(&self, metric: &Metric) {
        if let Err(e) = self.mirror.upsert(metric).await {
            warn!(self.logger, "failed to mirror metric";
                "id" => metric.id(),
                "error" => %e,
            );
        }
    }

    /// Apply a batch of records, all of them or none of them.
    ///
    /// Every record is validated before anything is written. In merge mode a
    /// batch the mirror failed to take is also taken back out of memory.
    pub async fn update_batch(&self, records: Vec<MetricRecord>) -> Result<(), StorageError> {
        let metrics = records
            .into_iter()
            .map(Metric::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        if metrics.is_empty() {
            return Ok(());
        }

        match self.batch_mode {
            BatchMode::Merge => {
                let batch = self.memory.apply_batch(&metrics)?;
                if let Err(e) = self.mirror.upsert_batch(batch.merged()).await {
                    self.memory.revert_batch(batch);
                    return Err(self.batch_failed(metrics.len(), e));
                }
                self.write_through().await;
            }
            BatchMode::MirrorOnly => {
                if let Err(e) = self.mirror.upsert_batch(&metrics).await {
                    return Err(self.batch_failed(metrics.len(), e));
                }
            }
        }
        Ok(())
    }

    fn batch_failed(&self, count: usize, e: MirrorError) -> StorageError {
        error!(self.logger, "failed to mirror metric batch";
            "count" => count,
            "batch_mode" => ?self.batch_mode,
            "error" => %e,
        );
        e.into()
    }

    /// Save the snapshot on the blocking pool if every update should be persisted.
    async fn write_through(&self) {
        if !self.memory.is_write_through() {
            return;
        }
        let memory = self.memory.clone();
        let task = tokio::task::spawn_blocking(move || memory.save_snapshot());
        match tokio::time::timeout(WRITE_THROUGH_TIMEOUT, task).await {
            Ok(Ok(Ok(_))) => {}
            Ok(Ok(Err(e))) => error!(self.logger, "failed to save snapshot"; "error" => %e),
            Ok(Err(e)) => error!(self.logger, "failed to join snapshot save task"; "error" => %e),
            Err(_) => warn!(self.logger, "snapshot save not finished in time";
                "timeout" => ?WRITE_THROUGH_TIMEOUT,
            ),
        }
    }

    #[inline]
    pub fn get(&self, id: &str) -> Result<Metric, MetricError> {
        self.memory.get(id)
    }

    #[inline]
    pub fn get_value(&self, id: &str) -> Result<MetricValue, MetricError> {
        self.memory.get_value(id)
    }

    #[inline]
    pub fn list_all_as_text(&self) -> String {
        self.memory.list_all_as_text()
    }

    /// Liveness of the durable mirror.
    pub async fn ping(&self) -> bool {
        self.mirror.health_check().await
    }

    pub fn save_snapshot_now(&self) -> Result<(), PersistError> {
        self.memory.save_snapshot()
    }

    /// Stop the snapshot task, write the final snapshot and close the mirror.
    pub async fn shutdown(&self) {
        let task = self.snapshot_task.lock().unwrap().take();
        if let Some(task) = task {
            task.stop().await;
        }

        if self.memory.config().path.is_some() {
            let memory = self.memory.clone();
            match tokio::task::spawn_blocking(move || memory.save_snapshot()).await {
                Ok(Ok(_)) => info!(self.logger, "final snapshot saved";
                    "metrics" => self.memory.len(),
                ),
                Ok(Err(e)) => error!(self.logger, "failed to save final snapshot"; "error" => %e),
                Err(e) => error!(self.logger, "failed to join final snapshot task"; "error" => %e),
            }
        }

        self.mirror.close().await;
        info!(self.logger, "metric storage stopped");
    }
}
