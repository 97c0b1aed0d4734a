/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use slog::{Logger, debug, error, info};

use crate::config::SnapshotConfig;
use crate::error::{MetricError, PersistError};
use crate::types::{Metric, MetricRecord, MetricType, MetricValue};

mod snapshot;
pub use snapshot::SnapshotTask;

/// The authoritative metric map.
///
/// All updates are merged with the map lock held, so concurrent counter
/// updates to the same id never lose increments.
/// File I/O is always done after the map lock has been released.
pub struct MemoryStore {
    config: SnapshotConfig,
    logger: Logger,
    metrics: Mutex<AHashMap<String, Metric>>,
    save_lock: Mutex<()>,
}

/// A batch merged into the store, with what is needed to take it back out.
#[derive(Default)]
pub(crate) struct MergedBatch {
    merged: Vec<Metric>,
    undo: Vec<UndoEntry>,
}

impl MergedBatch {
    /// The state of each metric right after its own merge, in input order.
    #[inline]
    pub(crate) fn merged(&self) -> &[Metric] {
        &self.merged
    }
}

struct UndoEntry {
    id: String,
    prior: Option<MetricValue>,
    written: MetricValue,
}

impl MemoryStore {
    pub fn new(config: SnapshotConfig, logger: Logger) -> Self {
        info!(logger, "memory store created";
            "path" => config.path.as_ref().map(|p| p.display().to_string()),
            "store_interval" => ?config.interval,
            "restore" => config.restore,
        );

        let store = MemoryStore {
            config,
            logger,
            metrics: Mutex::new(AHashMap::default()),
            save_lock: Mutex::new(()),
        };
        if store.config.restore {
            store.restore_on_start();
        }
        store
    }

    fn restore_on_start(&self) {
        match self.restore_from_file() {
            Ok(n) => info!(self.logger, "restored {} metrics from snapshot", n),
            Err(e) if e.is_not_found() => {
                info!(self.logger, "no snapshot file found, start with an empty store")
            }
            Err(e) => error!(self.logger, "failed to restore, start with an empty store";
                "error" => %e,
            ),
        }
    }

    #[inline]
    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.metrics.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_all(&self) -> Vec<Metric> {
        let map = self.metrics.lock().unwrap();
        map.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Result<Metric, MetricError> {
        let map = self.metrics.lock().unwrap();
        map.get(id)
            .cloned()
            .ok_or_else(|| MetricError::NotFound(id.to_string()))
    }

    pub fn get_value(&self, id: &str) -> Result<MetricValue, MetricError> {
        let map = self.metrics.lock().unwrap();
        map.get(id)
            .map(|m| m.value())
            .ok_or_else(|| MetricError::NotFound(id.to_string()))
    }

    /// One `id|type|value|` line per metric, sorted by id.
    pub fn list_all_as_text(&self) -> String {
        let mut metrics = self.get_all();
        metrics.sort_unstable_by(|a, b| a.id().cmp(b.id()));

        let mut s = String::with_capacity(metrics.len() * 32);
        for m in metrics {
            let _ = write!(s, "{}|{}|{}|\r\n", m.id(), m.r#type(), m.value());
        }
        s
    }

    /// Merge a plain text update.
    pub fn update(&self, r#type: &str, id: &str, value: &str) -> Result<Metric, MetricError> {
        let metric = Metric::parse(r#type, id, value)?;
        self.merge(metric)
    }

    /// Merge a decoded wire record.
    pub fn update_structured(&self, record: MetricRecord) -> Result<Metric, MetricError> {
        let metric = Metric::try_from(record)?;
        self.merge(metric)
    }

    /// Insert the metric if absent, else overwrite the gauge or add to the counter.
    ///
    /// The snapshot file is written before returning in write-through mode.
    pub fn merge(&self, metric: Metric) -> Result<Metric, MetricError> {
        let merged = self.apply(metric)?;
        self.write_through();
        Ok(merged)
    }

    /// Same as [`MemoryStore::merge`], but never touches the snapshot file.
    pub(crate) fn apply(&self, metric: Metric) -> Result<Metric, MetricError> {
        let mut map = self.metrics.lock().unwrap();
        match map.get_mut(metric.id()) {
            Some(stored) => {
                stored.merge(metric.value())?;
                Ok(stored.clone())
            }
            None => {
                map.insert(metric.id().to_string(), metric.clone());
                Ok(metric)
            }
        }
    }

    /// Merge all metrics or none of them.
    ///
    /// Returns the state of each metric right after its own merge, in input order.
    pub fn merge_batch(&self, metrics: &[Metric]) -> Result<Vec<Metric>, MetricError> {
        let batch = self.apply_batch(metrics)?;
        self.write_through();
        Ok(batch.merged)
    }

    /// Same as [`MemoryStore::merge_batch`], but never touches the snapshot file.
    ///
    /// The returned value can be used to take the batch back out of the store.
    pub(crate) fn apply_batch(&self, metrics: &[Metric]) -> Result<MergedBatch, MetricError> {
        if metrics.is_empty() {
            return Ok(MergedBatch::default());
        }

        let mut map = self.metrics.lock().unwrap();

        let mut batch_types: AHashMap<&str, MetricType> = AHashMap::with_capacity(metrics.len());
        for m in metrics {
            let stored = map
                .get(m.id())
                .map(|s| s.r#type())
                .or_else(|| batch_types.get(m.id()).copied());
            if let Some(stored) = stored
                && stored != m.r#type()
            {
                return Err(MetricError::KindMismatch {
                    id: m.id().to_string(),
                    stored,
                    requested: m.r#type(),
                });
            }
            batch_types.entry(m.id()).or_insert(m.r#type());
        }

        let mut priors: AHashMap<&str, Option<MetricValue>> =
            AHashMap::with_capacity(batch_types.len());
        let mut merged = Vec::with_capacity(metrics.len());
        for m in metrics {
            priors
                .entry(m.id())
                .or_insert_with(|| map.get(m.id()).map(|s| s.value()));
            match map.get_mut(m.id()) {
                Some(stored) => {
                    // types have all been checked above
                    stored.merge(m.value())?;
                    merged.push(stored.clone());
                }
                None => {
                    map.insert(m.id().to_string(), m.clone());
                    merged.push(m.clone());
                }
            }
        }

        let undo = priors
            .into_iter()
            .filter_map(|(id, prior)| {
                map.get(id).map(|m| UndoEntry {
                    id: id.to_string(),
                    prior,
                    written: m.value(),
                })
            })
            .collect();
        Ok(MergedBatch { merged, undo })
    }

    /// Take a batch applied by [`MemoryStore::apply_batch`] back out of the store.
    ///
    /// Counter increments made by others in the meantime are kept, and so is a
    /// gauge that has been overwritten since.
    pub(crate) fn revert_batch(&self, batch: MergedBatch) {
        let mut map = self.metrics.lock().unwrap();
        for entry in batch.undo {
            let Some(current) = map.get(&entry.id).map(|m| m.value()) else {
                continue;
            };
            let reverted = match (current, entry.written) {
                (MetricValue::Signed(c), MetricValue::Signed(w)) => {
                    if entry.prior.is_none() && c == w {
                        None
                    } else {
                        let p = match entry.prior {
                            Some(MetricValue::Signed(p)) => p,
                            _ => 0,
                        };
                        let applied = i128::from(w) - i128::from(p);
                        let v = (i128::from(c) - applied).clamp(i64::MIN.into(), i64::MAX.into());
                        Some(MetricValue::Signed(v as i64))
                    }
                }
                (MetricValue::Double(c), MetricValue::Double(w)) => {
                    if c != w {
                        continue;
                    }
                    entry.prior
                }
                // replaced by a restore in the meantime
                _ => continue,
            };

            match reverted.and_then(|v| Metric::new(&entry.id, v).ok()) {
                Some(m) => {
                    map.insert(entry.id, m);
                }
                None => {
                    map.remove(&entry.id);
                }
            }
        }
    }

    #[inline]
    pub fn is_write_through(&self) -> bool {
        self.config.interval.is_zero() && self.config.path.is_some()
    }

    /// Encode the whole store as a JSON object keyed by metric id.
    pub fn snapshot(&self) -> Result<Vec<u8>, PersistError> {
        let metrics = self.get_all();
        let map: BTreeMap<&str, &Metric> = metrics.iter().map(|m| (m.id(), m)).collect();
        let data = serde_json::to_vec(&map)?;
        Ok(data)
    }

    /// Replace the whole store content with the snapshot content.
    ///
    /// The store is left untouched if the data can not be decoded, or if a
    /// record is stored under a key other than its own id.
    pub fn restore(&self, data: &[u8]) -> Result<usize, PersistError> {
        let records: BTreeMap<String, Metric> = serde_json::from_slice(data)?;
        let mut restored: AHashMap<String, Metric> = AHashMap::with_capacity(records.len());
        for (key, m) in records {
            if key != m.id() {
                return Err(PersistError::KeyMismatch {
                    key,
                    id: m.id().to_string(),
                });
            }
            restored.insert(key, m);
        }
        let count = restored.len();

        *self.metrics.lock().unwrap() = restored;
        Ok(count)
    }

    pub fn restore_from_file(&self) -> Result<usize, PersistError> {
        let Some(path) = &self.config.path else {
            return Ok(0);
        };
        let data = snapshot::read_file(path)?;
        self.restore(&data)
    }

    /// Write the current snapshot to the configured file.
    pub fn save_snapshot(&self) -> Result<(), PersistError> {
        let Some(path) = &self.config.path else {
            return Ok(());
        };

        // one writer at a time, so an older snapshot never overwrites a newer one
        let _guard = self.save_lock.lock().unwrap();
        let data = self.snapshot()?;
        snapshot::write_file(path, &data)?;
        debug!(self.logger, "snapshot saved";
            "path" => %path.display(),
            "size" => data.len(),
        );
        Ok(())
    }

    fn write_through(&self) {
        if !self.is_write_through() {
            return;
        }
        if let Err(e) = self.save_snapshot() {
            error!(self.logger, "failed to save snapshot"; "error" => %e);
        }
    }

    /// Start the periodic snapshot task if a store interval is set.
    ///
    /// This should be called inside a tokio runtime.
    pub fn spawn_snapshot_task(self: &Arc<Self>) -> Option<SnapshotTask> {
        if self.config.interval.is_zero() || self.config.path.is_none() {
            return None;
        }
        Some(SnapshotTask::spawn(
            Arc::clone(self),
            self.config.interval,
            self.logger.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::thread;
    use std::time::Duration;

    use slog::{Discard, o};

    fn memory_config() -> SnapshotConfig {
        SnapshotConfig {
            path: None,
            interval: Duration::from_secs(300),
            restore: false,
        }
    }

    fn new_store() -> MemoryStore {
        MemoryStore::new(memory_config(), Logger::root(Discard, o!()))
    }

    fn file_store(path: PathBuf, interval: Duration, restore: bool) -> MemoryStore {
        let config = SnapshotConfig {
            path: Some(path),
            interval,
            restore,
        };
        MemoryStore::new(config, Logger::root(Discard, o!()))
    }

    #[test]
    fn gauge_overwrite() {
        let store = new_store();
        store.update("gauge", "temp", "36.6").unwrap();
        let m = store.update("gauge", "temp", "37.1").unwrap();
        assert_eq!(m.value(), MetricValue::Double(37.1));
        assert_eq!(store.get_value("temp").unwrap(), MetricValue::Double(37.1));
    }

    #[test]
    fn gauge_idempotent() {
        let store = new_store();
        store.update("gauge", "temp", "36.6").unwrap();
        let once = store.get("temp").unwrap();
        store.update("gauge", "temp", "36.6").unwrap();
        assert_eq!(store.get("temp").unwrap(), once);
    }

    #[test]
    fn counter_accumulate() {
        let store = new_store();
        let m = store.update("counter", "hits", "5").unwrap();
        assert_eq!(m.value(), MetricValue::Signed(5));
        let m = store.update("counter", "hits", "3").unwrap();
        assert_eq!(m.value(), MetricValue::Signed(8));

        // applying the same increment again is not a no-op
        store.update("counter", "hits", "3").unwrap();
        assert_eq!(store.get_value("hits").unwrap(), MetricValue::Signed(11));

        store.update("counter", "hits", "-12").unwrap();
        assert_eq!(store.get_value("hits").unwrap(), MetricValue::Signed(-1));
    }

    #[test]
    fn counter_concurrent() {
        let store = Arc::new(new_store());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    store.update("counter", "hits", "1").unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get_value("hits").unwrap(), MetricValue::Signed(8000));
    }

    #[test]
    fn structured_update() {
        let store = new_store();
        store
            .update_structured(MetricRecord::counter("hits", 2))
            .unwrap();
        let m = store
            .update_structured(MetricRecord::counter("hits", 2))
            .unwrap();
        assert_eq!(m.value(), MetricValue::Signed(4));

        let e = store
            .update_structured(MetricRecord::gauge("", 1.0))
            .unwrap_err();
        assert!(matches!(e, MetricError::InvalidIdentity));
        assert!(e.is_validation());
        assert!(store.get("").is_err());
    }

    #[test]
    fn unsupported_kind() {
        let store = new_store();
        let e = store.update("bool", "y", "true").unwrap_err();
        assert!(matches!(e, MetricError::UnsupportedKind(_)));
        assert!(matches!(store.get("y"), Err(MetricError::NotFound(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn invalid_value_keeps_store() {
        let store = new_store();
        store.update("counter", "hits", "5").unwrap();
        assert!(store.update("counter", "hits", "five").is_err());
        assert!(store.update("counter", "other", "1.5").is_err());
        assert_eq!(store.get_value("hits").unwrap(), MetricValue::Signed(5));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn kind_mismatch() {
        let store = new_store();
        store.update("counter", "hits", "8").unwrap();
        let e = store.update("gauge", "hits", "1.5").unwrap_err();
        assert!(matches!(e, MetricError::KindMismatch { .. }));
        assert!(!e.is_validation());
        assert_eq!(store.get_value("hits").unwrap(), MetricValue::Signed(8));
    }

    #[test]
    fn batch_all_or_nothing() {
        let store = new_store();
        store.update("counter", "hits", "8").unwrap();

        let batch = vec![
            Metric::new("hits", MetricValue::Signed(2)).unwrap(),
            Metric::new("temp", MetricValue::Double(1.0)).unwrap(),
            Metric::new("hits", MetricValue::Double(1.0)).unwrap(),
        ];
        assert!(store.merge_batch(&batch).is_err());
        assert_eq!(store.get_value("hits").unwrap(), MetricValue::Signed(8));
        assert!(store.get("temp").is_err());

        // type conflicts inside the batch itself
        let batch = vec![
            Metric::new("new", MetricValue::Signed(2)).unwrap(),
            Metric::new("new", MetricValue::Double(1.0)).unwrap(),
        ];
        assert!(store.merge_batch(&batch).is_err());
        assert!(store.get("new").is_err());

        let batch = vec![
            Metric::new("hits", MetricValue::Signed(2)).unwrap(),
            Metric::new("temp", MetricValue::Double(1.0)).unwrap(),
            Metric::new("hits", MetricValue::Signed(5)).unwrap(),
        ];
        let merged = store.merge_batch(&batch).unwrap();
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].value(), MetricValue::Signed(10));
        assert_eq!(merged[2].value(), MetricValue::Signed(15));
        assert_eq!(store.get_value("hits").unwrap(), MetricValue::Signed(15));
    }

    #[test]
    fn list_text() {
        let store = new_store();
        store.update("gauge", "temp", "37").unwrap();
        store.update("counter", "hits", "8").unwrap();
        assert_eq!(
            store.list_all_as_text(),
            "hits|counter|8|\r\ntemp|gauge|37|\r\n"
        );
    }

    #[test]
    fn snapshot_roundtrip() {
        let store = new_store();
        store.update("gauge", "temp", "-36.6").unwrap();
        store.update("gauge", "zero", "0").unwrap();
        store.update("counter", "hits", "-8").unwrap();
        store.update("counter", "none", "0").unwrap();

        let data = store.snapshot().unwrap();
        let restored = new_store();
        assert_eq!(restored.restore(&data).unwrap(), 4);

        let mut a = store.get_all();
        let mut b = restored.get_all();
        a.sort_unstable_by(|x, y| x.id().cmp(y.id()));
        b.sort_unstable_by(|x, y| x.id().cmp(y.id()));
        assert_eq!(a, b);
    }

    #[test]
    fn restore_replaces() {
        let store = new_store();
        store.update("counter", "old", "1").unwrap();
        store
            .restore(br#"{"x":{"id":"x","type":"gauge","value":1.5}}"#)
            .unwrap();
        assert_eq!(store.get_value("x").unwrap(), MetricValue::Double(1.5));
        assert!(store.get("old").is_err());
    }

    #[test]
    fn restore_malformed() {
        let store = new_store();
        store.update("counter", "hits", "1").unwrap();
        assert!(store.restore(b"{not json").is_err());
        assert!(
            store
                .restore(br#"{"x":{"id":"x","type":"bool","value":1.5}}"#)
                .is_err()
        );
        assert_eq!(store.get_value("hits").unwrap(), MetricValue::Signed(1));
    }

    #[test]
    fn file_restore_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");

        let store = file_store(path.clone(), Duration::from_secs(300), false);
        store.update("counter", "hits", "8").unwrap();
        store.update("gauge", "temp", "37.1").unwrap();
        store.save_snapshot().unwrap();

        let restored = file_store(path, Duration::from_secs(300), true);
        assert_eq!(restored.get_value("hits").unwrap(), MetricValue::Signed(8));
        assert_eq!(restored.get_value("temp").unwrap(), MetricValue::Double(37.1));
    }

    #[test]
    fn file_restore_fallback_empty() {
        let dir = tempfile::tempdir().unwrap();

        let store = file_store(dir.path().join("absent.json"), Duration::from_secs(300), true);
        assert!(store.is_empty());

        let path = dir.path().join("broken.json");
        std::fs::write(&path, b"{\"x\":").unwrap();
        let store = file_store(path, Duration::from_secs(300), true);
        assert!(store.is_empty());
    }

    #[test]
    fn write_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");

        let store = file_store(path.clone(), Duration::ZERO, false);
        store.update("counter", "hits", "5").unwrap();
        let data = std::fs::read(&path).unwrap();
        assert_eq!(data, br#"{"hits":{"id":"hits","type":"counter","delta":5}}"#);

        // failed updates do not touch the file
        assert!(store.update("gauge", "hits", "1").is_err());
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[test]
    fn save_without_path() {
        let store = new_store();
        store.update("counter", "hits", "5").unwrap();
        assert!(store.save_snapshot().is_ok());
        assert_eq!(store.restore_from_file().unwrap(), 0);
    }

    #[test]
    fn revert_batch() {
        let store = new_store();
        store.update("counter", "hits", "8").unwrap();
        store.update("gauge", "temp", "36.6").unwrap();

        let batch = vec![
            Metric::new("hits", MetricValue::Signed(2)).unwrap(),
            Metric::new("temp", MetricValue::Double(37.1)).unwrap(),
            Metric::new("new", MetricValue::Signed(5)).unwrap(),
            Metric::new("hits", MetricValue::Signed(3)).unwrap(),
        ];
        let merged = store.apply_batch(&batch).unwrap();
        assert_eq!(merged.merged()[3].value(), MetricValue::Signed(13));
        assert_eq!(store.get_value("hits").unwrap(), MetricValue::Signed(13));

        store.revert_batch(merged);
        assert_eq!(store.get_value("hits").unwrap(), MetricValue::Signed(8));
        assert_eq!(store.get_value("temp").unwrap(), MetricValue::Double(36.6));
        assert!(store.get("new").is_err());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn revert_batch_keeps_later_updates() {
        let store = new_store();
        store.update("counter", "hits", "8").unwrap();
        store.update("gauge", "temp", "1").unwrap();

        let batch = vec![
            Metric::new("hits", MetricValue::Signed(2)).unwrap(),
            Metric::new("temp", MetricValue::Double(2.0)).unwrap(),
            Metric::new("g", MetricValue::Double(1.0)).unwrap(),
            Metric::new("c", MetricValue::Signed(1)).unwrap(),
        ];
        let merged = store.apply_batch(&batch).unwrap();

        store.update("counter", "hits", "5").unwrap();
        store.update("gauge", "temp", "3").unwrap();
        store.update("counter", "c", "4").unwrap();

        store.revert_batch(merged);
        assert_eq!(store.get_value("hits").unwrap(), MetricValue::Signed(13));
        assert_eq!(store.get_value("temp").unwrap(), MetricValue::Double(3.0));
        assert_eq!(store.get_value("c").unwrap(), MetricValue::Signed(4));
        assert!(store.get("g").is_err());
    }

    #[test]
    fn apply_skips_write_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");

        let store = file_store(path.clone(), Duration::ZERO, false);
        assert!(store.is_write_through());
        store
            .apply(Metric::new("hits", MetricValue::Signed(1)).unwrap())
            .unwrap();
        assert!(!path.exists());

        let store = file_store(path, Duration::from_secs(300), false);
        assert!(!store.is_write_through());
        assert!(!new_store().is_write_through());
    }

    #[test]
    fn restore_key_mismatch() {
        let store = new_store();
        store.update("counter", "hits", "1").unwrap();

        let e = store
            .restore(br#"{"a":{"id":"b","type":"gauge","value":1.5}}"#)
            .unwrap_err();
        assert!(matches!(e, PersistError::KeyMismatch { .. }));
        assert_eq!(store.get_value("hits").unwrap(), MetricValue::Signed(1));
        assert!(store.get("b").is_err());
    }
}
