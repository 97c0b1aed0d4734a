/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use slog::{Logger, debug, error};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::MemoryStore;
use crate::error::PersistError;

const INITIAL_DELAY: Duration = Duration::from_millis(300);

pub(super) fn read_file(path: &Path) -> Result<Vec<u8>, PersistError> {
    fs::read(path).map_err(|source| PersistError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut s = OsString::from(path.as_os_str());
    s.push(".tmp");
    PathBuf::from(s)
}

/// Write the whole buffer to a sibling temp file and then rename it over the target.
pub(super) fn write_file(path: &Path, data: &[u8]) -> Result<(), PersistError> {
    let tmp = tmp_path(path);
    fs::write(&tmp, data).map_err(|source| PersistError::Write {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| PersistError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Handle of the periodic snapshot task.
///
/// The task exits when [`SnapshotTask::stop`] is called or the handle is dropped.
pub struct SnapshotTask {
    quit_sender: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl SnapshotTask {
    pub(super) fn spawn(store: Arc<MemoryStore>, interval: Duration, logger: Logger) -> Self {
        let (quit_sender, quit_receiver) = oneshot::channel();
        let runner = SnapshotRunner {
            store,
            interval,
            logger,
            quit_receiver,
        };
        let handle = tokio::spawn(runner.into_running());
        SnapshotTask {
            quit_sender,
            handle,
        }
    }

    /// Stop the task and wait for the running save, if any, to finish.
    pub async fn stop(self) {
        let _ = self.quit_sender.send(());
        let _ = self.handle.await;
    }
}

struct SnapshotRunner {
    store: Arc<MemoryStore>,
    interval: Duration,
    logger: Logger,
    quit_receiver: oneshot::Receiver<()>,
}

impl SnapshotRunner {
    async fn into_running(mut self) {
        let start = Instant::now() + INITIAL_DELAY + self.interval;
        let mut interval = tokio::time::interval_at(start, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = &mut self.quit_receiver => break,
                _ = interval.tick() => self.save().await,
            }
        }
        debug!(self.logger, "periodic snapshot task quit");
    }

    async fn save(&self) {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.save_snapshot()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(self.logger, "failed to save snapshot"; "error" => %e),
            Err(e) => error!(self.logger, "failed to join snapshot save task"; "error" => %e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SnapshotConfig;
    use slog::{Discard, o};

    #[test]
    fn write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");

        write_file(&path, b"{}").unwrap();
        assert_eq!(read_file(&path).unwrap(), b"{}");
        assert!(!tmp_path(&path).exists());

        write_file(&path, b"{\"a\":1}").unwrap();
        assert_eq!(read_file(&path).unwrap(), b"{\"a\":1}");
    }

    #[test]
    fn read_absent() {
        let dir = tempfile::tempdir().unwrap();
        let e = read_file(&dir.path().join("absent.json")).unwrap_err();
        assert!(e.is_not_found());
    }

    #[test]
    fn write_to_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no").join("such").join("storage.json");
        assert!(matches!(
            write_file(&path, b"{}"),
            Err(PersistError::Write { .. })
        ));
    }

    #[tokio::test]
    async fn periodic_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        let config = SnapshotConfig {
            path: Some(path.clone()),
            interval: Duration::from_millis(50),
            restore: false,
        };
        let store = Arc::new(MemoryStore::new(config, Logger::root(Discard, o!())));
        store.update("counter", "hits", "8").unwrap();
        // periodic mode, nothing is written on update
        assert!(!path.exists());

        let task = store.spawn_snapshot_task().unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        task.stop().await;

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data, br#"{"hits":{"id":"hits","type":"counter","delta":8}}"#);
    }

    #[tokio::test]
    async fn stop_before_first_tick() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        let config = SnapshotConfig {
            path: Some(path.clone()),
            interval: Duration::from_secs(60),
            restore: false,
        };
        let store = Arc::new(MemoryStore::new(config, Logger::root(Discard, o!())));
        let task = store.spawn_snapshot_task().unwrap();
        tokio::time::timeout(Duration::from_secs(1), task.stop())
            .await
            .unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn no_task_in_write_through_mode() {
        let config = SnapshotConfig {
            path: Some(PathBuf::from("/tmp/unused.json")),
            interval: Duration::ZERO,
            restore: false,
        };
        let store = Arc::new(MemoryStore::new(config, Logger::root(Discard, o!())));
        assert!(store.spawn_snapshot_task().is_none());
    }
}
