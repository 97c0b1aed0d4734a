/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use slog::{Logger, info, warn};

use super::MetricMirror;
use crate::config::SqliteMirrorConfig;
use crate::error::{MetricError, MirrorError};
use crate::types::{Metric, MetricType, MetricValue};

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS metrics (
    name TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    gauge_value REAL,
    counter_value INTEGER
)";

const UPSERT_SQL: &str = "INSERT INTO metrics (name, type, gauge_value, counter_value)
    VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT(name) DO UPDATE SET
        type = excluded.type,
        gauge_value = excluded.gauge_value,
        counter_value = excluded.counter_value";

// sqlite virtual machine steps between two deadline checks
const PROGRESS_OPS: i32 = 1000;

const SELECT_SQL: &str = "SELECT type, gauge_value, counter_value FROM metrics WHERE name = ?1";

pub struct SqliteMirror {
    config: SqliteMirrorConfig,
    logger: Logger,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteMirror {
    /// Open the database and create the metrics table if needed.
    pub fn open(config: SqliteMirrorConfig, logger: Logger) -> Result<Self, MirrorError> {
        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(config.timeout)?;
        conn.execute_batch(CREATE_TABLE_SQL)?;
        info!(logger, "sqlite mirror opened";
            "path" => %config.path,
            "timeout" => ?config.timeout,
        );
        Ok(SqliteMirror {
            config,
            logger,
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Run `f` on the blocking pool, bounded by `timeout`.
    ///
    /// The deadline is checked by sqlite itself while `f` runs, so a statement
    /// still running at the deadline is interrupted and `f` fails. The result is
    /// only returned once the blocking work is over, so a timeout always means
    /// that nothing was written.
    async fn run<T, F>(&self, timeout: Duration, f: F) -> Result<T, MirrorError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, Instant) -> Result<T, MirrorError> + Send + 'static,
    {
        let deadline = Instant::now() + timeout;
        let conn = self.conn.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap();
            let Some(c) = guard.as_mut() else {
                return Err(MirrorError::Unavailable("connection closed".to_string()));
            };
            if Instant::now() >= deadline {
                return Err(MirrorError::Timeout(timeout));
            }
            c.progress_handler(PROGRESS_OPS, Some(move || Instant::now() >= deadline));
            let r = f(c, deadline);
            c.progress_handler(0, None::<fn() -> bool>);
            r
        });
        match task.await {
            Ok(Err(e)) if is_interrupted(&e) => Err(MirrorError::Timeout(timeout)),
            Ok(r) => r,
            Err(e) => Err(MirrorError::Unavailable(format!(
                "failed to join blocking task: {e}"
            ))),
        }
    }

    /// Read back the stored state of one metric.
    pub async fn load(&self, id: &str) -> Result<Option<Metric>, MirrorError> {
        let id = id.to_string();
        self.run(self.config.timeout, move |conn, _| {
            let row = conn
                .query_row(SELECT_SQL, [&id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                    ))
                })
                .optional()?;
            let Some((kind, gauge, counter)) = row else {
                return Ok(None);
            };
            decode_row(&id, &kind, gauge, counter)
                .map(Some)
                .map_err(|source| MirrorError::InvalidRow { id, source })
        })
        .await
    }
}

fn decode_row(
    id: &str,
    kind: &str,
    gauge: Option<f64>,
    counter: Option<i64>,
) -> Result<Metric, MetricError> {
    let kind = MetricType::from_str(kind)?;
    let value = match kind {
        MetricType::Gauge => gauge.map(MetricValue::Double),
        MetricType::Counter => counter.map(MetricValue::Signed),
    };
    let value = value.ok_or(MetricError::MissingValue(kind))?;
    Metric::new(id, value)
}

fn is_interrupted(e: &MirrorError) -> bool {
    matches!(
        e,
        MirrorError::WriteFailed(rusqlite::Error::SqliteFailure(f, _))
            if f.code == rusqlite::ErrorCode::OperationInterrupted
    )
}

fn upsert_one(conn: &Connection, metric: &Metric) -> rusqlite::Result<usize> {
    let (gauge, counter) = split_value(metric.value());
    conn.prepare_cached(UPSERT_SQL)?.execute(params![
        metric.id(),
        metric.r#type().as_str(),
        gauge,
        counter
    ])
}

fn split_value(value: MetricValue) -> (Option<f64>, Option<i64>) {
    match value {
        MetricValue::Double(f) => (Some(f), None),
        MetricValue::Signed(i) => (None, Some(i)),
    }
}

#[async_trait]
impl MetricMirror for SqliteMirror {
    #[inline]
    fn r#type(&self) -> &'static str {
        "sqlite"
    }

    async fn upsert(&self, metric: &Metric) -> Result<(), MirrorError> {
        let metric = metric.clone();
        self.run(self.config.timeout, move |conn, _| {
            upsert_one(conn, &metric)?;
            Ok(())
        })
        .await
    }

    async fn upsert_batch(&self, metrics: &[Metric]) -> Result<(), MirrorError> {
        if metrics.is_empty() {
            return Ok(());
        }
        let metrics = metrics.to_vec();
        let timeout = self.config.timeout;
        self.run(timeout, move |conn, deadline| {
            // dropped without commit on error, which rolls back
            let tx = conn.transaction()?;
            for m in &metrics {
                upsert_one(&tx, m)?;
            }
            if Instant::now() >= deadline {
                return Err(MirrorError::Timeout(timeout));
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn health_check(&self) -> bool {
        let timeout = self.config.health_timeout;
        // also bounds the wait for a connection held by a slow write
        let r = tokio::time::timeout(
            timeout,
            self.run(timeout, |conn, _| {
                let v = conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
                Ok(v)
            }),
        )
        .await;
        matches!(r, Ok(Ok(_)))
    }

    async fn close(&self) {
        let conn = self.conn.clone();
        let r = tokio::task::spawn_blocking(move || conn.lock().unwrap().take().map(|c| c.close()))
            .await;
        match r {
            Ok(Some(Ok(_))) => info!(self.logger, "sqlite mirror closed"),
            Ok(Some(Err((_, e)))) => {
                warn!(self.logger, "failed to close sqlite mirror"; "error" => %e)
            }
            Ok(None) => {}
            Err(e) => warn!(self.logger, "failed to join close task"; "error" => %e),
        }
    }
}
