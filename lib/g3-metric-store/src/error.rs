/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::MetricType;

#[derive(Debug, Error)]
pub enum MetricError {
    #[error("empty metric id")]
    InvalidIdentity,
    #[error("unsupported metric type {0}")]
    UnsupportedKind(String),
    #[error("invalid {kind} value {value:?}: {reason}")]
    InvalidValue {
        kind: MetricType,
        value: String,
        reason: String,
    },
    #[error("no value field for {0} metric")]
    MissingValue(MetricType),
    #[error("metric {id} is a {stored}, not a {requested}")]
    KindMismatch {
        id: String,
        stored: MetricType,
        requested: MetricType,
    },
    #[error("metric {0} not found")]
    NotFound(String),
}

impl MetricError {
    /// Errors caused by a malformed update rather than by the store state.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            MetricError::InvalidIdentity
                | MetricError::UnsupportedKind(_)
                | MetricError::InvalidValue { .. }
                | MetricError::MissingValue(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("mirror unavailable: {0}")]
    Unavailable(String),
    #[error("mirror write failed: {0}")]
    WriteFailed(#[from] rusqlite::Error),
    #[error("mirror operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid mirror row {id}: {source}")]
    InvalidRow { id: String, source: MetricError },
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to read snapshot file {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write snapshot file {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("invalid snapshot data: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snapshot record {id} is stored under key {key}")]
    KeyMismatch { key: String, id: String },
}

impl PersistError {
    pub(crate) fn is_not_found(&self) -> bool {
        matches!(self, PersistError::Read { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Metric(#[from] MetricError),
    #[error(transparent)]
    Mirror(#[from] MirrorError),
}
