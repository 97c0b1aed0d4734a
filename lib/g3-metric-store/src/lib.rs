/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

mod error;
pub use error::{MetricError, MirrorError, PersistError, StorageError};

pub mod config;
pub mod memory;
pub mod mirror;
pub mod types;

mod storage;
pub use storage::MetricStorage;
