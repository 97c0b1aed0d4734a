/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MetricError;

mod value;
pub use value::MetricValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

impl FromStr for MetricType {
    type Err = MetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(MetricType::Counter),
            "gauge" => Ok(MetricType::Gauge),
            _ => Err(MetricError::UnsupportedKind(s.to_string())),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The wire form of a metric, as sent by the reporting clients.
///
/// Nothing is checked at decode time, so an empty id or an unknown type is
/// reported as a [`MetricError`] by the store, not as a JSON error.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub id: String,
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    // an f64 target, so integer literals like 0 are still decoded as gauge readings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl MetricRecord {
    pub fn gauge(id: &str, value: f64) -> Self {
        MetricRecord {
            id: id.to_string(),
            r#type: MetricType::Gauge.as_str().to_string(),
            delta: None,
            value: Some(value),
        }
    }

    pub fn counter(id: &str, delta: i64) -> Self {
        MetricRecord {
            id: id.to_string(),
            r#type: MetricType::Counter.as_str().to_string(),
            delta: Some(delta),
            value: None,
        }
    }
}

/// A validated metric.
///
/// The type tag is carried by the value, so a gauge never holds a delta and a
/// counter never holds a reading.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "MetricRecord", try_from = "MetricRecord")]
pub struct Metric {
    id: String,
    value: MetricValue,
}

impl Metric {
    pub fn new(id: &str, value: MetricValue) -> Result<Self, MetricError> {
        if id.is_empty() {
            return Err(MetricError::InvalidIdentity);
        }
        Ok(Metric {
            id: id.to_string(),
            value,
        })
    }

    /// Decode the plain text form `<type>/<id>/<value>`.
    pub fn parse(r#type: &str, id: &str, value: &str) -> Result<Self, MetricError> {
        let r#type = MetricType::from_str(r#type)?;
        if id.is_empty() {
            return Err(MetricError::InvalidIdentity);
        }
        let value = MetricValue::parse(r#type, value)?;
        Metric::new(id, value)
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn value(&self) -> MetricValue {
        self.value
    }

    #[inline]
    pub fn r#type(&self) -> MetricType {
        self.value.metric_type()
    }

    pub(crate) fn merge(&mut self, new: MetricValue) -> Result<(), MetricError> {
        if self.value.merge(new) {
            Ok(())
        } else {
            Err(MetricError::KindMismatch {
                id: self.id.clone(),
                stored: self.r#type(),
                requested: new.metric_type(),
            })
        }
    }
}

impl TryFrom<MetricRecord> for Metric {
    type Error = MetricError;

    fn try_from(record: MetricRecord) -> Result<Self, Self::Error> {
        let r#type = MetricType::from_str(&record.r#type)?;
        if record.id.is_empty() {
            return Err(MetricError::InvalidIdentity);
        }

        // the field of the other type is dropped
        let value = match r#type {
            MetricType::Gauge => {
                let f = record.value.ok_or(MetricError::MissingValue(r#type))?;
                MetricValue::gauge(f).ok_or_else(|| MetricError::InvalidValue {
                    kind: r#type,
                    value: f.to_string(),
                    reason: "not a finite number".to_string(),
                })?
            }
            MetricType::Counter => {
                let i = record.delta.ok_or(MetricError::MissingValue(r#type))?;
                MetricValue::Signed(i)
            }
        };

        Ok(Metric {
            id: record.id,
            value,
        })
    }
}

impl From<Metric> for MetricRecord {
    fn from(metric: Metric) -> Self {
        let (delta, value) = match metric.value {
            MetricValue::Double(f) => (None, Some(f)),
            MetricValue::Signed(i) => (Some(i), None),
        };
        MetricRecord {
            id: metric.id,
            r#type: metric.value.metric_type().as_str().to_string(),
            delta,
            value,
        }
    }
}
