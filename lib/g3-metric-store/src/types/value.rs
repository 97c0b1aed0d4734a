/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::fmt;
use std::str::FromStr;

use super::MetricType;
use crate::error::MetricError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    /// gauge reading
    Double(f64),
    /// counter delta
    Signed(i64),
}

impl MetricValue {
    /// Decode a plain text value, the leading and trailing whitespaces are ignored.
    pub fn parse(kind: MetricType, s: &str) -> Result<Self, MetricError> {
        let s = s.trim();
        let invalid = |reason: String| MetricError::InvalidValue {
            kind,
            value: s.to_string(),
            reason,
        };

        match kind {
            MetricType::Gauge => {
                let f = f64::from_str(s).map_err(|e| invalid(e.to_string()))?;
                MetricValue::gauge(f).ok_or_else(|| invalid("not a finite number".to_string()))
            }
            MetricType::Counter => {
                let i = i64::from_str(s).map_err(|e| invalid(e.to_string()))?;
                Ok(MetricValue::Signed(i))
            }
        }
    }

    /// Non-finite readings can not be encoded in the JSON snapshot.
    pub(crate) fn gauge(f: f64) -> Option<Self> {
        f.is_finite().then_some(MetricValue::Double(f))
    }

    pub fn metric_type(&self) -> MetricType {
        match self {
            MetricValue::Double(_) => MetricType::Gauge,
            MetricValue::Signed(_) => MetricType::Counter,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            MetricValue::Double(f) => *f,
            MetricValue::Signed(i) => *i as f64,
        }
    }

    /// Apply a new value of the same type.
    ///
    /// Gauges are overwritten, counters accumulate. Negative deltas are summed
    /// like any other and the sum saturates at the i64 bounds.
    /// Returns false and leaves `self` untouched if the types differ.
    pub(crate) fn merge(&mut self, new: MetricValue) -> bool {
        match (self, new) {
            (MetricValue::Double(v), MetricValue::Double(n)) => {
                *v = n;
                true
            }
            (MetricValue::Signed(v), MetricValue::Signed(n)) => {
                *v = v.saturating_add(n);
                true
            }
            _ => false,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Signed(i) => f.write_str(itoa::Buffer::new().format(*i)),
            // shortest repr without exponent, so 37.0 is printed as 37
            MetricValue::Double(v) => fmt::Display::fmt(v, f),
        }
    }
}
