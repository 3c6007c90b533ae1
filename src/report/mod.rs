//! Run-to-run comparison and regression flagging.

use crate::catalog::{DiagnosticQuery, SortDirection};
use crate::error::SentryError;
use crate::executor::RunResult;
use crate::target::Row;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Default relative worsening that counts as a regression.
pub const DEFAULT_THRESHOLD: f64 = 0.20;

/// Metric change for one aligned row. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Regression {
    pub query_id: String,
    pub baseline_at: DateTime<Utc>,
    pub current_at: DateTime<Utc>,
    /// Identity column value the two rows were aligned on.
    pub identity: String,
    pub metric: String,
    pub baseline_value: f64,
    pub current_value: f64,
    /// `current - baseline`.
    pub delta: f64,
    /// Worsening relative to the baseline; negative when the metric improved.
    pub relative_change: f64,
    pub exceeds_threshold: bool,
}

/// Compares two runs of the same query.
#[derive(Debug, Clone, Copy)]
pub struct ReportComparator {
    threshold: f64,
}

impl Default for ReportComparator {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl ReportComparator {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Align `current` against `baseline` by the query's identity column.
    ///
    /// Yields one record per current row that has a counterpart in the
    /// baseline and numeric metric values on both sides, in current-run order.
    /// Nothing is cached: each call recomputes from the two runs.
    pub fn compare<'a>(
        &self,
        query: &'a DiagnosticQuery,
        baseline: &'a RunResult,
        current: &'a RunResult,
    ) -> Result<impl Iterator<Item = Regression> + 'a, SentryError> {
        if baseline.query_id() != query.id || current.query_id() != query.id {
            return Err(SentryError::MismatchedRuns {
                expected: query.id.clone(),
                baseline: baseline.query_id().to_string(),
                current: current.query_id().to_string(),
            });
        }
        let metric = query.metric.as_deref().ok_or_else(|| {
            SentryError::Config(format!("query '{}' declares no metric column", query.id))
        })?;
        let identity = query.identity.as_deref().ok_or_else(|| {
            SentryError::Config(format!("query '{}' declares no identity column", query.id))
        })?;

        // First occurrence wins when an identity repeats.
        let mut before: HashMap<String, f64> = HashMap::new();
        for row in baseline.rows() {
            if let (Some(key), Some(value)) = (identity_key(row, identity), metric_value(row, metric)) {
                before.entry(key).or_insert(value);
            }
        }

        let threshold = self.threshold;
        let direction = query.direction;
        Ok(current.rows().iter().filter_map(move |row| {
            let key = identity_key(row, identity)?;
            let current_value = metric_value(row, metric)?;
            let baseline_value = *before.get(&key)?;
            let relative_change = worsening(baseline_value, current_value, direction);
            Some(Regression {
                query_id: query.id.clone(),
                baseline_at: baseline.timestamp(),
                current_at: current.timestamp(),
                identity: key,
                metric: metric.to_string(),
                baseline_value,
                current_value,
                delta: current_value - baseline_value,
                relative_change,
                exceeds_threshold: relative_change > threshold,
            })
        }))
    }
}

/// Relative change in the "worse" direction of the metric.
fn worsening(baseline: f64, current: f64, direction: SortDirection) -> f64 {
    let signed = match direction {
        SortDirection::Descending => current - baseline,
        SortDirection::Ascending => baseline - current,
    };
    if baseline == 0.0 {
        return match signed {
            s if s > 0.0 => f64::INFINITY,
            s if s < 0.0 => f64::NEG_INFINITY,
            _ => 0.0,
        };
    }
    signed / baseline.abs()
}

fn identity_key(row: &Row, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Numeric metric value; engines often return big integers and decimals as text.
fn metric_value(row: &Row, column: &str) -> Option<f64> {
    let value = match row.get(column)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    value.filter(|v| v.is_finite())
}
