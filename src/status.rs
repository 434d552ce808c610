// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Status reporting surface.
//!
//! Each running core publishes its counters under a dotted path of the form
//! `{plugin_name}/{stage_name}_{idx}/{counter}`. Counters are written only
//! by their owning lcore and read by the status thread; occasional torn
//! reads of 64-bit values are acceptable for reporting.

use serde::Serialize;
use std::collections::BTreeMap;

/// A single reported value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatusValue {
    Unsigned(u64),
    Signed(i64),
    Text(String),
}

impl From<u64> for StatusValue {
    fn from(value: u64) -> Self {
        StatusValue::Unsigned(value)
    }
}

impl From<i64> for StatusValue {
    fn from(value: i64) -> Self {
        StatusValue::Signed(value)
    }
}

impl From<usize> for StatusValue {
    fn from(value: usize) -> Self {
        StatusValue::Unsigned(value as u64)
    }
}

impl From<&str> for StatusValue {
    fn from(value: &str) -> Self {
        StatusValue::Text(value.to_string())
    }
}

/// Flat dotted-path -> value container, ordered for stable output.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusReport {
    params: BTreeMap<String, StatusValue>,
}

impl StatusReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_param(&mut self, path: impl Into<String>, value: impl Into<StatusValue>) {
        self.params.insert(path.into(), value.into());
    }

    pub fn get(&self, path: &str) -> Option<&StatusValue> {
        self.params.get(path)
    }

    pub fn get_u64(&self, path: &str) -> Option<u64> {
        match self.params.get(path) {
            Some(StatusValue::Unsigned(v)) => Some(*v),
            Some(StatusValue::Signed(v)) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StatusValue)> {
        self.params.iter()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.params).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Implemented by per-core stats blocks so the manager can aggregate a
/// report while the cores keep running.
pub trait StatusSource: Send + Sync {
    fn status(&self, report: &mut StatusReport, path: &str);
}
