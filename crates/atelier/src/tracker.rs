//! Invocation Tracker
//!
//! Capped history of plugin method calls. Diagnostic only; nothing reads it
//! to make decisions.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::error::HostError;
use crate::types::{whole_millis, InvocationRecord};

pub struct InvocationTracker {
    capacity: usize,
    records: Mutex<VecDeque<InvocationRecord>>,
}

impl InvocationTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append the outcome of one call, evicting the oldest record when full
    pub fn record(
        &self,
        plugin_id: &str,
        method: &str,
        outcome: &Result<Value, HostError>,
        elapsed: Duration,
    ) -> InvocationRecord {
        let (success, result, error) = match outcome {
            Ok(value) => (true, Some(value.clone()), None),
            Err(e) => (false, None, Some(e.to_string())),
        };
        let record = InvocationRecord {
            id: Uuid::new_v4().to_string(),
            plugin_id: plugin_id.to_string(),
            method: method.to_string(),
            success,
            result,
            error,
            execution_time_ms: whole_millis(elapsed),
            timestamp: Utc::now(),
        };

        let mut records = self.records.lock();
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record.clone());
        record
    }

    /// Newest first, optionally filtered by plugin
    pub fn recent(&self, plugin_id: Option<&str>, limit: Option<usize>) -> Vec<InvocationRecord> {
        let records = self.records.lock();
        records
            .iter()
            .rev()
            .filter(|r| plugin_id.is_none_or(|id| r.plugin_id == id))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}
