// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Engine-facing domain types (spec §3). These are the coordinator's and
//! the planner's working set; they get translated to and from
//! `migrator_store::TaskRecord` / `IntegrityRecord` rows at the store
//! boundary rather than being persisted directly.

use chrono::{DateTime, Utc};
use migrator_common::model::{ConflictStrategy, MigrationMode, ProviderClass, TaskStatus};
use std::collections::VecDeque;
use std::time::Duration;

/// A source or destination locator. `bucket = None` means "all buckets"
/// (spec §14, `Planner::plan_all_buckets`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Locator {
    pub bucket: Option<String>,
    pub prefix: String,
}

impl Locator {
    pub fn single(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bucket: Some(bucket.into()),
            prefix: prefix.into(),
        }
    }

    pub fn all_buckets(prefix: impl Into<String>) -> Self {
        Self {
            bucket: None,
            prefix: prefix.into(),
        }
    }

    pub fn is_all_buckets(&self) -> bool {
        self.bucket.is_none()
    }
}

/// Bounded accumulator for a task's `errors` list (spec §3: "bounded list
/// of strings"). Oldest entries are dropped once the cap is reached so a
/// pathological task cannot grow this without limit.
#[derive(Clone, Debug, Default)]
pub struct BoundedErrors {
    capacity: usize,
    entries: VecDeque<String>,
}

impl BoundedErrors {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, message: impl Into<String>) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(message.into());
    }

    pub fn as_slice(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }
}

/// The coordinator's in-memory view of one migration (spec §3 Task).
/// `migrator_store::TaskRecord` is the row this is flushed to and
/// reconstructed from.
#[derive(Clone, Debug)]
pub struct Task {
    pub task_id: String,
    pub status: TaskStatus,
    pub mode: MigrationMode,
    pub dry_run: bool,
    pub source: Locator,
    pub destination: Locator,
    pub conflict_strategy: Option<ConflictStrategy>,
    pub delete_removed: bool,
    pub objects_total: i64,
    pub objects_copied: i64,
    pub bytes_total: i64,
    pub bytes_copied: i64,
    pub verified_objects: i64,
    pub failed_objects: i64,
    pub errors: BoundedErrors,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Current transfer speed in bytes/sec, derived from elapsed wall
    /// time, not stored directly (spec §3: "current speed" is a derived
    /// progress attribute).
    pub fn current_speed_bytes_per_sec(&self) -> f64 {
        let elapsed = (Utc::now() - self.started_at).num_milliseconds().max(1) as f64 / 1000.0;
        self.bytes_copied as f64 / elapsed
    }

    /// Estimated time to completion, `None` when there is no useful
    /// throughput sample yet or the task is already done.
    pub fn eta(&self) -> Option<Duration> {
        if self.objects_copied >= self.objects_total || self.bytes_total <= self.bytes_copied {
            return None;
        }
        let speed = self.current_speed_bytes_per_sec();
        if speed <= 0.0 {
            return None;
        }
        let remaining = (self.bytes_total - self.bytes_copied) as f64;
        Some(Duration::from_secs_f64(remaining / speed))
    }
}

/// One in-flight unit of work for a single source object (spec §3
/// WorkItem). Produced by the planner, consumed exactly once by a
/// worker.
#[derive(Clone, Debug)]
pub struct WorkItem {
    pub source_key: String,
    pub source_size: i64,
    pub source_etag: String,
    pub dest_key: String,
    pub retry_count: u32,
}

/// The in-memory shape of one verification outcome, translated to
/// `migrator_store::IntegrityRecord` at the store boundary.
#[derive(Clone, Debug)]
pub struct VerificationOutcome {
    pub object_key: String,
    pub source_etag: String,
    pub source_size: i64,
    pub source_provider: ProviderClass,
    pub dest_etag: Option<String>,
    pub dest_size: Option<i64>,
    pub dest_provider: Option<ProviderClass>,
    pub computed_md5: String,
    pub computed_sha1: String,
    pub computed_sha256: String,
    pub computed_crc32: String,
    pub etag_match: bool,
    pub size_match: bool,
    pub md5_match: bool,
    pub sha1_match: bool,
    pub is_valid: bool,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn bounded_errors_drops_oldest_past_capacity() {
        let mut errors = BoundedErrors::new(2);
        errors.push("a");
        errors.push("b");
        errors.push("c");
        assert_eq!(errors.as_slice(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn locator_all_buckets_has_no_bucket() {
        let locator = Locator::all_buckets("prefix/");
        assert!(locator.is_all_buckets());
    }
}
