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

//! The small set of tagged enumerations shared between `migrator-store`
//! and `migrator-core`. Kept here, rather than in either crate, so the
//! store can persist them without depending on the engine and the engine
//! can match on them without depending on the store's row types.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MigrationMode {
    FullRewrite,
    Incremental,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConflictStrategy {
    Newest,
    Source,
    Dest,
    Skip,
    Rename,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::CompletedWithErrors
                | TaskStatus::Failed
                | TaskStatus::Cancelled
        )
    }
}

/// ETag-semantics class, keyed off the destination provider. Any ETag
/// containing `-` is treated as composite regardless of class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProviderClass {
    Md5SinglePart,
    Sha1,
    MultipartComposite,
    Opaque,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NetworkQuality {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl NetworkQuality {
    /// Latency thresholds from the design notes: ≤50ms excellent, ≤100ms
    /// good, ≤500ms fair, otherwise poor.
    pub fn from_latency(latency_ms: f64) -> Self {
        if latency_ms <= 50.0 {
            NetworkQuality::Excellent
        } else if latency_ms <= 100.0 {
            NetworkQuality::Good
        } else if latency_ms <= 500.0 {
            NetworkQuality::Fair
        } else {
            NetworkQuality::Poor
        }
    }

    pub fn concurrency_multiplier(&self) -> f64 {
        match self {
            NetworkQuality::Excellent => 2.0,
            NetworkQuality::Good => 1.5,
            NetworkQuality::Fair => 1.0,
            NetworkQuality::Poor => 0.5,
        }
    }

    pub fn chunk_size_multiplier(&self) -> f64 {
        self.concurrency_multiplier()
    }

    pub fn as_ordinal(&self) -> i64 {
        match self {
            NetworkQuality::Poor => 0,
            NetworkQuality::Fair => 1,
            NetworkQuality::Good => 2,
            NetworkQuality::Excellent => 3,
        }
    }
}

/// Per-object worker state machine (spec §4.7). Transitions to `Failed`
/// and `Cancelled` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransferState {
    Planned,
    Heading,
    Reading,
    Writing,
    Finalizing,
    Verified,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Verified | TransferState::Failed | TransferState::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use test_r::test;

    #[test]
    fn migration_mode_round_trips_through_its_string_form() {
        assert_eq!(MigrationMode::FullRewrite.to_string(), "full_rewrite");
        assert_eq!(
            MigrationMode::from_str("incremental").unwrap(),
            MigrationMode::Incremental
        );
    }

    #[test]
    fn network_quality_thresholds_match_design_notes() {
        assert_eq!(NetworkQuality::from_latency(10.0), NetworkQuality::Excellent);
        assert_eq!(NetworkQuality::from_latency(75.0), NetworkQuality::Good);
        assert_eq!(NetworkQuality::from_latency(300.0), NetworkQuality::Fair);
        assert_eq!(NetworkQuality::from_latency(900.0), NetworkQuality::Poor);
    }

    #[test]
    fn task_status_terminal_classification() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }
}
