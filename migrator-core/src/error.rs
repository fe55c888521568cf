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

use migrator_common::SafeDisplay;
use migrator_store::RepoError;

/// Object-store faults raised by the connection pool (C1) and consumed by
/// the transfer worker (C7). `is_retriable` drives `with_retries`: 5xx,
/// timeouts and throttling are transient; 4xx auth/argument errors are
/// terminal for the calling object.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("object store error: {0}")]
    ObjectStore(String),
    #[error("connection timed out")]
    Timeout,
    #[error("throttled by provider")]
    Throttled,
    #[error("authentication rejected: {0}")]
    Unauthorized(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("ETag mismatch")]
    EtagMismatch,
    #[error("size mismatch: source {source_size}, destination {dest_size}")]
    SizeMismatch { source_size: i64, dest_size: i64 },
    #[error("task cancelled")]
    Cancelled,
    #[error("store error: {0}")]
    Store(#[from] RepoError),
}

impl TransferError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, TransferError::Timeout | TransferError::Throttled)
    }
}

impl SafeDisplay for TransferError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("failed to list source objects: {0}")]
    ListFailed(String),
    #[error("failed to list destination buckets: {0}")]
    ListBucketsFailed(String),
    #[error("failed to create destination bucket: {0}")]
    CreateBucketFailed(String),
    #[error("store error: {0}")]
    Store(#[from] RepoError),
}

impl PlannerError {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            PlannerError::ListFailed(_) | PlannerError::ListBucketsFailed(_)
        )
    }
}

impl SafeDisplay for PlannerError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

/// Task-level fatal errors (spec §7 kind 3): invalid arguments, credential
/// rejection, inability to list source or create the destination bucket.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("invalid task arguments: {0}")]
    InvalidArguments(String),
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error(transparent)]
    Planner(#[from] PlannerError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("store error: {0}")]
    Store(#[from] RepoError),
}

impl CoordinatorError {
    pub fn is_retriable(&self) -> bool {
        match self {
            CoordinatorError::Planner(err) => err.is_retriable(),
            CoordinatorError::Transfer(err) => err.is_retriable(),
            _ => false,
        }
    }
}

impl SafeDisplay for CoordinatorError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}
