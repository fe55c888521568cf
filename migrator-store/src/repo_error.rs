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

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("DB error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("DB error: {0}")]
    Other(String),
}

impl RepoError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Connection-level faults are worth retrying once by a caller;
    /// constraint violations and decode errors are not.
    pub fn is_retriable(&self) -> bool {
        match self {
            RepoError::Sqlx(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) => true,
            RepoError::Sqlx(_) => false,
            RepoError::Other(_) => false,
        }
    }
}

impl SafeDisplay for RepoError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}
