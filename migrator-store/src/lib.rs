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

#[cfg(test)]
test_r::enable!();

pub mod integrity_repo;
pub mod migration;
pub mod pool;
pub mod repo_error;
pub mod task_repo;

pub use integrity_repo::{DbIntegrityRepo, IntegrityRecord, IntegrityRepo, IntegritySummary};
pub use pool::{Pool, PostgresPool, SqlitePool};
pub use repo_error::RepoError;
pub use task_repo::{DbTaskRepo, TaskRecord, TaskRepo};
