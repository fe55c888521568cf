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

use crate::pool::Pool;
use crate::RepoError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conditional_trait_gen::trait_gen;

/// A durable row of the `migration_tasks` table. Every field other than
/// `task_id` is mutable across the life of the task (see `save_task`,
/// which upserts).
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct TaskRecord {
    pub task_id: String,
    pub status: String,
    pub mode: String,
    pub dry_run: bool,
    pub source_bucket: String,
    pub source_prefix: String,
    pub dest_bucket: String,
    pub dest_prefix: String,
    pub conflict_strategy: Option<String>,
    pub delete_removed: bool,
    pub objects_total: i64,
    pub objects_copied: i64,
    pub bytes_total: i64,
    pub bytes_copied: i64,
    pub verified_objects: i64,
    pub failed_objects: i64,
    /// JSON-encoded bounded list of error strings.
    pub errors: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait TaskRepo: Send + Sync {
    /// Upserts by `task_id`; inserts a new row on first call, otherwise
    /// overwrites every mutable field.
    async fn save_task(&self, task: &TaskRecord) -> Result<(), RepoError>;

    async fn load_task(&self, task_id: &str) -> Result<Option<TaskRecord>, RepoError>;

    /// Bounded, recency-ordered listing, optionally filtered by status.
    async fn list_tasks(
        &self,
        status: Option<&str>,
        limit: i64,
    ) -> Result<Vec<TaskRecord>, RepoError>;

    /// Returns every task currently in `running` -- used by the
    /// coordinator's restart reconciliation pass.
    async fn list_running_tasks(&self) -> Result<Vec<TaskRecord>, RepoError>;

    /// Deletes terminal tasks whose `updated_at` predates `older_than`.
    async fn cleanup_old_tasks(&self, older_than: DateTime<Utc>) -> Result<u64, RepoError>;
}

pub struct DbTaskRepo<DB: Pool> {
    db_pool: DB,
}

impl<DB: Pool> DbTaskRepo<DB> {
    pub fn new(db_pool: DB) -> Self {
        Self { db_pool }
    }
}

#[trait_gen(crate::pool::PostgresPool -> crate::pool::PostgresPool, crate::pool::SqlitePool)]
#[async_trait]
impl TaskRepo for DbTaskRepo<crate::pool::PostgresPool> {
    async fn save_task(&self, task: &TaskRecord) -> Result<(), RepoError> {
        let query = sqlx::query(
            r#"
              INSERT INTO migration_tasks
                (task_id, status, mode, dry_run, source_bucket, source_prefix, dest_bucket,
                 dest_prefix, conflict_strategy, delete_removed, objects_total, objects_copied,
                 bytes_total, bytes_copied, verified_objects, failed_objects, errors,
                 started_at, ended_at, updated_at)
              VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
              ON CONFLICT (task_id) DO UPDATE
              SET status = $2, objects_total = $11, objects_copied = $12, bytes_total = $13,
                  bytes_copied = $14, verified_objects = $15, failed_objects = $16, errors = $17,
                  ended_at = $19, updated_at = $20
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.status)
        .bind(&task.mode)
        .bind(task.dry_run)
        .bind(&task.source_bucket)
        .bind(&task.source_prefix)
        .bind(&task.dest_bucket)
        .bind(&task.dest_prefix)
        .bind(&task.conflict_strategy)
        .bind(task.delete_removed)
        .bind(task.objects_total)
        .bind(task.objects_copied)
        .bind(task.bytes_total)
        .bind(task.bytes_copied)
        .bind(task.verified_objects)
        .bind(task.failed_objects)
        .bind(&task.errors)
        .bind(task.started_at)
        .bind(task.ended_at)
        .bind(task.updated_at);

        self.db_pool
            .with_rw("migration_tasks", "save_task")
            .execute(query)
            .await?;

        Ok(())
    }

    async fn load_task(&self, task_id: &str) -> Result<Option<TaskRecord>, RepoError> {
        let query = sqlx::query_as::<_, TaskRecord>(
            "SELECT * FROM migration_tasks WHERE task_id = $1",
        )
        .bind(task_id);

        self.db_pool
            .with_ro("migration_tasks", "load_task")
            .fetch_optional_as(query)
            .await
    }

    async fn list_tasks(
        &self,
        status: Option<&str>,
        limit: i64,
    ) -> Result<Vec<TaskRecord>, RepoError> {
        let query = match status {
            Some(status) => sqlx::query_as::<_, TaskRecord>(
                "SELECT * FROM migration_tasks WHERE status = $1 ORDER BY updated_at DESC LIMIT $2",
            )
            .bind(status)
            .bind(limit),
            None => sqlx::query_as::<_, TaskRecord>(
                "SELECT * FROM migration_tasks ORDER BY updated_at DESC LIMIT $1",
            )
            .bind(limit),
        };

        self.db_pool
            .with_ro("migration_tasks", "list_tasks")
            .fetch_all_as(query)
            .await
    }

    async fn list_running_tasks(&self) -> Result<Vec<TaskRecord>, RepoError> {
        let query = sqlx::query_as::<_, TaskRecord>(
            "SELECT * FROM migration_tasks WHERE status = 'running'",
        );

        self.db_pool
            .with_ro("migration_tasks", "list_running_tasks")
            .fetch_all_as(query)
            .await
    }

    async fn cleanup_old_tasks(&self, older_than: DateTime<Utc>) -> Result<u64, RepoError> {
        let query = sqlx::query(
            r#"
              DELETE FROM migration_tasks
              WHERE updated_at < $1
                AND status IN ('completed', 'completed_with_errors', 'failed', 'cancelled')
            "#,
        )
        .bind(older_than);

        self.db_pool
            .with_rw("migration_tasks", "cleanup_old_tasks")
            .execute(query)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn task_record_errors_field_is_json_array_text() {
        let record = TaskRecord {
            task_id: "t-1".to_string(),
            status: "running".to_string(),
            mode: "incremental".to_string(),
            dry_run: false,
            source_bucket: "src".to_string(),
            source_prefix: "".to_string(),
            dest_bucket: "dst".to_string(),
            dest_prefix: "".to_string(),
            conflict_strategy: Some("newest".to_string()),
            delete_removed: false,
            objects_total: 0,
            objects_copied: 0,
            bytes_total: 0,
            bytes_copied: 0,
            verified_objects: 0,
            failed_objects: 0,
            errors: "[]".to_string(),
            started_at: Utc::now(),
            ended_at: None,
            updated_at: Utc::now(),
        };
        let decoded: Vec<String> = serde_json::from_str(&record.errors).unwrap();
        assert!(decoded.is_empty());
    }
}
