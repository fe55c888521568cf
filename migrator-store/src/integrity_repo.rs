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

/// One row of the append-only `integrity_results` table (spec §4.9). Never
/// updated after insertion.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct IntegrityRecord {
    pub task_id: String,
    pub object_key: String,
    pub source_etag: Option<String>,
    pub source_size: i64,
    pub source_provider: String,
    pub dest_etag: Option<String>,
    pub dest_size: Option<i64>,
    pub dest_provider: Option<String>,
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
    pub created_at: DateTime<Utc>,
}

/// Aggregate row from the `integrity_summary` view.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct IntegritySummary {
    pub task_id: String,
    pub total: i64,
    pub verified: i64,
    pub failed: i64,
    pub rate: f64,
    pub last_verified: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait IntegrityRepo: Send + Sync {
    async fn store_integrity_result(&self, record: &IntegrityRecord) -> Result<(), RepoError>;

    async fn summary(&self, task_id: &str) -> Result<Option<IntegritySummary>, RepoError>;

    async fn failures(
        &self,
        task_id: &str,
        limit: i64,
    ) -> Result<Vec<IntegrityRecord>, RepoError>;

    /// Recomputes `migration_tasks.verified_objects`/`failed_objects` from
    /// the view -- the in-memory aggregates the coordinator keeps are an
    /// acceleration, this is the source of truth.
    async fn update_aggregates_from_integrity(&self, task_id: &str) -> Result<(), RepoError>;
}

pub struct DbIntegrityRepo<DB: Pool> {
    db_pool: DB,
}

impl<DB: Pool> DbIntegrityRepo<DB> {
    pub fn new(db_pool: DB) -> Self {
        Self { db_pool }
    }
}

#[trait_gen(crate::pool::PostgresPool -> crate::pool::PostgresPool, crate::pool::SqlitePool)]
#[async_trait]
impl IntegrityRepo for DbIntegrityRepo<crate::pool::PostgresPool> {
    async fn store_integrity_result(&self, record: &IntegrityRecord) -> Result<(), RepoError> {
        let query = sqlx::query(
            r#"
              INSERT INTO integrity_results
                (task_id, object_key, source_etag, source_size, source_provider, dest_etag,
                 dest_size, dest_provider, computed_md5, computed_sha1, computed_sha256,
                 computed_crc32, etag_match, size_match, md5_match, sha1_match, is_valid,
                 error_message, created_at)
              VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(&record.task_id)
        .bind(&record.object_key)
        .bind(&record.source_etag)
        .bind(record.source_size)
        .bind(&record.source_provider)
        .bind(&record.dest_etag)
        .bind(record.dest_size)
        .bind(&record.dest_provider)
        .bind(&record.computed_md5)
        .bind(&record.computed_sha1)
        .bind(&record.computed_sha256)
        .bind(&record.computed_crc32)
        .bind(record.etag_match)
        .bind(record.size_match)
        .bind(record.md5_match)
        .bind(record.sha1_match)
        .bind(record.is_valid)
        .bind(&record.error_message)
        .bind(record.created_at);

        self.db_pool
            .with_rw("integrity_results", "store_integrity_result")
            .execute(query)
            .await?;

        Ok(())
    }

    async fn summary(&self, task_id: &str) -> Result<Option<IntegritySummary>, RepoError> {
        let query = sqlx::query_as::<_, IntegritySummary>(
            "SELECT * FROM integrity_summary WHERE task_id = $1",
        )
        .bind(task_id);

        self.db_pool
            .with_ro("integrity_summary", "summary")
            .fetch_optional_as(query)
            .await
    }

    async fn failures(
        &self,
        task_id: &str,
        limit: i64,
    ) -> Result<Vec<IntegrityRecord>, RepoError> {
        let query = sqlx::query_as::<_, IntegrityRecord>(
            r#"
              SELECT * FROM integrity_results
              WHERE task_id = $1 AND is_valid = false
              ORDER BY created_at DESC
              LIMIT $2
            "#,
        )
        .bind(task_id)
        .bind(limit);

        self.db_pool
            .with_ro("integrity_results", "failures")
            .fetch_all_as(query)
            .await
    }

    async fn update_aggregates_from_integrity(&self, task_id: &str) -> Result<(), RepoError> {
        let query = sqlx::query(
            r#"
              UPDATE migration_tasks
              SET verified_objects = COALESCE(
                      (SELECT verified FROM integrity_summary WHERE task_id = $1), 0),
                  failed_objects = COALESCE(
                      (SELECT failed FROM integrity_summary WHERE task_id = $1), 0)
              WHERE task_id = $1
            "#,
        )
        .bind(task_id);

        self.db_pool
            .with_rw("migration_tasks", "update_aggregates_from_integrity")
            .execute(query)
            .await?;

        Ok(())
    }
}
