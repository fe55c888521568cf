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

use crate::RepoError;
use migrator_common::config::{DbPostgresConfig, DbSqliteConfig};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, Postgres, Sqlite};
use std::time::Duration;
use tracing::debug;

/// A pool of database connections labelled per call so every query can be
/// traced back to the table and operation it belongs to, mirroring the
/// `with_ro`/`with_rw` naming convention used throughout this workspace's
/// repo layer.
pub trait Pool: Clone + Send + Sync + 'static {
    type LabelledApi;

    /// A read-only borrow, for `SELECT`s.
    fn with_ro(&self, table: &'static str, op: &'static str) -> Self::LabelledApi;

    /// A read-write borrow, for `INSERT`/`UPDATE`/`DELETE`.
    fn with_rw(&self, table: &'static str, op: &'static str) -> Self::LabelledApi;
}

#[derive(Clone)]
pub struct PostgresPool {
    pool: sqlx::PgPool,
}

impl PostgresPool {
    pub async fn connect(config: &DbPostgresConfig) -> Result<Self, RepoError> {
        let conn_options = PgConnectOptions::new()
            .host(config.host.as_str())
            .port(config.port)
            .database(config.database.as_str())
            .username(config.username.as_str())
            .password(config.password.as_str());

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .idle_timeout(Duration::from_secs(300))
            .connect_with(conn_options)
            .await?;

        Ok(Self { pool })
    }

    pub fn raw(&self) -> &sqlx::PgPool {
        &self.pool
    }
}

impl Pool for PostgresPool {
    type LabelledApi = LabelledPoolApi<Postgres>;

    fn with_ro(&self, table: &'static str, op: &'static str) -> Self::LabelledApi {
        LabelledPoolApi::new(self.pool.clone(), table, op)
    }

    fn with_rw(&self, table: &'static str, op: &'static str) -> Self::LabelledApi {
        LabelledPoolApi::new(self.pool.clone(), table, op)
    }
}

#[derive(Clone)]
pub struct SqlitePool {
    pool: sqlx::SqlitePool,
}

impl SqlitePool {
    pub async fn connect(config: &DbSqliteConfig) -> Result<Self, RepoError> {
        let conn_options = SqliteConnectOptions::new()
            .filename(std::path::Path::new(config.database.as_str()))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(conn_options)
            .await?;

        Ok(Self { pool })
    }

    pub fn raw(&self) -> &sqlx::SqlitePool {
        &self.pool
    }
}

impl Pool for SqlitePool {
    type LabelledApi = LabelledPoolApi<Sqlite>;

    fn with_ro(&self, table: &'static str, op: &'static str) -> Self::LabelledApi {
        LabelledPoolApi::new(self.pool.clone(), table, op)
    }

    fn with_rw(&self, table: &'static str, op: &'static str) -> Self::LabelledApi {
        LabelledPoolApi::new(self.pool.clone(), table, op)
    }
}

/// A pool handle scoped to one table/operation pair, so every query it
/// runs carries those two labels into its tracing span.
pub struct LabelledPoolApi<DB: sqlx::Database> {
    pool: sqlx::Pool<DB>,
    table: &'static str,
    op: &'static str,
}

impl<DB: sqlx::Database> LabelledPoolApi<DB> {
    fn new(pool: sqlx::Pool<DB>, table: &'static str, op: &'static str) -> Self {
        Self { pool, table, op }
    }
}

impl LabelledPoolApi<Postgres> {
    pub async fn execute(
        &self,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<u64, RepoError> {
        debug!(table = self.table, op = self.op, "executing query");
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn fetch_optional_as<T>(
        &self,
        query: sqlx::query::QueryAs<'_, Postgres, T, sqlx::postgres::PgArguments>,
    ) -> Result<Option<T>, RepoError>
    where
        T: for<'r> FromRow<'r, sqlx::postgres::PgRow> + Send + Unpin,
    {
        debug!(table = self.table, op = self.op, "fetching optional row");
        Ok(query.fetch_optional(&self.pool).await?)
    }

    pub async fn fetch_all_as<T>(
        &self,
        query: sqlx::query::QueryAs<'_, Postgres, T, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<T>, RepoError>
    where
        T: for<'r> FromRow<'r, sqlx::postgres::PgRow> + Send + Unpin,
    {
        debug!(table = self.table, op = self.op, "fetching all rows");
        Ok(query.fetch_all(&self.pool).await?)
    }
}

impl LabelledPoolApi<Sqlite> {
    pub async fn execute(
        &self,
        query: sqlx::query::Query<'_, Sqlite, sqlx::sqlite::SqliteArguments<'_>>,
    ) -> Result<u64, RepoError> {
        debug!(table = self.table, op = self.op, "executing query");
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn fetch_optional_as<T>(
        &self,
        query: sqlx::query::QueryAs<'_, Sqlite, T, sqlx::sqlite::SqliteArguments<'_>>,
    ) -> Result<Option<T>, RepoError>
    where
        T: for<'r> FromRow<'r, sqlx::sqlite::SqliteRow> + Send + Unpin,
    {
        debug!(table = self.table, op = self.op, "fetching optional row");
        Ok(query.fetch_optional(&self.pool).await?)
    }

    pub async fn fetch_all_as<T>(
        &self,
        query: sqlx::query::QueryAs<'_, Sqlite, T, sqlx::sqlite::SqliteArguments<'_>>,
    ) -> Result<Vec<T>, RepoError>
    where
        T: for<'r> FromRow<'r, sqlx::sqlite::SqliteRow> + Send + Unpin,
    {
        debug!(table = self.table, op = self.op, "fetching all rows");
        Ok(query.fetch_all(&self.pool).await?)
    }
}
