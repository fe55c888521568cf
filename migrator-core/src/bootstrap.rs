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

//! Wires the coordinator to a concrete backend (Postgres or SQLite),
//! selected by `config.db`, the way the wider stack's services are
//! bootstrapped from a `DbConfig`.

use crate::config::MigratorConfig;
use crate::coordinator::Coordinator;
use migrator_common::config::DbConfig;
use migrator_store::{migration, DbIntegrityRepo, DbTaskRepo, PostgresPool, SqlitePool};
use std::sync::Arc;

/// The fully wired application: a coordinator generic over whichever
/// backend `config.db` selected, erased behind `Arc` so the binary
/// entrypoint doesn't need to know which one it got.
pub enum Services {
    Postgres(Arc<Coordinator<DbTaskRepo<PostgresPool>, DbIntegrityRepo<PostgresPool>>>),
    Sqlite(Arc<Coordinator<DbTaskRepo<SqlitePool>, DbIntegrityRepo<SqlitePool>>>),
}

impl Services {
    pub async fn new(config: &MigratorConfig) -> Result<Self, String> {
        match &config.db {
            DbConfig::Postgres(db_config) => {
                let pool = PostgresPool::connect(db_config)
                    .await
                    .map_err(|error| error.to_string())?;
                migration::migrate_postgres(pool.raw())
                    .await
                    .map_err(|error| error.to_string())?;

                let task_repo = Arc::new(DbTaskRepo::new(pool.clone()));
                let integrity_repo = Arc::new(DbIntegrityRepo::new(pool));
                let coordinator = Arc::new(Coordinator::new(config, task_repo, integrity_repo).await);
                Ok(Services::Postgres(coordinator))
            }
            DbConfig::Sqlite(db_config) => {
                let pool = SqlitePool::connect(db_config)
                    .await
                    .map_err(|error| error.to_string())?;
                migration::migrate_sqlite(pool.raw())
                    .await
                    .map_err(|error| error.to_string())?;

                let task_repo = Arc::new(DbTaskRepo::new(pool.clone()));
                let integrity_repo = Arc::new(DbIntegrityRepo::new(pool));
                let coordinator = Arc::new(Coordinator::new(config, task_repo, integrity_repo).await);
                Ok(Services::Sqlite(coordinator))
            }
        }
    }

    pub async fn shutdown(&self) {
        match self {
            Services::Postgres(coordinator) => coordinator.shutdown().await,
            Services::Sqlite(coordinator) => coordinator.shutdown().await,
        }
    }
}
