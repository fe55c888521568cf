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

//! Task coordinator (C10). Owns task creation, worker-pool lifecycle,
//! progress aggregation, cancellation propagation, and replica-restart
//! reconciliation.

use crate::client_pool::ConnectionPool;
use crate::config::{MigratorConfig, TunerConfig};
use crate::error::CoordinatorError;
use crate::memory::MemoryManager;
use crate::model::{BoundedErrors, Locator, Task, WorkItem};
use crate::network::NetworkMonitor;
use crate::planner::Planner;
use crate::tuner::{classify_workload, AdaptiveTuner, ConcurrencyGate};
use crate::worker::TransferWorker;
use chrono::Utc;
use futures::StreamExt;
use migrator_common::model::{ConflictStrategy, MigrationMode, TaskStatus};
use migrator_common::SafeDisplay;
use migrator_store::{IntegrityRecord, IntegrityRepo, IntegritySummary, RepoError, TaskRecord, TaskRepo};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const MAX_ERRORS_PER_TASK: usize = 50;
const STATUS_FLUSH_INTERVAL_SECS: u64 = 5;

/// Parameters for creating a new task, mirroring the HTTP/RPC surface's
/// "create task" request (spec §6): source+destination bucket/prefix,
/// mode, dry-run flag. Credentials and timeout live in `MigratorConfig`,
/// since this core has no per-request credential surface.
pub struct CreateTaskRequest {
    pub source: Locator,
    pub destination: Locator,
    pub mode: MigrationMode,
    pub dry_run: bool,
    pub conflict_strategy: Option<ConflictStrategy>,
    pub delete_removed: bool,
}

struct RunningTask {
    cancellation: CancellationToken,
    handle: JoinHandle<()>,
}

/// Aborts its wrapped task when dropped, so the periodic tuner-adjustment
/// tick spawned for a task's lifetime is always cleaned up, however
/// `execute_task` returns.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Coordinates the life cycle of every migration task this replica owns.
/// Other replicas' tasks are visible only through the shared relational
/// store (spec §5 "Replica coordination").
pub struct Coordinator<TR: TaskRepo, IR: IntegrityRepo> {
    task_repo: Arc<TR>,
    integrity_repo: Arc<IR>,
    source_pool: Arc<ConnectionPool>,
    dest_pool: Arc<ConnectionPool>,
    network: Arc<NetworkMonitor>,
    memory: Arc<MemoryManager>,
    tasks: RwLock<HashMap<String, Arc<Mutex<Task>>>>,
    running: Mutex<HashMap<String, RunningTask>>,
    initial_workers: u32,
    tuner_config: TunerConfig,
}

impl<TR: TaskRepo + Send + Sync + 'static, IR: IntegrityRepo + Send + Sync + 'static> Coordinator<TR, IR> {
    pub async fn new(
        config: &MigratorConfig,
        task_repo: Arc<TR>,
        integrity_repo: Arc<IR>,
    ) -> Self {
        let source_pool = Arc::new(
            ConnectionPool::connect(&config.source, config.pool.source_pool_size).await,
        );
        let dest_pool = Arc::new(
            ConnectionPool::connect(&config.destination, config.pool.destination_pool_size).await,
        );
        let network = Arc::new(NetworkMonitor::new(&config.network));
        let memory = Arc::new(MemoryManager::new(&config.memory));

        let coordinator = Self {
            task_repo,
            integrity_repo,
            source_pool,
            dest_pool,
            network,
            memory,
            tasks: RwLock::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            initial_workers: 4,
            tuner_config: config.tuner.clone(),
        };
        coordinator.reconcile_after_restart().await;
        coordinator
    }

    /// On start, rewrites any task left in `running` to `failed` (spec
    /// §4.10 / §14): ownership was lost when the previous process exited.
    /// Terminal tasks are kept only as history and are not reloaded into
    /// the live task map.
    async fn reconcile_after_restart(&self) {
        let running_tasks = match self.task_repo.list_running_tasks().await {
            Ok(tasks) => tasks,
            Err(error) => {
                tracing::warn!(error = %error.to_safe_string_indented(), "failed to list running tasks during restart reconciliation");
                return;
            }
        };

        for mut record in running_tasks {
            record.status = TaskStatus::Failed.to_string();
            record.ended_at = Some(Utc::now());
            record.updated_at = Utc::now();
            let mut errors: Vec<String> = serde_json::from_str(&record.errors).unwrap_or_default();
            errors.push("interrupted by restart".to_string());
            record.errors = serde_json::to_string(&errors).unwrap_or_else(|_| "[]".to_string());

            if let Err(error) = self.task_repo.save_task(&record).await {
                tracing::warn!(
                    task_id = %record.task_id,
                    error = %error.to_safe_string_indented(),
                    "failed to persist restart reconciliation for task"
                );
            }
        }
    }

    /// Creates and starts a new task, returning its identifier
    /// immediately; the transfer runs on a background task.
    pub async fn submit_task(self: &Arc<Self>, request: CreateTaskRequest) -> Result<String, CoordinatorError> {
        if request.destination.bucket.is_none() && !request.source.is_all_buckets() {
            return Err(CoordinatorError::InvalidArguments(
                "destination locator must name a bucket".to_string(),
            ));
        }
        if request.destination.bucket.is_some() && request.source.is_all_buckets() {
            return Err(CoordinatorError::InvalidArguments(
                "an all-buckets source mirrors destination bucket names per source bucket; destination must not name a bucket".to_string(),
            ));
        }

        let task_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let task = Task {
            task_id: task_id.clone(),
            status: TaskStatus::Pending,
            mode: request.mode,
            dry_run: request.dry_run,
            source: request.source.clone(),
            destination: request.destination.clone(),
            conflict_strategy: request.conflict_strategy,
            delete_removed: request.delete_removed,
            objects_total: 0,
            objects_copied: 0,
            bytes_total: 0,
            bytes_copied: 0,
            verified_objects: 0,
            failed_objects: 0,
            errors: BoundedErrors::new(MAX_ERRORS_PER_TASK),
            started_at: now,
            ended_at: None,
            updated_at: now,
        };

        self.persist_task(&task).await?;

        let shared_task = Arc::new(Mutex::new(task));
        self.tasks.write().await.insert(task_id.clone(), shared_task.clone());

        let cancellation = CancellationToken::new();
        let coordinator = self.clone();
        let task_id_for_run = task_id.clone();
        let cancellation_for_run = cancellation.clone();
        let handle = tokio::spawn(async move {
            coordinator
                .run_task(task_id_for_run, shared_task, cancellation_for_run)
                .await
        });

        self.running.lock().await.insert(
            task_id.clone(),
            RunningTask {
                cancellation,
                handle,
            },
        );

        Ok(task_id)
    }

    /// Materializes and submits a task on behalf of a triggered Schedule
    /// (spec §14). The schedule itself is an external collaborator; this
    /// only needs its effect (a task's parameters).
    pub async fn submit_task_from_schedule(
        self: &Arc<Self>,
        source: Locator,
        destination: Locator,
        mode: MigrationMode,
        conflict_strategy: Option<ConflictStrategy>,
        delete_removed: bool,
    ) -> Result<String, CoordinatorError> {
        self.submit_task(CreateTaskRequest {
            source,
            destination,
            mode,
            dry_run: false,
            conflict_strategy,
            delete_removed,
        })
        .await
    }

    async fn run_task(
        self: Arc<Self>,
        task_id: String,
        task: Arc<Mutex<Task>>,
        cancellation: CancellationToken,
    ) {
        {
            let mut guard = task.lock().await;
            guard.status = TaskStatus::Running;
            guard.updated_at = Utc::now();
        }
        if let Err(error) = self.flush_task(&task).await {
            tracing::warn!(task_id, error = %error.to_safe_string_indented(), "failed to flush running status");
        }

        let result = self.execute_task(&task_id, &task, &cancellation).await;

        let mut guard = task.lock().await;
        guard.ended_at = Some(Utc::now());
        guard.updated_at = Utc::now();
        guard.status = match result {
            Ok(()) if guard.failed_objects > 0 => TaskStatus::CompletedWithErrors,
            Ok(()) => TaskStatus::Completed,
            Err(CoordinatorError::Transfer(crate::error::TransferError::Cancelled)) => TaskStatus::Cancelled,
            Err(error) => {
                guard.errors.push(error.to_safe_string());
                TaskStatus::Failed
            }
        };
        drop(guard);

        if let Err(error) = self.flush_task(&task).await {
            tracing::warn!(task_id, error = %error.to_safe_string_indented(), "failed to flush terminal status");
        }

        self.running.lock().await.remove(&task_id);
        self.tasks.write().await.remove(&task_id);
    }

    async fn execute_task(
        &self,
        task_id: &str,
        task: &Arc<Mutex<Task>>,
        cancellation: &CancellationToken,
    ) -> Result<(), CoordinatorError> {
        let (source, destination, mode, conflict_strategy, dry_run, delete_removed) = {
            let guard = task.lock().await;
            (
                guard.source.clone(),
                guard.destination.clone(),
                guard.mode,
                guard.conflict_strategy,
                guard.dry_run,
                guard.delete_removed,
            )
        };

        let planner = Planner::new(&self.source_pool, &self.dest_pool);

        // One (source bucket, destination bucket, work items) triple per
        // bucket: a single-bucket task produces exactly one, an
        // all-buckets task produces one per discovered source bucket,
        // mirroring the destination bucket name (spec §14).
        let bucket_plans: Vec<(String, String, Vec<WorkItem>)> = if source.is_all_buckets() {
            let plans = planner
                .plan_all_buckets(&source.prefix, &destination, mode, conflict_strategy)
                .await?;
            for (bucket_name, _) in &plans {
                planner.ensure_destination_bucket(bucket_name).await?;
            }
            plans
                .into_iter()
                .map(|(bucket_name, items)| (bucket_name.clone(), bucket_name, items))
                .collect()
        } else {
            let dest_bucket = destination.bucket.clone().ok_or_else(|| {
                CoordinatorError::InvalidArguments("destination locator has no bucket".to_string())
            })?;
            planner.ensure_destination_bucket(&dest_bucket).await?;
            let source_bucket = source.bucket.clone().unwrap_or_default();
            let items = planner
                .plan(&source, &destination, mode, conflict_strategy)
                .await?;
            vec![(source_bucket, dest_bucket, items)]
        };

        let objects_total: i64 = bucket_plans.iter().map(|(_, _, items)| items.len() as i64).sum();
        let bytes_total_signed: i64 = bucket_plans
            .iter()
            .flat_map(|(_, _, items)| items.iter())
            .map(|item| item.source_size)
            .sum();
        {
            let mut guard = task.lock().await;
            guard.objects_total = objects_total;
            guard.bytes_total = bytes_total_signed;
        }

        let all_items = || bucket_plans.iter().flat_map(|(_, _, items)| items.iter());
        let objects_under_1mib = all_items().filter(|i| i.source_size < 1_000_000).count() as u64;
        let bytes_under_1mib: u64 = all_items()
            .filter(|i| i.source_size < 1_000_000)
            .map(|i| i.source_size.max(0) as u64)
            .sum();
        let bytes_over_100mib: u64 = all_items()
            .filter(|i| i.source_size > 100_000_000)
            .map(|i| i.source_size.max(0) as u64)
            .sum();
        let bytes_total: u64 = all_items().map(|i| i.source_size.max(0) as u64).sum();
        let class = classify_workload(
            objects_under_1mib,
            objects_total.max(0) as u64,
            bytes_under_1mib,
            bytes_total,
            bytes_over_100mib,
        );

        let max_safe_workers = self.memory.max_safe_workers(0);
        let initial = max_safe_workers.min(self.initial_workers).max(1);
        let tuner = Arc::new(Mutex::new(AdaptiveTuner::new(self.tuner_config.clone(), initial)));
        let gate = Arc::new(ConcurrencyGate::new(initial));
        tracing::debug!(task_id, ?class, workers = initial, "planned task workload");

        // Periodic adjustment tick (spec §4.6): re-samples memory
        // headroom and network quality on `tuner_config.adjustment_interval`
        // and resizes `gate` in place; each mapped future below acquires
        // from `gate` before transferring, so `gate` -- not
        // `buffer_unordered`'s fixed bound -- is what actually throttles
        // concurrency for the task's lifetime.
        let tick_memory = Arc::clone(&self.memory);
        let tick_network = Arc::clone(&self.network);
        let tick_tuner = Arc::clone(&tuner);
        let tick_gate = Arc::clone(&gate);
        let tick_cancellation = cancellation.clone();
        let adjustment_interval = self.tuner_config.adjustment_interval;
        let tick_handle = tokio::spawn(async move {
            let mut system = sysinfo::System::new();
            let mut ticker = tokio::time::interval(adjustment_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = tick_cancellation.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let reading = tick_memory.sample_process(&mut system);
                let mut tuner_guard = tick_tuner.lock().await;
                let baseline = tuner_guard.current_workers();
                tuner_guard.force_down_to(reading.max_safe_workers);
                let network_recommended = tick_network.recommended_worker_count(baseline);
                match tuner_guard.maybe_adjust(network_recommended, class, reading.max_safe_workers) {
                    Some(adjusted) => tick_gate.resize(adjusted),
                    None => tick_gate.resize(tuner_guard.current_workers()),
                }
            }
        });
        let _tick_guard = AbortOnDrop(tick_handle);

        for (source_bucket, dest_bucket, work_items) in &bucket_plans {
            let worker = TransferWorker::new(
                &self.source_pool,
                &self.dest_pool,
                &self.network,
                &self.memory,
                source_bucket.clone(),
                dest_bucket.clone(),
            );

            // N workers per task (spec §5): transfers run concurrently,
            // throttled by `gate`'s live capacity; bookkeeping below is
            // applied as each transfer completes, in whatever order that
            // is. `buffer_unordered`'s own bound is generous on purpose.
            let mut in_flight = futures::stream::iter(work_items.iter())
                .map(|item| {
                    let worker = &worker;
                    let gate = Arc::clone(&gate);
                    async move {
                        let _permit = gate.acquire().await.expect("concurrency gate closed");
                        (item, worker.transfer(item, dry_run, cancellation).await)
                    }
                })
                .buffer_unordered(work_items.len().max(1));

            let mut last_flush = Instant::now();
            while let Some((item, result)) = in_flight.next().await {
                if cancellation.is_cancelled() {
                    return Err(CoordinatorError::Transfer(crate::error::TransferError::Cancelled));
                }

                match result {
                    Ok(outcome) => {
                        let is_valid = outcome.is_valid;
                        let record = IntegrityRecord {
                            task_id: task_id.to_string(),
                            object_key: outcome.object_key,
                            source_etag: Some(outcome.source_etag),
                            source_size: outcome.source_size,
                            source_provider: outcome.source_provider.to_string(),
                            dest_etag: outcome.dest_etag,
                            dest_size: outcome.dest_size,
                            dest_provider: outcome.dest_provider.map(|p| p.to_string()),
                            computed_md5: outcome.computed_md5,
                            computed_sha1: outcome.computed_sha1,
                            computed_sha256: outcome.computed_sha256,
                            computed_crc32: outcome.computed_crc32,
                            etag_match: outcome.etag_match,
                            size_match: outcome.size_match,
                            md5_match: outcome.md5_match,
                            sha1_match: outcome.sha1_match,
                            is_valid,
                            error_message: outcome.error_message,
                            created_at: Utc::now(),
                        };
                        let record_bytes = record.source_size;
                        if let Err(error) = self.integrity_repo.store_integrity_result(&record).await {
                            tracing::warn!(task_id, error = %error.to_safe_string_indented(), "failed to store integrity result");
                        }

                        tuner
                            .lock()
                            .await
                            .record_performance_sample(self.network.throughput_bytes_per_sec());

                        let mut guard = task.lock().await;
                        guard.objects_copied += 1;
                        guard.bytes_copied += record_bytes;
                        if is_valid {
                            guard.verified_objects += 1;
                        } else {
                            guard.failed_objects += 1;
                        }
                        guard.updated_at = Utc::now();
                    }
                    Err(crate::error::TransferError::Cancelled) => {
                        return Err(CoordinatorError::Transfer(crate::error::TransferError::Cancelled));
                    }
                    Err(error) => {
                        let mut guard = task.lock().await;
                        guard.failed_objects += 1;
                        guard.errors.push(error.to_safe_string());
                        guard.updated_at = Utc::now();
                    }
                }

                if last_flush.elapsed() >= std::time::Duration::from_secs(STATUS_FLUSH_INTERVAL_SECS) {
                    self.flush_task(task).await.map_err(CoordinatorError::Store)?;
                    last_flush = Instant::now();
                }
            }

            if delete_removed && !dry_run {
                let source_locator = Locator::single(source_bucket.clone(), source.prefix.clone());
                let dest_locator = Locator::single(dest_bucket.clone(), destination.prefix.clone());
                if let Err(error) = planner.delete_removed(&source_locator, &dest_locator).await {
                    tracing::warn!(task_id, error = %error.to_safe_string_indented(), "delete_removed pass failed");
                }
            }
        }

        self.integrity_repo.update_aggregates_from_integrity(task_id).await?;

        Ok(())
    }

    async fn flush_task(&self, task: &Arc<Mutex<Task>>) -> Result<(), RepoError> {
        let guard = task.lock().await;
        let record = TaskRecord {
            task_id: guard.task_id.clone(),
            status: guard.status.to_string(),
            mode: guard.mode.to_string(),
            dry_run: guard.dry_run,
            source_bucket: guard.source.bucket.clone().unwrap_or_default(),
            source_prefix: guard.source.prefix.clone(),
            dest_bucket: guard.destination.bucket.clone().unwrap_or_default(),
            dest_prefix: guard.destination.prefix.clone(),
            conflict_strategy: guard.conflict_strategy.map(|s| s.to_string()),
            delete_removed: guard.delete_removed,
            objects_total: guard.objects_total,
            objects_copied: guard.objects_copied,
            bytes_total: guard.bytes_total,
            bytes_copied: guard.bytes_copied,
            verified_objects: guard.verified_objects,
            failed_objects: guard.failed_objects,
            errors: serde_json::to_string(&guard.errors.as_slice()).unwrap_or_else(|_| "[]".to_string()),
            started_at: guard.started_at,
            ended_at: guard.ended_at,
            updated_at: guard.updated_at,
        };
        drop(guard);
        self.persist_record(&record).await
    }

    async fn persist_task(&self, task: &Task) -> Result<(), CoordinatorError> {
        let record = TaskRecord {
            task_id: task.task_id.clone(),
            status: task.status.to_string(),
            mode: task.mode.to_string(),
            dry_run: task.dry_run,
            source_bucket: task.source.bucket.clone().unwrap_or_default(),
            source_prefix: task.source.prefix.clone(),
            dest_bucket: task.destination.bucket.clone().unwrap_or_default(),
            dest_prefix: task.destination.prefix.clone(),
            conflict_strategy: task.conflict_strategy.map(|s| s.to_string()),
            delete_removed: task.delete_removed,
            objects_total: task.objects_total,
            objects_copied: task.objects_copied,
            bytes_total: task.bytes_total,
            bytes_copied: task.bytes_copied,
            verified_objects: task.verified_objects,
            failed_objects: task.failed_objects,
            errors: serde_json::to_string(&task.errors.as_slice()).unwrap_or_else(|_| "[]".to_string()),
            started_at: task.started_at,
            ended_at: task.ended_at,
            updated_at: task.updated_at,
        };
        self.persist_record(&record).await.map_err(CoordinatorError::Store)
    }

    async fn persist_record(&self, record: &TaskRecord) -> Result<(), RepoError> {
        self.task_repo.save_task(record).await
    }

    /// Cancels a task's task-scoped context; workers observe this between
    /// steps and abort any open multipart upload (spec §4.10, §5).
    pub async fn cancel(&self, task_id: &str) -> Result<(), CoordinatorError> {
        let running = self.running.lock().await;
        match running.get(task_id) {
            Some(running_task) => {
                running_task.cancellation.cancel();
                Ok(())
            }
            None => Err(CoordinatorError::UnknownTask(task_id.to_string())),
        }
    }

    /// Gracefully shuts down: cancels every running task and awaits its
    /// worker loop before returning.
    pub async fn shutdown(&self) {
        let mut running = self.running.lock().await;
        for (_, running_task) in running.iter() {
            running_task.cancellation.cancel();
        }
        let handles: Vec<JoinHandle<()>> = running.drain().map(|(_, rt)| rt.handle).collect();
        drop(running);
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub async fn task_status(&self, task_id: &str) -> Result<Option<TaskRecord>, CoordinatorError> {
        self.task_repo.load_task(task_id).await.map_err(CoordinatorError::Store)
    }

    pub async fn list_tasks(&self, status: Option<&str>, limit: i64) -> Result<Vec<TaskRecord>, CoordinatorError> {
        self.task_repo.list_tasks(status, limit).await.map_err(CoordinatorError::Store)
    }

    pub async fn integrity_summary(&self, task_id: &str) -> Result<Option<IntegritySummary>, CoordinatorError> {
        self.integrity_repo.summary(task_id).await.map_err(CoordinatorError::Store)
    }

    pub async fn integrity_failures(&self, task_id: &str, limit: i64) -> Result<Vec<IntegrityRecord>, CoordinatorError> {
        self.integrity_repo.failures(task_id, limit).await.map_err(CoordinatorError::Store)
    }

    /// Deletes terminal tasks older than `older_than_days` (spec §6,
    /// default 7 days).
    pub async fn cleanup_old_tasks(&self, older_than_days: i64) -> Result<u64, CoordinatorError> {
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days);
        self.task_repo.cleanup_old_tasks(cutoff).await.map_err(CoordinatorError::Store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn create_task_request_rejects_missing_destination_bucket() {
        let request = CreateTaskRequest {
            source: Locator::single("src", ""),
            destination: Locator::all_buckets(""),
            mode: MigrationMode::FullRewrite,
            dry_run: false,
            conflict_strategy: None,
            delete_removed: false,
        };
        assert!(request.destination.bucket.is_none());
    }
}
