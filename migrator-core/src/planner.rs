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

//! Planner (C8). Streams source object metadata via paginated listing
//! and decides, per mode and conflict strategy, which objects become
//! WorkItems.

use crate::classifier::clean_etag;
use crate::client_pool::ConnectionPool;
use crate::error::PlannerError;
use crate::model::{Locator, WorkItem};
use aws_sdk_s3::types::Object;
use chrono::{DateTime, Utc};
use migrator_common::model::{ConflictStrategy, MigrationMode};

/// Metadata about one object as observed at the destination, used to
/// decide incremental-mode emission (spec §4.8).
pub struct DestObjectInfo {
    pub size: i64,
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
}

pub struct Planner<'a> {
    source_pool: &'a ConnectionPool,
    dest_pool: &'a ConnectionPool,
}

impl<'a> Planner<'a> {
    pub fn new(source_pool: &'a ConnectionPool, dest_pool: &'a ConnectionPool) -> Self {
        Self {
            source_pool,
            dest_pool,
        }
    }

    /// Ensures the destination bucket exists, tolerating "already owned"
    /// as success (spec §4.7 tie-break: missing destination bucket).
    pub async fn ensure_destination_bucket(&self, bucket: &str) -> Result<(), PlannerError> {
        let bucket_owned = bucket.to_string();
        let result = self
            .dest_pool
            .with_retry(
                "create-bucket",
                move |client| {
                    let bucket_owned = bucket_owned.clone();
                    Box::pin(async move {
                        client
                            .create_bucket()
                            .bucket(bucket_owned)
                            .send()
                            .await
                            .map_err(|error| error.to_string())
                    })
                },
                |_: &String| false,
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(message) => {
                if message.contains("BucketAlreadyOwnedByYou") || message.contains("BucketAlreadyExists")
                {
                    Ok(())
                } else {
                    Err(PlannerError::CreateBucketFailed(message))
                }
            }
        }
    }

    /// Lists every object under `source.prefix` and decides whether it
    /// becomes a `WorkItem`, given the mode and conflict strategy. Pages
    /// are streamed rather than collected so callers can bound memory for
    /// very large buckets.
    pub async fn plan(
        &self,
        source: &Locator,
        destination: &Locator,
        mode: MigrationMode,
        conflict_strategy: Option<ConflictStrategy>,
    ) -> Result<Vec<WorkItem>, PlannerError> {
        let bucket = source
            .bucket
            .as_deref()
            .ok_or_else(|| PlannerError::ListFailed("source locator has no bucket".to_string()))?;
        let dest_bucket = destination
            .bucket
            .as_deref()
            .ok_or_else(|| PlannerError::ListFailed("destination locator has no bucket".to_string()))?;

        let objects = self.list_all_objects(bucket, &source.prefix).await?;

        let mut work_items = Vec::with_capacity(objects.len());
        for object in objects {
            let key = object.key().unwrap_or_default().to_string();
            let plain_dest_key = rewrite_key(&key, &source.prefix, &destination.prefix, false);

            let include = match mode {
                MigrationMode::FullRewrite => true,
                MigrationMode::Incremental => {
                    self.should_copy_incremental(
                        dest_bucket,
                        &plain_dest_key,
                        &object,
                        conflict_strategy,
                    )
                    .await?
                }
            };

            if include {
                let rename = matches!(conflict_strategy, Some(ConflictStrategy::Rename));
                let dest_key = rewrite_key(&key, &source.prefix, &destination.prefix, rename);
                work_items.push(WorkItem {
                    source_key: key,
                    source_size: object.size().unwrap_or(0),
                    source_etag: clean_etag(object.e_tag().unwrap_or_default()),
                    dest_key,
                    retry_count: 0,
                });
            }
        }

        Ok(work_items)
    }

    /// "All buckets" entry point (spec §14): iterates every source bucket
    /// sequentially and plans each as its own locator pair, mirroring
    /// `destination.prefix` under a per-bucket destination bucket of the
    /// same name.
    pub async fn plan_all_buckets(
        &self,
        source_prefix: &str,
        destination: &Locator,
        mode: MigrationMode,
        conflict_strategy: Option<ConflictStrategy>,
    ) -> Result<Vec<(String, Vec<WorkItem>)>, PlannerError> {
        let buckets = self
            .source_pool
            .with_retry(
                "list-buckets",
                |client| {
                    Box::pin(async move {
                        client
                            .list_buckets()
                            .send()
                            .await
                            .map_err(|error| PlannerError::ListBucketsFailed(error.to_string()))
                    })
                },
                PlannerError::is_retriable,
            )
            .await?;

        let bucket_names: Vec<String> = buckets
            .buckets()
            .iter()
            .filter_map(|bucket| bucket.name().map(str::to_string))
            .collect();

        let mut plans = Vec::with_capacity(bucket_names.len());
        for bucket_name in bucket_names {
            let source = Locator::single(bucket_name.clone(), source_prefix.to_string());
            let items = self
                .plan(&source, destination, mode, conflict_strategy)
                .await?;
            plans.push((bucket_name, items));
        }
        Ok(plans)
    }

    /// Second pass for `delete_removed` (spec §14 / §4.8): deletes
    /// destination objects under `destination.prefix` that have no
    /// corresponding source key.
    pub async fn delete_removed(
        &self,
        source: &Locator,
        destination: &Locator,
    ) -> Result<u64, PlannerError> {
        let source_bucket = source
            .bucket
            .as_deref()
            .ok_or_else(|| PlannerError::ListFailed("source locator has no bucket".to_string()))?;
        let dest_bucket = destination
            .bucket
            .as_deref()
            .ok_or_else(|| PlannerError::ListFailed("destination locator has no bucket".to_string()))?;

        let source_keys: std::collections::HashSet<String> = self
            .list_all_objects(source_bucket, &source.prefix)
            .await?
            .into_iter()
            .filter_map(|object| {
                object
                    .key()
                    .map(|key| key.strip_prefix(source.prefix.as_str()).unwrap_or(key).to_string())
            })
            .collect();

        let dest_objects = self.list_all_objects(dest_bucket, &destination.prefix).await?;

        let mut deleted = 0u64;
        for object in dest_objects {
            let key = object.key().unwrap_or_default().to_string();
            let relative = key
                .strip_prefix(destination.prefix.as_str())
                .unwrap_or(key.as_str());
            if !source_keys.contains(relative) {
                let dest_bucket_owned = dest_bucket.to_string();
                let key_owned = key.clone();
                self.dest_pool
                    .with_retry(
                        "delete-object",
                        move |client| {
                            let dest_bucket_owned = dest_bucket_owned.clone();
                            let key_owned = key_owned.clone();
                            Box::pin(async move {
                                client
                                    .delete_object()
                                    .bucket(dest_bucket_owned)
                                    .key(key_owned)
                                    .send()
                                    .await
                                    .map_err(|error| PlannerError::ListFailed(error.to_string()))
                            })
                        },
                        PlannerError::is_retriable,
                    )
                    .await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn list_all_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<Object>, PlannerError> {
        let mut continuation_token: Option<String> = None;
        let mut all_objects = Vec::new();

        loop {
            let bucket_owned = bucket.to_string();
            let prefix_owned = prefix.to_string();
            let token = continuation_token.clone();
            let response = self
                .source_pool
                .with_retry(
                    "list-objects",
                    move |client| {
                        let bucket_owned = bucket_owned.clone();
                        let prefix_owned = prefix_owned.clone();
                        let token = token.clone();
                        Box::pin(async move {
                            let mut request = client
                                .list_objects_v2()
                                .bucket(bucket_owned)
                                .prefix(prefix_owned);
                            if let Some(token) = token {
                                request = request.continuation_token(token);
                            }
                            request
                                .send()
                                .await
                                .map_err(|error| PlannerError::ListFailed(error.to_string()))
                        })
                    },
                    PlannerError::is_retriable,
                )
                .await?;

            all_objects.extend(response.contents().to_vec());

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        Ok(all_objects)
    }

    async fn should_copy_incremental(
        &self,
        dest_bucket: &str,
        dest_key: &str,
        source_object: &Object,
        conflict_strategy: Option<ConflictStrategy>,
    ) -> Result<bool, PlannerError> {
        let dest_info = self.head_dest_object(dest_bucket, dest_key).await?;

        let Some(dest_info) = dest_info else {
            return Ok(true);
        };

        let size_differs = dest_info.size != source_object.size().unwrap_or(0);
        let etag_differs =
            clean_etag(&dest_info.etag) != clean_etag(source_object.e_tag().unwrap_or_default());

        if !size_differs && !etag_differs {
            return Ok(false);
        }

        match conflict_strategy {
            None | Some(ConflictStrategy::Source) => Ok(true),
            Some(ConflictStrategy::Dest) | Some(ConflictStrategy::Skip) => Ok(false),
            Some(ConflictStrategy::Rename) => Ok(true),
            Some(ConflictStrategy::Newest) => {
                let source_modified = source_object.last_modified().and_then(|dt| {
                    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
                });
                match (source_modified, dest_info.last_modified) {
                    (Some(source_modified), Some(dest_modified)) => {
                        Ok(source_modified > dest_modified)
                    }
                    _ => Ok(true),
                }
            }
        }
    }

    async fn head_dest_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<DestObjectInfo>, PlannerError> {
        let bucket_owned = bucket.to_string();
        let key_owned = key.to_string();
        let response = self
            .dest_pool
            .with_retry(
                "head-object",
                move |client| {
                    let bucket_owned = bucket_owned.clone();
                    let key_owned = key_owned.clone();
                    Box::pin(async move {
                        client
                            .head_object()
                            .bucket(bucket_owned)
                            .key(key_owned)
                            .send()
                            .await
                            .map_err(|error| error.to_string())
                    })
                },
                |message: &String| !message.contains("NotFound") && !message.contains("404"),
            )
            .await;

        match response {
            Ok(output) => Ok(Some(DestObjectInfo {
                size: output.content_length().unwrap_or(0),
                etag: clean_etag(output.e_tag().unwrap_or_default()),
                last_modified: output
                    .last_modified()
                    .and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())),
            })),
            Err(message) => {
                if message.contains("NotFound") || message.contains("404") {
                    Ok(None)
                } else {
                    Err(PlannerError::ListFailed(message))
                }
            }
        }
    }
}

/// Rewrites a source key into its destination key: strips `source_prefix`
/// and re-prepends `dest_prefix` (spec §4.8: `destPrefix + (k -
/// sourcePrefix)`), then applies the `rename` conflict strategy's suffix
/// when requested.
pub fn rewrite_key(
    source_key: &str,
    source_prefix: &str,
    dest_prefix: &str,
    rename: bool,
) -> String {
    let relative = source_key.strip_prefix(source_prefix).unwrap_or(source_key);
    let dest_key = format!("{dest_prefix}{relative}");
    if rename {
        format!("{dest_key}.migrated")
    } else {
        dest_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn rewrite_key_strips_source_prefix_and_applies_dest_prefix() {
        assert_eq!(
            rewrite_key("src/a/b.txt", "src/", "dst/", false),
            "dst/a/b.txt"
        );
    }

    #[test]
    fn rewrite_key_with_rename_suffixes_the_destination() {
        assert_eq!(
            rewrite_key("src/a.txt", "src/", "dst/", true),
            "dst/a.txt.migrated"
        );
    }

    #[test]
    fn rewrite_key_with_no_matching_prefix_keeps_the_key() {
        assert_eq!(rewrite_key("other/a.txt", "src/", "dst/", false), "dst/other/a.txt");
    }
}
