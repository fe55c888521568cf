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

//! Transfer worker (C7). Runs the per-object state machine described in
//! spec §4.7: HEAD, decide shape, GET, tee into the hasher while writing
//! to the destination, finalize, verify, persist, report.

use crate::classifier::{self, VerificationMode};
use crate::client_pool::ConnectionPool;
use crate::error::TransferError;
use crate::hasher::{StreamingHasher, EMPTY_OBJECT_MD5};
use crate::memory::{MemoryManager, MemorySample};
use crate::model::{VerificationOutcome, WorkItem};
use crate::network::NetworkMonitor;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use md5::{Digest, Md5};
use migrator_common::model::{ProviderClass, TransferState};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Objects smaller than this skip the separate HEAD call; their ETag and
/// size are read off the GET response instead (spec §4.7 step 1).
const HEAD_SKIP_THRESHOLD_BYTES: i64 = 5 * 1024 * 1024;
/// Below this size, transfer as a single PUT; at or above it, multipart
/// (spec §4.7 step 2).
const MULTIPART_THRESHOLD_BYTES: i64 = 64 * 1024 * 1024;

pub struct TransferWorker<'a> {
    source_pool: &'a ConnectionPool,
    dest_pool: &'a ConnectionPool,
    network: &'a NetworkMonitor,
    memory: &'a MemoryManager,
    source_bucket: String,
    dest_bucket: String,
}

impl<'a> TransferWorker<'a> {
    pub fn new(
        source_pool: &'a ConnectionPool,
        dest_pool: &'a ConnectionPool,
        network: &'a NetworkMonitor,
        memory: &'a MemoryManager,
        source_bucket: impl Into<String>,
        dest_bucket: impl Into<String>,
    ) -> Self {
        Self {
            source_pool,
            dest_pool,
            network,
            memory,
            source_bucket: source_bucket.into(),
            dest_bucket: dest_bucket.into(),
        }
    }

    /// Runs the full per-object protocol. In `dry_run` mode, short-circuits
    /// after HEAD and returns a synthetic "would copy" outcome (spec
    /// §4.7 tie-break).
    pub async fn transfer(
        &self,
        item: &WorkItem,
        dry_run: bool,
        cancellation: &CancellationToken,
    ) -> Result<VerificationOutcome, TransferError> {
        let start = Instant::now();
        let enter = |state: TransferState| {
            tracing::trace!(key = %item.source_key, ?state, "transfer state");
        };

        enter(TransferState::Planned);
        if cancellation.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        enter(TransferState::Heading);
        let (size, source_etag) =
            if item.source_size <= HEAD_SKIP_THRESHOLD_BYTES && !item.source_etag.is_empty() {
                (item.source_size, item.source_etag.clone())
            } else {
                self.head_source(&item.source_key).await?
            };

        if dry_run {
            return Ok(self.synthetic_dry_run_outcome(item, size, &source_etag));
        }

        if cancellation.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        enter(TransferState::Reading);
        let mut hasher = StreamingHasher::new();
        let outcome = if size == 0 {
            self.transfer_empty_object(item, &mut hasher).await
        } else {
            enter(TransferState::Writing);
            if size < MULTIPART_THRESHOLD_BYTES {
                self.transfer_single_part(item, &mut hasher, cancellation).await
            } else {
                self.transfer_multipart(item, &mut hasher, cancellation).await
            }
        };

        enter(TransferState::Finalizing);
        let (dest_upload, ttfb_ms) = outcome?;

        enter(TransferState::Verified);
        let verification = self.verify(item, &hasher, &dest_upload);

        let elapsed = start.elapsed();
        self.network
            .record_sample(hasher.snapshot().bytes_seen, elapsed, ttfb_ms);
        self.memory.record_sample(&MemorySample {
            object_size_bytes: size.max(0) as u64,
            observed_worker_overhead_bytes: estimate_overhead_bytes(size.max(0) as u64),
        });

        Ok(verification)
    }

    async fn head_source(&self, key: &str) -> Result<(i64, String), TransferError> {
        let bucket = self.source_bucket.clone();
        let key = key.to_string();
        let response = self
            .source_pool
            .with_retry(
                "head-object",
                move |client| {
                    let bucket = bucket.clone();
                    let key = key.clone();
                    Box::pin(async move {
                        client
                            .head_object()
                            .bucket(bucket)
                            .key(key)
                            .send()
                            .await
                            .map_err(|error| crate::client_pool::classify_sdk_error(&error))
                    })
                },
                TransferError::is_retriable,
            )
            .await?;

        Ok((
            response.content_length().unwrap_or(0),
            classifier::clean_etag(response.e_tag().unwrap_or_default()),
        ))
    }

    async fn transfer_empty_object(
        &self,
        item: &WorkItem,
        hasher: &mut StreamingHasher,
    ) -> Result<(DestUploadOutcome, f64), TransferError> {
        hasher.absorb(&[]);
        let dest_bucket = self.dest_bucket.clone();
        let dest_key = item.dest_key.clone();
        let started = Instant::now();
        let response = self
            .dest_pool
            .with_retry(
                "put-object-empty",
                move |client| {
                    let dest_bucket = dest_bucket.clone();
                    let dest_key = dest_key.clone();
                    Box::pin(async move {
                        client
                            .put_object()
                            .bucket(dest_bucket)
                            .key(dest_key)
                            .content_length(0)
                            .body(ByteStream::from(Bytes::new()))
                            .send()
                            .await
                            .map_err(|error| crate::client_pool::classify_sdk_error(&error))
                    })
                },
                TransferError::is_retriable,
            )
            .await?;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        Ok((
            DestUploadOutcome {
                etag: classifier::clean_etag(response.e_tag().unwrap_or(EMPTY_OBJECT_MD5)),
                part_md5s: None,
            },
            latency_ms,
        ))
    }

    async fn transfer_single_part(
        &self,
        item: &WorkItem,
        hasher: &mut StreamingHasher,
        cancellation: &CancellationToken,
    ) -> Result<(DestUploadOutcome, f64), TransferError> {
        let (buffer, ttfb_ms) = self
            .read_source_into_buffer(item, hasher, cancellation)
            .await?;

        let dest_bucket = self.dest_bucket.clone();
        let dest_key = item.dest_key.clone();
        let body = buffer.freeze();
        let content_length = body.len() as i64;
        let response = self
            .dest_pool
            .with_retry(
                "put-object",
                move |client| {
                    let dest_bucket = dest_bucket.clone();
                    let dest_key = dest_key.clone();
                    let body = body.clone();
                    Box::pin(async move {
                        client
                            .put_object()
                            .bucket(dest_bucket)
                            .key(dest_key)
                            .content_length(content_length)
                            .body(ByteStream::from(body))
                            .send()
                            .await
                            .map_err(|error| crate::client_pool::classify_sdk_error(&error))
                    })
                },
                TransferError::is_retriable,
            )
            .await?;

        Ok((
            DestUploadOutcome {
                etag: classifier::clean_etag(response.e_tag().unwrap_or_default()),
                part_md5s: None,
            },
            ttfb_ms,
        ))
    }

    async fn transfer_multipart(
        &self,
        item: &WorkItem,
        hasher: &mut StreamingHasher,
        cancellation: &CancellationToken,
    ) -> Result<(DestUploadOutcome, f64), TransferError> {
        let part_size = self.network.recommended_part_size_bytes();

        let dest_bucket = self.dest_bucket.clone();
        let dest_key = item.dest_key.clone();
        let create = self
            .dest_pool
            .with_retry(
                "create-multipart-upload",
                move |client| {
                    let dest_bucket = dest_bucket.clone();
                    let dest_key = dest_key.clone();
                    Box::pin(async move {
                        client
                            .create_multipart_upload()
                            .bucket(dest_bucket)
                            .key(dest_key)
                            .send()
                            .await
                            .map_err(|error| crate::client_pool::classify_sdk_error(&error))
                    })
                },
                TransferError::is_retriable,
            )
            .await?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| TransferError::ObjectStore("missing upload id".to_string()))?
            .to_string();

        match self
            .upload_parts(item, hasher, &upload_id, part_size, cancellation)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                let dest_bucket = self.dest_bucket.clone();
                let dest_key = item.dest_key.clone();
                let upload_id_owned = upload_id.clone();
                let _ = self
                    .dest_pool
                    .with_retry(
                        "abort-multipart-upload",
                        move |client| {
                            let dest_bucket = dest_bucket.clone();
                            let dest_key = dest_key.clone();
                            let upload_id_owned = upload_id_owned.clone();
                            Box::pin(async move {
                                client
                                    .abort_multipart_upload()
                                    .bucket(dest_bucket)
                                    .key(dest_key)
                                    .upload_id(upload_id_owned)
                                    .send()
                                    .await
                                    .map_err(|error| crate::client_pool::classify_sdk_error(&error))
                            })
                        },
                        TransferError::is_retriable,
                    )
                    .await;
                Err(error)
            }
        }
    }

    async fn upload_parts(
        &self,
        item: &WorkItem,
        hasher: &mut StreamingHasher,
        upload_id: &str,
        part_size: u64,
        cancellation: &CancellationToken,
    ) -> Result<(DestUploadOutcome, f64), TransferError> {
        let bucket = self.source_bucket.clone();
        let key = item.source_key.clone();
        let started = Instant::now();
        let get_output = self
            .source_pool
            .with_retry(
                "get-object-multipart",
                move |client| {
                    let bucket = bucket.clone();
                    let key = key.clone();
                    Box::pin(async move {
                        client
                            .get_object()
                            .bucket(bucket)
                            .key(key)
                            .send()
                            .await
                            .map_err(|error| crate::client_pool::classify_sdk_error(&error))
                    })
                },
                TransferError::is_retriable,
            )
            .await?;

        let mut body = get_output.body;
        let mut part_number: i32 = 1;
        let mut completed_parts = Vec::new();
        let mut part_md5s = Vec::new();
        let mut buffer = BytesMut::with_capacity(part_size as usize);
        let mut ttfb_ms: Option<f64> = None;

        loop {
            if cancellation.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            match body.try_next().await {
                Ok(Some(chunk)) => {
                    if ttfb_ms.is_none() {
                        ttfb_ms = Some(started.elapsed().as_secs_f64() * 1000.0);
                    }
                    hasher.absorb(&chunk);
                    buffer.extend_from_slice(&chunk);
                    if buffer.len() as u64 >= part_size {
                        self.flush_part(
                            item,
                            upload_id,
                            part_number,
                            &mut buffer,
                            &mut completed_parts,
                            &mut part_md5s,
                        )
                        .await?;
                        part_number += 1;
                    }
                }
                Ok(None) => break,
                Err(error) => return Err(TransferError::ObjectStore(error.to_string())),
            }
        }

        if !buffer.is_empty() {
            self.flush_part(
                item,
                upload_id,
                part_number,
                &mut buffer,
                &mut completed_parts,
                &mut part_md5s,
            )
            .await?;
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        let dest_bucket = self.dest_bucket.clone();
        let dest_key = item.dest_key.clone();
        let upload_id_owned = upload_id.to_string();
        let complete = self
            .dest_pool
            .with_retry(
                "complete-multipart-upload",
                move |client| {
                    let dest_bucket = dest_bucket.clone();
                    let dest_key = dest_key.clone();
                    let upload_id_owned = upload_id_owned.clone();
                    let completed_upload = completed_upload.clone();
                    Box::pin(async move {
                        client
                            .complete_multipart_upload()
                            .bucket(dest_bucket)
                            .key(dest_key)
                            .upload_id(upload_id_owned)
                            .multipart_upload(completed_upload)
                            .send()
                            .await
                            .map_err(|error| crate::client_pool::classify_sdk_error(&error))
                    })
                },
                TransferError::is_retriable,
            )
            .await?;

        Ok((
            DestUploadOutcome {
                etag: classifier::clean_etag(complete.e_tag().unwrap_or_default()),
                part_md5s: Some(part_md5s),
            },
            ttfb_ms.unwrap_or_else(|| started.elapsed().as_secs_f64() * 1000.0),
        ))
    }

    async fn flush_part(
        &self,
        item: &WorkItem,
        upload_id: &str,
        part_number: i32,
        buffer: &mut BytesMut,
        completed_parts: &mut Vec<CompletedPart>,
        part_md5s: &mut Vec<[u8; 16]>,
    ) -> Result<(), TransferError> {
        let part_bytes = buffer.split().freeze();
        let mut md5_hasher = Md5::new();
        md5_hasher.update(&part_bytes);
        let part_md5: [u8; 16] = md5_hasher.finalize().into();
        let content_md5 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, part_md5);

        let dest_bucket = self.dest_bucket.clone();
        let dest_key = item.dest_key.clone();
        let upload_id_owned = upload_id.to_string();
        let body = part_bytes.clone();
        let response = self
            .dest_pool
            .with_retry(
                "upload-part",
                move |client| {
                    let dest_bucket = dest_bucket.clone();
                    let dest_key = dest_key.clone();
                    let upload_id_owned = upload_id_owned.clone();
                    let body = body.clone();
                    let content_md5 = content_md5.clone();
                    Box::pin(async move {
                        client
                            .upload_part()
                            .bucket(dest_bucket)
                            .key(dest_key)
                            .upload_id(upload_id_owned)
                            .part_number(part_number)
                            .content_md5(content_md5)
                            .body(ByteStream::from(body))
                            .send()
                            .await
                            .map_err(|error| crate::client_pool::classify_sdk_error(&error))
                    })
                },
                TransferError::is_retriable,
            )
            .await?;

        completed_parts.push(
            CompletedPart::builder()
                .part_number(part_number)
                .set_e_tag(response.e_tag().map(str::to_string))
                .build(),
        );
        part_md5s.push(part_md5);
        Ok(())
    }

    async fn read_source_into_buffer(
        &self,
        item: &WorkItem,
        hasher: &mut StreamingHasher,
        cancellation: &CancellationToken,
    ) -> Result<(BytesMut, f64), TransferError> {
        let bucket = self.source_bucket.clone();
        let key = item.source_key.clone();
        let started = Instant::now();
        let get_output = self
            .source_pool
            .with_retry(
                "get-object",
                move |client| {
                    let bucket = bucket.clone();
                    let key = key.clone();
                    Box::pin(async move {
                        client
                            .get_object()
                            .bucket(bucket)
                            .key(key)
                            .send()
                            .await
                            .map_err(|error| crate::client_pool::classify_sdk_error(&error))
                    })
                },
                TransferError::is_retriable,
            )
            .await?;

        let mut body = get_output.body;
        let mut buffer = BytesMut::new();
        let mut ttfb_ms: Option<f64> = None;
        loop {
            if cancellation.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            match body.try_next().await {
                Ok(Some(chunk)) => {
                    if ttfb_ms.is_none() {
                        ttfb_ms = Some(started.elapsed().as_secs_f64() * 1000.0);
                    }
                    hasher.absorb(&chunk);
                    buffer.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(error) => return Err(TransferError::ObjectStore(error.to_string())),
            }
        }
        Ok((
            buffer,
            ttfb_ms.unwrap_or_else(|| started.elapsed().as_secs_f64() * 1000.0),
        ))
    }

    fn verify(
        &self,
        item: &WorkItem,
        hasher: &StreamingHasher,
        dest_upload: &DestUploadOutcome,
    ) -> VerificationOutcome {
        let digests = hasher.snapshot();
        let dest_host = self.dest_pool.endpoint_hostname();
        let base_class = classifier::classify_endpoint(dest_host);
        let dest_provider = classifier::refine_with_etag(base_class, &dest_upload.etag);

        let expected_composite = dest_upload
            .part_md5s
            .as_ref()
            .map(|parts| classifier::composite_etag(parts));

        let result = classifier::verify(
            dest_provider,
            &dest_upload.etag,
            &digests,
            expected_composite.as_deref(),
        );

        let size_match = digests.bytes_seen as i64 == item.source_size;

        VerificationOutcome {
            object_key: item.source_key.clone(),
            source_etag: item.source_etag.clone(),
            source_size: item.source_size,
            source_provider: classifier::classify_endpoint(self.source_pool.endpoint_hostname()),
            dest_etag: Some(dest_upload.etag.clone()),
            dest_size: Some(digests.bytes_seen as i64),
            dest_provider: Some(dest_provider),
            computed_md5: digests.md5_hex,
            computed_sha1: digests.sha1_hex,
            computed_sha256: digests.sha256_hex,
            computed_crc32: digests.crc32_hex,
            etag_match: result.etag_match,
            size_match,
            md5_match: result.md5_match,
            sha1_match: result.sha1_match,
            is_valid: size_match
                && (result.etag_match || matches!(result.mode, VerificationMode::Opaque)),
            error_message: None,
        }
    }

    fn synthetic_dry_run_outcome(
        &self,
        item: &WorkItem,
        size: i64,
        source_etag: &str,
    ) -> VerificationOutcome {
        VerificationOutcome {
            object_key: item.source_key.clone(),
            source_etag: source_etag.to_string(),
            source_size: size,
            source_provider: ProviderClass::Opaque,
            dest_etag: None,
            dest_size: None,
            dest_provider: None,
            computed_md5: String::new(),
            computed_sha1: String::new(),
            computed_sha256: String::new(),
            computed_crc32: String::new(),
            etag_match: false,
            size_match: false,
            md5_match: false,
            sha1_match: false,
            is_valid: true,
            error_message: Some("would copy (dry run)".to_string()),
        }
    }
}

struct DestUploadOutcome {
    etag: String,
    part_md5s: Option<Vec<[u8; 16]>>,
}

/// Rough per-worker heap overhead for a transfer of `size_bytes`: the
/// in-flight read buffer plus digest state. Feeds C5's EWMA estimator.
fn estimate_overhead_bytes(size_bytes: u64) -> u64 {
    size_bytes.min(64 * 1024 * 1024) + 64 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn overhead_estimate_caps_at_the_largest_buffered_chunk() {
        assert!(estimate_overhead_bytes(1_000_000_000) <= 64 * 1024 * 1024 + 64 * 1024);
        assert!(estimate_overhead_bytes(1_000) >= 1_000);
    }
}
