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

//! Connection pool (C1). Lazily builds S3-compatible clients from static
//! credentials, region, and a custom endpoint, and wraps every call
//! through `migrator_common::retries::with_retries` so transient faults
//! (timeouts, 5xx, throttling) are retried and terminal faults (4xx auth
//! / argument errors) surface immediately.

use crate::config::ObjectStoreConfig;
use crate::error::TransferError;
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::Client;
use migrator_common::config::RetryConfig;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Bounds concurrent in-flight requests against one endpoint, the way
/// the source bounds destination-pool size at twice the source
/// pool size to reflect PUT asymmetry (spec §4.1); the actual S3 client
/// is cheap to clone and shares a connection pool internally, so the
/// semaphore -- not a literal client checkout -- is what this `Pool`
/// enforces.
pub struct ConnectionPool {
    client: Client,
    endpoint_hostname: String,
    retries: RetryConfig,
    semaphore: Arc<Semaphore>,
}

impl ConnectionPool {
    pub async fn connect(config: &ObjectStoreConfig, capacity: usize) -> Self {
        let region_provider = RegionProviderChain::first_try(Some(
            aws_config::Region::new(config.region.clone()),
        ))
        .or_else("us-east-1");

        let mut builder = aws_config::defaults(BehaviorVersion::latest()).region(region_provider);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint.clone());
        }
        if !config.access_key_id.is_empty() {
            builder = builder.credentials_provider(Credentials::new(
                &config.access_key_id,
                &config.secret_access_key,
                None,
                None,
                "migrator",
            ));
        }

        let sdk_config = builder.load().await;
        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if config.use_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let endpoint_hostname = config
            .endpoint
            .as_deref()
            .and_then(|url| url::Url::parse(url).ok())
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| format!("s3.{}.amazonaws.com", config.region));

        Self {
            client: Client::from_conf(s3_config_builder.build()),
            endpoint_hostname,
            retries: config.retries.clone(),
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn endpoint_hostname(&self) -> &str {
        &self.endpoint_hostname
    }

    /// Runs `action` under the pool's concurrency semaphore, retrying
    /// transient faults with backoff per `migrator_common::retries`.
    /// `is_retriable` is caller-supplied because both transfer-path
    /// errors (`TransferError`) and plan-path errors (`PlannerError`)
    /// route through the same pool.
    pub async fn with_retry<T, E>(
        &self,
        operation: &str,
        action: impl Fn(&Client) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send + '_>>,
        is_retriable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        E: std::fmt::Debug,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("connection pool semaphore closed");

        migrator_common::retries::with_retries(
            "connection-pool",
            operation,
            Some(self.endpoint_hostname.clone()),
            &self.retries,
            &self.client,
            action,
            is_retriable,
        )
        .await
    }
}

/// Classifies an S3 SDK error into transient vs. terminal the way spec
/// §4.1 requires: timeouts/throttling are transient, everything else
/// (including 4xx auth/argument errors) is terminal. Dispatch-level
/// failures (connect timeout, broken pipe) are always treated as
/// transient; service errors are classified from the error code S3
/// reports via `ProvideErrorMetadata`.
pub fn classify_sdk_error<E, R>(error: &SdkError<E, R>) -> TransferError
where
    E: ProvideErrorMetadata + std::fmt::Display,
{
    match error {
        SdkError::TimeoutError(_) => TransferError::Timeout,
        SdkError::DispatchFailure(_) => TransferError::Timeout,
        SdkError::ConstructionFailure(_) => TransferError::InvalidArgument(error.to_string()),
        SdkError::ResponseError(_) => TransferError::ObjectStore(error.to_string()),
        SdkError::ServiceError(service_error) => {
            let code = service_error.err().code().unwrap_or_default();
            match code {
                "RequestTimeout" | "SlowDown" | "ThrottlingException" | "TooManyRequests" => {
                    TransferError::Throttled
                }
                "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" => {
                    TransferError::Unauthorized(error.to_string())
                }
                "NoSuchBucket" | "NoSuchKey" | "InvalidArgument" | "InvalidRequest" => {
                    TransferError::InvalidArgument(error.to_string())
                }
                _ => TransferError::ObjectStore(error.to_string()),
            }
        }
        other => TransferError::ObjectStore(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn object_store_config_without_credentials_still_builds_a_client() {
        let config = ObjectStoreConfig::default();
        // `ConnectionPool::connect` is async and talks to the region
        // resolver only; this just exercises the endpoint-hostname
        // fallback without needing network access.
        let hostname = config
            .endpoint
            .as_deref()
            .and_then(|url| url::Url::parse(url).ok())
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| format!("s3.{}.amazonaws.com", config.region));
        assert_eq!(hostname, "s3.us-east-1.amazonaws.com");
    }
}
