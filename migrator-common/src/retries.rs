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

use crate::config::RetryConfig;
use rand::Rng;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{info, warn};

/// Runs `action` against `state`, retrying on errors classified as
/// retriable by `is_retriable`, with exponential backoff and jitter.
/// `component`/`operation`/`context` are purely for logging: every retry
/// and the final failure are logged with them attached, the same way the
/// rest of the stack names its retried calls (`"limit"`,
/// `"update-component-limit"`, `Some(account_id)`).
pub async fn with_retries<S, T, E>(
    component: &str,
    operation: &str,
    context: Option<String>,
    retry_config: &RetryConfig,
    state: &S,
    action: impl Fn(&S) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send + '_>>,
    is_retriable: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    E: Debug,
{
    let mut attempt: u32 = 0;
    let mut delay = retry_config.min_delay;

    loop {
        attempt += 1;
        match action(state).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let retriable = is_retriable(&error);
                if !retriable || attempt >= retry_config.max_attempts {
                    warn!(
                        component,
                        operation,
                        context = context.as_deref().unwrap_or(""),
                        attempt,
                        retriable,
                        "giving up after {attempt} attempt(s): {error:?}"
                    );
                    return Err(error);
                }

                info!(
                    component,
                    operation,
                    context = context.as_deref().unwrap_or(""),
                    attempt,
                    ?delay,
                    "retriable error, backing off: {error:?}"
                );

                tokio::time::sleep(jittered(delay, retry_config.max_jitter_factor)).await;
                delay = next_delay(delay, retry_config);
            }
        }
    }
}

fn next_delay(current: Duration, retry_config: &RetryConfig) -> Duration {
    let scaled = current.mul_f64(retry_config.multiplier);
    scaled.min(retry_config.max_delay)
}

fn jittered(delay: Duration, max_jitter_factor: Option<f64>) -> Duration {
    match max_jitter_factor {
        None => delay,
        Some(factor) if factor <= 0.0 => delay,
        Some(factor) => {
            let jitter = rand::rng().random_range(0.0..=factor);
            delay.mul_f64(1.0 + jitter)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use test_r::test;

    #[derive(Debug)]
    struct Transient;
    #[derive(Debug)]
    struct Terminal;

    fn fast_retry_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_jitter_factor: None,
        }
    }

    #[test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<u32, Transient> = with_retries(
            "test",
            "op",
            None,
            &fast_retry_config(),
            &calls,
            |calls| {
                Box::pin(async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(Transient)
                    } else {
                        Ok(n)
                    }
                })
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    async fn stops_immediately_on_terminal_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<u32, Terminal> = with_retries(
            "test",
            "op",
            None,
            &fast_retry_config(),
            &calls,
            |calls| {
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Terminal)
                })
            },
            |_| false,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<u32, Transient> = with_retries(
            "test",
            "op",
            Some("ctx".to_string()),
            &fast_retry_config(),
            &calls,
            |calls| {
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Transient)
                })
            },
            |_| true,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
