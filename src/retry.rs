use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::{error::ExecutorError, query_executor::RemoteExecutor};

pub const SDL_QUERY: &str = "{ _sdl }";

/// Fixed-delay bounded retry. `max_attempts` counts the first try.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Used when a gateway boots alongside the services it stitches.
    pub const STARTUP: RetryPolicy = RetryPolicy::new(10, Duration::from_millis(300));
    /// Used by registry load cycles, where services are expected to be up.
    pub const REFRESH: RetryPolicy = RetryPolicy::new(5, Duration::from_millis(150));

    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::REFRESH
    }
}

/// Runs `operation` until it succeeds or `policy.max_attempts` is reached,
/// sleeping `policy.delay` between attempts. The last error is returned.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= policy.max_attempts => {
                warn!(attempt, error = %err, "giving up after final attempt");
                return Err(err);
            }
            Err(err) => {
                debug!(attempt, error = %err, delay_ms = policy.delay.as_millis() as u64, "attempt failed, retrying");
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}

/// Probes a service for its SDL, waiting for it to come up.
pub async fn fetch_sdl<E>(executor: &E, url: &str, policy: RetryPolicy) -> Result<String, ExecutorError>
where
    E: RemoteExecutor + Sync + ?Sized,
{
    retry(policy, move |_| async move {
        let mut response = executor.execute(SDL_QUERY, None).await?;
        match response.pointer_mut("/data/_sdl").map(Value::take) {
            Some(Value::String(sdl)) => Ok(sdl),
            _ => Err(ExecutorError::MissingSdl {
                url: url.to_string(),
                errors: response.get("errors").cloned().unwrap_or(Value::Null),
            }),
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::time::Instant;

    use super::*;

    struct FlakyService {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyService {
        fn new(failures: u32) -> Self {
            FlakyService {
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteExecutor for FlakyService {
        async fn execute(
            &self,
            document: &str,
            _variables: Option<Value>,
        ) -> Result<Value, ExecutorError> {
            assert_eq!(document, SDL_QUERY);
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Ok(json!({ "errors": [{ "message": "not ready" }] }))
            } else {
                Ok(json!({ "data": { "_sdl": "type Query { ok: Boolean }" } }))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let service = FlakyService::new(2);
        let policy = RetryPolicy::new(3, Duration::from_millis(100));

        let sdl = fetch_sdl(&service, "http://x/graphql", policy).await.unwrap();

        assert_eq!(sdl, "type Query { ok: Boolean }");
        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let service = FlakyService::new(u32::MAX);
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let started = Instant::now();

        let err = fetch_sdl(&service, "http://x/graphql", policy)
            .await
            .unwrap_err();

        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(200));
        match err {
            ExecutorError::MissingSdl { url, errors } => {
                assert_eq!(url, "http://x/graphql");
                assert_eq!(errors[0]["message"], "not ready");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_sleep_after_success() {
        let started = Instant::now();
        let result: Result<u32, String> =
            retry(RetryPolicy::STARTUP, |attempt| async move { Ok(attempt) }).await;

        assert_eq!(result, Ok(1));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn passes_attempt_number_to_operation() {
        let mut seen = Vec::new();
        let result: Result<(), String> = retry(RetryPolicy::new(4, Duration::from_millis(10)), |attempt| {
            seen.push(attempt);
            async move { Err(format!("attempt {attempt} failed")) }
        })
        .await;

        assert_eq!(result, Err("attempt 4 failed".to_string()));
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }
}
