use crate::backend::{
    Backend, Clock, Decision, RateLimitInput, RateLimitOutput, RequestKey, SystemClock,
};
use crate::policy::WindowPolicy;
use crate::ValidationError;
use actix_web::http::StatusCode;
use actix_web::ResponseError;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Request count unavailable: {0}")]
    CountUnavailable(#[source] BoxError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::CountUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Validation(e) => e.status_code(),
        }
    }
}

/// Reports how many requests an external store has recorded for a key.
///
/// Implemented for any `Fn(resource, identity, window_start) -> Future<Output = Result<u64, E>>`.
pub trait RequestCounter {
    type Error: std::error::Error + Send + Sync + 'static;

    /// The number of requests recorded for `identity` against `resource` with a timestamp at or
    /// after `window_start` (milliseconds since the epoch).
    fn count(
        &self,
        resource: &str,
        identity: &str,
        window_start: u64,
    ) -> impl Future<Output = Result<u64, Self::Error>>;
}

impl<F, Fut, E> RequestCounter for F
where
    F: Fn(&str, &str, u64) -> Fut,
    Fut: Future<Output = Result<u64, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    type Error = E;

    fn count(
        &self,
        resource: &str,
        identity: &str,
        window_start: u64,
    ) -> impl Future<Output = Result<u64, Self::Error>> {
        (self)(resource, identity, window_start)
    }
}

/// The result of [StoreBackend::check_window].
#[derive(Debug)]
pub struct StoreCheck {
    pub output: RateLimitOutput,
    /// Set when the store could not be queried; the output then reflects the fail open policy.
    ///
    /// The error is handed back rather than swallowed so the caller can alert on it.
    pub store_error: Option<Error>,
}

/// A sliding window rate limiter [Backend] that decides from counts held in an external store.
///
/// This backend never records anything: after an allowed decision the caller must write the
/// request to the store itself, so that later counts include it. There is no timeout around the
/// count; bound the surrounding request instead.
pub struct StoreBackend<C> {
    policy: WindowPolicy,
    counter: Arc<C>,
    clock: Arc<dyn Clock>,
    fail_open: bool,
}

impl<C> Clone for StoreBackend<C> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy,
            counter: self.counter.clone(),
            clock: self.clock.clone(),
            fail_open: self.fail_open,
        }
    }
}

impl<C: RequestCounter> StoreBackend<C> {
    pub fn builder(policy: WindowPolicy, counter: C) -> StoreBackendBuilder<C> {
        StoreBackendBuilder {
            policy,
            counter,
            clock: Arc::new(SystemClock),
            fail_open: true,
        }
    }

    pub fn policy(&self) -> &WindowPolicy {
        &self.policy
    }

    /// Check against the window ending at the current clock time.
    ///
    /// The window is `(now - window_ms, now]`, matching the in-memory backend.
    pub async fn check(
        &self,
        identity: &str,
        resource: &str,
    ) -> Result<StoreCheck, ValidationError> {
        let now = self.clock.now_ms();
        self.check_window(identity, resource, self.window_start(now), now)
            .await
    }

    /// Decide whether a request may proceed given the store's count since `window_start`.
    ///
    /// If fewer than `max_requests` requests were counted the request is allowed, and
    /// `remaining` accounts for the caller recording this one. Otherwise it is denied with
    /// `retry_after_ms` set to the window length, the latest a slot can take to free up.
    ///
    /// If the count fails the request is allowed (fail open) unless the backend was built with
    /// `fail_open(false)`, and the error is returned in [StoreCheck::store_error] either way.
    ///
    /// # Errors
    ///
    /// Only an empty `identity` is rejected, before the store is queried.
    pub async fn check_window(
        &self,
        identity: &str,
        resource: &str,
        window_start: u64,
        now_ms: u64,
    ) -> Result<StoreCheck, ValidationError> {
        let key = RequestKey::new(identity, resource)?;
        Ok(self.check_key(&key, window_start, now_ms).await)
    }

    async fn check_key(&self, key: &RequestKey, window_start: u64, now_ms: u64) -> StoreCheck {
        let max_requests = self.policy.max_requests();
        let window_ms = self.policy.window_ms();
        match self
            .counter
            .count(key.resource(), key.identity(), window_start)
            .await
        {
            Ok(count) if count < max_requests => StoreCheck {
                output: RateLimitOutput::allowed(
                    max_requests,
                    max_requests - (count + 1),
                    window_ms,
                ),
                store_error: None,
            },
            Ok(count) => {
                log::debug!(
                    "Rate limit exceeded for {} at {} ({} recorded)",
                    key,
                    now_ms,
                    count
                );
                StoreCheck {
                    output: RateLimitOutput::denied(max_requests, window_ms),
                    store_error: None,
                }
            }
            Err(e) => {
                let output = if self.fail_open {
                    log::warn!(
                        "Unable to count requests for {}: {}, allowing the request anyway",
                        key,
                        e
                    );
                    RateLimitOutput::allowed(max_requests, max_requests - 1, window_ms)
                } else {
                    log::error!("Unable to count requests for {}: {}", key, e);
                    RateLimitOutput::denied(max_requests, window_ms)
                };
                StoreCheck {
                    output,
                    store_error: Some(Error::CountUnavailable(Box::new(e))),
                }
            }
        }
    }

    // Counts are inclusive of window_start, so start one millisecond later than now - window
    fn window_start(&self, now: u64) -> u64 {
        now.saturating_sub(self.policy.window_ms() - 1)
    }
}

impl<C> Backend<RateLimitInput> for StoreBackend<C>
where
    C: RequestCounter + 'static,
{
    type Output = RateLimitOutput;
    type RollbackToken = ();
    type Error = Error;

    async fn request(
        &self,
        input: RateLimitInput,
    ) -> Result<(Decision, Self::Output, Self::RollbackToken), Self::Error> {
        let key = RequestKey::new(input.identity, input.resource)?;
        let now = self.clock.now_ms();
        let check = self.check_key(&key, self.window_start(now), now).await;
        match check.store_error {
            Some(e) if !self.fail_open => Err(e),
            _ => Ok((check.output.decision, check.output, ())),
        }
    }

    /// The store owns the recorded requests, so there is nothing to undo here.
    async fn rollback(&self, _token: Self::RollbackToken) -> Result<(), Self::Error> {
        Ok(())
    }
}

pub struct StoreBackendBuilder<C> {
    policy: WindowPolicy,
    counter: C,
    clock: Arc<dyn Clock>,
    fail_open: bool,
}

impl<C: RequestCounter> StoreBackendBuilder<C> {
    /// Choose whether to allow a request when the store cannot be queried.
    ///
    /// Default is true, so that a store outage does not block all traffic. Only disable this
    /// when the limit protects something more important than availability.
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Override the clock used to compute the window. Defaults to [SystemClock].
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn build(self) -> StoreBackend<C> {
        StoreBackend {
            policy: self.policy,
            counter: Arc::new(self.counter),
            clock: self.clock,
            fail_open: self.fail_open,
        }
    }
}
