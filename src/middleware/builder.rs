use crate::backend::Backend;
use crate::middleware::{
    AllowedTransformation, DeniedResponse, Hooks, RateLimiter, RollbackCondition,
};
use actix_web::dev::ServiceRequest;
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::future::Future;
use std::rc::Rc;

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub static X_RATELIMIT_RESET: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-reset"));

pub const DENIED_MESSAGE: &str = "Too many requests, please try again later.";

/// JSON body of the default denied response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeniedBody<'a> {
    pub error: &'a str,
    pub retry_after_ms: u64,
}

/// Builds the default 429 response for a denied request.
pub fn too_many_requests<BO: RateLimitStatus>(status: &BO) -> HttpResponse {
    HttpResponse::TooManyRequests().json(DeniedBody {
        error: DENIED_MESSAGE,
        retry_after_ms: status.retry_after_ms(),
    })
}

pub struct RateLimiterBuilder<BE, BO, F> {
    backend: BE,
    input_fn: F,
    fail_open: bool,
    allowed_transformation: Option<Box<AllowedTransformation<BO>>>,
    denied_response: Box<DeniedResponse<BO>>,
    rollback_condition: Option<Box<RollbackCondition>>,
}

impl<BE, BI, BO, F, O> RateLimiterBuilder<BE, BO, F>
where
    BE: Backend<BI, Output = BO> + 'static,
    BI: 'static,
    BO: RateLimitStatus + 'static,
    F: Fn(&ServiceRequest) -> O,
    O: Future<Output = Result<BI, actix_web::Error>>,
{
    pub(super) fn new(backend: BE, input_fn: F) -> Self {
        Self {
            backend,
            input_fn,
            fail_open: false,
            allowed_transformation: None,
            denied_response: Box::new(too_many_requests::<BO>),
            rollback_condition: None,
        }
    }

    /// Choose whether to allow a request if the backend returns a failure.
    ///
    /// Default is false. Note that a [StoreBackend](crate::backend::store::StoreBackend) already
    /// fails open by itself unless configured otherwise.
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Sets the [RateLimiterBuilder::request_allowed_transformation] and
    /// [RateLimiterBuilder::request_denied_response] functions, such that the following headers
    /// are set in both the allowed and denied responses:
    ///
    /// - `x-ratelimit-limit`\
    /// - `x-ratelimit-remaining`\
    /// - `x-ratelimit-reset` (seconds until the oldest counted request expires)
    /// - `retry-after` (denied only, seconds until a retry may succeed)
    ///
    /// The denied response keeps the default JSON body.
    pub fn add_headers(mut self) -> Self {
        self.allowed_transformation = Some(Box::new(
            |map: &mut HeaderMap, output: Option<&BO>, _rolled_back: bool| {
                if let Some(status) = output {
                    map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(status.limit()));
                    map.insert(
                        X_RATELIMIT_REMAINING.clone(),
                        HeaderValue::from(status.remaining()),
                    );
                    map.insert(
                        X_RATELIMIT_RESET.clone(),
                        HeaderValue::from(status.seconds_until_reset()),
                    );
                }
            },
        ));
        self.denied_response = Box::new(|status: &BO| {
            let mut response = too_many_requests(status);
            let map = response.headers_mut();
            map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(status.limit()));
            map.insert(
                X_RATELIMIT_REMAINING.clone(),
                HeaderValue::from(status.remaining()),
            );
            map.insert(
                X_RATELIMIT_RESET.clone(),
                HeaderValue::from(status.seconds_until_reset()),
            );
            map.insert(
                RETRY_AFTER,
                HeaderValue::from(ceil_seconds(status.retry_after_ms())),
            );
            response
        });
        self
    }

    /// In the event that the request is allowed:
    ///
    /// You can optionally mutate the response headers to include the rate limit status.
    ///
    /// By default no changes are made to the response.
    ///
    /// The output will be [None] if the backend failed and [RateLimiterBuilder::fail_open] is
    /// enabled. The final argument reports whether the request was rolled back.
    pub fn request_allowed_transformation<M>(mut self, mutation: Option<M>) -> Self
    where
        M: Fn(&mut HeaderMap, Option<&BO>, bool) + 'static,
    {
        self.allowed_transformation =
            mutation.map(|m| Box::new(m) as Box<AllowedTransformation<BO>>);
        self
    }

    /// In the event that the request is denied, configure the [HttpResponse] returned.
    ///
    /// Defaults to status 429 with a [DeniedBody] JSON body.
    pub fn request_denied_response<R>(mut self, denied_response: R) -> Self
    where
        R: Fn(&BO) -> HttpResponse + 'static,
    {
        self.denied_response = Box::new(denied_response);
        self
    }

    /// After processing a request, attempt to rollback the admission based on the status code
    /// of the returned response.
    ///
    /// By default the rate limit is never rolled back.
    pub fn rollback_condition<C>(mut self, condition: Option<C>) -> Self
    where
        C: Fn(StatusCode) -> bool + 'static,
    {
        self.rollback_condition = condition.map(|m| Box::new(m) as Box<RollbackCondition>);
        self
    }

    /// Configures the [RateLimiterBuilder::rollback_condition] to rollback if the status code
    /// is a server error (5xx).
    pub fn rollback_server_errors(mut self) -> Self {
        self.rollback_condition = Some(Box::new(|status: StatusCode| status.is_server_error()));
        self
    }

    pub fn build(self) -> RateLimiter<BE, BO, F> {
        RateLimiter {
            backend: self.backend,
            input_fn: Rc::new(self.input_fn),
            hooks: Rc::new(Hooks {
                fail_open: self.fail_open,
                allowed_transformation: self.allowed_transformation,
                denied_response: self.denied_response,
                rollback_condition: self.rollback_condition,
            }),
        }
    }
}

/// The rate limit state a [Backend::Output] exposes to the default responses and
/// [RateLimiterBuilder::add_headers].
pub trait RateLimitStatus {
    /// Value for the `x-ratelimit-limit` header.
    fn limit(&self) -> u64;

    /// Value for the `x-ratelimit-remaining` header.
    fn remaining(&self) -> u64;

    /// Milliseconds until a denied request may be retried, reported as `retryAfterMs`.
    fn retry_after_ms(&self) -> u64;

    /// Milliseconds until the oldest counted request stops counting.
    fn reset_after_ms(&self) -> u64;

    /// Value for the `x-ratelimit-reset` header, rounded upwards so that the limit is
    /// guaranteed to have moved after waiting for the duration.
    fn seconds_until_reset(&self) -> u64 {
        ceil_seconds(self.reset_after_ms())
    }
}

fn ceil_seconds(ms: u64) -> u64 {
    ms.div_ceil(1000)
}
