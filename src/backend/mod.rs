mod clock;
mod input_builder;
mod key;

#[cfg(feature = "dashmap")]
#[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
pub mod memory;

#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub mod redis;

pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use input_builder::{CallerIdentity, RateLimitInputBuilder, RateLimitInputFuture};
pub use key::RequestKey;

use crate::RateLimitStatus;
use std::future::Future;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn is_denied(self) -> bool {
        matches!(self, Self::Denied)
    }
}

/// Describes an implementation of a rate limiting store and algorithm.
///
/// A Backend is required to implement [Clone], usually this means wrapping your data store within
/// an [Arc](std::sync::Arc), although many connection pools already do so internally; there is no
/// need to wrap it twice.
pub trait Backend<I: 'static = RateLimitInput>: Clone {
    type Output;
    type RollbackToken;
    type Error;

    /// Process an incoming request.
    ///
    /// The input identifies the caller and the resource being limited.
    ///
    /// Returns whether to allow or deny the request, arbitrary output that can be used
    /// to transform the allowed and denied responses, and a token to allow the admission
    /// to be rolled back in certain conditions.
    fn request(
        &self,
        input: I,
    ) -> impl Future<Output = Result<(Decision, Self::Output, Self::RollbackToken), Self::Error>>;

    /// Under certain conditions we may not want an admitted request to count.
    ///
    /// E.g. We may want to exclude 5xx errors from counting against a user's rate limit,
    /// we can only exclude them after having already allowed the request through the rate limiter
    /// in the first place, so we must therefore deduct from the rate limit log afterwards.
    ///
    /// Note that if this function fails there is not much the [RateLimiter](crate::RateLimiter)
    /// can do about it, given that the request has already been allowed.
    ///
    /// # Arguments
    ///
    /// * `token`: The token returned from the initial call to [Backend::request()].
    fn rollback(&self, token: Self::RollbackToken)
        -> impl Future<Output = Result<(), Self::Error>>;
}

/// The default [Backend] input: who is asking, and for what.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RateLimitInput {
    /// Stable caller identifier, e.g. an authenticated user id or a network address.
    pub identity: String,
    /// The rate limited target, e.g. a project id. Empty means global.
    pub resource: String,
}

impl RateLimitInput {
    pub fn new(identity: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            resource: resource.into(),
        }
    }
}

/// An admission decision for one request.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RateLimitOutput {
    pub decision: Decision,
    /// Total number of requests that are permitted within the window.
    pub limit: u64,
    /// Number of further requests that would currently be admitted.
    pub remaining: u64,
    /// Milliseconds until a denied request may be retried, zero when allowed.
    pub retry_after_ms: u64,
    /// Milliseconds until the oldest counted request leaves the window.
    pub reset_after_ms: u64,
}

impl RateLimitOutput {
    pub fn allowed(limit: u64, remaining: u64, reset_after_ms: u64) -> Self {
        Self {
            decision: Decision::Allowed,
            limit,
            remaining,
            retry_after_ms: 0,
            reset_after_ms,
        }
    }

    pub fn denied(limit: u64, retry_after_ms: u64) -> Self {
        Self {
            decision: Decision::Denied,
            limit,
            remaining: 0,
            retry_after_ms,
            reset_after_ms: retry_after_ms,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision.is_allowed()
    }
}

impl RateLimitStatus for RateLimitOutput {
    fn limit(&self) -> u64 {
        self.limit
    }

    fn remaining(&self) -> u64 {
        self.remaining
    }

    fn retry_after_ms(&self) -> u64 {
        self.retry_after_ms
    }

    fn reset_after_ms(&self) -> u64 {
        self.reset_after_ms
    }
}
