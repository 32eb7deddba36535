#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod backend;
pub mod config;
mod error;
mod middleware;
pub mod policy;

pub use error::ValidationError;
pub use middleware::builder::{too_many_requests, DeniedBody, RateLimitStatus, RateLimiterBuilder};
pub use middleware::RateLimiter;
