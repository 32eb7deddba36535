pub mod builder;

use crate::backend::Backend;
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::HeaderMap;
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use builder::{RateLimitStatus, RateLimiterBuilder};
use futures::future::{ok, LocalBoxFuture, Ready};
use std::cell::RefCell;
use std::{future::Future, rc::Rc};

type AllowedTransformation<BO> = dyn Fn(&mut HeaderMap, Option<&BO>, bool);
type DeniedResponse<BO> = dyn Fn(&BO) -> HttpResponse;
type RollbackCondition = dyn Fn(StatusCode) -> bool;

/// Response handling configured through the [RateLimiterBuilder], shared by every worker.
struct Hooks<BO> {
    fail_open: bool,
    allowed_transformation: Option<Box<AllowedTransformation<BO>>>,
    denied_response: Box<DeniedResponse<BO>>,
    rollback_condition: Option<Box<RollbackCondition>>,
}

/// Rate limit middleware.
///
/// Denied requests are answered directly, by default with status 429 and a JSON body of the form
/// `{"error": "...", "retryAfterMs": 700}`. Allowed requests are passed on to the wrapped service.
pub struct RateLimiter<BA, BO, F> {
    backend: BA,
    input_fn: Rc<F>,
    hooks: Rc<Hooks<BO>>,
}

impl<BA, BI, BO, F, O> Clone for RateLimiter<BA, BO, F>
where
    BA: Backend<BI> + 'static,
    BI: 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<BI, actix_web::Error>>,
{
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            input_fn: self.input_fn.clone(),
            hooks: self.hooks.clone(),
        }
    }
}

impl<BA, BI, BO, F, O> RateLimiter<BA, BO, F>
where
    BA: Backend<BI, Output = BO> + 'static,
    BI: 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<BI, actix_web::Error>>,
{
    /// # Arguments
    ///
    /// * `backend`: A rate limiting algorithm and store implementation.
    /// * `input_fn`: A future that produces input to the backend based on the incoming request,
    ///   see [RateLimitInputBuilder](crate::backend::RateLimitInputBuilder).
    pub fn builder(backend: BA, input_fn: F) -> RateLimiterBuilder<BA, BO, F>
    where
        BO: RateLimitStatus + 'static,
    {
        RateLimiterBuilder::new(backend, input_fn)
    }
}

impl<S, B, BA, BI, BO, BE, F, O> Transform<S, ServiceRequest> for RateLimiter<BA, BO, F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    BA: Backend<BI, Output = BO, Error = BE> + 'static,
    BI: 'static,
    BO: 'static,
    BE: Into<actix_web::Error> + std::fmt::Display + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<BI, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = RateLimiterMiddleware<S, BA, BO, F>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RateLimiterMiddleware {
            service: Rc::new(RefCell::new(service)),
            backend: self.backend.clone(),
            input_fn: Rc::clone(&self.input_fn),
            hooks: Rc::clone(&self.hooks),
        })
    }
}

pub struct RateLimiterMiddleware<S, BA, BO, F> {
    service: Rc<RefCell<S>>,
    backend: BA,
    input_fn: Rc<F>,
    hooks: Rc<Hooks<BO>>,
}

impl<S, B, BA, BI, BO, BE, F, O> Service<ServiceRequest> for RateLimiterMiddleware<S, BA, BO, F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    BA: Backend<BI, Output = BO, Error = BE> + 'static,
    BI: 'static,
    BO: 'static,
    BE: Into<actix_web::Error> + std::fmt::Display + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<BI, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let backend = self.backend.clone();
        let input_fn = self.input_fn.clone();
        let hooks = self.hooks.clone();

        Box::pin(async move {
            let input = match (input_fn)(&req).await {
                Ok(input) => input,
                Err(e) => {
                    log::warn!("Unable to derive rate limit input for {}: {e}", req.path());
                    return Ok(req.into_response(e.error_response()).map_into_right_body());
                }
            };

            // Output is None when the backend failed and we are failing open
            let (output, token) = match backend.request(input).await {
                Ok((decision, output, _)) if decision.is_denied() => {
                    log::debug!("Rate limit exceeded for {}", req.path());
                    let response = (hooks.denied_response)(&output);
                    return Ok(req.into_response(response).map_into_right_body());
                }
                Ok((_, output, token)) => (Some(output), Some(token)),
                Err(e) if hooks.fail_open => {
                    log::warn!("Rate limiter backend failed: {e}, allowing the request anyway");
                    (None, None)
                }
                Err(e) => {
                    log::error!("Rate limiter backend failed: {e}");
                    let response = e.into().error_response();
                    return Ok(req.into_response(response).map_into_right_body());
                }
            };

            let mut response = service.call(req).await?;

            let status = response.status();
            let rolled_back = match (token, &hooks.rollback_condition) {
                (Some(token), Some(condition)) if condition(status) => {
                    match backend.rollback(token).await {
                        Ok(()) => true,
                        Err(e) => {
                            log::error!("Unable to roll back admission after {status}: {e}");
                            false
                        }
                    }
                }
                _ => false,
            };

            if let Some(transformation) = &hooks.allowed_transformation {
                transformation(response.headers_mut(), output.as_ref(), rolled_back);
            }

            Ok(response.map_into_left_body())
        })
    }
}
