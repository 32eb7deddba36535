use crate::backend::RateLimitInput;
use actix_web::dev::ServiceRequest;
use actix_web::http::StatusCode;
use actix_web::{HttpMessage, ResponseError};
use std::future::{ready, Ready};
use std::net::{AddrParseError, IpAddr, Ipv6Addr};
use thiserror::Error;

type ResourceFn = Box<dyn Fn(&ServiceRequest) -> Result<String, actix_web::Error>>;

pub type RateLimitInputFuture = Ready<Result<RateLimitInput, actix_web::Error>>;

/// The authenticated caller of a request.
///
/// An authentication layer running before the rate limiter inserts this into the request
/// extensions; it takes precedence over the client address as the rate limit identity.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CallerIdentity(pub String);

/// Utility to create an input function that produces a [RateLimitInput].
///
/// The identity is the [CallerIdentity] extension when present, otherwise the client IP
/// (prefixed with `ip:`). The resource is taken from a path parameter or a custom function, and
/// is empty (global) when neither is configured or the parameter is absent.
pub struct RateLimitInputBuilder {
    real_ip_fallback: bool,
    resource_param: Option<String>,
    resource_fn: Option<ResourceFn>,
}

impl Default for RateLimitInputBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitInputBuilder {
    pub fn new() -> Self {
        Self {
            real_ip_fallback: false,
            resource_param: None,
            resource_fn: None,
        }
    }

    /// Use the client's real IP for unauthenticated callers, instead of the connection peer.
    ///
    /// # Security
    ///
    /// This calls
    /// [ConnectionInfo::realip_remote_addr()](actix_web::dev::ConnectionInfo::realip_remote_addr)
    /// internally which is only suitable for Actix applications deployed behind a proxy that you
    /// control.
    ///
    /// # IPv6
    ///
    /// IPv6 addresses will be grouped into a single key per /64
    pub fn real_ip_fallback(mut self) -> Self {
        self.real_ip_fallback = true;
        self
    }

    /// Use a matched path parameter (e.g. `project_id` in `/projects/{project_id}/tasks`) as
    /// the resource.
    ///
    /// Path parameters are only available once routing has happened, so the middleware must wrap
    /// the resource or scope rather than the whole App.
    pub fn resource_param(mut self, name: &str) -> Self {
        self.resource_param = Some(name.to_owned());
        self
    }

    /// Dynamically compute the resource, overriding [Self::resource_param].
    pub fn resource_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Result<String, actix_web::Error> + 'static,
    {
        self.resource_fn = Some(Box::new(f));
        self
    }

    pub fn build(self) -> impl Fn(&ServiceRequest) -> RateLimitInputFuture + 'static {
        move |req| {
            ready((|| {
                let caller = req.extensions().get::<CallerIdentity>().cloned();
                let identity = match caller {
                    Some(CallerIdentity(id)) => id,
                    None => {
                        let info = req.connection_info();
                        let addr = if self.real_ip_fallback {
                            info.realip_remote_addr()
                        } else {
                            info.peer_addr()
                        };
                        let addr = addr.ok_or(Error::MissingIdentity)?;
                        format!("ip:{}", ip_key(addr)?)
                    }
                };
                let resource = match (&self.resource_fn, &self.resource_param) {
                    (Some(f), _) => f(req)?,
                    (None, Some(name)) => {
                        req.match_info().get(name).unwrap_or_default().to_owned()
                    }
                    (None, None) => String::new(),
                };
                Ok(RateLimitInput { identity, resource })
            })())
        }
    }
}

#[derive(Debug, Error)]
enum Error {
    #[error("Unable to parse remote IP address: {0}")]
    InvalidIpError(
        #[source]
        #[from]
        AddrParseError,
    ),
    #[error("Unable to identify the caller")]
    MissingIdentity,
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidIpError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::MissingIdentity => StatusCode::BAD_REQUEST,
        }
    }
}

// Groups IPv6 addresses together, see:
// https://adam-p.ca/blog/2022/02/ipv6-rate-limiting/
fn ip_key(ip_str: &str) -> Result<String, Error> {
    // Forwarded headers may carry a port
    let ip = match ip_str.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(e) => match ip_str.parse::<std::net::SocketAddr>() {
            Ok(socket) => socket.ip(),
            Err(_) => return Err(e.into()),
        },
    };
    Ok(match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return Ok(v4.to_string());
            }
            let segments = v6.segments();
            let subnet = Ipv6Addr::new(
                segments[0],
                segments[1],
                segments[2],
                segments[3],
                0,
                0,
                0,
                0,
            );
            format!("{}/64", subnet)
        }
    })
}
