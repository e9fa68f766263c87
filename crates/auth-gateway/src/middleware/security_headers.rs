//! Security headers middleware
//!
//! Adds the hardening headers every response must carry:
//!
//! - `X-Content-Type-Options: nosniff`
//! - `X-Frame-Options: DENY`
//! - `Strict-Transport-Security` (when HTTPS is required)
//! - a restrictive `Content-Security-Policy`
//! - `Referrer-Policy: no-referrer`

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::{HeaderName, HeaderValue},
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    rc::Rc,
};

/// Security headers configuration
#[derive(Debug, Clone)]
pub struct SecurityHeadersConfig {
    /// Emit HSTS (only meaningful behind HTTPS)
    pub enable_hsts: bool,
    /// HSTS max-age in seconds (default: 1 year)
    pub hsts_max_age: u64,
    /// Content-Security-Policy value
    pub content_security_policy: String,
}

impl Default for SecurityHeadersConfig {
    fn default() -> Self {
        Self {
            enable_hsts: true,
            hsts_max_age: 31_536_000,
            content_security_policy: "default-src 'none'; frame-ancestors 'none'".to_string(),
        }
    }
}

impl SecurityHeadersConfig {
    /// Derive from the server configuration: HSTS follows the HTTPS
    /// requirement
    pub fn from_server(require_https: bool) -> Self {
        Self {
            enable_hsts: require_https,
            ..Self::default()
        }
    }
}

/// Security headers middleware
pub struct SecurityHeaders {
    config: Rc<SecurityHeadersConfig>,
}

impl SecurityHeaders {
    pub fn new(config: SecurityHeadersConfig) -> Self {
        Self {
            config: Rc::new(config),
        }
    }
}

impl Default for SecurityHeaders {
    fn default() -> Self {
        Self::new(SecurityHeadersConfig::default())
    }
}

impl<S, B> Transform<S, ServiceRequest> for SecurityHeaders
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = SecurityHeadersMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(SecurityHeadersMiddleware {
            service: Rc::new(service),
            config: self.config.clone(),
        }))
    }
}

pub struct SecurityHeadersMiddleware<S> {
    service: Rc<S>,
    config: Rc<SecurityHeadersConfig>,
}

impl<S, B> Service<ServiceRequest> for SecurityHeadersMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let config = self.config.clone();

        Box::pin(async move {
            let mut res = service.call(req).await?;
            let headers = res.headers_mut();

            headers.insert(
                HeaderName::from_static("x-content-type-options"),
                HeaderValue::from_static("nosniff"),
            );
            headers.insert(
                HeaderName::from_static("x-frame-options"),
                HeaderValue::from_static("DENY"),
            );
            headers.insert(
                HeaderName::from_static("referrer-policy"),
                HeaderValue::from_static("no-referrer"),
            );

            if let Ok(value) = HeaderValue::from_str(&config.content_security_policy) {
                headers.insert(HeaderName::from_static("content-security-policy"), value);
            }

            if config.enable_hsts {
                if let Ok(value) = HeaderValue::from_str(&format!(
                    "max-age={}; includeSubDomains",
                    config.hsts_max_age
                )) {
                    headers.insert(HeaderName::from_static("strict-transport-security"), value);
                }
            }

            Ok(res)
        })
    }
}
