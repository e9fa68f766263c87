//! CSRF protection (double-submit cookie)
//!
//! State-changing requests must echo the `csrf_token` cookie in the
//! `X-CSRF-Token` header. Tokens are `timestamp.random.signature` with
//! an HMAC-SHA256 signature over (random || timestamp), valid for one
//! hour. All comparisons are constant-time.
//!
//! The authentication bootstrap endpoints are exempt: a client cannot
//! hold a CSRF cookie before its first challenge, and those requests
//! are authorized by the wallet signature itself.

use actix_web::{
    cookie::{Cookie, SameSite},
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::Method,
    Error, HttpResponse,
};
use futures_util::future::LocalBoxFuture;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::{
    future::{ready, Ready},
    rc::Rc,
};
use subtle::ConstantTimeEq;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Token lifetime in seconds
const TOKEN_MAX_AGE: i64 = 3_600;

/// Cookie carrying the CSRF token
pub const CSRF_COOKIE: &str = "csrf_token";

/// Header the client must echo the cookie into
pub const CSRF_HEADER: &str = "X-CSRF-Token";

/// Paths that never require CSRF validation
const EXEMPT_PATHS: [&str; 3] = ["/auth/challenge", "/auth/verify", "/auth/refresh"];

/// CSRF protection middleware
pub struct CsrfProtection {
    secret: Rc<Vec<u8>>,
    secure_cookies: bool,
}

impl CsrfProtection {
    pub fn new(secret: &str, secure_cookies: bool) -> Self {
        Self {
            secret: Rc::new(secret.as_bytes().to_vec()),
            secure_cookies,
        }
    }
}

/// Mint a fresh `timestamp.random.signature` token
pub fn generate_token(secret: &[u8]) -> String {
    let timestamp = chrono::Utc::now().timestamp();
    let mut random = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut random);

    let signature = sign(secret, &random, timestamp);
    format!("{}.{}.{}", timestamp, hex::encode(random), signature)
}

/// Validate a token's structure, age and signature
pub fn validate_token(secret: &[u8], token: &str) -> bool {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return false;
    }

    let Ok(timestamp) = parts[0].parse::<i64>() else {
        return false;
    };
    let now = chrono::Utc::now().timestamp();
    if now - timestamp > TOKEN_MAX_AGE || timestamp > now + 60 {
        return false;
    }

    let Ok(random) = hex::decode(parts[1]) else {
        return false;
    };

    let expected = sign(secret, &random, timestamp);
    constant_time_eq(parts[2], &expected)
}

fn sign(secret: &[u8], random: &[u8], timestamp: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC key");
    mac.update(random);
    mac.update(timestamp.to_string().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn requires_validation(method: &Method, path: &str) -> bool {
    if !matches!(*method, Method::POST | Method::PUT | Method::DELETE | Method::PATCH) {
        return false;
    }
    !EXEMPT_PATHS.iter().any(|exempt| path.starts_with(exempt))
}

impl<S, B> Transform<S, ServiceRequest> for CsrfProtection
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: actix_web::body::MessageBody + 'static,
{
    type Response = ServiceResponse<actix_web::body::EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = CsrfProtectionMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(CsrfProtectionMiddleware {
            service: Rc::new(service),
            secret: self.secret.clone(),
            secure_cookies: self.secure_cookies,
        }))
    }
}

pub struct CsrfProtectionMiddleware<S> {
    service: Rc<S>,
    secret: Rc<Vec<u8>>,
    secure_cookies: bool,
}

impl<S, B> Service<ServiceRequest> for CsrfProtectionMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: actix_web::body::MessageBody + 'static,
{
    type Response = ServiceResponse<actix_web::body::EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let secret = self.secret.clone();
        let secure_cookies = self.secure_cookies;

        Box::pin(async move {
            if requires_validation(req.method(), req.path()) {
                let header = req
                    .headers()
                    .get(CSRF_HEADER)
                    .and_then(|h| h.to_str().ok())
                    .map(str::to_string);
                let cookie = req.cookie(CSRF_COOKIE).map(|c| c.value().to_string());

                let valid = match (&header, &cookie) {
                    (Some(header), Some(cookie)) => {
                        // Double-submit: header and cookie must match,
                        // and the token itself must verify
                        constant_time_eq(header, cookie) && validate_token(&secret, cookie)
                    }
                    _ => false,
                };

                if !valid {
                    warn!(
                        method = %req.method(),
                        path = %req.path(),
                        "CSRF validation failed"
                    );
                    let response = HttpResponse::Forbidden()
                        .json(crate::models::ErrorEnvelope::new(
                            shared::WcsapErrorCode::Unauthorized,
                            "CSRF token validation failed",
                        ))
                        .map_into_right_body();
                    let (req, _) = req.into_parts();
                    return Ok(ServiceResponse::new(req, response));
                }
            }

            let had_cookie = req.cookie(CSRF_COOKIE).is_some();
            let mut res = service.call(req).await?.map_into_left_body();

            // Seed the cookie so the client can start echoing it
            if !had_cookie {
                let token = generate_token(&secret);
                let cookie = Cookie::build(CSRF_COOKIE, token)
                    .secure(secure_cookies)
                    .http_only(false) // the client must read it to echo it
                    .same_site(SameSite::Strict)
                    .max_age(actix_web::cookie::time::Duration::seconds(TOKEN_MAX_AGE))
                    .path("/")
                    .finish();
                let _ = res.response_mut().add_cookie(&cookie);
            }

            Ok(res)
        })
    }
}
