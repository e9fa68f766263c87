//! Redis connectivity and key layout
//!
//! All distributed backends (session store, revocation cache, rate
//! limiter) share one `ConnectionManager` per URL. Keys use the
//! `w_csap:` prefix family below; TTLs are always set by the writer so
//! Redis enforces natural expiry.

use crate::error::{Error, Result};
use redis::aio::ConnectionManager;
use tracing::info;

/// Key prefix for encrypted session records
pub const PREFIX_SESSION: &str = "w_csap:session:";
/// Key prefix for encrypted challenge records
pub const PREFIX_CHALLENGE: &str = "w_csap:challenge:";
/// Key prefix for revocation markers
pub const PREFIX_REVOKED: &str = "w_csap:revoked:";
/// Key prefix for rate-limit windows (`{wallet}:{action}:{window}`)
pub const PREFIX_RATE_LIMIT: &str = "w_csap:ratelimit:";
/// Key prefix for lockout markers
pub const PREFIX_LOCKOUT: &str = "w_csap:lockout:";
/// Key prefix for violation counters
pub const PREFIX_VIOLATION: &str = "w_csap:violation:";

/// Create a Redis connection manager with automatic reconnection
pub async fn create_client(url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(url)
        .map_err(|e| Error::store(format!("Invalid Redis URL: {}", e)))?;

    let manager = ConnectionManager::new(client)
        .await
        .map_err(|e| Error::store(format!("Failed to connect to Redis: {}", e)))?;

    info!(url = url, "Redis connection manager initialized");

    Ok(manager)
}
