//! Shared library for the W-CSAP authentication service
//!
//! This crate provides the functionality both the gateway and any future
//! sibling services need:
//! - Configuration management with strict startup validation
//! - The protocol error taxonomy and stable wire error codes
//! - The core data model (challenges, session assertions, audit events)
//! - Redis connectivity and the persisted key layout
//! - Logging infrastructure

pub mod config;
pub mod error;
pub mod models;
pub mod redis;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result, WcsapErrorCode};

/// Initialize tracing subscriber for structured logging
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shared=debug,auth_gateway=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
