//! Explicit dependency container
//!
//! Every service is constructed once at startup from configuration and
//! shared through `web::Data<AppState>`. There are no globals; tests
//! assemble the same container around in-memory backends.

use crate::services::access_control::StepUpManager;
use crate::services::audit::AuditLog;
use crate::services::authenticator::Authenticator;
use crate::services::challenge::ChallengeGenerator;
use crate::services::dpop::DpopValidator;
use crate::services::ip_rate_limiter::IpRateLimiter;
use crate::services::jwt_tokens::JwtTokenManager;
use crate::services::proof_of_work::PowGate;
use crate::services::rate_limiter::{
    MemoryRateLimitBackend, RateLimitBackend, RedisRateLimitBackend, WalletRateLimiter,
};
use crate::services::revocation::RevocationCache;
use crate::services::session_store::{
    MemoryStoreBackend, RedisStoreBackend, SessionStore, StoreBackend,
};
use crate::services::tokens::TokenManager;
use metrics_exporter_prometheus::PrometheusHandle;
use shared::config::{Config, RevocationCacheKind, StoreBackendKind};
use shared::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub authenticator: Arc<Authenticator>,
    pub store: Arc<SessionStore>,
    pub revocation: Arc<RevocationCache>,
    pub rate_limiter: Arc<WalletRateLimiter>,
    pub ip_limiter: IpRateLimiter,
    pub dpop: Option<Arc<DpopValidator>>,
    pub jwt: Option<Arc<JwtTokenManager>>,
    pub pow: Arc<PowGate>,
    pub step_up: Arc<StepUpManager>,
    pub audit: Arc<AuditLog>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Assemble the full service graph from configuration. Fatal on any
    /// misconfiguration (short secret, missing JWT keys, unreachable
    /// Redis for a redis-backed store).
    pub async fn from_config(config: Config, metrics: Option<PrometheusHandle>) -> Result<Self> {
        let audit = Arc::new(AuditLog::default());

        let revocation = Arc::new(match config.protocol.revocation_cache_type {
            RevocationCacheKind::Memory => RevocationCache::in_memory(),
            RevocationCacheKind::Distributed => {
                let conn = shared::redis::create_client(&config.protocol.revocation_cache_url)
                    .await?;
                RevocationCache::distributed(conn)
            }
        });

        let store_timeout = Duration::from_secs(config.store.store_timeout_seconds);
        let store_backend: Arc<dyn StoreBackend> = match config.store.backend {
            StoreBackendKind::Memory => Arc::new(MemoryStoreBackend::new()),
            StoreBackendKind::Redis => {
                let conn = shared::redis::create_client(&config.store.redis_url).await?;
                Arc::new(RedisStoreBackend::new(conn, store_timeout))
            }
        };

        let store = Arc::new(SessionStore::new(
            store_backend,
            &config.protocol.secret_key,
            revocation.clone(),
            audit.clone(),
            config.protocol.refresh_ttl,
        )?);

        let tokens = Arc::new(TokenManager::new(&config.protocol.secret_key)?);

        let jwt = if config.tokens.use_jwt_tokens {
            Some(Arc::new(JwtTokenManager::new(
                &config.tokens,
                config.protocol.session_ttl,
            )?))
        } else {
            None
        };

        let rate_limit_timeout = Duration::from_secs(config.store.rate_limit_timeout_seconds);
        let rate_backend: Arc<dyn RateLimitBackend> = match config.store.backend {
            StoreBackendKind::Memory => Arc::new(MemoryRateLimitBackend::new()),
            StoreBackendKind::Redis => {
                let conn = shared::redis::create_client(&config.store.redis_url).await?;
                Arc::new(RedisRateLimitBackend::new(conn, rate_limit_timeout))
            }
        };
        let rate_limiter = Arc::new(WalletRateLimiter::new(
            rate_backend,
            config.rate_limit.clone(),
            audit.clone(),
        ));

        let dpop = if config.dpop.enabled {
            Some(Arc::new(DpopValidator::new(
                config.dpop.clock_skew_seconds,
                config.dpop.nonce_cache_ttl,
            )))
        } else {
            None
        };

        let authenticator = Arc::new(Authenticator::new(
            ChallengeGenerator::new(
                config.protocol.challenge_ttl,
                &config.protocol.app_name,
                &config.protocol.protocol_version,
            ),
            store.clone(),
            tokens,
            jwt.clone(),
            revocation.clone(),
            audit.clone(),
            config.protocol.session_ttl,
            config.protocol.refresh_ttl,
            config.protocol.max_active_sessions_per_wallet,
            &config.protocol.protocol_version,
        ));

        let pow = Arc::new(PowGate::new(&config.pow));
        let step_up = Arc::new(StepUpManager::new());
        let ip_limiter = IpRateLimiter::new();

        info!(
            store = ?config.store.backend,
            revocation = ?config.protocol.revocation_cache_type,
            jwt = config.tokens.use_jwt_tokens,
            dpop = config.dpop.enabled,
            pow = config.pow.enabled,
            "Authentication core assembled"
        );

        Ok(Self {
            config,
            authenticator,
            store,
            revocation,
            rate_limiter,
            ip_limiter,
            dpop,
            jwt,
            pow,
            step_up,
            audit,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::config::test_config;

    #[tokio::test]
    async fn test_from_config_memory_backends() {
        let config = test_config(&"a".repeat(32));
        let state = AppState::from_config(config, None).await.unwrap();

        assert!(state.jwt.is_none());
        assert!(state.dpop.is_none());
        let health = state.store.health().await;
        assert!(health.ok);
        assert_eq!(health.backend, "memory");
    }

    #[tokio::test]
    async fn test_from_config_rejects_short_secret() {
        let config = test_config("short");
        assert!(AppState::from_config(config, None).await.is_err());
    }
}
