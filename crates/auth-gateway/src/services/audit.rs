//! Append-only audit log
//!
//! Every challenge issuance, verification attempt, session mint, refresh,
//! revocation and rate-limit violation produces exactly one event. Events
//! are held in a bounded in-process ring, mirrored as structured tracing
//! output, and counted through the metrics recorder. Reads are indexed by
//! wallet and by time.

use shared::models::{AuthEvent, AuthEventType};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::info;

/// Default ring capacity
const DEFAULT_CAPACITY: usize = 10_000;

/// A not-yet-appended audit event
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub wallet_address: String,
    pub event_type: AuthEventType,
    pub challenge_id: Option<String>,
    pub assertion_id: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl EventDraft {
    pub fn new(event_type: AuthEventType, wallet_address: &str, success: bool) -> Self {
        Self {
            wallet_address: wallet_address.to_string(),
            event_type,
            challenge_id: None,
            assertion_id: None,
            success,
            error: None,
            ip_address: None,
            user_agent: None,
        }
    }

    pub fn challenge(mut self, challenge_id: &str) -> Self {
        self.challenge_id = Some(challenge_id.to_string());
        self
    }

    pub fn assertion(mut self, assertion_id: &str) -> Self {
        self.assertion_id = Some(assertion_id.to_string());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn client(mut self, ip: Option<&str>, user_agent: Option<&str>) -> Self {
        self.ip_address = ip.map(str::to_string);
        self.user_agent = user_agent.map(str::to_string);
        self
    }
}

/// Bounded, append-only audit log
pub struct AuditLog {
    events: RwLock<VecDeque<AuthEvent>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Append one event. Returns the assigned event id.
    pub fn record(&self, draft: EventDraft) -> u64 {
        let event_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let event = AuthEvent {
            event_id,
            wallet_address: draft.wallet_address,
            event_type: draft.event_type,
            challenge_id: draft.challenge_id,
            assertion_id: draft.assertion_id,
            success: draft.success,
            error: draft.error,
            ip_address: draft.ip_address,
            user_agent: draft.user_agent,
            created_at: chrono::Utc::now().timestamp(),
        };

        info!(
            event_id = event.event_id,
            event_type = event.event_type.as_str(),
            wallet = %event.wallet_address,
            success = event.success,
            ip = event.ip_address.as_deref().unwrap_or("-"),
            "auth event"
        );
        metrics::counter!(
            "wcsap_auth_events_total",
            "type" => event.event_type.as_str(),
            "success" => if event.success { "true" } else { "false" }
        )
        .increment(1);

        let mut events = self.events.write().expect("audit lock poisoned");
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
        event_id
    }

    /// Events for a wallet, newest first, case-insensitive match
    pub fn by_wallet(&self, wallet_address: &str, limit: usize) -> Vec<AuthEvent> {
        let wallet = wallet_address.to_lowercase();
        let events = self.events.read().expect("audit lock poisoned");
        events
            .iter()
            .rev()
            .filter(|e| e.wallet_address.to_lowercase() == wallet)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Events created at or after `since_unix`, newest first
    pub fn since(&self, since_unix: i64, limit: usize) -> Vec<AuthEvent> {
        let events = self.events.read().expect("audit lock poisoned");
        events
            .iter()
            .rev()
            .filter(|e| e.created_at >= since_unix)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Number of retained events
    pub fn len(&self) -> usize {
        self.events.read().expect("audit lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total events ever appended
    pub fn total_recorded(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - 1
    }

    /// Count successful and failed events of a given type (for stats)
    pub fn count_by_type(&self, event_type: AuthEventType) -> (u64, u64) {
        let events = self.events.read().expect("audit lock poisoned");
        let mut ok = 0;
        let mut failed = 0;
        for e in events.iter().filter(|e| e.event_type == event_type) {
            if e.success {
                ok += 1;
            } else {
                failed += 1;
            }
        }
        (ok, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WALLET: &str = "0x742d35Cc6634C0532925a3b844Bc9e7595f0bEb0";

    #[test]
    fn test_record_assigns_monotonic_ids() {
        let log = AuditLog::new(100);
        let a = log.record(EventDraft::new(AuthEventType::ChallengeIssued, WALLET, true));
        let b = log.record(EventDraft::new(AuthEventType::ChallengeVerified, WALLET, true));
        assert!(b > a);
        assert_eq!(log.len(), 2);
        assert_eq!(log.total_recorded(), 2);
    }

    #[test]
    fn test_by_wallet_is_case_insensitive_and_newest_first() {
        let log = AuditLog::new(100);
        log.record(EventDraft::new(AuthEventType::ChallengeIssued, WALLET, true));
        log.record(
            EventDraft::new(AuthEventType::AuthenticationFailed, WALLET, false)
                .error("signature mismatch"),
        );
        log.record(EventDraft::new(
            AuthEventType::ChallengeIssued,
            "0x0000000000000000000000000000000000000001",
            true,
        ));

        let events = log.by_wallet(&WALLET.to_lowercase(), 10);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, AuthEventType::AuthenticationFailed);
        assert_eq!(events[0].error.as_deref(), Some("signature mismatch"));
    }

    #[test]
    fn test_capacity_is_bounded() {
        let log = AuditLog::new(3);
        for _ in 0..10 {
            log.record(EventDraft::new(AuthEventType::ChallengeIssued, WALLET, true));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.total_recorded(), 10);
    }

    #[test]
    fn test_count_by_type_splits_success_and_failure() {
        let log = AuditLog::new(100);
        log.record(EventDraft::new(AuthEventType::ChallengeVerified, WALLET, true));
        log.record(EventDraft::new(AuthEventType::AuthenticationFailed, WALLET, false));
        log.record(EventDraft::new(AuthEventType::AuthenticationFailed, WALLET, false));

        assert_eq!(log.count_by_type(AuthEventType::ChallengeVerified), (1, 0));
        assert_eq!(log.count_by_type(AuthEventType::AuthenticationFailed), (0, 2));
    }

    #[test]
    fn test_since_filters_by_time() {
        let log = AuditLog::new(100);
        log.record(EventDraft::new(AuthEventType::ChallengeIssued, WALLET, true));
        let now = chrono::Utc::now().timestamp();
        assert_eq!(log.since(now - 60, 10).len(), 1);
        assert_eq!(log.since(now + 60, 10).len(), 0);
    }

    #[test]
    fn test_draft_builder_populates_fields() {
        let log = AuditLog::new(10);
        log.record(
            EventDraft::new(AuthEventType::ChallengeVerified, WALLET, true)
                .challenge("c1")
                .assertion("a1")
                .client(Some("203.0.113.45"), Some("agent/1.0")),
        );
        let events = log.by_wallet(WALLET, 1);
        assert_eq!(events[0].challenge_id.as_deref(), Some("c1"));
        assert_eq!(events[0].assertion_id.as_deref(), Some("a1"));
        assert_eq!(events[0].ip_address.as_deref(), Some("203.0.113.45"));
    }
}
