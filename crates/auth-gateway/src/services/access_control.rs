//! Scope, audience and step-up enforcement
//!
//! Scopes are space-separated strings in `resource:action` or plain
//! `action` form. Validation rules, in order: direct match, parent
//! scope implies children, `resource:*` wildcard, `admin` implies all.
//!
//! Operations are classified by risk; high and critical operations
//! require step-up (re-authentication), optionally with a grace window
//! so a burst of sensitive operations needs only one re-sign. Critical
//! operations require a hardware wallet and get no grace at all.

use dashmap::DashMap;
use tracing::{debug, warn};

/// Operation risk classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationRisk {
    Low,
    Medium,
    High,
    Critical,
}

impl OperationRisk {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationRisk::Low => "low",
            OperationRisk::Medium => "medium",
            OperationRisk::High => "high",
            OperationRisk::Critical => "critical",
        }
    }
}

/// Accepted step-up methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepUpMethod {
    WalletSignature,
    HardwareWallet,
    Biometric,
    Passkey,
}

/// Step-up requirements for one operation
#[derive(Debug, Clone)]
pub struct OperationClassification {
    pub operation: String,
    pub risk: OperationRisk,
    pub requires_step_up: bool,
    pub allowed_methods: Vec<StepUpMethod>,
    pub grace_period_seconds: u64,
    /// 1 = basic session, 2 = step-up, 3 = hardware wallet
    pub min_auth_level: u8,
    pub requires_hardware_wallet: bool,
}

impl OperationClassification {
    fn new(operation: &str, risk: OperationRisk) -> Self {
        Self {
            operation: operation.to_string(),
            risk,
            requires_step_up: false,
            allowed_methods: Vec::new(),
            grace_period_seconds: 300,
            min_auth_level: 1,
            requires_hardware_wallet: false,
        }
    }
}

// ==================== Scope validation ====================

/// Check whether a token's scope string grants the required scope
pub fn scope_grants(token_scopes: &str, required_scope: &str) -> bool {
    let granted: Vec<&str> = token_scopes.split_whitespace().collect();

    // Direct match
    if granted.contains(&required_scope) {
        return true;
    }

    if let Some((resource, _)) = required_scope.split_once(':') {
        // Parent scope implies any child ("gigs" grants "gigs:read")
        if granted.contains(&resource) {
            debug!(parent = resource, required = required_scope, "Parent scope grants access");
            return true;
        }
        // Wildcard ("gigs:*" grants any gigs action)
        let wildcard = format!("{}:*", resource);
        if granted.contains(&wildcard.as_str()) {
            return true;
        }
    }

    // Admin grants everything
    if granted.contains(&"admin") {
        return true;
    }

    warn!(
        required = required_scope,
        granted = token_scopes,
        "Scope validation failed"
    );
    false
}

/// Check that any of the required scopes is granted
pub fn any_scope_grants(token_scopes: &str, required: &[&str]) -> bool {
    required.iter().any(|r| scope_grants(token_scopes, r))
}

// ==================== Audience validation ====================

/// Validate a token audience (string or list form) against the service
/// identifier
pub fn audience_allows(token_audience: &serde_json::Value, expected: &str) -> bool {
    match token_audience {
        serde_json::Value::String(aud) => aud == expected,
        serde_json::Value::Array(auds) => auds
            .iter()
            .any(|a| a.as_str().map(|s| s == expected).unwrap_or(false)),
        _ => false,
    }
}

// ==================== Operation classification ====================

/// Classifies operations and derives step-up requirements.
///
/// Override order: configuration table, then transaction value, then
/// risk score.
pub struct OperationClassifier;

impl OperationClassifier {
    fn base(operation: &str) -> OperationClassification {
        match operation {
            // Low risk: reads
            "profile:read" | "gigs:read" => {
                OperationClassification::new(operation, OperationRisk::Low)
            }

            // Medium risk: writes
            "gigs:create" => {
                let mut c = OperationClassification::new(operation, OperationRisk::Medium);
                c.grace_period_seconds = 1_800;
                c
            }
            "profile:update" => OperationClassification::new(operation, OperationRisk::Medium),

            // High risk: financial operations
            "contract:execute" => {
                let mut c = OperationClassification::new(operation, OperationRisk::High);
                c.requires_step_up = true;
                c.allowed_methods =
                    vec![StepUpMethod::WalletSignature, StepUpMethod::HardwareWallet];
                c.min_auth_level = 2;
                c
            }
            "withdrawal" => {
                let mut c = OperationClassification::new(operation, OperationRisk::High);
                c.requires_step_up = true;
                c.allowed_methods =
                    vec![StepUpMethod::WalletSignature, StepUpMethod::HardwareWallet];
                c.grace_period_seconds = 0;
                c.min_auth_level = 2;
                c
            }

            // Critical: account-destructive operations, hardware only
            "admin:user_delete" | "recovery:initiate" => {
                let mut c = OperationClassification::new(operation, OperationRisk::Critical);
                c.requires_step_up = true;
                c.allowed_methods = vec![StepUpMethod::HardwareWallet];
                c.grace_period_seconds = 0;
                c.min_auth_level = 3;
                c.requires_hardware_wallet = true;
                c
            }

            // Unknown operations default to medium with wallet step-up
            // available
            _ => {
                let mut c = OperationClassification::new(operation, OperationRisk::Medium);
                c.allowed_methods = vec![StepUpMethod::WalletSignature];
                c
            }
        }
    }

    /// Classify an operation given its optional transaction value (USD)
    /// and the caller's risk score (0-100)
    pub fn classify(
        operation: &str,
        value: Option<f64>,
        risk_score: Option<u8>,
    ) -> OperationClassification {
        let mut classification = Self::base(operation);

        if let Some(value) = value {
            if value > 100_000.0 {
                classification.risk = OperationRisk::Critical;
                classification.requires_step_up = true;
                classification.requires_hardware_wallet = true;
                classification.min_auth_level = 3;
            } else if value > 10_000.0 {
                classification.risk = classification.risk.max(OperationRisk::High);
                classification.requires_step_up = true;
                classification.min_auth_level = classification.min_auth_level.max(2);
            }
        }

        if let Some(score) = risk_score {
            if score > 70 {
                classification.requires_step_up = true;
                classification.grace_period_seconds = 0;
            } else if score > 50 {
                classification.requires_step_up = true;
            }
        }

        classification
    }
}

// ==================== Step-up grace tracking ====================

/// A completed step-up, valid for its grace window
#[derive(Debug, Clone)]
pub struct StepUpGrant {
    pub session_id: String,
    pub wallet_address: String,
    pub method: StepUpMethod,
    pub operation: String,
    pub completed_at: i64,
    pub expires_at: i64,
}

/// Step-up authentication required to proceed. The HTTP layer turns
/// this into 403 with the `X-Step-Up-*` headers.
#[derive(Debug, Clone)]
pub struct StepUpRequired {
    pub operation: String,
    pub risk: OperationRisk,
    pub allowed_methods: Vec<StepUpMethod>,
}

/// Tracks completed step-ups per wallet for grace-period bypass
#[derive(Default)]
pub struct StepUpManager {
    grants: DashMap<String, Vec<StepUpGrant>>,
}

impl StepUpManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed step-up. With a zero grace period nothing is
    /// retained; the step-up authorizes only the request that carried it.
    pub fn register_completion(
        &self,
        wallet_address: &str,
        operation: &str,
        method: StepUpMethod,
        grace_period_seconds: u64,
    ) -> StepUpGrant {
        let now = chrono::Utc::now().timestamp();
        let grant = StepUpGrant {
            session_id: crate::services::challenge::generate_nonce(),
            wallet_address: wallet_address.to_string(),
            method,
            operation: operation.to_string(),
            completed_at: now,
            expires_at: now + grace_period_seconds as i64,
        };

        if grace_period_seconds > 0 {
            self.grants
                .entry(wallet_address.to_lowercase())
                .or_default()
                .push(grant.clone());
        }

        debug!(
            wallet = %wallet_address,
            operation = operation,
            grace = grace_period_seconds,
            "Step-up completion registered"
        );
        grant
    }

    /// Check whether a live grant covers the operation. A grant for
    /// `admin` covers anything.
    pub fn has_recent(&self, wallet_address: &str, operation: &str) -> bool {
        let now = chrono::Utc::now().timestamp();
        self.grants
            .get(&wallet_address.to_lowercase())
            .map(|grants| {
                grants.iter().any(|g| {
                    now < g.expires_at
                        && (g.operation == operation || g.operation == "admin")
                })
            })
            .unwrap_or(false)
    }

    /// Gate an operation: `Ok` when no step-up is needed or a grace
    /// grant covers it, otherwise the requirement to satisfy
    pub fn enforce(
        &self,
        wallet_address: &str,
        classification: &OperationClassification,
    ) -> Result<(), StepUpRequired> {
        if !classification.requires_step_up {
            return Ok(());
        }

        if classification.grace_period_seconds > 0
            && self.has_recent(wallet_address, &classification.operation)
        {
            return Ok(());
        }

        metrics::counter!(
            "wcsap_step_up_required_total",
            "risk" => classification.risk.as_str()
        )
        .increment(1);
        tracing::info!(
            wallet = %wallet_address,
            operation = %classification.operation,
            risk = classification.risk.as_str(),
            "Step-up required"
        );

        Err(StepUpRequired {
            operation: classification.operation.clone(),
            risk: classification.risk,
            allowed_methods: classification.allowed_methods.clone(),
        })
    }

    /// Drop expired grants
    pub fn cleanup_expired(&self) -> usize {
        let now = chrono::Utc::now().timestamp();
        let mut removed = 0;

        self.grants.retain(|_, grants| {
            let before = grants.len();
            grants.retain(|g| now < g.expires_at);
            removed += before - grants.len();
            !grants.is_empty()
        });

        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WALLET: &str = "0x742d35Cc6634C0532925a3b844Bc9e7595f0bEb0";

    // ========================================================================
    // Scope validation
    // ========================================================================

    #[test]
    fn test_direct_scope_match() {
        assert!(scope_grants("profile gigs:read", "gigs:read"));
        assert!(!scope_grants("profile", "gigs:read"));
    }

    #[test]
    fn test_parent_scope_implies_children() {
        assert!(scope_grants("gigs", "gigs:read"));
        assert!(scope_grants("gigs", "gigs:write"));
        assert!(!scope_grants("gigs", "contracts:read"));
    }

    #[test]
    fn test_wildcard_scope() {
        assert!(scope_grants("gigs:*", "gigs:read"));
        assert!(scope_grants("gigs:*", "gigs:delete"));
        assert!(!scope_grants("gigs:*", "contracts:read"));
    }

    #[test]
    fn test_admin_grants_everything() {
        assert!(scope_grants("admin", "gigs:read"));
        assert!(scope_grants("admin", "contracts:write"));
        assert!(scope_grants("admin", "anything:at-all"));
    }

    #[test]
    fn test_empty_scopes_deny() {
        assert!(!scope_grants("", "gigs:read"));
        assert!(!scope_grants("", "read"));
    }

    #[test]
    fn test_any_scope_grants() {
        assert!(any_scope_grants("profile", &["gigs:read", "profile"]));
        assert!(!any_scope_grants("profile", &["gigs:read", "contracts:read"]));
    }

    // ========================================================================
    // Audience validation
    // ========================================================================

    #[test]
    fn test_audience_string_form() {
        let aud = serde_json::json!("https://api.wcsap.local");
        assert!(audience_allows(&aud, "https://api.wcsap.local"));
        assert!(!audience_allows(&aud, "https://other.wcsap.local"));
    }

    #[test]
    fn test_audience_list_form() {
        let aud = serde_json::json!(["https://api.wcsap.local", "https://admin.wcsap.local"]);
        assert!(audience_allows(&aud, "https://admin.wcsap.local"));
        assert!(!audience_allows(&aud, "https://other.wcsap.local"));
    }

    #[test]
    fn test_audience_other_types_deny() {
        assert!(!audience_allows(&serde_json::json!(42), "x"));
        assert!(!audience_allows(&serde_json::json!(null), "x"));
    }

    // ========================================================================
    // Classification
    // ========================================================================

    #[test]
    fn test_read_operations_are_low_risk() {
        let c = OperationClassifier::classify("profile:read", None, None);
        assert_eq!(c.risk, OperationRisk::Low);
        assert!(!c.requires_step_up);
    }

    #[test]
    fn test_withdrawal_requires_step_up_without_grace() {
        let c = OperationClassifier::classify("withdrawal", None, None);
        assert_eq!(c.risk, OperationRisk::High);
        assert!(c.requires_step_up);
        assert_eq!(c.grace_period_seconds, 0);
    }

    #[test]
    fn test_critical_operations_require_hardware() {
        for op in ["admin:user_delete", "recovery:initiate"] {
            let c = OperationClassifier::classify(op, None, None);
            assert_eq!(c.risk, OperationRisk::Critical);
            assert!(c.requires_hardware_wallet);
            assert_eq!(c.allowed_methods, vec![StepUpMethod::HardwareWallet]);
            assert_eq!(c.min_auth_level, 3);
        }
    }

    #[test]
    fn test_value_over_10k_escalates_to_high() {
        let c = OperationClassifier::classify("gigs:create", Some(15_000.0), None);
        assert_eq!(c.risk, OperationRisk::High);
        assert!(c.requires_step_up);
    }

    #[test]
    fn test_value_over_100k_escalates_to_critical() {
        let c = OperationClassifier::classify("gigs:create", Some(250_000.0), None);
        assert_eq!(c.risk, OperationRisk::Critical);
        assert!(c.requires_hardware_wallet);
    }

    #[test]
    fn test_high_risk_score_zeroes_grace() {
        let c = OperationClassifier::classify("profile:update", None, Some(80));
        assert!(c.requires_step_up);
        assert_eq!(c.grace_period_seconds, 0);
    }

    #[test]
    fn test_moderate_risk_score_requires_step_up() {
        let c = OperationClassifier::classify("profile:update", None, Some(60));
        assert!(c.requires_step_up);
        assert!(c.grace_period_seconds > 0);
    }

    #[test]
    fn test_unknown_operation_defaults_to_medium() {
        let c = OperationClassifier::classify("custom:thing", None, None);
        assert_eq!(c.risk, OperationRisk::Medium);
        assert!(!c.requires_step_up);
    }

    // ========================================================================
    // Step-up grace tracking
    // ========================================================================

    #[test]
    fn test_enforce_passes_low_risk() {
        let manager = StepUpManager::new();
        let c = OperationClassifier::classify("profile:read", None, None);
        assert!(manager.enforce(WALLET, &c).is_ok());
    }

    #[test]
    fn test_enforce_requires_step_up_then_grace_covers() {
        let manager = StepUpManager::new();
        let c = OperationClassifier::classify("contract:execute", None, None);

        let required = manager.enforce(WALLET, &c).unwrap_err();
        assert_eq!(required.operation, "contract:execute");
        assert_eq!(required.risk, OperationRisk::High);

        manager.register_completion(
            WALLET,
            "contract:execute",
            StepUpMethod::WalletSignature,
            c.grace_period_seconds,
        );
        assert!(manager.enforce(WALLET, &c).is_ok());
    }

    #[test]
    fn test_zero_grace_never_covers() {
        let manager = StepUpManager::new();
        let c = OperationClassifier::classify("withdrawal", None, None);

        manager.register_completion(WALLET, "withdrawal", StepUpMethod::HardwareWallet, 0);
        // Grace period is zero: the next attempt still requires step-up
        assert!(manager.enforce(WALLET, &c).is_err());
    }

    #[test]
    fn test_grant_is_operation_scoped() {
        let manager = StepUpManager::new();
        manager.register_completion(WALLET, "contract:execute", StepUpMethod::WalletSignature, 300);

        assert!(manager.has_recent(WALLET, "contract:execute"));
        assert!(!manager.has_recent(WALLET, "withdrawal"));
    }

    #[test]
    fn test_admin_grant_covers_all() {
        let manager = StepUpManager::new();
        manager.register_completion(WALLET, "admin", StepUpMethod::HardwareWallet, 300);
        assert!(manager.has_recent(WALLET, "contract:execute"));
    }

    #[test]
    fn test_wallet_lookup_case_insensitive() {
        let manager = StepUpManager::new();
        manager.register_completion(WALLET, "contract:execute", StepUpMethod::WalletSignature, 300);
        assert!(manager.has_recent(&WALLET.to_lowercase(), "contract:execute"));
    }

    #[test]
    fn test_cleanup_expired_grants() {
        let manager = StepUpManager::new();
        manager.register_completion(WALLET, "contract:execute", StepUpMethod::WalletSignature, 300);

        // Expire the grant in place
        if let Some(mut grants) = manager.grants.get_mut(&WALLET.to_lowercase()) {
            grants[0].expires_at = chrono::Utc::now().timestamp() - 1;
        }

        assert_eq!(manager.cleanup_expired(), 1);
        assert!(!manager.has_recent(WALLET, "contract:execute"));
    }
}
