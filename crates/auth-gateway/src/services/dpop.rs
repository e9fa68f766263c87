//! DPoP proof validation (RFC 9449)
//!
//! Binds access tokens to the client's key: the token carries the key's
//! JWK thumbprint in `cnf.jkt`, and every request must present a proof
//! JWT signed by that key, bound to the HTTP method, the request URL
//! and (when attached) the access token hash. A stolen token is useless
//! without the private key.
//!
//! Proofs are transient; only their `jti` values are remembered, inside
//! the replay window.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Proof header `typ` value required by RFC 9449
pub const DPOP_JWT_TYP: &str = "dpop+jwt";

/// Algorithms accepted for proofs. `ES256K` covers Ethereum wallet keys.
const ALLOWED_ALGS: [&str; 3] = ["ES256K", "ES256", "EdDSA"];

/// Rejection with a DPoP-specific reason. Mapped by the HTTP layer to
/// 401 with `WWW-Authenticate: DPoP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpopRejection(pub String);

impl std::fmt::Display for DpopRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn reject(msg: impl Into<String>) -> DpopRejection {
    DpopRejection(msg.into())
}

/// Public key embedded in the proof header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpopJwk {
    pub kty: String,
    #[serde(default)]
    pub crv: String,
    pub x: String,
    #[serde(default)]
    pub y: Option<String>,
}

impl DpopJwk {
    /// JWK thumbprint per RFC 7638: SHA-256 over the canonical JSON of
    /// the required members, keys in lexicographic order, no whitespace
    pub fn thumbprint(&self) -> String {
        let canonical = format!(
            r#"{{"crv":"{}","kty":"{}","x":"{}","y":"{}"}}"#,
            self.crv,
            self.kty,
            self.x,
            self.y.as_deref().unwrap_or(""),
        );
        URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }
}

#[derive(Debug, Deserialize)]
struct ProofHeader {
    #[serde(default)]
    typ: String,
    #[serde(default)]
    alg: String,
    jwk: Option<DpopJwk>,
}

#[derive(Debug, Deserialize)]
struct ProofPayload {
    #[serde(default)]
    jti: String,
    #[serde(default)]
    htm: String,
    #[serde(default)]
    htu: String,
    #[serde(default)]
    iat: i64,
    #[serde(default)]
    ath: Option<String>,
}

/// A validated proof
#[derive(Debug, Clone)]
pub struct DpopProof {
    pub alg: String,
    pub jwk: DpopJwk,
    pub jkt: String,
    pub jti: String,
    pub htm: String,
    pub htu: String,
    pub iat: i64,
    pub ath: Option<String>,
}

/// Validates DPoP proofs and enforces JTI uniqueness within the replay
/// window
pub struct DpopValidator {
    clock_skew_seconds: i64,
    replay_window_seconds: i64,
    used_jtis: DashMap<String, i64>,
}

impl DpopValidator {
    pub fn new(clock_skew_seconds: i64, replay_window_seconds: i64) -> Self {
        Self {
            clock_skew_seconds,
            replay_window_seconds,
            used_jtis: DashMap::new(),
        }
    }

    /// Validate a proof for one request. `expected_jkt` comes from the
    /// access token's `cnf.jkt` claim when present.
    pub fn validate(
        &self,
        dpop_header: &str,
        http_method: &str,
        http_uri: &str,
        access_token: Option<&str>,
        expected_jkt: Option<&str>,
    ) -> Result<DpopProof, DpopRejection> {
        let (header, payload) = parse_proof(dpop_header)?;

        if header.typ != DPOP_JWT_TYP {
            return Err(reject(format!(
                "Invalid typ: expected '{}', got '{}'",
                DPOP_JWT_TYP, header.typ
            )));
        }

        if !ALLOWED_ALGS.contains(&header.alg.as_str()) {
            return Err(reject(format!("Unsupported algorithm: {}", header.alg)));
        }

        let jwk = header
            .jwk
            .ok_or_else(|| reject("Missing JWK in proof header"))?;
        if jwk.x.is_empty() {
            return Err(reject("Missing JWK in proof header"));
        }

        let jkt = jwk.thumbprint();
        if let Some(expected) = expected_jkt {
            if jkt != expected {
                warn!(
                    expected = %&expected[..expected.len().min(16)],
                    got = %&jkt[..16],
                    "DPoP JKT mismatch"
                );
                return Err(reject("JWK thumbprint mismatch"));
            }
        }

        let now = chrono::Utc::now().timestamp();
        if (now - payload.iat).abs() > self.clock_skew_seconds {
            return Err(reject(format!(
                "Timestamp outside allowed skew ({}s)",
                self.clock_skew_seconds
            )));
        }

        if payload.htm.to_uppercase() != http_method.to_uppercase() {
            return Err(reject(format!(
                "HTTP method mismatch: expected {}, got {}",
                http_method, payload.htm
            )));
        }

        if strip_query(&payload.htu) != strip_query(http_uri) {
            return Err(reject("HTTP URI mismatch"));
        }

        if let Some(token) = access_token {
            let expected_ath = compute_ath(token);
            if payload.ath.as_deref() != Some(expected_ath.as_str()) {
                return Err(reject("Access token hash (ath) mismatch"));
            }
        }

        if payload.jti.is_empty() {
            return Err(reject("Missing jti"));
        }

        // JTI uniqueness: concurrent proofs with the same jti race on
        // the map entry; at most one inserts
        let expiry = now + self.replay_window_seconds;
        let replayed = {
            let mut fresh = false;
            let mut entry = self.used_jtis.entry(payload.jti.clone()).or_insert_with(|| {
                fresh = true;
                expiry
            });
            if !fresh && now >= *entry {
                // Window for the old use has passed; re-arm for this one
                *entry = expiry;
                fresh = true;
            }
            !fresh && now < *entry
        };
        if replayed {
            return Err(reject("DPoP proof replay detected (jti already used)"));
        }

        verify_proof_signature(dpop_header, &header.alg, &jwk)?;

        self.cleanup_expired();

        debug!(
            method = %http_method,
            jkt = %&jkt[..16],
            "DPoP proof valid"
        );

        Ok(DpopProof {
            alg: header.alg,
            jkt,
            jwk,
            jti: payload.jti,
            htm: payload.htm,
            htu: payload.htu,
            iat: payload.iat,
            ath: payload.ath,
        })
    }

    /// Drop expired JTI entries. Runs opportunistically after each
    /// successful validation and from the background sweep.
    pub fn cleanup_expired(&self) -> usize {
        let now = chrono::Utc::now().timestamp();
        let before = self.used_jtis.len();
        self.used_jtis.retain(|_, expiry| now < *expiry);
        before - self.used_jtis.len()
    }

    /// Number of JTIs currently tracked
    pub fn tracked_jtis(&self) -> usize {
        self.used_jtis.len()
    }
}

/// `ath` value binding a proof to an access token:
/// base64url(SHA-256(token))
pub fn compute_ath(access_token: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(access_token.as_bytes()))
}

fn strip_query(uri: &str) -> &str {
    let uri = uri.split('?').next().unwrap_or(uri);
    uri.split('#').next().unwrap_or(uri)
}

fn parse_proof(jwt: &str) -> Result<(ProofHeader, ProofPayload), DpopRejection> {
    let parts: Vec<&str> = jwt.split('.').collect();
    if parts.len() != 3 {
        return Err(reject("Invalid DPoP JWT format"));
    }

    let header_bytes = URL_SAFE_NO_PAD
        .decode(parts[0])
        .map_err(|_| reject("Invalid DPoP JWT format"))?;
    let payload_bytes = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|_| reject("Invalid DPoP JWT format"))?;

    let header: ProofHeader =
        serde_json::from_slice(&header_bytes).map_err(|_| reject("Invalid DPoP JWT format"))?;
    let payload: ProofPayload =
        serde_json::from_slice(&payload_bytes).map_err(|_| reject("Invalid DPoP JWT format"))?;

    Ok((header, payload))
}

/// Verify the proof signature with the embedded JWK.
///
/// `ES256K` (secp256k1, Ethereum wallet keys) is verified directly;
/// `ES256`/`EdDSA` go through the JWT library with a decoding key built
/// from the JWK coordinates.
fn verify_proof_signature(
    jwt: &str,
    alg: &str,
    jwk: &DpopJwk,
) -> Result<(), DpopRejection> {
    match alg {
        "ES256K" => verify_es256k(jwt, jwk),
        "ES256" => {
            let y = jwk
                .y
                .as_deref()
                .ok_or_else(|| reject("ES256 JWK missing y coordinate"))?;
            let key = DecodingKey::from_ec_components(&jwk.x, y)
                .map_err(|_| reject("Invalid JWK coordinates"))?;
            verify_with_jwt_library(jwt, Algorithm::ES256, &key)
        }
        "EdDSA" => {
            let key = DecodingKey::from_ed_components(&jwk.x)
                .map_err(|_| reject("Invalid JWK coordinates"))?;
            verify_with_jwt_library(jwt, Algorithm::EdDSA, &key)
        }
        other => Err(reject(format!("Unsupported algorithm: {}", other))),
    }
}

fn verify_with_jwt_library(
    jwt: &str,
    alg: Algorithm,
    key: &DecodingKey,
) -> Result<(), DpopRejection> {
    let mut validation = Validation::new(alg);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    jsonwebtoken::decode::<serde_json::Value>(jwt, key, &validation)
        .map(|_| ())
        .map_err(|_| reject("Invalid DPoP signature"))
}

fn verify_es256k(jwt: &str, jwk: &DpopJwk) -> Result<(), DpopRejection> {
    use alloy::signers::k256::ecdsa::signature::Verifier;
    use alloy::signers::k256::ecdsa::{Signature, VerifyingKey};

    let bad_sig = || reject("Invalid DPoP signature");

    let x = URL_SAFE_NO_PAD.decode(&jwk.x).map_err(|_| bad_sig())?;
    let y = URL_SAFE_NO_PAD
        .decode(jwk.y.as_deref().unwrap_or(""))
        .map_err(|_| bad_sig())?;
    if x.len() != 32 || y.len() != 32 {
        return Err(bad_sig());
    }

    // Rebuild the uncompressed SEC1 point 0x04 || x || y
    let mut point = Vec::with_capacity(65);
    point.push(0x04);
    point.extend_from_slice(&x);
    point.extend_from_slice(&y);

    let verifying_key = VerifyingKey::from_sec1_bytes(&point).map_err(|_| bad_sig())?;

    let (signing_input, sig_b64) = jwt
        .rsplit_once('.')
        .ok_or_else(|| reject("Invalid DPoP JWT format"))?;
    let sig_bytes = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| bad_sig())?;
    let signature = Signature::from_slice(&sig_bytes).map_err(|_| bad_sig())?;

    // JWS ES256K signs SHA-256 of the signing input
    verifying_key
        .verify(signing_input.as_bytes(), &signature)
        .map_err(|_| bad_sig())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::signers::k256::ecdsa::signature::Signer;
    use alloy::signers::k256::ecdsa::{Signature, SigningKey};
    use rand::rngs::OsRng;

    fn validator() -> DpopValidator {
        DpopValidator::new(60, 300)
    }

    struct ProofBuilder {
        key: SigningKey,
        method: String,
        uri: String,
        iat: i64,
        jti: String,
        ath: Option<String>,
        typ: String,
        alg: String,
    }

    impl ProofBuilder {
        fn new(method: &str, uri: &str) -> Self {
            Self {
                key: SigningKey::random(&mut OsRng),
                method: method.to_string(),
                uri: uri.to_string(),
                iat: chrono::Utc::now().timestamp(),
                jti: hex::encode(rand::random::<[u8; 16]>()),
                ath: None,
                typ: DPOP_JWT_TYP.to_string(),
                alg: "ES256K".to_string(),
            }
        }

        fn jwk(&self) -> DpopJwk {
            let point = self.key.verifying_key().to_encoded_point(false);
            DpopJwk {
                kty: "EC".to_string(),
                crv: "secp256k1".to_string(),
                x: URL_SAFE_NO_PAD.encode(point.x().unwrap()),
                y: Some(URL_SAFE_NO_PAD.encode(point.y().unwrap())),
            }
        }

        fn build(&self) -> String {
            let jwk = self.jwk();
            let header = serde_json::json!({
                "typ": self.typ,
                "alg": self.alg,
                "jwk": {"kty": jwk.kty, "crv": jwk.crv, "x": jwk.x, "y": jwk.y},
            });
            let payload = serde_json::json!({
                "jti": self.jti,
                "htm": self.method,
                "htu": self.uri,
                "iat": self.iat,
                "ath": self.ath,
            });

            let signing_input = format!(
                "{}.{}",
                URL_SAFE_NO_PAD.encode(header.to_string()),
                URL_SAFE_NO_PAD.encode(payload.to_string())
            );
            let signature: Signature = self.key.sign(signing_input.as_bytes());
            format!(
                "{}.{}",
                signing_input,
                URL_SAFE_NO_PAD.encode(signature.to_bytes())
            )
        }
    }

    const URI: &str = "https://api.wcsap.local/auth/status";

    // ========================================================================
    // Happy path
    // ========================================================================

    #[test]
    fn test_valid_es256k_proof() {
        let builder = ProofBuilder::new("GET", URI);
        let proof = validator()
            .validate(&builder.build(), "GET", URI, None, None)
            .unwrap();

        assert_eq!(proof.alg, "ES256K");
        assert_eq!(proof.htm, "GET");
        assert_eq!(proof.jkt, builder.jwk().thumbprint());
    }

    #[test]
    fn test_htu_ignores_query_and_fragment() {
        let builder = ProofBuilder::new("GET", URI);
        let uri_with_query = format!("{}?page=2#anchor", URI);
        assert!(validator()
            .validate(&builder.build(), "GET", &uri_with_query, None, None)
            .is_ok());
    }

    #[test]
    fn test_expected_jkt_match() {
        let builder = ProofBuilder::new("GET", URI);
        let jkt = builder.jwk().thumbprint();
        assert!(validator()
            .validate(&builder.build(), "GET", URI, None, Some(&jkt))
            .is_ok());
    }

    #[test]
    fn test_ath_binding() {
        let token = "the-access-token";
        let mut builder = ProofBuilder::new("GET", URI);
        builder.ath = Some(compute_ath(token));

        assert!(validator()
            .validate(&builder.build(), "GET", URI, Some(token), None)
            .is_ok());
    }

    // ========================================================================
    // Rejections
    // ========================================================================

    #[test]
    fn test_wrong_typ_rejected() {
        let mut builder = ProofBuilder::new("GET", URI);
        builder.typ = "jwt".to_string();
        let err = validator()
            .validate(&builder.build(), "GET", URI, None, None)
            .unwrap_err();
        assert!(err.0.contains("typ"));
    }

    #[test]
    fn test_disallowed_alg_rejected() {
        let mut builder = ProofBuilder::new("GET", URI);
        builder.alg = "HS256".to_string();
        let err = validator()
            .validate(&builder.build(), "GET", URI, None, None)
            .unwrap_err();
        assert!(err.0.contains("algorithm"));
    }

    #[test]
    fn test_jkt_mismatch_rejected() {
        let builder = ProofBuilder::new("GET", URI);
        let err = validator()
            .validate(&builder.build(), "GET", URI, None, Some("other-thumbprint"))
            .unwrap_err();
        assert!(err.0.contains("thumbprint"));
    }

    #[test]
    fn test_stale_iat_rejected() {
        let mut builder = ProofBuilder::new("GET", URI);
        builder.iat -= 3600;
        let err = validator()
            .validate(&builder.build(), "GET", URI, None, None)
            .unwrap_err();
        assert!(err.0.contains("skew"));
    }

    #[test]
    fn test_htm_mismatch_rejected() {
        let builder = ProofBuilder::new("POST", URI);
        let err = validator()
            .validate(&builder.build(), "GET", URI, None, None)
            .unwrap_err();
        assert!(err.0.contains("method"));
    }

    #[test]
    fn test_htu_mismatch_rejected() {
        let builder = ProofBuilder::new("GET", "https://api.wcsap.local/other");
        let err = validator()
            .validate(&builder.build(), "GET", URI, None, None)
            .unwrap_err();
        assert!(err.0.contains("URI"));
    }

    #[test]
    fn test_ath_mismatch_rejected() {
        let mut builder = ProofBuilder::new("GET", URI);
        builder.ath = Some(compute_ath("some-other-token"));
        let err = validator()
            .validate(&builder.build(), "GET", URI, Some("the-access-token"), None)
            .unwrap_err();
        assert!(err.0.contains("ath"));
    }

    #[test]
    fn test_missing_ath_rejected_when_token_attached() {
        let builder = ProofBuilder::new("GET", URI);
        let err = validator()
            .validate(&builder.build(), "GET", URI, Some("token"), None)
            .unwrap_err();
        assert!(err.0.contains("ath"));
    }

    #[test]
    fn test_jti_replay_rejected() {
        let builder = ProofBuilder::new("GET", URI);
        let proof = builder.build();
        let v = validator();

        assert!(v.validate(&proof, "GET", URI, None, None).is_ok());
        let err = v.validate(&proof, "GET", URI, None, None).unwrap_err();
        assert!(err.0.contains("replay"));
        assert_eq!(v.tracked_jtis(), 1);
    }

    #[test]
    fn test_forged_signature_rejected() {
        let builder = ProofBuilder::new("GET", URI);
        let proof = builder.build();

        // Re-sign the payload with a different key but keep the JWK
        let (input, _) = proof.rsplit_once('.').unwrap();
        let other = SigningKey::random(&mut OsRng);
        let forged_sig: Signature = other.sign(input.as_bytes());
        let forged = format!("{}.{}", input, URL_SAFE_NO_PAD.encode(forged_sig.to_bytes()));

        let err = validator()
            .validate(&forged, "GET", URI, None, None)
            .unwrap_err();
        assert!(err.0.contains("signature"));
    }

    #[test]
    fn test_garbage_rejected() {
        let v = validator();
        assert!(v.validate("garbage", "GET", URI, None, None).is_err());
        assert!(v.validate("a.b", "GET", URI, None, None).is_err());
        assert!(v.validate("a.b.c", "GET", URI, None, None).is_err());
    }

    // ========================================================================
    // Thumbprint
    // ========================================================================

    #[test]
    fn test_thumbprint_is_deterministic_and_key_bound() {
        let a = ProofBuilder::new("GET", URI);
        let b = ProofBuilder::new("GET", URI);

        assert_eq!(a.jwk().thumbprint(), a.jwk().thumbprint());
        assert_ne!(a.jwk().thumbprint(), b.jwk().thumbprint());
    }

    #[test]
    fn test_cleanup_expired_jtis() {
        let v = DpopValidator::new(60, -1); // entries expire immediately
        let builder = ProofBuilder::new("GET", URI);
        let _ = v.validate(&builder.build(), "GET", URI, None, None);
        assert_eq!(v.tracked_jtis(), 0);
    }
}
