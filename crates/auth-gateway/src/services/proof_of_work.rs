//! Proof-of-work gate
//!
//! Requires clients to find a nonce such that
//! `SHA256(challenge || nonce)` has at least `difficulty` leading zero
//! bits before resource-intensive endpoints are served. Difficulty
//! adapts toward a target median solve time so legitimate clients stay
//! fast while floods get progressively more expensive.
//!
//! Challenges are single-use; unsolved ones expire.

use rand::RngCore;
use sha2::{Digest, Sha256};
use shared::config::PowConfig;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Solves sampled for difficulty adaptation
const ADAPTATION_SAMPLE: usize = 10;

/// Outcome statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct PowStats {
    pub total_issued: u64,
    pub total_solved: u64,
    pub total_failed: u64,
    pub success_rate: f64,
    pub active_challenges: usize,
    pub median_solve_seconds: f64,
    pub current_difficulty: u32,
}

struct PowState {
    /// challenge -> (issued_at, difficulty)
    active: HashMap<String, (i64, u32)>,
    /// (solved_at, solve_seconds) for recent successes
    recent_solves: VecDeque<(i64, f64)>,
    total_issued: u64,
    total_solved: u64,
    total_failed: u64,
}

/// Adaptive-difficulty proof-of-work gate
pub struct PowGate {
    base_difficulty: u32,
    min_difficulty: u32,
    max_difficulty: u32,
    target_solve_seconds: f64,
    challenge_ttl: i64,
    state: Mutex<PowState>,
}

impl PowGate {
    pub fn new(config: &PowConfig) -> Self {
        info!(
            base = config.base_difficulty,
            min = config.min_difficulty,
            max = config.max_difficulty,
            "Proof-of-work gate initialized"
        );

        Self {
            base_difficulty: config.base_difficulty,
            min_difficulty: config.min_difficulty,
            max_difficulty: config.max_difficulty,
            target_solve_seconds: config.target_solve_seconds,
            challenge_ttl: config.challenge_ttl as i64,
            state: Mutex::new(PowState {
                active: HashMap::new(),
                recent_solves: VecDeque::new(),
                total_issued: 0,
                total_solved: 0,
                total_failed: 0,
            }),
        }
    }

    /// Issue a fresh challenge at the current adaptive difficulty
    pub fn issue(&self) -> (String, u32) {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let challenge = hex::encode(bytes);

        let mut state = self.state.lock().expect("pow lock poisoned");
        let difficulty = self.adaptive_difficulty(&state);
        state.active.insert(
            challenge.clone(),
            (chrono::Utc::now().timestamp(), difficulty),
        );
        state.total_issued += 1;

        debug!(
            difficulty = difficulty,
            expected_attempts = 1u64 << difficulty.min(40),
            "Issued PoW challenge"
        );

        (challenge, difficulty)
    }

    /// Verify a solution. True iff the challenge is live, the stated
    /// difficulty matches the issued one, and the hash clears it.
    /// Solved challenges are consumed.
    pub fn verify(&self, challenge: &str, nonce: &str, difficulty: u32) -> Result<(), String> {
        let now = chrono::Utc::now().timestamp();
        let mut state = self.state.lock().expect("pow lock poisoned");

        let Some(&(issued_at, issued_difficulty)) = state.active.get(challenge) else {
            state.total_failed += 1;
            warn!("PoW verification failed: unknown or consumed challenge");
            return Err("Invalid or expired challenge".to_string());
        };

        let age = now - issued_at;
        if age > self.challenge_ttl {
            state.active.remove(challenge);
            state.total_failed += 1;
            warn!(age = age, "PoW verification failed: challenge expired");
            return Err(format!(
                "Challenge expired (age: {}s, max: {}s)",
                age, self.challenge_ttl
            ));
        }

        if difficulty != issued_difficulty {
            state.total_failed += 1;
            warn!(
                expected = issued_difficulty,
                got = difficulty,
                "PoW verification failed: difficulty mismatch"
            );
            return Err("Difficulty mismatch".to_string());
        }

        let zeros = leading_zero_bits(&Sha256::digest(format!("{}{}", challenge, nonce)));
        if zeros < difficulty {
            state.total_failed += 1;
            return Err(format!(
                "Solution has insufficient zeros ({}/{})",
                zeros, difficulty
            ));
        }

        // Single-use: consume on success
        state.active.remove(challenge);
        state.recent_solves.push_back((now, age as f64));
        while state.recent_solves.len() > 100 {
            state.recent_solves.pop_front();
        }
        state.total_solved += 1;

        debug!(difficulty = difficulty, zeros = zeros, age = age, "PoW solved");
        Ok(())
    }

    /// Difficulty for the next challenge, nudged toward the target
    /// median solve time
    fn adaptive_difficulty(&self, state: &PowState) -> u32 {
        if state.recent_solves.len() < ADAPTATION_SAMPLE {
            return self.base_difficulty;
        }

        let mut recent: Vec<f64> = state
            .recent_solves
            .iter()
            .rev()
            .take(ADAPTATION_SAMPLE)
            .map(|(_, secs)| *secs)
            .collect();
        recent.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let median = recent[recent.len() / 2];

        let target = self.target_solve_seconds;
        let adjusted = if median < target * 0.5 {
            self.base_difficulty + 2
        } else if median < target {
            self.base_difficulty + 1
        } else if median > target * 2.0 {
            self.base_difficulty.saturating_sub(2)
        } else if median > target {
            self.base_difficulty.saturating_sub(1)
        } else {
            self.base_difficulty
        };

        adjusted.clamp(self.min_difficulty, self.max_difficulty)
    }

    /// Drop expired challenges
    pub fn cleanup_expired(&self) -> usize {
        let now = chrono::Utc::now().timestamp();
        let mut state = self.state.lock().expect("pow lock poisoned");
        let before = state.active.len();
        let ttl = self.challenge_ttl;
        state.active.retain(|_, (issued_at, _)| now - *issued_at <= ttl);
        before - state.active.len()
    }

    pub fn stats(&self) -> PowStats {
        let state = self.state.lock().expect("pow lock poisoned");

        let attempts = state.total_solved + state.total_failed;
        let success_rate = if attempts > 0 {
            (state.total_solved as f64 / attempts as f64) * 100.0
        } else {
            0.0
        };

        let median_solve_seconds = if state.recent_solves.is_empty() {
            0.0
        } else {
            let mut times: Vec<f64> = state.recent_solves.iter().map(|(_, s)| *s).collect();
            times.sort_by(|a, b| a.partial_cmp(b).unwrap());
            times[times.len() / 2]
        };

        PowStats {
            total_issued: state.total_issued,
            total_solved: state.total_solved,
            total_failed: state.total_failed,
            success_rate,
            active_challenges: state.active.len(),
            median_solve_seconds,
            current_difficulty: self.adaptive_difficulty(&state),
        }
    }
}

/// Leading zero bits of a hash digest
pub fn leading_zero_bits(digest: &[u8]) -> u32 {
    let mut zeros = 0;
    for byte in digest {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros();
            break;
        }
    }
    zeros
}

/// Brute-force a solution (test and client-example helper)
pub fn solve(challenge: &str, difficulty: u32) -> String {
    let mut counter: u64 = 0;
    loop {
        let nonce = counter.to_string();
        let digest = Sha256::digest(format!("{}{}", challenge, nonce));
        if leading_zero_bits(&digest) >= difficulty {
            return nonce;
        }
        counter += 1;
    }
}
