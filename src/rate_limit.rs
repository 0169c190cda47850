//! Per-source rate limiting and shared-secret authentication for the
//! signal endpoint.
//!
//! The limiter remembers when each source address was last accepted.  The
//! table is capped at `tracked_clients` entries; on overflow every entry
//! sharing the oldest timestamp is evicted, not just one of them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::error::SignalError;

pub struct RateLimiter {
    limit: Duration,
    tracked_clients: usize,
    clients: HashMap<String, Instant>,
}

impl RateLimiter {
    pub fn new(limit: Duration, tracked_clients: usize) -> Self {
        Self {
            limit,
            tracked_clients,
            clients: HashMap::new(),
        }
    }

    pub fn check(&mut self, source: &str) -> Result<(), SignalError> {
        self.check_at(source, Instant::now())
    }

    /// Admits `source` at `now`, or rejects it without touching its record
    /// when the previous accepted request is younger than the limit.
    pub fn check_at(&mut self, source: &str, now: Instant) -> Result<(), SignalError> {
        if let Some(last) = self.clients.get(source) {
            if now.saturating_duration_since(*last) < self.limit {
                return Err(SignalError::RateLimited);
            }
        }
        self.clients.insert(source.to_string(), now);
        self.evict();
        Ok(())
    }

    fn evict(&mut self) {
        while self.clients.len() > self.tracked_clients {
            let Some(oldest) = self.clients.values().min().copied() else {
                return;
            };
            self.clients.retain(|_, seen| *seen != oldest);
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.clients.len()
    }

    #[cfg(test)]
    fn is_tracked(&self, source: &str) -> bool {
        self.clients.contains_key(source)
    }
}

/// Exact-match check of the shared secret.
///
/// Both sides are hashed before comparison so the comparison time does not
/// depend on how many leading characters of the secret a caller guessed.
pub struct Authenticator {
    digest: [u8; 32],
}

impl Authenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            digest: Sha256::digest(secret.as_bytes()).into(),
        }
    }

    pub fn verify(&self, supplied: Option<&str>) -> Result<(), SignalError> {
        let supplied: [u8; 32] = Sha256::digest(supplied.unwrap_or_default().as_bytes()).into();
        let diff = self
            .digest
            .iter()
            .zip(supplied.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff == 0 {
            Ok(())
        } else {
            Err(SignalError::Unauthorized)
        }
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Authenticator { .. }")
    }
}
