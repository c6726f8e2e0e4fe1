use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::hash::{verify_password, HashError};

/// Argon2id is intentionally slow. A client pipelining many short-lived
/// connections with the same password would otherwise pay the hashing cost
/// on every single one; this cache amortizes repeat verifications against
/// the same stored hash for a short window.
///
/// Entries are keyed on the full plaintext, not a digest of it, because the
/// cache never persists anything and is only ever consulted in-process.
pub struct PasswordVerifyCache {
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

#[derive(Hash, PartialEq, Eq, Clone)]
struct CacheKey {
    user_id: Uuid,
    stored_hash: String,
    plaintext: String,
}

struct CacheEntry {
    result: bool,
    inserted_at: Instant,
}

impl PasswordVerifyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Verify `plaintext` against `stored_hash`, consulting the cache first.
    /// A cache hit skips Argon2id entirely; a miss hashes and caches the
    /// outcome (whether it verified or not) for the configured TTL.
    pub async fn verify(
        &self,
        user_id: Uuid,
        stored_hash: &str,
        plaintext: &str,
    ) -> Result<bool, HashError> {
        let key = CacheKey {
            user_id,
            stored_hash: stored_hash.to_string(),
            plaintext: plaintext.to_string(),
        };

        {
            let entries = self.entries.lock().await;
            if let Some(entry) = entries.get(&key) {
                if entry.inserted_at.elapsed() < self.ttl {
                    return Ok(entry.result);
                }
            }
        }

        let result = verify_password(stored_hash, plaintext)?;

        let mut entries = self.entries.lock().await;
        entries.retain(|_, e| e.inserted_at.elapsed() < self.ttl);
        entries.insert(
            key,
            CacheEntry {
                result,
                inserted_at: Instant::now(),
            },
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_password;

    #[tokio::test]
    async fn caches_a_successful_verification() {
        let cache = PasswordVerifyCache::new(Duration::from_secs(60));
        let hash = hash_password("hunter2").unwrap();
        let uid = Uuid::new_v4();

        assert!(cache.verify(uid, &hash, "hunter2").await.unwrap());
        assert!(cache.verify(uid, &hash, "hunter2").await.unwrap());
    }

    #[tokio::test]
    async fn caches_a_failed_verification() {
        let cache = PasswordVerifyCache::new(Duration::from_secs(60));
        let hash = hash_password("hunter2").unwrap();
        let uid = Uuid::new_v4();

        assert!(!cache.verify(uid, &hash, "wrong").await.unwrap());
        assert!(!cache.verify(uid, &hash, "wrong").await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_are_rechecked() {
        let cache = PasswordVerifyCache::new(Duration::from_millis(1));
        let hash = hash_password("hunter2").unwrap();
        let uid = Uuid::new_v4();

        assert!(cache.verify(uid, &hash, "hunter2").await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.verify(uid, &hash, "hunter2").await.unwrap());
    }
}
