//! Compares in-session counters against a grant's ceilings. Counters are
//! updated from a single session task, so no locking is required on the hot
//! path; cross-session reconciliation against the query log, if any, is an
//! admin-plane concern outside the core.

use dbbat_store::Grant;

use crate::error::ProxyError;

pub struct QuotaEnforcer {
    max_query_count: Option<i64>,
    max_bytes_transferred: Option<i64>,
    query_count: i64,
    bytes_transferred: i64,
}

impl QuotaEnforcer {
    pub fn from_grant(grant: &Grant) -> Self {
        Self {
            max_query_count: grant.max_query_count,
            max_bytes_transferred: grant.max_bytes_transferred,
            query_count: grant.query_count,
            bytes_transferred: 0,
        }
    }

    /// Checked strictly before forwarding a Query/Execute to upstream.
    pub fn check(&self) -> Result<(), ProxyError> {
        if let Some(max) = self.max_query_count {
            if self.query_count >= max {
                return Err(ProxyError::QueryCountExceeded);
            }
        }
        if let Some(max) = self.max_bytes_transferred {
            if self.bytes_transferred >= max {
                return Err(ProxyError::ByteLimitExceeded);
            }
        }
        Ok(())
    }

    pub fn record_admitted_query(&mut self) {
        self.query_count += 1;
    }

    pub fn record_bytes(&mut self, bytes: u64) {
        self.bytes_transferred += bytes as i64;
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn grant(max_query_count: Option<i64>, max_bytes: Option<i64>) -> Grant {
        let now = Utc::now();
        Grant {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            database_id: Uuid::new_v4(),
            access_level: dbbat_store::AccessLevel::Read,
            starts_at: now - Duration::hours(1),
            expires_at: now + Duration::hours(1),
            revoked_at: None,
            max_query_count,
            max_bytes_transferred: max_bytes,
            query_count: 0,
        }
    }

    #[test]
    fn admits_until_query_count_reached() {
        let mut enforcer = QuotaEnforcer::from_grant(&grant(Some(2), None));
        assert!(enforcer.check().is_ok());
        enforcer.record_admitted_query();
        assert!(enforcer.check().is_ok());
        enforcer.record_admitted_query();
        assert!(matches!(enforcer.check(), Err(ProxyError::QueryCountExceeded)));
    }

    #[test]
    fn admits_until_byte_ceiling_reached() {
        let mut enforcer = QuotaEnforcer::from_grant(&grant(None, Some(100)));
        enforcer.record_bytes(99);
        assert!(enforcer.check().is_ok());
        enforcer.record_bytes(1);
        assert!(matches!(enforcer.check(), Err(ProxyError::ByteLimitExceeded)));
    }

    #[test]
    fn unlimited_grant_never_denies() {
        let enforcer = QuotaEnforcer::from_grant(&grant(None, None));
        assert!(enforcer.check().is_ok());
    }

    #[test]
    fn starts_from_the_grants_existing_query_count() {
        let mut g = grant(Some(3), None);
        g.query_count = 2;
        let enforcer = QuotaEnforcer::from_grant(&g);
        assert!(enforcer.check().is_ok());
    }
}
