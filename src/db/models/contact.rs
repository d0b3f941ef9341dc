use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;

/// An emergency contact, addressed only by phone hash. At most three per
/// user, one per priority (1 is most urgent).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub id: i64,
    pub user_id: i64,
    pub priority: i64,
    pub phone_hash: String,
    pub display_name: String,
    pub created_at: NaiveDateTime,
}

/// Hash a raw phone number for storage and addressing. Raw numbers are
/// never persisted. The write path (user CRUD) calls this at registration
/// time; the scheduling core only ever sees hashes.
#[allow(dead_code)]
pub fn hash_phone(phone: &str) -> String {
    let digest = Sha256::digest(phone.trim().as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_stable_and_trims_whitespace() {
        let a = hash_phone("+8613800138000");
        let b = hash_phone(" +8613800138000 ");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn distinct_numbers_hash_differently() {
        assert_ne!(hash_phone("+8613800138000"), hash_phone("+8613800138001"));
    }
}
