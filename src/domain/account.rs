use serde::{Deserialize, Serialize};

use crate::domain::outbox::OutboxKey;

/// Password versions wrap at this value.
pub const PWD_VERSION_MODULUS: i64 = 100;

pub fn next_pwd_version(current: i64) -> i64 {
    (current + 1).rem_euclid(PWD_VERSION_MODULUS)
}

/// Cache key holding the latest password version of a user.
pub fn pwd_version_cache_key(user_id: OutboxKey) -> String {
    format!("{}:pwd_version", user_id)
}

/// Claims of an already decoded access token that matter for password-version checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub user_id: OutboxKey,
    pub pwd_version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seller {
    pub id: OutboxKey,
    pub user_id: i64,
    pub store_name: String,
}
