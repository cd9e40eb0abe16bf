//! User model and the records it exclusively owns.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Identity anchor.
///
/// `user_id` is the storage key and never leaves this crate's adapters;
/// callers refer to users by `public_id`.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub user_id: i64,
    pub public_id: Uuid,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Login credentials, one per user.
#[derive(Clone, FromRow)]
pub struct Credentials {
    pub user_id: i64,
    pub email: String,
    pub password_hash: String,
    pub two_factor_enabled: bool,
    pub two_factor_secret: Option<String>,
}

impl Credentials {
    /// The second-factor secret, only when the factor is switched on.
    pub fn second_factor_secret(&self) -> Option<&str> {
        if self.two_factor_enabled {
            self.two_factor_secret.as_deref()
        } else {
            None
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("email", &self.email)
            .field("password_hash", &"[REDACTED]")
            .field("two_factor_enabled", &self.two_factor_enabled)
            .field(
                "two_factor_secret",
                &self.two_factor_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Credentials joined with the owner's public identifier, as read by login.
#[derive(Debug, Clone, FromRow)]
pub struct LoginRecord {
    pub public_id: Uuid,
    #[sqlx(flatten)]
    pub credentials: Credentials,
}

/// Descriptive attributes, one per user.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Profile {
    #[serde(skip)]
    pub user_id: i64,
    pub first_name: String,
    pub last_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub phone_number: Option<String>,
    pub profile_picture: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewProfile {
    pub first_name: String,
    pub last_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub phone_number: Option<String>,
    pub profile_picture: Option<String>,
}

/// Postal address; at most one per user has `is_primary` set.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Address {
    pub address_id: i64,
    #[serde(skip)]
    pub user_id: i64,
    pub address_line_1: String,
    pub address_line_2: Option<String>,
    pub city: String,
    pub state: String,
    pub country: String,
    pub postal_code: String,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewAddress {
    pub address_line_1: String,
    pub address_line_2: Option<String>,
    pub city: String,
    pub state: String,
    pub country: String,
    pub postal_code: String,
    pub is_primary: bool,
}

/// Everything written when a user registers.
#[derive(Clone)]
pub struct NewUser {
    pub public_id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub profile: NewProfile,
}

impl fmt::Debug for NewUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewUser")
            .field("public_id", &self.public_id)
            .field("email", &self.email)
            .field("password_hash", &"[REDACTED]")
            .field("profile", &self.profile)
            .finish()
    }
}

/// Canonical form used for email comparisons.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(enabled: bool, secret: Option<&str>) -> Credentials {
        Credentials {
            user_id: 7,
            email: "a@x.com".to_string(),
            password_hash: "$argon2id$v=19$secret".to_string(),
            two_factor_enabled: enabled,
            two_factor_secret: secret.map(str::to_string),
        }
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let rendered = format!("{:?}", credentials(true, Some("JBSWY3DPEHPK3PXP")));
        assert!(!rendered.contains("argon2id"));
        assert!(!rendered.contains("JBSWY3DPEHPK3PXP"));
        assert!(rendered.contains("a@x.com"));
    }

    #[test]
    fn second_factor_secret_requires_enabled_flag() {
        assert_eq!(
            credentials(true, Some("JBSWY3DPEHPK3PXP")).second_factor_secret(),
            Some("JBSWY3DPEHPK3PXP")
        );
        assert_eq!(
            credentials(false, Some("JBSWY3DPEHPK3PXP")).second_factor_secret(),
            None
        );
    }

    #[test]
    fn emails_compare_case_insensitively() {
        assert_eq!(normalize_email("  Alice@Example.COM "), "alice@example.com");
    }
}
