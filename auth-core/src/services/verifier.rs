//! Password and second-factor verification.
//!
//! Verification never fails with an error: a malformed stored hash or secret
//! is a mismatch. Nothing here logs or returns stored secrets.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use chrono::{DateTime, Utc};
use totp_rs::{Algorithm as TotpAlgorithm, Secret, TOTP};

use super::error::AuthError;
use crate::config::{PasswordConfig, TotpConfig};

/// Label used when building a TOTP purely for code generation.
const VERIFY_ACCOUNT: &str = "session";

/// A freshly generated second-factor secret, ready to show the user once.
#[derive(Clone)]
pub struct SecondFactorEnrollment {
    /// Base32 secret, as stored.
    pub secret: String,
    /// `otpauth://totp/...` provisioning URI for authenticator apps.
    pub otpauth_uri: String,
}

impl std::fmt::Debug for SecondFactorEnrollment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecondFactorEnrollment([REDACTED])")
    }
}

#[derive(Clone)]
pub struct CredentialVerifier {
    argon2: Argon2<'static>,
    totp: TotpConfig,
    /// Hash checked when the email is unknown, so both paths cost the same.
    dummy_hash: String,
}

impl CredentialVerifier {
    pub fn new(password: &PasswordConfig, totp: TotpConfig) -> Result<Self, AuthError> {
        let params = Params::new(
            password.argon2_memory_kib,
            password.argon2_iterations,
            password.argon2_parallelism,
            None,
        )
        .map_err(|e| AuthError::Configuration(format!("Invalid Argon2 parameters: {}", e)))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let dummy_hash = argon2
            .hash_password(
                b"enumeration-resistance-placeholder",
                &SaltString::generate(&mut OsRng),
            )
            .map_err(|e| AuthError::Configuration(format!("Failed to hash password: {}", e)))?
            .to_string();

        Ok(Self {
            argon2,
            totp,
            dummy_hash,
        })
    }

    /// Argon2id hash with a fresh salt, in PHC string format.
    pub fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AuthError::Internal(format!("Failed to hash password: {}", e)))?
            .to_string();
        Ok(hash)
    }

    /// Parameters come from the stored hash, so hashes made under older
    /// cost settings still verify.
    pub fn verify_password(&self, stored_hash: &str, presented: &str) -> bool {
        let parsed = match PasswordHash::new(stored_hash) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, "Stored password hash is malformed");
                return false;
            }
        };

        self.argon2
            .verify_password(presented.as_bytes(), &parsed)
            .is_ok()
    }

    /// Spend the same work as a real check, against a hash nobody owns.
    pub fn verify_against_dummy(&self, presented: &str) -> bool {
        let _ = self.verify_password(&self.dummy_hash, presented);
        false
    }

    /// RFC 6238 time step containing `now`.
    pub fn time_step(&self, now: DateTime<Utc>) -> u64 {
        now.timestamp().max(0) as u64 / self.totp.step_secs.max(1)
    }

    /// Accepts codes for `time_step` and up to `skew_steps` either side,
    /// compared in constant time by `TOTP::check`.
    pub fn verify_second_factor(&self, stored_secret: &str, presented: &str, time_step: u64) -> bool {
        let presented: String = presented.chars().filter(|c| !c.is_whitespace()).collect();
        if presented.len() != self.totp.digits || !presented.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        // The window would start before the epoch.
        if time_step < u64::from(self.totp.skew_steps) {
            return false;
        }

        match self.build_totp(stored_secret, VERIFY_ACCOUNT) {
            Some(totp) => totp.check(&presented, time_step * self.totp.step_secs),
            None => false,
        }
    }

    pub fn verify_second_factor_at(
        &self,
        stored_secret: &str,
        presented: &str,
        now: DateTime<Utc>,
    ) -> bool {
        self.verify_second_factor(stored_secret, presented, self.time_step(now))
    }

    /// Code an authenticator would show at `time_step`.
    pub fn second_factor_code(&self, stored_secret: &str, time_step: u64) -> Option<String> {
        self.build_totp(stored_secret, VERIFY_ACCOUNT)
            .map(|totp| totp.generate(time_step * self.totp.step_secs))
    }

    /// Generate a new secret and its provisioning URI for `account`.
    pub fn enroll_second_factor(&self, account: &str) -> Result<SecondFactorEnrollment, AuthError> {
        let secret = Secret::generate_secret();
        let secret_bytes = secret
            .to_bytes()
            .map_err(|e| AuthError::Internal(format!("TOTP secret bytes: {}", e)))?;

        let totp = TOTP::new(
            TotpAlgorithm::SHA1,
            self.totp.digits,
            self.totp.skew_steps,
            self.totp.step_secs,
            secret_bytes,
            Some(self.totp.issuer.clone()),
            account.to_string(),
        )
        .map_err(|e| AuthError::InvalidInput(format!("TOTP account: {}", e)))?;

        Ok(SecondFactorEnrollment {
            secret: secret.to_encoded().to_string(),
            otpauth_uri: totp.get_url(),
        })
    }

    fn build_totp(&self, stored_secret: &str, account: &str) -> Option<TOTP> {
        let bytes = match Secret::Encoded(stored_secret.to_string()).to_bytes() {
            Ok(bytes) => bytes,
            Err(_) => {
                tracing::warn!("Stored second-factor secret is not valid base32");
                return None;
            }
        };

        TOTP::new(
            TotpAlgorithm::SHA1,
            self.totp.digits,
            self.totp.skew_steps,
            self.totp.step_secs,
            bytes,
            Some(self.totp.issuer.clone()),
            account.to_string(),
        )
        .map_err(|e| tracing::warn!(error = %e, "Stored second-factor secret rejected"))
        .ok()
    }
}
