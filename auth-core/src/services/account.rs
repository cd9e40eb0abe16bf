//! Account write path: registration, credential changes, addresses and
//! deletion.

use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::error::AuthError;
use super::session::SessionManager;
use super::verifier::SecondFactorEnrollment;
use crate::models::{normalize_email, Address, Credentials, NewAddress, NewProfile, NewUser, Profile, User};
use crate::store::{with_timeout, StoreError};

pub struct AccountService {
    sessions: Arc<SessionManager>,
}

impl AccountService {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    /// Create a user with credentials and profile. Returns the public id.
    #[instrument(skip_all)]
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        profile: NewProfile,
    ) -> Result<Uuid, AuthError> {
        let email = normalize_email(email);
        validate_email(&email)?;
        validate_password(password)?;
        if profile.first_name.trim().is_empty() {
            return Err(AuthError::InvalidInput("first name is required".into()));
        }

        let password_hash = self.hash_password(password).await?;
        let user = NewUser {
            public_id: Uuid::new_v4(),
            email,
            password_hash,
            profile,
        };

        let durable = self.sessions.durable_store();
        let created = with_timeout(self.sessions.timeouts().durable, durable.create_user(user))
            .await
            .map_err(|e| match e {
                StoreError::UniqueViolation(_) => AuthError::EmailTaken,
                other => other.into(),
            })?;

        info!(user_id = %created.public_id, "User registered");
        Ok(created.public_id)
    }

    /// Replace the password after checking the current one, then revoke
    /// every session. Returns how many sessions were revoked.
    #[instrument(skip(self, current_password, new_password))]
    pub async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> Result<usize, AuthError> {
        validate_password(new_password)?;
        let (user, credentials) = self.load_credentials(user_id).await?;

        if !self
            .check_password(&credentials.password_hash, current_password)
            .await?
        {
            info!(user_id = %user_id, "Password change rejected");
            return Err(AuthError::InvalidCredentials);
        }

        let password_hash = self.hash_password(new_password).await?;
        self.sessions
            .durable_call(
                self.sessions
                    .durable_store()
                    .update_password_hash(user.user_id, &password_hash),
            )
            .await?;

        let revoked = self.sessions.revoke_user_sessions(user.user_id).await?;
        info!(user_id = %user_id, revoked, "Password changed");
        Ok(revoked)
    }

    /// Generate a second-factor secret for the user to load into an
    /// authenticator. Nothing is stored until [`confirm_second_factor`].
    ///
    /// [`confirm_second_factor`]: Self::confirm_second_factor
    pub async fn begin_second_factor(&self, user_id: Uuid) -> Result<SecondFactorEnrollment, AuthError> {
        let (_, credentials) = self.load_credentials(user_id).await?;
        if credentials.two_factor_enabled {
            return Err(AuthError::InvalidInput("second factor is already enabled".into()));
        }
        self.sessions.verifier().enroll_second_factor(&credentials.email)
    }

    /// Store the secret once the user proves their authenticator has it.
    #[instrument(skip(self, secret, code))]
    pub async fn confirm_second_factor(
        &self,
        user_id: Uuid,
        secret: &str,
        code: &str,
    ) -> Result<(), AuthError> {
        let (user, _) = self.load_credentials(user_id).await?;

        let now = self.sessions.clock().now();
        if !self
            .sessions
            .verifier()
            .verify_second_factor_at(secret, code, now)
        {
            return Err(AuthError::InvalidSecondFactor);
        }

        self.sessions
            .durable_call(
                self.sessions
                    .durable_store()
                    .set_second_factor(user.user_id, Some(secret)),
            )
            .await?;

        info!(user_id = %user_id, "Second factor enabled");
        Ok(())
    }

    /// Turn the second factor off. Requires the password.
    #[instrument(skip(self, password))]
    pub async fn disable_second_factor(&self, user_id: Uuid, password: &str) -> Result<(), AuthError> {
        let (user, credentials) = self.load_credentials(user_id).await?;
        if !self
            .check_password(&credentials.password_hash, password)
            .await?
        {
            return Err(AuthError::InvalidCredentials);
        }

        self.sessions
            .durable_call(
                self.sessions
                    .durable_store()
                    .set_second_factor(user.user_id, None),
            )
            .await?;

        info!(user_id = %user_id, "Second factor disabled");
        Ok(())
    }

    pub async fn profile(&self, user_id: Uuid) -> Result<Profile, AuthError> {
        let user = self.load_user(user_id).await?;
        self.sessions
            .durable_call(self.sessions.durable_store().find_profile(user.user_id))
            .await?
            .ok_or(AuthError::UserNotFound)
    }

    /// Add an address. A user's first address becomes primary; a new
    /// primary address demotes the old one.
    #[instrument(skip(self, address))]
    pub async fn add_address(&self, user_id: Uuid, mut address: NewAddress) -> Result<Address, AuthError> {
        for (field, value) in [
            ("address_line_1", &address.address_line_1),
            ("city", &address.city),
            ("state", &address.state),
            ("country", &address.country),
            ("postal_code", &address.postal_code),
        ] {
            if value.trim().is_empty() {
                return Err(AuthError::InvalidInput(format!("{} is required", field)));
            }
        }

        let user = self.load_user(user_id).await?;
        let durable = self.sessions.durable_store();

        if !address.is_primary {
            let existing = self
                .sessions
                .durable_call(durable.list_addresses(user.user_id))
                .await?;
            address.is_primary = existing.is_empty();
        }

        let created = self
            .sessions
            .durable_call(durable.add_address(user.user_id, address))
            .await?;
        Ok(created)
    }

    pub async fn addresses(&self, user_id: Uuid) -> Result<Vec<Address>, AuthError> {
        let user = self.load_user(user_id).await?;
        self.sessions
            .durable_call(self.sessions.durable_store().list_addresses(user.user_id))
            .await
    }

    /// Delete the user and everything they own. Unknown users are
    /// acknowledged.
    #[instrument(skip(self))]
    pub async fn delete_user(&self, user_id: Uuid) -> Result<(), AuthError> {
        let user = match self
            .sessions
            .durable_call(self.sessions.durable_store().find_user_by_public_id(user_id))
            .await?
        {
            Some(user) => user,
            None => return Ok(()),
        };

        let hashes = self
            .sessions
            .durable_call(self.sessions.durable_store().delete_user(user.user_id))
            .await?;
        self.sessions.evict(&hashes).await;

        info!(user_id = %user_id, sessions = hashes.len(), "User deleted");
        Ok(())
    }

    async fn load_user(&self, user_id: Uuid) -> Result<User, AuthError> {
        self.sessions
            .durable_call(self.sessions.durable_store().find_user_by_public_id(user_id))
            .await?
            .ok_or(AuthError::UserNotFound)
    }

    async fn load_credentials(&self, user_id: Uuid) -> Result<(User, Credentials), AuthError> {
        let user = self.load_user(user_id).await?;
        let credentials = self
            .sessions
            .durable_call(self.sessions.durable_store().find_credentials(user.user_id))
            .await?;

        match credentials {
            Some(credentials) => Ok((user, credentials)),
            None => {
                warn!(user_id = %user_id, "User has no credentials row");
                Err(AuthError::UserNotFound)
            }
        }
    }

    async fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        let verifier = self.sessions.verifier().clone();
        let password = password.to_owned();
        tokio::task::spawn_blocking(move || verifier.hash_password(&password)).await?
    }

    async fn check_password(&self, stored_hash: &str, presented: &str) -> Result<bool, AuthError> {
        let verifier = self.sessions.verifier().clone();
        let stored_hash = stored_hash.to_owned();
        let presented = presented.to_owned();
        let matched =
            tokio::task::spawn_blocking(move || verifier.verify_password(&stored_hash, &presented))
                .await?;
        Ok(matched)
    }
}

#[derive(Debug, Validate)]
struct EmailInput {
    #[validate(
        email(message = "email address is not valid"),
        length(max = 255, message = "email address is too long")
    )]
    email: String,
}

#[derive(Validate)]
struct PasswordInput {
    #[validate(length(min = 8, max = 1024, message = "password must be 8 to 1024 characters"))]
    password: String,
}

fn validate_email(email: &str) -> Result<(), AuthError> {
    EmailInput {
        email: email.to_owned(),
    }
    .validate()?;
    Ok(())
}

fn validate_password(password: &str) -> Result<(), AuthError> {
    PasswordInput {
        password: password.to_owned(),
    }
    .validate()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_shape_checks() {
        assert!(validate_email("alice@example.com").is_ok());
        assert!(validate_email("a@b.").is_err());
        assert!(validate_email("a@@b.com").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("alice example@example.com").is_err());
        assert!(validate_email("alice:x@example.com").is_err());
    }

    #[test]
    fn password_length_bounds() {
        assert!(validate_password("short").is_err());
        assert!(validate_password("long enough").is_ok());
        assert!(validate_password("exactly8").is_ok());
        assert!(validate_password(&"x".repeat(1025)).is_err());
    }
}
