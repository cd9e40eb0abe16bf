//! PostgreSQL durable store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{DurableStore, StoreError};
use crate::models::{Address, Credentials, LoginRecord, NewAddress, NewUser, Profile, Session, User};
use crate::services::token::fingerprint;

const SESSION_COLUMNS: &str = r#"
    s.token_hash, s.user_id, u.public_id AS user_public_id, s.created_utc,
    s.last_activity_utc, s.expiry_utc, s.ip_address, s.user_agent
"#;

const ADDRESS_COLUMNS: &str = r#"
    address_id, user_id, address_line_1, address_line_2, city, state, country,
    postal_code, is_primary
"#;

/// Durable store over a shared connection pool.
#[derive(Clone)]
pub struct PgDurableStore {
    pool: PgPool,
}

impl PgDurableStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DurableStore for PgDurableStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        crate::db::health_check(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self, user), fields(public_id = %user.public_id))]
    async fn create_user(&self, user: NewUser) -> Result<User, StoreError> {
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (public_id)
            VALUES ($1)
            RETURNING user_id, public_id, created_utc, updated_utc
            "#,
        )
        .bind(user.public_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO user_credentials (user_id, email, password_hash)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(record.user_id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO user_profiles
                (user_id, first_name, last_name, date_of_birth, phone_number, profile_picture)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.user_id)
        .bind(&user.profile.first_name)
        .bind(&user.profile.last_name)
        .bind(user.profile.date_of_birth)
        .bind(&user.profile.phone_number)
        .bind(&user.profile.profile_picture)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(user_id = record.user_id, "User rows inserted");
        Ok(record)
    }

    async fn find_user_by_public_id(&self, public_id: Uuid) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT user_id, public_id, created_utc, updated_utc
            FROM users
            WHERE public_id = $1
            "#,
        )
        .bind(public_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn find_login_by_email(&self, email: &str) -> Result<Option<LoginRecord>, StoreError> {
        let record = sqlx::query_as::<_, LoginRecord>(
            r#"
            SELECT u.public_id, c.user_id, c.email, c.password_hash,
                   c.two_factor_enabled, c.two_factor_secret
            FROM user_credentials c
            JOIN users u ON u.user_id = c.user_id
            WHERE LOWER(c.email) = LOWER($1)
            "#,
        )
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_credentials(&self, user_id: i64) -> Result<Option<Credentials>, StoreError> {
        let credentials = sqlx::query_as::<_, Credentials>(
            r#"
            SELECT user_id, email, password_hash, two_factor_enabled, two_factor_secret
            FROM user_credentials
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(credentials)
    }

    async fn find_profile(&self, user_id: i64) -> Result<Option<Profile>, StoreError> {
        let profile = sqlx::query_as::<_, Profile>(
            r#"
            SELECT user_id, first_name, last_name, date_of_birth, phone_number, profile_picture
            FROM user_profiles
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(profile)
    }

    #[instrument(skip(self, password_hash))]
    async fn update_password_hash(
        &self,
        user_id: i64,
        password_hash: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE user_credentials SET password_hash = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(password_hash)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!("credentials for user {}", user_id)));
        }

        sqlx::query("UPDATE users SET updated_utc = NOW() WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, secret), fields(enabled = secret.is_some()))]
    async fn set_second_factor(
        &self,
        user_id: i64,
        secret: Option<&str>,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE user_credentials
            SET two_factor_enabled = $2, two_factor_secret = $3
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(secret.is_some())
        .bind(secret)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(StoreError::NotFound(format!("credentials for user {}", user_id)));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_user(&self, user_id: i64) -> Result<Vec<String>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let hashes = sqlx::query_scalar::<_, String>(
            "DELETE FROM user_sessions WHERE user_id = $1 RETURNING token_hash",
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;

        // Credentials, profile and addresses go with the user row.
        sqlx::query("DELETE FROM users WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(hashes)
    }

    #[instrument(skip(self, address), fields(is_primary = address.is_primary))]
    async fn add_address(&self, user_id: i64, address: NewAddress) -> Result<Address, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent primary changes for the same user.
        let owner = sqlx::query_scalar::<_, i64>(
            "SELECT user_id FROM users WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        if owner.is_none() {
            return Err(StoreError::NotFound(format!("user {}", user_id)));
        }

        if address.is_primary {
            sqlx::query(
                "UPDATE user_addresses SET is_primary = FALSE WHERE user_id = $1 AND is_primary",
            )
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        }

        let record = sqlx::query_as::<_, Address>(&format!(
            r#"
            INSERT INTO user_addresses
                (user_id, address_line_1, address_line_2, city, state, country, postal_code, is_primary)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            ADDRESS_COLUMNS
        ))
        .bind(user_id)
        .bind(&address.address_line_1)
        .bind(&address.address_line_2)
        .bind(&address.city)
        .bind(&address.state)
        .bind(&address.country)
        .bind(&address.postal_code)
        .bind(address.is_primary)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(record)
    }

    async fn list_addresses(&self, user_id: i64) -> Result<Vec<Address>, StoreError> {
        let addresses = sqlx::query_as::<_, Address>(&format!(
            "SELECT {} FROM user_addresses WHERE user_id = $1 ORDER BY address_id",
            ADDRESS_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(addresses)
    }

    #[instrument(skip(self, session), fields(session = %fingerprint(&session.token_hash)))]
    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_sessions
                (token_hash, user_id, created_utc, last_activity_utc, expiry_utc, ip_address, user_agent)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&session.token_hash)
        .bind(session.user_id)
        .bind(session.created_utc)
        .bind(session.last_activity_utc)
        .bind(session.expiry_utc)
        .bind(&session.ip_address)
        .bind(&session.user_agent)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_session(&self, token_hash: &str) -> Result<Option<Session>, StoreError> {
        let session = sqlx::query_as::<_, Session>(&format!(
            r#"
            SELECT {}
            FROM user_sessions s
            JOIN users u ON u.user_id = s.user_id
            WHERE s.token_hash = $1
            "#,
            SESSION_COLUMNS
        ))
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(session)
    }

    async fn touch_session(
        &self,
        token_hash: &str,
        last_activity: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE user_sessions
            SET last_activity_utc = GREATEST(last_activity_utc, $2),
                expiry_utc = GREATEST(expiry_utc, $3)
            WHERE token_hash = $1
            "#,
        )
        .bind(token_hash)
        .bind(last_activity)
        .bind(expiry)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }

    async fn delete_session(&self, token_hash: &str) -> Result<bool, StoreError> {
        let deleted = sqlx::query("DELETE FROM user_sessions WHERE token_hash = $1")
            .bind(token_hash)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(deleted > 0)
    }

    async fn delete_user_sessions(&self, user_id: i64) -> Result<Vec<String>, StoreError> {
        let hashes = sqlx::query_scalar::<_, String>(
            "DELETE FROM user_sessions WHERE user_id = $1 RETURNING token_hash",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(hashes)
    }

    async fn delete_expired_sessions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, StoreError> {
        // SKIP LOCKED lets several sweepers share the backlog.
        let hashes = sqlx::query_scalar::<_, String>(
            r#"
            DELETE FROM user_sessions
            WHERE token_hash IN (
                SELECT token_hash
                FROM user_sessions
                WHERE expiry_utc <= $1
                ORDER BY expiry_utc
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING token_hash
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::models::{ClientMeta, NewProfile};
    use crate::services::token::SessionToken;

    async fn store() -> PgDurableStore {
        let config = DatabaseConfig::for_url("postgres://localhost/auth_core_test");
        let pool = crate::db::create_pool(&config).await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        PgDurableStore::new(pool)
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_session_round_trip_and_cascade() {
        let store = store().await;
        let email = format!("{}@example.com", Uuid::new_v4());
        let user = store
            .create_user(NewUser {
                public_id: Uuid::new_v4(),
                email: email.clone(),
                password_hash: "hash".into(),
                profile: NewProfile {
                    first_name: "Test".into(),
                    ..Default::default()
                },
            })
            .await
            .unwrap();

        let login = store
            .find_login_by_email(&email.to_uppercase())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(login.public_id, user.public_id);

        let token = SessionToken::generate();
        let session = Session::new(
            token.hash(),
            user.user_id,
            user.public_id,
            Utc::now(),
            chrono::Duration::hours(1),
            &ClientMeta::default(),
        );
        store.insert_session(&session).await.unwrap();
        assert!(matches!(
            store.insert_session(&session).await,
            Err(StoreError::UniqueViolation(_))
        ));

        let found = store.find_session(&token.hash()).await.unwrap().unwrap();
        assert_eq!(found.user_public_id, user.public_id);

        let removed = store.delete_user(user.user_id).await.unwrap();
        assert_eq!(removed, vec![token.hash()]);
        assert!(store.find_session(&token.hash()).await.unwrap().is_none());
    }
}
