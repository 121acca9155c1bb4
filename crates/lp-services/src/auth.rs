//! Login, sessions, and account registration.

use chrono::{Duration, Utc};
use serde::Serialize;
use sqlx::MySqlPool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use lp_core::config::SessionConfig;
use lp_core::security::audit::{AuditAction, AuditLogger, AuditResult};
use lp_core::security::input;
use lp_core::security::password;
use lp_db::models::{ApiKey, PublicUser, User};
use lp_db::queries;
use lp_db::DbError;

use crate::context::RequestIdentity;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    Validation(String),
    /// Deliberately uniform for unknown user and wrong password.
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Account is temporarily locked. Please try again later.")]
    AccountLocked,
    #[error("Account is suspended")]
    AccountSuspended,
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("Password reset is not implemented")]
    NotImplemented,
    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

/// Issued on successful login. `token` goes into the session cookie,
/// `csrf_token` into the response body for the UI to replay.
#[derive(Debug, Clone, Serialize)]
pub struct LoginSession {
    #[serde(skip)]
    pub token: String,
    pub csrf_token: String,
    pub expires_at: chrono::DateTime<Utc>,
    pub user: PublicUser,
}

/// A validated session, resolved from the cookie on every request.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub user: User,
    pub csrf_token: String,
}

pub struct AuthService {
    pool: MySqlPool,
    config: SessionConfig,
    audit: Arc<dyn AuditLogger>,
}

impl AuthService {
    pub fn new(pool: MySqlPool, config: SessionConfig, audit: Arc<dyn AuditLogger>) -> Self {
        Self {
            pool,
            config,
            audit,
        }
    }

    /// Verify credentials and open a session.
    ///
    /// Lockout state machine: `max_login_attempts` consecutive failures
    /// lock the account for `lockout_secs`; an expired lock clears on
    /// the next attempt. Unknown users and wrong passwords produce the
    /// same error so usernames cannot be probed.
    pub async fn login(
        &self,
        identity: &RequestIdentity,
        identifier: &str,
        plaintext: &str,
    ) -> Result<LoginSession, AuthError> {
        if identifier.is_empty() || plaintext.is_empty() {
            return Err(AuthError::Validation(
                "Username and password are required".to_string(),
            ));
        }

        let user = match queries::get_user_by_identifier(&self.pool, identifier).await? {
            Some(user) => user,
            None => {
                self.audit_login_failure(identity, identifier, "unknown user")
                    .await;
                return Err(AuthError::InvalidCredentials);
            }
        };

        let user = self.enforce_account_status(identity, user).await?;

        if !password::verify_password(plaintext, &user.password_hash) {
            let (max_attempts, lockout_secs) = self.login_thresholds().await;
            let attempts = user.login_attempts + 1;
            if crosses_lockout_threshold(user.login_attempts, max_attempts) {
                let until = Utc::now() + Duration::seconds(lockout_secs);
                queries::lock_account(&self.pool, user.id, until).await?;
                warn!(username = %user.username, attempts, "Account locked after failed logins");
            } else {
                queries::set_login_attempts(&self.pool, user.id, attempts).await?;
            }
            self.audit_login_failure(identity, &user.username, "wrong password")
                .await;
            return Err(AuthError::InvalidCredentials);
        }

        queries::record_login_success(&self.pool, user.id).await?;

        let token = password::generate_token();
        let csrf_token = password::generate_token();
        let expires_at = Utc::now() + Duration::seconds(self.config.lifetime_secs);
        queries::create_session(
            &self.pool,
            &token,
            user.id,
            &csrf_token,
            identity.ip_address.as_deref(),
            identity.user_agent.as_deref(),
            expires_at,
        )
        .await?;

        info!(username = %user.username, "User logged in");
        self.audit
            .log_event(
                &identity
                    .event(AuditAction::Login, "auth")
                    .user(user.id)
                    .entity_id(user.id),
            )
            .await;

        Ok(LoginSession {
            token,
            csrf_token,
            expires_at,
            user: PublicUser::from(&user),
        })
    }

    /// Create a panel account.
    pub async fn register(
        &self,
        identity: &RequestIdentity,
        username: &str,
        email: &str,
        plaintext: &str,
        confirm: &str,
    ) -> Result<i64, AuthError> {
        if username.is_empty() || email.is_empty() || plaintext.is_empty() || confirm.is_empty() {
            return Err(AuthError::Validation("All fields are required".to_string()));
        }
        input::validate_email(email)
            .map_err(|_| AuthError::Validation("Invalid email address".to_string()))?;
        password::validate_password_policy(plaintext, self.config.min_password_length)
            .map_err(|e| AuthError::Validation(e.to_string()))?;
        if plaintext != confirm {
            return Err(AuthError::Validation(
                "Passwords do not match".to_string(),
            ));
        }

        let hash = password::hash_password(plaintext)
            .map_err(|e| AuthError::Validation(e.to_string()))?;

        let id = match queries::create_panel_user(&self.pool, username, &hash, email, "user").await
        {
            Ok(id) => id,
            Err(DbError::Duplicate(message)) => {
                return Err(AuthError::Validation(message));
            }
            Err(e) => return Err(e.into()),
        };

        info!(username, id, "Registered panel user");
        self.audit
            .log_event(&identity.event(AuditAction::Register, "auth").entity_id(id))
            .await;
        Ok(id)
    }

    /// Close the session behind `token`.
    pub async fn logout(&self, identity: &RequestIdentity, token: &str) -> Result<(), AuthError> {
        queries::delete_session(&self.pool, token).await?;
        self.audit
            .log_event(&identity.event(AuditAction::Logout, "auth"))
            .await;
        Ok(())
    }

    /// Resolve a session cookie to its user, refreshing the sliding
    /// expiry. Suspended accounts are rejected even with a live session.
    pub async fn check(&self, token: &str) -> Result<AuthSession, AuthError> {
        let session = queries::get_session(&self.pool, token)
            .await?
            .ok_or(AuthError::NotAuthenticated)?;

        let user = match queries::get_user_by_id(&self.pool, session.user_id).await {
            Ok(user) => user,
            Err(DbError::NotFound(_)) => return Err(AuthError::NotAuthenticated),
            Err(e) => return Err(e.into()),
        };
        if user.status == "suspended" {
            return Err(AuthError::AccountSuspended);
        }

        queries::touch_session(&self.pool, token).await?;
        Ok(AuthSession {
            user,
            csrf_token: session.csrf_token,
        })
    }

    /// Resolve an API key to its owning user.
    pub async fn validate_api_key(&self, key: &str) -> Result<(ApiKey, User), AuthError> {
        let api_key = queries::find_active_api_key(&self.pool, key)
            .await?
            .ok_or(AuthError::NotAuthenticated)?;
        let user = match queries::get_user_by_id(&self.pool, api_key.user_id).await {
            Ok(user) => user,
            Err(DbError::NotFound(_)) => return Err(AuthError::NotAuthenticated),
            Err(e) => return Err(e.into()),
        };
        if user.status != "active" {
            return Err(AuthError::NotAuthenticated);
        }
        Ok((api_key, user))
    }

    /// Start a password reset. The outcome never reveals whether the
    /// email maps to an account; a matching active user only produces an
    /// audit entry, since reset mails are not sent yet.
    pub async fn request_password_reset(
        &self,
        identity: &RequestIdentity,
        email: &str,
    ) -> Result<(), AuthError> {
        if email.is_empty() {
            return Err(AuthError::Validation("Email is required".to_string()));
        }
        if let Some(user) = queries::get_user_by_identifier(&self.pool, email).await? {
            if user.status == "active" {
                self.audit
                    .log_event(
                        &identity
                            .event(AuditAction::PasswordResetRequest, "auth")
                            .user(user.id)
                            .entity_id(user.id),
                    )
                    .await;
            }
        }
        Ok(())
    }

    pub async fn reset_password(&self, _token: &str, _password: &str) -> Result<(), AuthError> {
        Err(AuthError::NotImplemented)
    }

    /// Drop expired session rows; returns how many went. Runs from the
    /// maintenance loop.
    pub async fn purge_expired_sessions(&self) -> Result<u64, AuthError> {
        Ok(queries::purge_expired_sessions(&self.pool).await?)
    }

    /// Lockout thresholds prefer `system_settings` rows so operators can
    /// tune them at runtime; the config values are the fallback.
    async fn login_thresholds(&self) -> (i64, i64) {
        let max_attempts = match queries::get_setting(&self.pool, "max_login_attempts").await {
            Ok(Some(value)) => value.parse().unwrap_or(self.config.max_login_attempts),
            _ => self.config.max_login_attempts,
        };
        let lockout_secs = match queries::get_setting(&self.pool, "lockout_duration").await {
            Ok(Some(value)) => value.parse().unwrap_or(self.config.lockout_secs),
            _ => self.config.lockout_secs,
        };
        (max_attempts, lockout_secs)
    }

    /// Apply lock and suspension status before any password work. An
    /// expired lock resets the account and the refreshed row is used.
    async fn enforce_account_status(
        &self,
        identity: &RequestIdentity,
        user: User,
    ) -> Result<User, AuthError> {
        match user.status.as_str() {
            "locked" => {
                if lock_is_live(user.locked_until, Utc::now()) {
                    self.audit_login_failure(identity, &user.username, "account locked")
                        .await;
                    return Err(AuthError::AccountLocked);
                }
                queries::unlock_account(&self.pool, user.id).await?;
                let mut user = user;
                user.status = "active".to_string();
                user.login_attempts = 0;
                user.locked_until = None;
                Ok(user)
            }
            "suspended" => {
                self.audit_login_failure(identity, &user.username, "account suspended")
                    .await;
                Err(AuthError::AccountSuspended)
            }
            _ => Ok(user),
        }
    }

    async fn audit_login_failure(&self, identity: &RequestIdentity, subject: &str, reason: &str) {
        self.audit
            .log_event(
                &identity
                    .event(AuditAction::LoginFailed, "auth")
                    .result(AuditResult::Failed)
                    .details(serde_json::json!({ "identifier": subject, "reason": reason })),
            )
            .await;
    }
}

/// True when one more failure reaches the lockout threshold.
fn crosses_lockout_threshold(prior_attempts: i32, max_attempts: i64) -> bool {
    i64::from(prior_attempts) + 1 >= max_attempts
}

/// A lock holds until its expiry passes. A locked row without an expiry
/// counts as expired so an account can never be locked forever.
fn lock_is_live(
    locked_until: Option<chrono::DateTime<Utc>>,
    now: chrono::DateTime<Utc>,
) -> bool {
    locked_until.map(|until| until > now).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lockout_threshold_boundary() {
        // Five allowed attempts: the fifth failure locks.
        assert!(!crosses_lockout_threshold(3, 5));
        assert!(crosses_lockout_threshold(4, 5));
        assert!(crosses_lockout_threshold(9, 5));
        assert!(crosses_lockout_threshold(0, 1));
    }

    #[test]
    fn test_lock_expiry() {
        let now = Utc::now();
        assert!(lock_is_live(Some(now + Duration::seconds(60)), now));
        assert!(!lock_is_live(Some(now - Duration::seconds(1)), now));
        assert!(!lock_is_live(None, now));
    }
}
