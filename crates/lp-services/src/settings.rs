//! Panel-wide settings stored in `system_settings`.
//!
//! The API only updates keys the installer seeded; values are checked
//! against the row's declared type before the upsert so a typo cannot
//! wedge a consumer that parses the value later.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use sqlx::MySqlPool;
use thiserror::Error;
use tracing::info;

use lp_core::security::audit::{AuditAction, AuditLogger};
use lp_db::models::SettingRow;
use lp_db::queries;
use lp_db::DbError;

use crate::context::RequestIdentity;

const MAX_VALUE_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("{0}")]
    Validation(String),
    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

#[derive(Debug, Serialize)]
pub struct SettingsList {
    pub settings: Vec<SettingRow>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct UpdatedSettings {
    pub updated: Vec<String>,
}

pub struct SettingsService {
    pool: MySqlPool,
    audit: Arc<dyn AuditLogger>,
}

impl SettingsService {
    pub fn new(pool: MySqlPool, audit: Arc<dyn AuditLogger>) -> Self {
        Self { pool, audit }
    }

    pub async fn list(&self) -> Result<SettingsList, SettingsError> {
        let settings = queries::list_settings(&self.pool).await?;
        let total = settings.len();
        Ok(SettingsList { settings, total })
    }

    /// Apply a batch of key/value updates. Unknown keys are rejected
    /// before anything is written.
    pub async fn update(
        &self,
        identity: &RequestIdentity,
        updates: &BTreeMap<String, String>,
    ) -> Result<UpdatedSettings, SettingsError> {
        if updates.is_empty() {
            return Err(SettingsError::Validation(
                "No settings to update".to_string(),
            ));
        }

        let existing = queries::list_settings(&self.pool).await?;
        let by_key: BTreeMap<&str, &SettingRow> = existing
            .iter()
            .map(|row| (row.setting_key.as_str(), row))
            .collect();

        for (key, value) in updates {
            let row = by_key.get(key.as_str()).ok_or_else(|| {
                SettingsError::Validation(format!("Unknown setting: {key}"))
            })?;
            validate_value(&row.setting_type, key, value)?;
        }

        let mut updated = Vec::with_capacity(updates.len());
        for (key, value) in updates {
            queries::upsert_setting(&self.pool, key, value).await?;
            updated.push(key.clone());
        }

        info!(count = updated.len(), "Updated panel settings");
        self.audit
            .log_event(
                &identity
                    .event(AuditAction::SettingsUpdate, "settings")
                    .details(serde_json::json!({ "updated": updated })),
            )
            .await;

        Ok(UpdatedSettings { updated })
    }
}

fn validate_value(setting_type: &str, key: &str, value: &str) -> Result<(), SettingsError> {
    if value.len() > MAX_VALUE_LEN {
        return Err(SettingsError::Validation(format!(
            "Value for '{key}' is too long"
        )));
    }
    match setting_type {
        "number" => {
            let parsed: i64 = value.parse().map_err(|_| {
                SettingsError::Validation(format!("Setting '{key}' requires a numeric value"))
            })?;
            if parsed < 0 {
                return Err(SettingsError::Validation(format!(
                    "Setting '{key}' must not be negative"
                )));
            }
        }
        "boolean" => {
            if !matches!(value, "0" | "1" | "true" | "false") {
                return Err(SettingsError::Validation(format!(
                    "Setting '{key}' requires a boolean value"
                )));
            }
        }
        "json" => {
            serde_json::from_str::<serde_json::Value>(value).map_err(|_| {
                SettingsError::Validation(format!("Setting '{key}' requires valid JSON"))
            })?;
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_number_values() {
        assert!(validate_value("number", "session_lifetime", "7200").is_ok());
        assert!(validate_value("number", "session_lifetime", "abc").is_err());
        assert!(validate_value("number", "session_lifetime", "-5").is_err());
    }

    #[test]
    fn test_validate_boolean_values() {
        for ok in ["0", "1", "true", "false"] {
            assert!(validate_value("boolean", "enable_monitoring", ok).is_ok());
        }
        assert!(validate_value("boolean", "enable_monitoring", "yes").is_err());
    }

    #[test]
    fn test_validate_json_and_text() {
        assert!(validate_value("json", "extra", "{\"a\":1}").is_ok());
        assert!(validate_value("json", "extra", "{broken").is_err());
        assert!(validate_value("text", "panel_theme", "dark").is_ok());
        assert!(validate_value("text", "panel_theme", &"x".repeat(300)).is_err());
    }
}
