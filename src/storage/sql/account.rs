// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-account state: idempotency keys, password reset tokens, emergency
//! protocol, settings and guide progress.
//!
//! Emergency protocol and settings rows are materialized with defaults the
//! first time they are read.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use super::{claim_idempotency_key, insert_error};
use crate::crypto::tokens::hash_reset_token;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    validate_idempotency_key, EmergencyProtocol, GuideProgress, IdempotencyOutcome,
    IdempotencyRecord, PasswordResetToken, ResourceType, SettingsUpdate, UserId, UserSettings,
};
use crate::storage::records::{
    EmergencyRecord, GuideProgressRecord, IdempotencyKeyRecord, PasswordResetRecord,
    SettingsRecord,
};
use crate::storage::{require_text, validate_step_key};

pub(super) struct AccountRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> AccountRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    // ---- idempotency ----------------------------------------------------

    pub async fn register_idempotency_key(
        &self,
        owner: UserId,
        key: &str,
        resource_type: ResourceType,
        resource_id: i64,
    ) -> StoreResult<IdempotencyOutcome> {
        let key = validate_idempotency_key(key)?;
        let mut conn = self.pool.acquire().await?;
        let claimed =
            claim_idempotency_key(&mut conn, owner, key, resource_type, resource_id, Utc::now())
                .await?;
        Ok(match claimed {
            None => IdempotencyOutcome::Registered,
            Some(resource_id) => IdempotencyOutcome::Existing { resource_id },
        })
    }

    pub async fn get_idempotency_key(
        &self,
        owner: UserId,
        key: &str,
        resource_type: ResourceType,
    ) -> StoreResult<Option<IdempotencyRecord>> {
        let key = validate_idempotency_key(key)?;
        sqlx::query_as::<_, IdempotencyKeyRecord>(
            "SELECT * FROM idempotency_keys \
             WHERE user_id = ? AND idempotency_key = ? AND resource_type = ?",
        )
        .bind(owner)
        .bind(key)
        .bind(resource_type.as_str())
        .fetch_optional(self.pool)
        .await?
        .map(IdempotencyRecord::try_from)
        .transpose()
    }

    pub async fn delete_idempotency_key(
        &self,
        owner: UserId,
        key: &str,
        resource_type: ResourceType,
    ) -> StoreResult<bool> {
        let key = validate_idempotency_key(key)?;
        let deleted = sqlx::query(
            "DELETE FROM idempotency_keys \
             WHERE user_id = ? AND idempotency_key = ? AND resource_type = ?",
        )
        .bind(owner)
        .bind(key)
        .bind(resource_type.as_str())
        .execute(self.pool)
        .await?
        .rows_affected();
        Ok(deleted > 0)
    }

    // ---- password reset -------------------------------------------------

    /// Store a reset token. Only its SHA-256 digest is persisted.
    pub async fn create_password_reset_token(
        &self,
        user_id: UserId,
        raw_token: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<PasswordResetToken> {
        require_text("reset token", raw_token)?;
        let record: PasswordResetRecord = sqlx::query_as(
            "INSERT INTO password_reset_tokens (user_id, token_hash, expires_at, used_at, created_at) \
             VALUES (?, ?, ?, NULL, ?) RETURNING *",
        )
        .bind(user_id)
        .bind(hash_reset_token(raw_token))
        .bind(expires_at)
        .bind(Utc::now())
        .fetch_one(self.pool)
        .await
        .map_err(|e| insert_error(e, format!("user {user_id}"), "password reset token"))?;
        Ok(record.into())
    }

    pub async fn get_password_reset_token(&self, raw_token: &str) -> StoreResult<PasswordResetToken> {
        sqlx::query_as::<_, PasswordResetRecord>(
            "SELECT * FROM password_reset_tokens WHERE token_hash = ?",
        )
        .bind(hash_reset_token(raw_token))
        .fetch_optional(self.pool)
        .await?
        .map(PasswordResetToken::from)
        .ok_or_else(|| StoreError::not_found("password reset token"))
    }

    pub async fn mark_password_reset_token_used(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<PasswordResetToken> {
        let updated: Option<PasswordResetRecord> = sqlx::query_as(
            "UPDATE password_reset_tokens SET used_at = ? \
             WHERE id = ? AND used_at IS NULL RETURNING *",
        )
        .bind(now)
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        if let Some(record) = updated {
            return Ok(record.into());
        }
        let exists: Option<i64> =
            sqlx::query_scalar("SELECT id FROM password_reset_tokens WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool)
                .await?;
        Err(match exists {
            Some(_) => StoreError::invalid("password reset token already used"),
            None => StoreError::not_found(format!("password reset token {id}")),
        })
    }

    pub async fn delete_password_reset_tokens(&self, user_id: UserId) -> StoreResult<u64> {
        Ok(
            sqlx::query("DELETE FROM password_reset_tokens WHERE user_id = ?")
                .bind(user_id)
                .execute(self.pool)
                .await?
                .rows_affected(),
        )
    }

    // ---- emergency protocol ---------------------------------------------

    async fn materialize_emergency(
        conn: &mut SqliteConnection,
        owner: UserId,
        now: DateTime<Utc>,
    ) -> StoreResult<EmergencyProtocol> {
        let fresh = EmergencyProtocol::inactive(owner, now);
        sqlx::query(
            "INSERT INTO emergency_protocols \
             (user_id, is_active, activated_at, deactivated_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(owner)
        .bind(fresh.is_active)
        .bind(fresh.activated_at)
        .bind(fresh.deactivated_at)
        .bind(fresh.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| insert_error(e, format!("user {owner}"), "emergency protocol"))?;

        let record: EmergencyRecord =
            sqlx::query_as("SELECT * FROM emergency_protocols WHERE user_id = ?")
                .bind(owner)
                .fetch_one(&mut *conn)
                .await?;
        Ok(record.into())
    }

    pub async fn get_emergency_protocol(&self, owner: UserId) -> StoreResult<EmergencyProtocol> {
        let mut conn = self.pool.acquire().await?;
        Self::materialize_emergency(&mut conn, owner, Utc::now()).await
    }

    pub async fn set_emergency_protocol(
        &self,
        owner: UserId,
        active: bool,
    ) -> StoreResult<EmergencyProtocol> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut protocol = Self::materialize_emergency(&mut tx, owner, now).await?;
        protocol.toggle(active, now);

        sqlx::query(
            "UPDATE emergency_protocols \
             SET is_active = ?, activated_at = ?, deactivated_at = ?, updated_at = ? \
             WHERE user_id = ?",
        )
        .bind(protocol.is_active)
        .bind(protocol.activated_at)
        .bind(protocol.deactivated_at)
        .bind(protocol.updated_at)
        .bind(owner)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(user_id = owner, active, "Emergency protocol updated");
        Ok(protocol)
    }

    // ---- settings -------------------------------------------------------

    async fn materialize_settings(
        conn: &mut SqliteConnection,
        owner: UserId,
        now: DateTime<Utc>,
    ) -> StoreResult<UserSettings> {
        let defaults = UserSettings::defaults(owner, now);
        sqlx::query(
            "INSERT INTO user_settings \
             (user_id, theme, notifications_enabled, reminder_interval_days, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(owner)
        .bind(&defaults.theme)
        .bind(defaults.notifications_enabled)
        .bind(i64::from(defaults.reminder_interval_days))
        .bind(defaults.created_at)
        .bind(defaults.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| insert_error(e, format!("user {owner}"), "user settings"))?;

        let record: SettingsRecord = sqlx::query_as("SELECT * FROM user_settings WHERE user_id = ?")
            .bind(owner)
            .fetch_one(&mut *conn)
            .await?;
        Ok(record.into())
    }

    pub async fn get_settings(&self, owner: UserId) -> StoreResult<UserSettings> {
        let mut conn = self.pool.acquire().await?;
        Self::materialize_settings(&mut conn, owner, Utc::now()).await
    }

    pub async fn update_settings(
        &self,
        owner: UserId,
        update: SettingsUpdate,
    ) -> StoreResult<UserSettings> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut settings = Self::materialize_settings(&mut tx, owner, now).await?;
        settings.apply(update, now);

        sqlx::query(
            "UPDATE user_settings \
             SET theme = ?, notifications_enabled = ?, reminder_interval_days = ?, updated_at = ? \
             WHERE user_id = ?",
        )
        .bind(&settings.theme)
        .bind(settings.notifications_enabled)
        .bind(i64::from(settings.reminder_interval_days))
        .bind(settings.updated_at)
        .bind(owner)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(settings)
    }

    // ---- guide progress -------------------------------------------------

    /// Record a completed step. Marking a step twice keeps the first record.
    pub async fn mark_guide_step(&self, owner: UserId, step_key: &str) -> StoreResult<GuideProgress> {
        let step_key = validate_step_key(step_key)?;
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            "INSERT INTO guide_progress (user_id, step_key, completed_at) VALUES (?, ?, ?) \
             ON CONFLICT(user_id, step_key) DO NOTHING",
        )
        .bind(owner)
        .bind(step_key)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| insert_error(e, format!("user {owner}"), "guide step"))?;

        let record: GuideProgressRecord =
            sqlx::query_as("SELECT * FROM guide_progress WHERE user_id = ? AND step_key = ?")
                .bind(owner)
                .bind(step_key)
                .fetch_one(&mut *conn)
                .await?;
        Ok(record.into())
    }

    /// Completed steps in completion order.
    pub async fn list_guide_progress(&self, owner: UserId) -> StoreResult<Vec<GuideProgress>> {
        let records: Vec<GuideProgressRecord> =
            sqlx::query_as("SELECT * FROM guide_progress WHERE user_id = ? ORDER BY id ASC")
                .bind(owner)
                .fetch_all(self.pool)
                .await?;
        Ok(records.into_iter().map(GuideProgress::from).collect())
    }
}
