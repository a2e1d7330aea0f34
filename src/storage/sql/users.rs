// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! User repository.
//!
//! Uniqueness of email and federated identity is enforced by the schema;
//! constraint violations come back as `AlreadyExists`. Deleting a user is a
//! single statement and the schema cascades it to every owned row.

use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::{StoreError, StoreResult};
use crate::models::{normalize_email, NewUser, User, UserId, UserUpdate, DEFAULT_LOCALE};
use crate::storage::records::UserRecord;

/// Map a unique violation on `users` to the column that caused it.
fn user_conflict(err: sqlx::Error, email: &str) -> StoreError {
    let federated = err
        .as_database_error()
        .is_some_and(|db| db.is_unique_violation() && db.message().contains("federated_id"));
    if federated {
        StoreError::already_exists("federated identity")
    } else {
        StoreError::from_db(err, format!("user with email {email}"))
    }
}

pub(super) struct UserRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> UserRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: NewUser) -> StoreResult<User> {
        let email = normalize_email(&new.email)?;
        let now = Utc::now();
        let record: UserRecord = sqlx::query_as(
            "INSERT INTO users \
             (email, name, password_hash, federated_id, locale, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(&email)
        .bind(&new.name)
        .bind(&new.password_hash)
        .bind(&new.federated_id)
        .bind(new.locale.as_deref().unwrap_or(DEFAULT_LOCALE))
        .bind(now)
        .bind(now)
        .fetch_one(self.pool)
        .await
        .map_err(|e| user_conflict(e, &email))?;
        Ok(record.into())
    }

    pub async fn get(&self, id: UserId) -> StoreResult<User> {
        sqlx::query_as::<_, UserRecord>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool)
            .await?
            .map(User::from)
            .ok_or_else(|| StoreError::not_found(format!("user {id}")))
    }

    pub async fn get_by_email(&self, email: &str) -> StoreResult<User> {
        let email = normalize_email(email)?;
        sqlx::query_as::<_, UserRecord>("SELECT * FROM users WHERE email = ?")
            .bind(&email)
            .fetch_optional(self.pool)
            .await?
            .map(User::from)
            .ok_or_else(|| StoreError::not_found(format!("user with email {email}")))
    }

    pub async fn get_by_federated_id(&self, federated_id: &str) -> StoreResult<User> {
        sqlx::query_as::<_, UserRecord>("SELECT * FROM users WHERE federated_id = ?")
            .bind(federated_id)
            .fetch_optional(self.pool)
            .await?
            .map(User::from)
            .ok_or_else(|| StoreError::not_found("user with federated identity"))
    }

    pub async fn update(&self, id: UserId, update: UserUpdate) -> StoreResult<User> {
        sqlx::query_as::<_, UserRecord>(
            "UPDATE users SET \
                name = COALESCE(?, name), \
                password_hash = COALESCE(?, password_hash), \
                locale = COALESCE(?, locale), \
                updated_at = ? \
             WHERE id = ? RETURNING *",
        )
        .bind(update.name)
        .bind(update.password_hash)
        .bind(update.locale)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(self.pool)
        .await?
        .map(User::from)
        .ok_or_else(|| StoreError::not_found(format!("user {id}")))
    }

    pub async fn link_federated_identity(
        &self,
        id: UserId,
        federated_id: &str,
    ) -> StoreResult<User> {
        sqlx::query_as::<_, UserRecord>(
            "UPDATE users SET federated_id = ?, updated_at = ? WHERE id = ? RETURNING *",
        )
        .bind(federated_id)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| StoreError::from_db(e, "federated identity"))?
        .map(User::from)
        .ok_or_else(|| StoreError::not_found(format!("user {id}")))
    }

    pub async fn delete(&self, id: UserId) -> StoreResult<()> {
        let deleted = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(StoreError::not_found(format!("user {id}")));
        }
        tracing::info!(user_id = id, "User and owned data deleted");
        Ok(())
    }
}
