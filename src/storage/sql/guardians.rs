// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Guardian repository.
//!
//! Every guardian handed out passes through the [`AccessTokenManager`], so
//! rows still holding a missing or legacy access token are upgraded on read.

use chrono::Utc;
use sqlx::SqlitePool;

use super::{claim_idempotency_key, insert_error, page_bounds};
use crate::crypto::tokens::{generate_token, is_legacy_token};
use crate::crypto::SensitiveCodec;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    Created, Guardian, GuardianId, GuardianUpdate, NewGuardian, ResourceType, UserId,
};
use crate::storage::pagination::{Page, PageRequest};
use crate::storage::records::{GuardianRecord, SealedGuardianText};
use crate::storage::token_repair::AccessTokenManager;
use crate::storage::{hash_optional_pin, replay_missing, require_text, validated_key};

pub(super) struct GuardianRepository<'a> {
    pool: &'a SqlitePool,
    codec: &'a SensitiveCodec,
    tokens: &'a AccessTokenManager,
    max_page_limit: u32,
}

impl<'a> GuardianRepository<'a> {
    pub fn new(
        pool: &'a SqlitePool,
        codec: &'a SensitiveCodec,
        tokens: &'a AccessTokenManager,
        max_page_limit: u32,
    ) -> Self {
        Self {
            pool,
            codec,
            tokens,
            max_page_limit,
        }
    }

    fn open(&self, record: GuardianRecord) -> StoreResult<Guardian> {
        let mut guardian = record.open(self.codec);
        self.tokens.ensure_current(&mut guardian)?;
        Ok(guardian)
    }

    fn open_all(&self, records: Vec<GuardianRecord>) -> StoreResult<Vec<Guardian>> {
        records.into_iter().map(|r| self.open(r)).collect()
    }

    async fn fetch(&self, owner: UserId, id: GuardianId) -> StoreResult<Option<GuardianRecord>> {
        Ok(
            sqlx::query_as("SELECT * FROM guardians WHERE id = ? AND user_id = ?")
                .bind(id)
                .bind(owner)
                .fetch_optional(self.pool)
                .await?,
        )
    }

    pub async fn create(
        &self,
        owner: UserId,
        new: NewGuardian,
        idempotency_key: Option<&str>,
    ) -> StoreResult<Created<Guardian>> {
        require_text("name", &new.name)?;
        let key = validated_key(idempotency_key)?;
        let sealed = SealedGuardianText::seal_new(self.codec, &new)?;
        let pin_hash = hash_optional_pin(new.pin.as_deref())?;
        let token = generate_token()?;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        let record: GuardianRecord = sqlx::query_as(
            "INSERT INTO guardians \
             (user_id, name, email, phone, notes, relationship, access_token, pin_hash, \
              created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(owner)
        .bind(sealed.name.unwrap_or_default())
        .bind(sealed.email.unwrap_or_default())
        .bind(sealed.phone.unwrap_or_default())
        .bind(sealed.notes.unwrap_or_default())
        .bind(&new.relationship)
        .bind(&token)
        .bind(pin_hash)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| insert_error(e, format!("user {owner}"), "guardian access token"))?;

        if let Some(key) = key {
            let claimed =
                claim_idempotency_key(&mut tx, owner, key, ResourceType::Guardian, record.id, now)
                    .await?;
            if let Some(existing) = claimed {
                tx.rollback().await?;
                let record = self
                    .fetch(owner, existing)
                    .await?
                    .ok_or_else(|| replay_missing(ResourceType::Guardian, existing))?;
                return Ok(Created::replayed(self.open(record)?));
            }
        }

        tx.commit().await?;
        Ok(Created::new(self.open(record)?))
    }

    pub async fn get(&self, owner: UserId, id: GuardianId) -> StoreResult<Guardian> {
        let record = self
            .fetch(owner, id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("guardian {id}")))?;
        self.open(record)
    }

    /// Resolve a capability token. Legacy-format tokens never authorize.
    pub async fn get_by_access_token(&self, token: &str) -> StoreResult<Guardian> {
        if is_legacy_token(token) {
            return Err(StoreError::not_found("guardian for access token"));
        }
        let record: GuardianRecord = sqlx::query_as("SELECT * FROM guardians WHERE access_token = ?")
            .bind(token)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("guardian for access token"))?;
        self.open(record)
    }

    pub async fn list(&self, owner: UserId) -> StoreResult<Vec<Guardian>> {
        let records: Vec<GuardianRecord> =
            sqlx::query_as("SELECT * FROM guardians WHERE user_id = ? ORDER BY id DESC")
                .bind(owner)
                .fetch_all(self.pool)
                .await?;
        self.open_all(records)
    }

    pub async fn list_paginated(
        &self,
        owner: UserId,
        page: PageRequest,
    ) -> StoreResult<Page<Guardian>> {
        let (limit, cursor, fetch) = page_bounds(&page, self.max_page_limit);
        let rows: Vec<GuardianRecord> = sqlx::query_as(
            "SELECT * FROM guardians WHERE user_id = ? AND id < ? ORDER BY id DESC LIMIT ?",
        )
        .bind(owner)
        .bind(cursor)
        .bind(fetch)
        .fetch_all(self.pool)
        .await?;

        let page = Page::from_rows(rows, limit, |r| r.id);
        Ok(Page {
            items: self.open_all(page.items)?,
            next_cursor: page.next_cursor,
            has_more: page.has_more,
        })
    }

    pub async fn count(&self, owner: UserId) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM guardians WHERE user_id = ?")
            .bind(owner)
            .fetch_one(self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn update(
        &self,
        owner: UserId,
        id: GuardianId,
        update: GuardianUpdate,
    ) -> StoreResult<Guardian> {
        if let Some(name) = &update.name {
            require_text("name", name)?;
        }
        let sealed = SealedGuardianText::seal_update(self.codec, &update)?;
        let record: GuardianRecord = sqlx::query_as(
            "UPDATE guardians SET \
                name = COALESCE(?, name), \
                email = COALESCE(?, email), \
                phone = COALESCE(?, phone), \
                notes = COALESCE(?, notes), \
                relationship = COALESCE(?, relationship), \
                updated_at = ? \
             WHERE id = ? AND user_id = ? RETURNING *",
        )
        .bind(sealed.name)
        .bind(sealed.email)
        .bind(sealed.phone)
        .bind(sealed.notes)
        .bind(update.relationship)
        .bind(Utc::now())
        .bind(id)
        .bind(owner)
        .fetch_optional(self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found(format!("guardian {id}")))?;
        self.open(record)
    }

    /// Set or clear (`None`) the guardian PIN.
    pub async fn set_pin(
        &self,
        owner: UserId,
        id: GuardianId,
        pin: Option<&str>,
    ) -> StoreResult<Guardian> {
        let pin_hash = hash_optional_pin(pin)?;
        let record: GuardianRecord = sqlx::query_as(
            "UPDATE guardians SET pin_hash = ?, updated_at = ? \
             WHERE id = ? AND user_id = ? RETURNING *",
        )
        .bind(pin_hash)
        .bind(Utc::now())
        .bind(id)
        .bind(owner)
        .fetch_optional(self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found(format!("guardian {id}")))?;
        self.open(record)
    }

    pub async fn rotate_token(&self, owner: UserId, id: GuardianId) -> StoreResult<Guardian> {
        let token = generate_token()?;
        let record: GuardianRecord = sqlx::query_as(
            "UPDATE guardians SET access_token = ?, updated_at = ? \
             WHERE id = ? AND user_id = ? RETURNING *",
        )
        .bind(&token)
        .bind(Utc::now())
        .bind(id)
        .bind(owner)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| StoreError::from_db(e, "guardian access token"))?
        .ok_or_else(|| StoreError::not_found(format!("guardian {id}")))?;
        self.tokens.forget(id);
        tracing::info!(guardian_id = id, user_id = owner, "Guardian access token rotated");
        self.open(record)
    }

    pub async fn delete(&self, owner: UserId, id: GuardianId) -> StoreResult<()> {
        let deleted = sqlx::query("DELETE FROM guardians WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(owner)
            .execute(self.pool)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(StoreError::not_found(format!("guardian {id}")));
        }
        self.tokens.forget(id);
        Ok(())
    }
}
