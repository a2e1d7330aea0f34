// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Share link repository.
//!
//! Usage counting is a single conditional `UPDATE`, so concurrent openings
//! of a capped link can never push `usage_count` past `max_uses`.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::SqlitePool;

use super::{check_guardians_owned, claim_idempotency_key, insert_error, page_bounds};
use crate::crypto::tokens::generate_token;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    Created, NewShareLink, NewShareLinkAccess, ResourceType, ShareLink, ShareLinkAccess,
    ShareLinkId, ShareLinkUpdate, UserId,
};
use crate::storage::pagination::{Page, PageRequest};
use crate::storage::records::{dedup_ids, ShareLinkAccessRecord, ShareLinkRecord};
use crate::storage::{
    clean_categories, hash_optional_pin, replay_missing, require_text, validated_key,
};

pub(super) struct ShareLinkRepository<'a> {
    pool: &'a SqlitePool,
    max_page_limit: u32,
}

impl<'a> ShareLinkRepository<'a> {
    pub fn new(pool: &'a SqlitePool, max_page_limit: u32) -> Self {
        Self {
            pool,
            max_page_limit,
        }
    }

    async fn fetch(&self, owner: UserId, id: ShareLinkId) -> StoreResult<Option<ShareLinkRecord>> {
        Ok(
            sqlx::query_as("SELECT * FROM share_links WHERE id = ? AND user_id = ?")
                .bind(id)
                .bind(owner)
                .fetch_optional(self.pool)
                .await?,
        )
    }

    pub async fn create(
        &self,
        owner: UserId,
        new: NewShareLink,
        idempotency_key: Option<&str>,
    ) -> StoreResult<Created<ShareLink>> {
        require_text("name", &new.name)?;
        let key = validated_key(idempotency_key)?;
        let pin_hash = hash_optional_pin(new.pin.as_deref())?;
        let token = generate_token()?;
        let categories = clean_categories(new.categories);
        let guardian_ids = dedup_ids(new.guardian_ids);
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        let record: ShareLinkRecord = sqlx::query_as(
            "INSERT INTO share_links \
             (user_id, name, token, pin_hash, categories, guardian_ids, expires_at, \
              max_uses, usage_count, last_used_at, is_active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, 1, ?, ?) RETURNING *",
        )
        .bind(owner)
        .bind(&new.name)
        .bind(&token)
        .bind(pin_hash)
        .bind(Json(&categories))
        .bind(Json(&guardian_ids))
        .bind(new.expires_at)
        .bind(i64::from(new.max_uses))
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| insert_error(e, format!("user {owner}"), "share link token"))?;

        if let Some(key) = key {
            let claimed =
                claim_idempotency_key(&mut tx, owner, key, ResourceType::ShareLink, record.id, now)
                    .await?;
            if let Some(existing) = claimed {
                tx.rollback().await?;
                let record = self
                    .fetch(owner, existing)
                    .await?
                    .ok_or_else(|| replay_missing(ResourceType::ShareLink, existing))?;
                return Ok(Created::replayed(record.into()));
            }
        }

        check_guardians_owned(&mut tx, owner, &guardian_ids).await?;
        tx.commit().await?;
        Ok(Created::new(record.into()))
    }

    pub async fn get(&self, owner: UserId, id: ShareLinkId) -> StoreResult<ShareLink> {
        self.fetch(owner, id)
            .await?
            .map(ShareLink::from)
            .ok_or_else(|| StoreError::not_found(format!("share link {id}")))
    }

    /// Resolve an active link by token. Expiry and usage are not checked.
    pub async fn get_by_token(&self, token: &str) -> StoreResult<ShareLink> {
        sqlx::query_as::<_, ShareLinkRecord>(
            "SELECT * FROM share_links WHERE token = ? AND is_active = 1",
        )
        .bind(token)
        .fetch_optional(self.pool)
        .await?
        .map(ShareLink::from)
        .ok_or_else(|| StoreError::not_found("active share link for token"))
    }

    pub async fn list(&self, owner: UserId) -> StoreResult<Vec<ShareLink>> {
        let records: Vec<ShareLinkRecord> =
            sqlx::query_as("SELECT * FROM share_links WHERE user_id = ? ORDER BY id DESC")
                .bind(owner)
                .fetch_all(self.pool)
                .await?;
        Ok(records.into_iter().map(ShareLink::from).collect())
    }

    pub async fn list_paginated(
        &self,
        owner: UserId,
        page: PageRequest,
    ) -> StoreResult<Page<ShareLink>> {
        let (limit, cursor, fetch) = page_bounds(&page, self.max_page_limit);
        let rows: Vec<ShareLinkRecord> = sqlx::query_as(
            "SELECT * FROM share_links WHERE user_id = ? AND id < ? ORDER BY id DESC LIMIT ?",
        )
        .bind(owner)
        .bind(cursor)
        .bind(fetch)
        .fetch_all(self.pool)
        .await?;
        Ok(Page::from_rows(rows, limit, |r| r.id).map(ShareLink::from))
    }

    pub async fn update(
        &self,
        owner: UserId,
        id: ShareLinkId,
        update: ShareLinkUpdate,
    ) -> StoreResult<ShareLink> {
        if let Some(name) = &update.name {
            require_text("name", name)?;
        }
        let categories = update.categories.map(clean_categories);
        let (set_expiry, expires_at) = match update.expires_at {
            Some(expiry) => (true, expiry),
            None => (false, None),
        };

        sqlx::query_as::<_, ShareLinkRecord>(
            "UPDATE share_links SET \
                name = COALESCE(?, name), \
                categories = COALESCE(?, categories), \
                expires_at = CASE WHEN ? THEN ? ELSE expires_at END, \
                max_uses = COALESCE(?, max_uses), \
                is_active = COALESCE(?, is_active), \
                updated_at = ? \
             WHERE id = ? AND user_id = ? RETURNING *",
        )
        .bind(update.name)
        .bind(categories.as_ref().map(Json))
        .bind(set_expiry)
        .bind(expires_at)
        .bind(update.max_uses.map(i64::from))
        .bind(update.is_active)
        .bind(Utc::now())
        .bind(id)
        .bind(owner)
        .fetch_optional(self.pool)
        .await?
        .map(ShareLink::from)
        .ok_or_else(|| StoreError::not_found(format!("share link {id}")))
    }

    pub async fn delete(&self, owner: UserId, id: ShareLinkId) -> StoreResult<()> {
        let deleted = sqlx::query("DELETE FROM share_links WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(owner)
            .execute(self.pool)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(StoreError::not_found(format!("share link {id}")));
        }
        Ok(())
    }

    /// Count one use, refusing inactive links and links at their cap.
    pub async fn increment_usage(&self, id: ShareLinkId, now: DateTime<Utc>) -> StoreResult<ShareLink> {
        let updated: Option<ShareLinkRecord> = sqlx::query_as(
            "UPDATE share_links SET usage_count = usage_count + 1, last_used_at = ? \
             WHERE id = ? AND is_active = 1 AND (max_uses = 0 OR usage_count < max_uses) \
             RETURNING *",
        )
        .bind(now)
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        if let Some(record) = updated {
            return Ok(record.into());
        }

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM share_links WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool)
            .await?;
        Err(match exists {
            Some(_) => StoreError::invalid(format!("share link {id} is not accepting further uses")),
            None => StoreError::not_found(format!("share link {id}")),
        })
    }

    pub async fn record_access(
        &self,
        id: ShareLinkId,
        access: NewShareLinkAccess,
    ) -> StoreResult<ShareLinkAccess> {
        let record: ShareLinkAccessRecord = sqlx::query_as(
            "INSERT INTO share_link_accesses \
             (share_link_id, guardian_id, ip_address, user_agent, accessed_at) \
             VALUES (?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(id)
        .bind(access.guardian_id)
        .bind(access.ip_address)
        .bind(access.user_agent)
        .bind(Utc::now())
        .fetch_one(self.pool)
        .await
        .map_err(|e| insert_error(e, format!("share link {id}"), "share link access"))?;
        Ok(record.into())
    }

    /// Access log of an owned link, newest first.
    pub async fn list_accesses(
        &self,
        owner: UserId,
        id: ShareLinkId,
    ) -> StoreResult<Vec<ShareLinkAccess>> {
        if self.fetch(owner, id).await?.is_none() {
            return Err(StoreError::not_found(format!("share link {id}")));
        }
        let records: Vec<ShareLinkAccessRecord> = sqlx::query_as(
            "SELECT * FROM share_link_accesses WHERE share_link_id = ? ORDER BY id DESC",
        )
        .bind(id)
        .fetch_all(self.pool)
        .await?;
        Ok(records.into_iter().map(ShareLinkAccess::from).collect())
    }
}
