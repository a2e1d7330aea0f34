// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Box item repository.

use chrono::Utc;
use sqlx::types::Json;
use sqlx::SqlitePool;

use super::{check_guardians_owned, claim_idempotency_key, insert_error, page_bounds};
use crate::crypto::SensitiveCodec;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    BoxItem, BoxItemSummary, BoxItemUpdate, Created, ItemId, NewBoxItem, ResourceType,
    ShareScope, UserId,
};
use crate::storage::pagination::{Page, PageRequest};
use crate::storage::records::{dedup_ids, BoxItemRecord, SealedItemText};
use crate::storage::{replay_missing, require_text, validated_key};

pub(super) struct BoxItemRepository<'a> {
    pool: &'a SqlitePool,
    codec: &'a SensitiveCodec,
    max_page_limit: u32,
}

impl<'a> BoxItemRepository<'a> {
    pub fn new(pool: &'a SqlitePool, codec: &'a SensitiveCodec, max_page_limit: u32) -> Self {
        Self {
            pool,
            codec,
            max_page_limit,
        }
    }

    async fn fetch(&self, owner: UserId, id: ItemId) -> StoreResult<Option<BoxItemRecord>> {
        Ok(
            sqlx::query_as("SELECT * FROM box_items WHERE id = ? AND user_id = ?")
                .bind(id)
                .bind(owner)
                .fetch_optional(self.pool)
                .await?,
        )
    }

    /// Insert an item, replaying the earlier one when the idempotency key
    /// is already taken.
    ///
    /// The row is written first so the transaction holds the write lock from
    /// its first statement; validation failures roll it back.
    pub async fn create(
        &self,
        owner: UserId,
        new: NewBoxItem,
        idempotency_key: Option<&str>,
    ) -> StoreResult<Created<BoxItem>> {
        require_text("title", &new.title)?;
        let key = validated_key(idempotency_key)?;
        let sealed = SealedItemText::seal_new(self.codec, &new)?;
        let guardian_ids = dedup_ids(new.guardian_ids);
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        let record: BoxItemRecord = sqlx::query_as(
            "INSERT INTO box_items \
             (user_id, title, content, recipient, category, item_type, \
              is_important, is_shared, guardian_ids, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(owner)
        .bind(sealed.title.unwrap_or_default())
        .bind(sealed.content.unwrap_or_default())
        .bind(sealed.recipient.unwrap_or_default())
        .bind(&new.category)
        .bind(&new.item_type)
        .bind(new.is_important)
        .bind(new.is_shared)
        .bind(Json(&guardian_ids))
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| insert_error(e, format!("user {owner}"), "box item"))?;

        if let Some(key) = key {
            let claimed =
                claim_idempotency_key(&mut tx, owner, key, ResourceType::BoxItem, record.id, now)
                    .await?;
            if let Some(existing) = claimed {
                tx.rollback().await?;
                let record = self
                    .fetch(owner, existing)
                    .await?
                    .ok_or_else(|| replay_missing(ResourceType::BoxItem, existing))?;
                return Ok(Created::replayed(record.open(self.codec)));
            }
        }

        check_guardians_owned(&mut tx, owner, &guardian_ids).await?;
        tx.commit().await?;
        Ok(Created::new(record.open(self.codec)))
    }

    pub async fn get(&self, owner: UserId, id: ItemId) -> StoreResult<BoxItem> {
        self.fetch(owner, id)
            .await?
            .map(|r| r.open(self.codec))
            .ok_or_else(|| StoreError::not_found(format!("box item {id}")))
    }

    pub async fn list(&self, owner: UserId) -> StoreResult<Vec<BoxItemSummary>> {
        let records: Vec<BoxItemRecord> =
            sqlx::query_as("SELECT * FROM box_items WHERE user_id = ? ORDER BY id DESC")
                .bind(owner)
                .fetch_all(self.pool)
                .await?;
        Ok(records
            .into_iter()
            .map(|r| r.open_summary(self.codec))
            .collect())
    }

    pub async fn list_paginated(
        &self,
        owner: UserId,
        page: PageRequest,
    ) -> StoreResult<Page<BoxItemSummary>> {
        let (limit, cursor, fetch) = page_bounds(&page, self.max_page_limit);
        let rows: Vec<BoxItemRecord> = sqlx::query_as(
            "SELECT * FROM box_items WHERE user_id = ? AND id < ? ORDER BY id DESC LIMIT ?",
        )
        .bind(owner)
        .bind(cursor)
        .bind(fetch)
        .fetch_all(self.pool)
        .await?;
        Ok(Page::from_rows(rows, limit, |r| r.id).map(|r| r.open_summary(self.codec)))
    }

    pub async fn count(&self, owner: UserId) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM box_items WHERE user_id = ?")
            .bind(owner)
            .fetch_one(self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn update(
        &self,
        owner: UserId,
        id: ItemId,
        update: BoxItemUpdate,
    ) -> StoreResult<BoxItem> {
        if let Some(title) = &update.title {
            require_text("title", title)?;
        }
        let sealed = SealedItemText::seal_update(self.codec, &update)?;
        let guardian_ids = update.guardian_ids.map(dedup_ids);

        let mut tx = self.pool.begin().await?;
        let record: BoxItemRecord = sqlx::query_as(
            "UPDATE box_items SET \
                title = COALESCE(?, title), \
                content = COALESCE(?, content), \
                recipient = COALESCE(?, recipient), \
                category = COALESCE(?, category), \
                item_type = COALESCE(?, item_type), \
                is_important = COALESCE(?, is_important), \
                is_shared = COALESCE(?, is_shared), \
                guardian_ids = COALESCE(?, guardian_ids), \
                updated_at = ? \
             WHERE id = ? AND user_id = ? RETURNING *",
        )
        .bind(sealed.title)
        .bind(sealed.content)
        .bind(sealed.recipient)
        .bind(update.category)
        .bind(update.item_type)
        .bind(update.is_important)
        .bind(update.is_shared)
        .bind(guardian_ids.as_ref().map(Json))
        .bind(Utc::now())
        .bind(id)
        .bind(owner)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::not_found(format!("box item {id}")))?;

        if let Some(ids) = &guardian_ids {
            check_guardians_owned(&mut tx, owner, ids).await?;
        }
        tx.commit().await?;
        Ok(record.open(self.codec))
    }

    pub async fn delete(&self, owner: UserId, id: ItemId) -> StoreResult<()> {
        let deleted = sqlx::query("DELETE FROM box_items WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(owner)
            .execute(self.pool)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(StoreError::not_found(format!("box item {id}")));
        }
        Ok(())
    }

    /// Shared items visible under `scope`, newest first.
    pub async fn list_shared(&self, owner: UserId, scope: &ShareScope) -> StoreResult<Vec<BoxItem>> {
        let records: Vec<BoxItemRecord> = sqlx::query_as(
            "SELECT * FROM box_items WHERE user_id = ? AND is_shared = 1 ORDER BY id DESC",
        )
        .bind(owner)
        .fetch_all(self.pool)
        .await?;
        Ok(records
            .into_iter()
            .filter(|r| scope.admits(&r.category, r.is_shared, &r.guardian_ids))
            .map(|r| r.open(self.codec))
            .collect())
    }
}
