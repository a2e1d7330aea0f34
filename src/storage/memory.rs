// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-memory [`VaultStore`] for development and tests.
//!
//! Each entity lives in a flat arena keyed by id, with an owner index
//! pointing into it. All tables sit behind one `RwLock`: mutations take the
//! write half, reads share the read half. The lock is only held for map
//! operations; sealing, opening, PIN hashing and token generation happen
//! before or after it. Reads hand out clones, so callers can never alias
//! internal state.
//!
//! Records hold the same sealed column values the relational backend
//! persists.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::ownership::{OwnedResource, OwnershipCheck};
use super::pagination::{Page, PageRequest, DEFAULT_MAX_PAGE_LIMIT};
use super::records::{
    dedup_ids, BoxItemRecord, EmergencyRecord, GuardianRecord, GuideProgressRecord,
    PasswordResetRecord, SealedGuardianText, SealedItemText, SettingsRecord,
    ShareLinkAccessRecord, ShareLinkRecord, UserRecord,
};
use super::token_repair::{AccessTokenManager, TokenRepairSink};
use super::{
    clean_categories, hash_optional_pin, replay_missing, require_text, validate_step_key,
    validated_key, VaultStore,
};
use crate::crypto::tokens::{generate_token, hash_reset_token, is_legacy_token};
use crate::crypto::SensitiveCodec;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    normalize_email, validate_idempotency_key, BoxItem, BoxItemSummary, BoxItemUpdate, Created,
    EmergencyProtocol, Guardian, GuardianId, GuardianUpdate, GuideProgress, IdempotencyOutcome,
    IdempotencyRecord, ItemId, NewBoxItem, NewGuardian, NewShareLink, NewShareLinkAccess, NewUser,
    PasswordResetToken, ResourceType, SettingsUpdate, ShareLink, ShareLinkAccess, ShareLinkId,
    ShareLinkUpdate, ShareScope, User, UserId, UserSettings, UserUpdate, DEFAULT_LOCALE,
};

// =============================================================================
// Arena
// =============================================================================

/// Flat id-keyed table with an owner index.
struct Arena<T> {
    next_id: i64,
    rows: BTreeMap<i64, T>,
    by_owner: HashMap<UserId, BTreeSet<i64>>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            rows: BTreeMap::new(),
            by_owner: HashMap::new(),
        }
    }
}

impl<T: OwnedResource + Clone> Arena<T> {
    /// Ids are never reused, even after deletes.
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn insert(&mut self, id: i64, row: T) {
        self.by_owner.entry(row.owner_id()).or_default().insert(id);
        self.rows.insert(id, row);
    }

    fn get(&self, owner: UserId, id: i64) -> Option<&T> {
        self.rows.get(&id).filter(|row| row.owner_id() == owner)
    }

    fn get_mut(&mut self, owner: UserId, id: i64) -> Option<&mut T> {
        self.rows.get_mut(&id).filter(|row| row.owner_id() == owner)
    }

    fn remove(&mut self, owner: UserId, id: i64) -> Option<T> {
        self.get(owner, id)?;
        if let Some(ids) = self.by_owner.get_mut(&owner) {
            ids.remove(&id);
        }
        self.rows.remove(&id)
    }

    /// Owner's rows, newest first.
    fn owned_desc(&self, owner: UserId) -> impl Iterator<Item = &T> + '_ {
        self.by_owner
            .get(&owner)
            .into_iter()
            .flat_map(|ids| ids.iter().rev())
            .filter_map(|id| self.rows.get(id))
    }

    /// Up to `take` rows with id strictly below `cursor`, newest first.
    fn page(&self, owner: UserId, cursor: Option<i64>, take: usize) -> Vec<T> {
        let Some(ids) = self.by_owner.get(&owner) else {
            return Vec::new();
        };
        let upper = cursor.unwrap_or(i64::MAX);
        ids.range(..upper)
            .rev()
            .take(take)
            .filter_map(|id| self.rows.get(id).cloned())
            .collect()
    }

    fn count(&self, owner: UserId) -> u64 {
        self.by_owner.get(&owner).map_or(0, |ids| ids.len() as u64)
    }

    /// Remove every row of `owner`, returning the removed rows.
    fn remove_owner(&mut self, owner: UserId) -> Vec<T> {
        let ids = self.by_owner.remove(&owner).unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.rows.remove(&id))
            .collect()
    }
}

impl OwnedResource for PasswordResetRecord {
    fn owner_id(&self) -> UserId {
        self.user_id
    }
}

impl OwnedResource for GuideProgressRecord {
    fn owner_id(&self) -> UserId {
        self.user_id
    }
}

type IdempotencyIndex = HashMap<(UserId, ResourceType, String), IdempotencyRecord>;

// =============================================================================
// Tables
// =============================================================================

#[derive(Default)]
struct Tables {
    next_user_id: i64,
    users: BTreeMap<UserId, UserRecord>,
    users_by_email: HashMap<String, UserId>,
    users_by_federated_id: HashMap<String, UserId>,

    items: Arena<BoxItemRecord>,

    guardians: Arena<GuardianRecord>,
    guardians_by_token: HashMap<String, GuardianId>,

    share_links: Arena<ShareLinkRecord>,
    share_links_by_token: HashMap<String, ShareLinkId>,
    next_access_id: i64,
    share_link_accesses: BTreeMap<i64, ShareLinkAccessRecord>,

    idempotency: IdempotencyIndex,

    reset_tokens: Arena<PasswordResetRecord>,
    reset_tokens_by_hash: HashMap<String, i64>,

    emergency: HashMap<UserId, EmergencyRecord>,
    settings: HashMap<UserId, SettingsRecord>,
    guide_progress: Arena<GuideProgressRecord>,
}

impl Tables {
    fn require_user(&self, id: UserId) -> StoreResult<&UserRecord> {
        self.users
            .get(&id)
            .ok_or_else(|| StoreError::not_found(format!("user {id}")))
    }

    fn check_guardians_owned(&self, owner: UserId, ids: &[GuardianId]) -> StoreResult<()> {
        match ids.iter().find(|id| self.guardians.get(owner, **id).is_none()) {
            Some(id) => Err(StoreError::invalid(format!(
                "guardian {id} does not belong to user {owner}"
            ))),
            None => Ok(()),
        }
    }

    fn idempotent_target(
        &self,
        owner: UserId,
        key: Option<&str>,
        resource_type: ResourceType,
    ) -> Option<i64> {
        let key = key?;
        self.idempotency
            .get(&(owner, resource_type, key.to_string()))
            .map(|record| record.resource_id)
    }

    fn register_key(
        &mut self,
        owner: UserId,
        key: Option<&str>,
        resource_type: ResourceType,
        resource_id: i64,
        now: DateTime<Utc>,
    ) {
        if let Some(key) = key {
            self.idempotency.insert(
                (owner, resource_type, key.to_string()),
                IdempotencyRecord {
                    user_id: owner,
                    key: key.to_string(),
                    resource_type,
                    resource_id,
                    created_at: now,
                },
            );
        }
    }

    fn set_guardian_token(&mut self, id: GuardianId, token: Option<String>) -> bool {
        let Some(row) = self.guardians.rows.get_mut(&id) else {
            return false;
        };
        if let Some(old) = row.access_token.take() {
            self.guardians_by_token.remove(&old);
        }
        if let Some(new) = &token {
            self.guardians_by_token.insert(new.clone(), id);
        }
        row.access_token = token;
        true
    }

    fn remove_share_link_accesses(&mut self, link_id: ShareLinkId) {
        self.share_link_accesses
            .retain(|_, access| access.share_link_id != link_id);
    }
}

// =============================================================================
// Token repair sink
// =============================================================================

struct MemoryTokenSink {
    tables: Arc<RwLock<Tables>>,
}

#[async_trait]
impl TokenRepairSink for MemoryTokenSink {
    async fn replace_access_token(
        &self,
        guardian_id: GuardianId,
        previous: Option<&str>,
        replacement: &str,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let current = match tables.guardians.rows.get(&guardian_id) {
            Some(row) => row.access_token.clone(),
            None => return Ok(false),
        };
        if current.as_deref() == Some(replacement) {
            return Ok(true);
        }
        if current.as_deref().filter(|t| !t.is_empty()) != previous {
            return Ok(false);
        }
        Ok(tables.set_guardian_token(guardian_id, Some(replacement.to_string())))
    }
}

// =============================================================================
// Store
// =============================================================================

/// Volatile [`VaultStore`] implementation.
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
    codec: SensitiveCodec,
    tokens: AccessTokenManager,
    max_page_limit: u32,
}

impl InMemoryStore {
    /// Create an empty store.
    ///
    /// Starts the token repair worker, so it must be called from within a
    /// Tokio runtime.
    pub fn new(codec: SensitiveCodec) -> Self {
        let tables = Arc::new(RwLock::new(Tables::default()));
        let tokens = AccessTokenManager::spawn(Arc::new(MemoryTokenSink {
            tables: tables.clone(),
        }));
        Self {
            tables,
            codec,
            tokens,
            max_page_limit: DEFAULT_MAX_PAGE_LIMIT,
        }
    }

    pub fn with_max_page_limit(mut self, max_page_limit: u32) -> Self {
        self.max_page_limit = max_page_limit;
        self
    }

    pub fn token_manager(&self) -> &AccessTokenManager {
        &self.tokens
    }

    fn open_guardian(&self, record: GuardianRecord) -> StoreResult<Guardian> {
        let mut guardian = record.open(&self.codec);
        self.tokens.ensure_current(&mut guardian)?;
        Ok(guardian)
    }

    fn open_guardians(&self, records: Vec<GuardianRecord>) -> StoreResult<Vec<Guardian>> {
        records
            .into_iter()
            .map(|record| self.open_guardian(record))
            .collect()
    }

    #[cfg(test)]
    pub(crate) async fn raw_item(&self, id: ItemId) -> Option<BoxItemRecord> {
        self.tables.read().await.items.rows.get(&id).cloned()
    }

    #[cfg(test)]
    pub(crate) async fn raw_guardian(&self, id: GuardianId) -> Option<GuardianRecord> {
        self.tables.read().await.guardians.rows.get(&id).cloned()
    }

    #[cfg(test)]
    pub(crate) async fn force_guardian_token(&self, id: GuardianId, token: Option<&str>) {
        self.tables
            .write()
            .await
            .set_guardian_token(id, token.map(str::to_string));
    }

    #[cfg(test)]
    pub(crate) async fn force_item_title(&self, id: ItemId, stored: &str) {
        if let Some(row) = self.tables.write().await.items.rows.get_mut(&id) {
            row.title = stored.to_string();
        }
    }

    #[cfg(test)]
    pub(crate) async fn rows_owned_by(&self, owner: UserId) -> u64 {
        let t = self.tables.read().await;
        let accesses = t
            .share_link_accesses
            .values()
            .filter(|a| t.share_links.rows.contains_key(&a.share_link_id))
            .filter(|a| t.share_links.rows[&a.share_link_id].user_id == owner)
            .count() as u64;
        t.items.count(owner)
            + t.guardians.count(owner)
            + t.share_links.count(owner)
            + accesses
            + t.idempotency.keys().filter(|(u, _, _)| *u == owner).count() as u64
            + t.reset_tokens.count(owner)
            + u64::from(t.emergency.contains_key(&owner))
            + u64::from(t.settings.contains_key(&owner))
            + t.guide_progress.count(owner)
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("encryption", &self.codec.is_enabled())
            .field("max_page_limit", &self.max_page_limit)
            .finish()
    }
}

#[async_trait]
impl VaultStore for InMemoryStore {
    // ---- users ----------------------------------------------------------

    async fn create_user(&self, new: NewUser) -> StoreResult<User> {
        let email = normalize_email(&new.email)?;
        let now = Utc::now();
        let mut t = self.tables.write().await;

        if t.users_by_email.contains_key(&email) {
            return Err(StoreError::already_exists(format!("user with email {email}")));
        }
        if let Some(fid) = &new.federated_id {
            if t.users_by_federated_id.contains_key(fid) {
                return Err(StoreError::already_exists("federated identity"));
            }
        }

        t.next_user_id += 1;
        let record = UserRecord {
            id: t.next_user_id,
            email: email.clone(),
            name: new.name,
            password_hash: new.password_hash,
            federated_id: new.federated_id,
            locale: new.locale.unwrap_or_else(|| DEFAULT_LOCALE.to_string()),
            created_at: now,
            updated_at: now,
        };
        t.users_by_email.insert(email, record.id);
        if let Some(fid) = &record.federated_id {
            t.users_by_federated_id.insert(fid.clone(), record.id);
        }
        t.users.insert(record.id, record.clone());
        Ok(record.into())
    }

    async fn get_user(&self, id: UserId) -> StoreResult<User> {
        let t = self.tables.read().await;
        Ok(t.require_user(id)?.clone().into())
    }

    async fn get_user_by_email(&self, email: &str) -> StoreResult<User> {
        let email = normalize_email(email)?;
        let t = self.tables.read().await;
        t.users_by_email
            .get(&email)
            .and_then(|id| t.users.get(id))
            .cloned()
            .map(User::from)
            .ok_or_else(|| StoreError::not_found(format!("user with email {email}")))
    }

    async fn get_user_by_federated_id(&self, federated_id: &str) -> StoreResult<User> {
        let t = self.tables.read().await;
        t.users_by_federated_id
            .get(federated_id)
            .and_then(|id| t.users.get(id))
            .cloned()
            .map(User::from)
            .ok_or_else(|| StoreError::not_found("user with federated identity"))
    }

    async fn update_user(&self, id: UserId, update: UserUpdate) -> StoreResult<User> {
        let mut t = self.tables.write().await;
        let row = t
            .users
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("user {id}")))?;
        if let Some(name) = update.name {
            row.name = name;
        }
        if let Some(hash) = update.password_hash {
            row.password_hash = Some(hash);
        }
        if let Some(locale) = update.locale {
            row.locale = locale;
        }
        row.updated_at = Utc::now();
        Ok(row.clone().into())
    }

    async fn link_federated_identity(&self, id: UserId, federated_id: &str) -> StoreResult<User> {
        let mut t = self.tables.write().await;
        t.require_user(id)?;
        match t.users_by_federated_id.get(federated_id) {
            Some(holder) if *holder != id => {
                return Err(StoreError::already_exists("federated identity"));
            }
            _ => {}
        }

        let previous = t.users.get(&id).and_then(|u| u.federated_id.clone());
        if let Some(previous) = previous {
            t.users_by_federated_id.remove(&previous);
        }
        t.users_by_federated_id.insert(federated_id.to_string(), id);

        let row = t
            .users
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("user {id}")))?;
        row.federated_id = Some(federated_id.to_string());
        row.updated_at = Utc::now();
        Ok(row.clone().into())
    }

    async fn delete_user(&self, id: UserId) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        let user = t
            .users
            .remove(&id)
            .ok_or_else(|| StoreError::not_found(format!("user {id}")))?;

        t.users_by_email.remove(&user.email);
        if let Some(fid) = &user.federated_id {
            t.users_by_federated_id.remove(fid);
        }

        t.items.remove_owner(id);
        for guardian in t.guardians.remove_owner(id) {
            if let Some(token) = guardian.access_token {
                t.guardians_by_token.remove(&token);
            }
        }
        for link in t.share_links.remove_owner(id) {
            t.share_links_by_token.remove(&link.token);
            t.remove_share_link_accesses(link.id);
        }
        t.idempotency.retain(|(owner, _, _), _| *owner != id);
        for token in t.reset_tokens.remove_owner(id) {
            t.reset_tokens_by_hash.remove(&token.token_hash);
        }
        t.emergency.remove(&id);
        t.settings.remove(&id);
        t.guide_progress.remove_owner(id);

        tracing::info!(user_id = id, "User and owned data deleted");
        Ok(())
    }

    // ---- box items ------------------------------------------------------

    async fn create_box_item(
        &self,
        owner: UserId,
        new: NewBoxItem,
        idempotency_key: Option<&str>,
    ) -> StoreResult<Created<BoxItem>> {
        require_text("title", &new.title)?;
        let key = validated_key(idempotency_key)?;
        let sealed = SealedItemText::seal_new(&self.codec, &new)?;
        let guardian_ids = dedup_ids(new.guardian_ids);
        let now = Utc::now();

        let (record, created) = {
            let mut t = self.tables.write().await;
            t.require_user(owner)?;

            if let Some(existing) = t.idempotent_target(owner, key, ResourceType::BoxItem) {
                let record = t
                    .items
                    .get(owner, existing)
                    .cloned()
                    .ok_or_else(|| replay_missing(ResourceType::BoxItem, existing))?;
                (record, false)
            } else {
                t.check_guardians_owned(owner, &guardian_ids)?;
                let id = t.items.allocate_id();
                let record = BoxItemRecord {
                    id,
                    user_id: owner,
                    title: sealed.title.unwrap_or_default(),
                    content: sealed.content.unwrap_or_default(),
                    recipient: sealed.recipient.unwrap_or_default(),
                    category: new.category,
                    item_type: new.item_type,
                    is_important: new.is_important,
                    is_shared: new.is_shared,
                    guardian_ids,
                    created_at: now,
                    updated_at: now,
                };
                t.items.insert(id, record.clone());
                t.register_key(owner, key, ResourceType::BoxItem, id, now);
                (record, true)
            }
        };

        let item = record.open(&self.codec);
        Ok(if created {
            Created::new(item)
        } else {
            Created::replayed(item)
        })
    }

    async fn get_box_item(&self, owner: UserId, id: ItemId) -> StoreResult<BoxItem> {
        let record = self
            .tables
            .read()
            .await
            .items
            .rows
            .get(&id)
            .cloned()
            .owned_by(owner, || format!("box item {id}"))?;
        Ok(record.open(&self.codec))
    }

    async fn list_box_items(&self, owner: UserId) -> StoreResult<Vec<BoxItemSummary>> {
        let records: Vec<BoxItemRecord> = {
            let t = self.tables.read().await;
            t.items.owned_desc(owner).cloned().collect()
        };
        Ok(records
            .into_iter()
            .map(|r| r.open_summary(&self.codec))
            .collect())
    }

    async fn list_box_items_paginated(
        &self,
        owner: UserId,
        page: PageRequest,
    ) -> StoreResult<Page<BoxItemSummary>> {
        let limit = page.effective_limit(self.max_page_limit);
        let rows = self
            .tables
            .read()
            .await
            .items
            .page(owner, page.cursor, limit as usize + 1);
        Ok(Page::from_rows(rows, limit, |r| r.id).map(|r| r.open_summary(&self.codec)))
    }

    async fn count_box_items(&self, owner: UserId) -> StoreResult<u64> {
        Ok(self.tables.read().await.items.count(owner))
    }

    async fn update_box_item(
        &self,
        owner: UserId,
        id: ItemId,
        update: BoxItemUpdate,
    ) -> StoreResult<BoxItem> {
        if let Some(title) = &update.title {
            require_text("title", title)?;
        }
        let sealed = SealedItemText::seal_update(&self.codec, &update)?;
        let update = BoxItemUpdate {
            guardian_ids: update.guardian_ids.map(dedup_ids),
            ..update
        };

        let record = {
            let mut t = self.tables.write().await;
            if let Some(ids) = &update.guardian_ids {
                t.items
                    .get(owner, id)
                    .ok_or_else(|| StoreError::not_found(format!("box item {id}")))?;
                t.check_guardians_owned(owner, ids)?;
            }
            let row = t
                .items
                .get_mut(owner, id)
                .ok_or_else(|| StoreError::not_found(format!("box item {id}")))?;
            row.apply(sealed, update, Utc::now());
            row.clone()
        };
        Ok(record.open(&self.codec))
    }

    async fn delete_box_item(&self, owner: UserId, id: ItemId) -> StoreResult<()> {
        self.tables
            .write()
            .await
            .items
            .remove(owner, id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(format!("box item {id}")))
    }

    async fn list_shared_box_items(
        &self,
        owner: UserId,
        scope: &ShareScope,
    ) -> StoreResult<Vec<BoxItem>> {
        let records: Vec<BoxItemRecord> = {
            let t = self.tables.read().await;
            t.items
                .owned_desc(owner)
                .filter(|r| scope.admits(&r.category, r.is_shared, &r.guardian_ids))
                .cloned()
                .collect()
        };
        Ok(records.into_iter().map(|r| r.open(&self.codec)).collect())
    }

    // ---- guardians ------------------------------------------------------

    async fn create_guardian(
        &self,
        owner: UserId,
        new: NewGuardian,
        idempotency_key: Option<&str>,
    ) -> StoreResult<Created<Guardian>> {
        require_text("name", &new.name)?;
        let key = validated_key(idempotency_key)?;
        let sealed = SealedGuardianText::seal_new(&self.codec, &new)?;
        let pin_hash = hash_optional_pin(new.pin.as_deref())?;
        let token = generate_token()?;
        let now = Utc::now();

        let (record, created) = {
            let mut t = self.tables.write().await;
            t.require_user(owner)?;

            if let Some(existing) = t.idempotent_target(owner, key, ResourceType::Guardian) {
                let record = t
                    .guardians
                    .get(owner, existing)
                    .cloned()
                    .ok_or_else(|| replay_missing(ResourceType::Guardian, existing))?;
                (record, false)
            } else {
                let id = t.guardians.allocate_id();
                let record = GuardianRecord {
                    id,
                    user_id: owner,
                    name: sealed.name.unwrap_or_default(),
                    email: sealed.email.unwrap_or_default(),
                    phone: sealed.phone.unwrap_or_default(),
                    notes: sealed.notes.unwrap_or_default(),
                    relationship: new.relationship,
                    access_token: Some(token.clone()),
                    pin_hash,
                    created_at: now,
                    updated_at: now,
                };
                t.guardians.insert(id, record.clone());
                t.guardians_by_token.insert(token, id);
                t.register_key(owner, key, ResourceType::Guardian, id, now);
                (record, true)
            }
        };

        let guardian = self.open_guardian(record)?;
        Ok(if created {
            Created::new(guardian)
        } else {
            Created::replayed(guardian)
        })
    }

    async fn get_guardian(&self, owner: UserId, id: GuardianId) -> StoreResult<Guardian> {
        let record = self
            .tables
            .read()
            .await
            .guardians
            .rows
            .get(&id)
            .cloned()
            .owned_by(owner, || format!("guardian {id}"))?;
        self.open_guardian(record)
    }

    async fn get_guardian_by_access_token(&self, token: &str) -> StoreResult<Guardian> {
        if is_legacy_token(token) {
            return Err(StoreError::not_found("guardian for access token"));
        }
        let record = {
            let t = self.tables.read().await;
            t.guardians_by_token
                .get(token)
                .and_then(|id| t.guardians.rows.get(id))
                .cloned()
                .ok_or_else(|| StoreError::not_found("guardian for access token"))?
        };
        self.open_guardian(record)
    }

    async fn list_guardians(&self, owner: UserId) -> StoreResult<Vec<Guardian>> {
        let records: Vec<GuardianRecord> = {
            let t = self.tables.read().await;
            t.guardians.owned_desc(owner).cloned().collect()
        };
        self.open_guardians(records)
    }

    async fn list_guardians_paginated(
        &self,
        owner: UserId,
        page: PageRequest,
    ) -> StoreResult<Page<Guardian>> {
        let limit = page.effective_limit(self.max_page_limit);
        let rows = self
            .tables
            .read()
            .await
            .guardians
            .page(owner, page.cursor, limit as usize + 1);
        let page = Page::from_rows(rows, limit, |r| r.id);
        Ok(Page {
            items: self.open_guardians(page.items)?,
            next_cursor: page.next_cursor,
            has_more: page.has_more,
        })
    }

    async fn count_guardians(&self, owner: UserId) -> StoreResult<u64> {
        Ok(self.tables.read().await.guardians.count(owner))
    }

    async fn update_guardian(
        &self,
        owner: UserId,
        id: GuardianId,
        update: GuardianUpdate,
    ) -> StoreResult<Guardian> {
        if let Some(name) = &update.name {
            require_text("name", name)?;
        }
        let sealed = SealedGuardianText::seal_update(&self.codec, &update)?;
        let record = {
            let mut t = self.tables.write().await;
            let row = t
                .guardians
                .get_mut(owner, id)
                .ok_or_else(|| StoreError::not_found(format!("guardian {id}")))?;
            row.apply(sealed, update, Utc::now());
            row.clone()
        };
        self.open_guardian(record)
    }

    async fn set_guardian_pin(
        &self,
        owner: UserId,
        id: GuardianId,
        pin: Option<&str>,
    ) -> StoreResult<Guardian> {
        let pin_hash = hash_optional_pin(pin)?;
        let record = {
            let mut t = self.tables.write().await;
            let row = t
                .guardians
                .get_mut(owner, id)
                .ok_or_else(|| StoreError::not_found(format!("guardian {id}")))?;
            row.pin_hash = pin_hash;
            row.updated_at = Utc::now();
            row.clone()
        };
        self.open_guardian(record)
    }

    async fn rotate_guardian_token(&self, owner: UserId, id: GuardianId) -> StoreResult<Guardian> {
        let token = generate_token()?;
        let record = {
            let mut t = self.tables.write().await;
            t.guardians
                .get(owner, id)
                .ok_or_else(|| StoreError::not_found(format!("guardian {id}")))?;
            t.set_guardian_token(id, Some(token));
            let row = t
                .guardians
                .get_mut(owner, id)
                .ok_or_else(|| StoreError::not_found(format!("guardian {id}")))?;
            row.updated_at = Utc::now();
            row.clone()
        };
        self.tokens.forget(id);
        tracing::info!(guardian_id = id, user_id = owner, "Guardian access token rotated");
        self.open_guardian(record)
    }

    async fn delete_guardian(&self, owner: UserId, id: GuardianId) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        let removed = t
            .guardians
            .remove(owner, id)
            .ok_or_else(|| StoreError::not_found(format!("guardian {id}")))?;
        if let Some(token) = removed.access_token {
            t.guardians_by_token.remove(&token);
        }
        drop(t);
        self.tokens.forget(id);
        Ok(())
    }

    // ---- share links ----------------------------------------------------

    async fn create_share_link(
        &self,
        owner: UserId,
        new: NewShareLink,
        idempotency_key: Option<&str>,
    ) -> StoreResult<Created<ShareLink>> {
        require_text("name", &new.name)?;
        let key = validated_key(idempotency_key)?;
        let pin_hash = hash_optional_pin(new.pin.as_deref())?;
        let token = generate_token()?;
        let guardian_ids = dedup_ids(new.guardian_ids);
        let now = Utc::now();

        let mut t = self.tables.write().await;
        t.require_user(owner)?;

        if let Some(existing) = t.idempotent_target(owner, key, ResourceType::ShareLink) {
            let record = t
                .share_links
                .get(owner, existing)
                .cloned()
                .ok_or_else(|| replay_missing(ResourceType::ShareLink, existing))?;
            return Ok(Created::replayed(record.into()));
        }

        t.check_guardians_owned(owner, &guardian_ids)?;
        let id = t.share_links.allocate_id();
        let record = ShareLinkRecord {
            id,
            user_id: owner,
            name: new.name,
            token: token.clone(),
            pin_hash,
            categories: clean_categories(new.categories),
            guardian_ids,
            expires_at: new.expires_at,
            max_uses: i64::from(new.max_uses),
            usage_count: 0,
            last_used_at: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        t.share_links.insert(id, record.clone());
        t.share_links_by_token.insert(token, id);
        t.register_key(owner, key, ResourceType::ShareLink, id, now);
        Ok(Created::new(record.into()))
    }

    async fn get_share_link(&self, owner: UserId, id: ShareLinkId) -> StoreResult<ShareLink> {
        self.tables
            .read()
            .await
            .share_links
            .rows
            .get(&id)
            .cloned()
            .owned_by(owner, || format!("share link {id}"))
            .map(ShareLink::from)
    }

    async fn get_share_link_by_token(&self, token: &str) -> StoreResult<ShareLink> {
        let t = self.tables.read().await;
        t.share_links_by_token
            .get(token)
            .and_then(|id| t.share_links.rows.get(id))
            .filter(|link| link.is_active)
            .cloned()
            .map(ShareLink::from)
            .ok_or_else(|| StoreError::not_found("active share link for token"))
    }

    async fn list_share_links(&self, owner: UserId) -> StoreResult<Vec<ShareLink>> {
        let t = self.tables.read().await;
        Ok(t.share_links
            .owned_desc(owner)
            .cloned()
            .map(ShareLink::from)
            .collect())
    }

    async fn list_share_links_paginated(
        &self,
        owner: UserId,
        page: PageRequest,
    ) -> StoreResult<Page<ShareLink>> {
        let limit = page.effective_limit(self.max_page_limit);
        let rows = self
            .tables
            .read()
            .await
            .share_links
            .page(owner, page.cursor, limit as usize + 1);
        Ok(Page::from_rows(rows, limit, |r| r.id).map(ShareLink::from))
    }

    async fn update_share_link(
        &self,
        owner: UserId,
        id: ShareLinkId,
        update: ShareLinkUpdate,
    ) -> StoreResult<ShareLink> {
        if let Some(name) = &update.name {
            require_text("name", name)?;
        }
        let mut t = self.tables.write().await;
        let row = t
            .share_links
            .get_mut(owner, id)
            .ok_or_else(|| StoreError::not_found(format!("share link {id}")))?;
        if let Some(name) = update.name {
            row.name = name;
        }
        if let Some(categories) = update.categories {
            row.categories = clean_categories(categories);
        }
        if let Some(expires_at) = update.expires_at {
            row.expires_at = expires_at;
        }
        if let Some(max_uses) = update.max_uses {
            row.max_uses = i64::from(max_uses);
        }
        if let Some(is_active) = update.is_active {
            row.is_active = is_active;
        }
        row.updated_at = Utc::now();
        Ok(row.clone().into())
    }

    async fn delete_share_link(&self, owner: UserId, id: ShareLinkId) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        let removed = t
            .share_links
            .remove(owner, id)
            .ok_or_else(|| StoreError::not_found(format!("share link {id}")))?;
        t.share_links_by_token.remove(&removed.token);
        t.remove_share_link_accesses(id);
        Ok(())
    }

    async fn increment_share_link_usage(
        &self,
        id: ShareLinkId,
        now: DateTime<Utc>,
    ) -> StoreResult<ShareLink> {
        let mut t = self.tables.write().await;
        let row = t
            .share_links
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("share link {id}")))?;
        if !row.accepts_use() {
            return Err(StoreError::invalid(format!(
                "share link {id} is not accepting further uses"
            )));
        }
        row.usage_count += 1;
        row.last_used_at = Some(now);
        Ok(row.clone().into())
    }

    async fn record_share_link_access(
        &self,
        id: ShareLinkId,
        access: NewShareLinkAccess,
    ) -> StoreResult<ShareLinkAccess> {
        let mut t = self.tables.write().await;
        if !t.share_links.rows.contains_key(&id) {
            return Err(StoreError::not_found(format!("share link {id}")));
        }
        t.next_access_id += 1;
        let record = ShareLinkAccessRecord {
            id: t.next_access_id,
            share_link_id: id,
            guardian_id: access.guardian_id,
            ip_address: access.ip_address,
            user_agent: access.user_agent,
            accessed_at: Utc::now(),
        };
        t.share_link_accesses.insert(record.id, record.clone());
        Ok(record.into())
    }

    async fn list_share_link_accesses(
        &self,
        owner: UserId,
        id: ShareLinkId,
    ) -> StoreResult<Vec<ShareLinkAccess>> {
        let t = self.tables.read().await;
        t.share_links
            .get(owner, id)
            .ok_or_else(|| StoreError::not_found(format!("share link {id}")))?;
        Ok(t.share_link_accesses
            .values()
            .rev()
            .filter(|a| a.share_link_id == id)
            .cloned()
            .map(ShareLinkAccess::from)
            .collect())
    }

    // ---- idempotency ----------------------------------------------------

    async fn register_idempotency_key(
        &self,
        owner: UserId,
        key: &str,
        resource_type: ResourceType,
        resource_id: i64,
    ) -> StoreResult<IdempotencyOutcome> {
        let key = validate_idempotency_key(key)?;
        let mut t = self.tables.write().await;
        t.require_user(owner)?;
        if let Some(existing) = t.idempotent_target(owner, Some(key), resource_type) {
            return Ok(IdempotencyOutcome::Existing {
                resource_id: existing,
            });
        }
        t.register_key(owner, Some(key), resource_type, resource_id, Utc::now());
        Ok(IdempotencyOutcome::Registered)
    }

    async fn get_idempotency_key(
        &self,
        owner: UserId,
        key: &str,
        resource_type: ResourceType,
    ) -> StoreResult<Option<IdempotencyRecord>> {
        let key = validate_idempotency_key(key)?;
        let t = self.tables.read().await;
        Ok(t.idempotency
            .get(&(owner, resource_type, key.to_string()))
            .cloned())
    }

    async fn delete_idempotency_key(
        &self,
        owner: UserId,
        key: &str,
        resource_type: ResourceType,
    ) -> StoreResult<bool> {
        let key = validate_idempotency_key(key)?;
        let mut t = self.tables.write().await;
        Ok(t.idempotency
            .remove(&(owner, resource_type, key.to_string()))
            .is_some())
    }

    // ---- password reset -------------------------------------------------

    async fn create_password_reset_token(
        &self,
        user_id: UserId,
        raw_token: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<PasswordResetToken> {
        require_text("reset token", raw_token)?;
        let token_hash = hash_reset_token(raw_token);
        let mut t = self.tables.write().await;
        t.require_user(user_id)?;
        if t.reset_tokens_by_hash.contains_key(&token_hash) {
            return Err(StoreError::already_exists("password reset token"));
        }
        let id = t.reset_tokens.allocate_id();
        let record = PasswordResetRecord {
            id,
            user_id,
            token_hash: token_hash.clone(),
            expires_at,
            used_at: None,
            created_at: Utc::now(),
        };
        t.reset_tokens.insert(id, record.clone());
        t.reset_tokens_by_hash.insert(token_hash, id);
        Ok(record.into())
    }

    async fn get_password_reset_token(&self, raw_token: &str) -> StoreResult<PasswordResetToken> {
        let token_hash = hash_reset_token(raw_token);
        let t = self.tables.read().await;
        t.reset_tokens_by_hash
            .get(&token_hash)
            .and_then(|id| t.reset_tokens.rows.get(id))
            .cloned()
            .map(PasswordResetToken::from)
            .ok_or_else(|| StoreError::not_found("password reset token"))
    }

    async fn mark_password_reset_token_used(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<PasswordResetToken> {
        let mut t = self.tables.write().await;
        let row = t
            .reset_tokens
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("password reset token {id}")))?;
        if row.used_at.is_some() {
            return Err(StoreError::invalid("password reset token already used"));
        }
        row.used_at = Some(now);
        Ok(row.clone().into())
    }

    async fn delete_password_reset_tokens(&self, user_id: UserId) -> StoreResult<u64> {
        let mut t = self.tables.write().await;
        let removed = t.reset_tokens.remove_owner(user_id);
        for token in &removed {
            t.reset_tokens_by_hash.remove(&token.token_hash);
        }
        Ok(removed.len() as u64)
    }

    // ---- emergency protocol ---------------------------------------------

    async fn get_emergency_protocol(&self, owner: UserId) -> StoreResult<EmergencyProtocol> {
        let mut t = self.tables.write().await;
        t.require_user(owner)?;
        let record = t.emergency.entry(owner).or_insert_with(|| {
            let fresh = EmergencyProtocol::inactive(owner, Utc::now());
            EmergencyRecord {
                user_id: fresh.user_id,
                is_active: fresh.is_active,
                activated_at: fresh.activated_at,
                deactivated_at: fresh.deactivated_at,
                updated_at: fresh.updated_at,
            }
        });
        Ok(record.clone().into())
    }

    async fn set_emergency_protocol(
        &self,
        owner: UserId,
        active: bool,
    ) -> StoreResult<EmergencyProtocol> {
        let now = Utc::now();
        let mut t = self.tables.write().await;
        t.require_user(owner)?;
        let mut protocol: EmergencyProtocol = match t.emergency.get(&owner) {
            Some(record) => record.clone().into(),
            None => EmergencyProtocol::inactive(owner, now),
        };
        protocol.toggle(active, now);
        t.emergency.insert(
            owner,
            EmergencyRecord {
                user_id: owner,
                is_active: protocol.is_active,
                activated_at: protocol.activated_at,
                deactivated_at: protocol.deactivated_at,
                updated_at: protocol.updated_at,
            },
        );
        tracing::info!(user_id = owner, active, "Emergency protocol updated");
        Ok(protocol)
    }

    // ---- settings -------------------------------------------------------

    async fn get_settings(&self, owner: UserId) -> StoreResult<UserSettings> {
        let mut t = self.tables.write().await;
        t.require_user(owner)?;
        let record = t
            .settings
            .entry(owner)
            .or_insert_with(|| settings_record(UserSettings::defaults(owner, Utc::now())));
        Ok(record.clone().into())
    }

    async fn update_settings(
        &self,
        owner: UserId,
        update: SettingsUpdate,
    ) -> StoreResult<UserSettings> {
        let now = Utc::now();
        let mut t = self.tables.write().await;
        t.require_user(owner)?;
        let mut settings: UserSettings = match t.settings.get(&owner) {
            Some(record) => record.clone().into(),
            None => UserSettings::defaults(owner, now),
        };
        settings.apply(update, now);
        t.settings.insert(owner, settings_record(settings.clone()));
        Ok(settings)
    }

    // ---- guide progress -------------------------------------------------

    async fn mark_guide_step(&self, owner: UserId, step_key: &str) -> StoreResult<GuideProgress> {
        let step_key = validate_step_key(step_key)?;
        let mut t = self.tables.write().await;
        t.require_user(owner)?;
        if let Some(existing) = t
            .guide_progress
            .owned_desc(owner)
            .find(|p| p.step_key == step_key)
        {
            return Ok(existing.clone().into());
        }
        let id = t.guide_progress.allocate_id();
        let record = GuideProgressRecord {
            id,
            user_id: owner,
            step_key: step_key.to_string(),
            completed_at: Utc::now(),
        };
        t.guide_progress.insert(id, record.clone());
        Ok(record.into())
    }

    async fn list_guide_progress(&self, owner: UserId) -> StoreResult<Vec<GuideProgress>> {
        let t = self.tables.read().await;
        let mut progress: Vec<GuideProgress> = t
            .guide_progress
            .owned_desc(owner)
            .cloned()
            .map(GuideProgress::from)
            .collect();
        progress.reverse();
        Ok(progress)
    }

    // ---- maintenance ----------------------------------------------------

    /// Always healthy: there is no connection or file behind the tables.
    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}

fn settings_record(settings: UserSettings) -> SettingsRecord {
    SettingsRecord {
        user_id: settings.user_id,
        theme: settings.theme,
        notifications_enabled: settings.notifications_enabled,
        reminder_interval_days: i64::from(settings.reminder_interval_days),
        created_at: settings.created_at,
        updated_at: settings.updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_ids_are_never_reused() {
        let mut arena: Arena<GuideProgressRecord> = Arena::default();
        let now = Utc::now();
        let row = |id, user_id| GuideProgressRecord {
            id,
            user_id,
            step_key: format!("s{id}"),
            completed_at: now,
        };

        let a = arena.allocate_id();
        arena.insert(a, row(a, 1));
        assert!(arena.remove(1, a).is_some());
        let b = arena.allocate_id();
        assert!(b > a);
    }

    #[test]
    fn arena_scopes_by_owner() {
        let mut arena: Arena<GuideProgressRecord> = Arena::default();
        let now = Utc::now();
        for owner in [1, 2, 1] {
            let id = arena.allocate_id();
            arena.insert(
                id,
                GuideProgressRecord {
                    id,
                    user_id: owner,
                    step_key: format!("s{id}"),
                    completed_at: now,
                },
            );
        }
        assert_eq!(arena.count(1), 2);
        assert!(arena.get(2, 1).is_none());
        assert!(arena.remove(2, 1).is_none());
        assert_eq!(arena.rows.len(), 3);

        let page = arena.page(1, Some(3), 10);
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1]);

        let removed = arena.remove_owner(1);
        assert_eq!(removed.len(), 2);
        assert_eq!(arena.count(1), 0);
        assert_eq!(arena.rows.len(), 1);
    }

    #[tokio::test]
    async fn reads_return_copies() {
        let store = InMemoryStore::new(SensitiveCodec::disabled());
        let user = store.create_user(NewUser::with_email("a@x.com")).await.unwrap();
        let mut copy = store.get_user(user.id).await.unwrap();
        copy.name = "mutated".into();
        assert_eq!(store.get_user(user.id).await.unwrap().name, "");
    }
}
