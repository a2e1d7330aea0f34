// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Relational Backend
//!
//! [`VaultStore`] on SQLite through a bounded `sqlx` pool.
//!
//! - WAL journal and foreign-key enforcement are set on every connection,
//!   not inside a migration (SQLite refuses to change `journal_mode` inside
//!   the transaction sqlx wraps each migration in)
//! - Owner-scoped tables cascade from `users`, so deleting a user is one
//!   statement and either removes everything or nothing
//! - The encryption salt is bootstrapped with a conditional insert followed
//!   by a read, so racing first boots agree on one salt
//!
//! One repository per entity lives in the submodules; [`SqlStore`] wires
//! them to the trait.

mod account;
mod guardians;
mod items;
mod share_links;
mod users;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::SqliteConnection;
use tracing::{info, warn};

use self::account::AccountRepository;
use self::guardians::GuardianRepository;
use self::items::BoxItemRepository;
use self::share_links::ShareLinkRepository;
use self::users::UserRepository;
use super::pagination::{Page, PageRequest};
use super::token_repair::{AccessTokenManager, TokenRepairSink};
use super::VaultStore;
use crate::config::{DatabaseConfig, VaultConfig, DATABASE_URL_ENV};
use crate::crypto::{EncryptionSalt, SensitiveCodec};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    BoxItem, BoxItemSummary, BoxItemUpdate, Created, EmergencyProtocol, Guardian, GuardianId,
    GuardianUpdate, GuideProgress, IdempotencyOutcome, IdempotencyRecord, ItemId, NewBoxItem,
    NewGuardian, NewShareLink, NewShareLinkAccess, NewUser, PasswordResetToken, ResourceType,
    SettingsUpdate, ShareLink, ShareLinkAccess, ShareLinkId, ShareLinkUpdate, ShareScope, User,
    UserId, UserSettings, UserUpdate,
};

/// Open a connection pool for `config`.
pub async fn connect(config: &DatabaseConfig) -> StoreResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| StoreError::Config(format!("{DATABASE_URL_ENV}: {e}")))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(config.acquire_timeout);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .max_lifetime(config.max_lifetime)
        .idle_timeout(config.idle_timeout)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(options)
        .await?;

    info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database pool ready"
    );
    Ok(pool)
}

/// Apply pending schema migrations.
pub async fn migrate(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Resolve the process-wide encryption salt.
///
/// A configured salt is used as is. Otherwise a candidate is offered with
/// `INSERT .. ON CONFLICT DO NOTHING` and whatever row ends up stored is
/// canonical, so concurrent first boots converge on a single salt.
pub async fn resolve_salt(
    pool: &SqlitePool,
    configured: Option<&EncryptionSalt>,
) -> StoreResult<EncryptionSalt> {
    if let Some(salt) = configured {
        let persisted: Option<String> =
            sqlx::query_scalar("SELECT encryption_salt FROM system_config WHERE id = 1")
                .fetch_optional(pool)
                .await?;
        if persisted.is_some_and(|p| p != salt.encode()) {
            warn!("Configured encryption salt differs from the persisted one, using configured salt");
        }
        return Ok(salt.clone());
    }

    let candidate = EncryptionSalt::generate()?;
    let inserted = sqlx::query(
        "INSERT INTO system_config (id, encryption_salt, created_at) VALUES (1, ?, ?) \
         ON CONFLICT(id) DO NOTHING",
    )
    .bind(candidate.encode())
    .bind(Utc::now())
    .execute(pool)
    .await?
    .rows_affected();

    let stored: String =
        sqlx::query_scalar("SELECT encryption_salt FROM system_config WHERE id = 1")
            .fetch_one(pool)
            .await?;

    if inserted == 1 {
        info!("Generated and persisted a new encryption salt");
    }

    EncryptionSalt::from_encoded(&stored)
        .map_err(|e| StoreError::Config(format!("persisted encryption salt is unusable: {e}")))
}

// =============================================================================
// Shared query helpers
// =============================================================================

/// Map an insert failure, reporting a missing parent row as `NotFound(parent)`.
pub(super) fn insert_error(err: sqlx::Error, parent: String, what: &str) -> StoreError {
    let fk = err
        .as_database_error()
        .is_some_and(|db| db.is_foreign_key_violation());
    if fk {
        StoreError::NotFound(parent)
    } else {
        StoreError::from_db(err, what)
    }
}

/// Verify that every id in `ids` (deduplicated) is a guardian of `owner`.
pub(super) async fn check_guardians_owned(
    conn: &mut SqliteConnection,
    owner: UserId,
    ids: &[GuardianId],
) -> StoreResult<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let owned: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM guardians \
         WHERE user_id = ? AND id IN (SELECT value FROM json_each(?))",
    )
    .bind(owner)
    .bind(Json(ids))
    .fetch_one(&mut *conn)
    .await?;

    if owned as usize != ids.len() {
        return Err(StoreError::invalid(format!(
            "guardian ids {ids:?} do not all belong to user {owner}"
        )));
    }
    Ok(())
}

/// Claim an idempotency key, usually inside the creating transaction.
///
/// Returns the previously registered resource id when the key is taken.
pub(super) async fn claim_idempotency_key(
    conn: &mut SqliteConnection,
    owner: UserId,
    key: &str,
    resource_type: ResourceType,
    resource_id: i64,
    now: DateTime<Utc>,
) -> StoreResult<Option<i64>> {
    let inserted = sqlx::query(
        "INSERT INTO idempotency_keys \
         (user_id, idempotency_key, resource_type, resource_id, created_at) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(user_id, idempotency_key, resource_type) DO NOTHING",
    )
    .bind(owner)
    .bind(key)
    .bind(resource_type.as_str())
    .bind(resource_id)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| insert_error(e, format!("user {owner}"), "idempotency key"))?
    .rows_affected();

    if inserted == 1 {
        return Ok(None);
    }

    let existing: i64 = sqlx::query_scalar(
        "SELECT resource_id FROM idempotency_keys \
         WHERE user_id = ? AND idempotency_key = ? AND resource_type = ?",
    )
    .bind(owner)
    .bind(key)
    .bind(resource_type.as_str())
    .fetch_one(&mut *conn)
    .await?;
    Ok(Some(existing))
}

/// Effective limit, exclusive upper id bound and fetch size (`limit + 1`).
pub(super) fn page_bounds(page: &PageRequest, max: u32) -> (u32, i64, i64) {
    let limit = page.effective_limit(max);
    (limit, page.cursor.unwrap_or(i64::MAX), i64::from(limit) + 1)
}

// =============================================================================
// Token repair sink
// =============================================================================

struct SqlTokenSink {
    pool: SqlitePool,
}

#[async_trait]
impl TokenRepairSink for SqlTokenSink {
    async fn replace_access_token(
        &self,
        guardian_id: GuardianId,
        previous: Option<&str>,
        replacement: &str,
    ) -> StoreResult<bool> {
        let updated = sqlx::query(
            "UPDATE guardians SET access_token = ? \
             WHERE id = ? AND (COALESCE(access_token, '') = COALESCE(?, '') OR access_token = ?)",
        )
        .bind(replacement)
        .bind(guardian_id)
        .bind(previous)
        .bind(replacement)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }
}

// =============================================================================
// Store
// =============================================================================

/// Production [`VaultStore`] on SQLite.
pub struct SqlStore {
    pool: SqlitePool,
    codec: SensitiveCodec,
    tokens: AccessTokenManager,
    max_page_limit: u32,
}

impl SqlStore {
    /// Connect, migrate, resolve the salt and build the codec.
    ///
    /// Any failure here is a startup failure.
    pub async fn open(config: &VaultConfig) -> StoreResult<Self> {
        let pool = connect(&config.database).await?;
        migrate(&pool).await?;
        let salt = resolve_salt(&pool, config.encryption_salt.as_ref()).await?;
        let codec = SensitiveCodec::from_passphrase(config.encryption_key.as_deref(), &salt)?;
        Ok(Self::with_pool(pool, codec, config.max_page_limit))
    }

    /// Wrap an already migrated pool.
    ///
    /// Starts the token repair worker, so it must be called from within a
    /// Tokio runtime.
    pub fn with_pool(pool: SqlitePool, codec: SensitiveCodec, max_page_limit: u32) -> Self {
        let tokens = AccessTokenManager::spawn(Arc::new(SqlTokenSink { pool: pool.clone() }));
        Self {
            pool,
            codec,
            tokens,
            max_page_limit,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn codec(&self) -> &SensitiveCodec {
        &self.codec
    }

    pub fn token_manager(&self) -> &AccessTokenManager {
        &self.tokens
    }

    /// Close the pool, waiting for checked-out connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn users(&self) -> UserRepository<'_> {
        UserRepository::new(&self.pool)
    }

    fn items(&self) -> BoxItemRepository<'_> {
        BoxItemRepository::new(&self.pool, &self.codec, self.max_page_limit)
    }

    fn guardians(&self) -> GuardianRepository<'_> {
        GuardianRepository::new(&self.pool, &self.codec, &self.tokens, self.max_page_limit)
    }

    fn share_links(&self) -> ShareLinkRepository<'_> {
        ShareLinkRepository::new(&self.pool, self.max_page_limit)
    }

    fn account(&self) -> AccountRepository<'_> {
        AccountRepository::new(&self.pool)
    }
}

impl std::fmt::Debug for SqlStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlStore")
            .field("pool_size", &self.pool.size())
            .field("encryption", &self.codec.is_enabled())
            .field("max_page_limit", &self.max_page_limit)
            .finish()
    }
}

#[async_trait]
impl VaultStore for SqlStore {
    async fn create_user(&self, new: NewUser) -> StoreResult<User> {
        self.users().create(new).await
    }

    async fn get_user(&self, id: UserId) -> StoreResult<User> {
        self.users().get(id).await
    }

    async fn get_user_by_email(&self, email: &str) -> StoreResult<User> {
        self.users().get_by_email(email).await
    }

    async fn get_user_by_federated_id(&self, federated_id: &str) -> StoreResult<User> {
        self.users().get_by_federated_id(federated_id).await
    }

    async fn update_user(&self, id: UserId, update: UserUpdate) -> StoreResult<User> {
        self.users().update(id, update).await
    }

    async fn link_federated_identity(&self, id: UserId, federated_id: &str) -> StoreResult<User> {
        self.users().link_federated_identity(id, federated_id).await
    }

    async fn delete_user(&self, id: UserId) -> StoreResult<()> {
        self.users().delete(id).await
    }

    async fn create_box_item(
        &self,
        owner: UserId,
        new: NewBoxItem,
        idempotency_key: Option<&str>,
    ) -> StoreResult<Created<BoxItem>> {
        self.items().create(owner, new, idempotency_key).await
    }

    async fn get_box_item(&self, owner: UserId, id: ItemId) -> StoreResult<BoxItem> {
        self.items().get(owner, id).await
    }

    async fn list_box_items(&self, owner: UserId) -> StoreResult<Vec<BoxItemSummary>> {
        self.items().list(owner).await
    }

    async fn list_box_items_paginated(
        &self,
        owner: UserId,
        page: PageRequest,
    ) -> StoreResult<Page<BoxItemSummary>> {
        self.items().list_paginated(owner, page).await
    }

    async fn count_box_items(&self, owner: UserId) -> StoreResult<u64> {
        self.items().count(owner).await
    }

    async fn update_box_item(
        &self,
        owner: UserId,
        id: ItemId,
        update: BoxItemUpdate,
    ) -> StoreResult<BoxItem> {
        self.items().update(owner, id, update).await
    }

    async fn delete_box_item(&self, owner: UserId, id: ItemId) -> StoreResult<()> {
        self.items().delete(owner, id).await
    }

    async fn list_shared_box_items(
        &self,
        owner: UserId,
        scope: &ShareScope,
    ) -> StoreResult<Vec<BoxItem>> {
        self.items().list_shared(owner, scope).await
    }

    async fn create_guardian(
        &self,
        owner: UserId,
        new: NewGuardian,
        idempotency_key: Option<&str>,
    ) -> StoreResult<Created<Guardian>> {
        self.guardians().create(owner, new, idempotency_key).await
    }

    async fn get_guardian(&self, owner: UserId, id: GuardianId) -> StoreResult<Guardian> {
        self.guardians().get(owner, id).await
    }

    async fn get_guardian_by_access_token(&self, token: &str) -> StoreResult<Guardian> {
        self.guardians().get_by_access_token(token).await
    }

    async fn list_guardians(&self, owner: UserId) -> StoreResult<Vec<Guardian>> {
        self.guardians().list(owner).await
    }

    async fn list_guardians_paginated(
        &self,
        owner: UserId,
        page: PageRequest,
    ) -> StoreResult<Page<Guardian>> {
        self.guardians().list_paginated(owner, page).await
    }

    async fn count_guardians(&self, owner: UserId) -> StoreResult<u64> {
        self.guardians().count(owner).await
    }

    async fn update_guardian(
        &self,
        owner: UserId,
        id: GuardianId,
        update: GuardianUpdate,
    ) -> StoreResult<Guardian> {
        self.guardians().update(owner, id, update).await
    }

    async fn set_guardian_pin(
        &self,
        owner: UserId,
        id: GuardianId,
        pin: Option<&str>,
    ) -> StoreResult<Guardian> {
        self.guardians().set_pin(owner, id, pin).await
    }

    async fn rotate_guardian_token(&self, owner: UserId, id: GuardianId) -> StoreResult<Guardian> {
        self.guardians().rotate_token(owner, id).await
    }

    async fn delete_guardian(&self, owner: UserId, id: GuardianId) -> StoreResult<()> {
        self.guardians().delete(owner, id).await
    }

    async fn create_share_link(
        &self,
        owner: UserId,
        new: NewShareLink,
        idempotency_key: Option<&str>,
    ) -> StoreResult<Created<ShareLink>> {
        self.share_links().create(owner, new, idempotency_key).await
    }

    async fn get_share_link(&self, owner: UserId, id: ShareLinkId) -> StoreResult<ShareLink> {
        self.share_links().get(owner, id).await
    }

    async fn get_share_link_by_token(&self, token: &str) -> StoreResult<ShareLink> {
        self.share_links().get_by_token(token).await
    }

    async fn list_share_links(&self, owner: UserId) -> StoreResult<Vec<ShareLink>> {
        self.share_links().list(owner).await
    }

    async fn list_share_links_paginated(
        &self,
        owner: UserId,
        page: PageRequest,
    ) -> StoreResult<Page<ShareLink>> {
        self.share_links().list_paginated(owner, page).await
    }

    async fn update_share_link(
        &self,
        owner: UserId,
        id: ShareLinkId,
        update: ShareLinkUpdate,
    ) -> StoreResult<ShareLink> {
        self.share_links().update(owner, id, update).await
    }

    async fn delete_share_link(&self, owner: UserId, id: ShareLinkId) -> StoreResult<()> {
        self.share_links().delete(owner, id).await
    }

    async fn increment_share_link_usage(
        &self,
        id: ShareLinkId,
        now: DateTime<Utc>,
    ) -> StoreResult<ShareLink> {
        self.share_links().increment_usage(id, now).await
    }

    async fn record_share_link_access(
        &self,
        id: ShareLinkId,
        access: NewShareLinkAccess,
    ) -> StoreResult<ShareLinkAccess> {
        self.share_links().record_access(id, access).await
    }

    async fn list_share_link_accesses(
        &self,
        owner: UserId,
        id: ShareLinkId,
    ) -> StoreResult<Vec<ShareLinkAccess>> {
        self.share_links().list_accesses(owner, id).await
    }

    async fn register_idempotency_key(
        &self,
        owner: UserId,
        key: &str,
        resource_type: ResourceType,
        resource_id: i64,
    ) -> StoreResult<IdempotencyOutcome> {
        self.account()
            .register_idempotency_key(owner, key, resource_type, resource_id)
            .await
    }

    async fn get_idempotency_key(
        &self,
        owner: UserId,
        key: &str,
        resource_type: ResourceType,
    ) -> StoreResult<Option<IdempotencyRecord>> {
        self.account()
            .get_idempotency_key(owner, key, resource_type)
            .await
    }

    async fn delete_idempotency_key(
        &self,
        owner: UserId,
        key: &str,
        resource_type: ResourceType,
    ) -> StoreResult<bool> {
        self.account()
            .delete_idempotency_key(owner, key, resource_type)
            .await
    }

    async fn create_password_reset_token(
        &self,
        user_id: UserId,
        raw_token: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<PasswordResetToken> {
        self.account()
            .create_password_reset_token(user_id, raw_token, expires_at)
            .await
    }

    async fn get_password_reset_token(&self, raw_token: &str) -> StoreResult<PasswordResetToken> {
        self.account().get_password_reset_token(raw_token).await
    }

    async fn mark_password_reset_token_used(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<PasswordResetToken> {
        self.account().mark_password_reset_token_used(id, now).await
    }

    async fn delete_password_reset_tokens(&self, user_id: UserId) -> StoreResult<u64> {
        self.account().delete_password_reset_tokens(user_id).await
    }

    async fn get_emergency_protocol(&self, owner: UserId) -> StoreResult<EmergencyProtocol> {
        self.account().get_emergency_protocol(owner).await
    }

    async fn set_emergency_protocol(
        &self,
        owner: UserId,
        active: bool,
    ) -> StoreResult<EmergencyProtocol> {
        self.account().set_emergency_protocol(owner, active).await
    }

    async fn get_settings(&self, owner: UserId) -> StoreResult<UserSettings> {
        self.account().get_settings(owner).await
    }

    async fn update_settings(
        &self,
        owner: UserId,
        update: SettingsUpdate,
    ) -> StoreResult<UserSettings> {
        self.account().update_settings(owner, update).await
    }

    async fn mark_guide_step(&self, owner: UserId, step_key: &str) -> StoreResult<GuideProgress> {
        self.account().mark_guide_step(owner, step_key).await
    }

    async fn list_guide_progress(&self, owner: UserId) -> StoreResult<Vec<GuideProgress>> {
        self.account().list_guide_progress(owner).await
    }

    async fn health_check(&self) -> StoreResult<()> {
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        if one != 1 {
            return Err(StoreError::Internal("health check returned unexpected value".into()));
        }
        Ok(())
    }
}
