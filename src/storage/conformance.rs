// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Behavioral suite shared by both backends.
//!
//! Every scenario is an `async fn(Backend)`; the `conformance!` macro runs
//! it once against [`InMemoryStore`] and once against a [`SqlStore`] on a
//! fresh database file.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use chrono::{Duration, Utc};

use super::sql::testing::open_in;
use super::{InMemoryStore, PageRequest, SqlStore, VaultStore};
use crate::crypto::{EncryptionSalt, Encryptor, SensitiveCodec};
use crate::error::StoreError;
use crate::models::{
    BoxItemUpdate, IdempotencyOutcome, LinkAvailability, NewBoxItem, NewGuardian, NewShareLink,
    NewShareLinkAccess, NewUser, ResourceType, SettingsUpdate, ShareLinkUpdate, ShareScope, User,
    UserSettings, UserUpdate,
};

fn sealed_codec() -> SensitiveCodec {
    static CODEC: OnceLock<SensitiveCodec> = OnceLock::new();
    CODEC
        .get_or_init(|| {
            let salt = EncryptionSalt::from_bytes(vec![42u8; 32]).unwrap();
            SensitiveCodec::new(Encryptor::new("conformance suite passphrase", &salt).unwrap())
        })
        .clone()
}

enum Backend {
    Memory(InMemoryStore),
    Sql(SqlStore, tempfile::TempDir),
}

impl Backend {
    async fn memory(codec: SensitiveCodec) -> Self {
        Backend::Memory(InMemoryStore::new(codec))
    }

    async fn sql(codec: SensitiveCodec) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = open_in(&dir, codec).await;
        Backend::Sql(store, dir)
    }

    fn store(&self) -> &dyn VaultStore {
        match self {
            Backend::Memory(store) => store,
            Backend::Sql(store, _) => store,
        }
    }

    async fn raw_item_title(&self, id: i64) -> Option<String> {
        match self {
            Backend::Memory(store) => store.raw_item(id).await.map(|r| r.title),
            Backend::Sql(store, _) => store.raw_item(id).await.map(|r| r.title),
        }
    }

    async fn raw_guardian_token(&self, id: i64) -> Option<String> {
        match self {
            Backend::Memory(store) => store.raw_guardian(id).await.and_then(|r| r.access_token),
            Backend::Sql(store, _) => store.raw_guardian(id).await.and_then(|r| r.access_token),
        }
    }

    async fn raw_guardian_name(&self, id: i64) -> Option<String> {
        match self {
            Backend::Memory(store) => store.raw_guardian(id).await.map(|r| r.name),
            Backend::Sql(store, _) => store.raw_guardian(id).await.map(|r| r.name),
        }
    }

    async fn force_guardian_token(&self, id: i64, token: Option<&str>) {
        match self {
            Backend::Memory(store) => store.force_guardian_token(id, token).await,
            Backend::Sql(store, _) => store.force_guardian_token(id, token).await,
        }
    }

    async fn force_item_title(&self, id: i64, stored: &str) {
        match self {
            Backend::Memory(store) => store.force_item_title(id, stored).await,
            Backend::Sql(store, _) => store.force_item_title(id, stored).await,
        }
    }

    async fn rows_owned_by(&self, owner: i64) -> u64 {
        match self {
            Backend::Memory(store) => store.rows_owned_by(owner).await,
            Backend::Sql(store, _) => store.rows_owned_by(owner).await,
        }
    }

    async fn flush_token_repairs(&self) {
        match self {
            Backend::Memory(store) => store.token_manager().flush().await,
            Backend::Sql(store, _) => store.token_manager().flush().await,
        }
    }
}

macro_rules! conformance {
    ($codec:path => $($name:ident),* $(,)?) => {
        $(
            mod $name {
                use super::*;

                #[tokio::test]
                async fn memory() {
                    super::$name(Backend::memory($codec()).await).await;
                }

                #[tokio::test]
                async fn sql() {
                    super::$name(Backend::sql($codec()).await).await;
                }
            }
        )*
    };
}

conformance!(sealed_codec =>
    example_scenario,
    pagination_visits_every_item_once,
    page_limit_is_clamped,
    idempotent_creates_replay,
    idempotency_keys_are_scoped,
    explicit_idempotency_registration,
    delete_user_cascades,
    legacy_guardian_token_is_repaired,
    reads_before_repair_lands_agree_on_token,
    missing_guardian_token_is_issued,
    rotated_token_replaces_old_one,
    share_link_resolution_ignores_expiry,
    share_link_usage_is_capped,
    share_link_access_log,
    shared_items_follow_scope,
    sensitive_columns_sealed_at_rest,
    legacy_plaintext_stays_readable,
    email_is_unique_and_normalized,
    federated_identity_is_unique,
    settings_are_materialized,
    emergency_protocol_toggles,
    guide_steps_are_recorded_once,
    password_reset_lifecycle,
    guardian_ids_must_belong_to_owner,
    foreign_resources_are_not_found,
    guardian_pin_can_be_set_and_cleared,
    partial_updates_keep_other_fields,
    missing_owner_is_not_found,
);

conformance!(SensitiveCodec::disabled =>
    writes_fail_closed_without_encryption,
);

async fn user(store: &dyn VaultStore, email: &str) -> User {
    store.create_user(NewUser::with_email(email)).await.unwrap()
}

// =============================================================================
// Scenarios
// =============================================================================

async fn example_scenario(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "a@x.com").await;

    let created = store
        .create_box_item(owner.id, NewBoxItem::new("Pix key", "1234"), None)
        .await
        .unwrap();
    assert!(created.created);
    assert!(!created.resource.is_shared);

    let page = store
        .list_box_items_paginated(owner.id, PageRequest::first(20))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].title, "Pix key");
    assert!(!page.has_more);
    assert_eq!(page.next_cursor, None);

    store.delete_user(owner.id).await.unwrap();
    let err = store
        .get_box_item(owner.id, created.resource.id)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

async fn pagination_visits_every_item_once(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "pages@x.com").await;
    let other = user(store, "other@x.com").await;

    let mut expected = BTreeSet::new();
    for i in 0..7 {
        let item = store
            .create_box_item(owner.id, NewBoxItem::new(format!("item {i}"), ""), None)
            .await
            .unwrap();
        expected.insert(item.resource.id);
        store
            .create_box_item(other.id, NewBoxItem::new("noise", ""), None)
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    let mut request = PageRequest::first(3);
    loop {
        let page = store
            .list_box_items_paginated(owner.id, request)
            .await
            .unwrap();
        assert!(page.items.len() <= 3);
        seen.extend(page.items.iter().map(|i| i.id));
        match page.next_cursor {
            Some(cursor) => {
                assert!(page.has_more);
                assert_eq!(Some(cursor), page.items.last().map(|i| i.id));
                request = PageRequest::after(cursor, 3);
            }
            None => {
                assert!(!page.has_more);
                break;
            }
        }
    }

    assert_eq!(seen.len(), 7);
    assert!(seen.windows(2).all(|w| w[0] > w[1]), "{seen:?}");
    assert_eq!(seen.into_iter().collect::<BTreeSet<_>>(), expected);
    assert_eq!(store.count_box_items(owner.id).await.unwrap(), 7);

    let full = store.list_box_items(owner.id).await.unwrap();
    assert_eq!(full.len(), 7);
}

async fn page_limit_is_clamped(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "clamp@x.com").await;
    for i in 0..3 {
        store
            .create_guardian(owner.id, NewGuardian::named(format!("g{i}")), None)
            .await
            .unwrap();
    }

    let page = store
        .list_guardians_paginated(owner.id, PageRequest::first(0))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert!(page.has_more);

    let page = store
        .list_guardians_paginated(owner.id, PageRequest::first(10_000))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 3);
    assert!(!page.has_more);

    let empty = store
        .list_share_links_paginated(owner.id, PageRequest::default())
        .await
        .unwrap();
    assert!(empty.items.is_empty());
    assert_eq!(empty.next_cursor, None);
}

async fn idempotent_creates_replay(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "idem@x.com").await;

    let first = store
        .create_box_item(owner.id, NewBoxItem::new("Will", "text"), Some("req-1"))
        .await
        .unwrap();
    let second = store
        .create_box_item(owner.id, NewBoxItem::new("Different", "body"), Some("req-1"))
        .await
        .unwrap();
    assert!(first.created);
    assert!(!second.created);
    assert_eq!(second.resource.id, first.resource.id);
    assert_eq!(second.resource.title, "Will");
    assert_eq!(store.count_box_items(owner.id).await.unwrap(), 1);

    let guardian = store
        .create_guardian(owner.id, NewGuardian::named("Ana"), Some("req-1"))
        .await
        .unwrap();
    assert!(guardian.created);
    let replay = store
        .create_guardian(owner.id, NewGuardian::named("Bia"), Some("req-1"))
        .await
        .unwrap();
    assert!(!replay.created);
    assert_eq!(replay.resource.id, guardian.resource.id);
    assert_eq!(replay.resource.access_token, guardian.resource.access_token);

    let link = store
        .create_share_link(owner.id, NewShareLink::named("family"), Some("req-1"))
        .await
        .unwrap();
    let link_replay = store
        .create_share_link(owner.id, NewShareLink::named("other"), Some("req-1"))
        .await
        .unwrap();
    assert!(!link_replay.created);
    assert_eq!(link_replay.resource.id, link.resource.id);

    store
        .delete_box_item(owner.id, first.resource.id)
        .await
        .unwrap();
    let err = store
        .create_box_item(owner.id, NewBoxItem::new("Will", "text"), Some("req-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));

    let err = store
        .create_box_item(owner.id, NewBoxItem::new("x", ""), Some("   "))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidData(_)));
}

async fn idempotency_keys_are_scoped(backend: Backend) {
    let store = backend.store();
    let a = user(store, "a@x.com").await;
    let b = user(store, "b@x.com").await;

    let from_a = store
        .create_box_item(a.id, NewBoxItem::new("a", ""), Some("shared-key"))
        .await
        .unwrap();
    let from_b = store
        .create_box_item(b.id, NewBoxItem::new("b", ""), Some("shared-key"))
        .await
        .unwrap();
    assert!(from_a.created);
    assert!(from_b.created);
    assert_ne!(from_a.resource.id, from_b.resource.id);
    assert_eq!(from_b.resource.user_id, b.id);
}

async fn explicit_idempotency_registration(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "reg@x.com").await;

    let outcome = store
        .register_idempotency_key(owner.id, "op-9", ResourceType::ShareLink, 11)
        .await
        .unwrap();
    assert_eq!(outcome, IdempotencyOutcome::Registered);

    let again = store
        .register_idempotency_key(owner.id, "op-9", ResourceType::ShareLink, 12)
        .await
        .unwrap();
    assert_eq!(again.existing_resource_id(), Some(11));

    let record = store
        .get_idempotency_key(owner.id, "op-9", ResourceType::ShareLink)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.resource_id, 11);
    assert_eq!(record.resource_type, ResourceType::ShareLink);
    assert!(store
        .get_idempotency_key(owner.id, "op-9", ResourceType::BoxItem)
        .await
        .unwrap()
        .is_none());

    assert!(store
        .delete_idempotency_key(owner.id, "op-9", ResourceType::ShareLink)
        .await
        .unwrap());
    assert!(!store
        .delete_idempotency_key(owner.id, "op-9", ResourceType::ShareLink)
        .await
        .unwrap());

    let err = store
        .register_idempotency_key(999, "op-9", ResourceType::BoxItem, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

async fn delete_user_cascades(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "gone@x.com").await;
    let keeper = user(store, "stays@x.com").await;

    store
        .create_box_item(owner.id, NewBoxItem::new("t", "c"), Some("k"))
        .await
        .unwrap();
    let guardian = store
        .create_guardian(owner.id, NewGuardian::named("g"), None)
        .await
        .unwrap()
        .resource;
    let link = store
        .create_share_link(owner.id, NewShareLink::named("l"), None)
        .await
        .unwrap()
        .resource;
    store
        .record_share_link_access(link.id, NewShareLinkAccess::default())
        .await
        .unwrap();
    store
        .create_password_reset_token(owner.id, "reset-raw", Utc::now() + Duration::hours(1))
        .await
        .unwrap();
    store.get_settings(owner.id).await.unwrap();
    store.set_emergency_protocol(owner.id, true).await.unwrap();
    store.mark_guide_step(owner.id, "welcome").await.unwrap();
    store
        .create_box_item(keeper.id, NewBoxItem::new("mine", ""), None)
        .await
        .unwrap();

    assert!(backend.rows_owned_by(owner.id).await >= 9);
    store.delete_user(owner.id).await.unwrap();

    assert_eq!(backend.rows_owned_by(owner.id).await, 0);
    assert_eq!(backend.rows_owned_by(keeper.id).await, 1);
    assert!(matches!(
        store.get_user(owner.id).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store.get_guardian_by_access_token(&guardian.access_token).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store.get_share_link_by_token(&link.token).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store.get_password_reset_token("reset-raw").await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store.delete_user(owner.id).await,
        Err(StoreError::NotFound(_))
    ));

    // The address is free again.
    user(store, "gone@x.com").await;
}

async fn legacy_guardian_token_is_repaired(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "tokens@x.com").await;
    let id = store
        .create_guardian(owner.id, NewGuardian::named("Ana"), None)
        .await
        .unwrap()
        .resource
        .id;

    let legacy = "7c3e0b3a-legacy-uuid";
    backend.force_guardian_token(id, Some(legacy)).await;

    let repaired = store.get_guardian(owner.id, id).await.unwrap();
    assert_ne!(repaired.access_token, legacy);
    assert!(crate::crypto::tokens::is_current_token(&repaired.access_token));

    backend.flush_token_repairs().await;
    assert_eq!(
        backend.raw_guardian_token(id).await.as_deref(),
        Some(repaired.access_token.as_str())
    );

    let again = store.get_guardian(owner.id, id).await.unwrap();
    assert_eq!(again.access_token, repaired.access_token);

    assert!(matches!(
        store.get_guardian_by_access_token(legacy).await,
        Err(StoreError::NotFound(_))
    ));
    let resolved = store
        .get_guardian_by_access_token(&repaired.access_token)
        .await
        .unwrap();
    assert_eq!(resolved.id, id);
}

async fn reads_before_repair_lands_agree_on_token(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "twice@x.com").await;
    let id = store
        .create_guardian(owner.id, NewGuardian::named("Ana"), None)
        .await
        .unwrap()
        .resource
        .id;
    backend.force_guardian_token(id, Some("legacy-uuid")).await;

    let listed = store.list_guardians(owner.id).await.unwrap();
    let opened = store.get_guardian(owner.id, id).await.unwrap();
    let again = store.get_guardian(owner.id, id).await.unwrap();
    assert_eq!(listed[0].access_token, opened.access_token);
    assert_eq!(opened.access_token, again.access_token);

    backend.flush_token_repairs().await;
    for token in [&listed[0].access_token, &opened.access_token, &again.access_token] {
        let resolved = store.get_guardian_by_access_token(token).await.unwrap();
        assert_eq!(resolved.id, id);
    }
    assert_eq!(
        backend.raw_guardian_token(id).await.as_deref(),
        Some(opened.access_token.as_str())
    );
}

async fn missing_guardian_token_is_issued(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "none@x.com").await;
    let id = store
        .create_guardian(owner.id, NewGuardian::named("Ana"), None)
        .await
        .unwrap()
        .resource
        .id;
    backend.force_guardian_token(id, None).await;

    let listed = store.list_guardians(owner.id).await.unwrap();
    assert_eq!(listed.len(), 1);
    let token = listed[0].access_token.clone();
    assert!(crate::crypto::tokens::is_current_token(&token));

    backend.flush_token_repairs().await;
    assert_eq!(backend.raw_guardian_token(id).await, Some(token.clone()));
    assert!(matches!(
        store.get_guardian_by_access_token("").await,
        Err(StoreError::NotFound(_))
    ));
}

async fn rotated_token_replaces_old_one(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "rotate@x.com").await;
    let guardian = store
        .create_guardian(owner.id, NewGuardian::named("Ana"), None)
        .await
        .unwrap()
        .resource;

    let rotated = store
        .rotate_guardian_token(owner.id, guardian.id)
        .await
        .unwrap();
    assert_ne!(rotated.access_token, guardian.access_token);
    assert!(matches!(
        store.get_guardian_by_access_token(&guardian.access_token).await,
        Err(StoreError::NotFound(_))
    ));
    assert_eq!(
        store
            .get_guardian_by_access_token(&rotated.access_token)
            .await
            .unwrap()
            .id,
        guardian.id
    );
}

async fn share_link_resolution_ignores_expiry(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "links@x.com").await;
    let now = Utc::now();
    let link = store
        .create_share_link(
            owner.id,
            NewShareLink {
                expires_at: Some(now - Duration::minutes(5)),
                ..NewShareLink::named("expired")
            },
            None,
        )
        .await
        .unwrap()
        .resource;
    assert_eq!(link.token.len(), crate::crypto::tokens::TOKEN_LEN);
    assert!(link.is_active);

    let resolved = store.get_share_link_by_token(&link.token).await.unwrap();
    assert_eq!(resolved.id, link.id);
    assert_eq!(resolved.availability(now), LinkAvailability::Expired);

    let cleared = store
        .update_share_link(
            owner.id,
            link.id,
            ShareLinkUpdate {
                expires_at: Some(None),
                ..ShareLinkUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(cleared.expires_at, None);
    assert_eq!(cleared.availability(now), LinkAvailability::Available);

    store
        .update_share_link(
            owner.id,
            link.id,
            ShareLinkUpdate {
                is_active: Some(false),
                ..ShareLinkUpdate::default()
            },
        )
        .await
        .unwrap();
    assert!(matches!(
        store.get_share_link_by_token(&link.token).await,
        Err(StoreError::NotFound(_))
    ));
    // Owners still see inactive links.
    assert!(!store.get_share_link(owner.id, link.id).await.unwrap().is_active);
}

async fn share_link_usage_is_capped(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "cap@x.com").await;
    let link = store
        .create_share_link(
            owner.id,
            NewShareLink {
                max_uses: 2,
                ..NewShareLink::named("twice")
            },
            None,
        )
        .await
        .unwrap()
        .resource;

    let now = Utc::now();
    let first = store.increment_share_link_usage(link.id, now).await.unwrap();
    assert_eq!(first.usage_count, 1);
    assert!(first.last_used_at.is_some());
    let second = store.increment_share_link_usage(link.id, now).await.unwrap();
    assert_eq!(second.usage_count, 2);
    assert_eq!(second.availability(now), LinkAvailability::Exhausted);

    let err = store
        .increment_share_link_usage(link.id, now)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidData(_)));
    assert_eq!(
        store.get_share_link(owner.id, link.id).await.unwrap().usage_count,
        2
    );

    assert!(matches!(
        store.increment_share_link_usage(9_999, now).await,
        Err(StoreError::NotFound(_))
    ));
}

async fn share_link_access_log(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "log@x.com").await;
    let intruder = user(store, "intruder@x.com").await;
    let link = store
        .create_share_link(owner.id, NewShareLink::named("log"), None)
        .await
        .unwrap()
        .resource;

    for agent in ["first", "second"] {
        store
            .record_share_link_access(
                link.id,
                NewShareLinkAccess {
                    user_agent: Some(agent.into()),
                    ip_address: Some("10.0.0.1".into()),
                    ..NewShareLinkAccess::default()
                },
            )
            .await
            .unwrap();
    }

    let log = store
        .list_share_link_accesses(owner.id, link.id)
        .await
        .unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].user_agent.as_deref(), Some("second"));
    assert!(log.iter().all(|a| a.share_link_id == link.id));

    assert!(matches!(
        store.list_share_link_accesses(intruder.id, link.id).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store
            .record_share_link_access(9_999, NewShareLinkAccess::default())
            .await,
        Err(StoreError::NotFound(_))
    ));

    store.delete_share_link(owner.id, link.id).await.unwrap();
    assert_eq!(backend.rows_owned_by(owner.id).await, 0);
}

async fn shared_items_follow_scope(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "scope@x.com").await;
    let ana = store
        .create_guardian(owner.id, NewGuardian::named("Ana"), None)
        .await
        .unwrap()
        .resource;
    let bia = store
        .create_guardian(owner.id, NewGuardian::named("Bia"), None)
        .await
        .unwrap()
        .resource;

    let shared = |title: &str, category: &str, guardians: Vec<i64>| NewBoxItem {
        category: category.into(),
        is_shared: true,
        guardian_ids: guardians,
        ..NewBoxItem::new(title, "body")
    };
    for item in [
        shared("open finance", "finance", vec![]),
        shared("ana finance", "finance", vec![ana.id]),
        shared("bia health", "health", vec![bia.id]),
        NewBoxItem::new("private", "body"),
    ] {
        store.create_box_item(owner.id, item, None).await.unwrap();
    }

    let titles = |items: Vec<crate::models::BoxItem>| {
        items.into_iter().map(|i| i.title).collect::<Vec<_>>()
    };

    let all = store
        .list_shared_box_items(owner.id, &ShareScope::all())
        .await
        .unwrap();
    assert_eq!(titles(all), vec!["open finance"]);

    let for_ana = store
        .list_shared_box_items(owner.id, &ShareScope::guardian(ana.id))
        .await
        .unwrap();
    assert_eq!(titles(for_ana), vec!["ana finance", "open finance"]);

    let finance_for_bia = ShareScope {
        categories: vec!["finance".into()],
        guardian_ids: vec![bia.id],
    };
    let items = store
        .list_shared_box_items(owner.id, &finance_for_bia)
        .await
        .unwrap();
    assert_eq!(titles(items), vec!["open finance"]);

    let link = store
        .create_share_link(
            owner.id,
            NewShareLink {
                categories: vec!["health".into(), " health ".into(), "".into()],
                guardian_ids: vec![bia.id, bia.id],
                ..NewShareLink::named("health")
            },
            None,
        )
        .await
        .unwrap()
        .resource;
    assert_eq!(link.categories, vec!["health"]);
    assert_eq!(link.guardian_ids, vec![bia.id]);
    let items = store
        .list_shared_box_items(owner.id, &link.scope())
        .await
        .unwrap();
    assert_eq!(titles(items), vec!["bia health"]);
}

async fn sensitive_columns_sealed_at_rest(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "sealed@x.com").await;
    let item = store
        .create_box_item(owner.id, NewBoxItem::new("Bank password", "hunter2"), None)
        .await
        .unwrap()
        .resource;
    let guardian = store
        .create_guardian(owner.id, NewGuardian::named("Maria"), None)
        .await
        .unwrap()
        .resource;

    let raw_title = backend.raw_item_title(item.id).await.unwrap();
    assert!(SensitiveCodec::is_tagged(&raw_title), "{raw_title}");
    assert!(!raw_title.contains("Bank password"));

    let raw_name = backend.raw_guardian_name(guardian.id).await.unwrap();
    assert!(SensitiveCodec::is_tagged(&raw_name));

    let read = store.get_box_item(owner.id, item.id).await.unwrap();
    assert_eq!(read.title, "Bank password");
    assert_eq!(read.content, "hunter2");
    assert_eq!(
        store.get_guardian(owner.id, guardian.id).await.unwrap().name,
        "Maria"
    );
}

async fn legacy_plaintext_stays_readable(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "legacy@x.com").await;
    let item = store
        .create_box_item(owner.id, NewBoxItem::new("sealed", ""), None)
        .await
        .unwrap()
        .resource;

    backend.force_item_title(item.id, "written before encryption").await;
    let read = store.get_box_item(owner.id, item.id).await.unwrap();
    assert_eq!(read.title, "written before encryption");

    let summaries = store.list_box_items(owner.id).await.unwrap();
    assert_eq!(summaries[0].title, "written before encryption");
}

async fn email_is_unique_and_normalized(backend: Backend) {
    let store = backend.store();
    let created = user(store, "  Maria@Example.COM ").await;
    assert_eq!(created.email, "maria@example.com");
    assert_eq!(created.locale, crate::models::DEFAULT_LOCALE);

    let err = store
        .create_user(NewUser::with_email("maria@example.com"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists(_)));

    let found = store.get_user_by_email("MARIA@example.com").await.unwrap();
    assert_eq!(found.id, created.id);

    assert!(matches!(
        store.create_user(NewUser::with_email("   ")).await,
        Err(StoreError::InvalidData(_))
    ));
    assert!(matches!(
        store.get_user_by_email("nobody@example.com").await,
        Err(StoreError::NotFound(_))
    ));
}

async fn federated_identity_is_unique(backend: Backend) {
    let store = backend.store();
    let first = store
        .create_user(NewUser {
            federated_id: Some("oidc|123".into()),
            ..NewUser::with_email("one@x.com")
        })
        .await
        .unwrap();
    let second = user(store, "two@x.com").await;

    assert_eq!(
        store.get_user_by_federated_id("oidc|123").await.unwrap().id,
        first.id
    );
    assert!(matches!(
        store
            .create_user(NewUser {
                federated_id: Some("oidc|123".into()),
                ..NewUser::with_email("three@x.com")
            })
            .await,
        Err(StoreError::AlreadyExists(_))
    ));
    assert!(matches!(
        store.link_federated_identity(second.id, "oidc|123").await,
        Err(StoreError::AlreadyExists(_))
    ));

    let linked = store
        .link_federated_identity(second.id, "oidc|456")
        .await
        .unwrap();
    assert_eq!(linked.federated_id.as_deref(), Some("oidc|456"));
    // Relinking the same identity to its holder is a no-op.
    store
        .link_federated_identity(first.id, "oidc|123")
        .await
        .unwrap();
}

async fn settings_are_materialized(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "settings@x.com").await;

    let defaults = store.get_settings(owner.id).await.unwrap();
    assert_eq!(defaults.theme, UserSettings::DEFAULT_THEME);
    assert_eq!(
        defaults.reminder_interval_days,
        UserSettings::DEFAULT_REMINDER_INTERVAL_DAYS
    );

    let updated = store
        .update_settings(
            owner.id,
            SettingsUpdate {
                theme: Some("dark".into()),
                ..SettingsUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.theme, "dark");
    assert_eq!(updated.notifications_enabled, defaults.notifications_enabled);

    let read = store.get_settings(owner.id).await.unwrap();
    assert_eq!(read.theme, "dark");
    assert_eq!(read.created_at, defaults.created_at);

    assert!(matches!(
        store.get_settings(9_999).await,
        Err(StoreError::NotFound(_))
    ));
}

async fn emergency_protocol_toggles(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "sos@x.com").await;

    let initial = store.get_emergency_protocol(owner.id).await.unwrap();
    assert!(!initial.is_active);
    assert!(initial.activated_at.is_none());

    let active = store.set_emergency_protocol(owner.id, true).await.unwrap();
    assert!(active.is_active);
    let activated_at = active.activated_at;
    assert!(activated_at.is_some());

    let still = store.set_emergency_protocol(owner.id, true).await.unwrap();
    assert_eq!(still.activated_at, activated_at);

    let off = store.set_emergency_protocol(owner.id, false).await.unwrap();
    assert!(!off.is_active);
    assert!(off.deactivated_at.is_some());
    assert!(!store.get_emergency_protocol(owner.id).await.unwrap().is_active);
}

async fn guide_steps_are_recorded_once(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "guide@x.com").await;

    let first = store.mark_guide_step(owner.id, "add-item").await.unwrap();
    let again = store.mark_guide_step(owner.id, " add-item ").await.unwrap();
    assert_eq!(first.id, again.id);
    assert_eq!(again.completed_at, first.completed_at);
    store.mark_guide_step(owner.id, "add-guardian").await.unwrap();

    let steps: Vec<String> = store
        .list_guide_progress(owner.id)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.step_key)
        .collect();
    assert_eq!(steps, vec!["add-item", "add-guardian"]);

    assert!(matches!(
        store.mark_guide_step(owner.id, "").await,
        Err(StoreError::InvalidData(_))
    ));
}

async fn password_reset_lifecycle(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "reset@x.com").await;
    let now = Utc::now();

    let token = store
        .create_password_reset_token(owner.id, "raw-secret", now + Duration::hours(1))
        .await
        .unwrap();
    assert_ne!(token.token_hash, "raw-secret");

    let found = store.get_password_reset_token("raw-secret").await.unwrap();
    assert_eq!(found.id, token.id);
    assert!(found.is_valid(now));

    assert!(matches!(
        store
            .create_password_reset_token(owner.id, "raw-secret", now + Duration::hours(1))
            .await,
        Err(StoreError::AlreadyExists(_))
    ));

    let used = store
        .mark_password_reset_token_used(token.id, now)
        .await
        .unwrap();
    assert!(!used.is_valid(now));
    assert!(matches!(
        store.mark_password_reset_token_used(token.id, now).await,
        Err(StoreError::InvalidData(_))
    ));

    store
        .create_password_reset_token(owner.id, "second", now + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(store.delete_password_reset_tokens(owner.id).await.unwrap(), 2);
    assert!(matches!(
        store.get_password_reset_token("second").await,
        Err(StoreError::NotFound(_))
    ));
}

async fn guardian_ids_must_belong_to_owner(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "owner@x.com").await;
    let other = user(store, "other@x.com").await;
    let foreign = store
        .create_guardian(other.id, NewGuardian::named("not yours"), None)
        .await
        .unwrap()
        .resource;

    let err = store
        .create_box_item(
            owner.id,
            NewBoxItem {
                guardian_ids: vec![foreign.id],
                ..NewBoxItem::new("t", "")
            },
            Some("retry-me"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidData(_)));
    assert_eq!(store.count_box_items(owner.id).await.unwrap(), 0);
    // A rejected create does not burn its idempotency key.
    assert!(store
        .get_idempotency_key(owner.id, "retry-me", ResourceType::BoxItem)
        .await
        .unwrap()
        .is_none());

    let err = store
        .create_share_link(
            owner.id,
            NewShareLink {
                guardian_ids: vec![foreign.id],
                ..NewShareLink::named("l")
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidData(_)));

    let item = store
        .create_box_item(owner.id, NewBoxItem::new("t", ""), None)
        .await
        .unwrap()
        .resource;
    let err = store
        .update_box_item(
            owner.id,
            item.id,
            BoxItemUpdate {
                guardian_ids: Some(vec![foreign.id]),
                title: Some("changed".into()),
                ..BoxItemUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidData(_)));
    assert_eq!(
        store.get_box_item(owner.id, item.id).await.unwrap().title,
        "t"
    );
}

async fn foreign_resources_are_not_found(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "mine@x.com").await;
    let intruder = user(store, "theirs@x.com").await;

    let item = store
        .create_box_item(owner.id, NewBoxItem::new("t", ""), None)
        .await
        .unwrap()
        .resource;
    let guardian = store
        .create_guardian(owner.id, NewGuardian::named("g"), None)
        .await
        .unwrap()
        .resource;
    let link = store
        .create_share_link(owner.id, NewShareLink::named("l"), None)
        .await
        .unwrap()
        .resource;

    let not_found = |r: Result<(), StoreError>| matches!(r, Err(StoreError::NotFound(_)));
    assert!(not_found(store.get_box_item(intruder.id, item.id).await.map(drop)));
    assert!(not_found(
        store
            .update_box_item(intruder.id, item.id, BoxItemUpdate::default())
            .await
            .map(drop)
    ));
    assert!(not_found(store.delete_box_item(intruder.id, item.id).await));
    assert!(not_found(
        store.get_guardian(intruder.id, guardian.id).await.map(drop)
    ));
    assert!(not_found(
        store
            .rotate_guardian_token(intruder.id, guardian.id)
            .await
            .map(drop)
    ));
    assert!(not_found(store.delete_guardian(intruder.id, guardian.id).await));
    assert!(not_found(
        store.get_share_link(intruder.id, link.id).await.map(drop)
    ));
    assert!(not_found(
        store
            .update_share_link(intruder.id, link.id, ShareLinkUpdate::default())
            .await
            .map(drop)
    ));
    assert!(not_found(store.delete_share_link(intruder.id, link.id).await));

    assert!(store.list_box_items(intruder.id).await.unwrap().is_empty());
    assert_eq!(store.count_guardians(intruder.id).await.unwrap(), 0);
    assert!(store.list_share_links(intruder.id).await.unwrap().is_empty());

    // Untouched for the owner.
    assert_eq!(store.list_box_items(owner.id).await.unwrap().len(), 1);
    assert_eq!(store.count_guardians(owner.id).await.unwrap(), 1);
}

async fn guardian_pin_can_be_set_and_cleared(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "pin@x.com").await;
    let guardian = store
        .create_guardian(
            owner.id,
            NewGuardian {
                pin: Some("4321".into()),
                ..NewGuardian::named("Ana")
            },
            None,
        )
        .await
        .unwrap()
        .resource;
    assert!(guardian.has_pin);
    assert!(guardian.verify_pin(Some("4321")));
    assert!(!guardian.verify_pin(Some("0000")));
    assert!(!guardian.verify_pin(None));

    let cleared = store
        .set_guardian_pin(owner.id, guardian.id, None)
        .await
        .unwrap();
    assert!(!cleared.has_pin);
    assert!(cleared.verify_pin(None));

    assert!(matches!(
        store.set_guardian_pin(owner.id, guardian.id, Some("1")).await,
        Err(StoreError::InvalidData(_))
    ));
}

async fn partial_updates_keep_other_fields(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "patch@x.com").await;
    let item = store
        .create_box_item(
            owner.id,
            NewBoxItem {
                recipient: "Ana".into(),
                category: "finance".into(),
                ..NewBoxItem::new("title", "content")
            },
            None,
        )
        .await
        .unwrap()
        .resource;

    let updated = store
        .update_box_item(
            owner.id,
            item.id,
            BoxItemUpdate {
                content: Some("new content".into()),
                is_important: Some(true),
                ..BoxItemUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.title, "title");
    assert_eq!(updated.content, "new content");
    assert_eq!(updated.recipient, "Ana");
    assert_eq!(updated.category, "finance");
    assert!(updated.is_important);
    assert!(updated.updated_at >= item.updated_at);

    assert!(matches!(
        store
            .update_box_item(
                owner.id,
                item.id,
                BoxItemUpdate {
                    title: Some("  ".into()),
                    ..BoxItemUpdate::default()
                },
            )
            .await,
        Err(StoreError::InvalidData(_))
    ));

    let renamed = store
        .update_user(
            owner.id,
            UserUpdate {
                name: Some("Maria".into()),
                ..UserUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(renamed.name, "Maria");
    assert_eq!(renamed.email, "patch@x.com");
}

async fn missing_owner_is_not_found(backend: Backend) {
    let store = backend.store();
    assert!(matches!(
        store
            .create_box_item(404, NewBoxItem::new("t", ""), None)
            .await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store
            .create_guardian(404, NewGuardian::named("g"), None)
            .await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store
            .create_share_link(404, NewShareLink::named("l"), None)
            .await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store.mark_guide_step(404, "step").await,
        Err(StoreError::NotFound(_))
    ));
    store.health_check().await.unwrap();
}

async fn writes_fail_closed_without_encryption(backend: Backend) {
    let store = backend.store();
    let owner = user(store, "plain@x.com").await;

    let err = store
        .create_box_item(owner.id, NewBoxItem::new("secret", "value"), Some("k"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::EncryptionUnavailable));
    assert_eq!(store.count_box_items(owner.id).await.unwrap(), 0);
    assert!(store
        .get_idempotency_key(owner.id, "k", ResourceType::BoxItem)
        .await
        .unwrap()
        .is_none());

    assert!(matches!(
        store
            .create_guardian(owner.id, NewGuardian::named("Ana"), None)
            .await,
        Err(StoreError::EncryptionUnavailable)
    ));
    assert_eq!(store.count_guardians(owner.id).await.unwrap(), 0);

    // Share links carry no sensitive text.
    store
        .create_share_link(owner.id, NewShareLink::named("still works"), None)
        .await
        .unwrap();
}
