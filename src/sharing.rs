// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Share Access
//!
//! The gate a share link or guardian token passes before any vault content is
//! revealed. Each step is an ordinary [`VaultStore`] call; this module fixes
//! their order:
//!
//! ```text
//! resolve token → availability → PIN → count use → log access → list items
//! ```
//!
//! Usage is only counted once the PIN is accepted, so a wrong PIN never burns
//! one of a capped link's uses.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::models::{
    BoxItem, Guardian, LinkAvailability, NewShareLinkAccess, ShareLink, ShareLinkAccess,
    ShareScope,
};
use crate::storage::VaultStore;

/// Reasons an access attempt is refused.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    /// Unknown token, or a link that has been deactivated.
    #[error("no active share link or guardian for this token")]
    NotFound,

    #[error("share link has expired")]
    Expired,

    #[error("share link has reached its usage limit")]
    Exhausted,

    #[error("PIN missing or incorrect")]
    PinRejected,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AccessError {
    /// Stable machine-readable code.
    pub fn error_code(&self) -> &'static str {
        match self {
            AccessError::NotFound => "not_found",
            AccessError::Expired => "link_expired",
            AccessError::Exhausted => "link_exhausted",
            AccessError::PinRejected => "pin_rejected",
            AccessError::Store(e) => e.error_code(),
        }
    }
}

fn resolve_error(err: StoreError) -> AccessError {
    match err {
        StoreError::NotFound(_) => AccessError::NotFound,
        other => AccessError::Store(other),
    }
}

/// A successfully opened share link.
#[derive(Debug, Clone)]
pub struct OpenedShareLink {
    /// The link after its use was counted.
    pub link: ShareLink,
    pub access: ShareLinkAccess,
    /// Shared items within the link's scope, newest first.
    pub items: Vec<BoxItem>,
}

/// Open a share link on behalf of an anonymous visitor.
pub async fn open_share_link(
    store: &dyn VaultStore,
    token: &str,
    pin: Option<&str>,
    now: DateTime<Utc>,
    access: NewShareLinkAccess,
) -> Result<OpenedShareLink, AccessError> {
    let link = store
        .get_share_link_by_token(token)
        .await
        .map_err(resolve_error)?;

    match link.availability(now) {
        LinkAvailability::Available => {}
        LinkAvailability::Inactive => return Err(AccessError::NotFound),
        LinkAvailability::Expired => return Err(AccessError::Expired),
        LinkAvailability::Exhausted => return Err(AccessError::Exhausted),
    }

    if !link.verify_pin(pin) {
        warn!(share_link_id = link.id, "Share link PIN rejected");
        return Err(AccessError::PinRejected);
    }

    // A concurrent visitor may take the last use between the check above and
    // this increment.
    let link = match store.increment_share_link_usage(link.id, now).await {
        Ok(link) => link,
        Err(StoreError::InvalidData(_)) => return Err(AccessError::Exhausted),
        Err(StoreError::NotFound(_)) => return Err(AccessError::NotFound),
        Err(e) => return Err(e.into()),
    };

    let access = store.record_share_link_access(link.id, access).await?;
    let items = store.list_shared_box_items(link.user_id, &link.scope()).await?;

    info!(
        share_link_id = link.id,
        user_id = link.user_id,
        usage_count = link.usage_count,
        items = items.len(),
        "Share link opened"
    );
    Ok(OpenedShareLink {
        link,
        access,
        items,
    })
}

/// A guardian who presented a valid access token.
#[derive(Debug, Clone)]
pub struct GuardianAccess {
    pub guardian: Guardian,
    /// Shared items visible to this guardian, newest first.
    pub items: Vec<BoxItem>,
}

/// Open the vault view of the guardian holding `token`.
pub async fn open_guardian_access(
    store: &dyn VaultStore,
    token: &str,
    pin: Option<&str>,
) -> Result<GuardianAccess, AccessError> {
    let guardian = store
        .get_guardian_by_access_token(token)
        .await
        .map_err(resolve_error)?;

    if !guardian.verify_pin(pin) {
        warn!(guardian_id = guardian.id, "Guardian PIN rejected");
        return Err(AccessError::PinRejected);
    }

    let items = store
        .list_shared_box_items(guardian.user_id, &ShareScope::guardian(guardian.id))
        .await?;
    info!(
        guardian_id = guardian.id,
        user_id = guardian.user_id,
        items = items.len(),
        "Guardian access granted"
    );
    Ok(GuardianAccess { guardian, items })
}
