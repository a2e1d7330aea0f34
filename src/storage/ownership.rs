// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Ownership enforcement for storage lookups.
//!
//! Every owner-scoped lookup is parameterized by owner id and resource id. A
//! resource that exists but belongs to someone else is reported exactly like
//! a missing one, so callers cannot probe for other users' ids.

use crate::error::{StoreError, StoreResult};
use crate::models::UserId;

/// Trait for resources that have an owner.
pub trait OwnedResource {
    fn owner_id(&self) -> UserId;
}

/// Extension trait turning a lookup result into an owner-checked resource.
pub trait OwnershipCheck<T> {
    /// Return the resource if `owner` owns it, `NotFound(what)` otherwise.
    fn owned_by(self, owner: UserId, what: impl FnOnce() -> String) -> StoreResult<T>;
}

impl<T: OwnedResource> OwnershipCheck<T> for Option<T> {
    fn owned_by(self, owner: UserId, what: impl FnOnce() -> String) -> StoreResult<T> {
        match self {
            Some(resource) if resource.owner_id() == owner => Ok(resource),
            _ => Err(StoreError::NotFound(what())),
        }
    }
}
