// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use crate::crypto::SensitiveCodec;
use crate::storage::{InMemoryStore, VaultStore};

/// Shared handle passed to request handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn VaultStore>,
}

impl AppState {
    pub fn new(store: impl VaultStore + 'static) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    /// State backed by an [`InMemoryStore`].
    pub fn in_memory(codec: SensitiveCodec) -> Self {
        Self::new(InMemoryStore::new(codec))
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
