// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Guardian access-token upgrade.
//!
//! Every guardian read passes through [`AccessTokenManager::ensure_current`].
//! A missing or legacy-format token is replaced in the returned value at once
//! and the replacement is queued for a background write. The read path never
//! waits on that write.
//!
//! ## Invariants
//!
//! - Legacy tokens never authorize ([`crate::crypto::tokens::is_legacy_token`]
//!   lookups are rejected before they reach the database).
//! - One replacement per (guardian, previous token). Reads that still see the
//!   old token, whether before or after the write lands, are handed the same
//!   replacement, so every token a caller observes is the one that ends up
//!   stored.
//! - Repair writes are compare-and-swap on the previous token and succeed
//!   again if the replacement is already stored. A write that finds some other
//!   token (a rotation, another process) drops the pending replacement.
//! - A failed write is retried by the next read that sees the old token.
//!
//! Pending replacements are kept for the life of the manager, one per
//! repaired guardian; [`AccessTokenManager::forget`] drops them when a token
//! is rotated or the guardian is deleted.
//!
//! The worker runs until the manager is dropped, following the same
//! `CancellationToken` shutdown as the other background loops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crypto::tokens::{generate_token, is_legacy_token};
use crate::error::StoreResult;
use crate::models::{Guardian, GuardianId, UserId};

/// Storage hook the repair worker writes through.
#[async_trait]
pub trait TokenRepairSink: Send + Sync + 'static {
    /// Store `replacement` if the stored token still equals `previous` or
    /// already equals `replacement`.
    ///
    /// Returns `false` when the guardian is gone or holds some other token.
    async fn replace_access_token(
        &self,
        guardian_id: GuardianId,
        previous: Option<&str>,
        replacement: &str,
    ) -> StoreResult<bool>;
}

/// A queued token replacement.
#[derive(Debug, Clone)]
pub struct TokenRepair {
    pub guardian_id: GuardianId,
    pub user_id: UserId,
    pub previous: Option<String>,
    pub replacement: String,
}

impl TokenRepair {
    fn key(&self) -> PendingKey {
        (self.guardian_id, self.previous.clone())
    }
}

enum RepairMessage {
    Persist(TokenRepair),
    Flush(oneshot::Sender<()>),
}

type PendingKey = (GuardianId, Option<String>);

struct PendingRepair {
    replacement: String,
    /// A write for this replacement is in the queue.
    queued: bool,
}

#[derive(Default)]
struct PendingRepairs(Mutex<HashMap<PendingKey, PendingRepair>>);

impl PendingRepairs {
    fn lock(&self) -> MutexGuard<'_, HashMap<PendingKey, PendingRepair>> {
        // Entries are updated in single statements, so a poisoned map is
        // still consistent.
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Upgrades legacy guardian tokens and persists the upgrades off the read path.
pub struct AccessTokenManager {
    tx: mpsc::UnboundedSender<RepairMessage>,
    pending: Arc<PendingRepairs>,
    shutdown: CancellationToken,
}

impl AccessTokenManager {
    /// Start the repair worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(sink: Arc<dyn TokenRepairSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingRepairs::default());
        let shutdown = CancellationToken::new();
        let worker = TokenRepairWorker {
            sink,
            rx,
            pending: pending.clone(),
        };
        tokio::spawn(worker.run(shutdown.clone()));
        Self {
            tx,
            pending,
            shutdown,
        }
    }

    /// Make sure `guardian` carries a current-format token.
    ///
    /// Returns `true` when the token was replaced. The new token is in
    /// `guardian` immediately; persistence happens in the background.
    pub fn ensure_current(&self, guardian: &mut Guardian) -> StoreResult<bool> {
        if !is_legacy_token(&guardian.access_token) {
            return Ok(false);
        }

        let previous = (!guardian.access_token.is_empty()).then(|| guardian.access_token.clone());
        let key = (guardian.id, previous.clone());

        let (replacement, enqueue) = {
            let mut pending = self.pending.lock();
            match pending.get_mut(&key) {
                Some(entry) => {
                    let enqueue = !entry.queued;
                    entry.queued = true;
                    (entry.replacement.clone(), enqueue)
                }
                None => {
                    let replacement = generate_token()?;
                    pending.insert(
                        key,
                        PendingRepair {
                            replacement: replacement.clone(),
                            queued: true,
                        },
                    );
                    warn!(
                        guardian_id = guardian.id,
                        user_id = guardian.user_id,
                        had_token = previous.is_some(),
                        "Guardian access token missing or legacy, issuing replacement"
                    );
                    (replacement, true)
                }
            }
        };

        guardian.access_token = replacement.clone();
        if enqueue {
            self.schedule(TokenRepair {
                guardian_id: guardian.id,
                user_id: guardian.user_id,
                previous,
                replacement,
            });
        }
        Ok(true)
    }

    /// Drop pending replacements for `guardian_id`.
    ///
    /// Called when the stored token is replaced outside the repair path.
    pub fn forget(&self, guardian_id: GuardianId) {
        self.pending.lock().retain(|(id, _), _| *id != guardian_id);
    }

    /// Queue a repair. Never blocks and never fails the caller.
    pub fn schedule(&self, repair: TokenRepair) {
        let guardian_id = repair.guardian_id;
        let key = repair.key();
        if self.tx.send(RepairMessage::Persist(repair)).is_err() {
            if let Some(entry) = self.pending.lock().get_mut(&key) {
                entry.queued = false;
            }
            warn!(guardian_id, "Token repair worker stopped, repair dropped");
        }
    }

    /// Wait until every repair queued before this call has been attempted.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(RepairMessage::Flush(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}

impl Drop for AccessTokenManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for AccessTokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessTokenManager")
            .field("running", &!self.tx.is_closed())
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

struct TokenRepairWorker {
    sink: Arc<dyn TokenRepairSink>,
    rx: mpsc::UnboundedReceiver<RepairMessage>,
    pending: Arc<PendingRepairs>,
}

impl TokenRepairWorker {
    async fn run(mut self, shutdown: CancellationToken) {
        debug!("Token repair worker starting");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Token repair worker shutting down");
                    return;
                }
                message = self.rx.recv() => match message {
                    Some(RepairMessage::Persist(repair)) => self.persist(repair).await,
                    Some(RepairMessage::Flush(done)) => {
                        let _ = done.send(());
                    }
                    None => return,
                },
            }
        }
    }

    async fn persist(&self, repair: TokenRepair) {
        let outcome = self
            .sink
            .replace_access_token(
                repair.guardian_id,
                repair.previous.as_deref(),
                &repair.replacement,
            )
            .await;

        {
            let key = repair.key();
            let mut pending = self.pending.lock();
            let owns_entry = pending
                .get(&key)
                .is_some_and(|entry| entry.replacement == repair.replacement);
            if owns_entry {
                match outcome {
                    Ok(false) => {
                        pending.remove(&key);
                    }
                    _ => {
                        if let Some(entry) = pending.get_mut(&key) {
                            entry.queued = false;
                        }
                    }
                }
            }
        }

        match outcome {
            Ok(true) => info!(
                guardian_id = repair.guardian_id,
                user_id = repair.user_id,
                "Guardian access token upgraded"
            ),
            Ok(false) => debug!(
                guardian_id = repair.guardian_id,
                "Guardian token already replaced, skipping repair"
            ),
            Err(e) => warn!(
                guardian_id = repair.guardian_id,
                error = %e,
                "Failed to persist repaired guardian token"
            ),
        }
    }
}
