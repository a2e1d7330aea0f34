// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::process::ExitCode;

use legacy_vault::config::VaultConfig;
use legacy_vault::error::{StoreError, StoreResult};
use legacy_vault::storage::{SqlStore, VaultStore};
use legacy_vault::telemetry;

const SELF_TEST_PLAINTEXT: &str = "legacy-vault encryption self-test";

#[tokio::main]
async fn main() -> ExitCode {
    let config = match VaultConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            // Telemetry is not up yet.
            eprintln!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = telemetry::init(config.log_format) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, code = e.error_code(), "Vault startup failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &VaultConfig) -> StoreResult<()> {
    tracing::info!(?config, "Opening legacy vault");
    let store = SqlStore::open(config).await?;

    store.health_check().await?;
    encryption_self_test(&store)?;

    tracing::info!(
        encryption = store.codec().is_enabled(),
        max_page_limit = config.max_page_limit,
        "Legacy vault ready"
    );

    store.token_manager().flush().await;
    store.close().await;
    Ok(())
}

/// Round-trip a known value through the codec.
///
/// A wrong passphrase for an existing salt is caught later, when stored
/// envelopes fail to open; this only proves the key is usable.
fn encryption_self_test(store: &SqlStore) -> StoreResult<()> {
    let codec = store.codec();
    if !codec.is_enabled() {
        tracing::warn!("No encryption key configured; sensitive writes will be refused");
        return Ok(());
    }
    let sealed = codec.encrypt_sensitive(SELF_TEST_PLAINTEXT)?;
    let opened = codec.try_decrypt_sensitive(&sealed)?;
    if opened != SELF_TEST_PLAINTEXT {
        return Err(StoreError::Internal(
            "encryption self-test returned a different value".into(),
        ));
    }
    tracing::debug!("Encryption self-test passed");
    Ok(())
}
