// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! This module defines environment variable names and default values used
//! throughout the vault. Configuration is loaded from the environment once at
//! startup into a [`VaultConfig`] and passed explicitly to the store; there is
//! no process-wide mutable state.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATABASE_URL` | SQLite database URL | `sqlite://vault.db` |
//! | `ENCRYPTION_KEY` | Passphrase for sensitive-field encryption | Unset: sensitive writes refused |
//! | `ENCRYPTION_SALT` | Base64 key-derivation salt | Generated once and persisted |
//! | `DB_MAX_CONNECTIONS` | Pool size upper bound | `10` |
//! | `DB_MIN_CONNECTIONS` | Idle connections kept open | `0` |
//! | `DB_MAX_LIFETIME_SECS` | Connection recycle age | `1800` |
//! | `DB_IDLE_TIMEOUT_SECS` | Idle connection close delay | `300` |
//! | `DB_ACQUIRE_TIMEOUT_SECS` | Wait for a pooled connection | `5` |
//! | `PAGE_MAX_LIMIT` | Largest page size a list call may request | `100` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,sqlx=warn` |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::crypto::EncryptionSalt;
use crate::error::{StoreError, StoreResult};
use crate::storage::DEFAULT_MAX_PAGE_LIMIT;

/// Environment variable name for the database URL.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

/// Default database location, relative to the working directory.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://vault.db";

/// Environment variable name for the encryption passphrase.
///
/// When unset the store still starts: legacy plaintext stays readable, but
/// every non-empty sensitive write fails with `EncryptionUnavailable`.
pub const ENCRYPTION_KEY_ENV: &str = "ENCRYPTION_KEY";

/// Environment variable name for an externally managed salt.
///
/// When unset the salt is generated on first boot and stored in
/// `system_config`. Changing it after data was written makes that data
/// unreadable.
pub const ENCRYPTION_SALT_ENV: &str = "ENCRYPTION_SALT";

pub const DB_MAX_CONNECTIONS_ENV: &str = "DB_MAX_CONNECTIONS";
pub const DB_MIN_CONNECTIONS_ENV: &str = "DB_MIN_CONNECTIONS";
pub const DB_MAX_LIFETIME_SECS_ENV: &str = "DB_MAX_LIFETIME_SECS";
pub const DB_IDLE_TIMEOUT_SECS_ENV: &str = "DB_IDLE_TIMEOUT_SECS";
pub const DB_ACQUIRE_TIMEOUT_SECS_ENV: &str = "DB_ACQUIRE_TIMEOUT_SECS";

pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_DB_MIN_CONNECTIONS: u32 = 0;
pub const DEFAULT_DB_MAX_LIFETIME_SECS: u64 = 1800;
pub const DEFAULT_DB_IDLE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 5;

/// Environment variable name for the page size ceiling.
pub const PAGE_MAX_LIMIT_ENV: &str = "PAGE_MAX_LIMIT";

/// Environment variable name for the log output format.
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(StoreError::Config(format!(
                "{LOG_FORMAT_ENV} must be 'json' or 'pretty', got '{other}'"
            ))),
        }
    }
}

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            min_connections: DEFAULT_DB_MIN_CONNECTIONS,
            max_lifetime: Duration::from_secs(DEFAULT_DB_MAX_LIFETIME_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_DB_IDLE_TIMEOUT_SECS),
            acquire_timeout: Duration::from_secs(DEFAULT_DB_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

impl DatabaseConfig {
    /// Pool settings for a database URL with default limits.
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Everything needed to open the vault.
#[derive(Clone)]
pub struct VaultConfig {
    pub database: DatabaseConfig,
    /// Encryption passphrase. Redacted from `Debug`.
    pub encryption_key: Option<String>,
    pub encryption_salt: Option<EncryptionSalt>,
    pub max_page_limit: u32,
    pub log_format: LogFormat,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            encryption_key: None,
            encryption_salt: None,
            max_page_limit: DEFAULT_MAX_PAGE_LIMIT,
            log_format: LogFormat::default(),
        }
    }
}

impl fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultConfig")
            .field("database", &self.database)
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("encryption_salt", &self.encryption_salt)
            .field("max_page_limit", &self.max_page_limit)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl VaultConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> StoreResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key/value source.
    ///
    /// Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> StoreResult<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database = DatabaseConfig {
            url: get(DATABASE_URL_ENV).unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            max_connections: parse_or(&get, DB_MAX_CONNECTIONS_ENV, DEFAULT_DB_MAX_CONNECTIONS)?,
            min_connections: parse_or(&get, DB_MIN_CONNECTIONS_ENV, DEFAULT_DB_MIN_CONNECTIONS)?,
            max_lifetime: Duration::from_secs(parse_or(
                &get,
                DB_MAX_LIFETIME_SECS_ENV,
                DEFAULT_DB_MAX_LIFETIME_SECS,
            )?),
            idle_timeout: Duration::from_secs(parse_or(
                &get,
                DB_IDLE_TIMEOUT_SECS_ENV,
                DEFAULT_DB_IDLE_TIMEOUT_SECS,
            )?),
            acquire_timeout: Duration::from_secs(parse_or(
                &get,
                DB_ACQUIRE_TIMEOUT_SECS_ENV,
                DEFAULT_DB_ACQUIRE_TIMEOUT_SECS,
            )?),
        };

        if database.max_connections == 0 {
            return Err(StoreError::Config(format!(
                "{DB_MAX_CONNECTIONS_ENV} must be at least 1"
            )));
        }
        if database.min_connections > database.max_connections {
            return Err(StoreError::Config(format!(
                "{DB_MIN_CONNECTIONS_ENV} ({}) exceeds {DB_MAX_CONNECTIONS_ENV} ({})",
                database.min_connections, database.max_connections
            )));
        }

        let encryption_salt = get(ENCRYPTION_SALT_ENV)
            .map(|encoded| {
                EncryptionSalt::from_encoded(&encoded)
                    .map_err(|e| StoreError::Config(format!("{ENCRYPTION_SALT_ENV}: {e}")))
            })
            .transpose()?;

        let max_page_limit = parse_or(&get, PAGE_MAX_LIMIT_ENV, DEFAULT_MAX_PAGE_LIMIT)?;
        if max_page_limit == 0 {
            return Err(StoreError::Config(format!(
                "{PAGE_MAX_LIMIT_ENV} must be at least 1"
            )));
        }

        let log_format = get(LOG_FORMAT_ENV)
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            database,
            encryption_key: get(ENCRYPTION_KEY_ENV),
            encryption_salt,
            max_page_limit,
            log_format,
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> StoreResult<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| StoreError::Config(format!("{key}='{raw}' is invalid: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = VaultConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.database, DatabaseConfig::default());
        assert_eq!(config.database.url, DEFAULT_DATABASE_URL);
        assert!(config.encryption_key.is_none());
        assert!(config.encryption_salt.is_none());
        assert_eq!(config.max_page_limit, DEFAULT_MAX_PAGE_LIMIT);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn values_are_read() {
        let salt = EncryptionSalt::generate().unwrap();
        let encoded = salt.encode();
        let config = VaultConfig::from_lookup(lookup(&[
            (DATABASE_URL_ENV, "sqlite:///var/lib/vault/vault.db"),
            (ENCRYPTION_KEY_ENV, "correct horse battery staple"),
            (ENCRYPTION_SALT_ENV, encoded.as_str()),
            (DB_MAX_CONNECTIONS_ENV, "4"),
            (DB_MIN_CONNECTIONS_ENV, "1"),
            (DB_ACQUIRE_TIMEOUT_SECS_ENV, "2"),
            (PAGE_MAX_LIMIT_ENV, "50"),
            (LOG_FORMAT_ENV, "JSON"),
        ]))
        .unwrap();

        assert_eq!(config.database.url, "sqlite:///var/lib/vault/vault.db");
        assert_eq!(config.database.max_connections, 4);
        assert_eq!(config.database.min_connections, 1);
        assert_eq!(config.database.acquire_timeout, Duration::from_secs(2));
        assert_eq!(config.encryption_salt, Some(salt));
        assert_eq!(config.max_page_limit, 50);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn empty_values_count_as_unset() {
        let config =
            VaultConfig::from_lookup(lookup(&[(ENCRYPTION_KEY_ENV, ""), (ENCRYPTION_SALT_ENV, " ")]))
                .unwrap();
        assert!(config.encryption_key.is_none());
        assert!(config.encryption_salt.is_none());
    }

    #[test]
    fn malformed_values_are_fatal() {
        for pairs in [
            &[(DB_MAX_CONNECTIONS_ENV, "ten")][..],
            &[(DB_MAX_CONNECTIONS_ENV, "0")][..],
            &[(DB_MIN_CONNECTIONS_ENV, "20")][..],
            &[(PAGE_MAX_LIMIT_ENV, "-1")][..],
            &[(PAGE_MAX_LIMIT_ENV, "0")][..],
            &[(ENCRYPTION_SALT_ENV, "not base64!")][..],
            &[(ENCRYPTION_SALT_ENV, "c2hvcnQ=")][..],
            &[(LOG_FORMAT_ENV, "xml")][..],
        ] {
            let err = VaultConfig::from_lookup(lookup(pairs)).unwrap_err();
            assert!(matches!(err, StoreError::Config(_)), "{pairs:?}: {err}");
        }
    }

    #[test]
    fn passphrase_redacted_from_debug() {
        let config = VaultConfig::from_lookup(lookup(&[(
            ENCRYPTION_KEY_ENV,
            "correct horse battery staple",
        )]))
        .unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("battery"));
        assert!(debug.contains("[REDACTED]"));
    }
}
