// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Legacy Vault - Encrypted Storage & Access-Control Layer
//!
//! Persistence core of the digital legacy vault. Users keep sensitive box
//! items, designate guardians and hand out share links; this crate stores
//! all of it with sensitive fields sealed at rest.
//!
//! ## Modules
//!
//! - `config` - Environment configuration
//! - `crypto` - Field encryption, access tokens and PIN hashing
//! - `error` - Store error type
//! - `models` - Domain records and inputs
//! - `sharing` - Share-link and guardian access checks
//! - `state` - Shared application state
//! - `storage` - The `VaultStore` contract (in-memory and SQLite backends)
//! - `telemetry` - Tracing subscriber setup

pub mod config;
pub mod crypto;
pub mod error;
pub mod models;
pub mod sharing;
pub mod state;
pub mod storage;
pub mod telemetry;
