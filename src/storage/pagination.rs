// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Cursor pagination over per-user collections.
//!
//! Rows are ordered by id descending (newest first). The cursor is the id of
//! the last row of the previous page and is exclusive: the next page starts
//! strictly below it. Backends fetch `limit + 1` rows; the extra row only
//! signals that another page exists and is never returned.

use serde::{Deserialize, Serialize};

/// Page size used when the caller does not ask for one.
pub const DEFAULT_PAGE_LIMIT: u32 = 20;

/// Upper bound applied when no other maximum is configured.
pub const DEFAULT_MAX_PAGE_LIMIT: u32 = 100;

/// Pagination parameters for list operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Exclusive upper bound on ids; `None` starts from the newest row.
    #[serde(default)]
    pub cursor: Option<i64>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl PageRequest {
    pub fn first(limit: u32) -> Self {
        Self {
            cursor: None,
            limit: Some(limit),
        }
    }

    pub fn after(cursor: i64, limit: u32) -> Self {
        Self {
            cursor: Some(cursor),
            limit: Some(limit),
        }
    }

    /// Requested limit clamped to `[1, max]`.
    pub fn effective_limit(&self, max: u32) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, max.max(1))
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Id of the last item, present exactly when `has_more` is true.
    pub next_cursor: Option<i64>,
    pub has_more: bool,
}

impl<T> Page<T> {
    /// Build a page from up to `limit + 1` rows fetched in id-descending order.
    pub(crate) fn from_rows(mut rows: Vec<T>, limit: u32, id_of: impl Fn(&T) -> i64) -> Self {
        let limit = limit as usize;
        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let next_cursor = if has_more { rows.last().map(&id_of) } else { None };
        Self {
            items: rows,
            next_cursor,
            has_more,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            next_cursor: self.next_cursor,
            has_more: self.has_more,
        }
    }
}
