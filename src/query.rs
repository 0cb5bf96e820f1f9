// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Offset-based pagination.

use crate::config::PaginationDefaults;
use serde::{Deserialize, Serialize};

/// Caller-requested page. Missing fields fall back to [`PaginationDefaults`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaginationConfig {
    pub limit: Option<usize>,
    pub page: Option<usize>,
}

impl PaginationConfig {
    pub fn new(limit: usize, page: usize) -> Self {
        Self {
            limit: Some(limit),
            page: Some(page),
        }
    }

    /// Applies defaults and clamps `limit` to `1..=max_limit` and `page` to `>= 1`.
    pub fn window(&self, defaults: &PaginationDefaults) -> PageWindow {
        let limit = self
            .limit
            .unwrap_or(defaults.default_limit)
            .clamp(1, defaults.max_limit.max(1));
        let page = self.page.unwrap_or(1).max(1);
        PageWindow { limit, page }
    }
}

/// A resolved page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub limit: usize,
    pub page: usize,
}

impl PageWindow {
    pub fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.limit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub limit: usize,
    pub has_next_page: bool,
    pub total_pages: Option<usize>,
    pub current_page: usize,
    pub is_offset_based: bool,
}

/// One page of results plus the total match count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub data: Vec<T>,
    /// Next page number, if any.
    pub next_cursor: Option<String>,
    pub count: usize,
    pub pagination: PageInfo,
}

impl<T> Page<T> {
    /// Cuts `window` out of the full, already ordered, result set.
    pub fn paginate(items: Vec<T>, window: PageWindow) -> Self {
        let count = items.len();
        let offset = window.offset();
        let has_next_page = offset.saturating_add(window.limit) < count;
        let total_pages = (count > 0).then(|| count.div_ceil(window.limit));
        let data = items.into_iter().skip(offset).take(window.limit).collect();

        Self {
            data,
            next_cursor: has_next_page.then(|| (window.page + 1).to_string()),
            count,
            pagination: PageInfo {
                limit: window.limit,
                has_next_page,
                total_pages,
                current_page: window.page,
                is_offset_based: true,
            },
        }
    }

    pub fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<Page<U>, E> {
        Ok(Page {
            data: self.data.into_iter().map(f).collect::<Result<_, _>>()?,
            next_cursor: self.next_cursor,
            count: self.count,
            pagination: self.pagination,
        })
    }
}
