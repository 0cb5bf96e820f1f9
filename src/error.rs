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

//! Error types for ledger operations.

use crate::base::{AccountId, OperationId, OrganizationId};
use std::fmt;
use thiserror::Error;

/// How a caller referred to an account that could not be found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountRef {
    Id(AccountId),
    ClientOrganization(OrganizationId),
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountRef::Id(id) => write!(f, "id {id}"),
            AccountRef::ClientOrganization(org) => write!(f, "client organization {org}"),
        }
    }
}

/// Failures reported by a backing store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A uniqueness constraint was violated
    #[error("storage conflict: {0}")]
    Conflict(String),

    /// A row referenced by a write does not exist
    #[error("storage row not found: {0}")]
    NotFound(String),

    /// The store could not be reached or refused the request
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Ledger processing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Initial balance is negative
    #[error("invalid balance {0} (must not be negative)")]
    InvalidBalance(i64),

    /// Referenced account does not exist or is deleted
    #[error("account not found for {0}")]
    AccountNotFound(AccountRef),

    /// Referenced operation does not exist or is deleted
    #[error("operation {0} not found")]
    OperationNotFound(OperationId),

    /// An account has to be created but no managing agency was supplied
    #[error("managing agency id is required to create an account")]
    AgencyIdRequired,

    /// The request names no account, operation account or client organization
    #[error("request does not reference an account")]
    MissingAccountReference,

    /// Operation failed validation
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The change would drive the balance below zero
    #[error("insufficient balance on account {account_id}: available {available}, requested {requested}")]
    InsufficientBalance {
        account_id: AccountId,
        available: i64,
        requested: i64,
    },

    /// Caller's role may not access the requested accounts
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Cached balance disagrees with the replayed operation log
    #[error("balance drift on account {account_id}: cached {cached}, derived {derived}")]
    BalanceDrift {
        account_id: AccountId,
        cached: i64,
        derived: i64,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl LedgerError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        LedgerError::InvalidOperation(reason.into())
    }
}
