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

//! # Credit Ledger
//!
//! This library keeps prepaid credit balances for client organizations managed
//! by agencies. Every change to a balance is an immutable operation
//! (purchase, consumption, refund, lock, lock release); the account's cached
//! balance is always the fold of its live operations.
//!
//! ## Core Components
//!
//! - [`LedgerService`]: Orchestrates every use case and keeps cached balances consistent
//! - [`AccountResolver`]: Locates (or lazily creates) the account a request targets
//! - [`BalanceAccumulator`]: Derives balances and enforces the non-negative policy
//! - [`HistoryTracker`]: Appends audit entries for post-hoc quantity changes
//! - [`LedgerStore`]: Persistence seam with an in-memory [`MemoryStore`]
//! - [`LedgerError`]: Error types for ledger failures
//!
//! ## Example
//!
//! ```
//! use credit_ledger::{
//!     ActorId, ApplyOperationsRequest, CreateAccountRequest, LedgerService, OperationInput,
//!     OperationStatus, OrganizationId,
//! };
//!
//! let service = LedgerService::new();
//! let actor = ActorId::new();
//!
//! let account = service
//!     .create_account(CreateAccountRequest::new(OrganizationId::new(), OrganizationId::new()))
//!     .unwrap();
//!
//! let view = service
//!     .apply_operations(ApplyOperationsRequest::for_account(
//!         account.id,
//!         vec![
//!             OperationInput::new(actor, OperationStatus::Purchased, 100),
//!             OperationInput::new(actor, OperationStatus::Consumed, 30),
//!         ],
//!     ))
//!     .unwrap();
//! assert_eq!(view.balance, 70);
//! assert_eq!(service.recompute(account.id).unwrap(), 70);
//! ```
//!
//! ## Thread Safety
//!
//! Mutations are serialized per account, so operations on different accounts
//! proceed in parallel. Each use case commits its rows and the new balance in
//! a single atomic [`WriteBatch`].

pub mod account;
pub mod accumulator;
mod base;
pub mod config;
pub mod error;
pub mod history;
mod lock;
pub mod operation;
pub mod query;
pub mod resolver;
pub mod scope;
pub mod service;
pub mod store;

pub use account::{AccountView, LedgerAccount, OperationView};
pub use accumulator::{BalanceAccumulator, BalanceSummary, StatusTotals};
pub use base::{AccountId, ActorId, OperationId, OrganizationId};
pub use config::{BalancePolicy, LedgerConfig, PaginationDefaults};
pub use error::{AccountRef, LedgerError, StorageError};
pub use history::{ChangeContext, HistoryTracker};
pub use operation::{
    HistoryAction, HistoryEntry, LedgerOperation, OperationInput, OperationKind, OperationMetadata,
    OperationStatus,
};
pub use query::{Page, PageInfo, PaginationConfig};
pub use resolver::{AccountReference, AccountResolver, CreatePolicy, Resolution};
pub use scope::{AccountScope, Role, SessionContext};
pub use service::{
    AccountLookup, ApplyOperationsRequest, CorrectOperationRequest, CreateAccountRequest,
    CreditChange, LedgerService, RemoveOperationsRequest, TransferOutcome, TransferRequest,
};
pub use store::{AccountStore, LedgerStore, MemoryStore, OperationStore, WriteBatch};
