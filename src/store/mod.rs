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

//! Persistence seams for accounts and operations.
//!
//! Reads never return soft-deleted rows. The cached account balance is only
//! ever written through [`LedgerStore::commit`], together with the operation
//! rows that justify it, so a backing store that implements `commit` as one
//! transaction can never drift.

mod memory;

pub use memory::MemoryStore;

use crate::LedgerError;
use crate::account::LedgerAccount;
use crate::base::{AccountId, ActorId, OperationId, OrganizationId};
use crate::error::StorageError;
use crate::operation::{LedgerOperation, OperationStatus};
use crate::query::{Page, PageWindow};
use crate::scope::AccountScope;
use chrono::{DateTime, Utc};

/// Durable CRUD for ledger accounts.
pub trait AccountStore: Send + Sync {
    /// Inserts a new account.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidBalance`] if `account.balance` is negative.
    /// - [`StorageError::Conflict`] if a live account already exists for the same pair.
    fn create_account(&self, account: LedgerAccount) -> Result<LedgerAccount, LedgerError>;

    fn get_account(&self, id: AccountId) -> Result<Option<LedgerAccount>, StorageError>;

    /// Most recently created live account tracking `client_organization_id`.
    fn find_account_by_client_organization(
        &self,
        client_organization_id: OrganizationId,
    ) -> Result<Option<LedgerAccount>, StorageError>;

    /// Accounts matching `scope`, newest first.
    fn list_accounts(
        &self,
        scope: &AccountScope,
        window: PageWindow,
    ) -> Result<Page<LedgerAccount>, StorageError>;

    fn delete_account(&self, id: AccountId) -> Result<(), StorageError>;
}

/// Durable CRUD for ledger operations.
///
/// List methods return newest first.
pub trait OperationStore: Send + Sync {
    fn create_operation(&self, operation: LedgerOperation) -> Result<LedgerOperation, StorageError>;

    /// Inserts every operation or none of them.
    fn create_operations(
        &self,
        operations: Vec<LedgerOperation>,
    ) -> Result<Vec<LedgerOperation>, StorageError>;

    fn get_operation(&self, id: OperationId) -> Result<Option<LedgerOperation>, StorageError>;

    fn list_operations(&self, window: PageWindow) -> Result<Page<LedgerOperation>, StorageError>;

    fn operations_by_account(&self, account_id: AccountId)
    -> Result<Vec<LedgerOperation>, StorageError>;

    fn operations_by_actor(&self, actor_id: ActorId) -> Result<Vec<LedgerOperation>, StorageError>;

    fn operations_by_status(
        &self,
        status: OperationStatus,
    ) -> Result<Vec<LedgerOperation>, StorageError>;

    /// Operations of `account_id` created within `[from, to]`; open bounds are unbounded.
    fn operations_by_date_range(
        &self,
        account_id: AccountId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<LedgerOperation>, StorageError>;

    /// Lifetime quantity of live `status` operations, saturating at `i64::MAX`.
    fn total_quantity_by_status(
        &self,
        account_id: AccountId,
        status: OperationStatus,
    ) -> Result<i64, StorageError> {
        Ok(self
            .operations_by_account(account_id)?
            .iter()
            .filter(|op| op.status == status)
            .fold(0i64, |total, op| total.saturating_add(op.quantity)))
    }

    /// Replaces a live operation row, stamping `updated_at`.
    fn update_operation(&self, operation: LedgerOperation) -> Result<LedgerOperation, StorageError>;

    fn delete_operation(&self, id: OperationId) -> Result<(), StorageError>;
}

/// Everything one use case writes, applied atomically by [`LedgerStore::commit`].
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub new_accounts: Vec<LedgerAccount>,
    pub new_operations: Vec<LedgerOperation>,
    /// Full replacement rows; a row with `deleted_at` set is soft-deleted.
    pub updated_operations: Vec<LedgerOperation>,
    /// New cached balance per account.
    pub balances: Vec<(AccountId, i64)>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.new_accounts.is_empty()
            && self.new_operations.is_empty()
            && self.updated_operations.is_empty()
            && self.balances.is_empty()
    }
}

/// A store able to apply a [`WriteBatch`] as one transaction.
pub trait LedgerStore: AccountStore + OperationStore {
    /// Applies every write in `batch` or none of them. Readers never observe
    /// a partially applied batch.
    fn commit(&self, batch: WriteBatch) -> Result<(), StorageError>;
}
