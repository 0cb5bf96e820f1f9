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

//! In-memory ledger store.
//!
//! Rows live in [`DashMap`]s keyed by id. Every row carries the sequence
//! number of the commit that inserted it, which gives a stable newest-first
//! order even when timestamps collide. A store-wide [`RwLock`] gate turns
//! each [`WriteBatch`] into a single atomic step: writers hold it exclusively
//! while validating and applying, readers hold it shared.

use super::{AccountStore, LedgerStore, OperationStore, WriteBatch};
use crate::LedgerError;
use crate::account::LedgerAccount;
use crate::base::{AccountId, ActorId, OperationId, OrganizationId};
use crate::error::StorageError;
use crate::operation::{LedgerOperation, OperationStatus};
use crate::query::{Page, PageWindow};
use crate::scope::AccountScope;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone)]
struct Stored<T> {
    seq: u64,
    row: T,
}

/// Thread-safe in-memory implementation of [`LedgerStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    accounts: DashMap<AccountId, Stored<LedgerAccount>>,
    /// Live account per (managing agency, client organization) pair.
    live_pairs: DashMap<(OrganizationId, OrganizationId), AccountId>,
    operations: DashMap<OperationId, Stored<LedgerOperation>>,
    sequence: AtomicU64,
    gate: RwLock<()>,
    injected_failure: Mutex<Option<StorageError>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next commit fail with `error` without writing anything.
    pub fn fail_next_commit(&self, error: StorageError) {
        *self.injected_failure.lock() = Some(error);
    }

    /// Number of account rows, soft-deleted ones included.
    pub fn account_rows(&self) -> usize {
        let _read = self.gate.read();
        self.accounts.len()
    }

    /// Number of operation rows, soft-deleted ones included.
    pub fn operation_rows(&self) -> usize {
        let _read = self.gate.read();
        self.operations.len()
    }

    fn next_seq(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Live operations matching `predicate`, newest first.
    fn collect_operations(
        &self,
        predicate: impl Fn(&LedgerOperation) -> bool,
    ) -> Vec<LedgerOperation> {
        let _read = self.gate.read();
        let mut rows: Vec<(u64, LedgerOperation)> = self
            .operations
            .iter()
            .filter(|entry| !entry.row.is_deleted() && predicate(&entry.row))
            .map(|entry| (entry.seq, entry.row.clone()))
            .collect();
        rows.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        rows.into_iter().map(|(_, op)| op).collect()
    }

    fn live_account_exists(&self, id: &AccountId) -> bool {
        self.accounts
            .get(id)
            .is_some_and(|entry| !entry.row.is_deleted())
    }

    /// Rejects the batch if any write would violate a constraint. Caller holds the write gate.
    fn check_batch(&self, batch: &WriteBatch) -> Result<(), StorageError> {
        let mut new_account_ids = HashSet::new();
        let mut new_pairs = HashSet::new();
        for account in &batch.new_accounts {
            let pair = (account.managing_agency_id, account.client_organization_id);
            if self.accounts.contains_key(&account.id) || !new_account_ids.insert(account.id) {
                return Err(StorageError::Conflict(format!("account {} already exists", account.id)));
            }
            if self.live_pairs.contains_key(&pair) || !new_pairs.insert(pair) {
                return Err(StorageError::Conflict(format!(
                    "an account already exists for agency {} and client organization {}",
                    pair.0, pair.1
                )));
            }
        }

        let account_known =
            |id: &AccountId| new_account_ids.contains(id) || self.live_account_exists(id);

        let mut new_operation_ids = HashSet::new();
        for op in &batch.new_operations {
            if self.operations.contains_key(&op.id) || !new_operation_ids.insert(op.id) {
                return Err(StorageError::Conflict(format!("operation {} already exists", op.id)));
            }
            if !account_known(&op.account_id) {
                return Err(StorageError::NotFound(format!("account {}", op.account_id)));
            }
        }

        for op in &batch.updated_operations {
            let live = self
                .operations
                .get(&op.id)
                .is_some_and(|entry| !entry.row.is_deleted());
            if !live {
                return Err(StorageError::NotFound(format!("operation {}", op.id)));
            }
        }

        for (account_id, _) in &batch.balances {
            if !account_known(account_id) {
                return Err(StorageError::NotFound(format!("account {account_id}")));
            }
        }

        Ok(())
    }

    /// Applies a checked batch. Caller holds the write gate.
    fn apply_batch(&self, batch: WriteBatch) {
        let now = Utc::now();

        for account in batch.new_accounts {
            let pair = (account.managing_agency_id, account.client_organization_id);
            self.live_pairs.insert(pair, account.id);
            let seq = self.next_seq();
            self.accounts.insert(account.id, Stored { seq, row: account });
        }

        for op in batch.new_operations {
            let seq = self.next_seq();
            self.operations.insert(op.id, Stored { seq, row: op });
        }

        for op in batch.updated_operations {
            if let Some(mut entry) = self.operations.get_mut(&op.id) {
                entry.row = op;
            }
        }

        for (account_id, balance) in batch.balances {
            if let Some(mut entry) = self.accounts.get_mut(&account_id) {
                entry.row.balance = balance;
                entry.row.updated_at = now;
            }
        }
    }
}

impl LedgerStore for MemoryStore {
    fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let _write = self.gate.write();
        if let Some(error) = self.injected_failure.lock().take() {
            return Err(error);
        }
        self.check_batch(&batch)?;
        self.apply_batch(batch);
        Ok(())
    }
}

impl AccountStore for MemoryStore {
    fn create_account(&self, account: LedgerAccount) -> Result<LedgerAccount, LedgerError> {
        if account.balance < 0 {
            return Err(LedgerError::InvalidBalance(account.balance));
        }
        self.commit(WriteBatch {
            new_accounts: vec![account.clone()],
            ..WriteBatch::default()
        })?;
        Ok(account)
    }

    fn get_account(&self, id: AccountId) -> Result<Option<LedgerAccount>, StorageError> {
        let _read = self.gate.read();
        Ok(self
            .accounts
            .get(&id)
            .filter(|entry| !entry.row.is_deleted())
            .map(|entry| entry.row.clone()))
    }

    fn find_account_by_client_organization(
        &self,
        client_organization_id: OrganizationId,
    ) -> Result<Option<LedgerAccount>, StorageError> {
        let _read = self.gate.read();
        Ok(self
            .accounts
            .iter()
            .filter(|entry| {
                !entry.row.is_deleted() && entry.row.client_organization_id == client_organization_id
            })
            .max_by_key(|entry| entry.seq)
            .map(|entry| entry.row.clone()))
    }

    fn list_accounts(
        &self,
        scope: &AccountScope,
        window: PageWindow,
    ) -> Result<Page<LedgerAccount>, StorageError> {
        let _read = self.gate.read();
        let mut rows: Vec<(u64, LedgerAccount)> = self
            .accounts
            .iter()
            .filter(|entry| !entry.row.is_deleted() && scope.matches(&entry.row))
            .map(|entry| (entry.seq, entry.row.clone()))
            .collect();
        rows.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        Ok(Page::paginate(
            rows.into_iter().map(|(_, account)| account).collect(),
            window,
        ))
    }

    fn delete_account(&self, id: AccountId) -> Result<(), StorageError> {
        let _write = self.gate.write();
        let pair = {
            let mut entry = self
                .accounts
                .get_mut(&id)
                .filter(|entry| !entry.row.is_deleted())
                .ok_or_else(|| StorageError::NotFound(format!("account {id}")))?;
            let now = Utc::now();
            entry.row.deleted_at = Some(now);
            entry.row.updated_at = now;
            (entry.row.managing_agency_id, entry.row.client_organization_id)
        };
        self.live_pairs.remove_if(&pair, |_, live| *live == id);
        Ok(())
    }
}

impl OperationStore for MemoryStore {
    fn create_operation(&self, operation: LedgerOperation) -> Result<LedgerOperation, StorageError> {
        self.commit(WriteBatch {
            new_operations: vec![operation.clone()],
            ..WriteBatch::default()
        })?;
        Ok(operation)
    }

    fn create_operations(
        &self,
        operations: Vec<LedgerOperation>,
    ) -> Result<Vec<LedgerOperation>, StorageError> {
        self.commit(WriteBatch {
            new_operations: operations.clone(),
            ..WriteBatch::default()
        })?;
        Ok(operations)
    }

    fn get_operation(&self, id: OperationId) -> Result<Option<LedgerOperation>, StorageError> {
        let _read = self.gate.read();
        Ok(self
            .operations
            .get(&id)
            .filter(|entry| !entry.row.is_deleted())
            .map(|entry| entry.row.clone()))
    }

    fn list_operations(&self, window: PageWindow) -> Result<Page<LedgerOperation>, StorageError> {
        Ok(Page::paginate(self.collect_operations(|_| true), window))
    }

    fn operations_by_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<LedgerOperation>, StorageError> {
        Ok(self.collect_operations(|op| op.account_id == account_id))
    }

    fn operations_by_actor(&self, actor_id: ActorId) -> Result<Vec<LedgerOperation>, StorageError> {
        Ok(self.collect_operations(|op| op.actor_id == actor_id))
    }

    fn operations_by_status(
        &self,
        status: OperationStatus,
    ) -> Result<Vec<LedgerOperation>, StorageError> {
        Ok(self.collect_operations(|op| op.status == status))
    }

    fn operations_by_date_range(
        &self,
        account_id: AccountId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<LedgerOperation>, StorageError> {
        Ok(self.collect_operations(|op| {
            op.account_id == account_id
                && from.is_none_or(|from| op.created_at >= from)
                && to.is_none_or(|to| op.created_at <= to)
        }))
    }

    fn update_operation(&self, mut operation: LedgerOperation) -> Result<LedgerOperation, StorageError> {
        operation.updated_at = Utc::now();
        self.commit(WriteBatch {
            updated_operations: vec![operation.clone()],
            ..WriteBatch::default()
        })?;
        Ok(operation)
    }

    fn delete_operation(&self, id: OperationId) -> Result<(), StorageError> {
        let mut operation = self
            .get_operation(id)?
            .ok_or_else(|| StorageError::NotFound(format!("operation {id}")))?;
        let now = Utc::now();
        operation.deleted_at = Some(now);
        operation.updated_at = now;
        self.commit(WriteBatch {
            updated_operations: vec![operation],
            ..WriteBatch::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OperationKind, OperationMetadata};

    fn account() -> LedgerAccount {
        LedgerAccount::new(OrganizationId::new(), OrganizationId::new(), None)
    }

    fn operation(account_id: AccountId, status: OperationStatus, quantity: i64) -> LedgerOperation {
        let now = Utc::now();
        LedgerOperation {
            id: OperationId::new(),
            account_id,
            actor_id: ActorId::new(),
            status,
            kind: OperationKind::User,
            quantity,
            description: None,
            metadata: OperationMetadata::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn window() -> PageWindow {
        PageWindow { limit: 50, page: 1 }
    }

    #[test]
    fn create_account_rejects_negative_balance() {
        let store = MemoryStore::new();
        let mut acc = account();
        acc.balance = -1;
        assert_eq!(store.create_account(acc), Err(LedgerError::InvalidBalance(-1)));
        assert_eq!(store.account_rows(), 0);
    }

    #[test]
    fn create_account_rejects_duplicate_pair() {
        let store = MemoryStore::new();
        let first = store.create_account(account()).unwrap();
        let mut twin = account();
        twin.managing_agency_id = first.managing_agency_id;
        twin.client_organization_id = first.client_organization_id;

        let result = store.create_account(twin);
        assert!(matches!(result, Err(LedgerError::Storage(StorageError::Conflict(_)))));
    }

    #[test]
    fn deleted_pair_can_be_recreated() {
        let store = MemoryStore::new();
        let first = store.create_account(account()).unwrap();
        store.delete_account(first.id).unwrap();

        let mut again = account();
        again.managing_agency_id = first.managing_agency_id;
        again.client_organization_id = first.client_organization_id;
        let again = store.create_account(again).unwrap();

        assert_eq!(store.get_account(first.id).unwrap(), None);
        assert_eq!(
            store
                .find_account_by_client_organization(first.client_organization_id)
                .unwrap()
                .map(|a| a.id),
            Some(again.id)
        );
    }

    #[test]
    fn create_operations_is_all_or_nothing() {
        let store = MemoryStore::new();
        let acc = store.create_account(account()).unwrap();
        let good = operation(acc.id, OperationStatus::Purchased, 10);
        let orphan = operation(AccountId::new(), OperationStatus::Purchased, 10);

        let result = store.create_operations(vec![good, orphan]);
        assert!(matches!(result, Err(StorageError::NotFound(_))));
        assert_eq!(store.operation_rows(), 0);
    }

    #[test]
    fn duplicate_operation_id_is_a_conflict() {
        let store = MemoryStore::new();
        let acc = store.create_account(account()).unwrap();
        let op = operation(acc.id, OperationStatus::Purchased, 10);
        store.create_operation(op.clone()).unwrap();

        assert!(matches!(store.create_operation(op), Err(StorageError::Conflict(_))));
        assert_eq!(store.operation_rows(), 1);
    }

    #[test]
    fn reads_exclude_soft_deleted_operations() {
        let store = MemoryStore::new();
        let acc = store.create_account(account()).unwrap();
        let kept = store
            .create_operation(operation(acc.id, OperationStatus::Purchased, 10))
            .unwrap();
        let dropped = store
            .create_operation(operation(acc.id, OperationStatus::Consumed, 4))
            .unwrap();
        store.delete_operation(dropped.id).unwrap();

        let ops = store.operations_by_account(acc.id).unwrap();
        assert_eq!(ops.iter().map(|op| op.id).collect::<Vec<_>>(), vec![kept.id]);
        assert_eq!(store.get_operation(dropped.id).unwrap(), None);
        assert_eq!(store.operations_by_status(OperationStatus::Consumed).unwrap(), vec![]);
        assert_eq!(store.operation_rows(), 2);
    }

    #[test]
    fn operations_are_listed_newest_first() {
        let store = MemoryStore::new();
        let acc = store.create_account(account()).unwrap();
        let ids: Vec<OperationId> = (1..=3)
            .map(|q| {
                store
                    .create_operation(operation(acc.id, OperationStatus::Purchased, q))
                    .unwrap()
                    .id
            })
            .collect();

        let listed: Vec<OperationId> = store
            .operations_by_account(acc.id)
            .unwrap()
            .into_iter()
            .map(|op| op.id)
            .collect();
        assert_eq!(listed, ids.into_iter().rev().collect::<Vec<_>>());
    }

    #[test]
    fn total_quantity_by_status_sums_live_rows() {
        let store = MemoryStore::new();
        let acc = store.create_account(account()).unwrap();
        for q in [10, 20, 5] {
            store
                .create_operation(operation(acc.id, OperationStatus::Purchased, q))
                .unwrap();
        }
        store
            .create_operation(operation(acc.id, OperationStatus::Consumed, 7))
            .unwrap();

        assert_eq!(
            store
                .total_quantity_by_status(acc.id, OperationStatus::Purchased)
                .unwrap(),
            35
        );
        assert_eq!(
            store
                .total_quantity_by_status(acc.id, OperationStatus::Consumed)
                .unwrap(),
            7
        );
    }

    #[test]
    fn date_range_bounds_are_inclusive() {
        let store = MemoryStore::new();
        let acc = store.create_account(account()).unwrap();
        let op = store
            .create_operation(operation(acc.id, OperationStatus::Purchased, 1))
            .unwrap();

        let hit = store
            .operations_by_date_range(acc.id, Some(op.created_at), Some(op.created_at))
            .unwrap();
        assert_eq!(hit.len(), 1);

        let later = op.created_at + chrono::Duration::seconds(1);
        let miss = store.operations_by_date_range(acc.id, Some(later), None).unwrap();
        assert!(miss.is_empty());
    }

    #[test]
    fn injected_failure_aborts_the_whole_batch() {
        let store = MemoryStore::new();
        let acc = store.create_account(account()).unwrap();
        store.fail_next_commit(StorageError::Unavailable("injected".into()));

        let result = store.commit(WriteBatch {
            new_operations: vec![operation(acc.id, OperationStatus::Purchased, 10)],
            balances: vec![(acc.id, 10)],
            ..WriteBatch::default()
        });

        assert_eq!(result, Err(StorageError::Unavailable("injected".into())));
        assert_eq!(store.operation_rows(), 0);
        assert_eq!(store.get_account(acc.id).unwrap().unwrap().balance, 0);
    }

    #[test]
    fn list_accounts_applies_scope() {
        let store = MemoryStore::new();
        let agency = OrganizationId::new();
        let mut mine = account();
        mine.managing_agency_id = agency;
        let mine = store.create_account(mine).unwrap();
        store.create_account(account()).unwrap();

        let page = store
            .list_accounts(&AccountScope::ManagedBy(agency), window())
            .unwrap();
        assert_eq!(page.count, 1);
        assert_eq!(page.data[0].id, mine.id);
    }
}
