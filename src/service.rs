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

//! Ledger service.
//!
//! The [`LedgerService`] is the central component: it resolves the target
//! account, validates operations, projects the balance and commits the
//! operation rows together with the new cached balance.
//!
//! # Use cases
//!
//! - **Create account**: open an account, optionally with an initial balance and bundled operations.
//! - **Apply operations**: append purchases, consumptions, refunds, locks and lock releases.
//! - **Correct operation**: change quantity (audited), status or description of one operation.
//! - **Remove operations**: record removals as new `consumed` operations.
//! - **Transfer credits**: move credits between two accounts in one commit.
//!
//! # Thread Safety
//!
//! Mutations of an account run under that account's lock, so concurrent
//! callers on the same account are serialized while unrelated accounts
//! proceed in parallel. Transfers lock both accounts in ascending id order.
//! Nothing is written until the final [`LedgerStore::commit`]; a failure at
//! any step leaves balances and history untouched.

use crate::LedgerError;
use crate::accumulator::{BalanceAccumulator, BalanceSummary, Projection};
use crate::account::{AccountView, LedgerAccount};
use crate::base::{AccountId, ActorId, OperationId, OrganizationId};
use crate::config::LedgerConfig;
use crate::error::AccountRef;
use crate::history::{ChangeContext, HistoryTracker};
use crate::lock::LockTable;
use crate::operation::{LedgerOperation, OperationInput, OperationStatus, ValidatedInput};
use crate::query::{Page, PaginationConfig};
use crate::resolver::{AccountReference, AccountResolver, CreatePolicy};
use crate::scope::{AccountScope, SessionContext};
use crate::store::{LedgerStore, MemoryStore, WriteBatch};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Request to open a new account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAccountRequest {
    pub managing_agency_id: OrganizationId,
    pub client_organization_id: OrganizationId,
    #[serde(default)]
    pub initial_balance: i64,
    #[serde(default)]
    pub created_by: Option<ActorId>,
    #[serde(default)]
    pub operations: Vec<OperationInput>,
}

impl CreateAccountRequest {
    pub fn new(managing_agency_id: OrganizationId, client_organization_id: OrganizationId) -> Self {
        Self {
            managing_agency_id,
            client_organization_id,
            initial_balance: 0,
            created_by: None,
            operations: Vec::new(),
        }
    }
}

/// Request to append operations to an account located by [`AccountResolver`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyOperationsRequest {
    #[serde(default)]
    pub account_id: Option<AccountId>,
    #[serde(default)]
    pub client_organization_id: Option<OrganizationId>,
    /// Needed only when the client organization has no account yet.
    #[serde(default)]
    pub managing_agency_id: Option<OrganizationId>,
    #[serde(default)]
    pub initial_balance: Option<i64>,
    pub operations: Vec<OperationInput>,
}

impl ApplyOperationsRequest {
    pub fn for_account(account_id: AccountId, operations: Vec<OperationInput>) -> Self {
        Self {
            account_id: Some(account_id),
            operations,
            ..Self::default()
        }
    }

    pub fn for_client_organization(
        client_organization_id: OrganizationId,
        operations: Vec<OperationInput>,
    ) -> Self {
        Self {
            client_organization_id: Some(client_organization_id),
            operations,
            ..Self::default()
        }
    }
}

/// Request to record removals. The account must already exist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoveOperationsRequest {
    #[serde(default)]
    pub account_id: Option<AccountId>,
    #[serde(default)]
    pub client_organization_id: Option<OrganizationId>,
    pub operations: Vec<OperationInput>,
}

/// Post-hoc change to one operation. Absent fields stay as they are.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectOperationRequest {
    pub operation_id: OperationId,
    pub actor_id: ActorId,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub status: Option<OperationStatus>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl CorrectOperationRequest {
    pub fn new(operation_id: OperationId, actor_id: ActorId) -> Self {
        Self {
            operation_id,
            actor_id,
            quantity: None,
            status: None,
            description: None,
            metadata: None,
        }
    }

    pub fn quantity(mut self, quantity: i64) -> Self {
        self.quantity = Some(quantity);
        self
    }

    pub fn status(mut self, status: OperationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub quantity: i64,
    pub actor_id: ActorId,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

/// Both sides of a committed transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferOutcome {
    pub from: LedgerAccount,
    pub to: LedgerAccount,
    pub debit: LedgerOperation,
    pub credit: LedgerOperation,
}

/// A single-operation change on a known account, for the convenience use cases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreditChange {
    pub quantity: i64,
    pub actor_id: Option<ActorId>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl CreditChange {
    pub fn new(actor_id: ActorId, quantity: i64) -> Self {
        Self {
            quantity,
            actor_id: Some(actor_id),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn into_input(self, account_id: AccountId, status: OperationStatus) -> OperationInput {
        OperationInput {
            account_id: Some(account_id),
            actor_id: self.actor_id,
            status: Some(status),
            kind: None,
            quantity: self.quantity,
            description: self.description,
            metadata: self.metadata,
        }
    }
}

/// How a read locates its account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountLookup {
    Id(AccountId),
    ClientOrganization(OrganizationId),
}

/// Credit ledger orchestrator over a [`LedgerStore`].
///
/// # Invariants
///
/// - An account's cached balance always equals the fold of its live operations.
/// - Operation rows are never hard-deleted; corrections append history.
/// - Debits never drive a balance negative unless the balance policy allows it;
///   transfers never do.
pub struct LedgerService<S = MemoryStore> {
    store: Arc<S>,
    resolver: AccountResolver<S>,
    accumulator: BalanceAccumulator,
    account_locks: LockTable<AccountId>,
    config: LedgerConfig,
}

impl LedgerService<MemoryStore> {
    /// Creates a service over an empty in-memory store with default configuration.
    pub fn new() -> Self {
        Self::with_config(LedgerConfig::default())
    }

    pub fn with_config(config: LedgerConfig) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), config)
    }
}

impl Default for LedgerService<MemoryStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: LedgerStore> LedgerService<S> {
    pub fn with_store(store: Arc<S>, config: LedgerConfig) -> Self {
        Self {
            resolver: AccountResolver::new(Arc::clone(&store)),
            accumulator: BalanceAccumulator::new(config.balance),
            account_locks: LockTable::new(),
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    // === Mutations ===

    /// Opens an account and applies any bundled operations in the same commit.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidBalance`] - `initial_balance` is negative.
    /// - [`LedgerError::InvalidOperation`] - a bundled operation failed validation.
    /// - [`LedgerError::InsufficientBalance`] - bundled debits exceed the balance.
    /// - [`LedgerError::Storage`] - the pair already has an account, or the store failed.
    #[tracing::instrument(name = "ledger.create_account", skip_all, fields(client_organization_id = %request.client_organization_id))]
    pub fn create_account(&self, request: CreateAccountRequest) -> Result<AccountView, LedgerError> {
        if request.initial_balance < 0 {
            return Err(LedgerError::InvalidBalance(request.initial_balance));
        }
        let operations = validate_all(request.operations)?;
        let created_by = request
            .created_by
            .or_else(|| operations.first().map(|op| op.actor_id));

        let account = self.resolver.open_account(
            request.managing_agency_id,
            request.client_organization_id,
            request.initial_balance,
            created_by,
            |account| self.project_onto_new(account, operations),
        )?;
        self.view(account)
    }

    /// Appends operations to the resolved account.
    ///
    /// Operations default to `purchased` / `user`. Either every operation is
    /// recorded and the balance moves by their sum, or nothing changes.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidOperation`] - empty request, `quantity <= 0`, missing actor,
    ///   or a lock release larger than the outstanding lock.
    /// - [`LedgerError::InsufficientBalance`] - a debit would drive the balance negative.
    /// - Resolution errors: [`LedgerError::AccountNotFound`], [`LedgerError::AgencyIdRequired`],
    ///   [`LedgerError::MissingAccountReference`], [`LedgerError::InvalidBalance`].
    #[tracing::instrument(name = "ledger.apply_operations", skip_all, fields(operations = request.operations.len()))]
    pub fn apply_operations(&self, request: ApplyOperationsRequest) -> Result<AccountView, LedgerError> {
        if request.operations.is_empty() {
            return Err(LedgerError::invalid("at least one operation is required"));
        }
        let reference = AccountReference {
            account_id: request.account_id,
            operation_account_ids: request.operations.iter().filter_map(|op| op.account_id).collect(),
            client_organization_id: request.client_organization_id,
            managing_agency_id: request.managing_agency_id,
            initial_balance: request.initial_balance,
            created_by: request.operations.iter().find_map(|op| op.actor_id),
        };
        let mut pending = Some(validate_all(request.operations)?);
        // A lazily created account is committed together with the batch.
        let resolution = self.resolver.resolve_with(&reference, CreatePolicy::CreateIfMissing, |account| {
            self.project_onto_new(account, pending.take().unwrap_or_default())
        })?;
        let account_id = resolution.account.id;
        if resolution.created {
            info!(%account_id, balance = resolution.account.balance, "operations applied to new account");
            return self.view(resolution.account);
        }
        let operations = pending.unwrap_or_default();

        self.account_locks.with_locked(&[account_id], || {
            let account = self.live_account(account_id)?;
            let mut projection = BalanceAccumulator::project(self.store.as_ref(), &account)?;
            let rows = self.project_inputs(&mut projection, operations, |_, _| {})?;
            let count = rows.len();

            self.store.commit(WriteBatch {
                new_operations: rows,
                balances: vec![(account_id, projection.balance)],
                ..WriteBatch::default()
            })?;
            info!(%account_id, count, balance = projection.balance, "operations applied");
            self.view_by_id(account_id)
        })
    }

    /// Corrects one operation in place.
    ///
    /// A quantity change appends a history entry in the same row update; status,
    /// description and metadata changes are not audited. The balance moves by the
    /// difference between the old and new contribution.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::OperationNotFound`] - the operation does not exist or is deleted.
    /// - [`LedgerError::InvalidOperation`] - `quantity <= 0` or missing actor.
    /// - [`LedgerError::InsufficientBalance`] - the new contribution would overdraw.
    #[tracing::instrument(name = "ledger.correct_operation", skip_all, fields(operation_id = %request.operation_id))]
    pub fn correct_operation(&self, request: CorrectOperationRequest) -> Result<AccountView, LedgerError> {
        if request.quantity.is_some_and(|quantity| quantity <= 0) {
            return Err(LedgerError::invalid("quantity must be greater than 0"));
        }
        if !request.actor_id.is_present() {
            return Err(LedgerError::invalid("actor id is required"));
        }
        let operation = self
            .store
            .get_operation(request.operation_id)?
            .ok_or(LedgerError::OperationNotFound(request.operation_id))?;
        let account_id = self
            .resolver
            .resolve(&AccountReference::account(operation.account_id), CreatePolicy::ExistingOnly)?
            .account
            .id;

        self.account_locks.with_locked(&[account_id], || {
            // Re-read under the lock: the row may have changed while we waited.
            let mut operation = self
                .store
                .get_operation(request.operation_id)?
                .ok_or(LedgerError::OperationNotFound(request.operation_id))?;
            let account = self.live_account(account_id)?;
            let mut projection = BalanceAccumulator::project(self.store.as_ref(), &account)?;

            let new_status = request.status.unwrap_or(operation.status);
            let new_quantity = request.quantity.unwrap_or(operation.quantity);
            self.accumulator.replace(
                &mut projection,
                (operation.status, operation.quantity),
                Some((new_status, new_quantity)),
            )?;

            let context = ChangeContext::new(request.actor_id, projection.balance)
                .with_description(request.description.clone());
            operation.status = new_status;
            let audited = HistoryTracker::correct_quantity(&mut operation, new_quantity, &context);
            if let Some(description) = request.description {
                operation.description = Some(description);
            }
            if let Some(metadata) = request.metadata {
                operation.metadata.merge_extra(metadata)?;
            }
            operation.updated_at = context.changed_at;

            self.store.commit(WriteBatch {
                updated_operations: vec![operation],
                balances: vec![(account_id, projection.balance)],
                ..WriteBatch::default()
            })?;
            info!(%account_id, audited, balance = projection.balance, "operation corrected");
            self.view_by_id(account_id)
        })
    }

    /// Records each supplied operation as a new `consumed` removal carrying one
    /// `remove` history entry. Existing operations are never touched.
    ///
    /// # Errors
    ///
    /// As [`LedgerService::apply_operations`], except that a missing account is
    /// never created ([`LedgerError::AccountNotFound`]).
    #[tracing::instrument(name = "ledger.remove_operations", skip_all, fields(operations = request.operations.len()))]
    pub fn remove_operations(&self, request: RemoveOperationsRequest) -> Result<AccountView, LedgerError> {
        if request.operations.is_empty() {
            return Err(LedgerError::invalid("at least one operation is required"));
        }
        let reference = AccountReference {
            account_id: request.account_id,
            operation_account_ids: request.operations.iter().filter_map(|op| op.account_id).collect(),
            client_organization_id: request.client_organization_id,
            ..AccountReference::default()
        };
        let operations: Vec<ValidatedInput> = validate_all(request.operations)?
            .into_iter()
            .map(|mut op| {
                op.status = OperationStatus::Consumed;
                op
            })
            .collect();
        let account_id = self
            .resolver
            .resolve(&reference, CreatePolicy::ExistingOnly)?
            .account
            .id;

        self.account_locks.with_locked(&[account_id], || {
            let account = self.live_account(account_id)?;
            let mut projection = BalanceAccumulator::project(self.store.as_ref(), &account)?;
            let rows = self.project_inputs(&mut projection, operations, |row, remaining| {
                let context = ChangeContext::new(row.actor_id, remaining)
                    .with_description(row.description.clone());
                HistoryTracker::record_removal(row, &context);
            })?;
            let count = rows.len();

            self.store.commit(WriteBatch {
                new_operations: rows,
                balances: vec![(account_id, projection.balance)],
                ..WriteBatch::default()
            })?;
            info!(%account_id, count, balance = projection.balance, "removals recorded");
            self.view_by_id(account_id)
        })
    }

    /// Moves `quantity` credits between two accounts in one commit: a `consumed`
    /// operation on the source and a `purchased` operation on the destination.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidOperation`] - `quantity <= 0`, missing actor, or same account.
    /// - [`LedgerError::AccountNotFound`] - either account is missing.
    /// - [`LedgerError::InsufficientBalance`] - the source would go negative.
    #[tracing::instrument(name = "ledger.transfer_credits", skip_all, fields(from = %request.from_account_id, to = %request.to_account_id, quantity = request.quantity))]
    pub fn transfer_credits(&self, request: TransferRequest) -> Result<TransferOutcome, LedgerError> {
        if request.from_account_id == request.to_account_id {
            return Err(LedgerError::invalid("cannot transfer credits to the same account"));
        }
        let (from_id, to_id) = (request.from_account_id, request.to_account_id);
        let metadata = |direction: &str, counterpart: AccountId| {
            let mut extra = request.metadata.clone().unwrap_or_default();
            extra.insert(
                "transfer".to_string(),
                json!({ "direction": direction, "counterpartAccountId": counterpart }),
            );
            extra
        };
        let description = request
            .description
            .clone()
            .unwrap_or_else(|| "Credit transfer".to_string());
        let debit = OperationInput::new(request.actor_id, OperationStatus::Consumed, request.quantity)
            .with_description(description.clone())
            .with_metadata(metadata("out", to_id))
            .validate()?;
        let credit = OperationInput::new(request.actor_id, OperationStatus::Purchased, request.quantity)
            .with_description(description)
            .with_metadata(metadata("in", from_id))
            .validate()?;

        for id in [from_id, to_id] {
            self.resolver
                .resolve(&AccountReference::account(id), CreatePolicy::ExistingOnly)?;
        }

        self.account_locks.with_locked(&[from_id, to_id], || {
            let from = self.live_account(from_id)?;
            let to = self.live_account(to_id)?;
            let mut from_projection = BalanceAccumulator::project(self.store.as_ref(), &from)?;
            let mut to_projection = BalanceAccumulator::project(self.store.as_ref(), &to)?;

            let strict = self.accumulator.strict();
            strict
                .push(&mut from_projection, debit.status, debit.quantity)
                .inspect_err(|error| warn!(from = %from_id, %error, "transfer rejected"))?;
            strict.push(&mut to_projection, credit.status, credit.quantity)?;

            let now = Utc::now();
            let debit = LedgerOperation::from_input(debit, from_id, now);
            let credit = LedgerOperation::from_input(credit, to_id, now);

            self.store.commit(WriteBatch {
                new_operations: vec![debit.clone(), credit.clone()],
                balances: vec![
                    (from_id, from_projection.balance),
                    (to_id, to_projection.balance),
                ],
                ..WriteBatch::default()
            })?;
            info!(
                from = %from_id,
                to = %to_id,
                from_balance = from_projection.balance,
                to_balance = to_projection.balance,
                "credits transferred"
            );
            Ok(TransferOutcome {
                from: self.live_account(from_id)?,
                to: self.live_account(to_id)?,
                debit,
                credit,
            })
        })
    }

    pub fn add_credits(&self, account_id: AccountId, change: CreditChange) -> Result<AccountView, LedgerError> {
        self.apply_single(account_id, change, OperationStatus::Purchased)
    }

    pub fn consume_credits(&self, account_id: AccountId, change: CreditChange) -> Result<AccountView, LedgerError> {
        self.apply_single(account_id, change, OperationStatus::Consumed)
    }

    pub fn refund_credits(&self, account_id: AccountId, change: CreditChange) -> Result<AccountView, LedgerError> {
        self.apply_single(account_id, change, OperationStatus::Refunded)
    }

    pub fn lock_credits(&self, account_id: AccountId, change: CreditChange) -> Result<AccountView, LedgerError> {
        self.apply_single(account_id, change, OperationStatus::Locked)
    }

    /// Releases previously locked credits with an `expired` entry.
    pub fn expire_lock(&self, account_id: AccountId, change: CreditChange) -> Result<AccountView, LedgerError> {
        self.apply_single(account_id, change, OperationStatus::Expired)
    }

    /// Soft-deletes one operation, auditing the removal and taking its
    /// contribution out of the balance.
    #[tracing::instrument(name = "ledger.delete_operation", skip_all, fields(%operation_id))]
    pub fn delete_operation(
        &self,
        operation_id: OperationId,
        actor_id: ActorId,
    ) -> Result<AccountView, LedgerError> {
        if !actor_id.is_present() {
            return Err(LedgerError::invalid("actor id is required"));
        }
        let account_id = self
            .store
            .get_operation(operation_id)?
            .ok_or(LedgerError::OperationNotFound(operation_id))?
            .account_id;

        self.account_locks.with_locked(&[account_id], || {
            let mut operation = self
                .store
                .get_operation(operation_id)?
                .ok_or(LedgerError::OperationNotFound(operation_id))?;
            let account = self.live_account(account_id)?;
            let mut projection = BalanceAccumulator::project(self.store.as_ref(), &account)?;
            self.accumulator
                .replace(&mut projection, (operation.status, operation.quantity), None)?;

            let context = ChangeContext::new(actor_id, projection.balance);
            HistoryTracker::record_deletion(&mut operation, &context);
            operation.deleted_at = Some(context.changed_at);
            operation.updated_at = context.changed_at;

            self.store.commit(WriteBatch {
                updated_operations: vec![operation],
                balances: vec![(account_id, projection.balance)],
                ..WriteBatch::default()
            })?;
            info!(%account_id, balance = projection.balance, "operation deleted");
            self.view_by_id(account_id)
        })
    }

    /// Soft-deletes an account. Its operations stay in the log.
    pub fn delete_account(&self, account_id: AccountId) -> Result<(), LedgerError> {
        self.account_locks.with_locked(&[account_id], || {
            self.live_account(account_id)?;
            self.store.delete_account(account_id)?;
            info!(%account_id, "ledger account deleted");
            Ok(())
        })
    }

    // === Reads ===

    pub fn get(&self, lookup: AccountLookup) -> Result<AccountView, LedgerError> {
        let account = match lookup {
            AccountLookup::Id(id) => self.live_account(id)?,
            AccountLookup::ClientOrganization(org) => self
                .store
                .find_account_by_client_organization(org)?
                .ok_or(LedgerError::AccountNotFound(AccountRef::ClientOrganization(org)))?,
        };
        self.view(account)
    }

    /// Lists the accounts the session may see.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Forbidden`] for roles other than agency or client.
    pub fn list(
        &self,
        pagination: PaginationConfig,
        session: &SessionContext,
    ) -> Result<Page<AccountView>, LedgerError> {
        let scope = session.scope()?;
        debug!(role = %session.role, organization_id = %session.organization_id, "listing accounts");
        self.list_scoped(&scope, pagination)
    }

    pub fn list_by_client_organization(
        &self,
        client_organization_id: OrganizationId,
        pagination: PaginationConfig,
    ) -> Result<Page<AccountView>, LedgerError> {
        self.list_scoped(&AccountScope::OwnedBy(client_organization_id), pagination)
    }

    pub fn list_by_agency(
        &self,
        managing_agency_id: OrganizationId,
        pagination: PaginationConfig,
    ) -> Result<Page<AccountView>, LedgerError> {
        self.list_scoped(&AccountScope::ManagedBy(managing_agency_id), pagination)
    }

    /// Accounts where the organization is either the agency or the client.
    pub fn list_by_organization(
        &self,
        organization_id: OrganizationId,
        pagination: PaginationConfig,
    ) -> Result<Page<AccountView>, LedgerError> {
        self.list_scoped(&AccountScope::Involving(organization_id), pagination)
    }

    pub fn get_balance(&self, account_id: AccountId) -> Result<i64, LedgerError> {
        Ok(self.live_account(account_id)?.balance)
    }

    /// Live operations of the account created within `[from, to]`, newest first.
    pub fn get_history(
        &self,
        account_id: AccountId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<LedgerOperation>, LedgerError> {
        self.live_account(account_id)?;
        Ok(self.store.operations_by_date_range(account_id, from, to)?)
    }

    pub fn get_summary(&self, account_id: AccountId) -> Result<BalanceSummary, LedgerError> {
        let account = self.live_account(account_id)?;
        let operations = self.store.operations_by_account(account_id)?;
        Ok(BalanceAccumulator::summarize(&account, &operations))
    }

    /// Replays the operation log of the account.
    pub fn recompute(&self, account_id: AccountId) -> Result<i64, LedgerError> {
        self.live_account(account_id)?;
        BalanceAccumulator::recompute(self.store.as_ref(), account_id)
    }

    /// Asserts the cached balance equals the replayed log.
    ///
    /// # Errors
    ///
    /// [`LedgerError::BalanceDrift`] when they disagree.
    pub fn verify_balance(&self, account_id: AccountId) -> Result<i64, LedgerError> {
        self.account_locks.with_locked(&[account_id], || {
            let account = self.live_account(account_id)?;
            BalanceAccumulator::verify(self.store.as_ref(), &account)
        })
    }

    pub fn get_operation(&self, operation_id: OperationId) -> Result<LedgerOperation, LedgerError> {
        self.store
            .get_operation(operation_id)?
            .ok_or(LedgerError::OperationNotFound(operation_id))
    }

    pub fn list_operations(&self, pagination: PaginationConfig) -> Result<Page<LedgerOperation>, LedgerError> {
        let window = pagination.window(&self.config.pagination);
        Ok(self.store.list_operations(window)?)
    }

    pub fn operations_by_actor(&self, actor_id: ActorId) -> Result<Vec<LedgerOperation>, LedgerError> {
        Ok(self.store.operations_by_actor(actor_id)?)
    }

    pub fn operations_by_status(&self, status: OperationStatus) -> Result<Vec<LedgerOperation>, LedgerError> {
        Ok(self.store.operations_by_status(status)?)
    }

    pub fn total_quantity_by_status(
        &self,
        account_id: AccountId,
        status: OperationStatus,
    ) -> Result<i64, LedgerError> {
        self.live_account(account_id)?;
        Ok(self.store.total_quantity_by_status(account_id, status)?)
    }

    // === Internals ===

    fn apply_single(
        &self,
        account_id: AccountId,
        change: CreditChange,
        status: OperationStatus,
    ) -> Result<AccountView, LedgerError> {
        self.apply_operations(ApplyOperationsRequest::for_account(
            account_id,
            vec![change.into_input(account_id, status)],
        ))
    }

    /// Pushes each input through the accumulator and materializes its row.
    /// `decorate` sees every row with the balance right after it.
    /// Projects `inputs` onto an account that has not been committed yet.
    fn project_onto_new(
        &self,
        account: &LedgerAccount,
        inputs: Vec<ValidatedInput>,
    ) -> Result<(Vec<LedgerOperation>, i64), LedgerError> {
        let mut projection = Projection {
            account_id: account.id,
            balance: account.balance,
            outstanding_locked: 0,
        };
        let rows = self.project_inputs(&mut projection, inputs, |_, _| {})?;
        Ok((rows, projection.balance))
    }

    fn project_inputs(
        &self,
        projection: &mut Projection,
        inputs: Vec<ValidatedInput>,
        mut decorate: impl FnMut(&mut LedgerOperation, i64),
    ) -> Result<Vec<LedgerOperation>, LedgerError> {
        let now = Utc::now();
        inputs
            .into_iter()
            .map(|input| -> Result<LedgerOperation, LedgerError> {
                let account_id = projection.account_id;
                self.accumulator
                    .push(projection, input.status, input.quantity)
                    .inspect_err(|error| warn!(%account_id, status = %input.status, %error, "operation rejected"))?;
                let mut row = LedgerOperation::from_input(input, projection.account_id, now);
                decorate(&mut row, projection.balance);
                Ok(row)
            })
            .collect()
    }

    fn live_account(&self, account_id: AccountId) -> Result<LedgerAccount, LedgerError> {
        self.store
            .get_account(account_id)?
            .ok_or(LedgerError::AccountNotFound(AccountRef::Id(account_id)))
    }

    fn view_by_id(&self, account_id: AccountId) -> Result<AccountView, LedgerError> {
        let account = self.live_account(account_id)?;
        self.view(account)
    }

    fn view(&self, account: LedgerAccount) -> Result<AccountView, LedgerError> {
        let operations = self.store.operations_by_account(account.id)?;
        Ok(AccountView::new(account, operations))
    }

    fn list_scoped(
        &self,
        scope: &AccountScope,
        pagination: PaginationConfig,
    ) -> Result<Page<AccountView>, LedgerError> {
        let window = pagination.window(&self.config.pagination);
        self.store
            .list_accounts(scope, window)?
            .try_map(|account| self.view(account))
    }
}

fn validate_all(inputs: Vec<OperationInput>) -> Result<Vec<ValidatedInput>, LedgerError> {
    inputs.into_iter().map(OperationInput::validate).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn funded_account(service: &LedgerService, balance: i64) -> (AccountId, ActorId) {
        let actor = ActorId::new();
        let mut request = CreateAccountRequest::new(OrganizationId::new(), OrganizationId::new());
        request.initial_balance = balance;
        request.created_by = Some(actor);
        (service.create_account(request).unwrap().id, actor)
    }

    #[test]
    fn create_account_with_initial_balance_is_consistent() {
        let service = LedgerService::new();
        let (account_id, _) = funded_account(&service, 25);
        assert_eq!(service.get_balance(account_id).unwrap(), 25);
        assert_eq!(service.verify_balance(account_id).unwrap(), 25);
    }

    #[test]
    fn bundled_operations_commit_with_the_account() {
        let service = LedgerService::new();
        let actor = ActorId::new();
        let mut request = CreateAccountRequest::new(OrganizationId::new(), OrganizationId::new());
        request.operations = vec![
            OperationInput::new(actor, OperationStatus::Purchased, 100),
            OperationInput::new(actor, OperationStatus::Consumed, 10),
        ];
        let view = service.create_account(request).unwrap();
        assert_eq!(view.balance, 90);
        assert_eq!(view.operations.len(), 2);
        assert_eq!(service.recompute(view.id).unwrap(), 90);
    }

    #[test]
    fn failing_bundle_creates_nothing() {
        let service = LedgerService::new();
        let mut request = CreateAccountRequest::new(OrganizationId::new(), OrganizationId::new());
        request.operations = vec![OperationInput::new(ActorId::new(), OperationStatus::Consumed, 1)];
        assert!(matches!(
            service.create_account(request),
            Err(LedgerError::InsufficientBalance { .. })
        ));
        assert_eq!(service.store().account_rows(), 0);
        assert_eq!(service.store().operation_rows(), 0);
    }

    #[test]
    fn storage_failure_leaves_balance_untouched() {
        let service = LedgerService::new();
        let (account_id, actor) = funded_account(&service, 50);
        service
            .store()
            .fail_next_commit(crate::StorageError::Unavailable("injected".into()));

        let result = service.consume_credits(account_id, CreditChange::new(actor, 20));
        assert!(matches!(result, Err(LedgerError::Storage(_))));
        assert_eq!(service.get_balance(account_id).unwrap(), 50);
        assert_eq!(service.get_history(account_id, None, None).unwrap().len(), 1);
    }

    #[test]
    fn status_correction_moves_balance_without_history() {
        let service = LedgerService::new();
        let (account_id, actor) = funded_account(&service, 50);
        let view = service
            .consume_credits(account_id, CreditChange::new(actor, 20))
            .unwrap();
        assert_eq!(view.balance, 30);
        let consumed = view.operations[0].id;

        let view = service
            .correct_operation(CorrectOperationRequest::new(consumed, actor).status(OperationStatus::Refunded))
            .unwrap();
        assert_eq!(view.balance, 70);
        assert!(service.get_operation(consumed).unwrap().history().is_empty());
        assert_eq!(service.verify_balance(account_id).unwrap(), 70);
    }

    #[test]
    fn deleting_an_operation_reverses_its_contribution() {
        let service = LedgerService::new();
        let (account_id, actor) = funded_account(&service, 50);
        let view = service
            .add_credits(account_id, CreditChange::new(actor, 30))
            .unwrap();
        let added = view.operations[0].id;

        let view = service.delete_operation(added, actor).unwrap();
        assert_eq!(view.balance, 50);
        assert!(view.operations.iter().all(|op| op.id != added));
        assert_eq!(
            service.get_operation(added),
            Err(LedgerError::OperationNotFound(added))
        );
        assert_eq!(service.store().operation_rows(), 2);
    }

    #[test]
    fn deleting_a_purchase_that_was_spent_is_rejected() {
        let service = LedgerService::new();
        let (account_id, actor) = funded_account(&service, 0);
        let purchase = service
            .add_credits(account_id, CreditChange::new(actor, 30))
            .unwrap()
            .operations[0]
            .id;
        service
            .consume_credits(account_id, CreditChange::new(actor, 20))
            .unwrap();

        assert!(matches!(
            service.delete_operation(purchase, actor),
            Err(LedgerError::InsufficientBalance { .. })
        ));
        assert_eq!(service.get_balance(account_id).unwrap(), 10);
    }

    #[test]
    fn deleted_account_is_not_found() {
        let service = LedgerService::new();
        let (account_id, _) = funded_account(&service, 0);
        service.delete_account(account_id).unwrap();
        assert_eq!(
            service.get_balance(account_id),
            Err(LedgerError::AccountNotFound(AccountRef::Id(account_id)))
        );
    }
}
