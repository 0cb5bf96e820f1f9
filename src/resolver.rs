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

//! Account resolution.
//!
//! Every mutating use case finds its target account through
//! [`AccountResolver::resolve`], which applies one fixed priority:
//!
//! 1. An explicit account id on the request; it must exist.
//! 2. An account id carried by the supplied operations; it must exist, and
//!    all operations that carry one must agree.
//! 3. A client organization id: its live account, or, when the policy allows
//!    it and a managing agency is supplied, a freshly created one.
//! 4. Nothing to go on: [`LedgerError::MissingAccountReference`].

use crate::LedgerError;
use crate::account::LedgerAccount;
use crate::base::{AccountId, ActorId, OrganizationId};
use crate::error::AccountRef;
use crate::lock::LockTable;
use crate::operation::LedgerOperation;
use crate::store::{LedgerStore, WriteBatch};
use std::sync::Arc;
use tracing::info;

/// Identifiers a request carries that may point at an account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountReference {
    pub account_id: Option<AccountId>,
    pub operation_account_ids: Vec<AccountId>,
    pub client_organization_id: Option<OrganizationId>,
    pub managing_agency_id: Option<OrganizationId>,
    pub initial_balance: Option<i64>,
    pub created_by: Option<ActorId>,
}

impl AccountReference {
    pub fn account(account_id: AccountId) -> Self {
        Self {
            account_id: Some(account_id),
            ..Self::default()
        }
    }

    pub fn client_organization(client_organization_id: OrganizationId) -> Self {
        Self {
            client_organization_id: Some(client_organization_id),
            ..Self::default()
        }
    }
}

/// Whether step 3 may create a missing account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatePolicy {
    CreateIfMissing,
    ExistingOnly,
}

/// Outcome of a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub account: LedgerAccount,
    pub created: bool,
}

pub struct AccountResolver<S> {
    store: Arc<S>,
    /// Serializes lazy creation per client organization.
    creation_locks: LockTable<OrganizationId>,
}

impl<S: LedgerStore> AccountResolver<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            creation_locks: LockTable::new(),
        }
    }

    pub fn resolve(
        &self,
        reference: &AccountReference,
        policy: CreatePolicy,
    ) -> Result<Resolution, LedgerError> {
        self.resolve_with(reference, policy, |account| Ok((Vec::new(), account.balance)))
    }

    /// Like [`resolve`](Self::resolve), but a freshly created account is
    /// committed together with the rows `operations` projects onto it.
    ///
    /// `operations` runs only when step 3 creates the account. If it fails,
    /// nothing is written.
    pub fn resolve_with(
        &self,
        reference: &AccountReference,
        policy: CreatePolicy,
        operations: impl FnOnce(&LedgerAccount) -> Result<(Vec<LedgerOperation>, i64), LedgerError>,
    ) -> Result<Resolution, LedgerError> {
        if let Some(account_id) = reference.account_id {
            return self.existing(account_id);
        }

        if let Some((first, rest)) = reference.operation_account_ids.split_first() {
            if rest.iter().any(|id| id != first) {
                return Err(LedgerError::invalid(
                    "operations reference more than one account",
                ));
            }
            return self.existing(*first);
        }

        if let Some(client_organization_id) = reference.client_organization_id {
            if let Some(account) = self
                .store
                .find_account_by_client_organization(client_organization_id)?
            {
                return Ok(Resolution {
                    account,
                    created: false,
                });
            }
            if policy == CreatePolicy::ExistingOnly {
                return Err(LedgerError::AccountNotFound(AccountRef::ClientOrganization(
                    client_organization_id,
                )));
            }
            let managing_agency_id = reference
                .managing_agency_id
                .ok_or(LedgerError::AgencyIdRequired)?;
            return self.create_fallback(
                managing_agency_id,
                client_organization_id,
                reference.initial_balance.unwrap_or(0),
                reference.created_by,
                operations,
            );
        }

        Err(LedgerError::MissingAccountReference)
    }

    /// Creates an account for the pair, recording a positive initial balance
    /// as an opening operation in the same commit.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidBalance`] if `initial_balance` is negative.
    /// - [`LedgerError::InvalidOperation`] if a positive balance has no actor to attribute it to.
    /// - [`StorageError::Conflict`](crate::StorageError::Conflict) if the pair already has a live account.
    pub fn open_account(
        &self,
        managing_agency_id: OrganizationId,
        client_organization_id: OrganizationId,
        initial_balance: i64,
        created_by: Option<ActorId>,
        operations: impl FnOnce(&LedgerAccount) -> Result<(Vec<LedgerOperation>, i64), LedgerError>,
    ) -> Result<LedgerAccount, LedgerError> {
        if initial_balance < 0 {
            return Err(LedgerError::InvalidBalance(initial_balance));
        }
        self.creation_locks.with_locked(&[client_organization_id], || {
            self.open_locked(
                managing_agency_id,
                client_organization_id,
                initial_balance,
                created_by,
                operations,
            )
        })
    }

    /// Caller holds the creation lock of `client_organization_id`.
    fn open_locked(
        &self,
        managing_agency_id: OrganizationId,
        client_organization_id: OrganizationId,
        initial_balance: i64,
        created_by: Option<ActorId>,
        operations: impl FnOnce(&LedgerAccount) -> Result<(Vec<LedgerOperation>, i64), LedgerError>,
    ) -> Result<LedgerAccount, LedgerError> {
        let mut account = LedgerAccount::new(managing_agency_id, client_organization_id, created_by);
        account.balance = initial_balance;

        let mut new_operations = Vec::new();
        if initial_balance > 0 {
            let actor = created_by.filter(ActorId::is_present).ok_or_else(|| {
                LedgerError::invalid("an actor is required to record an initial balance")
            })?;
            new_operations.push(account.opening_operation(initial_balance, actor));
        }

        let (bundled, balance) = operations(&account)?;
        new_operations.extend(bundled);
        account.balance = balance;

        self.store.commit(WriteBatch {
            new_accounts: vec![account.clone()],
            new_operations,
            ..WriteBatch::default()
        })?;
        info!(
            account_id = %account.id,
            %managing_agency_id,
            %client_organization_id,
            balance = account.balance,
            "ledger account created"
        );
        Ok(account)
    }

    fn existing(&self, account_id: AccountId) -> Result<Resolution, LedgerError> {
        let account = self
            .store
            .get_account(account_id)?
            .ok_or(LedgerError::AccountNotFound(AccountRef::Id(account_id)))?;
        Ok(Resolution {
            account,
            created: false,
        })
    }

    fn create_fallback(
        &self,
        managing_agency_id: OrganizationId,
        client_organization_id: OrganizationId,
        initial_balance: i64,
        created_by: Option<ActorId>,
        operations: impl FnOnce(&LedgerAccount) -> Result<(Vec<LedgerOperation>, i64), LedgerError>,
    ) -> Result<Resolution, LedgerError> {
        if initial_balance < 0 {
            return Err(LedgerError::InvalidBalance(initial_balance));
        }
        self.creation_locks.with_locked(&[client_organization_id], || {
            // Another caller may have created it while we waited.
            if let Some(account) = self
                .store
                .find_account_by_client_organization(client_organization_id)?
            {
                return Ok(Resolution {
                    account,
                    created: false,
                });
            }
            let account = self.open_locked(
                managing_agency_id,
                client_organization_id,
                initial_balance,
                created_by,
                operations,
            )?;
            Ok(Resolution {
                account,
                created: true,
            })
        })
    }
}
