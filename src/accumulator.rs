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

//! Balance derivation.
//!
//! The balance of an account is the fold of its live operations:
//!
//! | Status | Contribution |
//! |--------|--------------|
//! | purchased | `+quantity` |
//! | refunded | `+quantity` |
//! | consumed | `-quantity` |
//! | locked | `-quantity` |
//! | expired | `+quantity`, releasing a prior lock |
//!
//! An `expired` entry is the counter-entry of a `locked` reservation, so the
//! released quantity can never exceed what is still locked
//! (`sum(locked) - sum(expired)`).
//!
//! The cached [`LedgerAccount::balance`](crate::LedgerAccount) is maintained
//! incrementally through a [`Projection`]; [`BalanceAccumulator::recompute`]
//! replays the full log and [`BalanceAccumulator::verify`] asserts both agree.

use crate::LedgerError;
use crate::account::LedgerAccount;
use crate::base::AccountId;
use crate::config::BalancePolicy;
use crate::operation::{LedgerOperation, OperationStatus};
use crate::store::OperationStore;
use serde::{Deserialize, Serialize};

/// Signed effect of `quantity` units with `status` on the balance.
pub fn signed_quantity(status: OperationStatus, quantity: i64) -> i64 {
    match status {
        OperationStatus::Purchased | OperationStatus::Refunded | OperationStatus::Expired => {
            quantity
        }
        OperationStatus::Consumed | OperationStatus::Locked => -quantity,
    }
}

/// Effect on the outstanding locked quantity.
fn locked_delta(status: OperationStatus, quantity: i64) -> i64 {
    match status {
        OperationStatus::Locked => quantity,
        OperationStatus::Expired => -quantity,
        _ => 0,
    }
}

fn overflow() -> LedgerError {
    LedgerError::invalid("quantity overflows the account balance")
}

/// Running balance of one account while a write batch is being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Projection {
    pub account_id: AccountId,
    pub balance: i64,
    pub outstanding_locked: i64,
}

/// Per-status totals over live operations, saturating at `i64::MAX`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusTotals {
    pub purchased: i64,
    pub consumed: i64,
    pub refunded: i64,
    pub locked: i64,
    pub expired: i64,
}

impl StatusTotals {
    pub fn get(&self, status: OperationStatus) -> i64 {
        match status {
            OperationStatus::Purchased => self.purchased,
            OperationStatus::Consumed => self.consumed,
            OperationStatus::Refunded => self.refunded,
            OperationStatus::Locked => self.locked,
            OperationStatus::Expired => self.expired,
        }
    }

    fn slot(&mut self, status: OperationStatus) -> &mut i64 {
        match status {
            OperationStatus::Purchased => &mut self.purchased,
            OperationStatus::Consumed => &mut self.consumed,
            OperationStatus::Refunded => &mut self.refunded,
            OperationStatus::Locked => &mut self.locked,
            OperationStatus::Expired => &mut self.expired,
        }
    }
}

/// Reporting view over an account's operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSummary {
    pub account_id: AccountId,
    pub balance: i64,
    pub totals: StatusTotals,
    pub outstanding_locked: i64,
    pub operation_count: usize,
}

/// Derives balances and enforces the balance policy on every change.
#[derive(Debug, Clone, Copy, Default)]
pub struct BalanceAccumulator {
    policy: BalancePolicy,
}

impl BalanceAccumulator {
    pub fn new(policy: BalancePolicy) -> Self {
        Self { policy }
    }

    /// Same accumulator with negative balances forbidden regardless of policy.
    pub fn strict(&self) -> Self {
        Self {
            policy: BalancePolicy {
                allow_negative: false,
            },
        }
    }

    /// Folds live operations into a balance.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidOperation`] on arithmetic overflow.
    pub fn derive<'a>(
        operations: impl IntoIterator<Item = &'a LedgerOperation>,
    ) -> Result<i64, LedgerError> {
        operations
            .into_iter()
            .filter(|op| !op.is_deleted())
            .try_fold(0i64, |balance, op| {
                balance
                    .checked_add(signed_quantity(op.status, op.quantity))
                    .ok_or_else(overflow)
            })
    }

    /// Totals per status plus the derived balance.
    pub fn summarize(account: &LedgerAccount, operations: &[LedgerOperation]) -> BalanceSummary {
        let mut totals = StatusTotals::default();
        let mut outstanding_locked = 0i64;
        let mut operation_count = 0;
        for op in operations.iter().filter(|op| !op.is_deleted()) {
            let slot = totals.slot(op.status);
            *slot = slot.saturating_add(op.quantity);
            outstanding_locked = outstanding_locked.saturating_add(locked_delta(op.status, op.quantity));
            operation_count += 1;
        }
        BalanceSummary {
            account_id: account.id,
            balance: account.balance,
            outstanding_locked,
            totals,
            operation_count,
        }
    }

    /// Starts a projection from the account's cached balance and the store's lock totals.
    pub fn project<S: OperationStore + ?Sized>(
        store: &S,
        account: &LedgerAccount,
    ) -> Result<Projection, LedgerError> {
        let operations = store.operations_by_account(account.id)?;
        Ok(Projection {
            account_id: account.id,
            balance: account.balance,
            outstanding_locked: Self::outstanding_locked(&operations)?,
        })
    }

    /// Locked credits not yet released by an `expired` entry.
    ///
    /// Folded per operation: lifetime `locked` and `expired` totals may exceed `i64`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidOperation`] on arithmetic overflow.
    pub fn outstanding_locked<'a>(
        operations: impl IntoIterator<Item = &'a LedgerOperation>,
    ) -> Result<i64, LedgerError> {
        operations
            .into_iter()
            .filter(|op| !op.is_deleted())
            .try_fold(0i64, |outstanding, op| {
                outstanding
                    .checked_add(locked_delta(op.status, op.quantity))
                    .ok_or_else(overflow)
            })
    }

    /// Replays the operation log of `account_id`.
    pub fn recompute<S: OperationStore + ?Sized>(
        store: &S,
        account_id: AccountId,
    ) -> Result<i64, LedgerError> {
        let operations = store.operations_by_account(account_id)?;
        Self::derive(&operations)
    }

    /// Checks the cached balance against a full replay.
    ///
    /// # Errors
    ///
    /// [`LedgerError::BalanceDrift`] if they differ.
    pub fn verify<S: OperationStore + ?Sized>(
        store: &S,
        account: &LedgerAccount,
    ) -> Result<i64, LedgerError> {
        let derived = Self::recompute(store, account.id)?;
        if derived != account.balance {
            tracing::warn!(
                account_id = %account.id,
                cached = account.balance,
                derived,
                "cached balance drifted from operation log"
            );
            return Err(LedgerError::BalanceDrift {
                account_id: account.id,
                cached: account.balance,
                derived,
            });
        }
        Ok(derived)
    }

    /// Adds a new operation's contribution.
    pub fn push(
        &self,
        projection: &mut Projection,
        status: OperationStatus,
        quantity: i64,
    ) -> Result<(), LedgerError> {
        self.shift(
            projection,
            signed_quantity(status, quantity),
            locked_delta(status, quantity),
        )
    }

    /// Swaps an existing contribution for a new one; `None` removes it.
    pub fn replace(
        &self,
        projection: &mut Projection,
        old: (OperationStatus, i64),
        new: Option<(OperationStatus, i64)>,
    ) -> Result<(), LedgerError> {
        let (new_balance, new_locked) = new
            .map(|(status, quantity)| (signed_quantity(status, quantity), locked_delta(status, quantity)))
            .unwrap_or((0, 0));
        let balance_delta = new_balance
            .checked_sub(signed_quantity(old.0, old.1))
            .ok_or_else(overflow)?;
        let locked = new_locked
            .checked_sub(locked_delta(old.0, old.1))
            .ok_or_else(overflow)?;
        self.shift(projection, balance_delta, locked)
    }

    fn shift(
        &self,
        projection: &mut Projection,
        balance_delta: i64,
        locked_delta: i64,
    ) -> Result<(), LedgerError> {
        let balance = projection
            .balance
            .checked_add(balance_delta)
            .ok_or_else(overflow)?;
        let outstanding_locked = projection
            .outstanding_locked
            .checked_add(locked_delta)
            .ok_or_else(overflow)?;

        if outstanding_locked < 0 {
            return Err(LedgerError::invalid(format!(
                "release of {} exceeds outstanding locked credits ({})",
                -locked_delta, projection.outstanding_locked
            )));
        }
        if balance_delta < 0 && balance < 0 && !self.policy.allow_negative {
            return Err(LedgerError::InsufficientBalance {
                account_id: projection.account_id,
                available: projection.balance,
                requested: -balance_delta,
            });
        }

        projection.balance = balance;
        projection.outstanding_locked = outstanding_locked;
        Ok(())
    }
}
