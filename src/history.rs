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

//! Audit trail for post-hoc quantity changes.
//!
//! Every change of an operation's effective quantity appends one
//! [`HistoryEntry`] to its metadata in the same row update that changes the
//! quantity. Unchanged quantities are not audited. Entries are never
//! reordered, rewritten or dropped.

use crate::base::ActorId;
use crate::operation::{HistoryAction, HistoryEntry, LedgerOperation};
use chrono::{DateTime, Utc};

/// Who changed what, and where the balance landed.
#[derive(Debug, Clone)]
pub struct ChangeContext {
    pub changed_by: ActorId,
    pub changed_at: DateTime<Utc>,
    pub description: Option<String>,
    /// Account balance once the change is applied.
    pub remaining: i64,
}

impl ChangeContext {
    pub fn new(changed_by: ActorId, remaining: i64) -> Self {
        Self {
            changed_by,
            changed_at: Utc::now(),
            description: None,
            remaining,
        }
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }
}

pub struct HistoryTracker;

impl HistoryTracker {
    /// Sets the operation's quantity to `new_quantity`, auditing the change.
    ///
    /// Returns `false` (and appends nothing) when the quantity is unchanged.
    pub fn correct_quantity(
        operation: &mut LedgerOperation,
        new_quantity: i64,
        context: &ChangeContext,
    ) -> bool {
        let old_quantity = operation.quantity;
        if !Self::append(operation, old_quantity, new_quantity, HistoryAction::Update, context) {
            return false;
        }
        operation.quantity = new_quantity;
        operation.updated_at = context.changed_at;
        true
    }

    /// Audits a freshly created removal operation: its quantity went from nothing to `quantity`.
    pub fn record_removal(operation: &mut LedgerOperation, context: &ChangeContext) -> bool {
        let quantity = operation.quantity;
        Self::append(operation, 0, quantity, HistoryAction::Remove, context)
    }

    /// Audits a soft delete: the operation stops contributing its quantity.
    pub fn record_deletion(operation: &mut LedgerOperation, context: &ChangeContext) -> bool {
        let quantity = operation.quantity;
        Self::append(operation, quantity, 0, HistoryAction::Remove, context)
    }

    fn append(
        operation: &mut LedgerOperation,
        old_quantity: i64,
        new_quantity: i64,
        action: HistoryAction,
        context: &ChangeContext,
    ) -> bool {
        if old_quantity == new_quantity {
            return false;
        }
        let entry = HistoryEntry {
            old_quantity,
            new_quantity,
            remaining: context.remaining,
            changed_at: context.changed_at,
            changed_by: context.changed_by,
            description: context.description.clone(),
            kind: operation.kind,
            status: operation.status,
            operation_type: action,
        };
        operation.metadata.append_history(entry);
        true
    }
}
