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

//! Ledger accounts.
//!
//! One non-deleted account exists per (managing agency, client organization)
//! pair. Its `balance` is a cached projection of the operation log and is
//! written only by the ledger service, in the same commit as the operations
//! that move it.
//!
//! # Example
//!
//! ```
//! use credit_ledger::{LedgerAccount, OrganizationId};
//!
//! let account = LedgerAccount::new(OrganizationId::new(), OrganizationId::new(), None);
//! assert_eq!(account.balance, 0);
//! assert!(!account.is_deleted());
//! ```

use crate::base::{AccountId, ActorId, OrganizationId};
use crate::operation::{LedgerOperation, OperationKind, OperationMetadata, OperationStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stored ledger account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerAccount {
    pub id: AccountId,
    pub managing_agency_id: OrganizationId,
    pub client_organization_id: OrganizationId,
    pub balance: i64,
    pub created_by_user_id: Option<ActorId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl LedgerAccount {
    pub fn new(
        managing_agency_id: OrganizationId,
        client_organization_id: OrganizationId,
        created_by_user_id: Option<ActorId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: AccountId::new(),
            managing_agency_id,
            client_organization_id,
            balance: 0,
            created_by_user_id,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Builds the opening operation that backs a positive initial balance.
    pub(crate) fn opening_operation(&self, quantity: i64, actor_id: ActorId) -> LedgerOperation {
        LedgerOperation {
            id: crate::OperationId::new(),
            account_id: self.id,
            actor_id,
            status: OperationStatus::Purchased,
            kind: OperationKind::System,
            quantity,
            description: Some("Initial balance".to_string()),
            metadata: OperationMetadata::new(),
            created_at: self.created_at,
            updated_at: self.created_at,
            deleted_at: None,
        }
    }
}

/// Operation as exposed inside an [`AccountView`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationView {
    pub id: crate::OperationId,
    pub status: OperationStatus,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub quantity: i64,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub actor_id: ActorId,
    pub metadata: OperationMetadata,
}

impl From<LedgerOperation> for OperationView {
    fn from(op: LedgerOperation) -> Self {
        Self {
            id: op.id,
            status: op.status,
            kind: op.kind,
            quantity: op.quantity,
            description: op.description,
            created_at: op.created_at,
            updated_at: op.updated_at,
            actor_id: op.actor_id,
            metadata: op.metadata,
        }
    }
}

/// Account response returned to callers: the account plus its live operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub id: AccountId,
    pub managing_agency_id: OrganizationId,
    pub client_organization_id: OrganizationId,
    pub balance: i64,
    pub operations: Vec<OperationView>,
}

impl AccountView {
    pub fn new(account: LedgerAccount, operations: Vec<LedgerOperation>) -> Self {
        Self {
            id: account.id,
            managing_agency_id: account.managing_agency_id,
            client_organization_id: account.client_organization_id,
            balance: account.balance,
            operations: operations.into_iter().map(OperationView::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_operation_is_a_system_purchase() {
        let account = LedgerAccount::new(OrganizationId::new(), OrganizationId::new(), None);
        let actor = ActorId::new();
        let op = account.opening_operation(40, actor);

        assert_eq!(op.account_id, account.id);
        assert_eq!(op.status, OperationStatus::Purchased);
        assert_eq!(op.kind, OperationKind::System);
        assert_eq!(op.quantity, 40);
        assert_eq!(op.actor_id, actor);
        assert!(op.history().is_empty());
    }

    #[test]
    fn view_serializes_with_camel_case_keys() {
        let account = LedgerAccount::new(OrganizationId::new(), OrganizationId::new(), None);
        let op = account.opening_operation(5, ActorId::new());
        let view = AccountView::new(account.clone(), vec![op]);

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["managingAgencyId"], account.managing_agency_id.to_string());
        assert_eq!(json["clientOrganizationId"], account.client_organization_id.to_string());
        assert_eq!(json["operations"][0]["type"], "system");
        assert_eq!(json["operations"][0]["status"], "purchased");
        assert_eq!(json["operations"][0]["quantity"], 5);
    }
}
