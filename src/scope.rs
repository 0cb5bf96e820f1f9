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

//! Role scoping for account reads.
//!
//! The session collaborator hands over a role string and the caller's
//! organization. Agency roles see the accounts they manage, client roles
//! see only their own organization's accounts.

use crate::LedgerError;
use crate::account::LedgerAccount;
use crate::base::OrganizationId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Agency,
    Client,
}

impl Role {
    /// Accepts `agency`/`client` and their prefixed variants (`agency_owner`, `client_member`, ...).
    pub fn parse(role: &str) -> Option<Role> {
        let role = role.trim().to_lowercase();
        let matches = |prefix: &str| role == prefix || role.starts_with(&format!("{prefix}_"));
        if matches("agency") {
            Some(Role::Agency)
        } else if matches("client") {
            Some(Role::Client)
        } else {
            None
        }
    }
}

/// Caller identity as supplied by the session collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub role: String,
    pub organization_id: OrganizationId,
}

impl SessionContext {
    pub fn new(role: impl Into<String>, organization_id: OrganizationId) -> Self {
        Self {
            role: role.into(),
            organization_id,
        }
    }

    /// Maps the session to the accounts it may see.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Forbidden`] for any role that is neither agency nor client.
    pub fn scope(&self) -> Result<AccountScope, LedgerError> {
        match Role::parse(&self.role) {
            Some(Role::Agency) => Ok(AccountScope::ManagedBy(self.organization_id)),
            Some(Role::Client) => Ok(AccountScope::OwnedBy(self.organization_id)),
            None => Err(LedgerError::Forbidden(format!(
                "role `{}` cannot access credit accounts",
                self.role
            ))),
        }
    }
}

/// Filter over accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountScope {
    /// Accounts whose managing agency is the organization.
    ManagedBy(OrganizationId),
    /// Accounts tracking the organization's own usage.
    OwnedBy(OrganizationId),
    /// Either side of the pair.
    Involving(OrganizationId),
}

impl AccountScope {
    pub fn matches(&self, account: &LedgerAccount) -> bool {
        match self {
            AccountScope::ManagedBy(org) => account.managing_agency_id == *org,
            AccountScope::OwnedBy(org) => account.client_organization_id == *org,
            AccountScope::Involving(org) => {
                account.managing_agency_id == *org || account.client_organization_id == *org
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parsing_accepts_prefixes() {
        assert_eq!(Role::parse("agency"), Some(Role::Agency));
        assert_eq!(Role::parse("agency_owner"), Some(Role::Agency));
        assert_eq!(Role::parse("Client_Member"), Some(Role::Client));
        assert_eq!(Role::parse("agencyowner"), None);
        assert_eq!(Role::parse("super_admin"), None);
        assert_eq!(Role::parse(""), None);
    }

    #[test]
    fn unknown_role_is_forbidden() {
        let session = SessionContext::new("super_admin", OrganizationId::new());
        assert!(matches!(session.scope(), Err(LedgerError::Forbidden(_))));
    }

    #[test]
    fn scopes_match_their_side_of_the_pair() {
        let agency = OrganizationId::new();
        let client = OrganizationId::new();
        let account = LedgerAccount::new(agency, client, None);

        assert!(AccountScope::ManagedBy(agency).matches(&account));
        assert!(!AccountScope::ManagedBy(client).matches(&account));
        assert!(AccountScope::OwnedBy(client).matches(&account));
        assert!(!AccountScope::OwnedBy(agency).matches(&account));
        assert!(AccountScope::Involving(agency).matches(&account));
        assert!(AccountScope::Involving(client).matches(&account));
        assert!(!AccountScope::Involving(OrganizationId::new()).matches(&account));
    }
}
