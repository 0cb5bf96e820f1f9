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

//! Ledger operations and their embedded audit history.
//!
//! An operation is append-only: once stored, only `quantity`, `status`,
//! `description` and `metadata` change, and only through an audited
//! correction. Quantity corrections append a [`HistoryEntry`]; the history
//! list is never rewritten.
//!
//! ```text
//!  created ──correct──► created (+1 history entry per quantity change)
//!     │
//!     └──delete──► soft-deleted (excluded from every read and from the balance)
//! ```

use crate::LedgerError;
use crate::base::{AccountId, ActorId, OperationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Reserved metadata key holding the correction history.
pub const HISTORY_KEY: &str = "history";

/// Direction and meaning of an operation's quantity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    #[default]
    Purchased,
    Consumed,
    Refunded,
    Locked,
    Expired,
}

impl OperationStatus {
    pub const ALL: [OperationStatus; 5] = [
        OperationStatus::Purchased,
        OperationStatus::Consumed,
        OperationStatus::Refunded,
        OperationStatus::Locked,
        OperationStatus::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Purchased => "purchased",
            OperationStatus::Consumed => "consumed",
            OperationStatus::Refunded => "refunded",
            OperationStatus::Locked => "locked",
            OperationStatus::Expired => "expired",
        }
    }

    /// Whether applying this status can lower the balance.
    pub fn is_debit(&self) -> bool {
        matches!(self, OperationStatus::Consumed | OperationStatus::Locked)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        OperationStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == needle)
            .ok_or_else(|| LedgerError::invalid(format!("unknown operation status `{}`", s.trim())))
    }
}

/// Provenance of an operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    System,
    #[default]
    User,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::System => f.write_str("system"),
            OperationKind::User => f.write_str("user"),
        }
    }
}

/// What produced a history entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HistoryAction {
    Update,
    Remove,
}

/// One audited quantity change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub old_quantity: i64,
    pub new_quantity: i64,
    /// Account balance right after the change.
    pub remaining: i64,
    pub changed_at: DateTime<Utc>,
    pub changed_by: ActorId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub operation_type: HistoryAction,
}

/// Structured metadata bag: the append-only history plus free-form caller keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OperationMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    history: Vec<HistoryEntry>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl OperationMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds metadata from caller-supplied keys.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidOperation`] if the map tries to set the reserved `history` key.
    pub fn from_extra(extra: Map<String, Value>) -> Result<Self, LedgerError> {
        if extra.contains_key(HISTORY_KEY) {
            return Err(LedgerError::invalid("metadata key `history` is reserved"));
        }
        Ok(Self {
            history: Vec::new(),
            extra,
        })
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Merges caller keys, overwriting existing ones. History is untouched.
    pub(crate) fn merge_extra(&mut self, extra: Map<String, Value>) -> Result<(), LedgerError> {
        if extra.contains_key(HISTORY_KEY) {
            return Err(LedgerError::invalid("metadata key `history` is reserved"));
        }
        self.extra.extend(extra);
        Ok(())
    }

    pub(crate) fn append_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }
}

/// A stored ledger operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerOperation {
    pub id: OperationId,
    pub account_id: AccountId,
    pub actor_id: ActorId,
    pub status: OperationStatus,
    pub kind: OperationKind,
    pub quantity: i64,
    pub description: Option<String>,
    pub metadata: OperationMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl LedgerOperation {
    /// Materializes a validated input for `account_id`.
    pub(crate) fn from_input(
        input: ValidatedInput,
        account_id: AccountId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OperationId::new(),
            account_id,
            actor_id: input.actor_id,
            status: input.status,
            kind: input.kind,
            quantity: input.quantity,
            description: input.description,
            metadata: input.metadata,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        self.metadata.history()
    }
}

/// Caller-supplied operation, before validation and defaulting.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OperationInput {
    /// Account the caller believes this operation belongs to; used for resolution.
    #[serde(default)]
    pub account_id: Option<AccountId>,
    #[serde(default)]
    pub actor_id: Option<ActorId>,
    #[serde(default)]
    pub status: Option<OperationStatus>,
    #[serde(default)]
    pub kind: Option<OperationKind>,
    pub quantity: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl OperationInput {
    pub fn new(actor_id: ActorId, status: OperationStatus, quantity: i64) -> Self {
        Self {
            actor_id: Some(actor_id),
            status: Some(status),
            quantity,
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_kind(mut self, kind: OperationKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn for_account(mut self, account_id: AccountId) -> Self {
        self.account_id = Some(account_id);
        self
    }

    /// Checks `quantity > 0` and actor presence, then applies defaults
    /// (`purchased`, `user`).
    pub(crate) fn validate(self) -> Result<ValidatedInput, LedgerError> {
        if self.quantity <= 0 {
            return Err(LedgerError::invalid("quantity must be greater than 0"));
        }
        let actor_id = self
            .actor_id
            .filter(ActorId::is_present)
            .ok_or_else(|| LedgerError::invalid("actor id is required"))?;
        let metadata = match self.metadata {
            Some(extra) => OperationMetadata::from_extra(extra)?,
            None => OperationMetadata::new(),
        };
        Ok(ValidatedInput {
            actor_id,
            status: self.status.unwrap_or_default(),
            kind: self.kind.unwrap_or_default(),
            quantity: self.quantity,
            description: self.description,
            metadata,
        })
    }
}

/// An [`OperationInput`] that passed validation.
#[derive(Debug, Clone)]
pub(crate) struct ValidatedInput {
    pub actor_id: ActorId,
    pub status: OperationStatus,
    pub kind: OperationKind,
    pub quantity: i64,
    pub description: Option<String>,
    pub metadata: OperationMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!(" Consumed ".parse::<OperationStatus>().unwrap(), OperationStatus::Consumed);
        assert!("voided".parse::<OperationStatus>().is_err());
    }

    #[test]
    fn validate_applies_defaults() {
        let input = OperationInput {
            actor_id: Some(ActorId::new()),
            quantity: 10,
            ..OperationInput::default()
        };
        let validated = input.validate().unwrap();
        assert_eq!(validated.status, OperationStatus::Purchased);
        assert_eq!(validated.kind, OperationKind::User);
    }

    #[test]
    fn validate_rejects_non_positive_quantity() {
        for quantity in [0, -1, i64::MIN] {
            let input = OperationInput::new(ActorId::new(), OperationStatus::Purchased, quantity);
            assert_eq!(
                input.validate().unwrap_err(),
                LedgerError::invalid("quantity must be greater than 0")
            );
        }
    }

    #[test]
    fn validate_rejects_missing_actor() {
        let input = OperationInput {
            quantity: 5,
            ..OperationInput::default()
        };
        assert_eq!(input.validate().unwrap_err(), LedgerError::invalid("actor id is required"));

        let nil = OperationInput::new(ActorId(uuid::Uuid::nil()), OperationStatus::Consumed, 5);
        assert!(nil.validate().is_err());
    }

    #[test]
    fn metadata_rejects_reserved_history_key() {
        let extra = json!({ "history": [] }).as_object().cloned().unwrap();
        assert!(OperationMetadata::from_extra(extra).is_err());
    }

    #[test]
    fn metadata_serializes_history_alongside_extra_keys() {
        let extra = json!({ "source": "onboarding" }).as_object().cloned().unwrap();
        let mut metadata = OperationMetadata::from_extra(extra).unwrap();
        metadata.append_history(HistoryEntry {
            old_quantity: 10,
            new_quantity: 12,
            remaining: 12,
            changed_at: Utc::now(),
            changed_by: ActorId::new(),
            description: None,
            kind: OperationKind::User,
            status: OperationStatus::Purchased,
            operation_type: HistoryAction::Update,
        });

        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["source"], "onboarding");
        assert_eq!(value["history"][0]["oldQuantity"], 10);
        assert_eq!(value["history"][0]["newQuantity"], 12);
        assert_eq!(value["history"][0]["type"], "user");
        assert_eq!(value["history"][0]["operationType"], "update");

        let back: OperationMetadata = serde_json::from_value(value).unwrap();
        assert_eq!(back, metadata);
    }
}
