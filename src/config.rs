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

//! Ledger configuration.
//!
//! Values come from an optional TOML file and are then overridden by
//! environment variables prefixed with `CREDIT_LEDGER`, using `__` as the
//! section separator (`CREDIT_LEDGER__BALANCE__ALLOW_NEGATIVE=true`).

use serde::Deserialize;
use std::path::Path;

const ENV_PREFIX: &str = "CREDIT_LEDGER";

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct LedgerConfig {
    #[serde(default)]
    pub pagination: PaginationDefaults,
    #[serde(default)]
    pub balance: BalancePolicy,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct PaginationDefaults {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
}

fn default_limit() -> usize {
    50
}

fn default_max_limit() -> usize {
    500
}

impl Default for PaginationDefaults {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
pub struct BalancePolicy {
    /// Let debits drive the balance below zero instead of failing with
    /// `InsufficientBalance`.
    #[serde(default)]
    pub allow_negative: bool,
}

impl LedgerConfig {
    /// Loads configuration from `path` (if given) and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed, or a value has the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_sources() {
        let config = LedgerConfig::default();
        assert_eq!(config.pagination.default_limit, 50);
        assert_eq!(config.pagination.max_limit, 500);
        assert!(!config.balance.allow_negative);
    }

    #[test]
    fn loads_partial_toml_file() {
        let path = std::env::temp_dir().join(format!("credit-ledger-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[pagination]\ndefault_limit = 20\n\n[balance]\nallow_negative = true").unwrap();
        drop(file);

        let config = LedgerConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.pagination.default_limit, 20);
        assert_eq!(config.pagination.max_limit, 500);
        assert!(config.balance.allow_negative);
    }

    #[test]
    fn missing_file_is_an_error() {
        let path = Path::new("/nonexistent/credit-ledger.toml");
        assert!(LedgerConfig::load(Some(path)).is_err());
    }
}
