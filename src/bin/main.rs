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

use clap::Parser;
use credit_ledger::{
    AccountId, AccountLookup, ActorId, ApplyOperationsRequest, LedgerConfig, LedgerError,
    LedgerService, OperationInput, OperationStatus, OrganizationId, RemoveOperationsRequest,
};
use csv::{ReaderBuilder, Trim, Writer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Credit Ledger - Replay credit events from a CSV file
///
/// Reads credit events from a CSV file and outputs per-account balances to stdout.
/// Supports purchases, consumptions, refunds, locks, lock releases and removals.
#[derive(Parser, Debug)]
#[command(name = "credit-ledger")]
#[command(about = "A credit ledger that replays credit event CSVs", long_about = None)]
struct Args {
    /// Path to CSV file with credit events
    ///
    /// Expected format: type,agency,client,actor,quantity,description
    /// Example: cargo run -- events.csv > balances.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// TOML configuration file; `CREDIT_LEDGER__*` variables override it
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Let consumptions drive balances below zero
    #[arg(long)]
    allow_negative: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("credit_ledger=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match LedgerConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            process::exit(1);
        }
    };
    config.balance.allow_negative |= args.allow_negative;

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let ledger = match process_events(BufReader::new(file), config) {
        Ok(ledger) => ledger,
        Err(e) => {
            eprintln!("Error processing events: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = write_balances(&ledger, std::io::stdout()) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }
}

/// Raw CSV record matching the input format.
///
/// Fields: `type, agency, client, actor, quantity, description`
#[derive(Debug, Deserialize)]
struct CsvRecord {
    #[serde(rename = "type")]
    event: String,
    agency: String,
    client: String,
    actor: String,
    quantity: i64,
    #[serde(default)]
    description: Option<String>,
}

/// What a CSV row asks the ledger to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Apply(OperationStatus),
    Remove,
}

impl Event {
    fn parse(event: &str) -> Option<Event> {
        if event.eq_ignore_ascii_case("remove") {
            return Some(Event::Remove);
        }
        event.parse().ok().map(Event::Apply)
    }
}

/// A [`LedgerService`] plus the mapping from CSV labels to identifiers.
///
/// Labels are free-form; each distinct label gets a fresh id on first sight.
pub struct CsvLedger {
    service: LedgerService,
    organizations: HashMap<String, OrganizationId>,
    actors: HashMap<String, ActorId>,
    /// client label -> agency label, ordered for stable output
    clients: BTreeMap<String, String>,
}

impl CsvLedger {
    fn new(config: LedgerConfig) -> Self {
        Self {
            service: LedgerService::with_config(config),
            organizations: HashMap::new(),
            actors: HashMap::new(),
            clients: BTreeMap::new(),
        }
    }

    fn organization(&mut self, label: &str) -> OrganizationId {
        *self.organizations.entry(label.to_string()).or_default()
    }

    fn actor(&mut self, label: &str) -> ActorId {
        *self.actors.entry(label.to_string()).or_default()
    }

    fn apply(&mut self, record: CsvRecord) -> Result<(), LedgerError> {
        let event = Event::parse(&record.event)
            .ok_or_else(|| LedgerError::InvalidOperation(format!("unknown event `{}`", record.event)))?;
        let agency = self.organization(&record.agency);
        let client = self.organization(&record.client);
        let actor = self.actor(&record.actor);

        let mut input = OperationInput::new(actor, OperationStatus::Consumed, record.quantity);
        input.description = record.description.filter(|d| !d.is_empty());

        match event {
            Event::Apply(status) => {
                input.status = Some(status);
                let mut request = ApplyOperationsRequest::for_client_organization(client, vec![input]);
                request.managing_agency_id = Some(agency);
                self.service.apply_operations(request)?;
            }
            Event::Remove => {
                self.service.remove_operations(RemoveOperationsRequest {
                    client_organization_id: Some(client),
                    operations: vec![input],
                    ..RemoveOperationsRequest::default()
                })?;
            }
        }
        self.clients.entry(record.client).or_insert(record.agency);
        Ok(())
    }

    pub fn balance(&self, client_label: &str) -> Option<i64> {
        let client = self.organizations.get(client_label)?;
        self.service
            .get(AccountLookup::ClientOrganization(*client))
            .ok()
            .map(|view| view.balance)
    }
}

/// Replays credit events from a CSV reader.
///
/// Rows are streamed. Malformed rows and events the ledger rejects are
/// logged and skipped; they never abort the run.
///
/// # CSV Format
///
/// Expected columns: `type, agency, client, actor, quantity, description`
/// - `type`: Operation status (purchased, consumed, refunded, locked, expired) or `remove`
/// - `agency`, `client`, `actor`: Free-form labels
/// - `quantity`: Positive integer
/// - `description`: Optional
///
/// # Example
///
/// ```csv
/// type,agency,client,actor,quantity,description
/// purchased,acme-agency,globex,alice,100,Top up
/// consumed,acme-agency,globex,alice,30,
/// ```
///
/// # Errors
///
/// Returns a CSV error if the reader fails or the CSV structure is invalid.
pub fn process_events<R: Read>(reader: R, config: LedgerConfig) -> Result<CsvLedger, csv::Error> {
    let mut ledger = CsvLedger::new(config);

    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for (index, result) in rdr.deserialize::<CsvRecord>().enumerate() {
        let row = index + 2;
        match result {
            Ok(record) => {
                if let Err(e) = ledger.apply(record) {
                    warn!(row, error = %e, "skipping rejected event");
                }
            }
            Err(e) => {
                warn!(row, error = %e, "skipping malformed row");
            }
        }
    }

    Ok(ledger)
}

#[derive(Debug, Serialize)]
struct BalanceRow<'a> {
    client: &'a str,
    agency: &'a str,
    account: AccountId,
    balance: i64,
    purchased: i64,
    consumed: i64,
    refunded: i64,
    locked: i64,
    expired: i64,
}

/// Writes one summary row per client account, ordered by client label.
///
/// # CSV Format
///
/// Columns: `client, agency, account, balance, purchased, consumed, refunded, locked, expired`
///
/// # Errors
///
/// Returns a CSV error if writing fails.
pub fn write_balances<W: Write>(ledger: &CsvLedger, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);

    for (client, agency) in &ledger.clients {
        let Some(client_id) = ledger.organizations.get(client) else {
            continue;
        };
        let summary = ledger
            .service
            .get(AccountLookup::ClientOrganization(*client_id))
            .and_then(|view| ledger.service.get_summary(view.id));
        let summary = match summary {
            Ok(summary) => summary,
            Err(e) => {
                warn!(client = %client, error = %e, "skipping unreadable account");
                continue;
            }
        };
        wtr.serialize(BalanceRow {
            client,
            agency,
            account: summary.account_id,
            balance: summary.balance,
            purchased: summary.totals.purchased,
            consumed: summary.totals.consumed,
            refunded: summary.totals.refunded,
            locked: summary.totals.locked,
            expired: summary.totals.expired,
        })?;
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const HEADER: &str = "type,agency,client,actor,quantity,description\n";

    fn replay(rows: &str) -> CsvLedger {
        process_events(Cursor::new(format!("{HEADER}{rows}")), LedgerConfig::default()).unwrap()
    }

    #[test]
    fn parse_simple_purchase() {
        let ledger = replay("purchased,agency,acme,alice,100,Top up\n");
        assert_eq!(ledger.clients.len(), 1);
        assert_eq!(ledger.balance("acme"), Some(100));
    }

    #[test]
    fn parse_purchase_and_consumption() {
        let ledger = replay(
            "purchased,agency,acme,alice,100,\n\
             consumed,agency,acme,bob,30,\n",
        );
        assert_eq!(ledger.balance("acme"), Some(70));
    }

    #[test]
    fn lock_and_release() {
        let ledger = replay(
            "purchased,agency,acme,alice,100,\n\
             locked,agency,acme,alice,40,\n\
             expired,agency,acme,alice,15,\n",
        );
        assert_eq!(ledger.balance("acme"), Some(75));
    }

    #[test]
    fn overdraft_is_skipped() {
        let ledger = replay(
            "purchased,agency,acme,alice,10,\n\
             consumed,agency,acme,alice,11,\n",
        );
        assert_eq!(ledger.balance("acme"), Some(10));
    }

    #[test]
    fn overdraft_is_applied_when_negative_balances_are_allowed() {
        let mut config = LedgerConfig::default();
        config.balance.allow_negative = true;
        let csv = format!("{HEADER}purchased,agency,acme,alice,10,\nconsumed,agency,acme,alice,11,\n");
        let ledger = process_events(Cursor::new(csv), config).unwrap();
        assert_eq!(ledger.balance("acme"), Some(-1));
    }

    #[test]
    fn removal_requires_an_existing_account() {
        let ledger = replay(
            "remove,agency,acme,alice,5,\n\
             purchased,agency,globex,alice,20,\n\
             remove,agency,globex,alice,5,Cleanup\n",
        );
        assert_eq!(ledger.balance("acme"), None);
        assert_eq!(ledger.balance("globex"), Some(15));
    }

    #[test]
    fn parse_with_whitespace_and_mixed_case() {
        let ledger = replay(" Purchased , agency , acme , alice , 100 , \n");
        assert_eq!(ledger.balance("acme"), Some(100));
    }

    #[test]
    fn skip_malformed_rows() {
        let ledger = replay(
            "purchased,agency,acme,alice,100,\n\
             purchased,agency,globex,alice,not-a-number,\n\
             voided,agency,globex,alice,5,\n\
             purchased,agency,initech,alice,0,\n\
             purchased,agency,umbrella,alice,50,\n",
        );
        assert_eq!(ledger.clients.len(), 2);
        assert_eq!(ledger.balance("globex"), None);
        assert_eq!(ledger.balance("initech"), None);
    }

    #[test]
    fn write_balances_to_csv() {
        let ledger = replay(
            "purchased,agency-b,zeta,alice,100,\n\
             purchased,agency-a,alpha,alice,50,\n\
             consumed,agency-a,alpha,alice,20,\n",
        );

        let mut output = Vec::new();
        write_balances(&ledger, &mut output).unwrap();
        let output = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = output.lines().collect();

        assert_eq!(
            lines[0],
            "client,agency,account,balance,purchased,consumed,refunded,locked,expired"
        );
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("alpha,agency-a,"));
        assert!(lines[1].ends_with(",30,50,20,0,0,0"));
        assert!(lines[2].starts_with("zeta,agency-b,"));
    }
}
