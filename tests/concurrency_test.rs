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

//! Concurrency tests for the ledger service.
//!
//! These tests drive the public service from many threads and check that
//! per-account serialization loses no updates, that opposite-direction
//! transfers cannot deadlock, and that lazy account creation happens once.
//!
//! The service's locks are parking_lot primitives; with the
//! `deadlock_detection` feature a watcher thread reports any cycle in the
//! lock graph.

use credit_ledger::{
    AccountId, ActorId, ApplyOperationsRequest, CreateAccountRequest, CreditChange, LedgerError,
    LedgerService, OperationInput, OperationStatus, OrganizationId, TransferRequest,
};
use parking_lot::deadlock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Watches for deadlocks until dropped; records whether one was seen.
struct DeadlockWatcher {
    running: Arc<AtomicBool>,
    detected: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DeadlockWatcher {
    fn start() -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let detected = Arc::new(AtomicBool::new(false));
        let (running_clone, detected_clone) = (running.clone(), detected.clone());

        let handle = thread::spawn(move || {
            while running_clone.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(50));
                let deadlocks = deadlock::check_deadlock();
                if !deadlocks.is_empty() {
                    eprintln!("\n=== DEADLOCK DETECTED ===");
                    for (i, threads) in deadlocks.iter().enumerate() {
                        eprintln!("\nDeadlock #{}", i + 1);
                        for t in threads {
                            eprintln!("Thread ID: {:?}", t.thread_id());
                            eprintln!("Backtrace:\n{:#?}", t.backtrace());
                        }
                    }
                    detected_clone.store(true, Ordering::SeqCst);
                    return;
                }
            }
        });

        Self {
            running,
            detected,
            handle: Some(handle),
        }
    }

    fn finish(mut self) -> bool {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
        self.detected.load(Ordering::SeqCst)
    }
}

fn open(service: &LedgerService, actor: ActorId, initial_balance: i64) -> AccountId {
    let mut request = CreateAccountRequest::new(OrganizationId::new(), OrganizationId::new());
    request.initial_balance = initial_balance;
    request.created_by = Some(actor);
    service.create_account(request).unwrap().id
}

#[test]
fn concurrent_applies_lose_no_updates() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 50;
    const QUANTITY: i64 = 3;

    let service = Arc::new(LedgerService::new());
    let actor = ActorId::new();
    let account = open(&service, actor, 0);
    let watcher = DeadlockWatcher::start();

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let service = service.clone();
            thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    service
                        .add_credits(account, CreditChange::new(actor, QUANTITY))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(!watcher.finish(), "deadlock detected");
    let expected = (THREADS * PER_THREAD) as i64 * QUANTITY;
    assert_eq!(service.get_balance(account), Ok(expected));
    assert_eq!(service.verify_balance(account), Ok(expected));
}

#[test]
fn concurrent_consumers_never_overdraw() {
    const THREADS: usize = 8;
    const ATTEMPTS: usize = 20;

    let service = Arc::new(LedgerService::new());
    let actor = ActorId::new();
    let account = open(&service, actor, 100);
    let accepted = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let (service, accepted) = (service.clone(), accepted.clone());
            thread::spawn(move || {
                for _ in 0..ATTEMPTS {
                    match service.consume_credits(account, CreditChange::new(actor, 1)) {
                        Ok(_) => {
                            accepted.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(LedgerError::InsufficientBalance { .. }) => {}
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(accepted.load(Ordering::SeqCst), 100);
    assert_eq!(service.get_balance(account), Ok(0));
    assert_eq!(service.verify_balance(account), Ok(0));
}

#[test]
fn opposite_direction_transfers_do_not_deadlock() {
    const ROUNDS: usize = 200;

    let service = Arc::new(LedgerService::new());
    let actor = ActorId::new();
    let a = open(&service, actor, 1_000);
    let b = open(&service, actor, 1_000);
    let watcher = DeadlockWatcher::start();

    let spawn_transfers = |from: AccountId, to: AccountId| {
        let service = service.clone();
        thread::spawn(move || {
            for _ in 0..ROUNDS {
                service
                    .transfer_credits(TransferRequest {
                        from_account_id: from,
                        to_account_id: to,
                        quantity: 1,
                        actor_id: actor,
                        description: None,
                        metadata: None,
                    })
                    .unwrap();
            }
        })
    };
    let handles = vec![
        spawn_transfers(a, b),
        spawn_transfers(b, a),
        spawn_transfers(a, b),
        spawn_transfers(b, a),
    ];
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(!watcher.finish(), "deadlock detected");
    assert_eq!(service.get_balance(a), Ok(1_000));
    assert_eq!(service.get_balance(b), Ok(1_000));
    assert_eq!(service.verify_balance(a), Ok(1_000));
    assert_eq!(service.verify_balance(b), Ok(1_000));
}

#[test]
fn lazy_creation_happens_once_per_client_organization() {
    const THREADS: usize = 8;

    let service = Arc::new(LedgerService::new());
    let (agency, client) = (OrganizationId::new(), OrganizationId::new());
    let actor = ActorId::new();

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let service = service.clone();
            thread::spawn(move || {
                let mut request = ApplyOperationsRequest::for_client_organization(
                    client,
                    vec![OperationInput::new(actor, OperationStatus::Purchased, 10)],
                );
                request.managing_agency_id = Some(agency);
                service.apply_operations(request).unwrap().id
            })
        })
        .collect();
    let ids: Vec<AccountId> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(service.store().account_rows(), 1);
    assert_eq!(service.get_balance(ids[0]), Ok(10 * THREADS as i64));
}

#[test]
fn mixed_operations_across_accounts_stay_consistent() {
    const ACCOUNTS: usize = 6;
    const THREADS: usize = 6;
    const ROUNDS: usize = 100;

    let service = Arc::new(LedgerService::new());
    let actor = ActorId::new();
    let accounts: Arc<Vec<AccountId>> =
        Arc::new((0..ACCOUNTS).map(|_| open(&service, actor, 500)).collect());
    let watcher = DeadlockWatcher::start();

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let (service, accounts) = (service.clone(), accounts.clone());
            thread::spawn(move || {
                for round in 0..ROUNDS {
                    let account = accounts[(t + round) % ACCOUNTS];
                    let other = accounts[(t + round + 1) % ACCOUNTS];
                    let _ = match round % 4 {
                        0 => service.add_credits(account, CreditChange::new(actor, 2)).map(|_| ()),
                        1 => service.consume_credits(account, CreditChange::new(actor, 1)).map(|_| ()),
                        2 => service
                            .transfer_credits(TransferRequest {
                                from_account_id: account,
                                to_account_id: other,
                                quantity: 1,
                                actor_id: actor,
                                description: None,
                                metadata: None,
                            })
                            .map(|_| ()),
                        _ => service.get_summary(account).map(|_| ()),
                    };
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(!watcher.finish(), "deadlock detected");
    for account in accounts.iter() {
        let balance = service.get_balance(*account).unwrap();
        assert!(balance >= 0);
        assert_eq!(service.verify_balance(*account), Ok(balance));
    }
}
