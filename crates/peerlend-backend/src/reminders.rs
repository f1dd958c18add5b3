//! Periodic due-date reminders for open loans.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use peerlend_types::LoanEventKind;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::state::LoanStore;

const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct ReminderConfig {
    /// Time between passes.
    pub interval: Duration,
    /// How far ahead of a due date the borrower is reminded.
    pub window: chrono::Duration,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            window: chrono::Duration::days(2),
        }
    }
}

/// Sends a `LoanDue` notice to the borrower of every open loan entering the window.
/// Returns how many were sent.
pub fn run_reminder_pass(
    store: &LoanStore,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> usize {
    let due = store.take_due_for_reminder(now, window);
    for loan in &due {
        store.push_notification(&loan.borrower_id, loan.id, LoanEventKind::LoanDue, now);
        debug!(
            loan_id = %loan.id,
            user = %loan.borrower_id,
            due_date = %loan.due_date,
            "due reminder sent"
        );
    }
    due.len()
}

/// Runs a pass every `config.interval`, the first one immediately. A zero interval
/// is raised to one second.
pub fn spawn_reminder_loop(store: Arc<LoanStore>, config: ReminderConfig) -> JoinHandle<()> {
    let period = config.interval.max(MIN_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let sent = run_reminder_pass(&store, Utc::now(), config.window);
            if sent > 0 {
                info!(sent, "due reminders sent");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use alloy_primitives::U256;
    use chrono::Utc;
    use peerlend_types::wire::{NewLoanRequest, UserProfile};
    use peerlend_types::{ActionKind, LoanEventKind, LoanState, TxHash, UserId};

    use super::{run_reminder_pass, spawn_reminder_loop, ReminderConfig};
    use crate::state::LoanStore;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn store_with_approved_loan(due_in: chrono::Duration) -> LoanStore {
        let store = LoanStore::new();
        for id in ["alice", "bob"] {
            store
                .register_user(UserProfile {
                    user_id: user(id),
                    display_name: id.to_string(),
                })
                .expect("register");
        }
        store.add_friend(&user("alice"), &user("bob")).expect("friends");
        let loan = store
            .create_loan(
                &user("alice"),
                &NewLoanRequest {
                    lender_id: user("bob"),
                    amount: U256::from(10u64),
                    collateral: "phone".to_string(),
                    due_date: Utc::now() + due_in,
                },
                Utc::now(),
            )
            .expect("created");
        let mut approved = loan.clone();
        approved.state = LoanState::Approved;
        store
            .commit_loan(&loan, approved, TxHash::new([9; 32]), ActionKind::Approve)
            .expect("approved");
        store
    }

    #[test]
    fn reminds_borrower_once() {
        let store = store_with_approved_loan(chrono::Duration::hours(20));
        let window = chrono::Duration::days(1);
        assert_eq!(run_reminder_pass(&store, Utc::now(), window), 1);
        assert_eq!(run_reminder_pass(&store, Utc::now(), window), 0);

        let inbox = store.notifications(&user("alice"));
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].kind, LoanEventKind::LoanDue);
        assert!(store.notifications(&user("bob")).is_empty());
    }

    #[test]
    fn distant_due_date_is_skipped() {
        let store = store_with_approved_loan(chrono::Duration::days(30));
        assert_eq!(
            run_reminder_pass(&store, Utc::now(), chrono::Duration::days(2)),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn loop_runs_on_first_tick() {
        let store = Arc::new(store_with_approved_loan(chrono::Duration::hours(1)));
        let handle = spawn_reminder_loop(
            Arc::clone(&store),
            ReminderConfig {
                interval: Duration::from_secs(60),
                window: chrono::Duration::days(1),
            },
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.notifications(&user("alice")).len(), 1);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_still_runs() {
        let store = Arc::new(store_with_approved_loan(chrono::Duration::hours(1)));
        let handle = spawn_reminder_loop(
            Arc::clone(&store),
            ReminderConfig {
                interval: Duration::ZERO,
                window: chrono::Duration::days(1),
            },
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        assert_eq!(store.notifications(&user("alice")).len(), 1);
        handle.abort();
    }
}
