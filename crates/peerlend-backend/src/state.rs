use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};
use peerlend_types::wire::{NewLoanRequest, Notification, UserProfile};
use peerlend_types::{
    ActionKind, Address, Loan, LoanEventKind, LoanId, LoanState, Role, TxHash, UserId,
    WalletBinding,
};

use crate::error::ServiceError;

#[derive(Debug, Default)]
struct Inner {
    users: BTreeMap<UserId, UserProfile>,
    friends: HashMap<UserId, BTreeSet<UserId>>,
    bindings: HashMap<UserId, WalletBinding>,
    loans: BTreeMap<LoanId, Loan>,
    next_loan_id: u64,
    notifications: BTreeMap<u64, Notification>,
    next_notification_id: u64,
    /// Settlement hash -> the transition it committed.
    settlements: HashMap<TxHash, (LoanId, ActionKind)>,
    /// Due date each open loan was last reminded for.
    reminded: HashMap<LoanId, DateTime<Utc>>,
}

/// Authoritative record store. All mutation goes through these methods.
#[derive(Debug, Default)]
pub struct LoanStore {
    inner: RwLock<Inner>,
}

impl LoanStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Users and friends
    // -----------------------------------------------------------------------

    pub fn register_user(&self, profile: UserProfile) -> Result<UserProfile, ServiceError> {
        let mut inner = self.write();
        if inner.users.contains_key(&profile.user_id) {
            return Err(ServiceError::Conflict(format!(
                "user {} already registered",
                profile.user_id
            )));
        }
        inner.users.insert(profile.user_id.clone(), profile.clone());
        Ok(profile)
    }

    pub fn user(&self, user_id: &UserId) -> Option<UserProfile> {
        self.read().users.get(user_id).cloned()
    }

    pub fn require_user(&self, user_id: &UserId) -> Result<UserProfile, ServiceError> {
        self.user(user_id)
            .ok_or_else(|| ServiceError::NotFound(format!("user {user_id}")))
    }

    /// Friendship is mutual: both sides see each other afterwards.
    pub fn add_friend(&self, user_id: &UserId, friend_id: &UserId) -> Result<(), ServiceError> {
        if user_id == friend_id {
            return Err(ServiceError::BadRequest(
                "cannot add yourself as a friend".to_string(),
            ));
        }
        let mut inner = self.write();
        for id in [user_id, friend_id] {
            if !inner.users.contains_key(id) {
                return Err(ServiceError::NotFound(format!("user {id}")));
            }
        }
        let already = inner
            .friends
            .get(user_id)
            .is_some_and(|set| set.contains(friend_id));
        if already {
            return Err(ServiceError::Conflict(format!(
                "{friend_id} is already a friend"
            )));
        }
        inner
            .friends
            .entry(user_id.clone())
            .or_default()
            .insert(friend_id.clone());
        inner
            .friends
            .entry(friend_id.clone())
            .or_default()
            .insert(user_id.clone());
        Ok(())
    }

    pub fn friends(&self, user_id: &UserId) -> Vec<UserProfile> {
        let inner = self.read();
        inner
            .friends
            .get(user_id)
            .map(|set| {
                set.iter()
                    .filter_map(|id| inner.users.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn are_friends(&self, a: &UserId, b: &UserId) -> bool {
        self.read()
            .friends
            .get(a)
            .is_some_and(|set| set.contains(b))
    }

    // -----------------------------------------------------------------------
    // Wallet bindings
    // -----------------------------------------------------------------------

    /// Binds or replaces the user's signing address.
    pub fn bind_wallet(
        &self,
        user_id: &UserId,
        address: Address,
        now: DateTime<Utc>,
    ) -> Result<WalletBinding, ServiceError> {
        let mut inner = self.write();
        if !inner.users.contains_key(user_id) {
            return Err(ServiceError::NotFound(format!("user {user_id}")));
        }
        let taken = inner
            .bindings
            .values()
            .any(|b| b.address == address && &b.user_id != user_id);
        if taken {
            return Err(ServiceError::Conflict(format!(
                "address {address} is bound to another user"
            )));
        }
        let binding = WalletBinding {
            user_id: user_id.clone(),
            address,
            bound_at: now,
        };
        inner.bindings.insert(user_id.clone(), binding.clone());
        Ok(binding)
    }

    pub fn binding(&self, user_id: &UserId) -> Option<WalletBinding> {
        self.read().bindings.get(user_id).cloned()
    }

    // -----------------------------------------------------------------------
    // Loans
    // -----------------------------------------------------------------------

    pub fn create_loan(
        &self,
        borrower_id: &UserId,
        request: &NewLoanRequest,
        now: DateTime<Utc>,
    ) -> Result<Loan, ServiceError> {
        if &request.lender_id == borrower_id {
            return Err(ServiceError::BadRequest(
                "cannot request a loan from yourself".to_string(),
            ));
        }
        if request.amount.is_zero() {
            return Err(ServiceError::BadRequest(
                "amount must be positive".to_string(),
            ));
        }
        if request.due_date <= now {
            return Err(ServiceError::BadRequest(
                "due date must be in the future".to_string(),
            ));
        }

        let mut inner = self.write();
        for id in [borrower_id, &request.lender_id] {
            if !inner.users.contains_key(id) {
                return Err(ServiceError::NotFound(format!("user {id}")));
            }
        }
        let friends = inner
            .friends
            .get(borrower_id)
            .is_some_and(|set| set.contains(&request.lender_id));
        if !friends {
            return Err(ServiceError::Forbidden(format!(
                "{} is not a friend of {borrower_id}",
                request.lender_id
            )));
        }

        inner.next_loan_id += 1;
        let loan = Loan {
            id: LoanId(inner.next_loan_id),
            lender_id: request.lender_id.clone(),
            borrower_id: borrower_id.clone(),
            amount: request.amount,
            collateral: request.collateral.clone(),
            due_date: request.due_date,
            state: LoanState::Requested,
            renegotiation: None,
            created_at: now,
        };
        inner.loans.insert(loan.id, loan.clone());
        Ok(loan)
    }

    pub fn loan(&self, loan_id: LoanId) -> Result<Loan, ServiceError> {
        self.read()
            .loans
            .get(&loan_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("loan {loan_id}")))
    }

    /// Loans where `user_id` has `role`, ascending by id.
    pub fn loans_for(&self, user_id: &UserId, role: Role) -> Vec<Loan> {
        self.read()
            .loans
            .values()
            .filter(|loan| loan.participant(role) == user_id)
            .cloned()
            .collect()
    }

    pub fn settlement(&self, tx_hash: &TxHash) -> Option<(LoanId, ActionKind)> {
        self.read().settlements.get(tx_hash).copied()
    }

    /// Stores `next` if the record still equals `prior` and `tx_hash` is unused.
    ///
    /// A racing commit of the same hash for the same transition returns the stored loan.
    pub fn commit_loan(
        &self,
        prior: &Loan,
        next: Loan,
        tx_hash: TxHash,
        action: ActionKind,
    ) -> Result<Loan, ServiceError> {
        let mut inner = self.write();
        match inner.settlements.get(&tx_hash) {
            Some(&(loan_id, kind)) if loan_id == next.id && kind == action => {
                return inner
                    .loans
                    .get(&loan_id)
                    .cloned()
                    .ok_or_else(|| ServiceError::NotFound(format!("loan {loan_id}")));
            }
            Some(_) => {
                return Err(ServiceError::VerificationFailed(format!(
                    "transaction {tx_hash} already settled another transition"
                )));
            }
            None => {}
        }
        if inner.loans.get(&prior.id) != Some(prior) {
            return Err(ServiceError::Conflict(format!(
                "loan {} changed while committing",
                prior.id
            )));
        }
        inner.settlements.insert(tx_hash, (next.id, action));
        if next.state.is_terminal() {
            inner.reminded.remove(&next.id);
        }
        inner.loans.insert(next.id, next.clone());
        Ok(next)
    }

    // -----------------------------------------------------------------------
    // Notifications and reminders
    // -----------------------------------------------------------------------

    pub fn push_notification(
        &self,
        user_id: &UserId,
        loan_id: LoanId,
        kind: LoanEventKind,
        now: DateTime<Utc>,
    ) -> Notification {
        let mut inner = self.write();
        inner.next_notification_id += 1;
        let notification = Notification {
            id: inner.next_notification_id,
            user_id: user_id.clone(),
            loan_id,
            kind,
            title: kind.title().to_string(),
            body: kind.body().to_string(),
            created_at: now,
        };
        inner
            .notifications
            .insert(notification.id, notification.clone());
        notification
    }

    /// Newest first.
    pub fn notifications(&self, user_id: &UserId) -> Vec<Notification> {
        self.read()
            .notifications
            .values()
            .rev()
            .filter(|n| &n.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn delete_notification(&self, user_id: &UserId, id: u64) -> Result<(), ServiceError> {
        let mut inner = self.write();
        let owner = inner
            .notifications
            .get(&id)
            .map(|n| n.user_id.clone())
            .ok_or_else(|| ServiceError::NotFound(format!("notification {id}")))?;
        if &owner != user_id {
            return Err(ServiceError::Forbidden(
                "cannot delete another user's notification".to_string(),
            ));
        }
        inner.notifications.remove(&id);
        Ok(())
    }

    /// Open loans due within `window` of `now` that have not been reminded for their
    /// current due date. Marks them reminded.
    pub fn take_due_for_reminder(&self, now: DateTime<Utc>, window: Duration) -> Vec<Loan> {
        let horizon = now
            .checked_add_signed(window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut inner = self.write();
        let due: Vec<Loan> = inner
            .loans
            .values()
            .filter(|loan| {
                matches!(
                    loan.state,
                    LoanState::Approved | LoanState::RenegotiationRequested
                ) && loan.due_date > now
                    && loan.due_date <= horizon
            })
            .filter(|loan| inner.reminded.get(&loan.id) != Some(&loan.due_date))
            .cloned()
            .collect();
        for loan in &due {
            inner.reminded.insert(loan.id, loan.due_date);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::U256;
    use chrono::{Duration, Utc};
    use peerlend_types::wire::{NewLoanRequest, UserProfile};
    use peerlend_types::{ActionKind, Address, LoanEventKind, LoanState, Role, TxHash, UserId};

    use super::LoanStore;
    use crate::error::ServiceError;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn store_with_friends() -> LoanStore {
        let store = LoanStore::new();
        for (id, name) in [("alice", "Alice"), ("bob", "Bob"), ("carol", "Carol")] {
            store
                .register_user(UserProfile {
                    user_id: user(id),
                    display_name: name.to_string(),
                })
                .expect("register");
        }
        store.add_friend(&user("alice"), &user("bob")).expect("friends");
        store
    }

    fn request(lender: &str, days: i64) -> NewLoanRequest {
        NewLoanRequest {
            lender_id: user(lender),
            amount: U256::from(100u64),
            collateral: "watch".to_string(),
            due_date: Utc::now() + Duration::days(days),
        }
    }

    #[test]
    fn friendship_rules() {
        let store = store_with_friends();
        assert!(store.are_friends(&user("bob"), &user("alice")));
        assert!(matches!(
            store.add_friend(&user("alice"), &user("alice")),
            Err(ServiceError::BadRequest(_))
        ));
        assert!(matches!(
            store.add_friend(&user("bob"), &user("alice")),
            Err(ServiceError::Conflict(_))
        ));
        assert!(matches!(
            store.add_friend(&user("alice"), &user("dave")),
            Err(ServiceError::NotFound(_))
        ));
        let names: Vec<_> = store
            .friends(&user("alice"))
            .into_iter()
            .map(|p| p.display_name)
            .collect();
        assert_eq!(names, vec!["Bob".to_string()]);
    }

    #[test]
    fn loans_only_between_friends_with_future_due_date() {
        let store = store_with_friends();
        let now = Utc::now();
        assert!(matches!(
            store.create_loan(&user("alice"), &request("carol", 5), now),
            Err(ServiceError::Forbidden(_))
        ));
        assert!(matches!(
            store.create_loan(&user("alice"), &request("bob", -1), now),
            Err(ServiceError::BadRequest(_))
        ));

        let first = store
            .create_loan(&user("alice"), &request("bob", 5), now)
            .expect("created");
        let second = store
            .create_loan(&user("alice"), &request("bob", 9), now)
            .expect("created");
        assert_eq!(first.state, LoanState::Requested);
        assert!(second.id > first.id);
        let as_lender = store.loans_for(&user("bob"), Role::Lender);
        assert_eq!(
            as_lender.iter().map(|l| l.id).collect::<Vec<_>>(),
            vec![first.id, second.id]
        );
        assert!(store.loans_for(&user("bob"), Role::Borrower).is_empty());
    }

    #[test]
    fn address_cannot_be_shared_between_users() {
        let store = store_with_friends();
        let address = Address::new([0x11; 20]);
        store
            .bind_wallet(&user("alice"), address, Utc::now())
            .expect("bound");
        store
            .bind_wallet(&user("alice"), Address::new([0x12; 20]), Utc::now())
            .expect("replaced");
        store
            .bind_wallet(&user("bob"), address, Utc::now())
            .expect("freed by replacement");
        assert!(matches!(
            store.bind_wallet(&user("carol"), address, Utc::now()),
            Err(ServiceError::Conflict(_))
        ));
    }

    #[test]
    fn settlement_hash_is_single_use() {
        let store = store_with_friends();
        let loan = store
            .create_loan(&user("alice"), &request("bob", 5), Utc::now())
            .expect("created");
        let mut approved = loan.clone();
        approved.state = LoanState::Approved;
        let hash = TxHash::new([0xab; 32]);

        store
            .commit_loan(&loan, approved.clone(), hash, ActionKind::Approve)
            .expect("committed");
        assert_eq!(
            store.commit_loan(&loan, approved.clone(), hash, ActionKind::Approve),
            Ok(approved.clone())
        );
        let mut repaid = approved.clone();
        repaid.state = LoanState::Repaid;
        assert!(matches!(
            store.commit_loan(&approved, repaid, hash, ActionKind::Repay),
            Err(ServiceError::VerificationFailed(_))
        ));
    }

    #[test]
    fn notifications_are_owned() {
        let store = store_with_friends();
        let n = store.push_notification(
            &user("alice"),
            peerlend_types::LoanId(1),
            LoanEventKind::LoanRepaid,
            Utc::now(),
        );
        assert_eq!(n.title, "Loan Repaid");
        assert!(matches!(
            store.delete_notification(&user("bob"), n.id),
            Err(ServiceError::Forbidden(_))
        ));
        store
            .delete_notification(&user("alice"), n.id)
            .expect("deleted");
        assert!(store.notifications(&user("alice")).is_empty());
        assert!(matches!(
            store.delete_notification(&user("alice"), n.id),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn reminders_fire_once_per_due_date() {
        let store = store_with_friends();
        let now = Utc::now();
        let loan = store
            .create_loan(&user("alice"), &request("bob", 1), now)
            .expect("created");
        assert!(store.take_due_for_reminder(now, Duration::days(2)).is_empty());

        let mut approved = loan.clone();
        approved.state = LoanState::Approved;
        store
            .commit_loan(&loan, approved, TxHash::new([1; 32]), ActionKind::Approve)
            .expect("committed");
        assert_eq!(store.take_due_for_reminder(now, Duration::days(2)).len(), 1);
        assert!(store.take_due_for_reminder(now, Duration::days(2)).is_empty());
    }

    #[test]
    fn reminder_bookkeeping_ends_with_the_loan() {
        let store = store_with_friends();
        let now = Utc::now();
        let loan = store
            .create_loan(&user("alice"), &request("bob", 1), now)
            .expect("created");
        let mut approved = loan.clone();
        approved.state = LoanState::Approved;
        let approved = store
            .commit_loan(&loan, approved, TxHash::new([1; 32]), ActionKind::Approve)
            .expect("approved");

        let mut extended = approved.clone();
        extended.due_date = approved.due_date + Duration::hours(12);
        assert_eq!(store.take_due_for_reminder(now, Duration::days(2)).len(), 1);
        store.write().loans.insert(extended.id, extended.clone());
        assert_eq!(store.take_due_for_reminder(now, Duration::days(2)).len(), 1);
        assert_eq!(store.read().reminded.len(), 1);

        let mut repaid = extended.clone();
        repaid.state = LoanState::Repaid;
        store
            .commit_loan(&extended, repaid, TxHash::new([2; 32]), ActionKind::Repay)
            .expect("repaid");
        assert!(store.read().reminded.is_empty());
    }

    #[test]
    fn unbounded_reminder_window_does_not_overflow() {
        let store = store_with_friends();
        let now = Utc::now();
        let loan = store
            .create_loan(&user("alice"), &request("bob", 30), now)
            .expect("created");
        let mut approved = loan.clone();
        approved.state = LoanState::Approved;
        store
            .commit_loan(&loan, approved, TxHash::new([3; 32]), ActionKind::Approve)
            .expect("approved");
        assert_eq!(store.take_due_for_reminder(now, Duration::MAX).len(), 1);
    }
}
