//! The replicated state: accounts in insertion order, plus the
//! per-recipient queues of chats not yet pushed over NOTIF.

use std::collections::{HashMap, VecDeque};

use palaver_types::{Account, Chat, UserId};

/// The account-and-message store of one replica.
///
/// Accounts keep their insertion order because `list` pages iterate it.
/// The undelivered queues are part of the replicated state: `send`
/// appends to them and `notif` pops from them on every replica, so a
/// backup that takes over knows exactly which chats still await delivery.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChatState {
    accounts: Vec<Account>,
    undelivered: HashMap<UserId, VecDeque<Chat>>,
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an account exists for `user`.
    pub fn contains(&self, user: &UserId) -> bool {
        self.accounts.iter().any(|a| &a.user_id == user)
    }

    pub(crate) fn account(&self, user: &UserId) -> Option<&Account> {
        self.accounts.iter().find(|a| &a.user_id == user)
    }

    pub(crate) fn account_mut(&mut self, user: &UserId) -> Option<&mut Account> {
        self.accounts.iter_mut().find(|a| &a.user_id == user)
    }

    /// Appends a fresh account (caller has checked uniqueness).
    pub(crate) fn insert_account(&mut self, user: UserId) {
        self.undelivered.insert(user.clone(), VecDeque::new());
        self.accounts.push(Account::new(user));
    }

    /// Removes the account and its queue. The log record of past chats
    /// authored by `user` in other accounts is untouched.
    pub(crate) fn remove_account(&mut self, user: &UserId) {
        self.accounts.retain(|a| &a.user_id != user);
        self.undelivered.remove(user);
    }

    /// Accounts in insertion order.
    pub(crate) fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub(crate) fn enqueue_undelivered(&mut self, chat: Chat) {
        self.undelivered
            .entry(chat.recipient.clone())
            .or_default()
            .push_back(chat);
    }

    pub(crate) fn dequeue_undelivered(&mut self, user: &UserId) -> Option<Chat> {
        self.undelivered.get_mut(user)?.pop_front()
    }

    /// The chats still awaiting NOTIF delivery to `user`, oldest first.
    /// A replica that becomes primary re-seeds its subscriber channels
    /// from this view.
    pub fn undelivered(&self, user: &UserId) -> impl Iterator<Item = &Chat> {
        self.undelivered.get(user).into_iter().flatten()
    }

    /// Number of live accounts.
    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }
}
