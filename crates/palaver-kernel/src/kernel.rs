//! Operation application and read-only queries.

use palaver_types::{Chat, UserId};
use palaver_wire::Op;
use thiserror::Error;

use crate::state::ChatState;

/// Entries per page for both `list` and `logs`.
pub const PAGE_SIZE: usize = 4;

/// Result type for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Semantic refusals. Never fatal: the dispatcher folds them into a
/// `success=false` response envelope and carries on.
///
/// The display strings are part of the client contract (the shell and
/// the tests match on them), so they stay stable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("User already exists")]
    DuplicateUser(UserId),

    #[error("User does not exist")]
    UnknownUser(UserId),

    #[error("Can't catchup queue")]
    EmptyQueue(UserId),
}

/// Side effects of an applied operation, for the runtime to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// A `send` was applied: push the chat to the recipient's live
    /// subscriber, if any. Only the primary acts on this.
    Deliver { chat: Chat },

    /// The account was deleted: drop its NOTIF registration, if any.
    Disconnect { user: UserId },
}

/// Applies one replicated operation.
///
/// Deterministic: both the state transition and the refusal are a pure
/// function of `(state, op)`, on primaries and backups alike. Refusals
/// leave the state untouched.
pub fn apply(state: &mut ChatState, op: &Op) -> KernelResult<Vec<Effect>> {
    match op {
        Op::Create { user } => {
            if state.contains(user) {
                return Err(KernelError::DuplicateUser(user.clone()));
            }
            state.insert_account(user.clone());
            Ok(Vec::new())
        }

        // Advisory only: no server-side session state. Exclusive login is
        // enforced at the NOTIF layer, not here.
        Op::Login { user } => {
            if !state.contains(user) {
                return Err(KernelError::UnknownUser(user.clone()));
            }
            Ok(Vec::new())
        }

        Op::Delete { user } => {
            if !state.contains(user) {
                return Err(KernelError::UnknownUser(user.clone()));
            }
            state.remove_account(user);
            Ok(vec![Effect::Disconnect { user: user.clone() }])
        }

        Op::Send {
            author,
            recipient,
            text,
        } => {
            if !state.contains(recipient) {
                return Err(KernelError::UnknownUser(recipient.clone()));
            }
            let chat = Chat::new(author.clone(), recipient.clone(), text.clone());
            state
                .account_mut(recipient)
                .expect("recipient existence checked above")
                .record(chat.clone());
            state.enqueue_undelivered(chat.clone());
            Ok(vec![Effect::Deliver { chat }])
        }

        Op::Notif { user } => match state.dequeue_undelivered(user) {
            Some(_) => Ok(Vec::new()),
            None => Err(KernelError::EmptyQueue(user.clone())),
        },
    }
}

/// One page of account ids whose id contains `wildcard` (case-sensitive
/// substring; empty matches all), in account insertion order. A page past
/// the end is empty, not an error.
pub fn list_accounts(state: &ChatState, wildcard: &str, page: u64) -> Vec<UserId> {
    state
        .accounts()
        .iter()
        .filter(|a| a.user_id.as_str().contains(wildcard))
        .skip(page as usize * PAGE_SIZE)
        .take(PAGE_SIZE)
        .map(|a| a.user_id.clone())
        .collect()
}

/// One page of `user`'s message log (newest first), keeping chats whose
/// author id contains `wildcard`.
pub fn user_logs(
    state: &ChatState,
    user: &UserId,
    wildcard: &str,
    page: u64,
) -> KernelResult<Vec<Chat>> {
    let account = state
        .account(user)
        .ok_or_else(|| KernelError::UnknownUser(user.clone()))?;
    Ok(account
        .log()
        .iter()
        .filter(|c| c.author.as_str().contains(wildcard))
        .skip(page as usize * PAGE_SIZE)
        .take(PAGE_SIZE)
        .cloned()
        .collect())
}
