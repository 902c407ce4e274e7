//! # palaver-types: Core types for Palaver
//!
//! This crate contains shared types used across the Palaver system:
//! - Identity types ([`ReplicaName`], [`UserId`])
//! - Chat entities ([`Chat`], [`Account`])
//! - Replication progress ([`Progress`])
//! - Edge validation ([`validate_user_id`], [`validate_text`])
//!
//! The wire separators (`@@` at the top level, `##` for list payloads)
//! leak into validation on purpose: a user id or chat text containing a
//! separator could not survive a marshal/unmarshal round trip, so the
//! client edge rejects them before they reach the cluster.

use std::fmt::{self, Display};

use thiserror::Error;

/// Top-level field separator of the wire format.
pub const FIELD_SEP: &str = "@@";

/// Separator for list payloads inside a single wire field.
pub const LIST_SEP: &str = "##";

/// Reserved by the interactive surface for box drawing; never valid in
/// user-supplied ids or texts.
pub const DISPLAY_SEP: &str = "||";

/// Maximum length of a user id, in bytes.
pub const MAX_USER_ID_BYTES: usize = 8;

/// Maximum length of a chat text, in bytes.
pub const MAX_TEXT_BYTES: usize = 280;

// ============================================================================
// Validation
// ============================================================================

/// Rejection reasons for user-supplied strings.
///
/// Produced only at the client edge; the core trusts what the codec
/// delivers (see the wire crate for the separator checks it does enforce).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidInput {
    #[error("user id must not be empty")]
    EmptyUserId,

    #[error("user id exceeds {MAX_USER_ID_BYTES} bytes")]
    UserIdTooLong,

    #[error("user id must not contain commas")]
    CommaInUserId,

    #[error("chat text exceeds {MAX_TEXT_BYTES} bytes")]
    TextTooLong,

    #[error("reserved separator {0:?} is not allowed here")]
    ReservedSeparator(&'static str),
}

fn check_separators(s: &str) -> Result<(), InvalidInput> {
    for sep in [FIELD_SEP, LIST_SEP, DISPLAY_SEP] {
        if s.contains(sep) {
            return Err(InvalidInput::ReservedSeparator(sep));
        }
    }
    Ok(())
}

/// Validates a prospective user id against the client-edge constraints:
/// non-empty, at most [`MAX_USER_ID_BYTES`] bytes, no commas, no wire
/// separators.
pub fn validate_user_id(s: &str) -> Result<(), InvalidInput> {
    if s.is_empty() {
        return Err(InvalidInput::EmptyUserId);
    }
    if s.len() > MAX_USER_ID_BYTES {
        return Err(InvalidInput::UserIdTooLong);
    }
    if s.contains(',') {
        return Err(InvalidInput::CommaInUserId);
    }
    check_separators(s)
}

/// Validates a prospective chat text: at most [`MAX_TEXT_BYTES`] bytes,
/// no wire separators.
pub fn validate_text(s: &str) -> Result<(), InvalidInput> {
    if s.len() > MAX_TEXT_BYTES {
        return Err(InvalidInput::TextTooLong);
    }
    check_separators(s)
}

// ============================================================================
// Identity types
// ============================================================================

/// The stable name of a replica.
///
/// Lexicographic order over names is load-bearing: it decides which side
/// of a replica pair dials and which listens, and it selects the primary
/// among the living set (smallest living name leads).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaName(String);

impl ReplicaName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ReplicaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ReplicaName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A chat account identifier.
///
/// Two constructors: [`UserId::parse`] applies the client-edge
/// constraints, [`UserId::unchecked`] wraps a codec-delivered string
/// verbatim. The core operates on unchecked ids (the wire crate already
/// guarantees they are separator-free).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(String);

impl UserId {
    /// Parses a user id, enforcing the client-edge constraints.
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidInput> {
        let s = s.into();
        validate_user_id(&s)?;
        Ok(Self(s))
    }

    /// Wraps an id without validation.
    pub fn unchecked(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Chat entities
// ============================================================================

/// A single chat message. Append-only: never mutated or deleted after
/// creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chat {
    pub author: UserId,
    pub recipient: UserId,
    pub text: String,
}

impl Chat {
    pub fn new(author: UserId, recipient: UserId, text: impl Into<String>) -> Self {
        Self {
            author,
            recipient,
            text: text.into(),
        }
    }
}

impl Display for Chat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.author, self.text)
    }
}

/// An account: a user id plus its message log, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub user_id: UserId,
    log: Vec<Chat>,
}

impl Account {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            log: Vec::new(),
        }
    }

    /// Records a received chat at the head of the log (newest first).
    pub fn record(&mut self, chat: Chat) {
        self.log.insert(0, chat);
    }

    /// The message log, newest first.
    pub fn log(&self) -> &[Chat] {
        &self.log
    }
}

// ============================================================================
// Replication progress
// ============================================================================

/// Count of durably-logged operations at a replica.
///
/// Monotonic by construction: the only mutator is [`Progress::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Progress(u64);

impl Progress {
    pub const ZERO: Progress = Progress(0);

    pub fn new(count: u64) -> Self {
        Self(count)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Advances by one durably-logged operation.
    pub fn advance(&mut self) {
        self.0 += 1;
    }
}

impl Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("ream" => true; "short id")]
    #[test_case("12345678" => true; "exactly eight bytes")]
    #[test_case("" => false; "empty")]
    #[test_case("123456789" => false; "nine bytes")]
    #[test_case("a,b" => false; "comma")]
    #[test_case("a@@b" => false; "field separator")]
    #[test_case("a##b" => false; "list separator")]
    #[test_case("a||b" => false; "display separator")]
    fn user_id_constraints(s: &str) -> bool {
        validate_user_id(s).is_ok()
    }

    #[test]
    fn text_length_limit() {
        let ok = "x".repeat(MAX_TEXT_BYTES);
        let too_long = "x".repeat(MAX_TEXT_BYTES + 1);
        assert!(validate_text(&ok).is_ok());
        assert_eq!(validate_text(&too_long), Err(InvalidInput::TextTooLong));
    }

    #[test]
    fn text_rejects_separators() {
        assert_eq!(
            validate_text("hi@@there"),
            Err(InvalidInput::ReservedSeparator(FIELD_SEP))
        );
        assert_eq!(
            validate_text("hi##there"),
            Err(InvalidInput::ReservedSeparator(LIST_SEP))
        );
    }

    #[test]
    fn replica_names_order_lexicographically() {
        let a = ReplicaName::from("A");
        let b = ReplicaName::from("B");
        let c = ReplicaName::from("C");
        assert!(a < b && b < c);
    }

    #[test]
    fn account_log_is_newest_first() {
        let mut acct = Account::new(UserId::unchecked("mark"));
        let first = Chat::new(
            UserId::unchecked("ream"),
            UserId::unchecked("mark"),
            "first",
        );
        let second = Chat::new(
            UserId::unchecked("ream"),
            UserId::unchecked("mark"),
            "second",
        );
        acct.record(first.clone());
        acct.record(second.clone());
        assert_eq!(acct.log(), &[second, first]);
    }

    #[test]
    fn progress_advances_monotonically() {
        let mut p = Progress::ZERO;
        p.advance();
        p.advance();
        assert_eq!(p, Progress::new(2));
        assert!(Progress::new(3) > p);
    }
}
