//! Wire records: replicated operations, client requests, responses, and
//! the peer-channel frames.
//!
//! Every record is a single line of UTF-8 text with `@@` separating
//! top-level fields and `##` separating entries of a list payload. A chat
//! inside a list payload is inner-encoded as `author@@recipient@@text`;
//! response parsing therefore splits with a field limit so the payload
//! keeps its inner separators.
//!
//! The round-trip law `unmarshal(marshal(x)) == x` holds for every value
//! that marshals successfully, and is property-tested in this crate.

use palaver_types::{Chat, FIELD_SEP, LIST_SEP, Progress, ReplicaName, UserId};

use crate::error::{WireError, WireResult};

/// Checks that a payload field can be embedded in a record without
/// colliding with the framing or the separators.
fn field<'a>(name: &'static str, value: &'a str) -> WireResult<&'a str> {
    for sep in [FIELD_SEP, LIST_SEP, "\n"] {
        if value.contains(sep) {
            return Err(WireError::SeparatorInPayload {
                field: name,
                separator: sep,
            });
        }
    }
    Ok(value)
}

/// Rejects inbound payload fields that smuggle the list separator (the
/// top-level separator cannot appear: the split already consumed it).
fn clean<'a>(name: &'static str, value: &'a str) -> WireResult<&'a str> {
    if value.contains(LIST_SEP) {
        return Err(WireError::malformed(format!(
            "{name} field contains reserved separator {LIST_SEP:?}"
        )));
    }
    Ok(value)
}

fn parse_page(raw: &str) -> WireResult<u64> {
    raw.parse::<u64>()
        .map_err(|_| WireError::malformed(format!("page field is not a number: {raw:?}")))
}

fn parse_success(raw: &str) -> WireResult<bool> {
    match raw {
        "True" => Ok(true),
        "False" => Ok(false),
        other => Err(WireError::malformed(format!(
            "success field must be True or False, got {other:?}"
        ))),
    }
}

fn success_str(success: bool) -> &'static str {
    if success { "True" } else { "False" }
}

// ============================================================================
// Replicated operations
// ============================================================================

/// A replicated operation: the unit that is durably logged on the primary
/// and broadcast to every living backup.
///
/// Queries (`list`, `logs`) and control commands (`fallover`) are
/// deliberately not representable here; they live in [`Request`] and can
/// never reach the durable log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Create a fresh account.
    Create { user: UserId },
    /// Advisory login; carries no server-side session state.
    Login { user: UserId },
    /// Delete an account and its undelivered queue.
    Delete { user: UserId },
    /// Append a chat to the recipient's log and undelivered queue.
    Send {
        author: UserId,
        recipient: UserId,
        text: String,
    },
    /// Record that one chat was delivered to the user over NOTIF.
    Notif { user: UserId },
}

impl Op {
    /// The id of the user the operation acts for (the author, for a
    /// send), used to address the response envelope.
    pub fn user(&self) -> &UserId {
        match self {
            Op::Create { user } | Op::Login { user } | Op::Delete { user } | Op::Notif { user } => {
                user
            }
            Op::Send { author, .. } => author,
        }
    }

    /// The wire tag of this operation.
    pub fn tag(&self) -> &'static str {
        match self {
            Op::Create { .. } => "create",
            Op::Login { .. } => "login",
            Op::Delete { .. } => "delete",
            Op::Send { .. } => "send",
            Op::Notif { .. } => "notif",
        }
    }

    pub fn marshal(&self) -> WireResult<String> {
        match self {
            Op::Create { user } | Op::Login { user } | Op::Delete { user } | Op::Notif { user } => {
                Ok(format!("{}{FIELD_SEP}{}", field("user_id", user.as_str())?, self.tag()))
            }
            Op::Send {
                author,
                recipient,
                text,
            } => Ok(format!(
                "{}{FIELD_SEP}send{FIELD_SEP}{}{FIELD_SEP}{}",
                field("user_id", author.as_str())?,
                field("recipient_id", recipient.as_str())?,
                field("text", text)?,
            )),
        }
    }

    /// Parses a replicated operation. Fails on query or control tags:
    /// those records must never appear on a peer channel or in the log.
    pub fn unmarshal(line: &str) -> WireResult<Op> {
        match Request::unmarshal(line)? {
            Request::Op(op) => Ok(op),
            other => Err(WireError::malformed(format!(
                "expected a replicable op, got {:?} record",
                other.tag()
            ))),
        }
    }
}

// ============================================================================
// Client requests
// ============================================================================

/// A client-issued request: a replicated operation, a read-only query, or
/// the `fallover` control command used by the failover test tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// A state-mutating operation (logged and broadcast when applied on
    /// the primary).
    Op(Op),
    /// Page through accounts whose id contains `wildcard`.
    List {
        user: UserId,
        wildcard: String,
        page: u64,
    },
    /// Page through `user`'s message log, filtered by author substring.
    Logs {
        user: UserId,
        wildcard: String,
        page: u64,
    },
    /// Gracefully crash the receiving replica. Never logged, never
    /// broadcast.
    Fallover { user: UserId },
}

impl Request {
    /// The wire tag of this request.
    pub fn tag(&self) -> &'static str {
        match self {
            Request::Op(op) => op.tag(),
            Request::List { .. } => "list",
            Request::Logs { .. } => "logs",
            Request::Fallover { .. } => "fallover",
        }
    }

    /// The id of the user issuing the request, used to address the
    /// response envelope.
    pub fn user(&self) -> &UserId {
        match self {
            Request::Op(op) => op.user(),
            Request::List { user, .. }
            | Request::Logs { user, .. }
            | Request::Fallover { user } => user,
        }
    }

    pub fn marshal(&self) -> WireResult<String> {
        match self {
            Request::Op(op) => op.marshal(),
            Request::List {
                user,
                wildcard,
                page,
            }
            | Request::Logs {
                user,
                wildcard,
                page,
            } => Ok(format!(
                "{}{FIELD_SEP}{}{FIELD_SEP}{}{FIELD_SEP}{page}",
                field("user_id", user.as_str())?,
                self.tag(),
                field("wildcard", wildcard)?,
            )),
            Request::Fallover { user } => {
                Ok(format!("{}{FIELD_SEP}fallover", field("user_id", user.as_str())?))
            }
        }
    }

    pub fn unmarshal(line: &str) -> WireResult<Request> {
        let parts: Vec<&str> = line.split(FIELD_SEP).collect();
        if parts.len() < 2 {
            return Err(WireError::malformed(format!("missing type field: {line:?}")));
        }
        let user = UserId::unchecked(clean("user_id", parts[0])?);
        let tag = parts[1];
        let expect = |n: usize| -> WireResult<()> {
            if parts.len() == n {
                Ok(())
            } else {
                Err(WireError::malformed(format!(
                    "{tag} record needs {n} fields, got {}",
                    parts.len()
                )))
            }
        };
        match tag {
            "create" => {
                expect(2)?;
                Ok(Request::Op(Op::Create { user }))
            }
            "login" => {
                expect(2)?;
                Ok(Request::Op(Op::Login { user }))
            }
            "delete" => {
                expect(2)?;
                Ok(Request::Op(Op::Delete { user }))
            }
            "notif" => {
                expect(2)?;
                Ok(Request::Op(Op::Notif { user }))
            }
            "send" => {
                expect(4)?;
                Ok(Request::Op(Op::Send {
                    author: user,
                    recipient: UserId::unchecked(clean("recipient_id", parts[2])?),
                    text: clean("text", parts[3])?.to_string(),
                }))
            }
            "list" => {
                expect(4)?;
                Ok(Request::List {
                    user,
                    wildcard: clean("wildcard", parts[2])?.to_string(),
                    page: parse_page(parts[3])?,
                })
            }
            "logs" => {
                expect(4)?;
                Ok(Request::Logs {
                    user,
                    wildcard: clean("wildcard", parts[2])?.to_string(),
                    page: parse_page(parts[3])?,
                })
            }
            "fallover" => {
                expect(2)?;
                Ok(Request::Fallover { user })
            }
            other => Err(WireError::malformed(format!("unknown request tag {other:?}"))),
        }
    }
}

impl From<Op> for Request {
    fn from(op: Op) -> Self {
        Request::Op(op)
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Fixed payload of the ping record, answered verbatim on both the HEALTH
/// and NOTIF liveness paths.
pub const PING_TAG: &str = "ping";

/// A server-issued response envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Success/refusal verdict with no payload.
    Basic {
        user: UserId,
        success: bool,
        error: String,
    },
    /// A page of matching account ids.
    List {
        user: UserId,
        success: bool,
        error: String,
        accounts: Vec<UserId>,
    },
    /// A page of the user's message log, newest first.
    Logs {
        user: UserId,
        success: bool,
        error: String,
        chats: Vec<Chat>,
    },
    /// One delivered chat, pushed over the NOTIF channel.
    Notif {
        user: UserId,
        success: bool,
        error: String,
        chat: Chat,
    },
    /// Liveness probe; answered with another ping.
    Ping,
}

impl Response {
    /// A successful basic envelope.
    pub fn ok(user: UserId) -> Self {
        Response::Basic {
            user,
            success: true,
            error: String::new(),
        }
    }

    /// A semantic refusal carried in a basic envelope.
    pub fn refusal(user: UserId, error: impl Into<String>) -> Self {
        Response::Basic {
            user,
            success: false,
            error: error.into(),
        }
    }

    /// Whether the envelope reports success. Pings count as success.
    pub fn success(&self) -> bool {
        match self {
            Response::Basic { success, .. }
            | Response::List { success, .. }
            | Response::Logs { success, .. }
            | Response::Notif { success, .. } => *success,
            Response::Ping => true,
        }
    }

    fn marshal_chat(chat: &Chat) -> WireResult<String> {
        Ok(format!(
            "{}{FIELD_SEP}{}{FIELD_SEP}{}",
            field("author_id", chat.author.as_str())?,
            field("recipient_id", chat.recipient.as_str())?,
            field("text", &chat.text)?,
        ))
    }

    fn unmarshal_chat(raw: &str) -> WireResult<Chat> {
        let parts: Vec<&str> = raw.split(FIELD_SEP).collect();
        if parts.len() != 3 {
            return Err(WireError::malformed(format!(
                "chat payload needs 3 fields, got {}",
                parts.len()
            )));
        }
        Ok(Chat::new(
            UserId::unchecked(parts[0]),
            UserId::unchecked(parts[1]),
            parts[2],
        ))
    }

    pub fn marshal(&self) -> WireResult<String> {
        match self {
            Response::Basic {
                user,
                success,
                error,
            } => Ok(format!(
                "{}{FIELD_SEP}basic{FIELD_SEP}{}{FIELD_SEP}{}",
                field("user_id", user.as_str())?,
                success_str(*success),
                field("error_message", error)?,
            )),
            Response::List {
                user,
                success,
                error,
                accounts,
            } => {
                let ids = accounts
                    .iter()
                    .map(|a| field("account_id", a.as_str()).map(str::to_string))
                    .collect::<WireResult<Vec<_>>>()?;
                Ok(format!(
                    "{}{FIELD_SEP}list{FIELD_SEP}{}{FIELD_SEP}{}{FIELD_SEP}{}",
                    field("user_id", user.as_str())?,
                    success_str(*success),
                    field("error_message", error)?,
                    ids.join(LIST_SEP),
                ))
            }
            Response::Logs {
                user,
                success,
                error,
                chats,
            } => {
                let msgs = chats
                    .iter()
                    .map(Self::marshal_chat)
                    .collect::<WireResult<Vec<_>>>()?;
                Ok(format!(
                    "{}{FIELD_SEP}logs{FIELD_SEP}{}{FIELD_SEP}{}{FIELD_SEP}{}",
                    field("user_id", user.as_str())?,
                    success_str(*success),
                    field("error_message", error)?,
                    msgs.join(LIST_SEP),
                ))
            }
            Response::Notif {
                user,
                success,
                error,
                chat,
            } => Ok(format!(
                "{}{FIELD_SEP}notif{FIELD_SEP}{}{FIELD_SEP}{}{FIELD_SEP}{}",
                field("user_id", user.as_str())?,
                success_str(*success),
                field("error_message", error)?,
                Self::marshal_chat(chat)?,
            )),
            Response::Ping => Ok(format!("{FIELD_SEP}{PING_TAG}")),
        }
    }

    pub fn unmarshal(line: &str) -> WireResult<Response> {
        // Limit the split so list/logs/notif payloads keep their inner
        // separators intact.
        let parts: Vec<&str> = line.splitn(5, FIELD_SEP).collect();
        if parts.len() < 2 {
            return Err(WireError::malformed(format!("missing type field: {line:?}")));
        }
        let tag = parts[1];
        match tag {
            t if t == PING_TAG => {
                if parts.len() != 2 || !parts[0].is_empty() {
                    return Err(WireError::malformed(format!("bad ping record: {line:?}")));
                }
                Ok(Response::Ping)
            }
            "basic" => {
                if parts.len() != 4 {
                    return Err(WireError::malformed(format!(
                        "basic response needs 4 fields, got {}",
                        parts.len()
                    )));
                }
                Ok(Response::Basic {
                    user: UserId::unchecked(parts[0]),
                    success: parse_success(parts[2])?,
                    error: parts[3].to_string(),
                })
            }
            "list" | "logs" | "notif" => {
                if parts.len() != 5 {
                    return Err(WireError::malformed(format!(
                        "{tag} response needs 5 fields, got {}",
                        parts.len()
                    )));
                }
                let user = UserId::unchecked(parts[0]);
                let success = parse_success(parts[2])?;
                let error = parts[3].to_string();
                let payload = parts[4];
                match tag {
                    "list" => {
                        let accounts = if payload.is_empty() {
                            Vec::new()
                        } else {
                            payload.split(LIST_SEP).map(UserId::unchecked).collect()
                        };
                        Ok(Response::List {
                            user,
                            success,
                            error,
                            accounts,
                        })
                    }
                    "logs" => {
                        let chats = if payload.is_empty() {
                            Vec::new()
                        } else {
                            payload
                                .split(LIST_SEP)
                                .map(Self::unmarshal_chat)
                                .collect::<WireResult<Vec<_>>>()?
                        };
                        Ok(Response::Logs {
                            user,
                            success,
                            error,
                            chats,
                        })
                    }
                    _ => Ok(Response::Notif {
                        user,
                        success,
                        error,
                        chat: Self::unmarshal_chat(payload)?,
                    }),
                }
            }
            other => Err(WireError::malformed(format!("unknown response tag {other:?}"))),
        }
    }
}

// ============================================================================
// Peer channel records
// ============================================================================

/// The first frame exchanged in each direction of a fresh INTERNAL
/// channel: the sender's name and current log progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub name: ReplicaName,
    pub progress: Progress,
}

impl Handshake {
    pub fn marshal(&self) -> WireResult<String> {
        Ok(format!(
            "{}{FIELD_SEP}{}",
            field("name", self.name.as_str())?,
            self.progress.as_u64(),
        ))
    }

    pub fn unmarshal(line: &str) -> WireResult<Handshake> {
        let parts: Vec<&str> = line.split(FIELD_SEP).collect();
        if parts.len() != 2 {
            return Err(WireError::malformed(format!(
                "handshake needs 2 fields, got {}",
                parts.len()
            )));
        }
        let progress = parts[1]
            .parse::<u64>()
            .map_err(|_| WireError::malformed(format!("bad handshake progress: {:?}", parts[1])))?;
        Ok(Handshake {
            name: ReplicaName::from(parts[0]),
            progress: Progress::new(progress),
        })
    }
}

/// A frame on an established INTERNAL channel, after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerFrame {
    /// A replicated operation from the primary, or a catch-up slice entry.
    Op(Op),
    /// Ask the peer to send back its logged ops at positions `[lo, hi)`.
    SliceRequest { lo: u64, hi: u64 },
}

impl PeerFrame {
    pub fn marshal(&self) -> WireResult<String> {
        match self {
            PeerFrame::Op(op) => op.marshal(),
            PeerFrame::SliceRequest { lo, hi } => {
                Ok(format!("{FIELD_SEP}slice{FIELD_SEP}{lo}{FIELD_SEP}{hi}"))
            }
        }
    }

    pub fn unmarshal(line: &str) -> WireResult<PeerFrame> {
        let parts: Vec<&str> = line.split(FIELD_SEP).collect();
        if parts.len() >= 2 && parts[1] == "slice" {
            if parts.len() != 4 || !parts[0].is_empty() {
                return Err(WireError::malformed(format!("bad slice request: {line:?}")));
            }
            let bound = |raw: &str| -> WireResult<u64> {
                raw.parse::<u64>()
                    .map_err(|_| WireError::malformed(format!("bad slice bound: {raw:?}")))
            };
            return Ok(PeerFrame::SliceRequest {
                lo: bound(parts[2])?,
                hi: bound(parts[3])?,
            });
        }
        Ok(PeerFrame::Op(Op::unmarshal(line)?))
    }
}
