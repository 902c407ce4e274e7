//! # palaver-wire: Text wire protocol for Palaver
//!
//! Line-framed text records shared by every channel in the system:
//!
//! - CLIENT carries [`Request`] and [`Response`] records,
//! - INTERNAL carries a [`Handshake`] followed by [`PeerFrame`] records,
//! - HEALTH and NOTIF liveness use the ping response,
//! - the durable log stores marshalled [`Op`] records, one per line.
//!
//! The codec checks *shape* only: field counts, known tags, numeric
//! fields, and the absence of reserved separators in payload positions.
//! Semantic validity (does the user exist, is the queue non-empty) is the
//! kernel's business.

mod error;
mod frame;
mod message;

pub use error::{WireError, WireResult};
pub use frame::{FrameReader, MAX_FRAME_BYTES, write_frame};
pub use message::{Handshake, Op, PING_TAG, PeerFrame, Request, Response};
