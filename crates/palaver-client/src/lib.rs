//! # palaver-client: the Palaver client connector
//!
//! Two independent TCP channels to the cluster: the interactive channel
//! (CLIENT) for request/response, and the subscription channel (NOTIF)
//! for real-time chat delivery.
//!
//! The connector knows the same static replica table as the servers. It
//! walks the table in lexicographic order, reads each gateway's greeting
//! probe, and settles on the replica that reports itself primary. Any
//! in-flight failure throws it back into the search, after which the
//! failed request is retried verbatim — requests carry no deduplication
//! token, so a primary that dies between applying and answering makes
//! the retry apply twice (the documented at-least-once behaviour).

mod connector;
mod error;
mod subscription;

pub use connector::Connector;
pub use error::{ClientError, ClientResult};
pub use subscription::Subscription;
