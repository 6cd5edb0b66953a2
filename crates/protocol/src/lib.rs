//! everarch gateway protocol - JSON envelopes exchanged over the WebSocket
//!
//! This crate defines:
//! - `Request`/`Command`: inbound messages, keyed by `cmd`
//! - `Response`/`Status`: outbound messages, keyed by `status`
//! - `ModifiedClaimSet`: one change reported by the archive's watch stream
//! - `FilterSpec`: the optional filter descriptor of a `watch` command
//!
//! Every message carries a client-chosen channel `ch` which the gateway
//! treats as an opaque JSON value and echoes verbatim.

mod claim_set;
mod command;
mod response;

pub use claim_set::*;
pub use command::*;
pub use response::*;
