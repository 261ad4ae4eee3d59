//! Wire types shared by every redfish daemon and the client library.
//!
//! This crate owns the stable parts of the protocol: the 16-byte message
//! frame, the message type registry, the payload records, the packed
//! cluster map, and the numeric error codes that ride inside generic
//! responses. Everything is big-endian and hand-packed; the framing is the
//! part that never changes, payloads are versioned by message type.

pub mod cmap;
pub mod error;
pub mod msg;
pub mod types;
pub mod xdr;

pub use cmap::{ClusterMap, DaemonInfo};
pub use error::{Ferr, WireError};
pub use msg::{Msg, MsgHdr, MSG_BODY_MAX, MSG_HDR_LEN};
pub use types::MsgType;
pub use xdr::Wire;
