//! The redfish messenger and the layers built directly on it.
//!
//! Each [`Messenger`] owns a single event-loop thread that multiplexes
//! many logical transactions over persistent TCP connections, all
//! non-blocking. Application code is structured around *transactors*: one
//! [`Transactor`] per ongoing request/response exchange, with a callback
//! that fires on the event-loop thread every time a complete message is
//! sent or received. Callbacks must not block and must not call back into
//! `shutdown`.
//!
//! On top of that, [`Bsend`] gives synchronous worker threads fan-out RPC
//! with join/cancel semantics, and [`RecvPool`] feeds inbound transactors
//! to a fixed set of handler threads.

pub mod bsend;
mod conn;
pub mod error;
pub mod events;
pub mod messenger;
pub mod recv_pool;
pub mod tran;

pub use bsend::{Bsend, BsendFlags, TranResult};
pub use error::MsgrError;
pub use messenger::{Messenger, MsgrConf};
pub use recv_pool::{RecvHandler, RecvPool};
pub use tran::{ConnCtx, Step, TranCb, TranPayload, TranState, Transactor};
