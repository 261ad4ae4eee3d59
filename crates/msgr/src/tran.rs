//! Transactors: the per-transaction state the messenger tracks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use wire::{Ferr, Msg};

/// Where a transactor is in its protocol exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranState {
    /// Queued or being written.
    Pending,
    /// The outbound message has been fully written.
    Sent,
    /// A complete inbound message has arrived.
    Recv,
    /// Finished; nothing further will be delivered.
    Done,
}

/// What the callback finds attached to the transactor.
#[derive(Debug, Clone)]
pub enum TranPayload {
    None,
    /// The message just received.
    Msg(Msg),
    /// The failure that ended this transactor.
    Err(Ferr),
}

/// Identity of the connection a callback is running on.
#[derive(Debug, Clone, Copy)]
pub struct ConnCtx {
    pub ip: u32,
    pub port: u16,
}

/// What the callback wants done with the transactor, exactly one of:
/// queue another outbound message on this connection, keep listening for
/// another inbound message, or let it go (the callback may also have moved
/// the transactor elsewhere, e.g. onto a receive pool).
pub enum Step {
    SendNext(Box<Transactor>, Msg),
    RecvNext(Box<Transactor>),
    Done,
}

/// Transactor callback. Runs on the messenger's event-loop thread for
/// every completed send, every received message, and every failure; it
/// must not block. Ownership of the transactor transfers in, and comes
/// back out through [`Step`].
pub type TranCb = Arc<dyn Fn(&ConnCtx, Box<Transactor>) -> Step + Send + Sync>;

/// State for one logical request/response sequence over a connection.
///
/// Owned by the messenger while in flight; the application holds it only
/// inside a callback, or after the callback has handed it off.
pub struct Transactor {
    /// Local transactor id, unique within the messenger. Never zero.
    pub id: u32,
    /// The peer's transactor id, or zero until the peer tells us.
    pub rem_id: u32,
    pub ip: u32,
    pub port: u16,
    pub state: TranState,
    pub payload: TranPayload,
    cb: TranCb,
    live: Arc<AtomicUsize>,
}

impl Transactor {
    pub(crate) fn new(id: u32, cb: TranCb, live: Arc<AtomicUsize>) -> Box<Transactor> {
        live.fetch_add(1, Ordering::Relaxed);
        Box::new(Transactor {
            id,
            rem_id: 0,
            ip: 0,
            port: 0,
            state: TranState::Pending,
            payload: TranPayload::None,
            cb,
            live,
        })
    }

    pub(crate) fn cb(&self) -> TranCb {
        self.cb.clone()
    }

    /// Swap in a new callback; used when a transactor changes hands, e.g.
    /// a receive-pool handler replying through a bsend context.
    pub fn set_cb(&mut self, cb: TranCb) {
        self.cb = cb;
    }

    /// Take the received message, if that is what the payload holds.
    pub fn take_msg(&mut self) -> Option<Msg> {
        match std::mem::replace(&mut self.payload, TranPayload::None) {
            TranPayload::Msg(m) => Some(m),
            other => {
                self.payload = other;
                None
            }
        }
    }
}

impl Drop for Transactor {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Transactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transactor")
            .field("id", &self.id)
            .field("rem_id", &self.rem_id)
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("state", &self.state)
            .finish()
    }
}
