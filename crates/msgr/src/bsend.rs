//! Blocking fan-out RPC on top of the messenger.
//!
//! A [`Bsend`] context lets an otherwise-synchronous worker thread add up
//! to `max_tr` outbound messages, then [`join`](Bsend::join) until every
//! one has completed (sent, or sent-and-answered when
//! [`EXPECT_RESPONSE`](BsendFlags::EXPECT_RESPONSE) is set) or the context
//! is cancelled. The per-transactor callback runs on the messenger thread
//! and only takes the context mutex long enough to record the result.
//!
//! A context belongs to one worker thread at a time; `cancel` is the only
//! entry point other threads may call.

use crate::events::{self, MsgrEvent, FL_BSEND};
use crate::messenger::Messenger;
use crate::tran::{Step, TranCb, TranPayload, TranState, Transactor};
use bitflags::bitflags;
use fastlog::{FastLogMgr, LogBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;
use wire::{Ferr, Msg};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BsendFlags: u8 {
        /// After the send completes, keep the transactor alive and wait
        /// for a reply; the batch slot completes on the reply.
        const EXPECT_RESPONSE = 0b0000_0001;
    }
}

/// Outcome of one slot in a batch.
#[derive(Debug, Clone)]
pub enum TranResult {
    /// The message was written; no response was requested.
    Sent,
    /// The response that came back.
    Recv(Msg),
    /// Network failure, cancellation, or shutdown.
    Failed(Ferr),
}

impl TranResult {
    /// The response message, or the failure; `Sent` maps to `Ok(None)`.
    pub fn msg(&self) -> Result<Option<&Msg>, Ferr> {
        match self {
            TranResult::Sent => Ok(None),
            TranResult::Recv(m) => Ok(Some(m)),
            TranResult::Failed(e) => Err(*e),
        }
    }
}

struct BatchState {
    /// Bumped by `reset`; slot writers from older batches are ignored.
    gen: u64,
    cancel: bool,
    num_finished: usize,
    slots: Vec<Option<TranResult>>,
}

struct BsendInner {
    state: Mutex<BatchState>,
    cond: Condvar,
}

impl BsendInner {
    /// Mark the whole batch cancelled: every slot reads `ECANCELED`,
    /// including ones that had already completed.
    fn cancel_locked(state: &mut BatchState) {
        state.cancel = true;
        let n = state.slots.len();
        for slot in &mut state.slots {
            *slot = Some(TranResult::Failed(Ferr::Canceled));
        }
        state.num_finished = n;
    }

    fn complete(&self, gen: u64, idx: usize, result: TranResult) {
        let mut state = self.state.lock().unwrap();
        if state.gen != gen || state.cancel {
            return;
        }
        if let Some(slot) = state.slots.get_mut(idx) {
            if slot.is_none() {
                *slot = Some(result);
                state.num_finished += 1;
            }
        }
        if state.num_finished == state.slots.len() {
            self.cond.notify_all();
        }
    }
}

pub struct Bsend {
    inner: Arc<BsendInner>,
    fb: Arc<LogBuf>,
    max_tr: usize,
    timeout: Duration,
}

impl Bsend {
    /// `timeout` bounds [`join`](Bsend::join); when it expires the batch
    /// is cancelled wholesale.
    pub fn new(mgr: &FastLogMgr, max_tr: usize, timeout: Duration) -> Bsend {
        let fb = mgr.create_buf("bsend");
        Bsend {
            inner: Arc::new(BsendInner {
                state: Mutex::new(BatchState {
                    gen: 0,
                    cancel: false,
                    num_finished: 0,
                    slots: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
            fb,
            max_tr,
            timeout,
        }
    }

    fn make_cb(&self, gen: u64, idx: usize, flags: BsendFlags) -> TranCb {
        let inner = self.inner.clone();
        Arc::new(move |_conn, mut tr: Box<Transactor>| {
            if let TranPayload::Err(e) = &tr.payload {
                inner.complete(gen, idx, TranResult::Failed(*e));
                return Step::Done;
            }
            match tr.state {
                TranState::Sent => {
                    if flags.contains(BsendFlags::EXPECT_RESPONSE) {
                        Step::RecvNext(tr)
                    } else {
                        inner.complete(gen, idx, TranResult::Sent);
                        Step::Done
                    }
                }
                TranState::Recv => {
                    let result = match tr.take_msg() {
                        Some(msg) => TranResult::Recv(msg),
                        None => TranResult::Failed(Ferr::Io),
                    };
                    inner.complete(gen, idx, result);
                    Step::Done
                }
                _ => {
                    inner.complete(gen, idx, TranResult::Failed(Ferr::Io));
                    Step::Done
                }
            }
        })
    }

    /// Reserve the next slot. Fails with `EMFILE` when the batch is full
    /// and `ECANCELED` once the context has been cancelled.
    fn grab_slot(&self) -> Result<(u64, usize), Ferr> {
        let mut state = self.inner.state.lock().unwrap();
        if state.cancel {
            return Err(Ferr::Canceled);
        }
        if state.slots.len() >= self.max_tr {
            return Err(Ferr::MFile);
        }
        let idx = state.slots.len();
        state.slots.push(None);
        Ok((state.gen, idx))
    }

    fn drop_slot(&self, idx: usize) {
        let mut state = self.inner.state.lock().unwrap();
        if state.slots.len() == idx + 1 {
            state.slots.pop();
        }
    }

    /// Queue one message to `(ip, port)` as part of this batch.
    pub fn add(
        &self,
        msgr: &Messenger,
        flags: BsendFlags,
        msg: Msg,
        ip: u32,
        port: u16,
    ) -> Result<(), Ferr> {
        let (gen, idx) = self.grab_slot().map_err(|e| {
            events::log_msgr(
                &self.fb,
                FL_BSEND,
                ip,
                port,
                0,
                0,
                MsgrEvent::BsendAddFailed,
                e.code().min(u16::MAX as i32) as u16,
            );
            e
        })?;
        let tr = match msgr.alloc_tran(self.make_cb(gen, idx, flags)) {
            Ok(tr) => tr,
            Err(_) => {
                self.drop_slot(idx);
                events::log_msgr(
                    &self.fb,
                    FL_BSEND,
                    ip,
                    port,
                    0,
                    0,
                    MsgrEvent::BsendAddFailed,
                    Ferr::MFile.code() as u16,
                );
                return Err(Ferr::MFile);
            }
        };
        events::log_msgr(
            &self.fb,
            FL_BSEND,
            ip,
            port,
            tr.id,
            0,
            MsgrEvent::BsendAdd,
            msg.ty,
        );
        msgr.send(tr, ip, port, msg);
        Ok(())
    }

    /// Like [`add`](Bsend::add), but reusing a caller-supplied transactor
    /// (typically one handed over by a receive pool, to reply on the same
    /// transaction). Takes ownership; the transactor's existing peer
    /// address is used.
    pub fn add_tr(
        &self,
        msgr: &Messenger,
        flags: BsendFlags,
        msg: Msg,
        mut tr: Box<Transactor>,
    ) -> Result<(), Ferr> {
        let (gen, idx) = self.grab_slot()?;
        tr.set_cb(self.make_cb(gen, idx, flags));
        let (ip, port) = (tr.ip, tr.port);
        events::log_msgr(
            &self.fb,
            FL_BSEND,
            ip,
            port,
            tr.id,
            tr.rem_id,
            MsgrEvent::BsendAdd,
            msg.ty,
        );
        msgr.send(tr, ip, port, msg);
        Ok(())
    }

    /// Block until every added transactor has completed, the context is
    /// cancelled, or the context timeout expires (which cancels the
    /// batch). Returns the number of transactors in the batch.
    pub fn join(&self) -> Result<usize, Ferr> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if state.cancel {
                BsendInner::cancel_locked(&mut state);
                events::log_msgr(
                    &self.fb,
                    FL_BSEND,
                    0,
                    0,
                    0,
                    0,
                    MsgrEvent::BsendCanceled,
                    state.slots.len().min(u16::MAX as usize) as u16,
                );
                return Err(Ferr::Canceled);
            }
            if state.num_finished == state.slots.len() {
                let n = state.slots.len();
                events::log_msgr(
                    &self.fb,
                    FL_BSEND,
                    0,
                    0,
                    0,
                    0,
                    MsgrEvent::BsendJoin,
                    n.min(u16::MAX as usize) as u16,
                );
                return Ok(n);
            }
            let now = Instant::now();
            if now >= deadline {
                trace!("bsend join timed out; cancelling batch");
                BsendInner::cancel_locked(&mut state);
                continue;
            }
            let (guard, _) = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
    }

    /// The result of the i-th added transactor. `None` until that slot
    /// has completed (normally inspected after [`join`](Bsend::join)).
    pub fn get(&self, idx: usize) -> Option<TranResult> {
        let state = self.inner.state.lock().unwrap();
        state.slots.get(idx).cloned().flatten()
    }

    /// Number of transactors added to the current batch.
    pub fn num_tr(&self) -> usize {
        self.inner.state.lock().unwrap().slots.len()
    }

    /// Discard the batch and make the context ready for a new one. Also
    /// re-arms a cancelled context; straggling completions from the old
    /// batch are ignored via the generation counter.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.gen += 1;
        state.slots.clear();
        state.num_finished = 0;
        state.cancel = false;
        events::log_msgr(&self.fb, FL_BSEND, 0, 0, 0, 0, MsgrEvent::BsendReset, 0);
    }

    /// Cancel the batch. Thread-safe. Every slot — including ones that
    /// had already completed — reads `ECANCELED`; a blocked `join` wakes
    /// and returns `ECANCELED`; subsequent `add`s fail until `reset`.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.cancel {
            return;
        }
        BsendInner::cancel_locked(&mut state);
        self.inner.cond.notify_all();
    }
}
