//! A fixed pool of worker threads consuming inbound transactors.
//!
//! The messenger's listen callback pushes each fully-received transactor
//! onto the pool's queue; one worker dequeues it and runs the handler.
//! Handlers run with no locks held and are free to block — the usual
//! shape is a bsend round-trip to peers followed by a reply on the same
//! transactor.

use crate::error::MsgrError;
use crate::tran::{Step, TranCb, TranPayload, Transactor};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use tracing::debug;

/// Handles one inbound transactor. The transactor's payload is always a
/// received message; failed inbound transactors are dropped at the pool
/// edge.
pub trait RecvHandler: Send + Sync + 'static {
    fn handle(&self, tr: Box<Transactor>);
}

impl<F> RecvHandler for F
where
    F: Fn(Box<Transactor>) + Send + Sync + 'static,
{
    fn handle(&self, tr: Box<Transactor>) {
        self(tr)
    }
}

struct PoolState {
    pending: VecDeque<Box<Transactor>>,
    cancel: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    cond: Condvar,
}

pub struct RecvPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Default for RecvPool {
    fn default() -> Self {
        Self::new()
    }
}

impl RecvPool {
    pub fn new() -> RecvPool {
        RecvPool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    pending: VecDeque::new(),
                    cancel: false,
                }),
                cond: Condvar::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// The callback to hand to [`Messenger::listen`]. It runs on the
    /// event-loop thread and only moves the transactor onto the queue.
    ///
    /// [`Messenger::listen`]: crate::messenger::Messenger::listen
    pub fn listen_cb(&self) -> TranCb {
        let inner = self.inner.clone();
        Arc::new(move |_conn, tr: Box<Transactor>| {
            if matches!(tr.payload, TranPayload::Err(_)) {
                return Step::Done;
            }
            let mut state = inner.state.lock().unwrap();
            if state.cancel {
                return Step::Done;
            }
            state.pending.push_back(tr);
            inner.cond.notify_one();
            Step::Done
        })
    }

    /// Spawn one worker running `handler` for each dequeued transactor.
    pub fn spawn_worker(
        &self,
        name: &str,
        handler: Arc<dyn RecvHandler>,
    ) -> Result<(), MsgrError> {
        {
            let state = self.inner.state.lock().unwrap();
            if state.cancel {
                return Err(MsgrError::Canceled);
            }
        }
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(inner, handler))?;
        self.workers.lock().unwrap().push(handle);
        Ok(())
    }

    /// Cancel the pool, wake every worker, and join them. Queued
    /// transactors that no worker picked up are dropped.
    pub fn join(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.cancel = true;
            state.pending.clear();
            self.inner.cond.notify_all();
        }
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            if handle.join().is_err() {
                debug!("receive-pool worker panicked");
            }
        }
    }
}

fn worker_loop(inner: Arc<PoolInner>, handler: Arc<dyn RecvHandler>) {
    let mut state = inner.state.lock().unwrap();
    loop {
        if state.cancel {
            return;
        }
        match state.pending.pop_front() {
            Some(tr) => {
                drop(state);
                handler.handle(tr);
                state = inner.state.lock().unwrap();
            }
            None => {
                state = inner.cond.wait(state).unwrap();
            }
        }
    }
}
