//! The messenger: one event-loop thread multiplexing many transactors
//! over persistent TCP connections.
//!
//! All socket I/O and every transactor callback runs on that single
//! thread, so none of the per-connection state needs locking. The thread
//! runs a current-thread tokio runtime; connections are local tasks driven
//! by readiness, and the cross-thread [`Messenger::send`] entry point is
//! an unbounded channel that doubles as the wakeup notifier.

use crate::conn::{self, fail_tran, ConnCmd};
use crate::error::MsgrError;
use crate::events::{self, MsgrEvent, FL_MSGR_DEBUG, FL_MSGR_ERROR, FL_MSGR_INFO};
use crate::tran::{ConnCtx, TranCb, Transactor};
use fastlog::{FastLogMgr, LogBuf};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use wire::{Ferr, Msg};

/// Messenger tuning knobs.
#[derive(Clone)]
pub struct MsgrConf {
    /// Maximum number of simultaneous connections.
    pub max_conn: usize,
    /// Maximum number of live transactors across the messenger.
    pub max_tran: usize,
    /// Length of one idle-accounting period.
    pub timeout_period: Duration,
    /// Periods without any TCP traffic before a connection is torn down.
    pub timeout_cnt_max: u32,
    /// Fast-log manager receiving the messenger's ring.
    pub mgr: Arc<FastLogMgr>,
}

impl MsgrConf {
    pub fn new(mgr: Arc<FastLogMgr>) -> MsgrConf {
        MsgrConf {
            max_conn: 1024,
            max_tran: 4096,
            timeout_period: Duration::from_secs(15),
            timeout_cnt_max: 4,
            mgr,
        }
    }
}

pub(crate) enum Cmd {
    Send { tr: Box<Transactor>, msg: Msg },
    Shutdown,
}

/// State the event-loop thread shares with its connection tasks.
pub(crate) struct Shared {
    pub conf: MsgrConf,
    pub listen_cb: Option<TranCb>,
    pub next_trid: Arc<AtomicU32>,
    pub live: Arc<AtomicUsize>,
    pub fb: Arc<LogBuf>,
}

impl Shared {
    /// Next transactor id; ids are never zero (zero on the wire means
    /// "open a new transaction").
    pub fn next_trid(&self) -> u32 {
        loop {
            let id = self.next_trid.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

pub struct Messenger {
    conf: MsgrConf,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<Cmd>>>,
    listener: Mutex<Option<(std::net::TcpListener, TranCb)>>,
    listen_port: AtomicU32,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    next_trid: Arc<AtomicU32>,
    live: Arc<AtomicUsize>,
    started: AtomicBool,
}

impl Messenger {
    pub fn new(conf: MsgrConf) -> Arc<Messenger> {
        events::register_dumpers(&conf.mgr);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let seed = loop {
            let r: u32 = rand::random();
            if r != 0 {
                break r;
            }
        };
        Arc::new(Messenger {
            conf,
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            listener: Mutex::new(None),
            listen_port: AtomicU32::new(0),
            thread: Mutex::new(None),
            next_trid: Arc::new(AtomicU32::new(seed)),
            live: Arc::new(AtomicUsize::new(0)),
            started: AtomicBool::new(false),
        })
    }

    /// Bind the listening socket and register the callback that will own
    /// the first message of every newly opened inbound transaction. Must
    /// be called before [`start`](Messenger::start). Returns the bound
    /// port (useful when `port` is 0).
    pub fn listen(&self, port: u16, cb: TranCb) -> Result<u16, MsgrError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(MsgrError::ListenAfterStart);
        }
        let listener = std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?;
        listener.set_nonblocking(true)?;
        let actual = listener.local_addr()?.port();
        *self.listener.lock().unwrap() = Some((listener, cb));
        self.listen_port.store(actual as u32, Ordering::SeqCst);
        Ok(actual)
    }

    /// The port [`listen`](Messenger::listen) bound, if any.
    pub fn local_port(&self) -> Option<u16> {
        match self.listen_port.load(Ordering::SeqCst) {
            0 => None,
            p => Some(p as u16),
        }
    }

    /// Spawn the event-loop thread. After this, only `send`, `alloc_tran`
    /// and `shutdown` are legal from other threads.
    pub fn start(&self) -> Result<(), MsgrError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MsgrError::AlreadyStarted);
        }
        let cmd_rx = self
            .cmd_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(MsgrError::AlreadyStarted)?;
        let listener = self.listener.lock().unwrap().take();
        let conf = self.conf.clone();
        let next_trid = self.next_trid.clone();
        let live = self.live.clone();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = std::thread::Builder::new()
            .name("msgr".to_string())
            .spawn(move || {
                let local = tokio::task::LocalSet::new();
                local.block_on(&rt, dispatcher(conf, listener, cmd_rx, next_trid, live));
            })?;
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Allocate a transactor bound to `cb`.
    pub fn alloc_tran(&self, cb: TranCb) -> Result<Box<Transactor>, MsgrError> {
        let n = self.live.load(Ordering::Relaxed);
        if n >= self.conf.max_tran {
            return Err(MsgrError::TranLimit(n));
        }
        loop {
            let id = self.next_trid.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return Ok(Transactor::new(id, cb, self.live.clone()));
            }
        }
    }

    /// Currently live transactors (allocated and not yet dropped).
    pub fn live_trans(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Queue `msg` for `tr` towards `(ip, port)`, reusing an existing
    /// connection to that peer if there is one. Thread-safe; returns
    /// immediately. Completion, success or failure, is reported through
    /// the transactor's callback on the event-loop thread.
    pub fn send(&self, mut tr: Box<Transactor>, ip: u32, port: u16, msg: Msg) {
        tr.ip = ip;
        tr.port = port;
        if let Err(lost) = self.cmd_tx.send(Cmd::Send { tr, msg }) {
            // The event loop is gone; fail the transactor right here.
            if let Cmd::Send { tr, .. } = lost.0 {
                let ctx = ConnCtx { ip, port };
                fail_tran(tr, Ferr::Shutdown, &ctx);
            }
        }
    }

    /// Stop the event loop, tear down every connection (each outstanding
    /// transactor hears `ESHUTDOWN`), and join the thread. Safe to call
    /// more than once. Must not be called from a transactor callback.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Cmd::Shutdown);
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("messenger thread panicked during shutdown");
            }
        }
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ConnHandle {
    tx: mpsc::UnboundedSender<ConnCmd>,
    task: tokio::task::JoinHandle<()>,
    seq: u64,
}

struct Table {
    conns: HashMap<(u32, u16), ConnHandle>,
    next_seq: u64,
}

async fn dispatcher(
    conf: MsgrConf,
    listener: Option<(std::net::TcpListener, TranCb)>,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    next_trid: Arc<AtomicU32>,
    live: Arc<AtomicUsize>,
) {
    let fb = conf.mgr.create_buf("msgr");
    let (listener, listen_cb) = match listener {
        Some((std_listener, cb)) => match TcpListener::from_std(std_listener) {
            Ok(l) => (Some(l), Some(cb)),
            Err(e) => {
                error!(error = %e, "failed to adopt listening socket");
                (None, None)
            }
        },
        None => (None, None),
    };
    let shared = Rc::new(Shared {
        conf,
        listen_cb,
        next_trid,
        live,
        fb,
    });
    events::log_msgr(&shared.fb, FL_MSGR_INFO, 0, 0, 0, 0, MsgrEvent::MsgrInit, 0);
    if let Some(l) = &listener {
        let port = l.local_addr().map(|a| a.port()).unwrap_or(0);
        info!(port, "messenger listening");
        events::log_msgr(
            &shared.fb,
            FL_MSGR_INFO,
            0,
            0,
            0,
            0,
            MsgrEvent::Listening,
            port,
        );
    }

    let mut table = Table {
        conns: HashMap::new(),
        next_seq: 0,
    };
    let (dead_tx, mut dead_rx) = mpsc::unbounded_channel::<(u32, u16, u64)>();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Cmd::Send { tr, msg }) => {
                    dispatch_send(&shared, &mut table, &dead_tx, tr, msg);
                }
                Some(Cmd::Shutdown) | None => break,
            },
            Some((ip, port, seq)) = dead_rx.recv() => {
                reap_conn(&mut table, ip, port, seq).await;
            }
            res = accept_on(listener.as_ref()), if listener.is_some() => {
                match res {
                    Ok((sock, peer)) => handle_accept(&shared, &mut table, &dead_tx, sock, peer),
                    Err(e) => debug!(error = %e, "accept failed"),
                }
            }
        }
    }

    events::log_msgr(
        &shared.fb,
        FL_MSGR_INFO,
        0,
        0,
        0,
        0,
        MsgrEvent::MsgrShutdown,
        0,
    );
    info!("messenger shutting down");
    for (_, handle) in table.conns.drain() {
        let _ = handle.tx.send(ConnCmd::Shutdown);
        let _ = handle.task.await;
    }
}

async fn accept_on(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

async fn reap_conn(table: &mut Table, ip: u32, port: u16, seq: u64) {
    let stale = match table.conns.get(&(ip, port)) {
        Some(handle) => handle.seq == seq,
        None => false,
    };
    if stale {
        if let Some(handle) = table.conns.remove(&(ip, port)) {
            let _ = handle.task.await;
        }
    }
}

fn dispatch_send(
    shared: &Rc<Shared>,
    table: &mut Table,
    dead_tx: &mpsc::UnboundedSender<(u32, u16, u64)>,
    tr: Box<Transactor>,
    msg: Msg,
) {
    let key = (tr.ip, tr.port);
    if let Some(handle) = table.conns.get(&key) {
        events::log_msgr(
            &shared.fb,
            FL_MSGR_DEBUG,
            key.0,
            key.1,
            tr.id,
            tr.rem_id,
            MsgrEvent::ConnReused,
            msg.ty,
        );
        match handle.tx.send(ConnCmd::Enqueue { tr, msg }) {
            Ok(()) => return,
            Err(lost) => {
                // The task raced us into teardown; replace it.
                table.conns.remove(&key);
                if let ConnCmd::Enqueue { tr, msg } = lost.0 {
                    spawn_outbound(shared, table, dead_tx, key, tr, msg);
                }
                return;
            }
        }
    }
    if table.conns.len() >= shared.conf.max_conn {
        events::log_msgr(
            &shared.fb,
            FL_MSGR_ERROR,
            key.0,
            key.1,
            tr.id,
            tr.rem_id,
            MsgrEvent::MaxConnReached,
            shared.conf.max_conn.min(u16::MAX as usize) as u16,
        );
        warn!(ip = key.0, port = key.1, "connection budget exhausted");
        let ctx = ConnCtx {
            ip: key.0,
            port: key.1,
        };
        fail_tran(tr, Ferr::NoSpc, &ctx);
        return;
    }
    spawn_outbound(shared, table, dead_tx, key, tr, msg);
}

fn spawn_outbound(
    shared: &Rc<Shared>,
    table: &mut Table,
    dead_tx: &mpsc::UnboundedSender<(u32, u16, u64)>,
    key: (u32, u16),
    tr: Box<Transactor>,
    msg: Msg,
) {
    events::log_msgr(
        &shared.fb,
        FL_MSGR_DEBUG,
        key.0,
        key.1,
        tr.id,
        tr.rem_id,
        MsgrEvent::OutboundConnCreated,
        msg.ty,
    );
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(ConnCmd::Enqueue { tr, msg });
    let seq = table.next_seq;
    table.next_seq += 1;
    let task = tokio::task::spawn_local(conn::run_conn(
        shared.clone(),
        key.0,
        key.1,
        None,
        rx,
        dead_tx.clone(),
        seq,
    ));
    table.conns.insert(key, ConnHandle { tx, task, seq });
}

fn handle_accept(
    shared: &Rc<Shared>,
    table: &mut Table,
    dead_tx: &mpsc::UnboundedSender<(u32, u16, u64)>,
    sock: TcpStream,
    peer: SocketAddr,
) {
    let key = match peer {
        SocketAddr::V4(v4) => (u32::from(*v4.ip()), v4.port()),
        SocketAddr::V6(_) => {
            debug!(%peer, "rejecting non-IPv4 peer");
            return;
        }
    };
    // At most one TCP connection per peer.
    if table.conns.contains_key(&key) {
        events::log_msgr(
            &shared.fb,
            FL_MSGR_ERROR,
            key.0,
            key.1,
            0,
            0,
            MsgrEvent::MtranMultiConn,
            0,
        );
        warn!(ip = key.0, port = key.1, "duplicate connection from peer rejected");
        return;
    }
    if table.conns.len() >= shared.conf.max_conn {
        events::log_msgr(
            &shared.fb,
            FL_MSGR_ERROR,
            key.0,
            key.1,
            0,
            0,
            MsgrEvent::MaxConnReached,
            shared.conf.max_conn.min(u16::MAX as usize) as u16,
        );
        return;
    }
    events::log_msgr(
        &shared.fb,
        FL_MSGR_DEBUG,
        key.0,
        key.1,
        0,
        0,
        MsgrEvent::InboundConnCreated,
        0,
    );
    let (tx, rx) = mpsc::unbounded_channel();
    let seq = table.next_seq;
    table.next_seq += 1;
    let task = tokio::task::spawn_local(conn::run_conn(
        shared.clone(),
        key.0,
        key.1,
        Some(sock),
        rx,
        dead_tx.clone(),
        seq,
    ));
    table.conns.insert(key, ConnHandle { tx, task, seq });
}
