//! One connection: a local task owning the socket and the transactors
//! multiplexed over it.
//!
//! The connection walks a small state machine. Writes drain the pending
//! queue one frame at a time; reads assemble a 16-byte header, resolve or
//! allocate the target transactor, then assemble the body. Completion of
//! either direction fires the transactor's callback inline.

use crate::events::{self, MsgrEvent, FL_MSGR_DEBUG, FL_MSGR_ERROR};
use crate::messenger::Shared;
use crate::tran::{ConnCtx, Step, TranPayload, TranState, Transactor};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::rc::Rc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};
use wire::{Ferr, Msg, MsgHdr, MSG_HDR_LEN};

pub(crate) enum ConnCmd {
    Enqueue { tr: Box<Transactor>, msg: Msg },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Quiescent,
    Writing,
    AwaitingHdr,
    ReadingHdr,
    ReadingBody,
}

/// Stamp the transactor ids into the frame and serialize it. On the wire,
/// `tran_id` names the receiver's transactor (zero until the peer has
/// allocated one) and `rem_tran_id` names ours.
fn frame_for(tr: &Transactor, mut msg: Msg) -> Bytes {
    msg.tran_id = tr.rem_id;
    msg.rem_tran_id = tr.id;
    msg.encode()
}

/// Fail a transactor outside any live connection. `SendNext`/`RecvNext`
/// have nowhere to go, so the transactor is dropped if the callback asks
/// for them.
pub(crate) fn fail_tran(mut tr: Box<Transactor>, err: Ferr, ctx: &ConnCtx) {
    tr.payload = TranPayload::Err(err);
    let cb = tr.cb();
    match cb(ctx, tr) {
        Step::SendNext(tr, _) | Step::RecvNext(tr) => drop(tr),
        Step::Done => {}
    }
}

fn apply_step(
    shared: &Shared,
    ctx: &ConnCtx,
    step: Step,
    pending: &mut VecDeque<(Box<Transactor>, Bytes)>,
    active: &mut HashMap<u32, Box<Transactor>>,
) {
    match step {
        Step::SendNext(mut tr, msg) => {
            tr.state = TranState::Pending;
            events::log_msgr(
                &shared.fb,
                FL_MSGR_DEBUG,
                ctx.ip,
                ctx.port,
                tr.id,
                tr.rem_id,
                MsgrEvent::SendNext,
                msg.ty,
            );
            let frame = frame_for(&tr, msg);
            pending.push_back((tr, frame));
        }
        Step::RecvNext(tr) => {
            active.insert(tr.id, tr);
        }
        Step::Done => {}
    }
}

pub(crate) async fn run_conn(
    shared: Rc<Shared>,
    ip: u32,
    port: u16,
    sock: Option<TcpStream>,
    mut rx: mpsc::UnboundedReceiver<ConnCmd>,
    dead_tx: mpsc::UnboundedSender<(u32, u16, u64)>,
    seq: u64,
) {
    let accepted = sock.is_some();
    let ctx = ConnCtx { ip, port };
    let mut pending: VecDeque<(Box<Transactor>, Bytes)> = VecDeque::new();
    let mut active: HashMap<u32, Box<Transactor>> = HashMap::new();

    let stream = match sock {
        Some(s) => s,
        None => match establish(&shared, ip, port, &mut rx, &mut pending).await {
            Ok(s) => s,
            Err(err) => {
                finish(&shared, &ctx, &mut rx, pending, active, err);
                let _ = dead_tx.send((ip, port, seq));
                return;
            }
        },
    };
    let _ = stream.set_nodelay(true);

    let mut state = if accepted {
        ConnState::AwaitingHdr
    } else {
        ConnState::Quiescent
    };
    let mut ticker = time::interval_at(
        Instant::now() + shared.conf.timeout_period,
        shared.conf.timeout_period,
    );
    let mut idle: u32 = 0;
    let mut wr_off: usize = 0;
    let mut rd_hdr = [0u8; MSG_HDR_LEN];
    let mut rd_cnt: usize = 0;
    let mut rd_body: Vec<u8> = Vec::new();
    let mut rd_hdr_dec: Option<MsgHdr> = None;
    let mut rd_trid: u32 = 0;

    let err: Ferr = loop {
        if state == ConnState::Quiescent && !pending.is_empty() {
            state = ConnState::Writing;
            wr_off = 0;
        }
        let want_write = state == ConnState::Writing;
        let want_read = matches!(
            state,
            ConnState::Quiescent
                | ConnState::AwaitingHdr
                | ConnState::ReadingHdr
                | ConnState::ReadingBody
        );

        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(ConnCmd::Enqueue { mut tr, msg }) => {
                    tr.state = TranState::Pending;
                    let frame = frame_for(&tr, msg);
                    pending.push_back((tr, frame));
                }
                Some(ConnCmd::Shutdown) | None => break Ferr::Shutdown,
            },
            _ = ticker.tick() => {
                idle += 1;
                if idle >= shared.conf.timeout_cnt_max {
                    let in_flight = (pending.len() + active.len()).min(u16::MAX as usize) as u16;
                    events::log_msgr(
                        &shared.fb,
                        FL_MSGR_ERROR,
                        ip,
                        port,
                        0,
                        0,
                        MsgrEvent::ConnTimedOut,
                        in_flight,
                    );
                    debug!(ip, port, in_flight, "connection idle timeout");
                    break Ferr::TimedOut;
                }
            }
            res = stream.writable(), if want_write => {
                idle = 0;
                if let Err(e) = res {
                    break Ferr::from_io(&e);
                }
                match write_step(&shared, &ctx, &stream, &mut pending, &mut wr_off, &mut active) {
                    Ok(next) => state = next,
                    Err(err) => break err,
                }
            }
            res = stream.readable(), if want_read => {
                idle = 0;
                if let Err(e) = res {
                    break Ferr::from_io(&e);
                }
                match read_step(
                    &shared,
                    &ctx,
                    &stream,
                    state,
                    &mut rd_hdr,
                    &mut rd_cnt,
                    &mut rd_body,
                    &mut rd_hdr_dec,
                    &mut rd_trid,
                    &mut pending,
                    &mut active,
                ) {
                    Ok(next) => state = next,
                    Err(err) => break err,
                }
            }
        }
    };

    finish(&shared, &ctx, &mut rx, pending, active, err);
    let _ = dead_tx.send((ip, port, seq));
}

/// Open the outbound socket, buffering enqueues that arrive meanwhile.
async fn establish(
    shared: &Rc<Shared>,
    ip: u32,
    port: u16,
    rx: &mut mpsc::UnboundedReceiver<ConnCmd>,
    pending: &mut VecDeque<(Box<Transactor>, Bytes)>,
) -> Result<TcpStream, Ferr> {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port));
    let connect = TcpStream::connect(addr);
    tokio::pin!(connect);
    let deadline = time::sleep(shared.conf.timeout_period * shared.conf.timeout_cnt_max);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            res = &mut connect => match res {
                Ok(s) => {
                    events::log_msgr(
                        &shared.fb,
                        FL_MSGR_DEBUG,
                        ip,
                        port,
                        0,
                        0,
                        MsgrEvent::ConnEstablished,
                        0,
                    );
                    trace!(ip, port, "outbound connection established");
                    return Ok(s);
                }
                Err(e) => {
                    debug!(ip, port, error = %e, "outbound connection failed");
                    return Err(Ferr::from_io(&e));
                }
            },
            _ = &mut deadline => return Err(Ferr::TimedOut),
            cmd = rx.recv() => match cmd {
                Some(ConnCmd::Enqueue { mut tr, msg }) => {
                    tr.state = TranState::Pending;
                    let frame = frame_for(&tr, msg);
                    pending.push_back((tr, frame));
                }
                Some(ConnCmd::Shutdown) | None => return Err(Ferr::Shutdown),
            },
        }
    }
}

fn write_step(
    shared: &Shared,
    ctx: &ConnCtx,
    stream: &TcpStream,
    pending: &mut VecDeque<(Box<Transactor>, Bytes)>,
    wr_off: &mut usize,
    active: &mut HashMap<u32, Box<Transactor>>,
) -> Result<ConnState, Ferr> {
    loop {
        let frame_done = {
            let Some((tr, frame)) = pending.front() else {
                return Ok(ConnState::Quiescent);
            };
            match stream.try_write(&frame[*wr_off..]) {
                Ok(0) => return Err(Ferr::ConnReset),
                Ok(n) => {
                    *wr_off += n;
                    *wr_off == frame.len()
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    return Ok(ConnState::Writing);
                }
                Err(e) => {
                    events::log_msgr(
                        &shared.fb,
                        FL_MSGR_ERROR,
                        ctx.ip,
                        ctx.port,
                        tr.id,
                        tr.rem_id,
                        MsgrEvent::WriteError,
                        Ferr::from_io(&e).code().min(u16::MAX as i32) as u16,
                    );
                    return Err(Ferr::from_io(&e));
                }
            }
        };
        if frame_done {
            *wr_off = 0;
            if let Some((mut tr, _)) = pending.pop_front() {
                tr.state = TranState::Sent;
                tr.payload = TranPayload::None;
                let cb = tr.cb();
                apply_step(shared, ctx, cb(ctx, tr), pending, active);
            }
            return Ok(ConnState::Quiescent);
        }
    }
}

/// Outcome of header resolution: the transactor the body belongs to, or
/// an instruction to drop the inbound frame state and start over.
enum Resolved {
    Tran(u32),
    Abort,
}

fn resolve_inbound(
    shared: &Rc<Shared>,
    ctx: &ConnCtx,
    hdr: &MsgHdr,
    active: &mut HashMap<u32, Box<Transactor>>,
) -> Resolved {
    if hdr.tran_id == 0 {
        // The peer is opening a new transaction; allocate its local side.
        let Some(listen_cb) = shared.listen_cb.clone() else {
            events::log_msgr(
                &shared.fb,
                FL_MSGR_ERROR,
                ctx.ip,
                ctx.port,
                0,
                hdr.rem_tran_id,
                MsgrEvent::MtranNonesuch,
                hdr.ty,
            );
            warn!(ip = ctx.ip, port = ctx.port, "inbound transaction on a non-listening messenger");
            return Resolved::Abort;
        };
        if shared.live.load(std::sync::atomic::Ordering::Relaxed) >= shared.conf.max_tran {
            events::log_msgr(
                &shared.fb,
                FL_MSGR_ERROR,
                ctx.ip,
                ctx.port,
                0,
                hdr.rem_tran_id,
                MsgrEvent::MaxTranReached,
                shared.conf.max_tran.min(u16::MAX as usize) as u16,
            );
            return Resolved::Abort;
        }
        let mut tr = Transactor::new(shared.next_trid(), listen_cb, shared.live.clone());
        tr.ip = ctx.ip;
        tr.port = ctx.port;
        tr.rem_id = hdr.rem_tran_id;
        let id = tr.id;
        active.insert(id, tr);
        Resolved::Tran(id)
    } else {
        match active.get_mut(&hdr.tran_id) {
            None => {
                events::log_msgr(
                    &shared.fb,
                    FL_MSGR_ERROR,
                    ctx.ip,
                    ctx.port,
                    hdr.tran_id,
                    hdr.rem_tran_id,
                    MsgrEvent::MtranNonesuch,
                    hdr.ty,
                );
                warn!(trid = hdr.tran_id, "message for unknown transactor");
                Resolved::Abort
            }
            Some(tr) => {
                if tr.rem_id != 0 && hdr.rem_tran_id != tr.rem_id {
                    events::log_msgr(
                        &shared.fb,
                        FL_MSGR_ERROR,
                        ctx.ip,
                        ctx.port,
                        tr.id,
                        tr.rem_id,
                        MsgrEvent::MtranWrongRemTrid,
                        hdr.ty,
                    );
                    warn!(trid = tr.id, "remote transactor id mismatch");
                    return Resolved::Abort;
                }
                if hdr.rem_tran_id != 0 {
                    tr.rem_id = hdr.rem_tran_id;
                }
                Resolved::Tran(tr.id)
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn read_step(
    shared: &Rc<Shared>,
    ctx: &ConnCtx,
    stream: &TcpStream,
    state: ConnState,
    rd_hdr: &mut [u8; MSG_HDR_LEN],
    rd_cnt: &mut usize,
    rd_body: &mut Vec<u8>,
    rd_hdr_dec: &mut Option<MsgHdr>,
    rd_trid: &mut u32,
    pending: &mut VecDeque<(Box<Transactor>, Bytes)>,
    active: &mut HashMap<u32, Box<Transactor>>,
) -> Result<ConnState, Ferr> {
    let mut st = state;
    if matches!(st, ConnState::Quiescent | ConnState::AwaitingHdr) {
        *rd_cnt = 0;
        *rd_hdr_dec = None;
        st = ConnState::ReadingHdr;
    }

    if st == ConnState::ReadingHdr {
        while *rd_cnt < MSG_HDR_LEN {
            match stream.try_read(&mut rd_hdr[*rd_cnt..]) {
                Ok(0) => return Err(Ferr::ConnReset),
                Ok(n) => *rd_cnt += n,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    return Ok(ConnState::ReadingHdr);
                }
                Err(e) => {
                    events::log_msgr(
                        &shared.fb,
                        FL_MSGR_ERROR,
                        ctx.ip,
                        ctx.port,
                        0,
                        0,
                        MsgrEvent::HdrReadError,
                        Ferr::from_io(&e).code().min(u16::MAX as i32) as u16,
                    );
                    return Err(Ferr::from_io(&e));
                }
            }
        }
        let hdr = match MsgHdr::decode(rd_hdr) {
            Ok(hdr) => hdr,
            Err(e) => {
                // A malformed frame poisons the byte stream; close it.
                events::log_msgr(
                    &shared.fb,
                    FL_MSGR_ERROR,
                    ctx.ip,
                    ctx.port,
                    0,
                    0,
                    MsgrEvent::HdrReadError,
                    0,
                );
                warn!(ip = ctx.ip, port = ctx.port, error = %e, "malformed frame header");
                return Err(Ferr::Inval);
            }
        };
        match resolve_inbound(shared, ctx, &hdr, active) {
            Resolved::Tran(trid) => *rd_trid = trid,
            Resolved::Abort => {
                *rd_cnt = 0;
                return Ok(ConnState::Quiescent);
            }
        }
        rd_body.clear();
        rd_body.resize(hdr.len as usize, 0);
        *rd_hdr_dec = Some(hdr);
        *rd_cnt = 0;
        st = ConnState::ReadingBody;
    }

    debug_assert_eq!(st, ConnState::ReadingBody);
    let Some(hdr) = *rd_hdr_dec else {
        return Ok(ConnState::Quiescent);
    };
    while *rd_cnt < rd_body.len() {
        match stream.try_read(&mut rd_body[*rd_cnt..]) {
            Ok(0) => return Err(Ferr::ConnReset),
            Ok(n) => *rd_cnt += n,
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                return Ok(ConnState::ReadingBody);
            }
            Err(e) => {
                events::log_msgr(
                    &shared.fb,
                    FL_MSGR_ERROR,
                    ctx.ip,
                    ctx.port,
                    hdr.tran_id,
                    hdr.rem_tran_id,
                    MsgrEvent::ReadError,
                    Ferr::from_io(&e).code().min(u16::MAX as i32) as u16,
                );
                return Err(Ferr::from_io(&e));
            }
        }
    }

    // Body complete: hand the message to the transactor.
    let trid = *rd_trid;
    *rd_hdr_dec = None;
    *rd_cnt = 0;
    let Some(mut tr) = active.remove(&trid) else {
        return Ok(ConnState::Quiescent);
    };
    let msg = Msg {
        tran_id: trid,
        rem_tran_id: hdr.rem_tran_id,
        ty: hdr.ty,
        data: Bytes::from(std::mem::take(rd_body)),
    };
    tr.state = TranState::Recv;
    tr.payload = TranPayload::Msg(msg);
    let cb = tr.cb();
    apply_step(shared, ctx, cb(ctx, tr), pending, active);
    Ok(ConnState::Quiescent)
}

/// Deliver failure to everything still attached to this connection, then
/// drain commands that raced in behind the teardown decision.
fn finish(
    shared: &Rc<Shared>,
    ctx: &ConnCtx,
    rx: &mut mpsc::UnboundedReceiver<ConnCmd>,
    pending: VecDeque<(Box<Transactor>, Bytes)>,
    active: HashMap<u32, Box<Transactor>>,
    err: Ferr,
) {
    rx.close();
    let mut num_failed = 0usize;
    for (tr, _) in pending {
        fail_tran(tr, err, ctx);
        num_failed += 1;
    }
    for (_, tr) in active {
        fail_tran(tr, err, ctx);
        num_failed += 1;
    }
    while let Ok(cmd) = rx.try_recv() {
        if let ConnCmd::Enqueue { tr, .. } = cmd {
            fail_tran(tr, err, ctx);
            num_failed += 1;
        }
    }
    let ty = if num_failed == 0 {
        crate::events::FL_MSGR_DEBUG
    } else {
        FL_MSGR_ERROR
    };
    events::log_msgr(
        &shared.fb,
        ty,
        ctx.ip,
        ctx.port,
        0,
        0,
        MsgrEvent::ConnTeardown,
        num_failed.min(u16::MAX as usize) as u16,
    );
    trace!(ip = ctx.ip, port = ctx.port, num_failed, error = %err, "connection torn down");
}
