//! Client-side MDS session handling: a blocking RPC path to the current
//! primary MDS, and the failover loop that finds a new primary when the
//! current one stops answering.
//!
//! RPCs flag a failure and retry rather than erroring out: the first
//! failed exchange marks the session failed and wakes the failover
//! thread, and every RPC then parks on a condvar until a new primary is
//! confirmed or its own deadline expires.

use fastlog::FastLogMgr;
use msgr::{Bsend, BsendFlags, Messenger, TranResult};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wire::types::{GetMdsStatusReq, MdsStatus};
use wire::{ClusterMap, Ferr, Msg, MsgType};

/// Pause between full sweeps of the MDS list when nobody claims to be
/// primary.
pub const FAILTHREAD_LONG_SLEEP_MS: u64 = 5000;

/// Timeout for one `GET_MDS_STATUS` probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

struct ClientState {
    cmap: ClusterMap,
    pri_mid: u16,
    fail: bool,
    disconnecting: bool,
}

struct ClientInner {
    msgr: Arc<Messenger>,
    mgr: Arc<FastLogMgr>,
    state: Mutex<ClientState>,
    /// Woken when an RPC marks the session failed.
    need_failover: Condvar,
    /// Broadcast when a primary is (re)confirmed.
    rpc_cond: Condvar,
    rpc_timeout: Duration,
}

pub struct FishClient {
    inner: Arc<ClientInner>,
    fail_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl FishClient {
    /// `pri_mid` is the starting guess for the primary (normally 0, the
    /// first MDS in the map).
    pub fn new(
        msgr: Arc<Messenger>,
        mgr: Arc<FastLogMgr>,
        cmap: ClusterMap,
        pri_mid: u16,
        rpc_timeout: Duration,
    ) -> std::io::Result<FishClient> {
        let inner = Arc::new(ClientInner {
            msgr,
            mgr,
            state: Mutex::new(ClientState {
                cmap,
                pri_mid,
                fail: false,
                disconnecting: false,
            }),
            need_failover: Condvar::new(),
            rpc_cond: Condvar::new(),
            rpc_timeout,
        });
        let thread_inner = inner.clone();
        let handle = std::thread::Builder::new()
            .name("failthread".to_string())
            .spawn(move || failthread_run(thread_inner))?;
        Ok(FishClient {
            inner,
            fail_thread: Mutex::new(Some(handle)),
        })
    }

    pub fn primary_mid(&self) -> u16 {
        self.inner.state.lock().unwrap().pri_mid
    }

    /// Install a newer cluster map. Older epochs are ignored; readers
    /// always see one consistent map.
    pub fn update_cmap(&self, cmap: ClusterMap) {
        let mut st = self.inner.state.lock().unwrap();
        if cmap.epoch > st.cmap.epoch {
            info!(epoch = cmap.epoch, "installing new cluster map");
            st.cmap = cmap;
        } else {
            debug!(
                epoch = cmap.epoch,
                current = st.cmap.epoch,
                "ignoring stale cluster map"
            );
        }
    }

    /// Send `msg` to the primary MDS and return the response. Retries
    /// through failovers until the deadline passes.
    pub fn mds_rpc(&self, msg: Msg) -> Result<Msg, Ferr> {
        let inner = &self.inner;
        let deadline = Instant::now() + inner.rpc_timeout;
        loop {
            let (ip, port) = {
                let mut st = inner.state.lock().unwrap();
                loop {
                    if st.disconnecting {
                        return Err(Ferr::Shutdown);
                    }
                    if !st.fail {
                        break;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Ferr::TimedOut);
                    }
                    let (guard, _) = inner
                        .rpc_cond
                        .wait_timeout(st, deadline - now)
                        .unwrap();
                    st = guard;
                }
                match st.cmap.mdses.get(st.pri_mid as usize) {
                    Some(info) => (info.ip, info.port),
                    None => return Err(Ferr::Inval),
                }
            };

            let ctx = Bsend::new(&inner.mgr, 1, inner.rpc_timeout);
            if let Err(e) = ctx.add(
                &inner.msgr,
                BsendFlags::EXPECT_RESPONSE,
                msg.clone(),
                ip,
                port,
            ) {
                return Err(e);
            }
            let _ = ctx.join();
            let result = ctx.get(0);
            ctx.reset();
            match result {
                Some(TranResult::Recv(resp)) => return Ok(resp),
                other => {
                    let err = match other {
                        Some(TranResult::Failed(e)) => e,
                        _ => Ferr::Io,
                    };
                    debug!(error = %err, "primary mds rpc failed; requesting failover");
                    let mut st = inner.state.lock().unwrap();
                    st.fail = true;
                    inner.need_failover.notify_one();
                    if Instant::now() >= deadline {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Stop the failover thread and fail every blocked RPC.
    pub fn disconnect(&self) {
        {
            let mut st = self.inner.state.lock().unwrap();
            if st.disconnecting {
                return;
            }
            st.disconnecting = true;
            self.inner.need_failover.notify_all();
            self.inner.rpc_cond.notify_all();
        }
        let handle = self.fail_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("failover thread panicked");
            }
        }
    }
}

impl Drop for FishClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Probe one MDS for who it thinks the primary is.
fn ask_mds_status(inner: &ClientInner, ctx: &Bsend, ip: u32, port: u16) -> Result<u16, Ferr> {
    let req = Msg::from_payload(MsgType::GetMdsStatusReq, &GetMdsStatusReq);
    ctx.add(&inner.msgr, BsendFlags::EXPECT_RESPONSE, req, ip, port)?;
    let _ = ctx.join();
    let result = ctx.get(0);
    ctx.reset();
    match result {
        Some(TranResult::Recv(m)) => {
            let status: MdsStatus = m.payload(MsgType::MdsStatus).map_err(|_| Ferr::Io)?;
            Ok(status.pri_mid)
        }
        Some(TranResult::Failed(e)) => Err(e),
        _ => Err(Ferr::Io),
    }
}

/// Re-establish contact with a primary MDS after the current one stops
/// responding. Sweeps the MDS list starting just past the old primary; a
/// reply is only trusted when the responder reports itself as primary
/// (which is also how the old primary confirms it recovered).
fn failthread_run(inner: Arc<ClientInner>) {
    let ctx = Bsend::new(&inner.mgr, 1, PROBE_TIMEOUT);
    let mut st = inner.state.lock().unwrap();
    loop {
        if st.disconnecting {
            return;
        }
        if !st.fail {
            st = inner.need_failover.wait(st).unwrap();
            continue;
        }
        let num_mds = st.cmap.num_mds() as u16;
        if num_mds == 0 {
            warn!("cluster map has no mdses; nothing to fail over to");
            st.fail = false;
            inner.rpc_cond.notify_all();
            continue;
        }
        let old_pri = st.pri_mid % num_mds;
        let mut mid = (old_pri + 1) % num_mds;
        loop {
            if st.disconnecting {
                return;
            }
            let info = match st.cmap.mdses.get(mid as usize) {
                Some(info) => *info,
                None => {
                    // The map shrank under us; restart the sweep.
                    mid = 0;
                    continue;
                }
            };
            drop(st);
            match ask_mds_status(&inner, &ctx, info.ip, info.port) {
                Ok(reported) if reported == mid => {
                    st = inner.state.lock().unwrap();
                    if reported == old_pri {
                        info!(mid = reported, "primary mds recovered");
                    } else {
                        info!(mid = reported, "found new primary mds");
                    }
                    st.pri_mid = reported;
                    st.fail = false;
                    inner.rpc_cond.notify_all();
                    break;
                }
                Ok(reported) => {
                    debug!(mid, reported, "mds defers to another primary");
                }
                Err(e) => {
                    debug!(mid, error = %e, "mds did not answer status probe");
                }
            }
            if mid == old_pri {
                debug!(
                    sleep_ms = FAILTHREAD_LONG_SLEEP_MS,
                    "no primary found this sweep"
                );
                std::thread::sleep(Duration::from_millis(FAILTHREAD_LONG_SLEEP_MS));
            }
            st = inner.state.lock().unwrap();
            mid = (mid + 1) % num_mds;
        }
    }
}
