//! Failover against a two-MDS toy cluster: the configured primary is
//! dead, the second MDS answers status probes and takes the traffic.

use fastlog::FastLogMgr;
use fishclient::FishClient;
use msgr::{Bsend, BsendFlags, Messenger, MsgrConf, RecvPool, Transactor};
use std::sync::Arc;
use std::time::Duration;
use wire::types::{GetMdsStatusReq, MdsStatus, Test30, Test31};
use wire::{ClusterMap, DaemonInfo, Msg, MsgType};

const LOCALHOST: u32 = 0x7f000001;

fn test_conf(mgr: Arc<FastLogMgr>) -> MsgrConf {
    let mut conf = MsgrConf::new(mgr);
    conf.timeout_period = Duration::from_secs(1);
    conf.timeout_cnt_max = 60;
    conf
}

/// An MDS that reports `pri_mid` for status probes and answers TEST30
/// arithmetic.
fn spawn_mds(pri_mid: u16) -> (Arc<Messenger>, RecvPool, u16) {
    let mgr = FastLogMgr::new();
    let mds = Messenger::new(test_conf(mgr.clone()));
    let pool = RecvPool::new();
    let port = mds.listen(0, pool.listen_cb()).unwrap();
    mds.start().unwrap();

    let handler_mds = mds.clone();
    let handler = move |mut tr: Box<Transactor>| {
        let Some(msg) = tr.take_msg() else { return };
        let reply = match msg.msg_type() {
            Ok(MsgType::GetMdsStatusReq) => {
                let _req: GetMdsStatusReq = match msg.payload(MsgType::GetMdsStatusReq) {
                    Ok(req) => req,
                    Err(_) => return,
                };
                Msg::from_payload(MsgType::MdsStatus, &MdsStatus { pri_mid })
            }
            Ok(MsgType::Test30) => {
                let Ok(req) = msg.payload::<Test30>(MsgType::Test30) else {
                    return;
                };
                Msg::from_payload(MsgType::Test31, &Test31 { z: req.x + req.y })
            }
            _ => return,
        };
        let ctx = Bsend::new(&FastLogMgr::new(), 1, Duration::from_secs(10));
        if ctx
            .add_tr(&handler_mds, BsendFlags::empty(), reply, tr)
            .is_ok()
        {
            let _ = ctx.join();
        }
        ctx.reset();
    };
    pool.spawn_worker("mds-worker", Arc::new(handler)).unwrap();
    (mds, pool, port)
}

/// A port with no listener behind it.
fn dead_port() -> u16 {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[test]
fn rpc_fails_over_to_live_primary() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (mds1, pool1, live_port) = spawn_mds(1);

    let cmap = ClusterMap::new(
        1,
        vec![],
        vec![
            DaemonInfo::new(LOCALHOST, dead_port()),
            DaemonInfo::new(LOCALHOST, live_port),
        ],
    );

    let mgr = FastLogMgr::new();
    let client_msgr = Messenger::new(test_conf(mgr.clone()));
    client_msgr.start().unwrap();
    let client = FishClient::new(
        client_msgr.clone(),
        mgr,
        cmap,
        0,
        Duration::from_secs(30),
    )
    .unwrap();
    assert_eq!(client.primary_mid(), 0);

    // The first attempt hits the dead mds 0, flags a failure, and the
    // failover thread promotes mds 1; the rpc then retries and succeeds.
    let req = Msg::from_payload(MsgType::Test30, &Test30 { x: 2, y: 3 });
    let resp = client.mds_rpc(req).unwrap();
    let t: Test31 = resp.payload(MsgType::Test31).unwrap();
    assert_eq!(t.z, 5);
    assert_eq!(client.primary_mid(), 1);

    // With the primary settled, further rpcs go straight through.
    let req = Msg::from_payload(MsgType::Test30, &Test30 { x: 10, y: 20 });
    let resp = client.mds_rpc(req).unwrap();
    let t: Test31 = resp.payload(MsgType::Test31).unwrap();
    assert_eq!(t.z, 30);

    client.disconnect();
    client_msgr.shutdown();
    pool1.join();
    mds1.shutdown();
}

#[test]
fn stale_cluster_maps_are_ignored() {
    let mgr = FastLogMgr::new();
    let client_msgr = Messenger::new(test_conf(mgr.clone()));
    client_msgr.start().unwrap();

    let cmap = ClusterMap::new(3, vec![], vec![DaemonInfo::new(LOCALHOST, 9080)]);
    let client = FishClient::new(
        client_msgr.clone(),
        mgr,
        cmap,
        0,
        Duration::from_secs(5),
    )
    .unwrap();

    let newer = ClusterMap::new(
        4,
        vec![],
        vec![
            DaemonInfo::new(LOCALHOST, 9080),
            DaemonInfo::new(LOCALHOST, 9081),
        ],
    );
    client.update_cmap(newer);
    let stale = ClusterMap::new(2, vec![], vec![]);
    client.update_cmap(stale);

    // The epoch-4 map (two mdses) is still in effect; a stale empty map
    // would have broken primary lookup entirely.
    assert_eq!(client.primary_mid(), 0);
    client.disconnect();
    client_msgr.shutdown();
}
