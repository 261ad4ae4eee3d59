//! The full read path over loopback: the client asks the MDS where a
//! file's chunks live, pushes data to the OSD holding them, and reads it
//! back.

use bytes::Bytes;
use fastlog::FastLogMgr;
use fishclient::FishClient;
use mds::{Mstor, MstorReq};
use msgr::{Bsend, BsendFlags, Messenger, MsgrConf, RecvPool, TranResult, Transactor};
use ostor::Ostor;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wire::types::{
    Endpoint, GenericResp, LocateReq, LocateResp, MkdirsReq, OsdHflushReq, OsdReadReq,
    OsdReadResp, StatReq, StatResp,
};
use wire::{ClusterMap, DaemonInfo, Ferr, Msg, MsgType};

const LOCALHOST: u32 = 0x7f000001;

fn test_conf(mgr: Arc<FastLogMgr>) -> MsgrConf {
    let mut conf = MsgrConf::new(mgr);
    conf.timeout_period = Duration::from_secs(1);
    conf.timeout_cnt_max = 60;
    conf
}

fn reply(
    messenger: &Arc<Messenger>,
    mgr: &FastLogMgr,
    tr: Box<Transactor>,
    msg: Msg,
) {
    let ctx = Bsend::new(mgr, 1, Duration::from_secs(10));
    if ctx.add_tr(messenger, BsendFlags::empty(), msg, tr).is_ok() {
        let _ = ctx.join();
    }
    ctx.reset();
}

/// An MDS daemon in miniature: a messenger, a receive pool, and a
/// metadata store behind it.
fn spawn_mds(ms: Arc<Mstor>) -> (Arc<Messenger>, RecvPool, u16) {
    let mgr = FastLogMgr::new();
    let messenger = Messenger::new(test_conf(mgr.clone()));
    let pool = RecvPool::new();
    let port = messenger.listen(0, pool.listen_cb()).unwrap();
    messenger.start().unwrap();

    let handler_msgr = messenger.clone();
    let handler = move |mut tr: Box<Transactor>| {
        let Some(msg) = tr.take_msg() else { return };
        let resp = match msg.msg_type() {
            Ok(MsgType::GetMdsStatusReq) => {
                Msg::from_payload(MsgType::MdsStatus, &wire::types::MdsStatus { pri_mid: 0 })
            }
            Ok(MsgType::MkdirsReq) => {
                let error = match msg.payload::<MkdirsReq>(MsgType::MkdirsReq) {
                    Ok(req) => {
                        let mreq = MstorReq {
                            user: &req.user,
                            group: &req.group,
                        };
                        match ms.mkdirs(&mreq, &req.path, req.mode, req.ctime) {
                            Ok(()) => 0,
                            Err(e) => e.errno().code(),
                        }
                    }
                    Err(_) => Ferr::Inval.code(),
                };
                Msg::from_payload(MsgType::GenericResp, &GenericResp { error })
            }
            Ok(MsgType::StatReq) => {
                let resp = match msg.payload::<StatReq>(MsgType::StatReq) {
                    Ok(req) => {
                        let mreq = MstorReq {
                            user: &req.user,
                            group: &req.group,
                        };
                        match ms.stat(&mreq, &req.path) {
                            Ok(stat) => StatResp {
                                error: 0,
                                stat: Some(stat),
                            },
                            Err(e) => StatResp {
                                error: e.errno().code(),
                                stat: None,
                            },
                        }
                    }
                    Err(_) => StatResp {
                        error: Ferr::Inval.code(),
                        stat: None,
                    },
                };
                Msg::from_payload(MsgType::StatResp, &resp)
            }
            Ok(MsgType::LocateReq) => {
                let resp = match msg.payload::<LocateReq>(MsgType::LocateReq) {
                    Ok(req) => {
                        let mreq = MstorReq {
                            user: &req.user,
                            group: &req.group,
                        };
                        match ms.chunk_find(&mreq, &req.path, req.start, req.len) {
                            Ok(locs) => LocateResp { error: 0, locs },
                            Err(e) => LocateResp {
                                error: e.errno().code(),
                                locs: vec![],
                            },
                        }
                    }
                    Err(_) => LocateResp {
                        error: Ferr::Inval.code(),
                        locs: vec![],
                    },
                };
                Msg::from_payload(MsgType::LocateResp, &resp)
            }
            _ => Msg::from_payload(
                MsgType::GenericResp,
                &GenericResp {
                    error: Ferr::NoSys.code(),
                },
            ),
        };
        reply(&handler_msgr, &mgr, tr, resp);
    };
    pool.spawn_worker("mds-worker", Arc::new(handler)).unwrap();
    (messenger, pool, port)
}

/// An OSD daemon in miniature: hflush appends and commits, read streams
/// chunk bytes back.
fn spawn_osd(store: Arc<Ostor>) -> (Arc<Messenger>, RecvPool, u16) {
    let mgr = FastLogMgr::new();
    let messenger = Messenger::new(test_conf(mgr.clone()));
    let pool = RecvPool::new();
    let port = messenger.listen(0, pool.listen_cb()).unwrap();
    messenger.start().unwrap();

    let handler_msgr = messenger.clone();
    let handler = move |mut tr: Box<Transactor>| {
        let Some(msg) = tr.take_msg() else { return };
        let resp = match msg.msg_type() {
            Ok(MsgType::OsdHflushReq) => {
                let error = match msg.payload::<OsdHflushReq>(MsgType::OsdHflushReq) {
                    Ok(req) => match store.write(req.cid, &req.data) {
                        Ok(()) => 0,
                        Err(e) => e.errno().code(),
                    },
                    Err(_) => Ferr::Inval.code(),
                };
                Msg::from_payload(MsgType::GenericResp, &GenericResp { error })
            }
            Ok(MsgType::OsdReadReq) => {
                let resp = match msg.payload::<OsdReadReq>(MsgType::OsdReadReq) {
                    Ok(req) => match store.read(req.cid, req.start, req.len as usize) {
                        Ok(data) => OsdReadResp {
                            error: 0,
                            data: Bytes::from(data),
                        },
                        Err(e) => OsdReadResp {
                            error: e.errno().code(),
                            data: Bytes::new(),
                        },
                    },
                    Err(_) => OsdReadResp {
                        error: Ferr::Inval.code(),
                        data: Bytes::new(),
                    },
                };
                Msg::from_payload(MsgType::OsdReadResp, &resp)
            }
            _ => Msg::from_payload(
                MsgType::GenericResp,
                &GenericResp {
                    error: Ferr::NoSys.code(),
                },
            ),
        };
        reply(&handler_msgr, &mgr, tr, resp);
    };
    pool.spawn_worker("osd-worker", Arc::new(handler)).unwrap();
    (messenger, pool, port)
}

#[test]
fn locate_flush_and_read_back() {
    let dir = TempDir::new().unwrap();
    let ms = Arc::new(
        Mstor::open(&fishconfig::MstorConf {
            path: dir.path().join("mstor"),
            cache_mb: 16,
            io_threads: 4,
            create: true,
            min_repl: 1,
            man_repl: 1,
        })
        .unwrap(),
    );
    let store = Arc::new(
        Ostor::open(&fishconfig::OstorConf {
            path: dir.path().join("ostor"),
            max_open: 32,
            timeo_secs: 60,
        })
        .unwrap(),
    );

    let (mds_msgr, mds_pool, mds_port) = spawn_mds(ms.clone());
    let (osd_msgr, osd_pool, osd_port) = spawn_osd(store.clone());

    let cmap = ClusterMap::new(
        1,
        vec![DaemonInfo::new(LOCALHOST, osd_port)],
        vec![DaemonInfo::new(LOCALHOST, mds_port)],
    );
    let mgr = FastLogMgr::new();
    let client_msgr = Messenger::new(test_conf(mgr.clone()));
    client_msgr.start().unwrap();
    let client = FishClient::new(
        client_msgr.clone(),
        mgr.clone(),
        cmap,
        0,
        Duration::from_secs(30),
    )
    .unwrap();

    // Create the directory over the wire.
    let mk = MkdirsReq {
        user: "alice".to_string(),
        group: "users".to_string(),
        path: "/data".to_string(),
        mode: 0o755,
        ctime: 1000,
    };
    let resp = client
        .mds_rpc(Msg::from_payload(MsgType::MkdirsReq, &mk))
        .unwrap();
    assert_eq!(resp.resp_errno().unwrap(), 0);

    // File creation and chunk placement happen on the MDS side.
    let alice = MstorReq {
        user: "alice",
        group: "users",
    };
    ms.creat(&alice, "/data/blob", 0o644, 1001).unwrap();
    let cid = ms
        .chunk_alloc(
            &alice,
            "/data/blob",
            0,
            &[Endpoint {
                ip: LOCALHOST,
                port: osd_port,
            }],
        )
        .unwrap();

    // LOCATE tells the client which endpoint holds the byte range.
    let locate = LocateReq {
        user: "alice".to_string(),
        group: "users".to_string(),
        path: "/data/blob".to_string(),
        start: 0,
        len: u64::MAX,
    };
    let resp = client
        .mds_rpc(Msg::from_payload(MsgType::LocateReq, &locate))
        .unwrap();
    let located: LocateResp = resp.payload(MsgType::LocateResp).unwrap();
    assert_eq!(located.error, 0);
    assert_eq!(located.locs.len(), 1);
    let ep = located.locs[0].eps[0];
    assert_eq!((ep.ip, ep.port), (LOCALHOST, osd_port));

    // Push data to the located OSD, then read it back.
    let bs = Bsend::new(&mgr, 2, Duration::from_secs(10));
    let flush = OsdHflushReq {
        cid,
        flags: 0,
        data: Bytes::from_static(b"hello, chunk"),
    };
    bs.add(
        &client_msgr,
        BsendFlags::EXPECT_RESPONSE,
        Msg::from_payload(MsgType::OsdHflushReq, &flush),
        ep.ip,
        ep.port,
    )
    .unwrap();
    assert_eq!(bs.join().unwrap(), 1);
    let flushed = match bs.get(0).unwrap() {
        TranResult::Recv(m) => m,
        other => panic!("hflush failed: {:?}", other),
    };
    assert_eq!(flushed.resp_errno().unwrap(), 0);
    bs.reset();

    let read = OsdReadReq {
        cid,
        start: 0,
        len: 64,
    };
    bs.add(
        &client_msgr,
        BsendFlags::EXPECT_RESPONSE,
        Msg::from_payload(MsgType::OsdReadReq, &read),
        ep.ip,
        ep.port,
    )
    .unwrap();
    assert_eq!(bs.join().unwrap(), 1);
    let reply = match bs.get(0).unwrap() {
        TranResult::Recv(m) => m,
        other => panic!("read failed: {:?}", other),
    };
    let data: OsdReadResp = reply.payload(MsgType::OsdReadResp).unwrap();
    assert_eq!(data.error, 0);
    assert_eq!(&data.data[..], b"hello, chunk");
    bs.reset();

    // STAT over the wire agrees with what the store knows.
    let stat = StatReq {
        user: "alice".to_string(),
        group: "users".to_string(),
        path: "/data/blob".to_string(),
    };
    let resp = client
        .mds_rpc(Msg::from_payload(MsgType::StatReq, &stat))
        .unwrap();
    let st: StatResp = resp.payload(MsgType::StatResp).unwrap();
    assert_eq!(st.error, 0);
    let st = st.stat.unwrap();
    assert_eq!(st.owner, "alice");
    assert!(st.length > 0);

    client.disconnect();
    client_msgr.shutdown();
    mds_pool.join();
    mds_msgr.shutdown();
    osd_pool.join();
    osd_msgr.shutdown();
    store.shutdown();
}
