//! End-to-end messenger tests over loopback TCP.

use fastlog::FastLogMgr;
use msgr::{
    Bsend, BsendFlags, Messenger, MsgrConf, RecvPool, Step, TranPayload, TranResult, TranState,
    Transactor,
};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wire::types::{Test30, Test31};
use wire::{Ferr, Msg, MsgType};

const LOCALHOST: u32 = 0x7f000001;
const RECV_WAIT: Duration = Duration::from_secs(10);

fn test_conf() -> MsgrConf {
    let mut conf = MsgrConf::new(FastLogMgr::new());
    conf.timeout_period = Duration::from_secs(1);
    conf.timeout_cnt_max = 60;
    conf
}

#[test]
fn init_and_shutdown() {
    let m = Messenger::new(test_conf());
    m.start().unwrap();
    m.shutdown();
    assert_eq!(m.live_trans(), 0);
}

#[test]
fn ping_rpc() {
    // Echo server: reply to every inbound message with the same payload.
    let server = Messenger::new(test_conf());
    let port = server
        .listen(
            0,
            Arc::new(|_conn: &msgr::ConnCtx, mut tr: Box<Transactor>| match tr.take_msg() {
                Some(msg) => {
                    let reply = Msg {
                        tran_id: 0,
                        rem_tran_id: 0,
                        ty: msg.ty,
                        data: msg.data,
                    };
                    Step::SendNext(tr, reply)
                }
                None => Step::Done,
            }),
        )
        .unwrap();
    server.start().unwrap();

    let client = Messenger::new(test_conf());
    client.start().unwrap();

    let (tx, rx) = mpsc::channel();
    let tx = Arc::new(Mutex::new(tx));
    let cb = {
        let tx = tx.clone();
        Arc::new(move |_conn: &msgr::ConnCtx, mut tr: Box<Transactor>| {
            if let TranPayload::Err(e) = &tr.payload {
                tx.lock().unwrap().send(Err(*e)).unwrap();
                return Step::Done;
            }
            match tr.state {
                TranState::Sent => {
                    tx.lock().unwrap().send(Ok(None)).unwrap();
                    Step::RecvNext(tr)
                }
                TranState::Recv => {
                    let msg = tr.take_msg();
                    tx.lock().unwrap().send(Ok(msg)).unwrap();
                    Step::Done
                }
                _ => Step::Done,
            }
        })
    };

    let tr = client.alloc_tran(cb).unwrap();
    let payload = Msg::from_payload(MsgType::Test30, &Test30 { x: 11, y: 22 });
    client.send(tr, LOCALHOST, port, payload);

    // Sent fires first, then Recv with an identical payload.
    let first = rx.recv_timeout(RECV_WAIT).unwrap().unwrap();
    assert!(first.is_none());
    let second = rx.recv_timeout(RECV_WAIT).unwrap().unwrap();
    let echoed = second.expect("expected an echoed message");
    let t: Test30 = echoed.payload(MsgType::Test30).unwrap();
    assert_eq!((t.x, t.y), (11, 22));

    client.shutdown();
    server.shutdown();
    assert_eq!(client.live_trans(), 0);
    assert_eq!(server.live_trans(), 0);
}

/// Spin up an arithmetic server: TEST30 { x, y } -> TEST31 { z = x + y },
/// answered by receive-pool workers replying through bsend.
fn arithmetic_server() -> (Arc<Messenger>, RecvPool, u16) {
    let mgr = FastLogMgr::new();
    let mut conf = MsgrConf::new(mgr.clone());
    conf.timeout_period = Duration::from_secs(1);
    conf.timeout_cnt_max = 60;
    let server = Messenger::new(conf);
    let pool = RecvPool::new();
    let port = server.listen(0, pool.listen_cb()).unwrap();
    server.start().unwrap();

    for i in 0..2 {
        let server = server.clone();
        let mgr = mgr.clone();
        let handler = move |mut tr: Box<Transactor>| {
            let Some(msg) = tr.take_msg() else { return };
            let Ok(req) = msg.payload::<Test30>(MsgType::Test30) else {
                return;
            };
            let reply = Msg::from_payload(MsgType::Test31, &Test31 { z: req.x + req.y });
            let ctx = Bsend::new(&mgr, 1, Duration::from_secs(10));
            if ctx.add_tr(&server, BsendFlags::empty(), reply, tr).is_ok() {
                let _ = ctx.join();
            }
            ctx.reset();
        };
        pool.spawn_worker(&format!("arith{}", i), Arc::new(handler))
            .unwrap();
    }
    (server, pool, port)
}

#[test]
fn arithmetic_echo() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (server, pool, port) = arithmetic_server();
    let mgr = FastLogMgr::new();
    let mut conf = MsgrConf::new(mgr.clone());
    conf.timeout_period = Duration::from_secs(1);
    conf.timeout_cnt_max = 60;
    let client = Messenger::new(conf);
    client.start().unwrap();

    let bs = Bsend::new(&mgr, 4, Duration::from_secs(10));
    let req = Msg::from_payload(MsgType::Test30, &Test30 { x: 5, y: 1 });
    bs.add(&client, BsendFlags::EXPECT_RESPONSE, req, LOCALHOST, port)
        .unwrap();
    assert_eq!(bs.join().unwrap(), 1);

    let resp = match bs.get(0).unwrap() {
        TranResult::Recv(m) => m,
        other => panic!("expected a response, got {:?}", other),
    };
    let t: Test31 = resp.payload(MsgType::Test31).unwrap();
    assert_eq!(t.z, 6);

    bs.reset();
    client.shutdown();
    pool.join();
    server.shutdown();
    assert_eq!(client.live_trans(), 0);
}

#[test]
fn bsend_fan_out() {
    let (server, pool, port) = arithmetic_server();
    let mgr = FastLogMgr::new();
    let mut conf = MsgrConf::new(mgr.clone());
    conf.timeout_period = Duration::from_secs(1);
    conf.timeout_cnt_max = 60;
    let client = Messenger::new(conf);
    client.start().unwrap();

    let n = 8u32;
    let bs = Bsend::new(&mgr, n as usize, Duration::from_secs(10));
    for x in 0..n {
        let req = Msg::from_payload(MsgType::Test30, &Test30 { x, y: 100 });
        bs.add(&client, BsendFlags::EXPECT_RESPONSE, req, LOCALHOST, port)
            .unwrap();
    }
    // One more than max_tr must be refused.
    let extra = Msg::from_payload(MsgType::Test30, &Test30 { x: 0, y: 0 });
    assert_eq!(
        bs.add(&client, BsendFlags::EXPECT_RESPONSE, extra, LOCALHOST, port),
        Err(Ferr::MFile)
    );

    assert_eq!(bs.join().unwrap(), n as usize);
    for x in 0..n {
        let resp = match bs.get(x as usize).unwrap() {
            TranResult::Recv(m) => m,
            other => panic!("slot {} not answered: {:?}", x, other),
        };
        let t: Test31 = resp.payload(MsgType::Test31).unwrap();
        assert_eq!(t.z, x + 100);
    }

    bs.reset();
    client.shutdown();
    pool.join();
    server.shutdown();
}

#[test]
fn sends_complete_in_enqueue_order() {
    // Server that consumes inbound messages without replying.
    let server = Messenger::new(test_conf());
    let port = server
        .listen(
            0,
            Arc::new(|_conn: &msgr::ConnCtx, _tr: Box<Transactor>| Step::Done),
        )
        .unwrap();
    server.start().unwrap();

    let client = Messenger::new(test_conf());
    client.start().unwrap();

    let k = 16u32;
    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    let tx = Arc::new(Mutex::new(tx));
    for i in 0..k {
        let order = order.clone();
        let tx = tx.clone();
        let cb = Arc::new(move |_conn: &msgr::ConnCtx, tr: Box<Transactor>| {
            if tr.state == TranState::Sent {
                order.lock().unwrap().push(i);
                tx.lock().unwrap().send(()).unwrap();
            }
            Step::Done
        });
        let tr = client.alloc_tran(cb).unwrap();
        let msg = Msg::from_payload(MsgType::Test30, &Test30 { x: i, y: 0 });
        client.send(tr, LOCALHOST, port, msg);
    }
    for _ in 0..k {
        rx.recv_timeout(RECV_WAIT).unwrap();
    }
    let got = order.lock().unwrap().clone();
    assert_eq!(got, (0..k).collect::<Vec<_>>());

    client.shutdown();
    server.shutdown();
}

#[test]
fn unanswered_rpc_times_out_with_connection() {
    // Server keeps the transactor open but never replies.
    let server = Messenger::new(test_conf());
    let port = server
        .listen(
            0,
            Arc::new(|_conn: &msgr::ConnCtx, tr: Box<Transactor>| Step::RecvNext(tr)),
        )
        .unwrap();
    server.start().unwrap();

    let mgr = FastLogMgr::new();
    let mut conf = MsgrConf::new(mgr.clone());
    conf.timeout_period = Duration::from_millis(200);
    conf.timeout_cnt_max = 2;
    let client = Messenger::new(conf);
    client.start().unwrap();

    let bs = Bsend::new(&mgr, 1, Duration::from_secs(10));
    let req = Msg::from_payload(MsgType::Test30, &Test30 { x: 1, y: 2 });
    bs.add(&client, BsendFlags::EXPECT_RESPONSE, req, LOCALHOST, port)
        .unwrap();
    assert_eq!(bs.join().unwrap(), 1);
    match bs.get(0).unwrap() {
        TranResult::Failed(e) => assert_eq!(e, Ferr::TimedOut),
        other => panic!("expected a timeout, got {:?}", other),
    }

    bs.reset();
    client.shutdown();
    server.shutdown();
}

#[test]
fn cancel_poisons_the_whole_batch() {
    let (server, pool, port) = arithmetic_server();
    let mgr = FastLogMgr::new();
    let mut conf = MsgrConf::new(mgr.clone());
    conf.timeout_period = Duration::from_secs(1);
    conf.timeout_cnt_max = 60;
    let client = Messenger::new(conf);
    client.start().unwrap();

    let bs = Bsend::new(&mgr, 4, Duration::from_secs(10));
    let req = Msg::from_payload(MsgType::Test30, &Test30 { x: 1, y: 1 });
    bs.add(&client, BsendFlags::EXPECT_RESPONSE, req, LOCALHOST, port)
        .unwrap();
    bs.cancel();

    assert_eq!(bs.join(), Err(Ferr::Canceled));
    // Cancellation is atomic across the batch: even a slot that had
    // already completed reads ECANCELED.
    match bs.get(0).unwrap() {
        TranResult::Failed(e) => assert_eq!(e, Ferr::Canceled),
        other => panic!("expected cancellation, got {:?}", other),
    }
    let late = Msg::from_payload(MsgType::Test30, &Test30 { x: 2, y: 2 });
    assert_eq!(
        bs.add(&client, BsendFlags::EXPECT_RESPONSE, late, LOCALHOST, port),
        Err(Ferr::Canceled)
    );

    // reset re-arms the context for a fresh batch.
    bs.reset();
    let again = Msg::from_payload(MsgType::Test30, &Test30 { x: 2, y: 2 });
    bs.add(&client, BsendFlags::EXPECT_RESPONSE, again, LOCALHOST, port)
        .unwrap();
    assert_eq!(bs.join().unwrap(), 1);
    match bs.get(0).unwrap() {
        TranResult::Recv(m) => {
            let t: Test31 = m.payload(MsgType::Test31).unwrap();
            assert_eq!(t.z, 4);
        }
        other => panic!("expected a response, got {:?}", other),
    }

    bs.reset();
    client.shutdown();
    pool.join();
    server.shutdown();
}

#[test]
fn shutdown_fails_outstanding_transactors() {
    let server = Messenger::new(test_conf());
    let port = server
        .listen(
            0,
            Arc::new(|_conn: &msgr::ConnCtx, tr: Box<Transactor>| Step::RecvNext(tr)),
        )
        .unwrap();
    server.start().unwrap();

    let client = Messenger::new(test_conf());
    client.start().unwrap();

    let (tx, rx) = mpsc::channel::<Result<(), Ferr>>();
    let tx = Arc::new(Mutex::new(tx));
    let cb = {
        let tx = tx.clone();
        Arc::new(move |_conn: &msgr::ConnCtx, tr: Box<Transactor>| {
            match &tr.payload {
                TranPayload::Err(e) => {
                    tx.lock().unwrap().send(Err(*e)).unwrap();
                    Step::Done
                }
                _ => match tr.state {
                    // Wait forever for a reply that will never come.
                    TranState::Sent => Step::RecvNext(tr),
                    _ => Step::Done,
                },
            }
        })
    };
    let tr = client.alloc_tran(cb).unwrap();
    let msg = Msg::from_payload(MsgType::Test30, &Test30 { x: 0, y: 0 });
    client.send(tr, LOCALHOST, port, msg);

    // Give the send a moment to land, then pull the rug out.
    std::thread::sleep(Duration::from_millis(200));
    client.shutdown();
    assert_eq!(rx.recv_timeout(RECV_WAIT).unwrap(), Err(Ferr::Shutdown));
    assert_eq!(client.live_trans(), 0);
    server.shutdown();
}
