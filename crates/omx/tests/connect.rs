//! Handshake outcomes: key validation, reconnection after a refusal,
//! and session safety across a peer restart.

mod common;

use common::{open_pair, BOARD_A, BOARD_B};
use omx::driver::wire::PacketType;
use omx::{driver::sim::SimFabric, Endpoint, EndpointParams, RequestId, Status};

fn pump2(a: &mut Endpoint, b: &mut Endpoint, rounds: usize) {
    for _ in 0..rounds {
        a.progress().unwrap();
        b.progress().unwrap();
    }
}

fn finish(a: &mut Endpoint, b: &mut Endpoint, fabric: &SimFabric, req: RequestId) -> omx::Completion {
    for _ in 0..20_000 {
        a.progress().unwrap();
        b.progress().unwrap();
        if let Some(completion) = a.test(req).unwrap() {
            return completion;
        }
        fabric.advance_jiffies(1);
    }
    panic!("request did not complete");
}

#[test]
fn bad_key_is_refused_then_good_key_connects() {
    let _ = omx::init();
    let fabric = SimFabric::new();
    fabric.add_board(BOARD_A, "host-a");
    fabric.add_board(BOARD_B, "host-b");
    let mut a = Endpoint::open(
        Box::new(fabric.open_endpoint(0, 0).unwrap()),
        0xaaaa,
        EndpointParams::default(),
    )
    .unwrap();
    let mut b = Endpoint::open(
        Box::new(fabric.open_endpoint(1, 0).unwrap()),
        0xbbbb,
        EndpointParams::default(),
    )
    .unwrap();

    let wrong = a.iconnect(BOARD_B, 0, 0xaaaa, 0).unwrap();
    let completion = finish(&mut a, &mut b, &fabric, wrong);
    assert_eq!(completion.code, Status::RemoteEndpointBadConnectionKey);

    // the refusal left nothing behind that breaks a correct connect
    let right = a.iconnect(BOARD_B, 0, 0xbbbb, 0).unwrap();
    let completion = finish(&mut a, &mut b, &fabric, right);
    assert_eq!(completion.code, Status::Success);

    let to_b = completion.addr;
    assert_eq!(to_b.nic_id(), BOARD_B);
    let payload = b"post-connect".to_vec();
    let mut buf = vec![0u8; 16];
    let recv = unsafe { b.irecv(&mut buf, 1, u64::MAX, 0).unwrap() };
    let send = unsafe { a.isend(&payload, to_b, 1, 0).unwrap() };
    pump2(&mut a, &mut b, 100);
    assert!(a.test(send).unwrap().is_some());
    assert!(b.test(recv).unwrap().is_some());
    assert_eq!(&buf[..payload.len()], &payload[..]);
}

#[test]
fn peer_restart_fails_old_sends_and_establishes_new_session() {
    let (fabric, mut a, mut b) = open_pair(EndpointParams::default());
    let to_b = common::connect(&mut a, &mut b, BOARD_B, common::KEY);
    let _to_a = common::connect(&mut b, &mut a, BOARD_A, common::KEY);

    // sends towards B that will never be acked
    fabric.set_loss_filter(|hdr, _| {
        matches!(
            hdr.ptype,
            PacketType::Tiny | PacketType::Rndv | PacketType::Liback
        )
    });
    let payload = b"stranded".to_vec();
    let stranded = unsafe { a.isend(&payload, to_b, 2, 0).unwrap() };
    a.progress().unwrap();
    // completed early (the payload is buffered), but still unacked
    // inside the protocol
    assert!(a.test(stranded).unwrap().is_some());
    // a synchronous one stays visibly pending
    let stranded_sync = unsafe { a.issend(&payload, to_b, 22, 0).unwrap() };
    assert!(a.test(stranded_sync).unwrap().is_none());

    // B restarts: new incarnation, new session id
    b.close().unwrap();
    let mut b2 = Endpoint::open(
        Box::new(fabric.open_endpoint(1, 0).unwrap()),
        common::KEY,
        EndpointParams::default(),
    )
    .unwrap();
    fabric.clear_loss_filter();

    // the new instance connects to A; A notices the session change,
    // resets the old partner state, and fails the queued send locally
    let req = b2.iconnect(BOARD_A, 0, common::KEY, 0).unwrap();
    let completion = finish(&mut b2, &mut a, &fabric, req);
    assert_eq!(completion.code, Status::Success);
    let failed = a
        .test(stranded_sync)
        .unwrap()
        .expect("cleanup completed the stranded send");
    assert_eq!(failed.code, Status::RemoteEndpointUnreachable);

    // A must reconnect to reach the new incarnation; the old address
    // carries the dead session id
    let req = a.iconnect(BOARD_B, 0, common::KEY, 0).unwrap();
    let completion = finish(&mut a, &mut b2, &fabric, req);
    assert_eq!(completion.code, Status::Success);
    let to_b2 = completion.addr;

    let fresh = b"fresh".to_vec();
    let mut buf = vec![0u8; 8];
    let recv = unsafe { b2.irecv(&mut buf, 3, u64::MAX, 0).unwrap() };
    let send = unsafe { a.isend(&fresh, to_b2, 3, 0).unwrap() };
    pump2(&mut a, &mut b2, 100);
    assert!(a.test(send).unwrap().is_some());
    assert!(b2.test(recv).unwrap().is_some());
    assert_eq!(&buf[..5], b"fresh");

    // and the stranded payload never surfaced on the new instance
    let mut ghost = vec![0u8; 16];
    let extra = unsafe { b2.irecv(&mut ghost, 2, u64::MAX, 0).unwrap() };
    pump2(&mut a, &mut b2, 100);
    assert!(b2.test(extra).unwrap().is_none());
    assert!(b2.cancel(extra).unwrap());
    b2.test(extra).unwrap().expect("cancelled completion");
}

#[test]
fn connect_to_self_is_immediate() {
    let (_fabric, mut a, _b) = open_pair(EndpointParams::default());
    let req = a.iconnect(BOARD_A, 0, common::KEY, 0).unwrap();
    let completion = a.test(req).unwrap().expect("self connect is synchronous");
    assert_eq!(completion.code, Status::Success);
    assert_eq!(completion.addr.nic_id(), BOARD_A);
}
