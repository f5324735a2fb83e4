//! End-to-end message exchange over the simulated fabric: one message
//! per mode, ordering, truncation, unexpected buffering, and self
//! communication.

mod common;

use common::{complete_on_a, complete_on_b, pump, world};
use omx::Status;

#[test]
fn tiny_round_trip() {
    let mut w = world();
    let payload = b"hello".to_vec();
    let mut recv_buf = vec![0u8; 64];

    let recv = unsafe {
        w.b.irecv(&mut recv_buf, 0x1234_5678_8765_4321, u64::MAX, 7)
            .unwrap()
    };
    let send = unsafe {
        w.a.isend(&payload, w.to_b, 0x1234_5678_8765_4321, 0)
            .unwrap()
    };

    let sc = complete_on_a(&mut w, send);
    assert_eq!(sc.code, Status::Success);

    let rc = complete_on_b(&mut w, recv);
    assert_eq!(rc.code, Status::Success);
    assert_eq!(rc.match_info, 0x1234_5678_8765_4321);
    assert_eq!(rc.msg_length, 5);
    assert_eq!(rc.xfer_length, 5);
    assert_eq!(rc.context, 7);
    assert_eq!(&recv_buf[..5], b"hello");
}

#[test]
fn small_round_trip() {
    let mut w = world();
    let payload: Vec<u8> = (0..100u8).collect();
    let mut recv_buf = vec![0u8; 100];

    let recv = unsafe { w.b.irecv(&mut recv_buf, 42, u64::MAX, 0).unwrap() };
    let send = unsafe { w.a.isend(&payload, w.to_b, 42, 0).unwrap() };

    assert_eq!(complete_on_a(&mut w, send).code, Status::Success);
    assert_eq!(complete_on_b(&mut w, recv).code, Status::Success);
    assert_eq!(recv_buf, payload);
}

#[test]
fn medium_round_trip() {
    let mut w = world();
    let payload: Vec<u8> = (0..16384u32).map(|i| i as u8).collect();
    let mut recv_buf = vec![0u8; 16384];

    let recv = unsafe { w.b.irecv(&mut recv_buf, 42, u64::MAX, 0).unwrap() };
    let send = unsafe { w.a.isend(&payload, w.to_b, 42, 0).unwrap() };

    assert_eq!(complete_on_a(&mut w, send).code, Status::Success);
    let rc = complete_on_b(&mut w, recv);
    assert_eq!(rc.code, Status::Success);
    assert_eq!(rc.msg_length, 16384);
    assert_eq!(recv_buf, payload);
}

#[test]
fn zero_length_send() {
    let mut w = world();
    let mut recv_buf = vec![0u8; 4];

    let recv = unsafe { w.b.irecv(&mut recv_buf, 9, u64::MAX, 0).unwrap() };
    let send = unsafe { w.a.isend(&[], w.to_b, 9, 0).unwrap() };

    assert_eq!(complete_on_a(&mut w, send).code, Status::Success);
    let rc = complete_on_b(&mut w, recv);
    assert_eq!(rc.code, Status::Success);
    assert_eq!(rc.msg_length, 0);
    assert_eq!(rc.xfer_length, 0);
}

#[test]
fn truncated_receive() {
    let mut w = world();
    let payload = vec![0x5a_u8; 1024];
    let mut recv_buf = vec![0u8; 512];

    let recv = unsafe { w.b.irecv(&mut recv_buf, 1, u64::MAX, 0).unwrap() };
    let send = unsafe { w.a.isend(&payload, w.to_b, 1, 0).unwrap() };

    assert_eq!(complete_on_a(&mut w, send).code, Status::Success);
    let rc = complete_on_b(&mut w, recv);
    assert_eq!(rc.code, Status::MessageTruncated);
    assert_eq!(rc.msg_length, 1024);
    assert_eq!(rc.xfer_length, 512);
    assert!(recv_buf.iter().all(|&b| b == 0x5a));
}

#[test]
fn sends_complete_in_submission_order() {
    let mut w = world();
    // mixed sizes on the same pair still complete in submission order
    // at the receiver
    let payloads: Vec<Vec<u8>> = vec![
        vec![1u8; 8],     // tiny
        vec![2u8; 100],   // small
        vec![3u8; 10000], // medium
        vec![4u8; 16],    // tiny
    ];
    let sends: Vec<_> = payloads
        .iter()
        .map(|p| unsafe { w.a.isend(p, w.to_b, 77, 0).unwrap() })
        .collect();

    for (i, expected) in payloads.iter().enumerate() {
        let mut buf = vec![0u8; expected.len()];
        let recv = unsafe { w.b.irecv(&mut buf, 77, u64::MAX, 0).unwrap() };
        let rc = complete_on_b(&mut w, recv);
        assert_eq!(rc.code, Status::Success, "message {i}");
        assert_eq!(&buf, expected, "message {i} out of order");
    }
    for send in sends {
        assert_eq!(complete_on_a(&mut w, send).code, Status::Success);
    }
}

#[test]
fn probe_then_recv_agree_on_unexpected() {
    let mut w = world();
    let payload = b"first".to_vec();
    let later = b"later".to_vec();

    let s1 = unsafe { w.a.isend(&payload, w.to_b, 5, 0).unwrap() };
    let s2 = unsafe { w.a.isend(&later, w.to_b, 5, 0).unwrap() };
    pump(&mut w, 50);

    // both are buffered unexpected on B; probe sees the first one
    let probed = w.b.iprobe(5, u64::MAX).unwrap().expect("message pending");
    assert_eq!(probed.msg_length, 5);
    assert_eq!(probed.match_info, 5);

    // and the matching receive takes that same first message
    let mut buf = vec![0u8; 16];
    let recv = unsafe { w.b.irecv(&mut buf, 5, u64::MAX, 0).unwrap() };
    let rc = complete_on_b(&mut w, recv);
    assert_eq!(rc.code, Status::Success);
    assert_eq!(&buf[..5], b"first");

    let mut buf2 = vec![0u8; 16];
    let recv2 = unsafe { w.b.irecv(&mut buf2, 5, u64::MAX, 0).unwrap() };
    complete_on_b(&mut w, recv2);
    assert_eq!(&buf2[..5], b"later");

    complete_on_a(&mut w, s1);
    complete_on_a(&mut w, s2);
}

#[test]
fn matching_respects_mask() {
    let mut w = world();
    let mut buf_a = vec![0u8; 8];
    let mut buf_b = vec![0u8; 8];

    // a receive pinned to 0x0600.. only takes the second message
    let pinned = unsafe { w.b.irecv(&mut buf_a, 0x0600, 0xff00, 0).unwrap() };
    let other = unsafe { w.b.irecv(&mut buf_b, 0, 0, 0).unwrap() };

    let s1 = unsafe { w.a.isend(b"wrong!!!", w.to_b, 0x0733, 0).unwrap() };
    let s2 = unsafe { w.a.isend(b"right!!!", w.to_b, 0x0644, 0).unwrap() };

    let rc = complete_on_b(&mut w, pinned);
    assert_eq!(rc.match_info, 0x0644);
    assert_eq!(&buf_a, b"right!!!");

    let rc = complete_on_b(&mut w, other);
    assert_eq!(rc.match_info, 0x0733);
    assert_eq!(&buf_b, b"wrong!!!");

    complete_on_a(&mut w, s1);
    complete_on_a(&mut w, s2);
}

#[test]
fn self_send_matches_posted_receive() {
    let mut w = world();
    let me = w.a.addr();
    let payload = b"loopback".to_vec();
    let mut buf = vec![0u8; 8];

    let recv = unsafe { w.a.irecv(&mut buf, 3, u64::MAX, 0).unwrap() };
    let send = unsafe { w.a.isend(&payload, me, 3, 0).unwrap() };

    // self communication completes without any fabric traffic
    let sc = w.a.test(send).unwrap().expect("send complete");
    assert_eq!(sc.code, Status::Success);
    let rc = w.a.test(recv).unwrap().expect("recv complete");
    assert_eq!(rc.code, Status::Success);
    assert_eq!(&buf, b"loopback");
}

#[test]
fn self_send_buffers_when_unexpected() {
    let mut w = world();
    let me = w.a.addr();
    let payload = b"kept".to_vec();

    let send = unsafe { w.a.isend(&payload, me, 11, 0).unwrap() };
    assert!(w.a.test(send).unwrap().is_none(), "waits for the receive");

    let mut buf = vec![0u8; 4];
    let recv = unsafe { w.a.irecv(&mut buf, 11, u64::MAX, 0).unwrap() };
    let rc = w.a.test(recv).unwrap().expect("recv complete");
    assert_eq!(rc.code, Status::Success);
    assert_eq!(&buf, b"kept");
    let sc = w.a.test(send).unwrap().expect("send complete");
    assert_eq!(sc.code, Status::Success);
}

#[test]
fn peek_returns_oldest_completion() {
    let mut w = world();
    let p1 = vec![1u8; 4];
    let p2 = vec![2u8; 4];
    let s1 = unsafe { w.a.isend(&p1, w.to_b, 1, 101).unwrap() };
    let s2 = unsafe { w.a.isend(&p2, w.to_b, 2, 102).unwrap() };
    pump(&mut w, 50);

    let peeked = w.a.peek(Some(1000)).unwrap();
    assert_eq!(peeked, s1);
    let c1 = w.a.test(s1).unwrap().expect("done");
    assert_eq!(c1.context, 101);
    let c2 = w.a.test(s2).unwrap().expect("done");
    assert_eq!(c2.context, 102);
}
