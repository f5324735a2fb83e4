//! Context-id partitioning of the match space.

mod common;

use common::{complete_on_a, complete_on_b, pump, world_with};
use omx::{EndpointParams, Status};

const CTXID_SHIFT: u8 = 56;

fn params() -> EndpointParams {
    EndpointParams {
        ctxid_bits: Some(4),
        ctxid_shift: Some(CTXID_SHIFT),
    }
}

fn in_ctx(ctx: u64, low: u64) -> u64 {
    (ctx << CTXID_SHIFT) | low
}

#[test]
fn receives_only_match_their_context() {
    let mut w = world_with(params());
    let mut buf1 = vec![0u8; 8];
    let mut buf2 = vec![0u8; 8];

    // mask pins the context bits, so each receive lives in its lane
    let recv1 = unsafe { w.b.irecv(&mut buf1, in_ctx(1, 5), u64::MAX, 0).unwrap() };
    let recv2 = unsafe { w.b.irecv(&mut buf2, in_ctx(2, 5), u64::MAX, 0).unwrap() };

    let p2 = b"context2".to_vec();
    let s2 = unsafe { w.a.isend(&p2, w.to_b, in_ctx(2, 5), 0).unwrap() };
    let rc = complete_on_b(&mut w, recv2);
    assert_eq!(rc.code, Status::Success);
    assert_eq!(&buf2, b"context2");

    // the context-1 receive is untouched
    pump(&mut w, 50);
    assert!(w.b.test(recv1).unwrap().is_none());

    let p1 = b"context1".to_vec();
    let s1 = unsafe { w.a.isend(&p1, w.to_b, in_ctx(1, 5), 0).unwrap() };
    let rc = complete_on_b(&mut w, recv1);
    assert_eq!(rc.code, Status::Success);
    assert_eq!(&buf1, b"context1");

    complete_on_a(&mut w, s1);
    complete_on_a(&mut w, s2);
}

#[test]
fn partial_context_mask_is_rejected() {
    let mut w = world_with(params());
    let mut buf = vec![0u8; 8];
    // covers only half the context bits: neither pinned nor wildcard
    let mask = (0x3u64 << CTXID_SHIFT) | 0xffff;
    let err = unsafe { w.b.irecv(&mut buf, 0, mask, 0) };
    assert!(matches!(err, Err(omx::Error::BadMatchingForContextIdMask)));
}

#[test]
fn wildcard_receive_matches_across_contexts() {
    let mut w = world_with(params());
    let mut buf = vec![0u8; 8];

    // mask ignores the context bits entirely
    let low_mask = (1u64 << CTXID_SHIFT) - 1;
    let recv = unsafe { w.b.irecv(&mut buf, 5, low_mask, 0).unwrap() };

    let payload = b"anyctxid".to_vec();
    let send = unsafe { w.a.isend(&payload, w.to_b, in_ctx(7, 5), 0).unwrap() };
    let rc = complete_on_b(&mut w, recv);
    assert_eq!(rc.code, Status::Success);
    assert_eq!(rc.match_info, in_ctx(7, 5));
    assert_eq!(&buf, b"anyctxid");
    complete_on_a(&mut w, send);
}

#[test]
fn wildcard_test_any_observes_arrival_order() {
    let mut w = world_with(params());
    let mut buf1 = vec![0u8; 8];
    let mut buf2 = vec![0u8; 8];

    let _recv2 = unsafe { w.b.irecv(&mut buf2, in_ctx(2, 9), u64::MAX, 202).unwrap() };
    let _recv1 = unsafe { w.b.irecv(&mut buf1, in_ctx(1, 9), u64::MAX, 101).unwrap() };

    // context 2 first, context 1 second
    let p2 = b"ctx2-1st".to_vec();
    let p1 = b"ctx1-2nd".to_vec();
    let s2 = unsafe { w.a.isend(&p2, w.to_b, in_ctx(2, 9), 0).unwrap() };
    let s1 = unsafe { w.a.isend(&p1, w.to_b, in_ctx(1, 9), 0).unwrap() };
    pump(&mut w, 100);

    // a wildcard test_any drains completions in arrival order across
    // contexts
    let first = w.b.test_any(0, 0).unwrap().expect("first completion");
    assert_eq!(first.context, 202);
    let second = w.b.test_any(0, 0).unwrap().expect("second completion");
    assert_eq!(second.context, 101);

    complete_on_a(&mut w, s1);
    complete_on_a(&mut w, s2);
}
