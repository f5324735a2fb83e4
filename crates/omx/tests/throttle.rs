//! Seqnum-window throttling: posting more sends than the in-flight
//! window holds parks the excess, and acks drain them in order without
//! losing any.

mod common;

use common::world;
use omx::Status;

const WINDOW: usize = 1 << 13;

#[test]
fn floods_beyond_the_window_drain_in_order() {
    let mut w = world();
    let total = WINDOW + 200;

    let payloads: Vec<Vec<u8>> = (0..total as u64).map(|i| i.to_le_bytes().to_vec()).collect();
    let sends: Vec<_> = payloads
        .iter()
        .map(|p| unsafe { w.a.isend(p, w.to_b, 4, 0).unwrap() })
        .collect();

    // receive them one by one; every message must arrive, in order,
    // despite window throttling and event-ring overflows along the way
    for (i, expected) in payloads.iter().enumerate() {
        let mut buf = vec![0u8; 8];
        let recv = unsafe { w.b.irecv(&mut buf, 4, u64::MAX, 0).unwrap() };
        let mut done = false;
        for _ in 0..20_000 {
            w.a.progress().unwrap();
            w.b.progress().unwrap();
            if let Some(completion) = w.b.test(recv).unwrap() {
                assert_eq!(completion.code, Status::Success, "message {i}");
                done = true;
                break;
            }
            w.fabric.advance_jiffies(40);
        }
        assert!(done, "message {i} never arrived");
        assert_eq!(&buf, expected, "message {i} out of order");
    }

    for (i, send) in sends.into_iter().enumerate() {
        let completion = w.a.test(send).unwrap();
        let completion = match completion {
            Some(completion) => completion,
            None => common::complete_on_a(&mut w, send),
        };
        assert_eq!(completion.code, Status::Success, "send {i}");
    }
}
