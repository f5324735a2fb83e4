//! Multi-fragment reassembly under adversarial fragment ordering.

mod common;

use common::{complete_on_a, complete_on_b, world};
use omx::driver::wire::{MediumFragTrailer, PacketType};
use omx::Status;

/// 16 KiB split into four 4 KiB fragments, delivered in the order
/// [2, 0, 3, 1] by dropping everything else per retransmission round.
#[test]
fn out_of_order_fragments_reassemble_once() {
    let mut w = world();
    let payload: Vec<u8> = (0..16384u32).map(|i| (i * 7) as u8).collect();
    let mut recv_buf = vec![0u8; 16384];

    let order = [2u8, 0, 3, 1];
    let mut next = 0usize;
    w.fabric.set_loss_filter(move |hdr, rest| {
        if hdr.ptype != PacketType::MediumFrag {
            return false;
        }
        let Ok(trailer) = MediumFragTrailer::decode(&mut &rest[..]) else {
            return false;
        };
        assert_eq!(trailer.frag_pipeline, 12);
        if next >= order.len() {
            // sequence done: let duplicates through, the receiver's
            // fragment mask discards them
            return false;
        }
        if trailer.frag_seqnum == order[next] {
            next += 1;
            false
        } else {
            true
        }
    });

    let recv = unsafe { w.b.irecv(&mut recv_buf, 0xbeef, u64::MAX, 0).unwrap() };
    let send = unsafe { w.a.isend(&payload, w.to_b, 0xbeef, 0).unwrap() };

    let rc = complete_on_b(&mut w, recv);
    assert_eq!(rc.code, Status::Success);
    assert_eq!(rc.msg_length, 16384);
    assert_eq!(rc.xfer_length, 16384);
    assert_eq!(recv_buf, payload);

    w.fabric.clear_loss_filter();
    assert_eq!(complete_on_a(&mut w, send).code, Status::Success);

    // exactly one completion: a second receive on the same match must
    // still be pending
    let mut other = vec![0u8; 16];
    let extra = unsafe { w.b.irecv(&mut other, 0xbeef, u64::MAX, 0).unwrap() };
    common::pump(&mut w, 100);
    assert!(w.b.test(extra).unwrap().is_none(), "message delivered twice");
    assert!(w.b.cancel(extra).unwrap());
    let cancelled = w.b.test(extra).unwrap().expect("cancelled completion");
    assert_eq!(cancelled.code, Status::Cancelled);
}
