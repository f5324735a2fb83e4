//! Per-peer state: one [`Partner`] per remote (board, endpoint) pair
//! this endpoint has ever talked to or heard from.
//!
//! Session id rules (established by the connect handshake, §4.11):
//! `true_session_id` is the peer's id from the last connect reply we
//! processed and goes into ordinary outbound messages;
//! `back_session_id` is the peer's id from the last connect request *it*
//! sent us and goes into reverse-direction traffic (acks, pulls,
//! notifies) that must reach the peer's current incarnation even before
//! we connected back. A change of `back_session_id` means the peer
//! restarted: all state tied to the old incarnation is torn down.

use std::collections::VecDeque;

use omx_wire::Seq;

use crate::{
    queue::RequestQueue,
    recv::EarlyPacket,
    request::LinkKind,
};

/// Index into the endpoint's partner table:
/// `peer_index * endpoint_max + endpoint_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PartnerId(pub(crate) u32);

/// Whether the peer lives on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Localization {
    Local,
    Remote,
    /// Not yet learned from a connect exchange.
    Unknown,
}

/// Ack obligation towards a partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NeedAck {
    No,
    /// Flush once the ack delay elapses.
    Delayed,
    /// Flush at the next progression pass.
    Immediate,
}

/// Sentinel for a session id not learned yet.
pub(crate) const SESSION_UNSET: u32 = u32::MAX;

pub(crate) struct Partner {
    pub board_addr: u64,
    pub peer_index: u16,
    pub endpoint_index: u8,
    pub localization: Localization,
    pub rndv_threshold: u32,

    pub true_session_id: u32,
    pub back_session_id: u32,

    /// Handshake id of the next connect to this partner.
    pub connect_seqnum: u8,

    /// Ids of the last explicit ack sent and received.
    pub last_send_acknum: u64,
    pub last_recv_acknum: u64,

    /// Sends posted to the wire, waiting for an ack. Oldest first.
    pub non_acked_req_q: RequestQueue,
    /// Connects waiting for their reply.
    pub connect_req_q: RequestQueue,
    /// Matched mediums with fragments still missing, in seqnum order.
    pub partial_medium_recv_req_q: RequestQueue,
    /// Sends throttled by the seqnum window, FIFO.
    pub need_seqnum_send_req_q: RequestQueue,

    /// Inbound packets ahead of the expected seqnum, sorted.
    pub early_recv_q: VecDeque<EarlyPacket>,

    pub throttling_sends_nr: u32,

    /// Seqnum the next send will consume.
    pub next_send_seq: Seq,
    /// Oldest send seqnum not acked by the partner yet.
    pub next_acked_send_seq: Seq,
    /// Seqnum of the next new message to match.
    pub next_match_recv_seq: Seq,
    /// Seqnum of the next missing fragment; everything below has been
    /// fully received and may be acked back.
    pub next_frag_recv_seq: Seq,
    /// Upper bound of the last ack (piggybacked or explicit) we sent.
    pub last_acked_recv_seq: Seq,

    pub need_ack: NeedAck,
    /// Receive time of the oldest not-yet-acked message, driving the
    /// delayed-ack timer.
    pub oldest_recv_time_not_acked: u64,

    /// Opaque application cookie attached to this address.
    pub user_context: u64,
}

impl Partner {
    pub fn new(peer_index: u16, endpoint_index: u8, board_addr: u64) -> Self {
        let mut partner = Self {
            board_addr,
            peer_index,
            endpoint_index,
            localization: Localization::Unknown,
            rndv_threshold: 0,
            true_session_id: SESSION_UNSET,
            back_session_id: SESSION_UNSET,
            connect_seqnum: 0,
            last_send_acknum: 0,
            last_recv_acknum: 0,
            non_acked_req_q: RequestQueue::new(LinkKind::Partner),
            connect_req_q: RequestQueue::new(LinkKind::Partner),
            partial_medium_recv_req_q: RequestQueue::new(LinkKind::Partner),
            need_seqnum_send_req_q: RequestQueue::new(LinkKind::Partner),
            early_recv_q: VecDeque::new(),
            throttling_sends_nr: 0,
            next_send_seq: Seq(0),
            next_acked_send_seq: Seq(0),
            next_match_recv_seq: Seq(0),
            next_frag_recv_seq: Seq(0),
            last_acked_recv_seq: Seq(0),
            need_ack: NeedAck::No,
            oldest_recv_time_not_acked: 0,
            user_context: 0,
        };
        partner.reset();
        partner
    }

    /// Restores every volatile field for a fresh session while keeping
    /// the identity and localization.
    ///
    /// The caller guarantees the partner queues and the early-packet
    /// queue have been drained, and removes the partner from the
    /// endpoint ack/throttling lists if `need_ack` was set.
    pub fn reset(&mut self) {
        debug_assert!(self.non_acked_req_q.is_empty());
        debug_assert!(self.connect_req_q.is_empty());
        debug_assert!(self.partial_medium_recv_req_q.is_empty());
        debug_assert!(self.need_seqnum_send_req_q.is_empty());
        debug_assert!(self.early_recv_q.is_empty());

        self.true_session_id = SESSION_UNSET;
        self.back_session_id = SESSION_UNSET;
        // send seqnums stay unset until the peer's connect reply tells
        // us where to start
        self.next_send_seq = Seq(u16::MAX);
        self.next_acked_send_seq = Seq(u16::MAX);
        // receive seqnums restart at 1 inside the current epoch; the
        // connect exchange forces the sender to adopt them
        self.next_match_recv_seq = self.next_match_recv_seq.reset();
        self.next_frag_recv_seq = self.next_match_recv_seq;
        self.last_acked_recv_seq = self.next_frag_recv_seq;
        self.connect_seqnum = 0;
        self.last_send_acknum = 0;
        self.last_recv_acknum = 0;
        self.throttling_sends_nr = 0;
        self.need_ack = NeedAck::No;
        self.oldest_recv_time_not_acked = 0;
    }

    /// Moves the receive seqnums to a new epoch after a disconnect, so
    /// wandering packets of the dead session cannot alias into the new
    /// one.
    pub fn bump_session_epoch(&mut self) {
        self.next_match_recv_seq = Seq(self.next_match_recv_seq.0 ^ 0xb0f0).next_session();
        self.next_frag_recv_seq = Seq(self.next_frag_recv_seq.0 ^ 0x0f0f).next_session();
    }

    /// Number of seqnums sent and not yet acked.
    pub fn outstanding_sends(&self) -> u16 {
        self.next_send_seq.dist_from(self.next_acked_send_seq)
    }

    /// The cumulative ack value to advertise: everything below
    /// `next_frag_recv_seq` has been fully received.
    pub fn needed_ack(&self) -> Seq {
        self.next_frag_recv_seq
    }

    pub fn is_local(&self) -> bool {
        self.localization == Localization::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_keeps_identity_and_epoch() {
        let mut partner = Partner::new(3, 1, 0xaabb);
        partner.true_session_id = 42;
        partner.next_match_recv_seq = Seq(500);
        partner.reset();

        assert_eq!(partner.peer_index, 3);
        assert_eq!(partner.board_addr, 0xaabb);
        assert_eq!(partner.true_session_id, SESSION_UNSET);
        assert_eq!(partner.next_match_recv_seq.seqnum(), 1);
        assert_eq!(partner.next_frag_recv_seq, partner.next_match_recv_seq);
    }

    #[test]
    fn epoch_bump_changes_session() {
        let mut partner = Partner::new(0, 0, 0);
        let before = partner.next_match_recv_seq;
        partner.bump_session_epoch();
        assert!(!before.same_session(partner.next_match_recv_seq));
    }

    #[test]
    fn outstanding_window() {
        let mut partner = Partner::new(0, 0, 0);
        partner.next_acked_send_seq = Seq(10);
        partner.next_send_seq = Seq(14);
        assert_eq!(partner.outstanding_sends(), 4);
    }
}
