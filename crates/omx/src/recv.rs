//! The receive pipeline: per-partner ordering, matching, unexpected
//! buffering, early-packet replay, and multi-fragment reassembly.
//!
//! Every inbound lib-level message carries a seqnum. Against the
//! partner's counters it is either in-window (match or accumulate),
//! early (stash sorted for replay once the gap closes), or obsolete
//! (drop; if it sits exactly one below the window, the peer apparently
//! lost our ack, so schedule an immediate one).

use omx_driver::abi::{SendNotify, TINY_MAX};
use omx_wire::Seq;
use tracing::trace;

use crate::{
    endpoint::{Endpoint, ProgressionDisabled, UnexpHandlerAction, UnexpMessage},
    error::{Error, Status},
    partner::PartnerId,
    request::{
        LargeRecv, MediumRecv, RecvData, RecvKind, Request, RequestData, RequestId, RequestState,
        RequestType,
    },
    segment::{Segment, SegmentList},
};

/// How far ahead of the expected seqnum an inbound packet may be and
/// still be stashed as early; anything further is a wrap-around
/// artifact and is dropped.
pub(crate) const EARLY_PACKET_OFFSET_MAX: u16 = 255;

/// A normalized inbound lib-level message, independent of which event
/// record carried it.
#[derive(Debug, Clone)]
pub(crate) struct InboundMsg {
    pub peer_index: u16,
    pub src_endpoint: u8,
    pub seqnum: Seq,
    pub piggyack: Seq,
    pub match_info: u64,
    pub msg_length: u32,
    pub kind: InboundKind,
}

#[derive(Debug, Clone)]
pub(crate) enum InboundKind {
    Tiny,
    Small,
    MediumFrag {
        frag_length: u16,
        frag_seqnum: u8,
        frag_pipeline: u8,
    },
    Rndv {
        rdma_id: u8,
        rdma_seqnum: u8,
        rdma_offset: u16,
    },
    Notify {
        length: u32,
        pulled_rdma_id: u8,
        pulled_rdma_seqnum: u8,
    },
}

/// An early packet staged on its partner until the seqnum gap closes.
pub(crate) struct EarlyPacket {
    pub msg: InboundMsg,
    pub data: Box<[u8]>,
}

impl Endpoint {
    /// Posts a receive for a message whose match information satisfies
    /// `incoming & match_mask == match_info`.
    ///
    /// # Safety
    ///
    /// `buffer` must stay valid (and not be read or written by the
    /// application) until the returned request completes.
    pub unsafe fn irecv(
        &mut self,
        buffer: &mut [u8],
        match_info: u64,
        match_mask: u64,
        context: u64,
    ) -> Result<RequestId, Error> {
        let segs = SegmentList::from_mut_slice(buffer);
        self.irecv_segs(segs, match_info, match_mask, context)
    }

    /// Vectorial form of [`Endpoint::irecv`].
    ///
    /// # Safety
    ///
    /// Every segment must stay valid until completion.
    pub unsafe fn irecvv(
        &mut self,
        segments: &[Segment],
        match_info: u64,
        match_mask: u64,
        context: u64,
    ) -> Result<RequestId, Error> {
        let segs = SegmentList::from_segments(segments)?;
        self.irecv_segs(segs, match_info, match_mask, context)
    }

    fn irecv_segs(
        &mut self,
        segs: SegmentList,
        match_info: u64,
        match_mask: u64,
        context: u64,
    ) -> Result<RequestId, Error> {
        if match_info & !match_mask != 0 {
            return Err(Error::BadMatchMask);
        }
        // the mask must either pin the whole context-id field or ignore
        // it entirely (wildcard)
        let covered = match_mask & self.ctxid_mask;
        if covered != self.ctxid_mask && covered != 0 {
            return Err(Error::BadMatchingForContextIdMask);
        }
        let wildcard = self.has_ctxids() && covered == 0;

        // a pending unexpected message may already match
        if let Some(unexp) = self.match_unexp(match_info, match_mask) {
            let id = self.deliver_matched_unexp(unexp, segs, context);
            return Ok(id);
        }

        let mut req = Request::new(
            RequestType::Recv,
            RequestData::Recv(RecvData {
                segs,
                match_info,
                match_mask,
                seqnum: Seq(0),
                unexp_buffer: None,
                kind: RecvKind::Basic(MediumRecv::default()),
            }),
        );
        req.state = RequestState::RECV_NEED_MATCHING;
        req.status.context = context;
        let id = self.reqs.alloc(req);

        if wildcard {
            self.anyctxid_recv_req_q.push_back(&mut self.reqs, id);
        } else {
            let ctxid = self.ctxid_from_match(match_info);
            self.ctxids[ctxid].recv_req_q.push_back(&mut self.reqs, id);
        }
        self.progress()?;
        Ok(id)
    }

    /// Searches the posted receives (context lane first, then the
    /// wildcard lane) and unlinks the first match.
    pub(crate) fn match_recv(&mut self, match_info: u64) -> Option<RequestId> {
        let ctxid = self.ctxid_from_match(match_info);
        let mut cur = self.ctxids[ctxid].recv_req_q.front();
        while let Some(id) = cur {
            let recv = self.reqs.req(id).recv();
            if match_info & recv.match_mask == recv.match_info {
                self.ctxids[ctxid].recv_req_q.remove(&mut self.reqs, id);
                return Some(id);
            }
            cur = self.ctxids[ctxid].recv_req_q.next_of(&self.reqs, id);
        }

        let mut cur = self.anyctxid_recv_req_q.front();
        while let Some(id) = cur {
            let recv = self.reqs.req(id).recv();
            if match_info & recv.match_mask == recv.match_info {
                self.anyctxid_recv_req_q.remove(&mut self.reqs, id);
                return Some(id);
            }
            cur = self.anyctxid_recv_req_q.next_of(&self.reqs, id);
        }
        None
    }

    /// Searches the unexpected queue for a message matching a receive
    /// being posted.
    fn match_unexp(&mut self, match_info: u64, match_mask: u64) -> Option<RequestId> {
        let covered = match_mask & self.ctxid_mask;
        if self.has_ctxids() && covered == self.ctxid_mask {
            let ctxid = self.ctxid_from_match(match_info);
            let mut cur = self.ctxids[ctxid].unexp_req_q.front();
            while let Some(id) = cur {
                if self.reqs.req(id).status.match_info & match_mask == match_info {
                    return Some(id);
                }
                cur = self.ctxids[ctxid].unexp_req_q.next_of(&self.reqs, id);
            }
            None
        } else {
            let mut cur = self.anyctxid_unexp_req_q.front();
            while let Some(id) = cur {
                if self.reqs.req(id).status.match_info & match_mask == match_info {
                    return Some(id);
                }
                cur = self.anyctxid_unexp_req_q.next_of(&self.reqs, id);
            }
            None
        }
    }

    fn unexp_unlink(&mut self, id: RequestId) {
        self.anyctxid_unexp_req_q.remove(&mut self.reqs, id);
        if self.has_ctxids() {
            let ctxid = self.ctxid_from_match(self.reqs.req(id).status.match_info);
            self.ctxids[ctxid].unexp_req_q.remove(&mut self.reqs, id);
        }
    }

    fn unexp_enqueue(&mut self, id: RequestId) {
        self.anyctxid_unexp_req_q.push_back(&mut self.reqs, id);
        if self.has_ctxids() {
            let ctxid = self.ctxid_from_match(self.reqs.req(id).status.match_info);
            self.ctxids[ctxid].unexp_req_q.push_back(&mut self.reqs, id);
        }
    }

    /// An unexpected message matched a freshly posted receive: move the
    /// buffered data (or the pending large transfer) onto the
    /// application buffer.
    fn deliver_matched_unexp(
        &mut self,
        id: RequestId,
        segs: SegmentList,
        context: u64,
    ) -> RequestId {
        self.unexp_unlink(id);

        let (xfer_length, msg_length, buffer) = {
            let req = self.reqs.req_mut(id);
            let msg_length = req.status.msg_length;
            let xfer_length = segs.total_length().min(msg_length);
            req.status.xfer_length = xfer_length;
            req.status.context = context;
            debug_assert!(req.state.contains(RequestState::UNEXPECTED_RECV));
            req.state -= RequestState::UNEXPECTED_RECV;
            let recv = req.recv_mut();
            let buffer = recv.unexp_buffer.take();
            recv.segs = segs;
            (xfer_length, msg_length, buffer)
        };

        match &self.reqs.req(id).recv().kind {
            RecvKind::Large(_) => {
                // rendezvous matched late: start pulling into the real
                // buffer now
                self.submit_or_queue_pull(id);
            }
            RecvKind::SelfUnexp { sreq } => {
                let sreq = *sreq;
                let status = if xfer_length < msg_length {
                    Status::MessageTruncated
                } else {
                    Status::Success
                };
                if let Some(buffer) = buffer {
                    self.reqs.req(id).recv().segs.copy_from(&buffer, xfer_length);
                }
                self.recv_complete(id, status);

                debug_assert!(self
                    .reqs
                    .req(sreq)
                    .state
                    .contains(RequestState::UNEXPECTED_SELF_SEND));
                self.reqs.req_mut(sreq).state -= RequestState::UNEXPECTED_SELF_SEND;
                self.unexp_self_send_req_q.remove(&mut self.reqs, sreq);
                self.reqs.req_mut(sreq).status.xfer_length = xfer_length;
                self.send_complete(sreq, status);
                self.driver.notify_user_event();
            }
            RecvKind::Basic(_) => {
                if let Some(buffer) = buffer {
                    // holes of a still-partial medium get filled by the
                    // remaining fragments
                    self.reqs.req(id).recv().segs.copy_from(&buffer, xfer_length);
                }
                if self.reqs.req(id).state.contains(RequestState::RECV_PARTIAL) {
                    // the cursor pointed into the staging buffer; the
                    // next fragment re-seeks inside the new segments
                    self.reqs.req_mut(id).recv_mut().basic_mut().scan = crate::segment::SegScan::default();
                    self.partial_medium_recv_req_q.push_back(&mut self.reqs, id);
                } else {
                    self.recv_complete(id, Status::Success);
                    self.driver.notify_user_event();
                }
            }
        }
        id
    }

    /// Completes a receive: stamps the status (truncation included) and
    /// notifies.
    pub(crate) fn recv_complete(&mut self, id: RequestId, status: Status) {
        {
            let req = self.reqs.req_mut(id);
            if req.status.code == Status::Success {
                if status == Status::Success && req.status.xfer_length < req.status.msg_length {
                    req.status.code = Status::MessageTruncated;
                } else {
                    req.status.code = status;
                }
            }
        }
        self.notify_request_done(id);
    }

    // ---- inbound dispatch -------------------------------------------

    /// Entry point for every ordered lib-level message event.
    pub(crate) fn process_recv(&mut self, msg: &InboundMsg, data: &[u8]) {
        let Some(pid) = self.partner_recv_lookup(msg.peer_index, msg.src_endpoint) else {
            return;
        };

        {
            let partner = self.partner(pid);
            trace!(
                target: "omx::recv",
                seqnum = %msg.seqnum,
                expected_match = %partner.next_match_recv_seq,
                expected_frag = %partner.next_frag_recv_seq,
                "inbound message"
            );
            if !msg.seqnum.same_session(partner.next_frag_recv_seq) {
                trace!(target: "omx::recv", "obsolete session message, dropping");
                return;
            }
            if !msg.piggyack.same_session(partner.next_send_seq) {
                trace!(target: "omx::recv", "obsolete session piggyack, dropping");
                return;
            }
        }

        self.handle_ack(pid, msg.piggyack);

        let (old_next_match, frag_index, frag_index_max) = {
            let partner = self.partner(pid);
            (
                partner.next_match_recv_seq,
                msg.seqnum.dist_from(partner.next_frag_recv_seq),
                partner
                    .next_match_recv_seq
                    .dist_from(partner.next_frag_recv_seq),
            )
        };

        if frag_index <= frag_index_max {
            self.process_partner_ordered_recv(pid, msg, data);

            // the window moved: replay any earlies now in range,
            // cascading as they advance it further
            if self.partner(pid).next_match_recv_seq != old_next_match {
                loop {
                    let Some(front) = self.partner(pid).early_recv_q.front() else {
                        break;
                    };
                    let early_index = front.msg.seqnum.dist_from(old_next_match);
                    let early_index_max = self
                        .partner(pid)
                        .next_match_recv_seq
                        .dist_from(old_next_match);
                    if early_index > early_index_max {
                        break;
                    }
                    let early = self
                        .partner_mut(pid)
                        .early_recv_q
                        .pop_front()
                        .expect("checked front");
                    trace!(target: "omx::recv", seqnum = %early.msg.seqnum, "replaying early packet");
                    self.process_partner_ordered_recv(pid, &early.msg, &early.data);
                }
            }
        } else if frag_index <= frag_index_max + EARLY_PACKET_OFFSET_MAX {
            self.postpone_early_packet(pid, msg, data);
        } else {
            trace!(target: "omx::recv", seqnum = %msg.seqnum, "obsolete message");
            if frag_index == omx_wire::SEQNUM_MASK {
                // exactly one below the window: our ack was lost, resend
                // it now (but only for this distance, to avoid flooding)
                self.mark_partner_need_ack_immediate(pid);
            }
        }
    }

    fn process_partner_ordered_recv(&mut self, pid: PartnerId, msg: &InboundMsg, data: &[u8]) {
        let partner = self.partner(pid);
        let match_index = msg.seqnum.dist_from(partner.next_match_recv_seq);
        let frag_index = msg.seqnum.dist_from(partner.next_frag_recv_seq);
        let frag_index_max = partner
            .next_match_recv_seq
            .dist_from(partner.next_frag_recv_seq);

        if match_index == 0 {
            if let InboundKind::Notify { .. } = msg.kind {
                // internal message: a seqnum to consume, no matching
                self.process_recv_notify(pid, msg);
            } else {
                self.try_match_next_recv(pid, msg, data);
            }
            let partner = self.partner_mut(pid);
            partner.next_match_recv_seq = partner.next_match_recv_seq.wrapping_add(1);
            self.update_partner_next_frag_recv_seq(pid);
        } else if matches!(msg.kind, InboundKind::MediumFrag { .. }) && frag_index < frag_index_max
        {
            self.continue_partial_request(pid, msg, data);
        } else {
            // obsolete duplicate inside the window
        }
    }

    fn try_match_next_recv(&mut self, pid: PartnerId, msg: &InboundMsg, data: &[u8]) {
        let source = self.partner_recv_addr(pid);
        let mut matched = self.match_recv(msg.match_info);

        if matched.is_none() {
            if let Some(mut handler) = self.unexp_handler.take() {
                let data_if_available = match msg.kind {
                    InboundKind::Tiny | InboundKind::Small => Some(data),
                    _ => None,
                };
                debug_assert!(!self.progression_disabled.contains(ProgressionDisabled::IN_HANDLER));
                self.progression_disabled |= ProgressionDisabled::IN_HANDLER;
                let action = handler(&UnexpMessage {
                    source,
                    match_info: msg.match_info,
                    msg_length: msg.msg_length,
                    data: data_if_available,
                });
                self.progression_disabled -= ProgressionDisabled::IN_HANDLER;
                if self.unexp_handler.is_none() {
                    self.unexp_handler = Some(handler);
                }

                match action {
                    UnexpHandlerAction::Finished => {
                        // the handler consumed the message; a discarded
                        // rendezvous still owes the sender its notify
                        if let InboundKind::Rndv {
                            rdma_id,
                            rdma_seqnum,
                            ..
                        } = msg.kind
                        {
                            self.submit_discarded_notify(pid, rdma_id, rdma_seqnum);
                        }
                        return;
                    }
                    UnexpHandlerAction::Continue => {
                        matched = self.match_recv(msg.match_info);
                    }
                }
            }
        }

        if let Some(id) = matched {
            let xfer_length = {
                let req = self.reqs.req_mut(id);
                req.partner = Some(pid);
                req.status.addr = source;
                req.status.match_info = msg.match_info;
                debug_assert!(req.state.contains(RequestState::RECV_NEED_MATCHING));
                req.state -= RequestState::RECV_NEED_MATCHING;
                req.status.msg_length = msg.msg_length;
                let xfer_length = req.recv().segs.total_length().min(msg.msg_length);
                req.status.xfer_length = xfer_length;
                req.recv_mut().seqnum = msg.seqnum;
                if matches!(msg.kind, InboundKind::MediumFrag { .. }) {
                    *req.recv_mut().basic_mut() = MediumRecv::default();
                }
                xfer_length
            };
            self.dispatch_recv(pid, id, msg, data, xfer_length);
        } else {
            // unexpected even after the handler: buffer it
            let buffer = match msg.kind {
                InboundKind::Rndv { .. } => None,
                _ => Some(vec![0u8; msg.msg_length as usize].into_boxed_slice()),
            };
            let segs = buffer.as_ref().map_or_else(SegmentList::default, |b| {
                SegmentList::single(b.as_ptr() as u64, msg.msg_length)
            });
            let mut req = Request::new(
                RequestType::Recv,
                RequestData::Recv(RecvData {
                    segs,
                    match_info: msg.match_info,
                    match_mask: 0,
                    seqnum: msg.seqnum,
                    unexp_buffer: buffer,
                    kind: RecvKind::Basic(MediumRecv::default()),
                }),
            );
            req.state = RequestState::UNEXPECTED_RECV;
            req.partner = Some(pid);
            req.status.addr = source;
            req.status.match_info = msg.match_info;
            req.status.msg_length = msg.msg_length;
            req.status.xfer_length = msg.msg_length;
            let id = self.reqs.alloc(req);
            self.unexp_enqueue(id);
            self.dispatch_recv(pid, id, msg, data, msg.msg_length);
        }
    }

    fn dispatch_recv(
        &mut self,
        pid: PartnerId,
        id: RequestId,
        msg: &InboundMsg,
        data: &[u8],
        xfer_length: u32,
    ) {
        match msg.kind {
            InboundKind::Tiny | InboundKind::Small => {
                self.reqs.req(id).recv().segs.copy_from(data, xfer_length);
                if !self.reqs.req(id).state.contains(RequestState::UNEXPECTED_RECV) {
                    self.recv_complete(id, Status::Success);
                }
            }
            InboundKind::MediumFrag { .. } => {
                self.process_recv_medium_frag(pid, id, msg, data);
            }
            InboundKind::Rndv {
                rdma_id,
                rdma_seqnum,
                rdma_offset,
            } => {
                self.process_recv_rndv(pid, id, rdma_id, rdma_seqnum, rdma_offset);
            }
            InboundKind::Notify { .. } => unreachable!("notify never matches"),
        }
    }

    /// A rendezvous advertisement arrived: the receive turns into a
    /// large receive and starts pulling (once it has a real buffer).
    fn process_recv_rndv(
        &mut self,
        _pid: PartnerId,
        id: RequestId,
        rdma_id: u8,
        rdma_seqnum: u8,
        rdma_offset: u16,
    ) {
        {
            let req = self.reqs.req_mut(id);
            req.ty = RequestType::RecvLarge;
            req.state |= RequestState::RECV_PARTIAL;
            req.recv_mut().kind = RecvKind::Large(LargeRecv {
                notify_cmd: SendNotify::default(),
                local_region: None,
                pulled_rdma_id: rdma_id,
                pulled_rdma_seqnum: rdma_seqnum,
                pulled_rdma_offset: rdma_offset,
            });
        }
        if !self.reqs.req(id).state.contains(RequestState::UNEXPECTED_RECV) {
            self.submit_or_queue_pull(id);
        }
        // an unexpected rendezvous stays buffered (it carries no data)
        // until a receive matches it
    }

    /// Accumulates one fragment into a matched (or unexpected) medium.
    fn process_recv_medium_frag(
        &mut self,
        pid: PartnerId,
        id: RequestId,
        msg: &InboundMsg,
        data: &[u8],
    ) {
        let InboundKind::MediumFrag {
            frag_length,
            frag_seqnum,
            frag_pipeline,
        } = msg.kind
        else {
            unreachable!("medium fragment path")
        };
        let offset = u32::from(frag_seqnum) << frag_pipeline;
        let msg_length = msg.msg_length;

        let (complete, was_new) = {
            let req = self.reqs.req_mut(id);
            let bound = req.recv().segs.total_length().min(msg_length);
            let segs = req.recv().segs.clone();
            let medium = req.recv_mut().basic_mut();
            let was_new = medium.frags_received_mask == 0;

            if medium.frags_received_mask & (1 << frag_seqnum) != 0 {
                trace!(target: "omx::medium", frag = frag_seqnum, "duplicate fragment");
                return;
            }

            // wire progress counts against the full message; the copy is
            // clamped to what the buffer can hold
            let wire_chunk = u32::from(frag_length).min(msg_length - offset);
            let copy_chunk = if offset >= bound {
                0
            } else {
                wire_chunk.min(bound - offset)
            };
            if copy_chunk > 0 {
                medium
                    .scan
                    .copy_at(&segs, &data[..copy_chunk as usize], offset);
            }
            medium.frags_received_mask |= 1 << frag_seqnum;
            medium.accumulated_length += wire_chunk;
            trace!(
                target: "omx::medium",
                frag = frag_seqnum,
                accumulated = medium.accumulated_length,
                total = msg_length,
                "fragment stored"
            );
            (medium.accumulated_length == msg_length, was_new)
        };

        let unexpected = self.reqs.req(id).state.contains(RequestState::UNEXPECTED_RECV);
        if complete {
            if !was_new {
                let partner = self.partners[pid.0 as usize].as_deref_mut().expect("live partner");
                partner.partial_medium_recv_req_q.remove(&mut self.reqs, id);
                if !unexpected {
                    self.partial_medium_recv_req_q.remove(&mut self.reqs, id);
                }
            }
            self.reqs.req_mut(id).state -= RequestState::RECV_PARTIAL;
            if !unexpected {
                self.recv_complete(id, Status::Success);
            }
        } else if was_new {
            self.reqs.req_mut(id).state |= RequestState::RECV_PARTIAL;
            let partner = self.partners[pid.0 as usize].as_deref_mut().expect("live partner");
            partner.partial_medium_recv_req_q.push_back(&mut self.reqs, id);
            if !unexpected {
                self.partial_medium_recv_req_q.push_back(&mut self.reqs, id);
            }
        }
    }

    /// Routes a trailing fragment to the partial medium it belongs to.
    fn continue_partial_request(&mut self, pid: PartnerId, msg: &InboundMsg, data: &[u8]) {
        let new_index = {
            let partner = self.partner(pid);
            msg.seqnum.dist_from(partner.next_frag_recv_seq)
        };

        let mut cur = self.partner(pid).partial_medium_recv_req_q.front();
        while let Some(id) = cur {
            let req_index = {
                let partner = self.partner(pid);
                let req = self.reqs.req(id);
                req.recv().seqnum.dist_from(partner.next_frag_recv_seq)
            };
            if req_index == new_index {
                self.process_recv_medium_frag(pid, id, msg, data);
                self.update_partner_next_frag_recv_seq(pid);
                return;
            }
            if req_index > new_index {
                // duplicate of an already-completed medium whose seqnum
                // sits between still-partial ones
                return;
            }
            cur = self
                .partner(pid)
                .partial_medium_recv_req_q
                .next_of(&self.reqs, id);
        }
    }

    /// Recomputes the cumulative-ack bound after the window moved, and
    /// schedules the ack: immediate once too many seqnums are pending,
    /// delayed otherwise.
    pub(crate) fn update_partner_next_frag_recv_seq(&mut self, pid: PartnerId) {
        let new_next_frag = {
            let partner = self.partner(pid);
            match partner.partial_medium_recv_req_q.front() {
                None => partner.next_match_recv_seq,
                Some(id) => self.reqs.req(id).recv().seqnum,
            }
        };
        let not_acked_max = self.config.not_acked_max;

        let partner = self.partner_mut(pid);
        if new_next_frag != partner.next_frag_recv_seq {
            partner.next_frag_recv_seq = new_next_frag;
            if new_next_frag.dist_from(partner.last_acked_recv_seq) >= not_acked_max {
                self.mark_partner_need_ack_immediate(pid);
            } else {
                self.mark_partner_need_ack_delayed(pid);
            }
        }
    }

    // ---- early packets ----------------------------------------------

    /// Stashes an early packet in seqnum order (fragment order within
    /// one medium), dropping exact duplicates.
    fn postpone_early_packet(&mut self, pid: PartnerId, msg: &InboundMsg, data: &[u8]) {
        let next_match = self.partner(pid).next_match_recv_seq;
        let new_index = msg.seqnum.dist_from(next_match);
        let new_frag = early_frag_seqnum(msg);

        let queue = &self.partner(pid).early_recv_q;
        let mut insert_at = queue.len();
        for (i, early) in queue.iter().enumerate().rev() {
            let cur_index = early.msg.seqnum.dist_from(next_match);
            if cur_index < new_index {
                break;
            }
            if cur_index == new_index {
                let cur_frag = early_frag_seqnum(&early.msg);
                if cur_frag < new_frag {
                    break;
                }
                if cur_frag == new_frag {
                    trace!(target: "omx::recv", seqnum = %msg.seqnum, "duplicate early packet");
                    return;
                }
            }
            insert_at = i;
        }

        trace!(target: "omx::recv", seqnum = %msg.seqnum, "postponing early packet");
        let early = EarlyPacket {
            msg: msg.clone(),
            data: data.to_vec().into_boxed_slice(),
        };
        self.partner_mut(pid).early_recv_q.insert(insert_at, early);
    }

    // ---- self communication -----------------------------------------

    /// Sends to our own endpoint without touching the wire: match
    /// directly, or buffer as an unexpected self-send.
    pub(crate) fn process_self_send(&mut self, sreq: RequestId) {
        let (match_info, msg_length) = {
            let req = self.reqs.req_mut(sreq);
            req.ty = RequestType::SendSelf;
            let msg_length = req.send().segs.total_length();
            req.status.msg_length = msg_length;
            (req.status.match_info, msg_length)
        };
        let source = self.addr();
        self.reqs.req_mut(sreq).status.addr = source;

        let mut matched = self.match_recv(match_info);

        if matched.is_none() {
            if let Some(mut handler) = self.unexp_handler.take() {
                let data_if_available = {
                    let segs = &self.reqs.req(sreq).send().segs;
                    segs.is_contiguous().then(|| {
                        let seg = segs.first();
                        unsafe {
                            std::slice::from_raw_parts(
                                seg.vaddr as usize as *const u8,
                                seg.len as usize,
                            )
                        }
                    })
                };
                self.progression_disabled |= ProgressionDisabled::IN_HANDLER;
                let action = handler(&UnexpMessage {
                    source,
                    match_info,
                    msg_length,
                    data: data_if_available,
                });
                self.progression_disabled -= ProgressionDisabled::IN_HANDLER;
                if self.unexp_handler.is_none() {
                    self.unexp_handler = Some(handler);
                }

                match action {
                    UnexpHandlerAction::Finished => {
                        self.reqs.req_mut(sreq).status.xfer_length = msg_length;
                        self.send_complete(sreq, Status::Success);
                        return;
                    }
                    UnexpHandlerAction::Continue => {
                        matched = self.match_recv(match_info);
                    }
                }
            }
        }

        if let Some(rreq) = matched {
            let (xfer_length, status) = {
                let req = self.reqs.req_mut(rreq);
                req.partner = Some(self.myself);
                req.status.addr = source;
                req.status.match_info = match_info;
                debug_assert!(req.state.contains(RequestState::RECV_NEED_MATCHING));
                req.state -= RequestState::RECV_NEED_MATCHING;
                req.status.msg_length = msg_length;
                let total = req.recv().segs.total_length();
                if total < msg_length {
                    req.status.xfer_length = total;
                    (total, Status::MessageTruncated)
                } else {
                    req.status.xfer_length = msg_length;
                    (msg_length, Status::Success)
                }
            };
            self.reqs.req_mut(sreq).status.xfer_length = xfer_length;

            {
                let rsegs = self.reqs.req(rreq).recv().segs.clone();
                let ssegs = self.reqs.req(sreq).send().segs.clone();
                SegmentList::copy_between(&rsegs, &ssegs, xfer_length);
            }
            self.send_complete(sreq, status);
            self.recv_complete(rreq, status);
            self.driver.notify_user_event();
        } else {
            // buffer a copy so the sender's buffer is free to go; the
            // send completes when the receive is posted
            let buffer = {
                let mut buffer = vec![0u8; msg_length as usize].into_boxed_slice();
                self.reqs.req(sreq).send().segs.copy_into(&mut buffer, msg_length);
                buffer
            };
            let segs = SegmentList::single(buffer.as_ptr() as u64, msg_length);
            let mut rreq = Request::new(
                RequestType::RecvSelfUnexpected,
                RequestData::Recv(RecvData {
                    segs,
                    match_info,
                    match_mask: 0,
                    seqnum: Seq(0),
                    unexp_buffer: Some(buffer),
                    kind: RecvKind::SelfUnexp { sreq },
                }),
            );
            rreq.state = RequestState::UNEXPECTED_RECV;
            rreq.partner = Some(self.myself);
            rreq.status.addr = source;
            rreq.status.match_info = match_info;
            rreq.status.msg_length = msg_length;
            rreq.status.xfer_length = msg_length;
            let rid = self.reqs.alloc(rreq);
            self.unexp_enqueue(rid);

            self.reqs.req_mut(sreq).state |= RequestState::UNEXPECTED_SELF_SEND;
            self.unexp_self_send_req_q.push_back(&mut self.reqs, sreq);
        }
    }
}

fn early_frag_seqnum(msg: &InboundMsg) -> u8 {
    match msg.kind {
        InboundKind::MediumFrag { frag_seqnum, .. } => frag_seqnum,
        _ => 0,
    }
}

/// Extracts the inline tiny payload length-bounded.
pub(crate) fn tiny_payload(data: &[u8; TINY_MAX], length: u16) -> &[u8] {
    &data[..usize::from(length).min(TINY_MAX)]
}
