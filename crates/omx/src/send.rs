//! The send pipeline: five submission paths chosen by payload length,
//! all funneled through the same resource-acquisition and seqnum gates.
//!
//! Submission order is preserved end to end. Resources are acquired in a
//! fixed order recorded in the request's missing-resources mask; a
//! shortage parks the request on the FIFO delayed queue with whatever it
//! already holds, and later submissions park behind it even when their
//! own resources are available. Once resources are held, the seqnum gate
//! applies: a partner with a full in-flight window queues the request on
//! its throttling list until acks free seqnums.
//!
//! Requests whose payload is buffered by post time (tiny, small, staged
//! medium, notify) complete early; the wire keeps working on them behind
//! the application's back until the ack arrives.

use omx_driver::abi::{
    SendMediumSqFrag, SendMediumVa, SendRndv, SendSmall, SendTiny, MEDIUM_FRAG_LENGTH_MAX,
    MEDIUM_FRAGS_MAX, SENDQ_ENTRY_SHIFT, SMALL_MAX, TINY_MAX,
};
use tracing::trace;

use crate::{
    addr::EndpointAddr,
    endpoint::Endpoint,
    error::{Error, MissingResources as Shortage, Status, SubmitResult},
    partner::PartnerId,
    request::{
        MissingResources, Request, RequestData, RequestId, RequestState, RequestType, SendData,
        SendKind,
    },
    segment::{SegGather, Segment, SegmentList},
};

/// Bound on in-flight (unacked) seqnums towards one partner; beyond it,
/// new sends wait for acks. Half the seqnum ring, so in-flight and
/// just-acked ranges can never alias.
pub(crate) const THROTTLING_OFFSET_MAX: u16 = 1 << 13;

impl Endpoint {
    /// Posts a send of `buffer` to `dest`, matched against the
    /// receiver's posted `(match_info, match_mask)` pairs.
    ///
    /// # Safety
    ///
    /// `buffer` must stay valid and unmodified until the returned
    /// request completes (or the endpoint closes). Tiny and small
    /// payloads are buffered immediately, but medium and large ones are
    /// read from the caller's memory at transmission and retransmission
    /// time.
    pub unsafe fn isend(
        &mut self,
        buffer: &[u8],
        dest: EndpointAddr,
        match_info: u64,
        context: u64,
    ) -> Result<RequestId, Error> {
        let segs = SegmentList::from_slice(buffer);
        self.isend_segs(segs, dest, match_info, context, false)
    }

    /// Vectorial form of [`Endpoint::isend`].
    ///
    /// # Safety
    ///
    /// Every segment must stay valid and unmodified until completion.
    pub unsafe fn isendv(
        &mut self,
        segments: &[Segment],
        dest: EndpointAddr,
        match_info: u64,
        context: u64,
    ) -> Result<RequestId, Error> {
        let segs = SegmentList::from_segments(segments)?;
        self.isend_segs(segs, dest, match_info, context, false)
    }

    /// Synchronous-semantics send: completion guarantees the receiver
    /// has matched the message. Always takes the rendezvous path.
    ///
    /// # Safety
    ///
    /// As for [`Endpoint::isend`].
    pub unsafe fn issend(
        &mut self,
        buffer: &[u8],
        dest: EndpointAddr,
        match_info: u64,
        context: u64,
    ) -> Result<RequestId, Error> {
        let segs = SegmentList::from_slice(buffer);
        self.isend_segs(segs, dest, match_info, context, true)
    }

    /// Vectorial form of [`Endpoint::issend`].
    ///
    /// # Safety
    ///
    /// As for [`Endpoint::isendv`].
    pub unsafe fn issendv(
        &mut self,
        segments: &[Segment],
        dest: EndpointAddr,
        match_info: u64,
        context: u64,
    ) -> Result<RequestId, Error> {
        let segs = SegmentList::from_segments(segments)?;
        self.isend_segs(segs, dest, match_info, context, true)
    }

    fn isend_segs(
        &mut self,
        segs: SegmentList,
        dest: EndpointAddr,
        match_info: u64,
        context: u64,
        synchronous: bool,
    ) -> Result<RequestId, Error> {
        let pid = self.partner_lookup(dest.peer_index, dest.endpoint_index)?;
        let length = segs.total_length();

        let mut req = Request::new(RequestType::SendTiny, RequestData::Send(SendData {
            segs,
            kind: SendKind::SelfSend,
        }));
        req.partner = Some(pid);
        req.status.addr = dest;
        req.status.match_info = match_info;
        req.status.context = context;
        let id = self.reqs.alloc(req);

        trace!(
            target: "omx::send",
            length,
            seqnum = %self.partner(pid).next_send_seq,
            "submitting send"
        );

        if self.config.selfcomms && pid == self.myself {
            self.process_self_send(id);
        } else if synchronous {
            self.submit_isend_large(pid, id);
        } else if length as usize <= TINY_MAX {
            self.submit_isend_tiny(pid, id);
        } else if length as usize <= SMALL_MAX {
            self.submit_isend_small(pid, id);
        } else if length <= self.effective_rndv_threshold(pid) {
            self.submit_isend_medium(pid, id);
        } else {
            self.submit_isend_large(pid, id);
        }

        self.progress()?;
        Ok(id)
    }

    /// Rendezvous threshold of a partner; before any connect exchange
    /// taught us its locality, fall back to the remote default.
    fn effective_rndv_threshold(&self, pid: PartnerId) -> u32 {
        match self.partner(pid).rndv_threshold {
            0 => self.config.rndv_threshold,
            t => t,
        }
    }

    /// Whether submissions must defer behind already-delayed requests to
    /// preserve FIFO.
    fn must_delay(&self) -> bool {
        !self.need_resources_send_req_q.is_empty()
    }

    fn park_need_resources(&mut self, id: RequestId) {
        trace!(target: "omx::send", "delaying send, resources missing");
        self.reqs.req_mut(id).state |= RequestState::NEED_RESOURCES;
        self.need_resources_send_req_q.push_back(&mut self.reqs, id);
    }

    /// The seqnum gate: either run the wire post, or park on the
    /// partner's throttling queue until acks open the window.
    fn seqnum_gate(
        &mut self,
        pid: PartnerId,
        id: RequestId,
        setup: fn(&mut Self, PartnerId, RequestId),
    ) {
        if self.partner(pid).outstanding_sends() >= THROTTLING_OFFSET_MAX {
            self.reqs.req_mut(id).state |= RequestState::NEED_SEQNUM;
            let partner = self.partners[pid.0 as usize].as_deref_mut().expect("live partner");
            partner.need_seqnum_send_req_q.push_back(&mut self.reqs, id);
            self.mark_partner_throttling(pid);
        } else {
            setup(self, pid, id);
        }
    }

    /// Consumes the partner's next send seqnum and starts the resend
    /// bookkeeping; shared by every wire-post path.
    fn consume_send_seqnum(&mut self, pid: PartnerId, id: RequestId) {
        let seqnum = {
            let partner = self.partner_mut(pid);
            let seqnum = partner.next_send_seq;
            partner.next_send_seq = partner.next_send_seq.wrapping_add(1);
            seqnum
        };
        let resends_max = self.req_resends_max;
        let req = self.reqs.req_mut(id);
        req.send_seqnum = seqnum;
        req.resends = 0;
        if req.resends_max == 0 {
            req.resends_max = resends_max;
        }
    }

    // ---- tiny --------------------------------------------------------

    fn submit_isend_tiny(&mut self, pid: PartnerId, id: RequestId) {
        {
            let req = self.reqs.req_mut(id);
            req.ty = RequestType::SendTiny;
            let length = req.send().segs.total_length();
            req.status.msg_length = length;
            // truncation is not reported to the sender
            req.status.xfer_length = length;
            req.send_mut().kind = SendKind::Tiny(zeroed_tiny());
        }

        if self.must_delay() {
            self.park_need_resources(id);
        } else {
            self.alloc_setup_isend_tiny(pid, id);
        }
    }

    pub(crate) fn alloc_setup_isend_tiny(&mut self, pid: PartnerId, id: RequestId) {
        let (peer_index, endpoint_index, shared, session) = self.partner_wire_identity(pid);
        {
            let req = self.reqs.req_mut(id);
            let length = req.status.msg_length;
            let match_info = req.status.match_info;
            let send = req.send_mut();
            let mut data = [0u8; TINY_MAX];
            send.segs.copy_into(&mut data, length);
            let SendKind::Tiny(cmd) = &mut send.kind else {
                unreachable!("tiny submission path")
            };
            cmd.peer_index = peer_index;
            cmd.dest_endpoint = endpoint_index;
            cmd.shared = shared;
            cmd.match_info = match_info;
            cmd.length = length as u16;
            cmd.session_id = session;
            cmd.data = data;
        }
        self.seqnum_gate(pid, id, Self::setup_isend_tiny);
    }

    fn setup_isend_tiny(&mut self, pid: PartnerId, id: RequestId) {
        self.consume_send_seqnum(pid, id);
        {
            let req = self.reqs.req_mut(id);
            let seqnum = req.send_seqnum;
            let SendKind::Tiny(cmd) = &mut req.send_mut().kind else {
                unreachable!("tiny submission path")
            };
            cmd.seqnum = seqnum.0;
        }
        self.post_isend_tiny(pid, id);

        self.reqs.req_mut(id).state |= RequestState::NEED_ACK;
        self.non_acked_req_q.push_back(&mut self.reqs, id);
        let partner = self.partners[pid.0 as usize].as_deref_mut().expect("live partner");
        partner.non_acked_req_q.push_back(&mut self.reqs, id);

        // data is buffered in the command: complete now, resend later if
        // needed
        self.notify_request_done_early(id);
    }

    pub(crate) fn post_isend_tiny(&mut self, pid: PartnerId, id: RequestId) {
        let ack_upto = self.partner(pid).needed_ack();
        let now = self.driver.jiffies();
        let cmd = {
            let req = self.reqs.req_mut(id);
            let SendKind::Tiny(cmd) = &mut req.send_mut().kind else {
                unreachable!("tiny submission path")
            };
            cmd.piggyack = ack_upto.0;
            *cmd
        };
        // on driver backpressure, retransmission tries again later
        let sent = self.driver.send_tiny(&cmd).is_ok();
        let req = self.reqs.req_mut(id);
        req.resends += 1;
        req.last_send_jiffies = now;
        if sent {
            self.mark_partner_ack_sent(pid);
        }
    }

    // ---- small -------------------------------------------------------

    fn submit_isend_small(&mut self, pid: PartnerId, id: RequestId) {
        {
            let req = self.reqs.req_mut(id);
            req.ty = RequestType::SendSmall;
            let length = req.send().segs.total_length();
            req.status.msg_length = length;
            req.status.xfer_length = length;
            // buffer the payload now so retransmissions survive the
            // application reusing its buffer after early completion
            let mut copy = vec![0u8; length as usize].into_boxed_slice();
            req.send().segs.copy_into(&mut copy, length);
            req.send_mut().kind = SendKind::Small {
                cmd: SendSmall::default(),
                copy,
            };
        }

        if self.must_delay() {
            self.park_need_resources(id);
        } else {
            self.alloc_setup_isend_small(pid, id);
        }
    }

    pub(crate) fn alloc_setup_isend_small(&mut self, pid: PartnerId, id: RequestId) {
        let (peer_index, endpoint_index, shared, session) = self.partner_wire_identity(pid);
        {
            let req = self.reqs.req_mut(id);
            let length = req.status.msg_length;
            let match_info = req.status.match_info;
            let send = req.send_mut();
            let SendKind::Small { cmd, copy } = &mut send.kind else {
                unreachable!("small submission path")
            };
            cmd.peer_index = peer_index;
            cmd.dest_endpoint = endpoint_index;
            cmd.shared = shared;
            cmd.match_info = match_info;
            cmd.length = length as u16;
            cmd.session_id = session;
            cmd.vaddr = copy.as_ptr() as u64;
        }
        self.seqnum_gate(pid, id, Self::setup_isend_small);
    }

    fn setup_isend_small(&mut self, pid: PartnerId, id: RequestId) {
        self.consume_send_seqnum(pid, id);
        {
            let req = self.reqs.req_mut(id);
            let seqnum = req.send_seqnum;
            let SendKind::Small { cmd, .. } = &mut req.send_mut().kind else {
                unreachable!("small submission path")
            };
            cmd.seqnum = seqnum.0;
        }
        self.post_isend_small(pid, id);

        self.reqs.req_mut(id).state |= RequestState::NEED_ACK;
        self.non_acked_req_q.push_back(&mut self.reqs, id);
        let partner = self.partners[pid.0 as usize].as_deref_mut().expect("live partner");
        partner.non_acked_req_q.push_back(&mut self.reqs, id);

        self.notify_request_done_early(id);
    }

    pub(crate) fn post_isend_small(&mut self, pid: PartnerId, id: RequestId) {
        let ack_upto = self.partner(pid).needed_ack();
        let now = self.driver.jiffies();
        let cmd = {
            let req = self.reqs.req_mut(id);
            let SendKind::Small { cmd, .. } = &mut req.send_mut().kind else {
                unreachable!("small submission path")
            };
            cmd.piggyack = ack_upto.0;
            *cmd
        };
        let sent = self.driver.send_small(&cmd).is_ok();
        let req = self.reqs.req_mut(id);
        req.resends += 1;
        req.last_send_jiffies = now;
        if sent {
            self.mark_partner_ack_sent(pid);
        }
    }

    // ---- medium ------------------------------------------------------

    fn submit_isend_medium(&mut self, pid: PartnerId, id: RequestId) {
        let use_sendq = self.config.medium_sendq;
        {
            let req = self.reqs.req_mut(id);
            let length = req.send().segs.total_length();
            req.status.msg_length = length;
            req.status.xfer_length = length;

            if use_sendq {
                req.ty = RequestType::SendMediumSq;
                req.missing = MissingResources::SEND_MEDIUMSQ;
                let frags_nr = length.div_ceil(MEDIUM_FRAG_LENGTH_MAX as u32).max(1);
                debug_assert!(frags_nr as usize <= MEDIUM_FRAGS_MAX);
                req.send_mut().kind = SendKind::MediumSq {
                    cmd: SendMediumSqFrag::default(),
                    frags_nr,
                    frags_pending: 0,
                    sendq_slots: Vec::new(),
                };
            } else {
                req.ty = RequestType::SendMediumVa;
                let driver_segs = req.send().segs.to_driver_segments();
                req.send_mut().kind = SendKind::MediumVa {
                    cmd: SendMediumVa::default(),
                    driver_segs,
                };
            }
        }

        if self.must_delay() {
            self.park_need_resources(id);
            return;
        }
        let result = if use_sendq {
            self.alloc_setup_isend_mediumsq(pid, id)
        } else {
            self.alloc_setup_isend_mediumva(pid, id)
        };
        if result.is_err() {
            self.park_need_resources(id);
        }
    }

    pub(crate) fn alloc_setup_isend_mediumva(
        &mut self,
        pid: PartnerId,
        id: RequestId,
    ) -> SubmitResult {
        let (peer_index, endpoint_index, shared, session) = self.partner_wire_identity(pid);
        {
            let req = self.reqs.req_mut(id);
            let length = req.status.msg_length;
            let match_info = req.status.match_info;
            let nseg = req.send().segs.nseg();
            let SendKind::MediumVa { cmd, driver_segs } = &mut req.send_mut().kind else {
                unreachable!("mediumva submission path")
            };
            cmd.peer_index = peer_index;
            cmd.dest_endpoint = endpoint_index;
            cmd.shared = shared;
            cmd.match_info = match_info;
            cmd.session_id = session;
            cmd.length = length;
            cmd.nr_segments = nseg;
            cmd.segments = driver_segs.as_ptr() as u64;
        }
        self.seqnum_gate(pid, id, Self::setup_isend_mediumva);
        Ok(())
    }

    pub(crate) fn setup_isend_mediumva(&mut self, pid: PartnerId, id: RequestId) {
        self.consume_send_seqnum(pid, id);
        {
            let req = self.reqs.req_mut(id);
            let seqnum = req.send_seqnum;
            let SendKind::MediumVa { cmd, .. } = &mut req.send_mut().kind else {
                unreachable!("mediumva submission path")
            };
            cmd.seqnum = seqnum.0;
        }
        self.post_isend_mediumva(pid, id);

        self.reqs.req_mut(id).state |= RequestState::NEED_ACK;
        self.non_acked_req_q.push_back(&mut self.reqs, id);
        let partner = self.partners[pid.0 as usize].as_deref_mut().expect("live partner");
        partner.non_acked_req_q.push_back(&mut self.reqs, id);

        // no early completion: the data is read straight from the
        // application's buffer until the ack arrives
    }

    pub(crate) fn post_isend_mediumva(&mut self, pid: PartnerId, id: RequestId) {
        let ack_upto = self.partner(pid).needed_ack();
        let now = self.driver.jiffies();
        let cmd = {
            let req = self.reqs.req_mut(id);
            let SendKind::MediumVa { cmd, .. } = &mut req.send_mut().kind else {
                unreachable!("mediumva submission path")
            };
            cmd.piggyack = ack_upto.0;
            *cmd
        };
        let sent = self.driver.send_mediumva(&cmd).is_ok();
        let req = self.reqs.req_mut(id);
        req.resends += 1;
        req.last_send_jiffies = now;
        if sent {
            self.mark_partner_ack_sent(pid);
        }
    }

    pub(crate) fn alloc_setup_isend_mediumsq(
        &mut self,
        pid: PartnerId,
        id: RequestId,
    ) -> SubmitResult {
        let frags_nr = {
            let req = self.reqs.req(id);
            let SendKind::MediumSq { frags_nr, .. } = &req.send().kind else {
                unreachable!("mediumsq submission path")
            };
            *frags_nr
        };

        if self.reqs.req(id).missing.contains(MissingResources::EXP_EVENT) {
            if self.avail_exp_events < frags_nr {
                return Err(Shortage);
            }
            self.avail_exp_events -= frags_nr;
            self.reqs.req_mut(id).missing -= MissingResources::EXP_EVENT;
        }

        if self.reqs.req(id).missing.contains(MissingResources::SENDQ_SLOT) {
            let Some(slots) = self.sendq_map_get(frags_nr, id) else {
                return Err(Shortage);
            };
            let req = self.reqs.req_mut(id);
            let SendKind::MediumSq { sendq_slots, .. } = &mut req.send_mut().kind else {
                unreachable!("mediumsq submission path")
            };
            *sendq_slots = slots;
            req.missing -= MissingResources::SENDQ_SLOT;
        }
        debug_assert!(self.reqs.req(id).missing.is_empty());

        let (peer_index, endpoint_index, shared, session) = self.partner_wire_identity(pid);
        {
            let req = self.reqs.req_mut(id);
            let length = req.status.msg_length;
            let match_info = req.status.match_info;
            let SendKind::MediumSq { cmd, .. } = &mut req.send_mut().kind else {
                unreachable!("mediumsq submission path")
            };
            cmd.peer_index = peer_index;
            cmd.dest_endpoint = endpoint_index;
            cmd.shared = shared;
            cmd.match_info = match_info;
            cmd.msg_length = length;
            cmd.frag_pipeline = SENDQ_ENTRY_SHIFT as u8;
            cmd.session_id = session;
        }
        self.seqnum_gate(pid, id, Self::setup_isend_mediumsq);
        Ok(())
    }

    pub(crate) fn setup_isend_mediumsq(&mut self, pid: PartnerId, id: RequestId) {
        self.consume_send_seqnum(pid, id);
        {
            let req = self.reqs.req_mut(id);
            let seqnum = req.send_seqnum;
            let SendKind::MediumSq { cmd, .. } = &mut req.send_mut().kind else {
                unreachable!("mediumsq submission path")
            };
            cmd.seqnum = seqnum.0;
        }
        self.post_isend_mediumsq(pid, id);

        self.reqs.req_mut(id).state |= RequestState::NEED_ACK;
        if self
            .reqs
            .req(id)
            .state
            .contains(RequestState::DRIVER_MEDIUMSQ_SENDING)
        {
            self.driver_mediumsq_sending_req_q.push_back(&mut self.reqs, id);
        } else {
            self.non_acked_req_q.push_back(&mut self.reqs, id);
        }
        let partner = self.partners[pid.0 as usize].as_deref_mut().expect("live partner");
        partner.non_acked_req_q.push_back(&mut self.reqs, id);

        self.notify_request_done_early(id);
    }

    pub(crate) fn post_isend_mediumsq(&mut self, pid: PartnerId, id: RequestId) {
        let ack_upto = self.partner(pid).needed_ack();
        let now = self.driver.jiffies();

        let (mut cmd, frags_nr, slots, first_post, length, segs) = {
            let req = self.reqs.req_mut(id);
            let first_post = req.resends == 0;
            let length = req.status.msg_length;
            let segs = req.send().segs.clone();
            let SendKind::MediumSq {
                cmd,
                frags_nr,
                sendq_slots,
                ..
            } = &mut req.send_mut().kind
            else {
                unreachable!("mediumsq submission path")
            };
            cmd.piggyack = ack_upto.0;
            (*cmd, *frags_nr, sendq_slots.clone(), first_post, length, segs)
        };

        let frag_max = MEDIUM_FRAG_LENGTH_MAX as u32;
        let mut gather = SegGather::default();
        let mut remaining = length;
        let mut posted = 0;
        let mut failed = false;

        for (i, &slot) in slots.iter().enumerate().take(frags_nr as usize) {
            let chunk = remaining.min(frag_max);
            if first_post {
                let dst = self.driver.sendq_slot_mut(slot);
                gather.read_into(&segs, &mut dst[..chunk as usize]);
            }
            if !failed {
                cmd.frag_length = chunk as u16;
                cmd.frag_seqnum = i as u8;
                cmd.sendq_offset = u32::from(slot) << SENDQ_ENTRY_SHIFT;
                if self.driver.send_mediumsq_frag(&cmd).is_err() {
                    // assume the rest would fail too; finish staging the
                    // payload (so resends skip the copy) and stop posting
                    failed = true;
                } else {
                    posted += 1;
                }
            }
            remaining -= chunk;
        }

        {
            let req = self.reqs.req_mut(id);
            let SendKind::MediumSq { frags_pending, .. } = &mut req.send_mut().kind else {
                unreachable!("mediumsq submission path")
            };
            *frags_pending = posted;
            req.resends += 1;
            req.last_send_jiffies = now;
            if posted > 0 {
                req.state |= RequestState::DRIVER_MEDIUMSQ_SENDING;
            }
        }
        if failed {
            // refund the expected-event credits of the unposted frags
            self.avail_exp_events += frags_nr - posted;
        }
        if posted > 0 {
            self.mark_partner_ack_sent(pid);
        }
    }

    // ---- large (rendezvous) -----------------------------------------

    fn submit_isend_large(&mut self, pid: PartnerId, id: RequestId) {
        {
            let req = self.reqs.req_mut(id);
            req.ty = RequestType::SendLarge;
            req.missing = MissingResources::SEND_LARGE;
            let length = req.send().segs.total_length();
            req.status.msg_length = length;
            // xfer_length is set when the notify arrives
            req.send_mut().kind = SendKind::Large {
                cmd: SendRndv::default(),
                region: None,
                region_seqnum: 0,
            };
        }

        if self.must_delay() {
            self.park_need_resources(id);
        } else if self.alloc_setup_isend_large(pid, id).is_err() {
            self.park_need_resources(id);
        }
    }

    pub(crate) fn alloc_setup_isend_large(&mut self, pid: PartnerId, id: RequestId) -> SubmitResult {
        if self
            .reqs
            .req(id)
            .missing
            .contains(MissingResources::SEND_LARGE_REGION)
        {
            if self.large_sends_avail == 0 {
                return Err(Shortage);
            }
            self.large_sends_avail -= 1;
            self.reqs.req_mut(id).missing -= MissingResources::SEND_LARGE_REGION;
        }

        if self.reqs.req(id).missing.contains(MissingResources::LARGE_REGION) {
            let segs = self.reqs.req(id).send().segs.clone();
            let region_id = self.get_region(&segs, Some(id))?;
            let region_seqnum = {
                let region = self.regions.get_mut(region_id).expect("region just acquired");
                let seqnum = region.last_seqnum;
                region.last_seqnum = region.last_seqnum.wrapping_add(1);
                seqnum
            };
            let req = self.reqs.req_mut(id);
            req.missing -= MissingResources::LARGE_REGION;
            let SendKind::Large {
                region,
                region_seqnum: rs,
                ..
            } = &mut req.send_mut().kind
            else {
                unreachable!("large submission path")
            };
            *region = Some(region_id);
            *rs = region_seqnum;
        }
        debug_assert!(self.reqs.req(id).missing.is_empty());

        let (peer_index, endpoint_index, shared, session) = self.partner_wire_identity(pid);
        {
            let req = self.reqs.req_mut(id);
            let length = req.status.msg_length;
            let match_info = req.status.match_info;
            let SendKind::Large {
                cmd,
                region,
                region_seqnum,
            } = &mut req.send_mut().kind
            else {
                unreachable!("large submission path")
            };
            cmd.peer_index = peer_index;
            cmd.dest_endpoint = endpoint_index;
            cmd.shared = shared;
            cmd.match_info = match_info;
            cmd.session_id = session;
            cmd.msg_length = length;
            cmd.pulled_rdma_id = region.expect("region acquired above");
            cmd.pulled_rdma_seqnum = *region_seqnum;
        }
        self.seqnum_gate(pid, id, Self::setup_isend_rndv);
        Ok(())
    }

    pub(crate) fn setup_isend_rndv(&mut self, pid: PartnerId, id: RequestId) {
        self.consume_send_seqnum(pid, id);
        {
            let req = self.reqs.req_mut(id);
            let seqnum = req.send_seqnum;
            let SendKind::Large { cmd, .. } = &mut req.send_mut().kind else {
                unreachable!("large submission path")
            };
            cmd.seqnum = seqnum.0;
        }
        self.post_isend_rndv(pid, id);

        self.reqs.req_mut(id).state |= RequestState::NEED_REPLY | RequestState::NEED_ACK;
        self.non_acked_req_q.push_back(&mut self.reqs, id);
        let partner = self.partners[pid.0 as usize].as_deref_mut().expect("live partner");
        partner.non_acked_req_q.push_back(&mut self.reqs, id);

        // no early completion: the buffer is pulled by the peer
    }

    pub(crate) fn post_isend_rndv(&mut self, pid: PartnerId, id: RequestId) {
        let ack_upto = self.partner(pid).needed_ack();
        let now = self.driver.jiffies();
        let cmd = {
            let req = self.reqs.req_mut(id);
            let SendKind::Large { cmd, .. } = &mut req.send_mut().kind else {
                unreachable!("large submission path")
            };
            cmd.piggyack = ack_upto.0;
            *cmd
        };
        let sent = self.driver.send_rndv(&cmd).is_ok();
        let req = self.reqs.req_mut(id);
        req.resends += 1;
        req.last_send_jiffies = now;
        if sent {
            self.mark_partner_ack_sent(pid);
        }
    }

    // ---- delayed and throttled submissions ---------------------------

    /// Drains the delayed queue strictly FIFO; the first request that
    /// still cannot acquire its resources goes back to the head and
    /// stops the pass, so later requests cannot overtake it.
    pub(crate) fn process_delayed_requests(&mut self) {
        while let Some(id) = self.need_resources_send_req_q.pop_front(&mut self.reqs) {
            self.reqs.req_mut(id).state -= RequestState::NEED_RESOURCES;
            let pid = self.reqs.req(id).partner.expect("send has a partner");

            let result = match self.reqs.req(id).ty {
                RequestType::SendTiny => {
                    self.alloc_setup_isend_tiny(pid, id);
                    Ok(())
                }
                RequestType::SendSmall => {
                    self.alloc_setup_isend_small(pid, id);
                    Ok(())
                }
                RequestType::SendMediumSq => self.alloc_setup_isend_mediumsq(pid, id),
                RequestType::SendMediumVa => self.alloc_setup_isend_mediumva(pid, id),
                RequestType::SendLarge => self.alloc_setup_isend_large(pid, id),
                RequestType::RecvLarge => {
                    if self.reqs.req(id).state.contains(RequestState::RECV_PARTIAL) {
                        // pull not posted yet
                        self.alloc_setup_pull(id)
                    } else {
                        // pull done, the notify is what was delayed
                        self.alloc_setup_notify(id);
                        Ok(())
                    }
                }
                ty => unreachable!("unexpected delayed request type {ty:?}"),
            };

            if result.is_err() {
                trace!(target: "omx::send", "requeueing delayed request, still short");
                self.reqs.req_mut(id).state |= RequestState::NEED_RESOURCES;
                self.need_resources_send_req_q.push_front(&mut self.reqs, id);
                break;
            }
        }
    }

    /// Releases up to `nr` throttled sends of a partner after acks freed
    /// seqnums. Resources were already acquired before they parked.
    pub(crate) fn process_throttling_requests(&mut self, pid: PartnerId, nr: u32) {
        let mut sent = 0;
        while sent < nr {
            let id = {
                let partner = self.partners[pid.0 as usize].as_deref_mut().expect("live partner");
                match partner.need_seqnum_send_req_q.pop_front(&mut self.reqs) {
                    Some(id) => id,
                    None => break,
                }
            };
            debug_assert!(self.reqs.req(id).state.contains(RequestState::NEED_SEQNUM));
            self.reqs.req_mut(id).state -= RequestState::NEED_SEQNUM;

            match self.reqs.req(id).ty {
                RequestType::SendTiny => self.setup_isend_tiny(pid, id),
                RequestType::SendSmall => self.setup_isend_small(pid, id),
                RequestType::SendMediumSq => self.setup_isend_mediumsq(pid, id),
                RequestType::SendMediumVa => self.setup_isend_mediumva(pid, id),
                RequestType::SendLarge => self.setup_isend_rndv(pid, id),
                RequestType::RecvLarge => self.setup_notify(pid, id),
                ty => unreachable!("unexpected throttled request type {ty:?}"),
            }
            sent += 1;
        }
        self.update_partner_throttling(pid, sent);
    }

    // ---- completion and teardown ------------------------------------

    /// Completes a send: records the status (unless an error was stamped
    /// earlier), releases kind-specific resources, and notifies.
    pub(crate) fn send_complete(&mut self, id: RequestId, status: Status) {
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

        let slots = {
            let req = self.reqs.req_mut(id);
            match &mut req.send_mut().kind {
                SendKind::Small { copy, .. } => {
                    // the retransmission buffer dies with the ack
                    *copy = Box::new([]);
                    None
                }
                SendKind::MediumSq { sendq_slots, .. } => Some(std::mem::take(sendq_slots)),
                _ => None,
            }
        };
        if let Some(slots) = slots {
            self.sendq_map_put(&slots);
        }

        self.notify_request_done(id);
    }

    /// Completes a send that never reached the wire (partner teardown),
    /// refunding whatever resources it had already acquired.
    pub(crate) fn complete_unsent_send_request(&mut self, id: RequestId) {
        let missing = self.reqs.req(id).missing;
        match self.reqs.req(id).ty {
            RequestType::SendMediumSq => {
                let frags_nr = {
                    let req = self.reqs.req(id);
                    let SendKind::MediumSq { frags_nr, .. } = &req.send().kind else {
                        unreachable!("mediumsq request")
                    };
                    *frags_nr
                };
                if !missing.contains(MissingResources::EXP_EVENT) {
                    self.avail_exp_events += frags_nr;
                }
                // sendq slots, when acquired, are released by
                // send_complete through the slot vector
                self.reqs.req_mut(id).state -= RequestState::NEED_SEQNUM;
                self.send_complete(id, Status::RemoteEndpointUnreachable);
            }
            RequestType::SendLarge => {
                if !missing.contains(MissingResources::SEND_LARGE_REGION) {
                    self.large_sends_avail += 1;
                }
                if !missing.contains(MissingResources::LARGE_REGION) {
                    let region = {
                        let req = self.reqs.req(id);
                        let SendKind::Large { region, .. } = &req.send().kind else {
                            unreachable!("large request")
                        };
                        region.expect("region acquired")
                    };
                    self.put_region(region, Some(id));
                }
                self.reqs.req_mut(id).state -= RequestState::NEED_SEQNUM;
                self.send_complete(id, Status::RemoteEndpointUnreachable);
            }
            RequestType::SendTiny | RequestType::SendSmall | RequestType::SendMediumVa => {
                self.reqs.req_mut(id).state -= RequestState::NEED_SEQNUM;
                self.send_complete(id, Status::RemoteEndpointUnreachable);
            }
            RequestType::RecvLarge => {
                if self.reqs.req(id).state.contains(RequestState::RECV_PARTIAL) {
                    // delayed before the pull: refund what the pull had
                    if !missing.contains(MissingResources::EXP_EVENT) {
                        self.avail_exp_events += 1;
                    }
                    if !missing.contains(MissingResources::LARGE_REGION) {
                        let region = self
                            .reqs
                            .req(id)
                            .recv()
                            .large()
                            .local_region
                            .expect("region acquired");
                        self.put_region(region, None);
                    }
                    self.reqs.req_mut(id).state -= RequestState::RECV_PARTIAL;
                }
                self.reqs.req_mut(id).state -= RequestState::NEED_SEQNUM;
                self.recv_complete(id, Status::RemoteEndpointUnreachable);
            }
            ty => unreachable!("unexpected unsent request type {ty:?}"),
        }
    }

    pub(crate) fn partner_wire_identity(&self, pid: PartnerId) -> (u16, u8, u8, u32) {
        let partner = self.partner(pid);
        (
            partner.peer_index,
            partner.endpoint_index,
            u8::from(partner.is_local() && self.config.sharedcomms),
            partner.true_session_id,
        )
    }
}

fn zeroed_tiny() -> SendTiny {
    SendTiny {
        peer_index: 0,
        dest_endpoint: 0,
        shared: 0,
        length: 0,
        seqnum: 0,
        piggyack: 0,
        pad: [0; 2],
        session_id: 0,
        match_info: 0,
        data: [0; TINY_MAX],
    }
}
