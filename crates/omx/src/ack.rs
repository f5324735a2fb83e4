//! Acknowledgement handling and timer-driven retransmission.
//!
//! Acks are cumulative and idempotent: any value acks every send
//! seqnum strictly below it. They arrive piggybacked on data packets or
//! as explicit LIBACK messages carrying a monotonic ack id; obsolete
//! values (by window or by ack id) are dropped. On the generation side,
//! a partner owes an ack either immediately (too many unacked seqnums,
//! or a peer that apparently lost one) or after the ack delay.

use omx_driver::abi::SendLiback;
use omx_wire::Seq;
use tracing::{info, trace};

use crate::{
    config::Config,
    endpoint::Endpoint,
    error::Status,
    partner::PartnerId,
    queue::RequestQueue,
    request::{LinkKind, RequestId, RequestState, RequestType, SendKind},
};

impl Endpoint {
    /// Applies a positive or negative ack to one send request that was
    /// already unlinked from its partner queue.
    pub(crate) fn mark_request_acked(&mut self, id: RequestId, status: Status) {
        {
            let req = self.reqs.req_mut(id);
            debug_assert!(req.state.contains(RequestState::NEED_ACK));
            req.state -= RequestState::NEED_ACK;
        }

        match self.reqs.req(id).ty {
            RequestType::SendTiny | RequestType::SendSmall | RequestType::SendMediumVa => {
                self.non_acked_req_q.remove(&mut self.reqs, id);
                self.send_complete(id, status);
            }
            RequestType::SendMediumSq => {
                if self
                    .reqs
                    .req(id)
                    .state
                    .contains(RequestState::DRIVER_MEDIUMSQ_SENDING)
                {
                    // still sending: remember the verdict, the final
                    // fragment-done event completes it
                    let req = self.reqs.req_mut(id);
                    if req.status.code == Status::Success {
                        req.status.code = status;
                    }
                } else {
                    self.non_acked_req_q.remove(&mut self.reqs, id);
                    self.send_complete(id, status);
                }
            }
            RequestType::SendLarge => {
                self.non_acked_req_q.remove(&mut self.reqs, id);
                if status != Status::Success {
                    // nacked: no notify will ever come
                    self.reqs.req_mut(id).state -= RequestState::NEED_REPLY;
                    self.send_complete(id, status);
                } else if self.reqs.req(id).state.contains(RequestState::NEED_REPLY) {
                    self.large_send_need_reply_req_q.push_back(&mut self.reqs, id);
                } else {
                    self.send_complete(id, status);
                }
            }
            RequestType::RecvLarge => {
                // the acked message is our notify
                self.non_acked_req_q.remove(&mut self.reqs, id);
                self.recv_complete(id, status);
            }
            ty => unreachable!("cannot ack request type {ty:?}"),
        }
    }

    /// Processes a cumulative ack: completes every send below
    /// `ack_before` and releases throttled sends for the freed seqnums.
    pub(crate) fn handle_ack(&mut self, pid: PartnerId, ack_before: Seq) {
        let (missing_acks, new_acks) = {
            let partner = self.partner(pid);
            (
                partner.next_send_seq.dist_from(partner.next_acked_send_seq),
                ack_before.dist_from(partner.next_acked_send_seq),
            )
        };
        if new_acks == 0 || new_acks > missing_acks {
            trace!(
                target: "omx::ack",
                up_to = %ack_before,
                new_acks,
                missing_acks,
                "obsolete ack"
            );
            return;
        }

        trace!(target: "omx::ack", up_to = %ack_before, new_acks, "applying ack");
        loop {
            let Some(id) = self.partner(pid).non_acked_req_q.front() else {
                break;
            };
            let req_index = {
                let partner = self.partner(pid);
                self.reqs
                    .req(id)
                    .send_seqnum
                    .dist_from(partner.next_acked_send_seq)
            };
            if req_index >= new_acks {
                break;
            }
            let partner = self.partners[pid.0 as usize].as_deref_mut().expect("live partner");
            partner.non_acked_req_q.remove(&mut self.reqs, id);
            self.mark_request_acked(id, Status::Success);
        }

        self.partner_mut(pid).next_acked_send_seq = ack_before;
        self.process_throttling_requests(pid, u32::from(new_acks));
    }

    /// Processes an explicit LIBACK event.
    pub(crate) fn handle_liback(
        &mut self,
        pid: PartnerId,
        session_id: u32,
        acknum: u64,
        lib_seqnum_up_to: Seq,
    ) {
        if session_id != self.session_id {
            trace!(target: "omx::ack", "liback for another incarnation, dropping");
            return;
        }
        {
            let partner = self.partner(pid);
            if !lib_seqnum_up_to.same_session(partner.next_send_seq) {
                trace!(target: "omx::ack", "liback from an obsolete session epoch, dropping");
                return;
            }
            if acknum <= partner.last_recv_acknum {
                trace!(
                    target: "omx::ack",
                    acknum,
                    last = partner.last_recv_acknum,
                    "obsolete liback acknum"
                );
                return;
            }
        }
        self.partner_mut(pid).last_recv_acknum = acknum;
        self.handle_ack(pid, lib_seqnum_up_to);
    }

    /// Processes a NACK from the remote driver: the identified send (or
    /// connect) fails immediately with the mapped status.
    pub(crate) fn handle_nack(&mut self, pid: PartnerId, seqnum: Seq, status: Status) {
        let nack_index = {
            let partner = self.partner(pid);
            seqnum.dist_from(partner.next_acked_send_seq)
        };

        let mut cur = self.partner(pid).non_acked_req_q.front();
        while let Some(id) = cur {
            let req_index = {
                let partner = self.partner(pid);
                self.reqs
                    .req(id)
                    .send_seqnum
                    .dist_from(partner.next_acked_send_seq)
            };
            if nack_index < req_index {
                break;
            }
            if nack_index == req_index {
                let partner = self.partners[pid.0 as usize].as_deref_mut().expect("live partner");
                partner.non_acked_req_q.remove(&mut self.reqs, id);
                self.mark_request_acked(id, status);
                return;
            }
            cur = self.partner(pid).non_acked_req_q.next_of(&self.reqs, id);
        }

        // maybe it was a connect that got refused
        let mut cur = self.partner(pid).connect_req_q.front();
        while let Some(id) = cur {
            if u16::from(self.reqs.req(id).connect().connect_seqnum) == seqnum.0 {
                self.connect_complete(id, status, None);
                return;
            }
            cur = self.partner(pid).connect_req_q.next_of(&self.reqs, id);
        }

        trace!(target: "omx::ack", seqnum = %seqnum, "no request to nack, probably a duplicate");
    }

    // ---- ack generation ---------------------------------------------

    fn submit_liback(&mut self, pid: PartnerId) -> Result<(), ()> {
        let cmd = {
            let partner = self.partner_mut(pid);
            partner.last_send_acknum += 1;
            SendLiback {
                peer_index: partner.peer_index,
                dest_endpoint: partner.endpoint_index,
                shared: 0,
                session_id: partner.back_session_id,
                acknum: partner.last_send_acknum,
                lib_seqnum_up_to: partner.needed_ack().0,
                pad: [0; 6],
            }
        };
        trace!(target: "omx::ack", up_to = cmd.lib_seqnum_up_to, "explicit ack");
        self.driver.send_liback(&cmd).map_err(|_| ())
    }

    /// Emits owed explicit acks: the immediate ones first, then the
    /// delayed ones whose timer expired.
    pub(crate) fn process_partners_to_ack(&mut self) {
        while let Some(&pid) = self.partners_to_ack_immediate.front() {
            if self.submit_liback(pid).is_err() {
                // driver backpressure: retry the whole list next pass
                return;
            }
            self.mark_partner_ack_sent(pid);
        }

        let now = self.driver.jiffies();
        if now == self.last_partners_acking_jiffies {
            return;
        }
        self.last_partners_acking_jiffies = now;

        while let Some(&pid) = self.partners_to_ack_delayed.front() {
            let oldest = self.partner(pid).oldest_recv_time_not_acked;
            if now.saturating_sub(oldest) < self.ack_delay_jiffies {
                // the rest are more recent
                break;
            }
            if self.submit_liback(pid).is_err() {
                return;
            }
            self.mark_partner_ack_sent(pid);
        }
    }

    /// Flushes every owed ack regardless of timers, on endpoint close.
    pub(crate) fn flush_partners_to_ack(&mut self) {
        while let Some(&pid) = self.partners_to_ack_immediate.front() {
            if self.submit_liback(pid).is_err() {
                return;
            }
            self.mark_partner_ack_sent(pid);
        }
        while let Some(&pid) = self.partners_to_ack_delayed.front() {
            if self.submit_liback(pid).is_err() {
                return;
            }
            self.mark_partner_ack_sent(pid);
        }
    }

    // ---- retransmission ---------------------------------------------

    /// Retransmits unacked sends and unreplied connects whose resend
    /// timer expired; a request past its resend budget tears its whole
    /// partner down.
    pub(crate) fn process_resend_requests(&mut self) {
        let now = self.driver.jiffies();
        let resend_delay = self.resend_delay_jiffies;

        let mut reposted = RequestQueue::new(LinkKind::Work);
        loop {
            let Some(id) = self.non_acked_req_q.front() else {
                break;
            };
            let req = self.reqs.req(id);
            if now.saturating_sub(req.last_send_jiffies) < resend_delay {
                // the rest are more recent
                break;
            }
            if req.resends > req.resends_max {
                let pid = req.partner.expect("unacked send has a partner");
                info!(
                    seqnum = %req.send_seqnum,
                    resends = req.resends,
                    "send request timeout, resetting partner"
                );
                // the cleanup completes (and unlinks) this request and
                // everything else bound to the partner; restart from the
                // front of what remains
                self.partner_cleanup(pid, 1);
                continue;
            }

            let pid = req.partner.expect("unacked send has a partner");
            let ty = req.ty;
            if ty == RequestType::SendMediumSq {
                let frags_nr = {
                    let SendKind::MediumSq { frags_nr, .. } = &self.reqs.req(id).send().kind
                    else {
                        unreachable!("mediumsq request")
                    };
                    *frags_nr
                };
                if self.avail_exp_events < frags_nr {
                    // not enough credits to restage: try again next pass
                    trace!(target: "omx::ack", "postponing mediumsq resend, no event credits");
                    break;
                }
                self.avail_exp_events -= frags_nr;
            }

            self.non_acked_req_q.remove(&mut self.reqs, id);
            trace!(target: "omx::ack", seqnum = %self.reqs.req(id).send_seqnum, "retransmitting");
            match ty {
                RequestType::SendTiny => self.post_isend_tiny(pid, id),
                RequestType::SendSmall => self.post_isend_small(pid, id),
                RequestType::SendMediumSq => self.post_isend_mediumsq(pid, id),
                RequestType::SendMediumVa => self.post_isend_mediumva(pid, id),
                RequestType::SendLarge => self.post_isend_rndv(pid, id),
                RequestType::RecvLarge => self.post_notify(pid, id),
                ty => unreachable!("cannot retransmit request type {ty:?}"),
            }

            if self
                .reqs
                .req(id)
                .state
                .contains(RequestState::DRIVER_MEDIUMSQ_SENDING)
            {
                self.driver_mediumsq_sending_req_q.push_back(&mut self.reqs, id);
            } else {
                reposted.push_back(&mut self.reqs, id);
            }
        }
        // reposted requests go to the tail, keeping oldest-first order
        self.non_acked_req_q.append(&mut self.reqs, &mut reposted);

        let mut reconnects = RequestQueue::new(LinkKind::Work);
        loop {
            let Some(id) = self.connect_req_q.front() else {
                break;
            };
            let req = self.reqs.req(id);
            if now.saturating_sub(req.last_send_jiffies) < resend_delay {
                break;
            }
            if req.resends > req.resends_max {
                let pid = req.partner.expect("connect has a partner");
                info!(
                    connect_seqnum = req.connect().connect_seqnum,
                    resends = req.resends,
                    "connect request timeout, resetting partner"
                );
                self.partner_cleanup(pid, 1);
                continue;
            }
            let pid = req.partner.expect("connect has a partner");
            self.connect_req_q.remove(&mut self.reqs, id);
            self.post_connect_request(pid, id);
            reconnects.push_back(&mut self.reqs, id);
        }
        self.connect_req_q.append(&mut self.reqs, &mut reconnects);
    }

    /// Publishes the earliest jiffies at which a timer (delayed ack,
    /// send resend, connect resend) wants the endpoint woken.
    pub(crate) fn prepare_progress_wakeup(&mut self) {
        let mut wakeup = omx_driver::abi::NO_WAKEUP_JIFFIES;

        if let Some(&pid) = self.partners_to_ack_delayed.front() {
            let at = self.partner(pid).oldest_recv_time_not_acked + self.ack_delay_jiffies;
            wakeup = wakeup.min(at);
        }
        if let Some(id) = self.non_acked_req_q.front() {
            let at = self.reqs.req(id).last_send_jiffies + self.resend_delay_jiffies;
            wakeup = wakeup.min(at);
        }
        if let Some(id) = self.connect_req_q.front() {
            let at = self.reqs.req(id).last_send_jiffies + self.resend_delay_jiffies;
            wakeup = wakeup.min(at);
        }

        self.driver.set_wakeup_jiffies(wakeup);
    }

    /// Overrides the retransmission budget of one request, or of every
    /// future request on this endpoint when `request` is `None`.
    pub fn set_request_timeout(&mut self, request: Option<RequestId>, ms: u32) {
        let resends = Config::timeout_ms_to_resends(ms);
        match request {
            Some(id) => {
                if let Some(req) = self.reqs.get_mut(id) {
                    req.resends_max = resends;
                }
            }
            None => {
                self.req_resends_max = resends;
                let hz = self.driver.hz();
                self.pull_resend_timeout_jiffies =
                    ((u64::from(ms) * u64::from(hz) + 1023) / 1024) as u32;
            }
        }
    }
}
