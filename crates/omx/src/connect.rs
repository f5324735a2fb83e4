//! The symmetric connection handshake and partner teardown.
//!
//! Connecting exchanges session ids and seqnum starting points: the
//! request tells the target where to start sending towards us, the
//! reply tells us where to start sending towards it. Either side
//! noticing a new incarnation of the other (a changed session id) tears
//! the old partner state down first, completing every request bound to
//! it with [`Status::RemoteEndpointUnreachable`].

use omx_driver::abi::{SendConnectReply, SendConnectRequest, WaitEvent, WAIT_EVENT_STATUS_TIMEOUT};
use omx_wire::{ConnectStatus, Seq};
use tracing::{debug, info};

use crate::{
    addr::EndpointAddr,
    config::Config,
    endpoint::Endpoint,
    error::{Error, Status},
    partner::{PartnerId, NeedAck, SESSION_UNSET},
    request::{
        ConnectData, Request, RequestData, RequestId, RequestState, RequestType,
    },
};

impl Endpoint {
    /// Asynchronously connects to `(nic_id, endpoint_id)`, presenting
    /// `key`; completion carries the resulting [`EndpointAddr`].
    pub fn iconnect(
        &mut self,
        nic_id: u64,
        endpoint_id: u32,
        key: u32,
        context: u64,
    ) -> Result<RequestId, Error> {
        let mut req = Request::new(
            RequestType::Connect,
            RequestData::Connect(ConnectData {
                cmd: SendConnectRequest::default(),
                session_id: self.session_id,
                connect_seqnum: 0,
            }),
        );
        req.status.context = context;
        let id = self.reqs.alloc(req);
        if let Err(err) = self.connect_common(nic_id, endpoint_id, key, id) {
            self.reqs.free(id);
            return Err(err);
        }
        self.progress()?;
        Ok(id)
    }

    /// Synchronously connects, waiting up to `timeout_ms` (`None` for
    /// no bound).
    pub fn connect(
        &mut self,
        nic_id: u64,
        endpoint_id: u32,
        key: u32,
        timeout_ms: Option<u32>,
    ) -> Result<EndpointAddr, Error> {
        let mut req = Request::new(
            RequestType::Connect,
            RequestData::Connect(ConnectData {
                cmd: SendConnectRequest::default(),
                session_id: self.session_id,
                connect_seqnum: 0,
            }),
        );
        // synchronous connects are internal: never visible to peek
        req.state = RequestState::INTERNAL;
        let id = self.reqs.alloc(req);
        if let Err(err) = self.connect_common(nic_id, endpoint_id, key, id) {
            self.reqs.free(id);
            return Err(err);
        }

        debug!(nic = nic_id, endpoint = endpoint_id, "waiting for connect reply");
        let timeout_jiffies = match timeout_ms {
            None => omx_driver::abi::WAIT_EVENT_TIMEOUT_INFINITE,
            Some(ms) => {
                let hz = u64::from(self.driver.hz());
                self.driver.jiffies() + (u64::from(ms) * hz + 1023) / 1024
            }
        };
        loop {
            self.progress()?;
            if self.reqs.req(id).state.contains(RequestState::DONE) {
                break;
            }
            if self.driver.jiffies() >= timeout_jiffies {
                break;
            }
            self.prepare_progress_wakeup();
            let mut wait = WaitEvent {
                timeout_jiffies,
                user_event_index: self.driver.user_event_count(),
                ..WaitEvent::default()
            };
            if self.driver.wait_event(&mut wait).is_err() {
                break;
            }
            if wait.status == WAIT_EVENT_STATUS_TIMEOUT {
                self.progress()?;
                break;
            }
        }

        if !self.reqs.req(id).state.contains(RequestState::DONE) {
            // never completed: withdraw it
            let pid = self.reqs.req(id).partner.expect("connect has a partner");
            self.connect_req_q.remove(&mut self.reqs, id);
            let partner = self.partners[pid.0 as usize].as_deref_mut().expect("live partner");
            partner.connect_req_q.remove(&mut self.reqs, id);
            self.reqs.free(id);
            return Err(Error::Timeout);
        }

        let status = self.reqs.req(id).status;
        self.reqs.free(id);
        match status.code {
            Status::Success => Ok(status.addr),
            Status::RemoteEndpointBadConnectionKey => Err(Error::BadConnectionKey),
            Status::RemoteEndpointUnreachable => Err(Error::Timeout),
            _ => Err(Error::Timeout),
        }
    }

    fn connect_common(
        &mut self,
        nic_id: u64,
        endpoint_id: u32,
        key: u32,
        id: RequestId,
    ) -> Result<(), Error> {
        let pid = self
            .partner_lookup_by_addr(nic_id, endpoint_id as u8)
            .map_err(|err| match err {
                Error::PeerNotFound => Error::NicIdNotFound,
                other => other,
            })?;

        self.reqs.req_mut(id).state |= RequestState::NEED_REPLY;
        self.reqs.req_mut(id).partner = Some(pid);

        if self.config.selfcomms && pid == self.myself {
            self.connect_req_q.push_back(&mut self.reqs, id);
            let partner = self.partners[pid.0 as usize].as_deref_mut().expect("live partner");
            partner.connect_req_q.push_back(&mut self.reqs, id);
            let session = self.session_id;
            self.connect_complete(id, Status::Success, Some(session));
            self.driver.notify_user_event();
            return Ok(());
        }

        let connect_seqnum = {
            let partner = self.partner_mut(pid);
            let seqnum = partner.connect_seqnum;
            partner.connect_seqnum = partner.connect_seqnum.wrapping_add(1);
            seqnum
        };
        let (peer_index, endpoint_index) = {
            let partner = self.partner(pid);
            (partner.peer_index, partner.endpoint_index)
        };
        let src_session = self.session_id;
        let resends_max = self.req_resends_max;
        {
            let req = self.reqs.req_mut(id);
            req.resends = 0;
            req.resends_max = resends_max;
            let RequestData::Connect(connect) = &mut req.data else {
                unreachable!("connect request")
            };
            connect.connect_seqnum = connect_seqnum;
            connect.session_id = src_session;
            connect.cmd = SendConnectRequest {
                peer_index,
                dest_endpoint: endpoint_index,
                shared: 0,
                app_key: key,
                src_session_id: src_session,
                target_recv_seqnum_start: 0,
                connect_seqnum,
                pad: 0,
            };
        }

        self.post_connect_request(pid, id);
        self.connect_req_q.push_back(&mut self.reqs, id);
        let partner = self.partners[pid.0 as usize].as_deref_mut().expect("live partner");
        partner.connect_req_q.push_back(&mut self.reqs, id);
        Ok(())
    }

    pub(crate) fn post_connect_request(&mut self, pid: PartnerId, id: RequestId) {
        let target_start = self.partner(pid).next_match_recv_seq;
        let now = self.driver.jiffies();
        let cmd = {
            let req = self.reqs.req_mut(id);
            let RequestData::Connect(connect) = &mut req.data else {
                unreachable!("connect request")
            };
            connect.cmd.target_recv_seqnum_start = target_start.0;
            connect.cmd
        };
        // backpressure is left to the retransmission timer
        let _ = self.driver.send_connect_request(&cmd);
        let req = self.reqs.req_mut(id);
        req.resends += 1;
        req.last_send_jiffies = now;
    }

    /// Completes a connect request with its final status (and the
    /// target's session id on success).
    pub(crate) fn connect_complete(&mut self, id: RequestId, status: Status, session: Option<u32>) {
        let pid = self.reqs.req(id).partner.expect("connect has a partner");
        self.connect_req_q.remove(&mut self.reqs, id);
        let partner = self.partners[pid.0 as usize].as_deref_mut().expect("live partner");
        partner.connect_req_q.remove(&mut self.reqs, id);

        {
            let req = self.reqs.req_mut(id);
            req.state -= RequestState::NEED_REPLY;
            if req.status.code == Status::Success {
                req.status.code = status;
            }
        }
        if status == Status::Success {
            let addr = self.partner_addr(pid, session.expect("session on success"));
            self.reqs.req_mut(id).status.addr = addr;
        }
        self.notify_request_done(id);
    }

    /// A peer wants to connect to us: validate the key, adopt its
    /// session, reply.
    pub(crate) fn process_recv_connect_request(
        &mut self,
        peer_index: u16,
        src_endpoint: u8,
        shared: bool,
        src_session_id: u32,
        app_key: u32,
        target_recv_seqnum_start: Seq,
        connect_seqnum: u8,
    ) {
        let Ok(pid) = self.partner_lookup(peer_index, src_endpoint) else {
            debug!(peer = peer_index, "connect request from unknown peer, dropping");
            return;
        };
        self.partner_check_localization(pid, shared);

        let status = if app_key == self.app_key {
            0
        } else {
            1 // bad key
        };

        if self.partner(pid).back_session_id != src_session_id {
            // first contact, or a new incarnation of the peer
            if self.partner(pid).back_session_id != SESSION_UNSET {
                info!("connect request from a new instance of a partner, cleaning old state");
                self.partner_cleanup(pid, 0);
            }
            let partner = self.partner_mut(pid);
            partner.next_match_recv_seq = partner.next_match_recv_seq.reset();
            partner.next_frag_recv_seq = partner.next_match_recv_seq;
            partner.last_acked_recv_seq = partner.next_frag_recv_seq;
        }
        if self.partner(pid).true_session_id != src_session_id {
            // reset our send window to what the peer expects
            let partner = self.partner_mut(pid);
            partner.next_send_seq = target_recv_seqnum_start;
            partner.next_acked_send_seq = target_recv_seqnum_start;
        }
        {
            let partner = self.partner_mut(pid);
            partner.true_session_id = src_session_id;
            partner.back_session_id = src_session_id;
        }

        let reply = {
            let partner = self.partner(pid);
            SendConnectReply {
                peer_index: partner.peer_index,
                dest_endpoint: partner.endpoint_index,
                shared: 0,
                src_session_id,
                target_session_id: self.session_id,
                target_recv_seqnum_start: partner.next_match_recv_seq.0,
                connect_seqnum,
                status,
            }
        };
        // on failure the peer's retransmitted request triggers another
        // reply
        let _ = self.driver.send_connect_reply(&reply);
    }

    /// The reply to one of our connect requests arrived.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn process_recv_connect_reply(
        &mut self,
        peer_index: u16,
        src_endpoint: u8,
        shared: bool,
        src_session_id: u32,
        target_session_id: u32,
        target_recv_seqnum_start: Seq,
        connect_seqnum: u8,
        status: ConnectStatus,
    ) {
        let Ok(pid) = self.partner_lookup(peer_index, src_endpoint) else {
            debug!(peer = peer_index, "connect reply from unknown peer, dropping");
            return;
        };
        self.partner_check_localization(pid, shared);

        // find the matching pending connect: ours (endpoint session) and
        // this handshake (connect seqnum)
        let mut matched = None;
        let mut cur = self.partner(pid).connect_req_q.front();
        while let Some(id) = cur {
            let connect = self.reqs.req(id).connect();
            if src_session_id == self.session_id && connect.connect_seqnum == connect_seqnum {
                matched = Some(id);
                break;
            }
            cur = self.partner(pid).connect_req_q.next_of(&self.reqs, id);
        }
        let Some(id) = matched else {
            return;
        };

        let status_code = match status {
            ConnectStatus::Success => Status::Success,
            ConnectStatus::BadKey => Status::RemoteEndpointBadConnectionKey,
        };
        debug!(
            peer = peer_index,
            endpoint = src_endpoint,
            ?status_code,
            "connect reply"
        );

        // complete first, so a partner cleanup below cannot find this
        // request again
        self.connect_complete(id, status_code, Some(target_session_id));

        if status_code == Status::Success {
            if self.partner(pid).back_session_id != target_session_id
                && self.partner(pid).back_session_id != SESSION_UNSET
            {
                info!("connect reply from a new instance of a partner, cleaning old state");
                self.partner_cleanup(pid, 0);
            }
            if self.partner(pid).true_session_id != target_session_id {
                let partner = self.partner_mut(pid);
                partner.next_send_seq = target_recv_seqnum_start;
                partner.next_acked_send_seq = target_recv_seqnum_start;
            }
            self.partner_mut(pid).true_session_id = target_session_id;
        }
    }

    // ---- teardown ----------------------------------------------------

    /// Cancels or completes every request bound to a partner, resets it,
    /// and — at disconnect level 2 — removes it from the table.
    ///
    /// Level 0 is a session change, level 1 a retransmission timeout
    /// (the receive epoch is bumped so stragglers of the dead session
    /// cannot alias), level 2 an application disconnect.
    pub(crate) fn partner_cleanup(&mut self, pid: PartnerId, disconnect: u8) {
        let board_addr = self.partner(pid).board_addr;
        if disconnect <= 1 {
            info!(
                board = board_addr,
                endpoint = self.partner(pid).endpoint_index,
                "cleaning partner"
            );
        }

        // pending sends, oldest first, so completions observe a
        // consistent partner state
        let mut dropped = 0usize;
        loop {
            let Some(id) = self.partner(pid).non_acked_req_q.front() else {
                break;
            };
            let partner = self.partners[pid.0 as usize].as_deref_mut().expect("live partner");
            partner.non_acked_req_q.remove(&mut self.reqs, id);
            self.mark_request_acked(id, Status::RemoteEndpointUnreachable);
            dropped += 1;
        }
        if dropped > 0 {
            info!(dropped, "dropped pending send requests to partner");
        }

        // acked large sends still waiting for their notify
        for id in self.large_send_need_reply_req_q.ids(&self.reqs) {
            if self.reqs.req(id).partner != Some(pid) {
                continue;
            }
            self.large_send_need_reply_req_q.remove(&mut self.reqs, id);
            debug_assert!(self.reqs.req(id).state.contains(RequestState::NEED_REPLY));
            self.reqs.req_mut(id).state -= RequestState::NEED_REPLY;
            self.send_complete(id, Status::RemoteEndpointUnreachable);
        }

        // delayed submissions that never acquired their resources
        for id in self.need_resources_send_req_q.ids(&self.reqs) {
            if self.reqs.req(id).partner != Some(pid) {
                continue;
            }
            self.need_resources_send_req_q.remove(&mut self.reqs, id);
            self.reqs.req_mut(id).state -= RequestState::NEED_RESOURCES;
            self.complete_unsent_send_request(id);
        }

        // throttled sends, parked on the partner only
        loop {
            let popped = {
                let partner = self.partners[pid.0 as usize].as_deref_mut().expect("live partner");
                partner.need_seqnum_send_req_q.pop_front(&mut self.reqs)
            };
            let Some(id) = popped else { break };
            debug_assert!(self.reqs.req(id).state.contains(RequestState::NEED_SEQNUM));
            self.complete_unsent_send_request(id);
        }

        // pending connects
        while let Some(id) = self.partner(pid).connect_req_q.front() {
            self.connect_complete(id, Status::RemoteEndpointUnreachable, None);
        }

        // partially received mediums
        loop {
            let Some(id) = self.partner(pid).partial_medium_recv_req_q.front() else {
                break;
            };
            let partner = self.partners[pid.0 as usize].as_deref_mut().expect("live partner");
            partner.partial_medium_recv_req_q.remove(&mut self.reqs, id);
            if self.reqs.req(id).state.contains(RequestState::UNEXPECTED_RECV) {
                // never exposed to the application: drop outright
                self.unexp_unlink_for_cleanup(id);
                self.reqs.free(id);
            } else {
                self.partial_medium_recv_req_q.remove(&mut self.reqs, id);
                self.reqs.req_mut(id).state -= RequestState::RECV_PARTIAL;
                self.recv_complete(id, Status::RemoteEndpointUnreachable);
            }
        }

        // early packets
        self.partner_mut(pid).early_recv_q.clear();

        // buffered unexpecteds from this peer
        for id in self.anyctxid_unexp_req_q.ids(&self.reqs) {
            if self.reqs.req(id).partner != Some(pid) {
                continue;
            }
            self.unexp_unlink_for_cleanup(id);
            self.reqs.free(id);
        }

        // detach from the endpoint-wide partner lists before resetting
        match self.partner(pid).need_ack {
            NeedAck::No => {}
            NeedAck::Delayed => self.partners_to_ack_delayed.retain(|&p| p != pid),
            NeedAck::Immediate => self.partners_to_ack_immediate.retain(|&p| p != pid),
        }
        if self.partner(pid).throttling_sends_nr > 0 {
            self.throttling_partners.retain(|&p| p != pid);
        }

        self.partner_mut(pid).reset();

        if disconnect > 0 {
            // make wandering packets of the old session unmistakable
            self.partner_mut(pid).bump_session_epoch();
            if disconnect > 1 {
                self.partners[pid.0 as usize] = None;
            }
        }
    }

    fn unexp_unlink_for_cleanup(&mut self, id: RequestId) {
        self.anyctxid_unexp_req_q.remove(&mut self.reqs, id);
        if self.has_ctxids() {
            let ctxid = self.ctxid_from_match(self.reqs.req(id).status.match_info);
            self.ctxids[ctxid].unexp_req_q.remove(&mut self.reqs, id);
        }
    }

    /// Invalidates `addr`: completes everything pending towards it and
    /// forgets the partner entirely.
    pub fn disconnect(&mut self, addr: EndpointAddr) -> Result<(), Error> {
        self.progress()?;
        let pid = self.partner_lookup(addr.peer_index, addr.endpoint_index)?;
        self.partner_cleanup(pid, 2);
        Ok(())
    }
}

/// Effective wall-clock timeout of the default retransmission budget.
#[must_use]
pub fn default_request_timeout_ms() -> u32 {
    Config::get().resends_max.saturating_mul(1024) / crate::config::RESENDS_PER_SECOND
}
