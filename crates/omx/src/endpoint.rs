//! Endpoint lifecycle and the bookkeeping shared by every pipeline:
//! the request arena, the named queues, the partner table, resource
//! counters, and the per-partner ack/throttling lists.
//!
//! An [`Endpoint`] is exclusively owned: public operations take
//! `&mut self`, which provides the mutual exclusion the original
//! design obtained from a per-endpoint mutex. An application sharing an
//! endpoint across threads wraps it in its own lock.

use std::collections::VecDeque;

use omx_driver::{
    abi::{EVENTQ_ENTRY_NR, SENDQ_ENTRY_NR, USER_REGION_MAX},
    Driver,
};
use omx_wire::Seq;
use tracing::{debug, trace, warn};

use crate::{
    addr::EndpointAddr,
    config::Config,
    error::Error,
    partner::{NeedAck, Partner, PartnerId},
    queue::RequestQueue,
    region::RegionMap,
    request::{LinkKind, RequestArena, RequestId, RequestState},
};

bitflags::bitflags! {
    /// Why progression is currently disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct ProgressionDisabled: u8 {
        /// The unexpected handler is running.
        const IN_HANDLER = 1 << 0;
        /// The application called `disable_progression`.
        const BY_API = 1 << 1;
    }
}

/// Verdict of an unexpected-message handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnexpHandlerAction {
    /// The handler consumed the message; the library discards it.
    Finished,
    /// Re-attempt matching: the handler may have posted a receive.
    Continue,
}

/// The unexpected message snapshot handed to the handler.
#[derive(Debug)]
pub struct UnexpMessage<'a> {
    /// Address of the sender.
    pub source: EndpointAddr,
    /// Match information of the message.
    pub match_info: u64,
    /// Full message length.
    pub msg_length: u32,
    /// Payload, when it is already available (tiny and small messages).
    pub data: Option<&'a [u8]>,
}

/// Handler invoked when an inbound message matches no posted receive.
pub type UnexpHandler = dyn FnMut(&UnexpMessage<'_>) -> UnexpHandlerAction + Send;

/// Per-context-id matching lanes.
pub(crate) struct CtxidQueues {
    /// Posted, not-yet-matched receives (work link).
    pub recv_req_q: RequestQueue,
    /// Unexpected messages of this context (ctxid link).
    pub unexp_req_q: RequestQueue,
    /// Completed requests of this context (ctxid link).
    pub done_req_q: RequestQueue,
}

impl CtxidQueues {
    fn new() -> Self {
        Self {
            recv_req_q: RequestQueue::new(LinkKind::Work),
            unexp_req_q: RequestQueue::new(LinkKind::Ctxid),
            done_req_q: RequestQueue::new(LinkKind::Ctxid),
        }
    }
}

/// Optional per-endpoint overrides applied at open time.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointParams {
    /// Context-id bits carved out of the match space; defaults to the
    /// environment setting.
    pub ctxid_bits: Option<u8>,
    /// Shift of the context-id field; defaults to the environment
    /// setting.
    pub ctxid_shift: Option<u8>,
}

/// A local communication handle bound to one (board, endpoint index)
/// pair.
pub struct Endpoint {
    pub(crate) driver: Box<dyn Driver + Send>,
    pub(crate) config: &'static Config,
    pub(crate) app_key: u32,
    pub(crate) endpoint_index: u8,
    pub(crate) board_addr: u64,
    pub(crate) session_id: u32,
    pub(crate) endpoint_max: u32,

    pub(crate) reqs: RequestArena,

    pub(crate) ctxid_bits: u8,
    pub(crate) ctxid_shift: u8,
    pub(crate) ctxid_mask: u64,
    pub(crate) ctxids: Vec<CtxidQueues>,
    /// Completed requests across all contexts (done link).
    pub(crate) anyctxid_done_req_q: RequestQueue,
    /// Unexpected messages across all contexts (work link).
    pub(crate) anyctxid_unexp_req_q: RequestQueue,
    /// Posted receives whose mask ignores the context-id bits entirely,
    /// matching across every context (work link).
    pub(crate) anyctxid_recv_req_q: RequestQueue,

    /// Sends delayed by a resource shortage, FIFO (work link).
    pub(crate) need_resources_send_req_q: RequestQueue,
    /// Staged medium sends with fragments still in the driver.
    pub(crate) driver_mediumsq_sending_req_q: RequestQueue,
    /// Acked large sends still waiting for their notify.
    pub(crate) large_send_need_reply_req_q: RequestQueue,
    /// Large receives with a pull in the driver.
    pub(crate) driver_pulling_req_q: RequestQueue,
    /// Connects waiting for a reply, oldest first.
    pub(crate) connect_req_q: RequestQueue,
    /// Unacked sends, oldest first, scanned by retransmission.
    pub(crate) non_acked_req_q: RequestQueue,
    /// Self-directed sends waiting for a matching receive.
    pub(crate) unexp_self_send_req_q: RequestQueue,
    /// Matched expected mediums with fragments missing.
    pub(crate) partial_medium_recv_req_q: RequestQueue,

    pub(crate) sendq_free: Vec<u16>,
    pub(crate) sendq_users: Vec<Option<RequestId>>,

    pub(crate) regions: RegionMap,
    /// Expected-event ring credits; reserved before any command that
    /// will produce an expected event.
    pub(crate) avail_exp_events: u32,
    /// Bound on simultaneous outstanding large sends, against region
    /// deadlock between two peers sending large to each other.
    pub(crate) large_sends_avail: u32,

    pub(crate) partners: Vec<Option<Box<Partner>>>,
    pub(crate) myself: PartnerId,
    pub(crate) partners_to_ack_immediate: VecDeque<PartnerId>,
    pub(crate) partners_to_ack_delayed: VecDeque<PartnerId>,
    pub(crate) throttling_partners: VecDeque<PartnerId>,

    pub(crate) zombies: u32,
    pub(crate) zombie_max: u32,
    pub(crate) req_resends_max: u32,
    pub(crate) pull_resend_timeout_jiffies: u32,
    pub(crate) resend_delay_jiffies: u64,
    pub(crate) ack_delay_jiffies: u64,
    pub(crate) check_status_delay_jiffies: u64,
    pub(crate) last_check_jiffies: u64,
    pub(crate) last_partners_acking_jiffies: u64,

    pub(crate) progression_disabled: ProgressionDisabled,
    pub(crate) unexp_handler: Option<Box<UnexpHandler>>,
    closed: bool,
}

impl Endpoint {
    /// Opens an endpoint over an already-attached driver handle.
    ///
    /// The driver handle determines the board and endpoint index; `key`
    /// is the application key checked during connect handshakes.
    pub fn open(
        driver: Box<dyn Driver + Send>,
        key: u32,
        params: EndpointParams,
    ) -> Result<Self, Error> {
        crate::ensure_initialized()?;
        let config = Config::get();

        let ctxid_bits = params.ctxid_bits.unwrap_or(config.ctxid_bits);
        let ctxid_shift = params.ctxid_shift.unwrap_or(config.ctxid_shift);
        if ctxid_bits > 16 || u32::from(ctxid_bits) + u32::from(ctxid_shift) > 64 {
            return Err(Error::BadEndpoint);
        }
        let ctxid_max = 1u32 << ctxid_bits;
        let ctxid_mask = if ctxid_bits == 0 {
            0
        } else {
            u64::from(ctxid_max - 1) << ctxid_shift
        };

        let hz = driver.hz();
        let endpoint_max = driver.endpoint_max();
        let board_addr = driver.board_info().addr;
        let endpoint_index = driver.endpoint_index();
        let session_id = driver.session_id();

        let mut ep = Self {
            config,
            app_key: key,
            endpoint_index,
            board_addr,
            session_id,
            endpoint_max,

            reqs: RequestArena::new(),

            ctxid_bits,
            ctxid_shift,
            ctxid_mask,
            ctxids: (0..ctxid_max).map(|_| CtxidQueues::new()).collect(),
            anyctxid_done_req_q: RequestQueue::new(LinkKind::Done),
            anyctxid_unexp_req_q: RequestQueue::new(LinkKind::Work),
            anyctxid_recv_req_q: RequestQueue::new(LinkKind::Work),

            need_resources_send_req_q: RequestQueue::new(LinkKind::Work),
            driver_mediumsq_sending_req_q: RequestQueue::new(LinkKind::Work),
            large_send_need_reply_req_q: RequestQueue::new(LinkKind::Work),
            driver_pulling_req_q: RequestQueue::new(LinkKind::Work),
            connect_req_q: RequestQueue::new(LinkKind::Work),
            non_acked_req_q: RequestQueue::new(LinkKind::Work),
            unexp_self_send_req_q: RequestQueue::new(LinkKind::Work),
            partial_medium_recv_req_q: RequestQueue::new(LinkKind::Work),

            sendq_free: (0..SENDQ_ENTRY_NR as u16).rev().collect(),
            sendq_users: vec![None; SENDQ_ENTRY_NR],

            regions: RegionMap::new(),
            avail_exp_events: EVENTQ_ENTRY_NR as u32,
            large_sends_avail: (USER_REGION_MAX / 2) as u32,

            partners: Vec::new(),
            myself: PartnerId(0),
            partners_to_ack_immediate: VecDeque::new(),
            partners_to_ack_delayed: VecDeque::new(),
            throttling_partners: VecDeque::new(),

            zombies: 0,
            zombie_max: config.zombie_max,
            req_resends_max: config.resends_max,
            pull_resend_timeout_jiffies: Config::resend_delay_jiffies(hz) as u32,
            resend_delay_jiffies: Config::resend_delay_jiffies(hz),
            ack_delay_jiffies: Config::ack_delay_jiffies(hz),
            check_status_delay_jiffies: u64::from(hz),
            last_check_jiffies: 0,
            last_partners_acking_jiffies: 0,

            progression_disabled: ProgressionDisabled::empty(),
            unexp_handler: None,
            closed: false,

            driver,
        };

        crate::register_endpoint();
        ep.connect_myself()?;
        debug!(
            board = board_addr,
            endpoint = endpoint_index,
            session = session_id,
            "endpoint open"
        );
        Ok(ep)
    }

    /// Closes the endpoint: flushes pending acks, tears down every
    /// partner (completing outstanding requests locally), and releases
    /// driver resources.
    pub fn close(mut self) -> Result<(), Error> {
        if self.progression_disabled.contains(ProgressionDisabled::IN_HANDLER) {
            return Err(Error::NotSupportedInHandler);
        }

        self.progress()?;
        self.flush_partners_to_ack();

        for index in 0..self.partners.len() {
            if self.partners[index].is_some() {
                self.partner_cleanup(PartnerId(index as u32), 0);
            }
        }

        for id in self.regions.live_ids() {
            let region = self.regions.extract(id);
            let _ = self.driver.destroy_user_region(region.id);
            self.regions.release_slot(id);
        }

        if self.reqs.len() != 0 {
            warn!(leaked = self.reqs.len(), "requests still allocated at close");
        }
        self.closed = true;
        crate::unregister_endpoint();
        Ok(())
    }

    /// The address other endpoints connect to us through.
    #[must_use]
    pub fn addr(&self) -> EndpointAddr {
        EndpointAddr {
            peer_index: self.partner(self.myself).peer_index,
            endpoint_index: self.endpoint_index,
            board_addr: self.board_addr,
            session_id: self.session_id,
        }
    }

    /// Splits an address into its NIC id and endpoint id.
    #[must_use]
    pub fn decompose_addr(addr: EndpointAddr) -> (u64, u32) {
        (addr.board_addr, u32::from(addr.endpoint_index))
    }

    /// Attaches an opaque cookie to the partner behind `addr`.
    pub fn set_addr_context(&mut self, addr: EndpointAddr, context: u64) -> Result<(), Error> {
        let pid = self.partner_lookup(addr.peer_index, addr.endpoint_index)?;
        self.partner_mut(pid).user_context = context;
        Ok(())
    }

    /// Reads the cookie attached to the partner behind `addr`.
    pub fn addr_context(&mut self, addr: EndpointAddr) -> Result<u64, Error> {
        let pid = self.partner_lookup(addr.peer_index, addr.endpoint_index)?;
        Ok(self.partner(pid).user_context)
    }

    /// Registers (or clears) the unexpected-message handler.
    pub fn register_unexp_handler(&mut self, handler: Option<Box<UnexpHandler>>) {
        self.unexp_handler = handler;
    }

    /// Disables library-internal progression until
    /// [`Endpoint::reenable_progression`].
    pub fn disable_progression(&mut self) {
        self.progression_disabled |= ProgressionDisabled::BY_API;
    }

    /// Re-enables progression and runs one pass immediately.
    pub fn reenable_progression(&mut self) -> Result<(), Error> {
        self.progression_disabled -= ProgressionDisabled::BY_API;
        self.progress()
    }

    // ---- context ids ------------------------------------------------

    pub(crate) fn has_ctxids(&self) -> bool {
        self.ctxid_bits > 0
    }

    pub(crate) fn ctxid_from_match(&self, match_info: u64) -> usize {
        ((match_info >> self.ctxid_shift) & u64::from((1u32 << self.ctxid_bits) - 1)) as usize
    }

    // ---- partner table ----------------------------------------------

    pub(crate) fn partner(&self, pid: PartnerId) -> &Partner {
        self.partners[pid.0 as usize].as_deref().expect("live partner id")
    }

    pub(crate) fn partner_mut(&mut self, pid: PartnerId) -> &mut Partner {
        self.partners[pid.0 as usize].as_deref_mut().expect("live partner id")
    }

    pub(crate) fn partner_index(&self, peer_index: u16, endpoint_index: u8) -> usize {
        u32::from(peer_index) as usize * self.endpoint_max as usize + endpoint_index as usize
    }

    /// Looks a partner up, creating it on first reference.
    pub(crate) fn partner_lookup(
        &mut self,
        peer_index: u16,
        endpoint_index: u8,
    ) -> Result<PartnerId, Error> {
        let index = self.partner_index(peer_index, endpoint_index);
        if index >= self.partners.len() {
            self.partners.resize_with(index + 1, || None);
        }
        if self.partners[index].is_none() {
            let board_addr = self
                .driver
                .peer_index_to_addr(peer_index)
                .ok_or(Error::PeerNotFound)?;
            self.partners[index] = Some(Box::new(Partner::new(
                peer_index,
                endpoint_index,
                board_addr,
            )));
            debug!(
                board = board_addr,
                endpoint = endpoint_index,
                peer = peer_index,
                "created partner"
            );
        }
        Ok(PartnerId(index as u32))
    }

    pub(crate) fn partner_lookup_by_addr(
        &mut self,
        board_addr: u64,
        endpoint_index: u8,
    ) -> Result<PartnerId, Error> {
        let peer_index = self
            .driver
            .peer_addr_to_index(board_addr)
            .ok_or(Error::PeerNotFound)?;
        self.partner_lookup(peer_index, endpoint_index)
    }

    /// A partner referenced by an inbound packet; `None` when the peer
    /// was never seen (the packet is dropped, the peer will resend after
    /// connecting).
    pub(crate) fn partner_recv_lookup(
        &self,
        peer_index: u16,
        endpoint_index: u8,
    ) -> Option<PartnerId> {
        let index = self.partner_index(peer_index, endpoint_index);
        self.partners.get(index)?.as_ref()?;
        Some(PartnerId(index as u32))
    }

    /// Learns the locality of a partner from a connect exchange and
    /// picks its rendezvous threshold accordingly.
    pub(crate) fn partner_check_localization(&mut self, pid: PartnerId, shared: bool) {
        use crate::partner::Localization;

        let config = self.config;
        let local = shared && config.sharedcomms;
        let partner = self.partner_mut(pid);
        if partner.localization == Localization::Unknown {
            partner.localization = if local {
                Localization::Local
            } else {
                Localization::Remote
            };
            partner.rndv_threshold = if local {
                config.shared_rndv_threshold
            } else {
                config.rndv_threshold
            };
        }
    }

    pub(crate) fn partner_addr(&self, pid: PartnerId, session_id: u32) -> EndpointAddr {
        let partner = self.partner(pid);
        EndpointAddr {
            peer_index: partner.peer_index,
            endpoint_index: partner.endpoint_index,
            board_addr: partner.board_addr,
            session_id,
        }
    }

    /// The address attached to inbound messages from this partner.
    pub(crate) fn partner_recv_addr(&self, pid: PartnerId) -> EndpointAddr {
        self.partner_addr(pid, self.partner(pid).back_session_id)
    }

    /// Creates the self partner with live seqnums and sessions, so
    /// self-communication needs no handshake.
    fn connect_myself(&mut self) -> Result<(), Error> {
        use crate::partner::Localization;

        let peer_index = self
            .driver
            .peer_addr_to_index(self.board_addr)
            .ok_or(Error::PeerNotFound)?;
        let pid = self.partner_lookup(peer_index, self.endpoint_index)?;

        let local = self.config.selfcomms || self.config.sharedcomms;
        let session_id = self.session_id;
        let (rndv_threshold, shared_threshold) =
            (self.config.rndv_threshold, self.config.shared_rndv_threshold);
        let partner = self.partner_mut(pid);
        partner.next_send_seq = Seq(1);
        partner.next_acked_send_seq = Seq(1);
        partner.next_match_recv_seq = Seq(1);
        partner.next_frag_recv_seq = Seq(1);
        partner.true_session_id = session_id;
        partner.back_session_id = session_id;
        partner.localization = if local {
            Localization::Local
        } else {
            Localization::Remote
        };
        partner.rndv_threshold = if local { shared_threshold } else { rndv_threshold };

        self.myself = pid;
        Ok(())
    }

    // ---- partner ack lists ------------------------------------------

    pub(crate) fn mark_partner_need_ack_delayed(&mut self, pid: PartnerId) {
        let now = self.driver.jiffies();
        let partner = self.partner_mut(pid);
        if partner.need_ack == NeedAck::No {
            partner.need_ack = NeedAck::Delayed;
            partner.oldest_recv_time_not_acked = now;
            self.partners_to_ack_delayed.push_back(pid);
        }
    }

    pub(crate) fn mark_partner_need_ack_immediate(&mut self, pid: PartnerId) {
        let partner = self.partner_mut(pid);
        match partner.need_ack {
            NeedAck::Immediate => {}
            NeedAck::Delayed => {
                partner.need_ack = NeedAck::Immediate;
                self.partners_to_ack_delayed.retain(|&p| p != pid);
                self.partners_to_ack_immediate.push_back(pid);
            }
            NeedAck::No => {
                partner.need_ack = NeedAck::Immediate;
                self.partners_to_ack_immediate.push_back(pid);
            }
        }
    }

    /// An ack (piggybacked or explicit) has gone out: drop any pending
    /// ack obligation and remember what we acked.
    pub(crate) fn mark_partner_ack_sent(&mut self, pid: PartnerId) {
        let partner = self.partner_mut(pid);
        match partner.need_ack {
            NeedAck::No => {}
            NeedAck::Delayed => {
                partner.need_ack = NeedAck::No;
                self.partners_to_ack_delayed.retain(|&p| p != pid);
            }
            NeedAck::Immediate => {
                partner.need_ack = NeedAck::No;
                self.partners_to_ack_immediate.retain(|&p| p != pid);
            }
        }
        let partner = self.partner_mut(pid);
        partner.last_acked_recv_seq = partner.next_frag_recv_seq;
    }

    pub(crate) fn mark_partner_throttling(&mut self, pid: PartnerId) {
        let partner = self.partner_mut(pid);
        partner.throttling_sends_nr += 1;
        if partner.throttling_sends_nr == 1 {
            self.throttling_partners.push_back(pid);
        }
    }

    pub(crate) fn update_partner_throttling(&mut self, pid: PartnerId, nr: u32) {
        if nr == 0 {
            return;
        }
        let partner = self.partner_mut(pid);
        partner.throttling_sends_nr -= nr;
        if partner.throttling_sends_nr == 0 {
            self.throttling_partners.retain(|&p| p != pid);
        }
    }

    // ---- sendq slot map ---------------------------------------------

    /// Reserves `nr` staging slots for `req`, or `None` when the send
    /// queue is too busy.
    pub(crate) fn sendq_map_get(&mut self, nr: u32, req: RequestId) -> Option<Vec<u16>> {
        if (self.sendq_free.len() as u32) < nr {
            return None;
        }
        let slots: Vec<u16> = (0..nr)
            .map(|_| self.sendq_free.pop().expect("length checked"))
            .collect();
        for &slot in &slots {
            debug_assert!(self.sendq_users[slot as usize].is_none());
            self.sendq_users[slot as usize] = Some(req);
        }
        Some(slots)
    }

    pub(crate) fn sendq_map_put(&mut self, slots: &[u16]) {
        for &slot in slots {
            debug_assert!(self.sendq_users[slot as usize].is_some());
            self.sendq_users[slot as usize] = None;
            self.sendq_free.push(slot);
        }
    }

    pub(crate) fn sendq_map_user(&self, slot: u16) -> RequestId {
        self.sendq_users[slot as usize].expect("sendq slot in use")
    }

    // ---- completion plumbing ----------------------------------------

    /// Marks a request done *before* the wire is finished with it
    /// (tiny/small/staged-medium sends whose data is buffered); it will
    /// be zombified if the application completes it first.
    pub(crate) fn notify_request_done_early(&mut self, id: RequestId) {
        if self.zombies >= self.zombie_max {
            return;
        }
        let ctxid = {
            let req = self.reqs.req_mut(id);
            debug_assert!(!req.state.contains(RequestState::INTERNAL));
            debug_assert!(!req.state.contains(RequestState::DONE));
            req.state |= RequestState::DONE;
            if req.state.contains(RequestState::ZOMBIE) {
                return;
            }
            self.ctxid_from_match(self.reqs.req(id).status.match_info)
        };
        self.anyctxid_done_req_q.push_back(&mut self.reqs, id);
        if self.has_ctxids() {
            self.ctxids[ctxid].done_req_q.push_back(&mut self.reqs, id);
        }
        // wake sleepers: this completion does not come from the driver
        self.driver.notify_user_event();
    }

    /// Marks a request done for real. Zombies are freed, internal
    /// requests only get the flag, everything else lands on the done
    /// queues (unless it was completed early already).
    pub(crate) fn notify_request_done(&mut self, id: RequestId) {
        let req = self.reqs.req_mut(id);
        if req.state.contains(RequestState::INTERNAL) {
            debug_assert!(!req.state.contains(RequestState::DONE));
            req.state |= RequestState::DONE;
            debug_assert!(!req.state.contains(RequestState::ZOMBIE));
            return;
        }
        if req.state.contains(RequestState::ZOMBIE) {
            self.reqs.free(id);
            self.zombies -= 1;
            return;
        }
        if !req.state.contains(RequestState::DONE) {
            debug_assert!(req.state.is_empty());
            req.state |= RequestState::DONE;
            let ctxid = self.ctxid_from_match(self.reqs.req(id).status.match_info);
            self.anyctxid_done_req_q.push_back(&mut self.reqs, id);
            if self.has_ctxids() {
                self.ctxids[ctxid].done_req_q.push_back(&mut self.reqs, id);
            }
        }
        // else: completed early, its done links are already queued
    }

    /// Unlinks a request from the done queues when the application
    /// completes it.
    pub(crate) fn dequeue_done_request(&mut self, id: RequestId) {
        let ctxid = self.ctxid_from_match(self.reqs.req(id).status.match_info);
        self.anyctxid_done_req_q.remove(&mut self.reqs, id);
        if self.has_ctxids() {
            self.ctxids[ctxid].done_req_q.remove(&mut self.reqs, id);
        }
    }

    /// Detaches a request from completion reporting: the application
    /// will never test it, the protocol frees it when the wire is done.
    pub(crate) fn zombify(&mut self, id: RequestId) {
        let state = self.reqs.req(id).state;
        if state == RequestState::DONE {
            // the wire is already finished with it too
            self.dequeue_done_request(id);
            self.reqs.free(id);
            return;
        }
        if state.contains(RequestState::DONE) {
            self.reqs.req_mut(id).state -= RequestState::DONE;
            self.dequeue_done_request(id);
        }
        self.reqs.req_mut(id).state |= RequestState::ZOMBIE;
        self.zombies += 1;
        trace!(zombies = self.zombies, "request zombified");
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if !self.closed {
            crate::unregister_endpoint();
        }
    }
}
