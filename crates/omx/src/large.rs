//! Large-message orchestration: region registration with reuse cache,
//! the receive-side pull, and the notify exchange that releases the
//! sender's region.
//!
//! A rendezvous send registers (or reuses) a region, reserves it for
//! the exchange, and advertises `(id, seqnum)`. The receiver registers
//! its own region, asks the driver to pull, and on completion sends a
//! NOTIFY carrying the transferred length; the sender validates the
//! region seqnum before releasing anything, so a stale notify from an
//! earlier exchange over a recycled slot is ignored.

use omx_driver::abi::{pull_status, CreateUserRegion, Pull, SendNotify};
use omx_wire::Seq;
use tracing::{trace, warn};

use crate::{
    endpoint::Endpoint,
    error::{MissingResources as Shortage, Status, SubmitResult},
    partner::PartnerId,
    recv::{InboundKind, InboundMsg},
    request::{
        LargeRecv, MissingResources, RecvKind, Request, RequestData, RequestId, RequestState,
        RequestType, SendKind, RecvData,
    },
    segment::SegmentList,
};

impl Endpoint {
    // ---- region cache -----------------------------------------------

    /// Acquires a region over `segs`: from the reuse cache when
    /// possible, freshly registered otherwise. `reserver` takes the
    /// region exclusively for a rendezvous/notify exchange.
    pub(crate) fn get_region(
        &mut self,
        segs: &SegmentList,
        reserver: Option<RequestId>,
    ) -> Result<u8, Shortage> {
        if segs.is_contiguous() && self.config.regcache {
            let first = segs.first();
            if let Some(id) = self.regions.find_cached(
                first.vaddr,
                first.len,
                reserver.is_some(),
                self.config.parallel_regcache,
            ) {
                trace!(target: "omx::large", region = id, "regcache reusing region");
                if reserver.is_some() {
                    let region = self.regions.get_mut(id).expect("cached region");
                    debug_assert!(region.reserver.is_none());
                    region.reserver = reserver;
                }
                return Ok(id);
            }
        }

        let id = match self.regions.try_alloc() {
            Some(id) => id,
            None => {
                // pool exhausted: evict the least recently used idle
                // registration and retry
                let Some(victim) = self.regions.evict_candidate() else {
                    return Err(Shortage);
                };
                trace!(target: "omx::large", region = victim, "regcache evicting unused region");
                self.destroy_region(victim);
                self.regions.try_alloc().ok_or(Shortage)?
            }
        };

        let driver_segs = segs.to_driver_segments();
        let cmd = CreateUserRegion {
            id,
            pad: [0; 3],
            nr_segments: driver_segs.len() as u32,
            segments: driver_segs.as_ptr() as u64,
        };
        if self.driver.create_user_region(&cmd, &driver_segs).is_err() {
            self.regions.release_slot(id);
            return Err(Shortage);
        }

        self.regions.install(segs.clone(), id, reserver);
        trace!(target: "omx::large", region = id, "registered region");
        Ok(id)
    }

    /// Drops one use of a region; idle contiguous regions stay
    /// registered on the LRU, everything else is deregistered.
    pub(crate) fn put_region(&mut self, id: u8, reserver: Option<RequestId>) {
        let (use_count, contiguous) = {
            let region = self.regions.get_mut(id).expect("live region");
            region.use_count -= 1;
            if reserver.is_some() {
                debug_assert_eq!(region.reserver, reserver);
                region.reserver = None;
            }
            (region.use_count, region.segs.is_contiguous())
        };

        if self.config.regcache && contiguous {
            if use_count == 0 {
                self.regions.park_unused(id);
            }
            trace!(target: "omx::large", region = id, use_count, "regcache keeping region");
        } else if use_count == 0 {
            self.destroy_region(id);
        }
    }

    fn destroy_region(&mut self, id: u8) {
        let region = self.regions.extract(id);
        let _ = self.driver.destroy_user_region(region.id);
        self.regions.release_slot(id);
    }

    // ---- receive side: pull -----------------------------------------

    /// Starts the pull of a matched rendezvous, or parks it on the
    /// delayed queue when resources are short. Zero-length messages
    /// skip the pull and go straight to the (delayed) notify.
    pub(crate) fn submit_or_queue_pull(&mut self, id: RequestId) {
        if self.reqs.req(id).status.xfer_length > 0 {
            self.reqs.req_mut(id).missing = MissingResources::PULL;
            if self.alloc_setup_pull(id).is_err() {
                trace!(target: "omx::large", "queueing pull, resources missing");
                self.reqs.req_mut(id).state |= RequestState::NEED_RESOURCES;
                self.need_resources_send_req_q.push_back(&mut self.reqs, id);
            }
        } else {
            // nothing to transfer; delay the notify one pass so it
            // piggybacks the rendezvous ack
            self.reqs.req_mut(id).state -= RequestState::RECV_PARTIAL;
            self.submit_notify(id, true);
        }
    }

    pub(crate) fn alloc_setup_pull(&mut self, id: RequestId) -> SubmitResult {
        if self.reqs.req(id).missing.contains(MissingResources::EXP_EVENT) {
            if self.avail_exp_events < 1 {
                return Err(Shortage);
            }
            self.avail_exp_events -= 1;
            self.reqs.req_mut(id).missing -= MissingResources::EXP_EVENT;
        }

        if self.reqs.req(id).missing.contains(MissingResources::LARGE_REGION) {
            let segs = self.reqs.req(id).recv().segs.clone();
            let region = self.get_region(&segs, None)?;
            let req = self.reqs.req_mut(id);
            req.missing -= MissingResources::LARGE_REGION;
            req.recv_mut().large_mut().local_region = Some(region);
        }

        let pid = self.reqs.req(id).partner.expect("matched recv has a partner");
        let (peer_index, endpoint_index, shared, _) = self.partner_wire_identity(pid);
        let cmd = {
            let back_session = self.partner(pid).back_session_id;
            let req = self.reqs.req(id);
            let large = req.recv().large();
            Pull {
                peer_index,
                dest_endpoint: endpoint_index,
                shared,
                length: req.status.xfer_length,
                session_id: back_session,
                puller_rdma_id: large.local_region.expect("region acquired above"),
                pulled_rdma_id: large.pulled_rdma_id,
                pulled_rdma_seqnum: large.pulled_rdma_seqnum,
                pad: 0,
                pulled_rdma_offset: u32::from(large.pulled_rdma_offset),
                resend_timeout_jiffies: self.pull_resend_timeout_jiffies,
                lib_cookie: id.to_cookie(),
            }
        };
        if self.driver.pull(&cmd).is_err() {
            // keep the event credit and the region, retry the command
            return Err(Shortage);
        }
        self.reqs.req_mut(id).missing -= MissingResources::PULL_HANDLE;
        debug_assert!(self.reqs.req(id).missing.is_empty());

        self.reqs.req_mut(id).state |= RequestState::DRIVER_PULLING;
        self.driver_pulling_req_q.push_back(&mut self.reqs, id);
        Ok(())
    }

    /// A pull completed: release the local region and send the notify.
    pub(crate) fn process_pull_done(&mut self, lib_cookie: u64, status: u8) {
        let id = RequestId::from_cookie(lib_cookie);
        let Some(req) = self.reqs.get(id) else {
            warn!(cookie = lib_cookie, "pull done for a stale request, dropping");
            return;
        };
        debug_assert_eq!(req.ty, RequestType::RecvLarge);

        let status = match status {
            pull_status::SUCCESS => Status::Success,
            pull_status::BAD_ENDPT => Status::RemoteEndpointBadId,
            pull_status::ENDPT_CLOSED => Status::RemoteEndpointClosed,
            pull_status::BAD_SESSION => Status::RemoteEndpointBadSession,
            pull_status::BAD_RDMAWIN => Status::RemoteRdmaWindowBadId,
            pull_status::ABORTED => Status::MessageAborted,
            _ => Status::RemoteEndpointUnreachable,
        };
        trace!(target: "omx::large", ?status, "pull done");

        if status != Status::Success {
            let req = self.reqs.req_mut(id);
            if req.status.code == Status::Success {
                req.status.code = status;
            }
            req.status.xfer_length = 0;
        }

        let region = self
            .reqs
            .req(id)
            .recv()
            .large()
            .local_region
            .expect("pulling request holds its region");
        self.put_region(region, None);
        self.driver_pulling_req_q.remove(&mut self.reqs, id);
        self.reqs.req_mut(id).state -=
            RequestState::DRIVER_PULLING | RequestState::RECV_PARTIAL;

        self.submit_notify(id, false);
    }

    // ---- notify ------------------------------------------------------

    /// Queues or posts the pull-completion notify. Resubmitted notifies
    /// jump the delayed queue so ordinary delayed sends cannot starve
    /// the release of the sender's region.
    pub(crate) fn submit_notify(&mut self, id: RequestId, delayed: bool) {
        if delayed || !self.need_resources_send_req_q.is_empty() {
            self.reqs.req_mut(id).state |= RequestState::NEED_RESOURCES;
            self.need_resources_send_req_q.push_front(&mut self.reqs, id);
        } else {
            self.alloc_setup_notify(id);
        }
    }

    pub(crate) fn alloc_setup_notify(&mut self, id: RequestId) {
        let pid = self.reqs.req(id).partner.expect("notify has a partner");
        let (peer_index, endpoint_index, shared, _) = self.partner_wire_identity(pid);
        {
            let back_session = self.partner(pid).back_session_id;
            let req = self.reqs.req_mut(id);
            let total_length = req.status.xfer_length;
            let large = req.recv_mut().large_mut();
            large.notify_cmd = SendNotify {
                peer_index,
                dest_endpoint: endpoint_index,
                shared,
                total_length,
                seqnum: 0,
                piggyack: 0,
                pulled_rdma_id: large.pulled_rdma_id,
                pulled_rdma_seqnum: large.pulled_rdma_seqnum,
                pad: [0; 2],
                session_id: back_session,
            };
        }
        self.seqnum_gate_notify(pid, id);
    }

    fn seqnum_gate_notify(&mut self, pid: PartnerId, id: RequestId) {
        if self.partner(pid).outstanding_sends() >= crate::send::THROTTLING_OFFSET_MAX {
            self.reqs.req_mut(id).state |= RequestState::NEED_SEQNUM;
            let partner = self.partners[pid.0 as usize].as_deref_mut().expect("live partner");
            partner.need_seqnum_send_req_q.push_back(&mut self.reqs, id);
            self.mark_partner_throttling(pid);
        } else {
            self.setup_notify(pid, id);
        }
    }

    pub(crate) fn setup_notify(&mut self, pid: PartnerId, id: RequestId) {
        let seqnum = {
            let partner = self.partner_mut(pid);
            let seqnum = partner.next_send_seq;
            partner.next_send_seq = partner.next_send_seq.wrapping_add(1);
            seqnum
        };
        let resends_max = self.req_resends_max;
        {
            let req = self.reqs.req_mut(id);
            req.send_seqnum = seqnum;
            req.resends = 0;
            if req.resends_max == 0 {
                req.resends_max = resends_max;
            }
            req.recv_mut().large_mut().notify_cmd.seqnum = seqnum.0;
        }
        self.post_notify(pid, id);

        self.reqs.req_mut(id).state |= RequestState::NEED_ACK;
        self.non_acked_req_q.push_back(&mut self.reqs, id);
        let partner = self.partners[pid.0 as usize].as_deref_mut().expect("live partner");
        partner.non_acked_req_q.push_back(&mut self.reqs, id);

        // the transfer is finished from the application's point of view
        self.notify_request_done_early(id);
    }

    pub(crate) fn post_notify(&mut self, pid: PartnerId, id: RequestId) {
        let ack_upto = self.partner(pid).needed_ack();
        let now = self.driver.jiffies();
        let cmd = {
            let req = self.reqs.req_mut(id);
            let large = req.recv_mut().large_mut();
            large.notify_cmd.piggyack = ack_upto.0;
            large.notify_cmd
        };
        let sent = self.driver.send_notify(&cmd).is_ok();
        let req = self.reqs.req_mut(id);
        req.resends += 1;
        req.last_send_jiffies = now;
        if sent {
            self.mark_partner_ack_sent(pid);
        }
    }

    /// Releases the region of a rendezvous whose message the unexpected
    /// handler consumed: a zombie request sends the notify, then
    /// disappears.
    pub(crate) fn submit_discarded_notify(&mut self, pid: PartnerId, rdma_id: u8, rdma_seqnum: u8) {
        let mut req = Request::new(
            RequestType::RecvLarge,
            RequestData::Recv(RecvData {
                segs: SegmentList::default(),
                match_info: 0,
                match_mask: 0,
                seqnum: Seq(0),
                unexp_buffer: None,
                kind: RecvKind::Large(LargeRecv {
                    notify_cmd: SendNotify::default(),
                    local_region: None,
                    pulled_rdma_id: rdma_id,
                    pulled_rdma_seqnum: rdma_seqnum,
                    pulled_rdma_offset: 0,
                }),
            }),
        );
        req.partner = Some(pid);
        req.state = RequestState::ZOMBIE;
        let id = self.reqs.alloc(req);
        self.zombies += 1;
        self.submit_notify(id, true);
    }

    /// The sender-side notify arrival: the peer finished pulling our
    /// region.
    pub(crate) fn process_recv_notify(&mut self, pid: PartnerId, msg: &InboundMsg) {
        let InboundKind::Notify {
            length,
            pulled_rdma_id,
            pulled_rdma_seqnum,
        } = msg.kind
        else {
            unreachable!("notify path")
        };
        let _ = pid;

        let Some(region) = self.regions.get(pulled_rdma_id) else {
            warn!(region = pulled_rdma_id, "notify for an unknown region, dropping");
            return;
        };
        let Some(id) = region.reserver else {
            warn!(region = pulled_rdma_id, "notify for an unreserved region, dropping");
            return;
        };
        {
            let req = self.reqs.req(id);
            debug_assert_eq!(req.ty, RequestType::SendLarge);
            debug_assert!(req.state.contains(RequestState::NEED_REPLY));
            let SendKind::Large { region_seqnum, .. } = &req.send().kind else {
                unreachable!("reserver is a large send")
            };
            if *region_seqnum != pulled_rdma_seqnum {
                trace!(target: "omx::large", "notify with a stale region seqnum, dropping");
                return;
            }
        }

        self.put_region(pulled_rdma_id, Some(id));
        self.large_sends_avail += 1;

        let req = self.reqs.req_mut(id);
        req.status.xfer_length = length;
        req.state -= RequestState::NEED_REPLY;
        if !self.reqs.req(id).state.contains(RequestState::NEED_ACK) {
            self.large_send_need_reply_req_q.remove(&mut self.reqs, id);
            self.send_complete(id, Status::Success);
        }
        // otherwise it stays on the non-acked queue until the ack lands
    }
}
