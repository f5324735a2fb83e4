//! The progression engine: drain both event rings, then run the
//! retransmission, delayed-submission, and ack passes.
//!
//! Everything in the library makes progress only through here;
//! submission entry points call it once, and the wait family calls it
//! around every sleep.

use omx_driver::{abi, Event};
use omx_wire::Seq;
use tracing::warn;

use crate::{
    endpoint::Endpoint,
    error::{Error, Status},
    recv::{tiny_payload, InboundKind, InboundMsg},
    request::{RequestState, SendKind},
};

impl Endpoint {
    /// Runs one progression pass: drains the unexpected event ring (to
    /// relieve the network first), then the expected ring, then the
    /// resend/delayed/ack passes and the driver status check.
    pub fn progress(&mut self) -> Result<(), Error> {
        if !self.progression_disabled.is_empty() {
            return Ok(());
        }

        while let Some(event) = self.driver.poll_unexp() {
            self.process_event(event);
        }
        while let Some(event) = self.driver.poll_exp() {
            self.process_event(event);
        }

        self.process_resend_requests();
        self.process_delayed_requests();
        self.process_partners_to_ack();
        self.check_endpoint_desc();
        Ok(())
    }

    fn process_event(&mut self, event: Event) {
        match event {
            Event::ConnectRequest {
                peer_index,
                src_endpoint,
                shared,
                src_session_id,
                app_key,
                target_recv_seqnum_start,
                connect_seqnum,
            } => self.process_recv_connect_request(
                peer_index,
                src_endpoint,
                shared,
                src_session_id,
                app_key,
                target_recv_seqnum_start,
                connect_seqnum,
            ),
            Event::ConnectReply {
                peer_index,
                src_endpoint,
                shared,
                src_session_id,
                target_session_id,
                target_recv_seqnum_start,
                connect_seqnum,
                status,
            } => self.process_recv_connect_reply(
                peer_index,
                src_endpoint,
                shared,
                src_session_id,
                target_session_id,
                target_recv_seqnum_start,
                connect_seqnum,
                status,
            ),
            Event::Tiny { msg, length, data } => {
                let inbound = InboundMsg {
                    peer_index: msg.peer_index,
                    src_endpoint: msg.src_endpoint,
                    seqnum: msg.seqnum,
                    piggyack: msg.piggyack,
                    match_info: msg.match_info,
                    msg_length: u32::from(length),
                    kind: InboundKind::Tiny,
                };
                let payload = tiny_payload(&data, length).to_vec();
                self.process_recv(&inbound, &payload);
            }
            Event::Small {
                msg,
                length,
                recvq_offset,
            } => {
                let data = self
                    .driver
                    .recvq_data(recvq_offset, usize::from(length))
                    .into_owned();
                let inbound = InboundMsg {
                    peer_index: msg.peer_index,
                    src_endpoint: msg.src_endpoint,
                    seqnum: msg.seqnum,
                    piggyack: msg.piggyack,
                    match_info: msg.match_info,
                    msg_length: u32::from(length),
                    kind: InboundKind::Small,
                };
                self.process_recv(&inbound, &data);
            }
            Event::MediumFrag {
                msg,
                msg_length,
                frag_length,
                frag_seqnum,
                frag_pipeline,
                recvq_offset,
            } => {
                let data = self
                    .driver
                    .recvq_data(recvq_offset, usize::from(frag_length))
                    .into_owned();
                let inbound = InboundMsg {
                    peer_index: msg.peer_index,
                    src_endpoint: msg.src_endpoint,
                    seqnum: msg.seqnum,
                    piggyack: msg.piggyack,
                    match_info: msg.match_info,
                    msg_length,
                    kind: InboundKind::MediumFrag {
                        frag_length,
                        frag_seqnum,
                        frag_pipeline,
                    },
                };
                self.process_recv(&inbound, &data);
            }
            Event::Rndv {
                msg,
                msg_length,
                rdma_id,
                rdma_seqnum,
                rdma_offset,
            } => {
                let inbound = InboundMsg {
                    peer_index: msg.peer_index,
                    src_endpoint: msg.src_endpoint,
                    seqnum: msg.seqnum,
                    piggyack: msg.piggyack,
                    match_info: msg.match_info,
                    msg_length,
                    kind: InboundKind::Rndv {
                        rdma_id,
                        rdma_seqnum,
                        rdma_offset,
                    },
                };
                self.process_recv(&inbound, &[]);
            }
            Event::Notify {
                msg,
                length,
                pulled_rdma_id,
                pulled_rdma_seqnum,
            } => {
                let inbound = InboundMsg {
                    peer_index: msg.peer_index,
                    src_endpoint: msg.src_endpoint,
                    seqnum: msg.seqnum,
                    piggyack: msg.piggyack,
                    match_info: msg.match_info,
                    msg_length: 0,
                    kind: InboundKind::Notify {
                        length,
                        pulled_rdma_id,
                        pulled_rdma_seqnum,
                    },
                };
                self.process_recv(&inbound, &[]);
            }
            Event::Liback {
                peer_index,
                src_endpoint,
                session_id,
                acknum,
                lib_seqnum_up_to,
            } => {
                if let Some(pid) = self.partner_recv_lookup(peer_index, src_endpoint) {
                    self.handle_liback(pid, session_id, acknum, lib_seqnum_up_to);
                }
            }
            Event::NackLib {
                peer_index,
                src_endpoint,
                seqnum,
                kind,
            } => {
                if let Some(pid) = self.partner_recv_lookup(peer_index, src_endpoint) {
                    let status = match kind {
                        omx_wire::NackKind::BadEndpoint => Status::RemoteEndpointBadId,
                        omx_wire::NackKind::EndpointClosed => Status::RemoteEndpointClosed,
                        omx_wire::NackKind::BadSession => Status::RemoteEndpointBadSession,
                    };
                    self.handle_nack(pid, seqnum, status);
                }
            }
            Event::MediumSqFragDone { sendq_offset } => {
                self.process_mediumsq_frag_done(sendq_offset);
            }
            Event::PullDone {
                lib_cookie,
                puller_rdma_id: _,
                status,
            } => {
                self.avail_exp_events += 1;
                self.process_pull_done(lib_cookie, status);
            }
        }
    }

    /// One staged fragment finished transmitting: its send-queue slot
    /// and event credit come back, and the message moves on once the
    /// last fragment is out.
    fn process_mediumsq_frag_done(&mut self, sendq_offset: u32) {
        let slot = (sendq_offset >> abi::SENDQ_ENTRY_SHIFT) as u16;
        let id = self.sendq_map_user(slot);

        self.avail_exp_events += 1;

        let finished = {
            let req = self.reqs.req_mut(id);
            let SendKind::MediumSq { frags_pending, .. } = &mut req.send_mut().kind else {
                unreachable!("sendq slot owned by a mediumsq send")
            };
            *frags_pending -= 1;
            *frags_pending == 0
        };
        if !finished {
            return;
        }

        self.reqs.req_mut(id).state -= RequestState::DRIVER_MEDIUMSQ_SENDING;
        self.driver_mediumsq_sending_req_q.remove(&mut self.reqs, id);
        if self.reqs.req(id).state.contains(RequestState::NEED_ACK) {
            self.non_acked_req_q.push_back(&mut self.reqs, id);
        } else {
            // the ack raced ahead of the last fragment-done event; its
            // verdict was stamped on the request
            self.send_complete(id, Status::Success);
        }
    }

    /// Reads and reacts to the endpoint descriptor status flags, paced
    /// to roughly once a second.
    fn check_endpoint_desc(&mut self) {
        let now = self.driver.jiffies();
        if now.saturating_sub(self.last_check_jiffies) < self.check_status_delay_jiffies {
            return;
        }
        self.last_check_jiffies = now;

        let status = self.driver.take_status();
        if status == 0 {
            return;
        }

        assert!(
            status & abi::DESC_STATUS_EXP_EVENTQ_FULL == 0,
            "driver reports the expected event ring full; credit accounting is broken"
        );
        if status & abi::DESC_STATUS_UNEXP_EVENTQ_FULL != 0 {
            warn!("unexpected event ring overflowed; dropped packets will be resent by their senders");
        }
        if status & abi::DESC_STATUS_IFACE_DOWN != 0 {
            warn!(iface = %self.driver.board_info().ifacename, "interface is down");
        }
        if status & abi::DESC_STATUS_IFACE_BAD_MTU != 0 {
            warn!(
                iface = %self.driver.board_info().ifacename,
                mtu = self.driver.board_info().mtu,
                "interface MTU too small for the configured fragment size"
            );
        }
        assert!(
            status & abi::DESC_STATUS_IFACE_REMOVED == 0,
            "interface removed; endpoint is dead"
        );
    }

    /// The seqnum of the next message expected from `addr`'s partner,
    /// exposed for diagnostics.
    #[must_use]
    pub fn next_recv_seqnum(&self, addr: crate::EndpointAddr) -> Option<Seq> {
        let pid = self.partner_recv_lookup(addr.peer_index, addr.endpoint_index)?;
        Some(self.partner(pid).next_match_recv_seq)
    }
}
