//! Request objects: the unit of asynchronous work.
//!
//! A request is a tagged sum over the submission kinds, with a common
//! header (state bits, partner back-reference, seqnum and resend
//! bookkeeping, completion status) and four intrusive queue links so one
//! request can sit on a work queue, the done queue, a per-context done
//! or unexpected queue, and a partner queue at the same time.
//!
//! Requests live in a slot arena; the application and the wire both
//! refer to them by [`RequestId`], a `(slot, generation)` pair. The
//! generation is bumped every time a slot is reused, so a stale handle
//! (or a stale pull cookie coming back from the driver) can never reach
//! a recycled request.

use omx_driver::abi::{
    SendConnectRequest, SendMediumSqFrag, SendMediumVa, SendNotify, SendRndv, SendSmall, SendTiny,
    RegionSegment,
};
use omx_wire::Seq;
use slab::Slab;

use crate::{
    addr::EndpointAddr,
    error::Status,
    partner::PartnerId,
    segment::{SegScan, SegmentList},
};

bitflags::bitflags! {
    /// Where a request currently stands; several bits may hold at once.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RequestState: u16 {
        /// Parked on the delayed queue waiting for resources.
        const NEED_RESOURCES = 1 << 0;
        /// Parked on the partner waiting for the send window to open.
        const NEED_SEQNUM = 1 << 1;
        /// Medium fragments posted to the driver, not all sent yet.
        const DRIVER_MEDIUMSQ_SENDING = 1 << 2;
        /// Waiting for a peer ack.
        const NEED_ACK = 1 << 3;
        /// Waiting for an explicit reply (rendezvous notify or connect
        /// reply).
        const NEED_REPLY = 1 << 4;
        /// Posted receive that has not matched yet.
        const RECV_NEED_MATCHING = 1 << 5;
        /// Matched receive with fragments still missing.
        const RECV_PARTIAL = 1 << 6;
        /// Pull posted to the driver, not finished yet.
        const DRIVER_PULLING = 1 << 7;
        /// Inbound message that matched no posted receive.
        const UNEXPECTED_RECV = 1 << 8;
        /// Self-directed send waiting for the matching receive.
        const UNEXPECTED_SELF_SEND = 1 << 9;
        /// Ready for (or already returned by) `test`/`wait`.
        const DONE = 1 << 10;
        /// Completed by the application before the wire finished; freed
        /// silently once the protocol lets go.
        const ZOMBIE = 1 << 11;
        /// Library-internal request, invisible to `peek`/`test_any`.
        const INTERNAL = 1 << 12;
    }

    /// Resources a submission still has to acquire, consumed
    /// highest-priority first; on shortage the already-acquired ones are
    /// kept and only the remaining bits are retried later.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MissingResources: u8 {
        /// Expected-event ring credits.
        const EXP_EVENT = 1 << 0;
        /// One of the bounded simultaneous-large-send credits.
        const SEND_LARGE_REGION = 1 << 1;
        /// A registered region slot.
        const LARGE_REGION = 1 << 2;
        /// The pull command itself accepted by the driver.
        const PULL_HANDLE = 1 << 3;
        /// Send-queue staging slots.
        const SENDQ_SLOT = 1 << 4;
    }
}

impl MissingResources {
    /// What a staged medium send must acquire.
    pub const SEND_MEDIUMSQ: Self = Self::EXP_EVENT.union(Self::SENDQ_SLOT);
    /// What a large send must acquire.
    pub const SEND_LARGE: Self = Self::SEND_LARGE_REGION.union(Self::LARGE_REGION);
    /// What a pull must acquire.
    pub const PULL: Self = Self::EXP_EVENT.union(Self::LARGE_REGION).union(Self::PULL_HANDLE);
}

/// Discriminant of a request, fixed at submission (except for a plain
/// receive turning into a large receive when it matches a rendezvous).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    /// Connection handshake originator.
    Connect,
    /// Send with payload inline in the command.
    SendTiny,
    /// Send with payload buffered in the request.
    SendSmall,
    /// Fragmented send staged through the mapped send queue.
    SendMediumSq,
    /// Fragmented send gathered from user memory by the driver.
    SendMediumVa,
    /// Rendezvous send served by a peer-driven pull.
    SendLarge,
    /// Posted or unexpected receive.
    Recv,
    /// Receive of a rendezvous message, pulling.
    RecvLarge,
    /// Send to our own endpoint.
    SendSelf,
    /// Unexpected self-send buffered on the receive side.
    RecvSelfUnexpected,
}

/// Completion information carried by every request and returned to the
/// application by `test`/`wait`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Completion {
    /// Final status code.
    pub code: Status,
    /// Address of the remote side.
    pub addr: EndpointAddr,
    /// Match information of the message.
    pub match_info: u64,
    /// Full length of the message.
    pub msg_length: u32,
    /// Bytes actually delivered into the receive buffer.
    pub xfer_length: u32,
    /// Opaque application cookie attached at submission.
    pub context: u64,
}

pub(crate) struct ConnectData {
    pub cmd: SendConnectRequest,
    /// Our session id at submission, to match the reply echo.
    pub session_id: u32,
    pub connect_seqnum: u8,
}

pub(crate) struct SendData {
    pub segs: SegmentList,
    pub kind: SendKind,
}

pub(crate) enum SendKind {
    Tiny(SendTiny),
    Small {
        cmd: SendSmall,
        /// Payload buffered for retransmission.
        copy: Box<[u8]>,
    },
    MediumSq {
        cmd: SendMediumSqFrag,
        frags_nr: u32,
        frags_pending: u32,
        sendq_slots: Vec<u16>,
    },
    MediumVa {
        cmd: SendMediumVa,
        /// The segment array `cmd.segments` points at; owned here so the
        /// address stays valid for resends.
        driver_segs: Box<[RegionSegment]>,
    },
    Large {
        cmd: SendRndv,
        region: Option<u8>,
        region_seqnum: u8,
    },
    SelfSend,
}

pub(crate) struct RecvData {
    pub segs: SegmentList,
    pub match_info: u64,
    pub match_mask: u64,
    /// Seqnum of the matched incoming send.
    pub seqnum: Seq,
    /// Heap buffer backing `segs` while the receive is unexpected.
    pub unexp_buffer: Option<Box<[u8]>>,
    pub kind: RecvKind,
}

impl RecvData {
    pub fn basic(&self) -> &MediumRecv {
        match &self.kind {
            RecvKind::Basic(medium) => medium,
            _ => unreachable!("receive is not in the basic state"),
        }
    }

    pub fn basic_mut(&mut self) -> &mut MediumRecv {
        match &mut self.kind {
            RecvKind::Basic(medium) => medium,
            _ => unreachable!("receive is not in the basic state"),
        }
    }

    pub fn large(&self) -> &LargeRecv {
        match &self.kind {
            RecvKind::Large(large) => large,
            _ => unreachable!("receive is not in the large state"),
        }
    }

    pub fn large_mut(&mut self) -> &mut LargeRecv {
        match &mut self.kind {
            RecvKind::Large(large) => large,
            _ => unreachable!("receive is not in the large state"),
        }
    }
}

pub(crate) enum RecvKind {
    /// Tiny/small/medium receive; the fragment bookkeeping is only used
    /// by mediums.
    Basic(MediumRecv),
    /// Rendezvous receive: pull then notify.
    Large(LargeRecv),
    /// Buffered unexpected self-send; completing it completes `sreq`.
    SelfUnexp { sreq: RequestId },
}

#[derive(Default)]
pub(crate) struct MediumRecv {
    pub frags_received_mask: u32,
    /// Bytes received so far, after truncation clamping.
    pub accumulated_length: u32,
    pub scan: SegScan,
}

pub(crate) struct LargeRecv {
    pub notify_cmd: SendNotify,
    pub local_region: Option<u8>,
    pub pulled_rdma_id: u8,
    pub pulled_rdma_seqnum: u8,
    pub pulled_rdma_offset: u16,
}

pub(crate) enum RequestData {
    Connect(ConnectData),
    Send(SendData),
    Recv(RecvData),
}

/// Which intrusive link a queue threads through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkKind {
    /// The main queue reflecting the network state.
    Work = 0,
    /// The any-context done queue.
    Done = 1,
    /// Per-context done or unexpected queue.
    Ctxid = 2,
    /// Partner-local queue (non-acked, connect, partial, need-seqnum).
    Partner = 3,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Link {
    pub prev: Option<RequestId>,
    pub next: Option<RequestId>,
    pub queued: bool,
}

pub(crate) struct Request {
    pub ty: RequestType,
    pub state: RequestState,
    pub missing: MissingResources,
    pub partner: Option<PartnerId>,
    pub send_seqnum: Seq,
    pub last_send_jiffies: u64,
    pub resends: u32,
    pub resends_max: u32,
    pub status: Completion,
    pub data: RequestData,
    pub(crate) links: [Link; 4],
}

impl Request {
    pub fn new(ty: RequestType, data: RequestData) -> Self {
        Self {
            ty,
            state: RequestState::empty(),
            missing: MissingResources::empty(),
            partner: None,
            send_seqnum: Seq(0),
            last_send_jiffies: 0,
            resends: 0,
            resends_max: 0,
            status: Completion::default(),
            data,
            links: [Link::default(); 4],
        }
    }

    pub fn link(&self, kind: LinkKind) -> &Link {
        &self.links[kind as usize]
    }

    pub fn link_mut(&mut self, kind: LinkKind) -> &mut Link {
        &mut self.links[kind as usize]
    }

    pub fn send(&self) -> &SendData {
        match &self.data {
            RequestData::Send(send) => send,
            _ => unreachable!("request {:?} is not a send", self.ty),
        }
    }

    pub fn send_mut(&mut self) -> &mut SendData {
        match &mut self.data {
            RequestData::Send(send) => send,
            _ => unreachable!("request {:?} is not a send", self.ty),
        }
    }

    pub fn recv(&self) -> &RecvData {
        match &self.data {
            RequestData::Recv(recv) => recv,
            _ => unreachable!("request {:?} is not a recv", self.ty),
        }
    }

    pub fn recv_mut(&mut self) -> &mut RecvData {
        match &mut self.data {
            RequestData::Recv(recv) => recv,
            _ => unreachable!("request {:?} is not a recv", self.ty),
        }
    }

    pub fn connect(&self) -> &ConnectData {
        match &self.data {
            RequestData::Connect(connect) => connect,
            _ => unreachable!("request {:?} is not a connect", self.ty),
        }
    }

    /// The segment list of either direction; sends and recvs both
    /// release their segments on completion.
    pub fn segs(&self) -> &SegmentList {
        match &self.data {
            RequestData::Send(send) => &send.segs,
            RequestData::Recv(recv) => &recv.segs,
            RequestData::Connect(_) => unreachable!("connect requests carry no segments"),
        }
    }
}

/// Stable handle to a request: an arena slot plus the generation the
/// slot had when the request was allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    slot: u32,
    generation: u32,
}

impl RequestId {
    /// Packs the id into a 64-bit cookie for the driver.
    #[must_use]
    pub fn to_cookie(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.slot)
    }

    /// Unpacks a cookie back into an id; validity is only established by
    /// [`RequestArena::get`].
    #[must_use]
    pub fn from_cookie(cookie: u64) -> Self {
        Self {
            slot: cookie as u32,
            generation: (cookie >> 32) as u32,
        }
    }
}

/// Slot arena owning every live request of one endpoint.
pub(crate) struct RequestArena {
    slab: Slab<Request>,
    generations: Vec<u32>,
}

impl RequestArena {
    pub fn new() -> Self {
        Self {
            slab: Slab::new(),
            generations: Vec::new(),
        }
    }

    pub fn alloc(&mut self, req: Request) -> RequestId {
        let slot = self.slab.insert(req);
        if slot >= self.generations.len() {
            self.generations.resize(slot + 1, 0);
        }
        RequestId {
            slot: slot as u32,
            generation: self.generations[slot],
        }
    }

    pub fn free(&mut self, id: RequestId) -> Request {
        debug_assert_eq!(self.generations[id.slot as usize], id.generation);
        self.generations[id.slot as usize] = self.generations[id.slot as usize].wrapping_add(1);
        self.slab.remove(id.slot as usize)
    }

    /// Checked lookup: `None` for stale or never-valid ids.
    pub fn get(&self, id: RequestId) -> Option<&Request> {
        if *self.generations.get(id.slot as usize)? != id.generation {
            return None;
        }
        self.slab.get(id.slot as usize)
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        if *self.generations.get(id.slot as usize)? != id.generation {
            return None;
        }
        self.slab.get_mut(id.slot as usize)
    }

    /// Unchecked-by-the-caller lookup for ids the engine knows are live.
    pub fn req(&self, id: RequestId) -> &Request {
        self.get(id).expect("live request id")
    }

    pub fn req_mut(&mut self, id: RequestId) -> &mut Request {
        self.get_mut(id).expect("live request id")
    }

    /// Number of live requests.
    pub fn len(&self) -> usize {
        self.slab.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy() -> Request {
        Request::new(
            RequestType::Recv,
            RequestData::Recv(RecvData {
                segs: SegmentList::default(),
                match_info: 0,
                match_mask: 0,
                seqnum: Seq(0),
                unexp_buffer: None,
                kind: RecvKind::Basic(MediumRecv::default()),
            }),
        )
    }

    #[test]
    fn generation_invalidates_stale_ids() {
        let mut arena = RequestArena::new();
        let id = arena.alloc(dummy());
        assert!(arena.get(id).is_some());

        arena.free(id);
        assert!(arena.get(id).is_none());

        // the slot is recycled under a fresh generation
        let id2 = arena.alloc(dummy());
        assert!(arena.get(id).is_none());
        assert!(arena.get(id2).is_some());
    }

    #[test]
    fn cookie_round_trip() {
        let mut arena = RequestArena::new();
        arena.alloc(dummy());
        let id = arena.alloc(dummy());
        assert_eq!(RequestId::from_cookie(id.to_cookie()), id);
    }

    #[test]
    fn resource_sets_compose() {
        assert!(MissingResources::SEND_MEDIUMSQ.contains(MissingResources::SENDQ_SLOT));
        assert!(MissingResources::PULL.contains(MissingResources::EXP_EVENT));
        assert!(!MissingResources::SEND_LARGE.contains(MissingResources::SENDQ_SLOT));
    }
}
