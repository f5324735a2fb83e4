//! An in-process fabric implementing the [`Driver`] contract without a
//! kernel: commands are encoded into real wire frames (`omx_wire`),
//! routed between simulated endpoints, and decoded back into events.
//!
//! The fabric exists for the test suite and for running the stack on a
//! machine without the driver. It models exactly the driver behavior the
//! engine depends on: session filtering with NACK generation, recv-queue
//! staging, pull execution chunk by chunk, event-ring overflow, and a
//! virtual jiffies clock that advances while an endpoint sleeps in
//! [`Driver::wait_event`] so retransmission timers fire in bounded test
//! time.
//!
//! Loss injection sees every frame after encoding; a dropped frame is
//! simply never delivered, leaving recovery to the library's
//! retransmission machinery. Dropping driver-internal frames
//! ([`PacketType::PullRequest`] / [`PacketType::PullReply`]) stalls the
//! pull forever since the simulated driver does not model its own
//! block-level retransmit.

use std::{
    borrow::Cow,
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use ahash::AHashMap;
use bytes::BufMut;
use omx_wire::{
    ConnectReplyTrailer, ConnectRequestTrailer, ConnectStatus, LibackTrailer, MediumFragTrailer,
    NackKind, NackLibTrailer, NotifyTrailer, PacketHeader, PacketType, PullReplyTrailer,
    PullRequestTrailer, RndvTrailer, Seq,
};
use tracing::trace;

use crate::{
    abi::{
        self, pull_status, CreateUserRegion, Pull, RegionSegment, SendConnectReply,
        SendConnectRequest, SendLiback, SendMediumSqFrag, SendMediumVa, SendNotify, SendRndv,
        SendSmall, SendTiny, WaitEvent, EVENTQ_ENTRY_NR, RECVQ_ENTRY_NR, RECVQ_ENTRY_SIZE,
        SENDQ_ENTRY_NR, SENDQ_ENTRY_SIZE, SENDQ_ENTRY_SHIFT, TINY_MAX,
    },
    driver::{BoardInfo, Driver, DriverError},
    events::{Event, MsgInfo},
};

/// Bytes carried by one simulated pull-reply frame.
const PULL_REPLY_CHUNK: usize = 4096;

/// Decision callback for loss injection: the decoded header and the
/// remaining frame bytes (trailer plus payload); return `true` to drop
/// the frame.
pub type LossFilter = Box<dyn FnMut(&PacketHeader, &[u8]) -> bool + Send>;

struct SimEndpointCore {
    open: bool,
    session_id: u32,
    unexp: VecDeque<Event>,
    exp: VecDeque<Event>,
    recvq: Vec<u8>,
    recvq_next_slot: usize,
    regions: AHashMap<u8, Vec<RegionSegment>>,
    pending_pulls: AHashMap<u64, PendingPull>,
    user_event_count: u32,
    wakeup_jiffies: u64,
    status: u32,
    pending_wakeup: Option<u32>,
}

struct PendingPull {
    cmd: Pull,
    replies_missing: u32,
}

impl SimEndpointCore {
    fn new(session_id: u32) -> Self {
        Self {
            open: true,
            session_id,
            unexp: VecDeque::new(),
            exp: VecDeque::new(),
            recvq: vec![0; RECVQ_ENTRY_NR * RECVQ_ENTRY_SIZE],
            recvq_next_slot: 0,
            regions: AHashMap::new(),
            pending_pulls: AHashMap::new(),
            user_event_count: 0,
            wakeup_jiffies: abi::NO_WAKEUP_JIFFIES,
            status: 0,
            pending_wakeup: None,
        }
    }

    /// Stages payload bytes into the recv queue, returning the byte
    /// offset an event should carry.
    fn stage_recvq(&mut self, data: &[u8]) -> u32 {
        let slot = self.recvq_next_slot;
        self.recvq_next_slot = (self.recvq_next_slot + 1) % RECVQ_ENTRY_NR;
        let off = slot * RECVQ_ENTRY_SIZE;
        self.recvq[off..off + data.len()].copy_from_slice(data);
        off as u32
    }

    fn push_unexp(&mut self, event: Event) {
        if self.unexp.len() >= EVENTQ_ENTRY_NR {
            // ring full: the driver drops the packet and flags the
            // descriptor; the sender will retransmit
            self.status |= abi::DESC_STATUS_UNEXP_EVENTQ_FULL;
            return;
        }
        self.unexp.push_back(event);
    }

    fn push_exp(&mut self, event: Event) {
        self.exp.push_back(event);
    }
}

struct FabricCore {
    boards: Vec<u64>,
    peer_index_by_addr: AHashMap<u64, u16>,
    hostnames: Vec<String>,
    endpoints: AHashMap<(u16, u8), SimEndpointCore>,
    jiffies: u64,
    hz: u32,
    packet_counts: AHashMap<PacketType, u64>,
    loss_filter: Option<LossFilter>,
}

impl FabricCore {
    fn endpoint(&mut self, peer: u16, ep: u8) -> Option<&mut SimEndpointCore> {
        self.endpoints.get_mut(&(peer, ep)).filter(|c| c.open)
    }
}

/// A process-local fabric of simulated boards and endpoints.
#[derive(Clone)]
pub struct SimFabric {
    inner: Arc<Mutex<FabricCore>>,
}

impl Default for SimFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl SimFabric {
    /// Creates an empty fabric ticking at 1000 virtual jiffies per
    /// second.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FabricCore {
                boards: Vec::new(),
                peer_index_by_addr: AHashMap::new(),
                hostnames: Vec::new(),
                endpoints: AHashMap::new(),
                jiffies: 1,
                hz: 1000,
                packet_counts: AHashMap::new(),
                loss_filter: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FabricCore> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Adds a board (one simulated host NIC) and returns its index,
    /// which doubles as its peer-table index.
    pub fn add_board(&self, board_addr: u64, hostname: &str) -> u32 {
        let mut f = self.lock();
        let index = f.boards.len() as u32;
        f.boards.push(board_addr);
        f.peer_index_by_addr.insert(board_addr, index as u16);
        f.hostnames.push(hostname.to_owned());
        index
    }

    /// Number of boards.
    #[must_use]
    pub fn board_count(&self) -> u32 {
        self.lock().boards.len() as u32
    }

    /// Opens an endpoint slot on a board.
    pub fn open_endpoint(&self, board_index: u32, endpoint_index: u32) -> Result<SimDriver, DriverError> {
        let mut f = self.lock();
        let addr = *f
            .boards
            .get(board_index as usize)
            .ok_or(DriverError::BadEndpoint)?;
        if endpoint_index >= abi::ENDPOINT_MAX {
            return Err(DriverError::BadEndpoint);
        }
        let key = (board_index as u16, endpoint_index as u8);
        if f.endpoints.get(&key).is_some_and(|c| c.open) {
            return Err(DriverError::EndpointBusy);
        }
        let session_id = rand::random();
        f.endpoints.insert(key, SimEndpointCore::new(session_id));
        let hostname = f.hostnames[board_index as usize].clone();
        Ok(SimDriver {
            fabric: self.clone(),
            peer_index: board_index as u16,
            endpoint_index: endpoint_index as u8,
            session_id,
            board: BoardInfo {
                addr,
                hostname,
                ifacename: "sim0".to_owned(),
                mtu: 9000,
                numa_node: -1,
            },
            sendq: vec![0; SENDQ_ENTRY_NR * SENDQ_ENTRY_SIZE],
        })
    }

    /// Installs a frame-drop decision callback.
    pub fn set_loss_filter(
        &self,
        filter: impl FnMut(&PacketHeader, &[u8]) -> bool + Send + 'static,
    ) {
        self.lock().loss_filter = Some(Box::new(filter));
    }

    /// Removes the loss filter.
    pub fn clear_loss_filter(&self) {
        self.lock().loss_filter = None;
    }

    /// Number of frames of the given type pushed onto the fabric so far
    /// (counted before loss injection).
    #[must_use]
    pub fn packet_count(&self, ptype: PacketType) -> u64 {
        self.lock().packet_counts.get(&ptype).copied().unwrap_or(0)
    }

    /// Advances the virtual clock.
    pub fn advance_jiffies(&self, n: u64) {
        self.lock().jiffies += n;
    }

    /// Number of regions currently registered by an endpoint.
    #[must_use]
    pub fn region_count(&self, board_index: u32, endpoint_index: u32) -> usize {
        self.lock()
            .endpoints
            .get(&(board_index as u16, endpoint_index as u8))
            .map_or(0, |core| core.regions.len())
    }

    /// Current virtual clock.
    #[must_use]
    pub fn jiffies(&self) -> u64 {
        self.lock().jiffies
    }
}

/// The [`Driver`] face of one simulated endpoint.
pub struct SimDriver {
    fabric: SimFabric,
    peer_index: u16,
    endpoint_index: u8,
    session_id: u32,
    board: BoardInfo,
    sendq: Vec<u8>,
}

struct FrameMeta<'a> {
    header: PacketHeader,
    payload: &'a [u8],
}

impl SimDriver {
    fn key(&self) -> (u16, u8) {
        (self.peer_index, self.endpoint_index)
    }

    fn header(
        &self,
        ptype: PacketType,
        dest_endpoint: u8,
        length: u16,
        seqnum: u16,
        piggyack: u16,
        match_info: u64,
        session_id: u32,
    ) -> PacketHeader {
        PacketHeader {
            ptype,
            dest_endpoint,
            src_endpoint: self.endpoint_index,
            src_generation: 0,
            length,
            lib_seqnum: Seq(seqnum),
            piggyack: Seq(piggyack),
            match_info,
            session_id,
        }
    }

    /// Encodes and routes one frame, applying counters and the loss
    /// filter, then delivering it unless the destination refuses it.
    fn transmit(&self, dest_peer: u16, meta: &FrameMeta<'_>) -> Result<(), DriverError> {
        let mut frame = Vec::with_capacity(PacketHeader::ENCODE_LEN + meta.payload.len());
        meta.header.encode(&mut frame);
        frame.put_slice(meta.payload);

        let mut f = self.fabric.lock();
        let decoded = PacketHeader::decode(&mut &frame[..]).expect("frame built above");
        *f.packet_counts.entry(decoded.ptype).or_insert(0) += 1;

        if let Some(filter) = f.loss_filter.as_mut() {
            if filter(&decoded, &frame[PacketHeader::ENCODE_LEN..]) {
                trace!(ptype = ?decoded.ptype, seqnum = %decoded.lib_seqnum, "sim dropping frame");
                return Ok(());
            }
        }

        self.deliver(&mut f, dest_peer, &decoded, &frame[PacketHeader::ENCODE_LEN..]);
        Ok(())
    }

    /// Posts a NACK event back to ourselves, as the remote driver would.
    fn nack_self(
        &self,
        f: &mut FabricCore,
        from_peer: u16,
        from_endpoint: u8,
        seqnum: Seq,
        kind: NackKind,
    ) {
        let mut frame = Vec::new();
        let hdr = PacketHeader {
            ptype: PacketType::NackLib,
            dest_endpoint: self.endpoint_index,
            src_endpoint: from_endpoint,
            src_generation: 0,
            length: 0,
            lib_seqnum: seqnum,
            piggyack: Seq(0),
            match_info: 0,
            session_id: 0,
        };
        hdr.encode(&mut frame);
        NackLibTrailer { kind }.encode(&mut frame);
        *f.packet_counts.entry(PacketType::NackLib).or_insert(0) += 1;

        if let Some(me) = f.endpoint(self.peer_index, self.endpoint_index) {
            me.push_unexp(Event::NackLib {
                peer_index: from_peer,
                src_endpoint: from_endpoint,
                seqnum,
                kind,
            });
        }
    }

    #[allow(clippy::too_many_lines)]
    fn deliver(&self, f: &mut FabricCore, dest_peer: u16, hdr: &PacketHeader, rest: &[u8]) {
        let msg = |peer: u16| MsgInfo {
            peer_index: peer,
            src_endpoint: hdr.src_endpoint,
            seqnum: hdr.lib_seqnum,
            piggyack: hdr.piggyack,
            match_info: hdr.match_info,
        };
        let src_peer = self.peer_index;

        // session-filtered lib-level data packets
        let session_checked = matches!(
            hdr.ptype,
            PacketType::Tiny
                | PacketType::Small
                | PacketType::MediumFrag
                | PacketType::Rndv
                | PacketType::Notify
        );

        if !f.endpoints.contains_key(&(dest_peer, hdr.dest_endpoint)) {
            if session_checked {
                self.nack_self(f, dest_peer, hdr.dest_endpoint, hdr.lib_seqnum, NackKind::BadEndpoint);
            }
            return;
        }
        let dest = f
            .endpoints
            .get_mut(&(dest_peer, hdr.dest_endpoint))
            .expect("checked above");
        if !dest.open {
            if session_checked {
                self.nack_self(
                    f,
                    dest_peer,
                    hdr.dest_endpoint,
                    hdr.lib_seqnum,
                    NackKind::EndpointClosed,
                );
            }
            return;
        }
        if session_checked && hdr.session_id != dest.session_id {
            self.nack_self(f, dest_peer, hdr.dest_endpoint, hdr.lib_seqnum, NackKind::BadSession);
            return;
        }

        let mut rest = rest;
        match hdr.ptype {
            PacketType::Tiny => {
                let mut data = [0u8; TINY_MAX];
                data[..rest.len().min(TINY_MAX)]
                    .copy_from_slice(&rest[..rest.len().min(TINY_MAX)]);
                dest.push_unexp(Event::Tiny {
                    msg: msg(src_peer),
                    length: hdr.length,
                    data,
                });
            }
            PacketType::Small => {
                let recvq_offset = dest.stage_recvq(rest);
                dest.push_unexp(Event::Small {
                    msg: msg(src_peer),
                    length: hdr.length,
                    recvq_offset,
                });
            }
            PacketType::MediumFrag => {
                let Ok(trailer) = MediumFragTrailer::decode(&mut rest) else {
                    return;
                };
                let recvq_offset = dest.stage_recvq(rest);
                dest.push_unexp(Event::MediumFrag {
                    msg: msg(src_peer),
                    msg_length: trailer.msg_length,
                    frag_length: trailer.frag_length,
                    frag_seqnum: trailer.frag_seqnum,
                    frag_pipeline: trailer.frag_pipeline,
                    recvq_offset,
                });
            }
            PacketType::Rndv => {
                let Ok(trailer) = RndvTrailer::decode(&mut rest) else {
                    return;
                };
                dest.push_unexp(Event::Rndv {
                    msg: msg(src_peer),
                    msg_length: trailer.msg_length,
                    rdma_id: trailer.rdma_id,
                    rdma_seqnum: trailer.rdma_seqnum,
                    rdma_offset: trailer.rdma_offset,
                });
            }
            PacketType::Notify => {
                let Ok(trailer) = NotifyTrailer::decode(&mut rest) else {
                    return;
                };
                dest.push_unexp(Event::Notify {
                    msg: msg(src_peer),
                    length: trailer.total_length,
                    pulled_rdma_id: trailer.pulled_rdma_id,
                    pulled_rdma_seqnum: trailer.pulled_rdma_seqnum,
                });
            }
            PacketType::ConnectRequest => {
                let Ok(trailer) = ConnectRequestTrailer::decode(&mut rest) else {
                    return;
                };
                let shared = f.boards[src_peer as usize] == f.boards[dest_peer as usize];
                // reborrow after reading the boards table
                let Some(dest) = f.endpoint(dest_peer, hdr.dest_endpoint) else {
                    return;
                };
                dest.push_unexp(Event::ConnectRequest {
                    peer_index: src_peer,
                    src_endpoint: hdr.src_endpoint,
                    shared,
                    src_session_id: trailer.src_session_id,
                    app_key: trailer.app_key,
                    target_recv_seqnum_start: trailer.target_recv_seqnum_start,
                    connect_seqnum: trailer.connect_seqnum,
                });
            }
            PacketType::ConnectReply => {
                let Ok(trailer) = ConnectReplyTrailer::decode(&mut rest) else {
                    return;
                };
                let shared = f.boards[src_peer as usize] == f.boards[dest_peer as usize];
                let Some(dest) = f.endpoint(dest_peer, hdr.dest_endpoint) else {
                    return;
                };
                dest.push_unexp(Event::ConnectReply {
                    peer_index: src_peer,
                    src_endpoint: hdr.src_endpoint,
                    shared,
                    src_session_id: trailer.src_session_id,
                    target_session_id: trailer.target_session_id,
                    target_recv_seqnum_start: trailer.target_recv_seqnum_start,
                    connect_seqnum: trailer.connect_seqnum,
                    status: trailer.status,
                });
            }
            PacketType::Liback => {
                let Ok(trailer) = LibackTrailer::decode(&mut rest) else {
                    return;
                };
                dest.push_unexp(Event::Liback {
                    peer_index: src_peer,
                    src_endpoint: hdr.src_endpoint,
                    session_id: trailer.session_id,
                    acknum: trailer.acknum,
                    lib_seqnum_up_to: trailer.lib_seqnum_up_to,
                });
            }
            PacketType::PullRequest => {
                let Ok(trailer) = PullRequestTrailer::decode(&mut rest) else {
                    return;
                };
                self.serve_pull(f, dest_peer, hdr, &trailer);
            }
            PacketType::PullReply => {
                let Ok(trailer) = PullReplyTrailer::decode(&mut rest) else {
                    return;
                };
                self.finish_pull_reply(f, dest_peer, hdr.dest_endpoint, &trailer);
            }
            PacketType::NackLib | PacketType::Truc => {}
        }
    }

    /// Executes the pulled side of a pull: emit one reply frame per
    /// chunk back to the puller.
    fn serve_pull(
        &self,
        f: &mut FabricCore,
        dest_peer: u16,
        hdr: &PacketHeader,
        trailer: &PullRequestTrailer,
    ) {
        let dest_state = f
            .endpoints
            .get(&(dest_peer, hdr.dest_endpoint))
            .filter(|core| core.open)
            .map(|core| {
                (
                    core.session_id,
                    core.regions.contains_key(&trailer.pulled_rdma_id),
                )
            });
        let refusal = match dest_state {
            None => Some(pull_status::BAD_ENDPT),
            Some((session, _)) if hdr.session_id != session => Some(pull_status::BAD_SESSION),
            Some((_, false)) => Some(pull_status::BAD_RDMAWIN),
            Some((_, true)) => None,
        };
        if let Some(status) = refusal {
            self.pull_done_self(f, trailer.src_pull_handle, trailer.puller_rdma_id, status);
            return;
        }

        let chunks = if trailer.length == 0 {
            1
        } else {
            (trailer.length as usize).div_ceil(PULL_REPLY_CHUNK)
        };
        for i in 0..chunks {
            let offset = i * PULL_REPLY_CHUNK;
            let mut frame = Vec::new();
            let reply_hdr = PacketHeader {
                ptype: PacketType::PullReply,
                dest_endpoint: hdr.src_endpoint,
                src_endpoint: hdr.dest_endpoint,
                src_generation: 0,
                length: (trailer.length as usize - offset).min(PULL_REPLY_CHUNK) as u16,
                lib_seqnum: Seq(0),
                piggyack: Seq(0),
                match_info: 0,
                session_id: 0,
            };
            reply_hdr.encode(&mut frame);
            PullReplyTrailer {
                pull_handle: trailer.src_pull_handle,
                frame_seqnum: i as u32,
                offset: offset as u32,
            }
            .encode(&mut frame);
            *f.packet_counts.entry(PacketType::PullReply).or_insert(0) += 1;

            let decoded = PacketHeader::decode(&mut &frame[..]).expect("frame built above");
            if let Some(filter) = f.loss_filter.as_mut() {
                if filter(&decoded, &frame[PacketHeader::ENCODE_LEN..]) {
                    continue;
                }
            }
            let reply_trailer =
                PullReplyTrailer::decode(&mut &frame[PacketHeader::ENCODE_LEN..]).expect("built");
            self.finish_pull_reply(f, self.peer_index, hdr.src_endpoint, &reply_trailer);
        }
    }

    /// Accounts one pull-reply at the puller; on the last one, performs
    /// the region-to-region copy and posts PULL_DONE.
    fn finish_pull_reply(
        &self,
        f: &mut FabricCore,
        puller_peer: u16,
        puller_endpoint: u8,
        trailer: &PullReplyTrailer,
    ) {
        let Some(puller) = f.endpoints.get_mut(&(puller_peer, puller_endpoint)) else {
            return;
        };
        let Some(pending) = puller.pending_pulls.get_mut(&trailer.pull_handle) else {
            return;
        };
        pending.replies_missing -= 1;
        if pending.replies_missing > 0 {
            return;
        }
        let pending = puller
            .pending_pulls
            .remove(&trailer.pull_handle)
            .expect("checked above");
        let cmd = pending.cmd;

        let dst_segs = puller.regions.get(&cmd.puller_rdma_id).cloned();
        let pulled_key = (cmd.peer_index, cmd.dest_endpoint);
        let src_segs = f
            .endpoints
            .get(&pulled_key)
            .and_then(|e| e.regions.get(&cmd.pulled_rdma_id))
            .cloned();

        let status = match (src_segs, dst_segs) {
            (Some(src), Some(dst)) => {
                copy_between_regions(&src, cmd.pulled_rdma_offset as usize, &dst, cmd.length as usize);
                pull_status::SUCCESS
            }
            _ => pull_status::BAD_RDMAWIN,
        };

        if let Some(puller) = f.endpoint(puller_peer, puller_endpoint) {
            puller.push_exp(Event::PullDone {
                lib_cookie: cmd.lib_cookie,
                puller_rdma_id: cmd.puller_rdma_id,
                status,
            });
        }
    }

    fn pull_done_self(&self, f: &mut FabricCore, lib_cookie: u64, puller_rdma_id: u8, status: u8) {
        if let Some(me) = f.endpoint(self.peer_index, self.endpoint_index) {
            me.push_exp(Event::PullDone {
                lib_cookie,
                puller_rdma_id,
                status,
            });
        }
    }

    fn with_self<R>(&self, op: impl FnOnce(&mut SimEndpointCore) -> R) -> R {
        let mut f = self.fabric.lock();
        let core = f
            .endpoints
            .get_mut(&self.key())
            .expect("endpoint exists while driver is alive");
        op(core)
    }
}

/// Copies `len` bytes from `src` segments (starting at `src_offset`)
/// into `dst` segments, through the raw user memory both sides
/// registered.
fn copy_between_regions(src: &[RegionSegment], src_offset: usize, dst: &[RegionSegment], len: usize) {
    let mut gathered = Vec::with_capacity(len);
    let mut skip = src_offset;
    for seg in src {
        if gathered.len() == len {
            break;
        }
        let seg_len = seg.len as usize;
        if skip >= seg_len {
            skip -= seg_len;
            continue;
        }
        let take = (seg_len - skip).min(len - gathered.len());
        let slice = unsafe { std::slice::from_raw_parts((seg.vaddr as usize + skip) as *const u8, take) };
        gathered.extend_from_slice(slice);
        skip = 0;
    }

    let mut written = 0;
    for seg in dst {
        if written == gathered.len() {
            break;
        }
        let take = (seg.len as usize).min(gathered.len() - written);
        let slice = unsafe { std::slice::from_raw_parts_mut(seg.vaddr as usize as *mut u8, take) };
        slice.copy_from_slice(&gathered[written..written + take]);
        written += take;
    }
}

/// Reads a user payload behind a raw (vaddr, len) pair, as the kernel
/// driver would at post time.
unsafe fn user_slice<'a>(vaddr: u64, len: usize) -> &'a [u8] {
    std::slice::from_raw_parts(vaddr as usize as *const u8, len)
}

impl Driver for SimDriver {
    fn board_info(&self) -> &BoardInfo {
        &self.board
    }

    fn endpoint_index(&self) -> u8 {
        self.endpoint_index
    }

    fn session_id(&self) -> u32 {
        self.session_id
    }

    fn endpoint_max(&self) -> u32 {
        abi::ENDPOINT_MAX
    }

    fn jiffies(&self) -> u64 {
        self.fabric.lock().jiffies
    }

    fn hz(&self) -> u32 {
        self.fabric.lock().hz
    }

    fn take_status(&mut self) -> u32 {
        self.with_self(|core| std::mem::take(&mut core.status))
    }

    fn set_wakeup_jiffies(&mut self, jiffies: u64) {
        self.with_self(|core| core.wakeup_jiffies = jiffies);
    }

    fn notify_user_event(&mut self) {
        self.with_self(|core| core.user_event_count = core.user_event_count.wrapping_add(1));
    }

    fn user_event_count(&self) -> u32 {
        self.with_self(|core| core.user_event_count)
    }

    fn peer_addr_to_index(&self, board_addr: u64) -> Option<u16> {
        self.fabric.lock().peer_index_by_addr.get(&board_addr).copied()
    }

    fn peer_index_to_addr(&self, index: u16) -> Option<u64> {
        self.fabric.lock().boards.get(index as usize).copied()
    }

    fn send_tiny(&mut self, cmd: &SendTiny) -> Result<(), DriverError> {
        let hdr = self.header(
            PacketType::Tiny,
            cmd.dest_endpoint,
            cmd.length,
            cmd.seqnum,
            cmd.piggyack,
            cmd.match_info,
            cmd.session_id,
        );
        self.transmit(
            cmd.peer_index,
            &FrameMeta {
                header: hdr,
                payload: &cmd.data[..cmd.length as usize],
            },
        )
    }

    fn send_small(&mut self, cmd: &SendSmall) -> Result<(), DriverError> {
        let payload = unsafe { user_slice(cmd.vaddr, cmd.length as usize) };
        let hdr = self.header(
            PacketType::Small,
            cmd.dest_endpoint,
            cmd.length,
            cmd.seqnum,
            cmd.piggyack,
            cmd.match_info,
            cmd.session_id,
        );
        self.transmit(
            cmd.peer_index,
            &FrameMeta {
                header: hdr,
                payload,
            },
        )
    }

    fn send_mediumsq_frag(&mut self, cmd: &SendMediumSqFrag) -> Result<(), DriverError> {
        let slot = (cmd.sendq_offset >> SENDQ_ENTRY_SHIFT) as usize;
        let off = slot << SENDQ_ENTRY_SHIFT;
        let payload = self.sendq[off..off + cmd.frag_length as usize].to_vec();

        let mut trailer = Vec::new();
        MediumFragTrailer {
            msg_length: cmd.msg_length,
            frag_length: cmd.frag_length,
            frag_seqnum: cmd.frag_seqnum,
            frag_pipeline: cmd.frag_pipeline,
        }
        .encode(&mut trailer);
        trailer.extend_from_slice(&payload);

        let hdr = self.header(
            PacketType::MediumFrag,
            cmd.dest_endpoint,
            cmd.frag_length,
            cmd.seqnum,
            cmd.piggyack,
            cmd.match_info,
            cmd.session_id,
        );
        self.transmit(
            cmd.peer_index,
            &FrameMeta {
                header: hdr,
                payload: &trailer,
            },
        )?;

        // the copy out of the sendq slot is synchronous here, so the
        // slot is immediately reusable
        let mut f = self.fabric.lock();
        if let Some(me) = f.endpoint(self.peer_index, self.endpoint_index) {
            me.push_exp(Event::MediumSqFragDone {
                sendq_offset: cmd.sendq_offset,
            });
        }
        Ok(())
    }

    fn send_mediumva(&mut self, cmd: &SendMediumVa) -> Result<(), DriverError> {
        let segs = unsafe {
            std::slice::from_raw_parts(
                cmd.segments as usize as *const RegionSegment,
                cmd.nr_segments as usize,
            )
        };
        let mut data = Vec::with_capacity(cmd.length as usize);
        for seg in segs {
            let take = (seg.len as usize).min(cmd.length as usize - data.len());
            data.extend_from_slice(unsafe { user_slice(seg.vaddr, take) });
            if data.len() == cmd.length as usize {
                break;
            }
        }

        // the driver fragments a mediumva by itself
        let frag_max = abi::MEDIUM_FRAG_LENGTH_MAX;
        let frags = if data.is_empty() {
            1
        } else {
            data.len().div_ceil(frag_max)
        };
        for i in 0..frags {
            let chunk = &data[i * frag_max..(i * frag_max + frag_max).min(data.len())];
            let mut trailer = Vec::new();
            MediumFragTrailer {
                msg_length: cmd.length,
                frag_length: chunk.len() as u16,
                frag_seqnum: i as u8,
                frag_pipeline: SENDQ_ENTRY_SHIFT as u8,
            }
            .encode(&mut trailer);
            trailer.extend_from_slice(chunk);

            let hdr = self.header(
                PacketType::MediumFrag,
                cmd.dest_endpoint,
                chunk.len() as u16,
                cmd.seqnum,
                cmd.piggyack,
                cmd.match_info,
                cmd.session_id,
            );
            self.transmit(
                cmd.peer_index,
                &FrameMeta {
                    header: hdr,
                    payload: &trailer,
                },
            )?;
        }
        Ok(())
    }

    fn send_rndv(&mut self, cmd: &SendRndv) -> Result<(), DriverError> {
        let mut trailer = Vec::new();
        RndvTrailer {
            msg_length: cmd.msg_length,
            rdma_id: cmd.pulled_rdma_id,
            rdma_seqnum: cmd.pulled_rdma_seqnum,
            rdma_offset: 0,
        }
        .encode(&mut trailer);
        let hdr = self.header(
            PacketType::Rndv,
            cmd.dest_endpoint,
            0,
            cmd.seqnum,
            cmd.piggyack,
            cmd.match_info,
            cmd.session_id,
        );
        self.transmit(
            cmd.peer_index,
            &FrameMeta {
                header: hdr,
                payload: &trailer,
            },
        )
    }

    fn send_notify(&mut self, cmd: &SendNotify) -> Result<(), DriverError> {
        let mut trailer = Vec::new();
        NotifyTrailer {
            total_length: cmd.total_length,
            pulled_rdma_id: cmd.pulled_rdma_id,
            pulled_rdma_seqnum: cmd.pulled_rdma_seqnum,
        }
        .encode(&mut trailer);
        let hdr = self.header(
            PacketType::Notify,
            cmd.dest_endpoint,
            0,
            cmd.seqnum,
            cmd.piggyack,
            0,
            cmd.session_id,
        );
        self.transmit(
            cmd.peer_index,
            &FrameMeta {
                header: hdr,
                payload: &trailer,
            },
        )
    }

    fn send_connect_request(&mut self, cmd: &SendConnectRequest) -> Result<(), DriverError> {
        let mut trailer = Vec::new();
        ConnectRequestTrailer {
            app_key: cmd.app_key,
            src_session_id: cmd.src_session_id,
            target_recv_seqnum_start: Seq(cmd.target_recv_seqnum_start),
            connect_seqnum: cmd.connect_seqnum,
        }
        .encode(&mut trailer);
        let hdr = self.header(
            PacketType::ConnectRequest,
            cmd.dest_endpoint,
            0,
            u16::from(cmd.connect_seqnum),
            0,
            0,
            0,
        );
        self.transmit(
            cmd.peer_index,
            &FrameMeta {
                header: hdr,
                payload: &trailer,
            },
        )
    }

    fn send_connect_reply(&mut self, cmd: &SendConnectReply) -> Result<(), DriverError> {
        let mut trailer = Vec::new();
        ConnectReplyTrailer {
            src_session_id: cmd.src_session_id,
            target_session_id: cmd.target_session_id,
            target_recv_seqnum_start: Seq(cmd.target_recv_seqnum_start),
            connect_seqnum: cmd.connect_seqnum,
            status: if cmd.status == 0 {
                ConnectStatus::Success
            } else {
                ConnectStatus::BadKey
            },
        }
        .encode(&mut trailer);
        let hdr = self.header(
            PacketType::ConnectReply,
            cmd.dest_endpoint,
            0,
            u16::from(cmd.connect_seqnum),
            0,
            0,
            0,
        );
        self.transmit(
            cmd.peer_index,
            &FrameMeta {
                header: hdr,
                payload: &trailer,
            },
        )
    }

    fn send_liback(&mut self, cmd: &SendLiback) -> Result<(), DriverError> {
        let mut trailer = Vec::new();
        LibackTrailer {
            acknum: cmd.acknum,
            lib_seqnum_up_to: Seq(cmd.lib_seqnum_up_to),
            session_id: cmd.session_id,
        }
        .encode(&mut trailer);
        let hdr = self.header(
            PacketType::Liback,
            cmd.dest_endpoint,
            0,
            0,
            0,
            0,
            cmd.session_id,
        );
        self.transmit(
            cmd.peer_index,
            &FrameMeta {
                header: hdr,
                payload: &trailer,
            },
        )
    }

    fn pull(&mut self, cmd: &Pull) -> Result<(), DriverError> {
        let chunks = if cmd.length == 0 {
            1
        } else {
            (cmd.length as usize).div_ceil(PULL_REPLY_CHUNK) as u32
        };
        {
            let mut f = self.fabric.lock();
            let Some(me) = f.endpoint(self.peer_index, self.endpoint_index) else {
                return Err(DriverError::NoDevice);
            };
            me.pending_pulls.insert(
                cmd.lib_cookie,
                PendingPull {
                    cmd: *cmd,
                    replies_missing: chunks,
                },
            );
        }

        let mut trailer = Vec::new();
        PullRequestTrailer {
            length: cmd.length,
            puller_rdma_id: cmd.puller_rdma_id,
            pulled_rdma_id: cmd.pulled_rdma_id,
            pulled_rdma_seqnum: cmd.pulled_rdma_seqnum,
            puller_offset: 0,
            pulled_offset: cmd.pulled_rdma_offset,
            src_pull_handle: cmd.lib_cookie,
        }
        .encode(&mut trailer);
        let hdr = self.header(
            PacketType::PullRequest,
            cmd.dest_endpoint,
            0,
            0,
            0,
            0,
            cmd.session_id,
        );
        self.transmit(
            cmd.peer_index,
            &FrameMeta {
                header: hdr,
                payload: &trailer,
            },
        )
    }

    fn create_user_region(
        &mut self,
        cmd: &CreateUserRegion,
        segments: &[RegionSegment],
    ) -> Result<(), DriverError> {
        self.with_self(|core| {
            core.regions.insert(cmd.id, segments.to_vec());
        });
        Ok(())
    }

    fn destroy_user_region(&mut self, id: u8) -> Result<(), DriverError> {
        self.with_self(|core| {
            core.regions.remove(&id);
        });
        Ok(())
    }

    fn poll_unexp(&mut self) -> Option<Event> {
        self.with_self(|core| core.unexp.pop_front())
    }

    fn poll_exp(&mut self) -> Option<Event> {
        self.with_self(|core| core.exp.pop_front())
    }

    fn sendq_slot_mut(&mut self, index: u16) -> &mut [u8] {
        let off = (index as usize) << SENDQ_ENTRY_SHIFT;
        &mut self.sendq[off..off + SENDQ_ENTRY_SIZE]
    }

    fn recvq_data(&mut self, offset: u32, len: usize) -> Cow<'_, [u8]> {
        self.with_self(|core| {
            Cow::Owned(core.recvq[offset as usize..offset as usize + len].to_vec())
        })
    }

    fn wait_event(&mut self, wait: &mut WaitEvent) -> Result<(), DriverError> {
        let mut f = self.fabric.lock();
        let now = f.jiffies;
        let Some(core) = f.endpoints.get_mut(&self.key()) else {
            return Err(DriverError::NoDevice);
        };

        if let Some(status) = core.pending_wakeup.take() {
            wait.status = status;
            return Ok(());
        }
        if !core.unexp.is_empty()
            || !core.exp.is_empty()
            || core.user_event_count != wait.user_event_index
        {
            wait.status = abi::WAIT_EVENT_STATUS_PROGRESS;
            return Ok(());
        }
        if now >= wait.timeout_jiffies {
            wait.status = abi::WAIT_EVENT_STATUS_TIMEOUT;
            return Ok(());
        }

        // nothing pending: let virtual time pass so library timers
        // (resend, delayed acks) make progress
        f.jiffies += 1;
        wait.status = if f.jiffies >= wait.timeout_jiffies {
            abi::WAIT_EVENT_STATUS_TIMEOUT
        } else {
            abi::WAIT_EVENT_STATUS_PROGRESS
        };
        Ok(())
    }

    fn wakeup(&mut self, status: u32) -> Result<(), DriverError> {
        self.with_self(|core| core.pending_wakeup = Some(status));
        Ok(())
    }
}

impl Drop for SimDriver {
    fn drop(&mut self) {
        let mut f = self.fabric.lock();
        if let Some(core) = f.endpoints.get_mut(&self.key()) {
            core.open = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn two_endpoints() -> (SimFabric, SimDriver, SimDriver) {
        let fabric = SimFabric::new();
        fabric.add_board(0x0011_2233_4455, "hostA");
        fabric.add_board(0x0011_2233_4466, "hostB");
        let a = fabric.open_endpoint(0, 0).unwrap();
        let b = fabric.open_endpoint(1, 0).unwrap();
        (fabric, a, b)
    }

    #[test]
    fn tiny_routes_to_peer() {
        let (_fabric, mut a, mut b) = two_endpoints();
        let mut cmd = SendTiny {
            peer_index: 1,
            dest_endpoint: 0,
            shared: 0,
            length: 5,
            seqnum: 1,
            piggyack: 1,
            pad: [0; 2],
            session_id: b.session_id(),
            match_info: 0xabcd,
            data: [0; TINY_MAX],
        };
        cmd.data[..5].copy_from_slice(b"hello");
        a.send_tiny(&cmd).unwrap();

        let ev = b.poll_unexp().unwrap();
        assert_matches!(ev, Event::Tiny { msg, length: 5, data } => {
            assert_eq!(msg.peer_index, 0);
            assert_eq!(msg.match_info, 0xabcd);
            assert_eq!(&data[..5], b"hello");
        });
        assert!(a.poll_unexp().is_none());
    }

    #[test]
    fn bad_session_nacks_sender() {
        let (_fabric, mut a, mut b) = two_endpoints();
        let cmd = SendTiny {
            peer_index: 1,
            dest_endpoint: 0,
            shared: 0,
            length: 0,
            seqnum: 9,
            piggyack: 0,
            pad: [0; 2],
            session_id: b.session_id().wrapping_add(1),
            match_info: 0,
            data: [0; TINY_MAX],
        };
        a.send_tiny(&cmd).unwrap();

        assert!(b.poll_unexp().is_none());
        assert_matches!(
            a.poll_unexp(),
            Some(Event::NackLib { kind: NackKind::BadSession, seqnum: Seq(9), .. })
        );
    }

    #[test]
    fn loss_filter_drops_frames() {
        let (fabric, mut a, mut b) = two_endpoints();
        fabric.set_loss_filter(|hdr, _| hdr.ptype == PacketType::Tiny);
        let cmd = SendTiny {
            peer_index: 1,
            dest_endpoint: 0,
            shared: 0,
            length: 0,
            seqnum: 1,
            piggyack: 0,
            pad: [0; 2],
            session_id: b.session_id(),
            match_info: 0,
            data: [0; TINY_MAX],
        };
        a.send_tiny(&cmd).unwrap();
        assert!(b.poll_unexp().is_none());
        assert_eq!(fabric.packet_count(PacketType::Tiny), 1);
    }

    #[test]
    fn pull_copies_between_regions() {
        let (fabric, mut a, mut b) = two_endpoints();
        let src = vec![7u8; 10000];
        let mut dst = vec![0u8; 10000];

        b.create_user_region(
            &CreateUserRegion { id: 3, pad: [0; 3], nr_segments: 0, segments: 0 },
            &[RegionSegment { vaddr: src.as_ptr() as u64, len: 10000, pad: 0 }],
        )
        .unwrap();
        a.create_user_region(
            &CreateUserRegion { id: 5, pad: [0; 3], nr_segments: 0, segments: 0 },
            &[RegionSegment { vaddr: dst.as_mut_ptr() as u64, len: 10000, pad: 0 }],
        )
        .unwrap();

        a.pull(&Pull {
            peer_index: 1,
            dest_endpoint: 0,
            shared: 0,
            length: 10000,
            session_id: b.session_id(),
            puller_rdma_id: 5,
            pulled_rdma_id: 3,
            pulled_rdma_seqnum: 0,
            pad: 0,
            pulled_rdma_offset: 0,
            resend_timeout_jiffies: 0,
            lib_cookie: 42,
        })
        .unwrap();

        assert_matches!(
            a.poll_exp(),
            Some(Event::PullDone { lib_cookie: 42, puller_rdma_id: 5, status }) => {
                assert_eq!(status, pull_status::SUCCESS);
            }
        );
        assert!(dst.iter().all(|&x| x == 7));
        assert_eq!(fabric.packet_count(PacketType::PullRequest), 1);
        assert_eq!(fabric.packet_count(PacketType::PullReply), 3);
    }
}
