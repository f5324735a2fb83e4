//! Binary interface shared with the kernel driver: tunable limits, ioctl
//! command numbers, packed command structures and the 64-byte event-slot
//! records of the two memory-mapped event rings.
//!
//! Every command structure is `#[repr(C)]`, zero-filled in its padding,
//! and passed to the driver by pointer. Event slots are written by the
//! driver with the type byte last, so a reader that observes a non-zero
//! type byte may trust the rest of the slot.

use static_assertions::const_assert_eq;

/// Largest payload carried inline in a tiny command and its event.
pub const TINY_MAX: usize = 32;

/// Largest payload of a small message.
pub const SMALL_MAX: usize = 128;

/// log2 of the size of one send-queue slot.
pub const SENDQ_ENTRY_SHIFT: u32 = 12;

/// Size of one send-queue slot; also the medium fragment payload limit.
pub const SENDQ_ENTRY_SIZE: usize = 1 << SENDQ_ENTRY_SHIFT;

/// Number of slots in the mapped send queue.
pub const SENDQ_ENTRY_NR: usize = 1024;

/// Size of one recv-queue slot.
pub const RECVQ_ENTRY_SIZE: usize = 1 << SENDQ_ENTRY_SHIFT;

/// Number of slots in the mapped recv queue.
pub const RECVQ_ENTRY_NR: usize = 1024;

/// Largest medium fragment payload.
pub const MEDIUM_FRAG_LENGTH_MAX: usize = SENDQ_ENTRY_SIZE;

/// Most fragments a single medium message may span (the receiver tracks
/// them in a 32-bit mask).
pub const MEDIUM_FRAGS_MAX: usize = 32;

/// Largest message that may go through the medium path.
pub const MEDIUM_MSG_LENGTH_MAX: usize = MEDIUM_FRAG_LENGTH_MAX * MEDIUM_FRAGS_MAX;

/// Size of one event-ring slot.
pub const EVENT_SLOT_SIZE: usize = 64;

/// Number of slots in each of the two event rings.
pub const EVENTQ_ENTRY_NR: usize = 1024;

/// Registered-region ids live in `0..USER_REGION_MAX`.
pub const USER_REGION_MAX: usize = 256;

/// Most endpoints a single board supports.
pub const ENDPOINT_MAX: u32 = 32;

/// Most peers the driver peer table holds.
pub const PEER_MAX: u32 = 1024;

/// Most segments one registered region or request may carry.
pub const MAX_SEGMENTS: usize = 256;

/// `timeout_jiffies` value meaning "no timeout" in [`WaitEvent`].
pub const WAIT_EVENT_TIMEOUT_INFINITE: u64 = u64::MAX;

/// `wakeup_jiffies` value meaning "no timer-driven wakeup needed".
pub const NO_WAKEUP_JIFFIES: u64 = u64::MAX;

/// mmap offset of the send queue on the endpoint file descriptor.
pub const SENDQ_FILE_OFFSET: i64 = 0;
/// mmap offset of the recv queue.
pub const RECVQ_FILE_OFFSET: i64 = SENDQ_FILE_OFFSET + (SENDQ_ENTRY_NR * SENDQ_ENTRY_SIZE) as i64;
/// mmap offset of the expected event ring.
pub const EXP_EVENTQ_FILE_OFFSET: i64 =
    RECVQ_FILE_OFFSET + (RECVQ_ENTRY_NR * RECVQ_ENTRY_SIZE) as i64;
/// mmap offset of the unexpected event ring.
pub const UNEXP_EVENTQ_FILE_OFFSET: i64 =
    EXP_EVENTQ_FILE_OFFSET + (EVENTQ_ENTRY_NR * EVENT_SLOT_SIZE) as i64;
/// mmap offset of the endpoint descriptor page.
pub const DESC_FILE_OFFSET: i64 = UNEXP_EVENTQ_FILE_OFFSET + (EVENTQ_ENTRY_NR * EVENT_SLOT_SIZE) as i64;

/// Endpoint descriptor status bit: the expected event ring overflowed.
pub const DESC_STATUS_EXP_EVENTQ_FULL: u32 = 1 << 0;
/// Endpoint descriptor status bit: the unexpected event ring overflowed
/// and inbound packets were dropped (the peer will resend).
pub const DESC_STATUS_UNEXP_EVENTQ_FULL: u32 = 1 << 1;
/// Endpoint descriptor status bit: the interface is administratively down.
pub const DESC_STATUS_IFACE_DOWN: u32 = 1 << 2;
/// Endpoint descriptor status bit: the interface MTU is too small for the
/// configured fragment size.
pub const DESC_STATUS_IFACE_BAD_MTU: u32 = 1 << 3;
/// Endpoint descriptor status bit: the interface disappeared; the
/// endpoint is dead.
pub const DESC_STATUS_IFACE_REMOVED: u32 = 1 << 4;

const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;
const IOC_MAGIC: u64 = b'O' as u64;

#[allow(clippy::cast_possible_truncation)]
const fn ioc(dir: u64, nr: u64, size: usize) -> u64 {
    (dir << 30) | ((size as u64) << 16) | (IOC_MAGIC << 8) | nr
}

const fn iow<T>(nr: u64) -> u64 {
    ioc(IOC_WRITE, nr, std::mem::size_of::<T>())
}

const fn iowr<T>(nr: u64) -> u64 {
    ioc(IOC_WRITE | IOC_READ, nr, std::mem::size_of::<T>())
}

/// ioctl numbers of the driver command set.
#[allow(missing_docs)]
pub mod ioctl {
    use super::{iow, iowr, ioc, IOC_READ};

    pub const GET_BOARD_COUNT: u64 = ioc(IOC_READ, 0x01, 4);
    pub const GET_BOARD_INFO: u64 = iowr::<super::GetBoardInfo>(0x02);
    pub const GET_ENDPOINT_INFO: u64 = iowr::<super::GetEndpointInfo>(0x03);
    pub const GET_COUNTERS: u64 = iowr::<super::GetCounters>(0x04);
    pub const SET_HOSTNAME: u64 = iow::<super::SetHostname>(0x05);
    pub const PEER_ADD: u64 = iow::<super::PeerAdd>(0x06);
    pub const PEER_FROM_INDEX: u64 = iowr::<super::PeerEntry>(0x07);
    pub const PEER_FROM_ADDR: u64 = iowr::<super::PeerEntry>(0x08);
    pub const PEER_FROM_HOSTNAME: u64 = iowr::<super::PeerEntry>(0x09);
    pub const PEER_TABLE_CLEAR: u64 = ioc(0, 0x0a, 0);
    pub const PEER_TABLE_GET_STATE: u64 = iowr::<super::PeerTableState>(0x0b);
    pub const PEER_TABLE_SET_STATE: u64 = iow::<super::PeerTableState>(0x0c);

    pub const OPEN_ENDPOINT: u64 = iow::<super::OpenEndpoint>(0x80);
    pub const CLOSE_ENDPOINT: u64 = ioc(0, 0x81, 0);
    pub const SEND_TINY: u64 = iow::<super::SendTiny>(0x82);
    pub const SEND_SMALL: u64 = iow::<super::SendSmall>(0x83);
    pub const SEND_MEDIUMSQ_FRAG: u64 = iow::<super::SendMediumSqFrag>(0x84);
    pub const SEND_MEDIUMVA: u64 = iow::<super::SendMediumVa>(0x85);
    pub const SEND_RNDV: u64 = iow::<super::SendRndv>(0x86);
    pub const SEND_NOTIFY: u64 = iow::<super::SendNotify>(0x87);
    pub const SEND_CONNECT_REQUEST: u64 = iow::<super::SendConnectRequest>(0x88);
    pub const SEND_CONNECT_REPLY: u64 = iow::<super::SendConnectReply>(0x89);
    pub const SEND_LIBACK: u64 = iow::<super::SendLiback>(0x8a);
    pub const PULL: u64 = iow::<super::Pull>(0x8b);
    pub const CREATE_USER_REGION: u64 = iow::<super::CreateUserRegion>(0x8c);
    pub const DESTROY_USER_REGION: u64 = iow::<super::DestroyUserRegion>(0x8d);
    pub const WAIT_EVENT: u64 = iowr::<super::WaitEvent>(0x8e);
    pub const WAKEUP: u64 = iow::<super::Wakeup>(0x8f);
}

/// One segment of a registered user buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RegionSegment {
    /// User virtual address of the segment start.
    pub vaddr: u64,
    /// Segment length in bytes.
    pub len: u32,
    /// Zero.
    pub pad: u32,
}

const_assert_eq!(std::mem::size_of::<RegionSegment>(), 16);

/// `OPEN_ENDPOINT` parameter.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct OpenEndpoint {
    /// Board to attach to.
    pub board_index: u32,
    /// Endpoint slot to claim on that board.
    pub endpoint_index: u32,
}

/// `GET_BOARD_INFO` parameter.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct GetBoardInfo {
    /// In: board to query.
    pub board_index: u32,
    /// Zero.
    pub pad: u32,
    /// Out: 48-bit board address in the low bytes.
    pub addr: u64,
    /// Out: interface MTU.
    pub mtu: u32,
    /// Out: NUMA node the board is attached to.
    pub numa_node: u32,
    /// Out: interface status bits.
    pub status: u32,
    /// Zero.
    pub pad2: u32,
    /// Out: NUL-terminated hostname of the board.
    pub hostname: [u8; 80],
    /// Out: NUL-terminated kernel interface name.
    pub ifacename: [u8; 16],
}

/// `GET_ENDPOINT_INFO` parameter.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct GetEndpointInfo {
    /// In: board to query.
    pub board_index: u32,
    /// In: endpoint slot to query.
    pub endpoint_index: u32,
    /// Out: non-zero when the slot is open.
    pub open: u32,
    /// Zero.
    pub pad: u32,
}

/// `GET_COUNTERS` parameter.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct GetCounters {
    /// In: board to query. Out first word: number of valid counters.
    pub board_index: u32,
    /// In: non-zero to clear after reading.
    pub clear: u32,
    /// Out: counter values.
    pub counters: [u64; 64],
}

/// `SET_HOSTNAME` parameter.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct SetHostname {
    /// Board whose hostname changes.
    pub board_index: u32,
    /// Zero.
    pub pad: u32,
    /// New NUL-terminated hostname.
    pub hostname: [u8; 80],
}

/// `PEER_ADD` parameter.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct PeerAdd {
    /// Board address of the peer.
    pub board_addr: u64,
    /// NUL-terminated peer hostname.
    pub hostname: [u8; 80],
}

/// `PEER_FROM_*` parameter.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct PeerEntry {
    /// Peer board address (in or out depending on the query).
    pub board_addr: u64,
    /// Peer index (in or out depending on the query).
    pub index: u16,
    /// Zero.
    pub pad: [u8; 6],
    /// Peer hostname (in or out depending on the query).
    pub hostname: [u8; 80],
}

/// `PEER_TABLE_{GET,SET}_STATE` parameter.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct PeerTableState {
    /// Whether the mapper finished configuring the table.
    pub configured: u32,
    /// Table version.
    pub version: u32,
    /// Number of entries.
    pub size: u32,
    /// Zero.
    pub pad: u32,
    /// Id of the mapper that built the table.
    pub mapper_id: u64,
}

/// `SEND_TINY` parameter; the payload rides inline.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SendTiny {
    /// Peer table index of the destination board.
    pub peer_index: u16,
    /// Destination endpoint index.
    pub dest_endpoint: u8,
    /// Non-zero to use the shared (intra-host) fast path.
    pub shared: u8,
    /// Payload length, at most [`TINY_MAX`].
    pub length: u16,
    /// Library sequence number.
    pub seqnum: u16,
    /// Piggybacked cumulative ack.
    pub piggyack: u16,
    /// Zero.
    pub pad: [u8; 2],
    /// Destination session id.
    pub session_id: u32,
    /// Match information.
    pub match_info: u64,
    /// Inline payload.
    pub data: [u8; TINY_MAX],
}

const_assert_eq!(std::mem::size_of::<SendTiny>(), 56);

/// `SEND_SMALL` parameter; the driver copies the payload at post time.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SendSmall {
    /// Peer table index of the destination board.
    pub peer_index: u16,
    /// Destination endpoint index.
    pub dest_endpoint: u8,
    /// Non-zero to use the shared fast path.
    pub shared: u8,
    /// Payload length, at most [`SMALL_MAX`].
    pub length: u16,
    /// Library sequence number.
    pub seqnum: u16,
    /// Piggybacked cumulative ack.
    pub piggyack: u16,
    /// Zero.
    pub pad: [u8; 2],
    /// Destination session id.
    pub session_id: u32,
    /// Match information.
    pub match_info: u64,
    /// User virtual address of the payload.
    pub vaddr: u64,
}

const_assert_eq!(std::mem::size_of::<SendSmall>(), 32);

/// `SEND_MEDIUMSQ_FRAG` parameter; the payload was staged in the mapped
/// send queue beforehand.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SendMediumSqFrag {
    /// Peer table index of the destination board.
    pub peer_index: u16,
    /// Destination endpoint index.
    pub dest_endpoint: u8,
    /// Non-zero to use the shared fast path.
    pub shared: u8,
    /// Total message length.
    pub msg_length: u32,
    /// Payload bytes in this fragment.
    pub frag_length: u16,
    /// Fragment index within the message.
    pub frag_seqnum: u8,
    /// log2 of the fragment stride.
    pub frag_pipeline: u8,
    /// Library sequence number of the whole message.
    pub seqnum: u16,
    /// Piggybacked cumulative ack.
    pub piggyack: u16,
    /// Byte offset of the staged payload in the send queue.
    pub sendq_offset: u32,
    /// Destination session id.
    pub session_id: u32,
    /// Match information.
    pub match_info: u64,
}

const_assert_eq!(std::mem::size_of::<SendMediumSqFrag>(), 32);

/// `SEND_MEDIUMVA` parameter; the driver gathers fragments straight from
/// the user segments, no staging copy.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SendMediumVa {
    /// Peer table index of the destination board.
    pub peer_index: u16,
    /// Destination endpoint index.
    pub dest_endpoint: u8,
    /// Non-zero to use the shared fast path.
    pub shared: u8,
    /// Total message length.
    pub length: u32,
    /// Library sequence number.
    pub seqnum: u16,
    /// Piggybacked cumulative ack.
    pub piggyack: u16,
    /// Number of entries behind `segments`.
    pub nr_segments: u32,
    /// Destination session id.
    pub session_id: u32,
    /// Zero.
    pub pad: u32,
    /// User virtual address of a [`RegionSegment`] array.
    pub segments: u64,
    /// Match information.
    pub match_info: u64,
}

const_assert_eq!(std::mem::size_of::<SendMediumVa>(), 40);

/// `SEND_RNDV` parameter.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SendRndv {
    /// Peer table index of the destination board.
    pub peer_index: u16,
    /// Destination endpoint index.
    pub dest_endpoint: u8,
    /// Non-zero to use the shared fast path.
    pub shared: u8,
    /// Total message length.
    pub msg_length: u32,
    /// Library sequence number.
    pub seqnum: u16,
    /// Piggybacked cumulative ack.
    pub piggyack: u16,
    /// Region the receiver should pull from.
    pub pulled_rdma_id: u8,
    /// Reuse counter of that region slot.
    pub pulled_rdma_seqnum: u8,
    /// Zero.
    pub pad: [u8; 2],
    /// Destination session id.
    pub session_id: u32,
    /// Match information.
    pub match_info: u64,
}

const_assert_eq!(std::mem::size_of::<SendRndv>(), 32);

/// `SEND_NOTIFY` parameter.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SendNotify {
    /// Peer table index of the destination board.
    pub peer_index: u16,
    /// Destination endpoint index.
    pub dest_endpoint: u8,
    /// Non-zero to use the shared fast path.
    pub shared: u8,
    /// Bytes actually transferred by the pull.
    pub total_length: u32,
    /// Library sequence number.
    pub seqnum: u16,
    /// Piggybacked cumulative ack.
    pub piggyack: u16,
    /// Region that was pulled, echoing the rendezvous.
    pub pulled_rdma_id: u8,
    /// Reuse counter of that region slot.
    pub pulled_rdma_seqnum: u8,
    /// Zero.
    pub pad: [u8; 2],
    /// Destination session id (the back session).
    pub session_id: u32,
}

const_assert_eq!(std::mem::size_of::<SendNotify>(), 20);

/// `SEND_CONNECT_REQUEST` parameter.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SendConnectRequest {
    /// Peer table index of the destination board.
    pub peer_index: u16,
    /// Destination endpoint index.
    pub dest_endpoint: u8,
    /// Non-zero to use the shared fast path.
    pub shared: u8,
    /// Application key expected on the target.
    pub app_key: u32,
    /// Our session id.
    pub src_session_id: u32,
    /// Seqnum the target must start sending at.
    pub target_recv_seqnum_start: u16,
    /// Handshake id.
    pub connect_seqnum: u8,
    /// Zero.
    pub pad: u8,
}

const_assert_eq!(std::mem::size_of::<SendConnectRequest>(), 16);

/// `SEND_CONNECT_REPLY` parameter.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SendConnectReply {
    /// Peer table index of the destination board.
    pub peer_index: u16,
    /// Destination endpoint index.
    pub dest_endpoint: u8,
    /// Non-zero to use the shared fast path.
    pub shared: u8,
    /// Echo of the request's source session id.
    pub src_session_id: u32,
    /// Our session id.
    pub target_session_id: u32,
    /// Seqnum the originator must start sending at.
    pub target_recv_seqnum_start: u16,
    /// Echo of the request's handshake id.
    pub connect_seqnum: u8,
    /// 0 for success, 1 for bad key.
    pub status: u8,
}

const_assert_eq!(std::mem::size_of::<SendConnectReply>(), 16);

/// `SEND_LIBACK` parameter.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SendLiback {
    /// Peer table index of the destination board.
    pub peer_index: u16,
    /// Destination endpoint index.
    pub dest_endpoint: u8,
    /// Non-zero to use the shared fast path.
    pub shared: u8,
    /// Destination session id (the back session).
    pub session_id: u32,
    /// Monotonic ack id.
    pub acknum: u64,
    /// Every seqnum strictly below this one is acknowledged.
    pub lib_seqnum_up_to: u16,
    /// Zero.
    pub pad: [u8; 6],
}

const_assert_eq!(std::mem::size_of::<SendLiback>(), 24);

/// `PULL` parameter.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Pull {
    /// Peer table index of the pulled board.
    pub peer_index: u16,
    /// Pulled endpoint index.
    pub dest_endpoint: u8,
    /// Non-zero to use the shared fast path.
    pub shared: u8,
    /// Bytes to transfer.
    pub length: u32,
    /// Pulled session id (the back session).
    pub session_id: u32,
    /// Local region to write into.
    pub puller_rdma_id: u8,
    /// Remote region to read from.
    pub pulled_rdma_id: u8,
    /// Reuse counter of the remote region slot.
    pub pulled_rdma_seqnum: u8,
    /// Zero.
    pub pad: u8,
    /// Byte offset into the remote region.
    pub pulled_rdma_offset: u32,
    /// Driver-level per-block retransmit timeout.
    pub resend_timeout_jiffies: u32,
    /// Opaque cookie copied into the completion event.
    pub lib_cookie: u64,
}

const_assert_eq!(std::mem::size_of::<Pull>(), 32);

/// `CREATE_USER_REGION` parameter.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct CreateUserRegion {
    /// Region slot to fill, chosen by the library in `0..USER_REGION_MAX`.
    pub id: u8,
    /// Zero.
    pub pad: [u8; 3],
    /// Number of entries behind `segments`.
    pub nr_segments: u32,
    /// User virtual address of a [`RegionSegment`] array.
    pub segments: u64,
}

const_assert_eq!(std::mem::size_of::<CreateUserRegion>(), 16);

/// `DESTROY_USER_REGION` parameter.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DestroyUserRegion {
    /// Region slot to release.
    pub id: u8,
    /// Zero.
    pub pad: [u8; 3],
}

const_assert_eq!(std::mem::size_of::<DestroyUserRegion>(), 4);

/// `WAIT_EVENT` parameter: block until an event lands, the timeout
/// passes, or a wakeup is posted.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct WaitEvent {
    /// In: absolute jiffies to give up at, or
    /// [`WAIT_EVENT_TIMEOUT_INFINITE`].
    pub timeout_jiffies: u64,
    /// In: index of the next expected-ring slot the library will read.
    pub next_exp_event_index: u32,
    /// In: index of the next unexpected-ring slot the library will read.
    pub next_unexp_event_index: u32,
    /// In: the library-side user event counter observed before sleeping.
    pub user_event_index: u32,
    /// Out: one of the `WAIT_EVENT_STATUS_*` values.
    pub status: u32,
}

const_assert_eq!(std::mem::size_of::<WaitEvent>(), 24);

/// [`WaitEvent`] status: an event arrived.
pub const WAIT_EVENT_STATUS_PROGRESS: u32 = 0;
/// [`WaitEvent`] status: the timeout elapsed first.
pub const WAIT_EVENT_STATUS_TIMEOUT: u32 = 1;
/// [`WaitEvent`] status: a signal interrupted the sleep.
pub const WAIT_EVENT_STATUS_INTR: u32 = 2;
/// [`WaitEvent`] status: another thread posted a wakeup.
pub const WAIT_EVENT_STATUS_WAKEUP: u32 = 3;
/// [`WaitEvent`] status: a race was detected before sleeping.
pub const WAIT_EVENT_STATUS_RACE: u32 = 4;

/// `WAKEUP` parameter.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Wakeup {
    /// Status handed to every sleeper, usually
    /// [`WAIT_EVENT_STATUS_WAKEUP`].
    pub status: u32,
    /// Zero.
    pub pad: u32,
}

/// The read-only endpoint descriptor page shared with the driver.
#[derive(Debug)]
#[repr(C)]
pub struct EndpointDesc {
    /// Session id of this endpoint incarnation.
    pub session_id: u32,
    /// Incremented by the library when it completes work without a driver
    /// event, so sleepers in `WAIT_EVENT` notice progress.
    pub user_event_count: u32,
    /// Status bits (`DESC_STATUS_*`), cleared by the library after read.
    pub status: u32,
    /// Zero.
    pub pad: u32,
    /// Next jiffies at which the library wants to be woken even without
    /// an event, or [`NO_WAKEUP_JIFFIES`].
    pub wakeup_jiffies: u64,
}

/// The read-only driver descriptor page shared with all processes.
#[derive(Debug)]
#[repr(C)]
pub struct DriverDesc {
    /// ABI version of the driver.
    pub abi_version: u32,
    /// Number of boards.
    pub board_max: u32,
    /// Most endpoints per board.
    pub endpoint_max: u32,
    /// Most peers in the table.
    pub peer_max: u32,
    /// Monotonic driver tick counter.
    pub jiffies: u64,
    /// Ticks per second.
    pub hz: u32,
    /// Zero.
    pub pad: u32,
}

/// ABI version this library speaks; checked against
/// [`DriverDesc::abi_version`] at init.
pub const ABI_VERSION: u32 = 0x0001_0200;

/// Event type byte values, stored in the last byte of each slot.
#[allow(missing_docs)]
pub mod evt {
    pub const NONE: u8 = 0x00;
    pub const RECV_CONNECT_REQUEST: u8 = 0x01;
    pub const RECV_CONNECT_REPLY: u8 = 0x02;
    pub const RECV_TINY: u8 = 0x03;
    pub const RECV_SMALL: u8 = 0x04;
    pub const RECV_MEDIUM_FRAG: u8 = 0x05;
    pub const RECV_RNDV: u8 = 0x06;
    pub const RECV_NOTIFY: u8 = 0x07;
    pub const RECV_LIBACK: u8 = 0x08;
    pub const RECV_NACK_LIB: u8 = 0x09;
    pub const SEND_MEDIUMSQ_FRAG_DONE: u8 = 0x0a;
    pub const PULL_DONE: u8 = 0x0b;
    pub const IGNORE: u8 = 0xff;
}

/// [`PullDone`](crate::Event::PullDone) status values.
#[allow(missing_docs)]
pub mod pull_status {
    pub const SUCCESS: u8 = 0;
    pub const BAD_ENDPT: u8 = 1;
    pub const ENDPT_CLOSED: u8 = 2;
    pub const BAD_SESSION: u8 = 3;
    pub const BAD_RDMAWIN: u8 = 4;
    pub const ABORTED: u8 = 5;
    pub const TIMEOUT: u8 = 6;
}
