//! Definitions of everything that crosses the wire, top to bottom: the
//! packet type byte, the common header present on every frame after the
//! Ethernet header, and the type-specific trailers.
//!
//! All multi-byte fields are little-endian on the wire, with one
//! exception: the 64-bit match information is split into its high and low
//! 32-bit halves and stored high-then-low as big-endian words, so that a
//! 32-bit peer can compare halves without assembling the full value.

use bytes::{Buf, BufMut};

use crate::seq::Seq;

/// Discriminant byte of a packet, first field of [`PacketHeader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Payload of up to 32 bytes carried inline in the sender's command.
    Tiny = 1,
    /// Payload of up to 128 bytes, buffered by the sender for resends.
    Small = 2,
    /// One fragment of a multi-fragment medium message.
    MediumFrag = 3,
    /// Rendezvous advertisement of a large message.
    Rndv = 4,
    /// Large-message completion notification from puller to pulled side.
    Notify = 5,
    /// Driver-level request to read from a remote registered region.
    PullRequest = 6,
    /// Driver-level chunk of pulled data.
    PullReply = 7,
    /// Connection handshake request.
    ConnectRequest = 8,
    /// Connection handshake reply.
    ConnectReply = 9,
    /// Explicit library-level cumulative acknowledgement.
    Liback = 10,
    /// Negative acknowledgement generated by the remote driver.
    NackLib = 11,
    /// Generic control payload carrier, reserved.
    Truc = 12,
}

impl TryFrom<u8> for PacketType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Tiny,
            2 => Self::Small,
            3 => Self::MediumFrag,
            4 => Self::Rndv,
            5 => Self::Notify,
            6 => Self::PullRequest,
            7 => Self::PullReply,
            8 => Self::ConnectRequest,
            9 => Self::ConnectReply,
            10 => Self::Liback,
            11 => Self::NackLib,
            12 => Self::Truc,
            other => return Err(DecodeError::BadPacketType(other)),
        })
    }
}

/// Error decoding a packet from raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The type byte matched no known packet kind.
    #[error("unknown packet type {0:#x}")]
    BadPacketType(u8),
    /// The buffer ended before the structure did.
    #[error("packet truncated")]
    TooShort,
}

fn ensure(buf: &impl Buf, len: usize) -> Result<(), DecodeError> {
    if buf.remaining() < len {
        Err(DecodeError::TooShort)
    } else {
        Ok(())
    }
}

/// Common header of every omx frame, directly after the Ethernet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// What follows this header.
    pub ptype: PacketType,
    /// Endpoint index on the destination board.
    pub dest_endpoint: u8,
    /// Endpoint index on the source board.
    pub src_endpoint: u8,
    /// Generation of the source endpoint slot, to reject stale frames.
    pub src_generation: u8,
    /// Payload length in bytes (whole message for single-fragment kinds).
    pub length: u16,
    /// Library-level sequence number of the carried message.
    pub lib_seqnum: Seq,
    /// Piggybacked cumulative ack: every seqnum below this is received.
    pub piggyack: Seq,
    /// 64-bit match information attached by the sender.
    pub match_info: u64,
    /// Session id of the destination endpoint incarnation.
    pub session_id: u32,
}

impl PacketHeader {
    /// Encoded size of the header in bytes.
    pub const ENCODE_LEN: usize = 24;

    /// Writes the header to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.ptype as u8);
        buf.put_u8(self.dest_endpoint);
        buf.put_u8(self.src_endpoint);
        buf.put_u8(self.src_generation);
        buf.put_u16_le(self.length);
        buf.put_u16_le(0); // pad
        buf.put_u16_le(self.lib_seqnum.0);
        buf.put_u16_le(self.piggyack.0);
        buf.put_u32((self.match_info >> 32) as u32);
        buf.put_u32(self.match_info as u32);
        buf.put_u32_le(self.session_id);
    }

    /// Reads a header from `buf`.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure(buf, Self::ENCODE_LEN)?;
        let ptype = PacketType::try_from(buf.get_u8())?;
        let dest_endpoint = buf.get_u8();
        let src_endpoint = buf.get_u8();
        let src_generation = buf.get_u8();
        let length = buf.get_u16_le();
        let _pad = buf.get_u16_le();
        let lib_seqnum = Seq(buf.get_u16_le());
        let piggyack = Seq(buf.get_u16_le());
        let match_hi = buf.get_u32();
        let match_lo = buf.get_u32();
        let session_id = buf.get_u32_le();
        Ok(Self {
            ptype,
            dest_endpoint,
            src_endpoint,
            src_generation,
            length,
            lib_seqnum,
            piggyack,
            match_info: (u64::from(match_hi) << 32) | u64::from(match_lo),
            session_id,
        })
    }
}

/// Trailer of a [`PacketType::MediumFrag`] frame, followed by the
/// fragment payload.
///
/// The total message length rides here rather than in the header's
/// 16-bit `length` field (which carries the fragment payload length for
/// mediums) because a medium message may span more than 64 KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediumFragTrailer {
    /// Total message length.
    pub msg_length: u32,
    /// Bytes of payload in this fragment.
    pub frag_length: u16,
    /// Index of this fragment within the message.
    pub frag_seqnum: u8,
    /// Log2 of the fragment stride; the payload of fragment `n` starts at
    /// byte offset `n << frag_pipeline` of the message.
    pub frag_pipeline: u8,
}

impl MediumFragTrailer {
    /// Encoded size in bytes.
    pub const ENCODE_LEN: usize = 8;

    /// Writes the trailer to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.msg_length);
        buf.put_u16_le(self.frag_length);
        buf.put_u8(self.frag_seqnum);
        buf.put_u8(self.frag_pipeline);
    }

    /// Reads the trailer from `buf`.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure(buf, Self::ENCODE_LEN)?;
        Ok(Self {
            msg_length: buf.get_u32_le(),
            frag_length: buf.get_u16_le(),
            frag_seqnum: buf.get_u8(),
            frag_pipeline: buf.get_u8(),
        })
    }
}

/// Trailer of a [`PacketType::Rndv`] frame: the sender advertises the
/// region the receiver should pull from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RndvTrailer {
    /// Total message length.
    pub msg_length: u32,
    /// Registered region id on the sending endpoint.
    pub rdma_id: u8,
    /// Reuse counter of that region slot.
    pub rdma_seqnum: u8,
    /// Byte offset of the message inside the region.
    pub rdma_offset: u16,
}

impl RndvTrailer {
    /// Encoded size in bytes.
    pub const ENCODE_LEN: usize = 8;

    /// Writes the trailer to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.msg_length);
        buf.put_u8(self.rdma_id);
        buf.put_u8(self.rdma_seqnum);
        buf.put_u16_le(self.rdma_offset);
    }

    /// Reads the trailer from `buf`.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure(buf, Self::ENCODE_LEN)?;
        Ok(Self {
            msg_length: buf.get_u32_le(),
            rdma_id: buf.get_u8(),
            rdma_seqnum: buf.get_u8(),
            rdma_offset: buf.get_u16_le(),
        })
    }
}

/// Trailer of a [`PacketType::Notify`] frame: the puller reports how much
/// it transferred so the pulled side can release its region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyTrailer {
    /// Bytes actually transferred (may be short of the advertised length
    /// when the receive buffer truncated the message).
    pub total_length: u32,
    /// Region id that was pulled, echoing the rendezvous.
    pub pulled_rdma_id: u8,
    /// Reuse counter of that region slot, echoing the rendezvous.
    pub pulled_rdma_seqnum: u8,
}

impl NotifyTrailer {
    /// Encoded size in bytes.
    pub const ENCODE_LEN: usize = 6;

    /// Writes the trailer to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.total_length);
        buf.put_u8(self.pulled_rdma_id);
        buf.put_u8(self.pulled_rdma_seqnum);
    }

    /// Reads the trailer from `buf`.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure(buf, Self::ENCODE_LEN)?;
        Ok(Self {
            total_length: buf.get_u32_le(),
            pulled_rdma_id: buf.get_u8(),
            pulled_rdma_seqnum: buf.get_u8(),
        })
    }
}

/// Trailer of a [`PacketType::PullRequest`] frame, generated by the
/// driver on behalf of a pulling endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullRequestTrailer {
    /// Bytes to transfer.
    pub length: u32,
    /// Region id on the pulling (requesting) side.
    pub puller_rdma_id: u8,
    /// Region id on the pulled (serving) side.
    pub pulled_rdma_id: u8,
    /// Reuse counter of the pulled region slot.
    pub pulled_rdma_seqnum: u8,
    /// Byte offset into the pulling region.
    pub puller_offset: u32,
    /// Byte offset into the pulled region.
    pub pulled_offset: u32,
    /// Opaque handle echoed in every reply so the requesting driver can
    /// route chunks back to the right pull.
    pub src_pull_handle: u64,
}

impl PullRequestTrailer {
    /// Encoded size in bytes.
    pub const ENCODE_LEN: usize = 24;

    /// Writes the trailer to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.length);
        buf.put_u8(self.puller_rdma_id);
        buf.put_u8(self.pulled_rdma_id);
        buf.put_u8(self.pulled_rdma_seqnum);
        buf.put_u8(0); // pad
        buf.put_u32_le(self.puller_offset);
        buf.put_u32_le(self.pulled_offset);
        buf.put_u64_le(self.src_pull_handle);
    }

    /// Reads the trailer from `buf`.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure(buf, Self::ENCODE_LEN)?;
        let length = buf.get_u32_le();
        let puller_rdma_id = buf.get_u8();
        let pulled_rdma_id = buf.get_u8();
        let pulled_rdma_seqnum = buf.get_u8();
        let _pad = buf.get_u8();
        Ok(Self {
            length,
            puller_rdma_id,
            pulled_rdma_id,
            pulled_rdma_seqnum,
            puller_offset: buf.get_u32_le(),
            pulled_offset: buf.get_u32_le(),
            src_pull_handle: buf.get_u64_le(),
        })
    }
}

/// Trailer of a [`PacketType::PullReply`] frame, followed by the chunk
/// payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullReplyTrailer {
    /// Handle from the matching [`PullRequestTrailer`].
    pub pull_handle: u64,
    /// Index of this chunk within the pull.
    pub frame_seqnum: u32,
    /// Byte offset of this chunk into the pulling region.
    pub offset: u32,
}

impl PullReplyTrailer {
    /// Encoded size in bytes.
    pub const ENCODE_LEN: usize = 16;

    /// Writes the trailer to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.pull_handle);
        buf.put_u32_le(self.frame_seqnum);
        buf.put_u32_le(self.offset);
    }

    /// Reads the trailer from `buf`.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure(buf, Self::ENCODE_LEN)?;
        Ok(Self {
            pull_handle: buf.get_u64_le(),
            frame_seqnum: buf.get_u32_le(),
            offset: buf.get_u32_le(),
        })
    }
}

/// Trailer of a [`PacketType::ConnectRequest`] frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequestTrailer {
    /// Application key the connecting side believes the target uses.
    pub app_key: u32,
    /// Session id of the connecting endpoint.
    pub src_session_id: u32,
    /// Seqnum the target should start sending at towards us.
    pub target_recv_seqnum_start: Seq,
    /// Handshake id, echoed in the reply.
    pub connect_seqnum: u8,
}

impl ConnectRequestTrailer {
    /// Encoded size in bytes.
    pub const ENCODE_LEN: usize = 12;

    /// Writes the trailer to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.app_key);
        buf.put_u32_le(self.src_session_id);
        buf.put_u16_le(self.target_recv_seqnum_start.0);
        buf.put_u8(self.connect_seqnum);
        buf.put_u8(0); // pad
    }

    /// Reads the trailer from `buf`.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure(buf, Self::ENCODE_LEN)?;
        let app_key = buf.get_u32_le();
        let src_session_id = buf.get_u32_le();
        let target_recv_seqnum_start = Seq(buf.get_u16_le());
        let connect_seqnum = buf.get_u8();
        let _pad = buf.get_u8();
        Ok(Self {
            app_key,
            src_session_id,
            target_recv_seqnum_start,
            connect_seqnum,
        })
    }
}

/// Outcome carried in a [`ConnectReplyTrailer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectStatus {
    /// The target accepted the connection.
    Success = 0,
    /// The application key did not match the target's key.
    BadKey = 1,
}

/// Trailer of a [`PacketType::ConnectReply`] frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectReplyTrailer {
    /// Echo of the request's `src_session_id`, so the originator can tell
    /// whether the reply targets its current incarnation.
    pub src_session_id: u32,
    /// Session id of the replying endpoint.
    pub target_session_id: u32,
    /// Seqnum the originator should start sending at towards the target.
    pub target_recv_seqnum_start: Seq,
    /// Echo of the request's handshake id.
    pub connect_seqnum: u8,
    /// Outcome of the handshake.
    pub status: ConnectStatus,
}

impl ConnectReplyTrailer {
    /// Encoded size in bytes.
    pub const ENCODE_LEN: usize = 12;

    /// Writes the trailer to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.src_session_id);
        buf.put_u32_le(self.target_session_id);
        buf.put_u16_le(self.target_recv_seqnum_start.0);
        buf.put_u8(self.connect_seqnum);
        buf.put_u8(self.status as u8);
    }

    /// Reads the trailer from `buf`.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure(buf, Self::ENCODE_LEN)?;
        let src_session_id = buf.get_u32_le();
        let target_session_id = buf.get_u32_le();
        let target_recv_seqnum_start = Seq(buf.get_u16_le());
        let connect_seqnum = buf.get_u8();
        let status = match buf.get_u8() {
            0 => ConnectStatus::Success,
            _ => ConnectStatus::BadKey,
        };
        Ok(Self {
            src_session_id,
            target_session_id,
            target_recv_seqnum_start,
            connect_seqnum,
            status,
        })
    }
}

/// Trailer of a [`PacketType::Liback`] frame: a cumulative explicit ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibackTrailer {
    /// Monotonic id of this ack (a counter of acks, not of messages);
    /// receivers drop libacks whose id is not above the last one seen.
    pub acknum: u64,
    /// Every seqnum strictly below this one is acknowledged.
    pub lib_seqnum_up_to: Seq,
    /// Session the ack belongs to.
    pub session_id: u32,
}

impl LibackTrailer {
    /// Encoded size in bytes.
    pub const ENCODE_LEN: usize = 16;

    /// Writes the trailer to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.acknum);
        buf.put_u16_le(self.lib_seqnum_up_to.0);
        buf.put_u16_le(0); // pad
        buf.put_u32_le(self.session_id);
    }

    /// Reads the trailer from `buf`.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure(buf, Self::ENCODE_LEN)?;
        let acknum = buf.get_u64_le();
        let lib_seqnum_up_to = Seq(buf.get_u16_le());
        let _pad = buf.get_u16_le();
        let session_id = buf.get_u32_le();
        Ok(Self {
            acknum,
            lib_seqnum_up_to,
            session_id,
        })
    }
}

/// Reason code carried in a [`PacketType::NackLib`] frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NackKind {
    /// The destination endpoint index is not open on that board.
    BadEndpoint = 1,
    /// The destination endpoint was open but has closed.
    EndpointClosed = 2,
    /// The session id did not match the destination's incarnation.
    BadSession = 3,
}

impl TryFrom<u8> for NackKind {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::BadEndpoint,
            2 => Self::EndpointClosed,
            3 => Self::BadSession,
            other => return Err(DecodeError::BadPacketType(other)),
        })
    }
}

/// Trailer of a [`PacketType::NackLib`] frame; the nacked seqnum rides in
/// the header's `lib_seqnum`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackLibTrailer {
    /// Why the packet was refused.
    pub kind: NackKind,
}

impl NackLibTrailer {
    /// Encoded size in bytes.
    pub const ENCODE_LEN: usize = 1;

    /// Writes the trailer to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind as u8);
    }

    /// Reads the trailer from `buf`.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure(buf, Self::ENCODE_LEN)?;
        Ok(Self {
            kind: NackKind::try_from(buf.get_u8())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use bytes::{Bytes, BytesMut};

    use super::*;

    #[test]
    fn encode_decode_header() {
        let v = PacketHeader {
            ptype: PacketType::Tiny,
            dest_endpoint: 3,
            src_endpoint: 7,
            src_generation: 1,
            length: 5,
            lib_seqnum: Seq(1234),
            piggyack: Seq(42),
            match_info: 0x1234_5678_8765_4321,
            session_id: 0xdead_beef,
        };
        let mut buf = BytesMut::with_capacity(PacketHeader::ENCODE_LEN);
        v.encode(&mut buf);
        assert_eq!(PacketHeader::ENCODE_LEN, buf.len());
        assert_eq!(v, PacketHeader::decode(&mut buf.freeze()).unwrap());
    }

    #[test]
    fn match_info_halves_are_big_endian_high_first() {
        let v = PacketHeader {
            ptype: PacketType::Small,
            dest_endpoint: 0,
            src_endpoint: 0,
            src_generation: 0,
            length: 0,
            lib_seqnum: Seq(0),
            piggyack: Seq(0),
            match_info: 0x0102_0304_0506_0708,
            session_id: 0,
        };
        let mut buf = BytesMut::new();
        v.encode(&mut buf);
        assert_eq!(&buf[12..20], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn decode_short_buffer() {
        let mut buf = Bytes::from_static(&[1, 2, 3]);
        assert_matches!(PacketHeader::decode(&mut buf), Err(DecodeError::TooShort));
    }

    #[test]
    fn decode_unknown_type() {
        let mut raw = BytesMut::new();
        PacketHeader {
            ptype: PacketType::Tiny,
            dest_endpoint: 0,
            src_endpoint: 0,
            src_generation: 0,
            length: 0,
            lib_seqnum: Seq(0),
            piggyack: Seq(0),
            match_info: 0,
            session_id: 0,
        }
        .encode(&mut raw);
        raw[0] = 0xff;
        assert_matches!(
            PacketHeader::decode(&mut raw.freeze()),
            Err(DecodeError::BadPacketType(0xff))
        );
    }

    #[test]
    fn encode_decode_trailers() {
        let mut buf = BytesMut::new();

        let frag = MediumFragTrailer {
            msg_length: 100_000,
            frag_length: 4096,
            frag_seqnum: 2,
            frag_pipeline: 12,
        };
        frag.encode(&mut buf);
        assert_eq!(MediumFragTrailer::ENCODE_LEN, buf.len());
        assert_eq!(frag, MediumFragTrailer::decode(&mut buf.split().freeze()).unwrap());

        let rndv = RndvTrailer {
            msg_length: 1 << 20,
            rdma_id: 9,
            rdma_seqnum: 23,
            rdma_offset: 64,
        };
        rndv.encode(&mut buf);
        assert_eq!(RndvTrailer::ENCODE_LEN, buf.len());
        assert_eq!(rndv, RndvTrailer::decode(&mut buf.split().freeze()).unwrap());

        let pull = PullRequestTrailer {
            length: 12345,
            puller_rdma_id: 1,
            pulled_rdma_id: 2,
            pulled_rdma_seqnum: 3,
            puller_offset: 0,
            pulled_offset: 128,
            src_pull_handle: (7 << 32) | 5,
        };
        pull.encode(&mut buf);
        assert_eq!(PullRequestTrailer::ENCODE_LEN, buf.len());
        assert_eq!(pull, PullRequestTrailer::decode(&mut buf.split().freeze()).unwrap());

        let liback = LibackTrailer {
            acknum: u64::from(u32::MAX) + 17,
            lib_seqnum_up_to: Seq(100),
            session_id: 4,
        };
        liback.encode(&mut buf);
        assert_eq!(LibackTrailer::ENCODE_LEN, buf.len());
        assert_eq!(liback, LibackTrailer::decode(&mut buf.split().freeze()).unwrap());
    }

    #[test]
    fn encode_decode_connect() {
        let mut buf = BytesMut::new();

        let req = ConnectRequestTrailer {
            app_key: 0xaaaa,
            src_session_id: 77,
            target_recv_seqnum_start: Seq(1),
            connect_seqnum: 200,
        };
        req.encode(&mut buf);
        assert_eq!(ConnectRequestTrailer::ENCODE_LEN, buf.len());
        assert_eq!(req, ConnectRequestTrailer::decode(&mut buf.split().freeze()).unwrap());

        let reply = ConnectReplyTrailer {
            src_session_id: 77,
            target_session_id: 78,
            target_recv_seqnum_start: Seq(1),
            connect_seqnum: 200,
            status: ConnectStatus::BadKey,
        };
        reply.encode(&mut buf);
        assert_eq!(ConnectReplyTrailer::ENCODE_LEN, buf.len());
        assert_eq!(reply, ConnectReplyTrailer::decode(&mut buf.split().freeze()).unwrap());
    }
}
