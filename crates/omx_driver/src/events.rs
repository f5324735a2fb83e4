//! Typed view of the records the driver deposits in the two event rings.
//!
//! Each ring slot is [`EVENT_SLOT_SIZE`] bytes; the driver writes the
//! type byte at the very end of the slot after all other fields, so a
//! non-[`evt::NONE`] type byte guarantees the rest of the slot is
//! consistent. [`Event::parse`] decodes a raw slot; the simulated fabric
//! builds [`Event`] values directly.

use omx_wire::{ConnectStatus, NackKind, Seq};

use crate::abi::{evt, EVENT_SLOT_SIZE, TINY_MAX};

/// Source and ordering information shared by all message events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgInfo {
    /// Peer table index of the sending board.
    pub peer_index: u16,
    /// Sending endpoint index.
    pub src_endpoint: u8,
    /// Library sequence number of the message.
    pub seqnum: Seq,
    /// Piggybacked cumulative ack from the sender.
    pub piggyack: Seq,
    /// Match information attached by the sender.
    pub match_info: u64,
}

/// One record from an event ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A peer initiated the connection handshake.
    ConnectRequest {
        /// Peer table index of the sending board.
        peer_index: u16,
        /// Sending endpoint index.
        src_endpoint: u8,
        /// Whether the driver can reach this peer through the intra-host
        /// fast path.
        shared: bool,
        /// Session id of the requesting endpoint.
        src_session_id: u32,
        /// Application key the requester presented.
        app_key: u32,
        /// Seqnum we must start sending at towards the requester.
        target_recv_seqnum_start: Seq,
        /// Handshake id to echo in the reply.
        connect_seqnum: u8,
    },
    /// A peer answered our connection handshake.
    ConnectReply {
        /// Peer table index of the sending board.
        peer_index: u16,
        /// Sending endpoint index.
        src_endpoint: u8,
        /// Whether the driver can reach this peer through the intra-host
        /// fast path.
        shared: bool,
        /// Echo of the session id we sent in the request.
        src_session_id: u32,
        /// Session id of the replying endpoint.
        target_session_id: u32,
        /// Seqnum we must start sending at towards the replier.
        target_recv_seqnum_start: Seq,
        /// Echo of our handshake id.
        connect_seqnum: u8,
        /// Outcome of the handshake.
        status: ConnectStatus,
    },
    /// Tiny message, payload inline in the event.
    Tiny {
        /// Common message fields.
        msg: MsgInfo,
        /// Payload length.
        length: u16,
        /// Inline payload, valid up to `length`.
        data: [u8; TINY_MAX],
    },
    /// Small message, payload in the mapped recv queue.
    Small {
        /// Common message fields.
        msg: MsgInfo,
        /// Payload length.
        length: u16,
        /// Byte offset of the payload in the recv queue.
        recvq_offset: u32,
    },
    /// One fragment of a medium message, payload in the recv queue.
    MediumFrag {
        /// Common message fields.
        msg: MsgInfo,
        /// Total message length.
        msg_length: u32,
        /// Payload bytes in this fragment.
        frag_length: u16,
        /// Fragment index within the message.
        frag_seqnum: u8,
        /// log2 of the fragment stride.
        frag_pipeline: u8,
        /// Byte offset of the payload in the recv queue.
        recvq_offset: u32,
    },
    /// Rendezvous advertisement of a large message.
    Rndv {
        /// Common message fields.
        msg: MsgInfo,
        /// Total message length.
        msg_length: u32,
        /// Region to pull from on the sending endpoint.
        rdma_id: u8,
        /// Reuse counter of that region slot.
        rdma_seqnum: u8,
        /// Byte offset of the message inside the region.
        rdma_offset: u16,
    },
    /// A peer finished pulling one of our regions.
    Notify {
        /// Common message fields.
        msg: MsgInfo,
        /// Bytes the peer actually transferred.
        length: u32,
        /// Our region that was pulled.
        pulled_rdma_id: u8,
        /// Reuse counter echoed from the rendezvous.
        pulled_rdma_seqnum: u8,
    },
    /// Explicit cumulative ack from a peer.
    Liback {
        /// Peer table index of the sending board.
        peer_index: u16,
        /// Sending endpoint index.
        src_endpoint: u8,
        /// Session the ack belongs to.
        session_id: u32,
        /// Monotonic ack id.
        acknum: u64,
        /// Every seqnum strictly below this one is acknowledged.
        lib_seqnum_up_to: Seq,
    },
    /// The remote driver refused one of our packets.
    NackLib {
        /// Peer table index of the refusing board.
        peer_index: u16,
        /// Refusing endpoint index.
        src_endpoint: u8,
        /// Seqnum of the refused packet.
        seqnum: Seq,
        /// Why it was refused.
        kind: NackKind,
    },
    /// The driver finished transmitting one staged medium fragment; its
    /// send-queue slot is reusable.
    MediumSqFragDone {
        /// Byte offset of the now-free send-queue slot.
        sendq_offset: u32,
    },
    /// A pull we initiated completed.
    PullDone {
        /// Cookie from the [`Pull`](crate::abi::Pull) command.
        lib_cookie: u64,
        /// Local region the data landed in.
        puller_rdma_id: u8,
        /// One of the [`pull_status`](crate::abi::pull_status) values.
        status: u8,
    },
}

fn u16_at(slot: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([slot[off], slot[off + 1]])
}

fn u32_at(slot: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([slot[off], slot[off + 1], slot[off + 2], slot[off + 3]])
}

fn u64_at(slot: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&slot[off..off + 8]);
    u64::from_le_bytes(b)
}

fn msg_at(slot: &[u8]) -> MsgInfo {
    MsgInfo {
        peer_index: u16_at(slot, 0),
        src_endpoint: slot[2],
        seqnum: Seq(u16_at(slot, 4)),
        piggyack: Seq(u16_at(slot, 6)),
        match_info: u64_at(slot, 8),
    }
}

impl Event {
    /// Decodes one raw ring slot.
    ///
    /// Returns `None` for an empty ([`evt::NONE`]) slot, an
    /// [`evt::IGNORE`] placeholder, or an unknown type byte.
    #[must_use]
    pub fn parse(slot: &[u8; EVENT_SLOT_SIZE]) -> Option<Self> {
        let ty = slot[EVENT_SLOT_SIZE - 1];
        match ty {
            evt::RECV_CONNECT_REQUEST => Some(Self::ConnectRequest {
                peer_index: u16_at(slot, 0),
                src_endpoint: slot[2],
                shared: slot[3] != 0,
                app_key: u32_at(slot, 4),
                src_session_id: u32_at(slot, 8),
                target_recv_seqnum_start: Seq(u16_at(slot, 12)),
                connect_seqnum: slot[14],
            }),
            evt::RECV_CONNECT_REPLY => Some(Self::ConnectReply {
                peer_index: u16_at(slot, 0),
                src_endpoint: slot[2],
                shared: slot[3] != 0,
                src_session_id: u32_at(slot, 4),
                target_session_id: u32_at(slot, 8),
                target_recv_seqnum_start: Seq(u16_at(slot, 12)),
                connect_seqnum: slot[14],
                status: if slot[15] == 0 {
                    ConnectStatus::Success
                } else {
                    ConnectStatus::BadKey
                },
            }),
            evt::RECV_TINY => {
                let mut data = [0u8; TINY_MAX];
                data.copy_from_slice(&slot[20..20 + TINY_MAX]);
                Some(Self::Tiny {
                    msg: msg_at(slot),
                    length: u16_at(slot, 16),
                    data,
                })
            }
            evt::RECV_SMALL => Some(Self::Small {
                msg: msg_at(slot),
                length: u16_at(slot, 16),
                recvq_offset: u32_at(slot, 20),
            }),
            evt::RECV_MEDIUM_FRAG => Some(Self::MediumFrag {
                msg: msg_at(slot),
                msg_length: u32_at(slot, 16),
                frag_length: u16_at(slot, 20),
                frag_seqnum: slot[22],
                frag_pipeline: slot[23],
                recvq_offset: u32_at(slot, 24),
            }),
            evt::RECV_RNDV => Some(Self::Rndv {
                msg: msg_at(slot),
                msg_length: u32_at(slot, 16),
                rdma_id: slot[20],
                rdma_seqnum: slot[21],
                rdma_offset: u16_at(slot, 22),
            }),
            evt::RECV_NOTIFY => Some(Self::Notify {
                msg: msg_at(slot),
                length: u32_at(slot, 16),
                pulled_rdma_id: slot[20],
                pulled_rdma_seqnum: slot[21],
            }),
            evt::RECV_LIBACK => Some(Self::Liback {
                peer_index: u16_at(slot, 0),
                src_endpoint: slot[2],
                session_id: u32_at(slot, 4),
                acknum: u64_at(slot, 8),
                lib_seqnum_up_to: Seq(u16_at(slot, 16)),
            }),
            evt::RECV_NACK_LIB => NackKind::try_from(slot[3]).ok().map(|kind| Self::NackLib {
                peer_index: u16_at(slot, 0),
                src_endpoint: slot[2],
                kind,
                seqnum: Seq(u16_at(slot, 4)),
            }),
            evt::SEND_MEDIUMSQ_FRAG_DONE => Some(Self::MediumSqFragDone {
                sendq_offset: u32_at(slot, 0),
            }),
            evt::PULL_DONE => Some(Self::PullDone {
                lib_cookie: u64_at(slot, 0),
                puller_rdma_id: slot[8],
                status: slot[9],
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_none_slot() {
        let slot = [0u8; EVENT_SLOT_SIZE];
        assert_matches!(Event::parse(&slot), None);
    }

    #[test]
    fn parse_tiny_slot() {
        let mut slot = [0u8; EVENT_SLOT_SIZE];
        slot[0..2].copy_from_slice(&7u16.to_le_bytes()); // peer_index
        slot[2] = 3; // src_endpoint
        slot[4..6].copy_from_slice(&42u16.to_le_bytes()); // seqnum
        slot[6..8].copy_from_slice(&41u16.to_le_bytes()); // piggyack
        slot[8..16].copy_from_slice(&0x1122_3344_5566_7788u64.to_le_bytes());
        slot[16..18].copy_from_slice(&5u16.to_le_bytes()); // length
        slot[20..25].copy_from_slice(b"hello");
        slot[EVENT_SLOT_SIZE - 1] = evt::RECV_TINY;

        let ev = Event::parse(&slot).unwrap();
        assert_matches!(ev, Event::Tiny { msg, length: 5, data } => {
            assert_eq!(msg.peer_index, 7);
            assert_eq!(msg.src_endpoint, 3);
            assert_eq!(msg.seqnum, Seq(42));
            assert_eq!(msg.match_info, 0x1122_3344_5566_7788);
            assert_eq!(&data[..5], b"hello");
        });
    }

    #[test]
    fn parse_pull_done_slot() {
        let mut slot = [0u8; EVENT_SLOT_SIZE];
        slot[0..8].copy_from_slice(&((9u64 << 32) | 4).to_le_bytes());
        slot[8] = 12;
        slot[9] = crate::abi::pull_status::BAD_SESSION;
        slot[EVENT_SLOT_SIZE - 1] = evt::PULL_DONE;

        assert_matches!(
            Event::parse(&slot),
            Some(Event::PullDone { lib_cookie, puller_rdma_id: 12, status }) => {
                assert_eq!(lib_cookie, (9 << 32) | 4);
                assert_eq!(status, crate::abi::pull_status::BAD_SESSION);
            }
        );
    }
}
